//! Wire protocol and the caller half of the transport.
//!
//! # Architecture
//!
//! - **Protocol**: length-prefixed frames and JSON-RPC 2.0 envelopes
//! - **Data**: raw sample buffers exchanged on the data channel
//! - **Client**: opens a session to an agent and drives forward calls

pub mod client;
pub mod data;
pub mod protocol;

pub use client::RemoteClient;
pub use data::BulkPayload;
pub use protocol::{read_frame, write_frame, RpcMessage, RpcRequest, RpcResponse};
