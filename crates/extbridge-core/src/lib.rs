//! Extbridge Core - out-of-process hosting for time-series data extensions.
//!
//! An agent process hosts extensions behind a [`PairingListener`]. A caller
//! opens a session with [`RemoteClient`]: two TCP connections, a control
//! channel carrying JSON-RPC 2.0 and a data channel carrying raw sample
//! buffers, paired by a shared session id.
//!
//! # Example
//!
//! ```rust,ignore
//! use extbridge_core::{ClientOptions, RemoteClient};
//!
//! #[tokio::main]
//! async fn main() -> extbridge_core::Result<()> {
//!     let addr = "127.0.0.1:56145".parse().unwrap();
//!     let client = RemoteClient::connect(addr, ClientOptions::default()).await?;
//!
//!     client.initialize("synthetic").await?;
//!     let registrations = client.get_catalog_registrations("/").await?;
//!     println!("Found {} catalogs", registrations.len());
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod error;
pub mod extension;
pub mod ipc;
pub mod model;
pub mod platform;
pub mod process;
pub mod session;

// Re-export commonly used types
pub use cancel::{CancellationToken, CancelledError};
pub use config::{ClientOptions, ListenerOptions, PortRange, TransportConfig};
pub use error::{BridgeError, Result};
pub use extension::{
    BoundDataSource, DataSource, ExtensionFactory, ExtensionLogger, ExtensionRegistry,
    ExtensionResolver, LogSink, ReadData, ReadRequest, TypedFactory,
};
pub use ipc::{BulkPayload, RemoteClient};
pub use model::{
    CatalogItem, CatalogRegistration, CatalogTimeRange, DataSourceContext, DataType, LogLevel,
    Representation, ResourceCatalog, ResourcePath,
};
pub use process::{LaunchSpec, PortAllocator, ProcessLauncher};
pub use session::{PairingListener, PairingListenerHandle};
