//! Control-channel protocol types and framing.
//!
//! Every message on either channel is a frame: a 4-byte big-endian length
//! prefix followed by that many payload bytes. On the control channel the
//! payload is a UTF-8 JSON-RPC 2.0 envelope.
//!
//! ```text
//! [u32 BE: len][payload bytes of len]
//! ```

use crate::error::{BridgeError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 request. Without an `id` it is a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl RpcRequest {
    /// Create a request with positional parameters.
    pub fn new(method: impl Into<String>, params: Vec<Value>, id: u64) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params: Some(Value::Array(params)),
            id: Some(Value::Number(id.into())),
        }
    }

    /// Create a notification, a request that expects no response.
    pub fn notification(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params: Some(Value::Array(params)),
            id: None,
        }
    }

    /// Decode the positional parameter at `index`.
    pub fn param<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<T> {
        let value = match &self.params {
            Some(Value::Array(values)) => values.get(index).cloned(),
            _ => None,
        }
        .ok_or_else(|| BridgeError::InvalidParams {
            message: format!("{}: missing parameter '{name}' at position {index}", self.method),
        })?;

        serde_json::from_value(value).map_err(|e| BridgeError::InvalidParams {
            message: format!("{}: invalid parameter '{name}': {e}", self.method),
        })
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
    pub id: Option<Value>,
}

impl RpcResponse {
    /// Create a success response.
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Create an error response.
    pub fn error(id: Option<Value>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(RpcErrorObject {
                code,
                message,
                data: None,
            }),
            id,
        }
    }

    /// Create an error response from a bridge error.
    pub fn from_error(id: Option<Value>, err: &BridgeError) -> Self {
        Self::error(id, err.to_rpc_error_code(), err.to_string())
    }

    /// Turn the response into the call's outcome.
    pub fn into_result(self, method: &str) -> Result<Value> {
        match self.error {
            Some(error) => Err(BridgeError::Remote {
                method: method.to_string(),
                code: error.code,
                message: error.message,
            }),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Any envelope that may arrive on a control channel.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    Request(RpcRequest),
    Response(RpcResponse),
}

impl RpcMessage {
    /// Parse a control frame.
    ///
    /// A message with a `method` member is a request; one with `result` or
    /// `error` is a response. A null `result` still counts as a response.
    pub fn parse(frame: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(frame)?;

        let Value::Object(fields) = &value else {
            return Err(BridgeError::protocol("envelope is not a JSON object"));
        };
        if fields.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Err(BridgeError::protocol("expected jsonrpc 2.0"));
        }

        if fields.contains_key("method") {
            Ok(RpcMessage::Request(serde_json::from_value(value)?))
        } else if fields.contains_key("result") || fields.contains_key("error") {
            let has_result = fields.contains_key("result");
            let mut response: RpcResponse = serde_json::from_value(value)?;
            if has_result && response.result.is_none() && response.error.is_none() {
                response.result = Some(Value::Null);
            }
            Ok(RpcMessage::Response(response))
        } else {
            Err(BridgeError::protocol("envelope is neither request nor response"))
        }
    }
}

/// Read a length-prefixed frame from an async reader.
///
/// Frame format: `[4-byte BE u32 length][payload bytes]`
///
/// Any end of stream, including before the length prefix, is reported as
/// `TransportClosed`.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| closed_or_io(e, "frame length"))?;

    let len = u32::from_be_bytes(len_buf) as usize;

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| closed_or_io(e, "frame payload"))?;

    Ok(payload)
}

/// Write a length-prefixed frame to an async writer and flush it.
///
/// Frame format: `[4-byte BE u32 length][payload bytes]`
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        BridgeError::protocol(format!("frame of {} bytes exceeds u32 length", payload.len()))
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Serialize `message` as JSON and write it as one frame.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(message)?;
    write_frame(writer, &bytes).await
}

fn closed_or_io(err: std::io::Error, part: &str) -> BridgeError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        BridgeError::transport_closed(format!("peer closed while reading {part}"))
    } else {
        err.into()
    }
}
