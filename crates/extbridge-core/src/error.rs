//! Error types for the extension bridge.
//!
//! Every failure category of the transport has its own variant so callers can
//! tell a recoverable extension failure from one that ends the whole session.

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Main error type for the extension bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    // Connection setup
    #[error("Handshake failed: {message}")]
    Handshake { message: String },

    #[error("Session {session_id} was not paired within {timeout:?}")]
    PairingTimeout { session_id: Uuid, timeout: Duration },

    // Protocol violations
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Method not found: {method}")]
    MethodNotFound { method: String },

    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    #[error("Unknown extension type: {type_name}")]
    UnknownExtension { type_name: String },

    // Raised inside an extension while serving a call
    #[error("Extension error: {message}")]
    Extension { message: String },

    /// Error response received from the remote side of a call.
    #[error("Remote call '{method}' failed ({code}): {message}")]
    Remote {
        method: String,
        code: i32,
        message: String,
    },

    // Transport errors
    #[error("Transport closed: {message}")]
    TransportClosed { message: String },

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    // Process management
    #[error("Process launch failed for '{command}': {message}")]
    Launch { command: String, message: String },

    #[error("No free TCP port in range {min}..{max}")]
    PortRangeExhausted { min: u16, max: u16 },

    // File system / socket errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Operation was cancelled")]
    Cancelled,

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected => BridgeError::TransportClosed {
                message: err.to_string(),
            },
            _ => BridgeError::Io {
                message: err.to_string(),
                source: Some(err),
            },
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl BridgeError {
    /// Shorthand for a protocol violation.
    pub fn protocol(message: impl Into<String>) -> Self {
        BridgeError::Protocol {
            message: message.into(),
        }
    }

    /// Shorthand for a failure raised by extension code.
    pub fn extension(message: impl Into<String>) -> Self {
        BridgeError::Extension {
            message: message.into(),
        }
    }

    /// Shorthand for a closed or broken stream.
    pub fn transport_closed(message: impl Into<String>) -> Self {
        BridgeError::TransportClosed {
            message: message.into(),
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Standard JSON-RPC error codes:
    /// - -32700: Parse error
    /// - -32600: Invalid Request
    /// - -32601: Method not found
    /// - -32602: Invalid params
    /// - -32603: Internal error
    ///
    /// Custom error codes (application-defined, -32000 to -32099):
    /// - -32000: Extension error
    /// - -32001: Unknown extension type
    /// - -32002: Remote call failed
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            BridgeError::Json { .. } => -32700,
            BridgeError::Protocol { .. } | BridgeError::Handshake { .. } => -32600,
            BridgeError::MethodNotFound { .. } => -32601,
            BridgeError::InvalidParams { .. } => -32602,
            BridgeError::Extension { .. } => -32000,
            BridgeError::UnknownExtension { .. } => -32001,
            BridgeError::Remote { .. } => -32002,

            // All other errors are internal errors
            _ => -32603,
        }
    }

    /// Whether this error must tear down the session it happened in.
    ///
    /// Only errors local to a single call (a failing extension, bad params,
    /// an error reported by the peer) leave the session usable.
    pub fn is_session_fatal(&self) -> bool {
        !matches!(
            self,
            BridgeError::Extension { .. }
                | BridgeError::InvalidParams { .. }
                | BridgeError::Remote { .. }
        )
    }

    /// Whether a connect/bind attempt that failed with this error may be
    /// retried with a freshly allocated port.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::Io { .. } | BridgeError::Timeout(_) | BridgeError::TransportClosed { .. }
        )
    }
}
