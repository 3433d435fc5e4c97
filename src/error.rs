//! Error types for MCP Probe

use thiserror::Error;

use crate::protocol::JsonRpcError;

/// Result type alias for MCP Probe
pub type Result<T> = std::result::Result<T, Error>;

/// MCP Probe errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport unreachable, reset or closed underneath us
    #[error("Connection error: {0}")]
    Connection(String),

    /// Expected field missing, id mismatch, malformed frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Server no longer knows the session (HTTP 404)
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// JSON-RPC `error` object returned by the server
    #[error("JSON-RPC error {code}: {message}")]
    Application {
        /// Error code
        code: i32,
        /// Error message
        message: String,
        /// Optional data
        data: Option<serde_json::Value>,
    },

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL error
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

/// Coarse classification used to decide whether a run may continue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transport failure
    Connection,
    /// Protocol violation or lost session
    Protocol,
    /// Method/tool failure reported by the server
    Application,
    /// Bad input from the caller (config, URLs)
    Usage,
}

impl Error {
    /// Create an application error
    pub fn application(code: i32, message: impl Into<String>) -> Self {
        Self::Application {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Classify the error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection(_) => ErrorKind::Connection,
            Self::Protocol(_) | Self::SessionNotFound(_) | Self::Json(_) => ErrorKind::Protocol,
            Self::Application { .. } => ErrorKind::Application,
            Self::Config(_) | Self::Url(_) => ErrorKind::Usage,
        }
    }

    /// Whether the error must abort the current run
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.kind() != ErrorKind::Application
    }
}

impl From<JsonRpcError> for Error {
    fn from(err: JsonRpcError) -> Self {
        Self::Application {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

/// Standard JSON-RPC error codes
pub mod rpc_codes {
    /// Method not found
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params
    pub const INVALID_PARAMS: i32 = -32602;
}
