//! Transport-level errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("message framing error: {0}")]
    Codec(String),

    #[error("peer closed the connection")]
    ConnectionClosed,

    #[error("call to remote method {method} timed out")]
    Timeout { method: String },

    #[error("remote method {method} returned an error: {reason}")]
    RemoteError { method: String, reason: String },

    #[error("key error: {0}")]
    Key(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RpcError>;
