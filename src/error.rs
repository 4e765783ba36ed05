//! Error types for wirecall.

use std::time::Duration;

use thiserror::Error;

/// Main error type for all wirecall operations.
#[derive(Debug, Error)]
pub enum WirecallError {
    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while encoding or decoding the option handshake.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Clean end of stream (also covers a stream truncated mid-frame).
    #[error("EOF")]
    Eof,

    /// Protocol error (bad magic, unknown codec, malformed handshake,
    /// unexpected HTTP response, oversized frame).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server answered this call with an error header.
    #[error("{0}")]
    Remote(String),

    /// Dial or handshake exceeded the configured connect timeout.
    #[error("rpc client: connect timeout: expect within {0:?}")]
    ConnectTimeout(Duration),

    /// The caller's cancellation fired before the call completed.
    #[error("rpc client: call failed: {0}")]
    CallFailed(String),

    /// The client has been closed by the user.
    #[error("connection is closed")]
    Closed,

    /// The connection died while calls were outstanding; carries the
    /// reader's terminal error.
    #[error("connection shut down: {0}")]
    Shutdown(String),

    /// A service with the same name is already registered.
    #[error("rpc: service already defined: {0}")]
    ServiceAlreadyDefined(String),

    /// Service names must be capitalized and dot-free.
    #[error("rpc server: invalid service name: {0}")]
    InvalidServiceName(String),
}

/// Result type alias using WirecallError.
pub type Result<T> = std::result::Result<T, WirecallError>;
