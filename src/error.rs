//! Error types for volley.

use thiserror::Error;

/// Main error type for all framework operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on a socket or listener.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error (textual codec, record files).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Protobuf decode error (binary codec).
    #[error("protobuf decode error: {0}")]
    ProtobufDecode(#[from] prost::DecodeError),

    /// CSV parse error (record files).
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// A frame's payload exceeds the codec's maximum length.
    #[error("message too long")]
    MsgTooLong,

    /// A frame's payload is below the codec's minimum length.
    #[error("message too short")]
    MsgTooShort,

    /// Channel-RPC call against an id nothing was registered under.
    #[error("function id {0}: function not registered")]
    NotRegistered(String),

    /// Channel-RPC call whose expected result arity disagrees with the
    /// registered function's shape.
    #[error("function id {0}: return type mismatch")]
    RetTypeMismatch(String),

    /// Non-blocking enqueue onto a full call channel.
    #[error("chanrpc channel full")]
    ChanRpcFull,

    /// Call drained during server close.
    #[error("chanrpc server closed")]
    ChanRpcClosed,

    /// A user function on the RPC server panicked; the stringified payload
    /// (and stack trace, when configured) is carried here.
    #[error("{0}")]
    CallPanic(String),

    /// Operation on a connection that is already closed.
    #[error("connection closed")]
    ConnClosed,

    /// Protocol violation: malformed wire data or an unregistered message.
    #[error("{0}")]
    Protocol(String),
}

/// Result type alias using the framework error.
pub type Result<T> = std::result::Result<T, Error>;
