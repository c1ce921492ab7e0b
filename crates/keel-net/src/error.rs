//! Error types for the replication service.

use thiserror::Error;

use keel_engine::EngineError;

/// Errors surfaced by the replication layer.
#[derive(Error, Debug)]
pub enum NetError {
    /// A peer or dial failure. Never fatal to the engine; logged and
    /// retried implicitly by the next write.
    #[error("network error: {0}")]
    Network(String),

    /// A cached connection was closed out from under us. Surfaced rather
    /// than silently re-dialed.
    #[error("grpc: the client connection is closing")]
    ConnectionClosing,

    /// An inbound request or block that does not decode.
    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("peer not found: {0}")]
    PeerNotFound(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub type Result<T> = std::result::Result<T, NetError>;
