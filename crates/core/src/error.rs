//! Error types for the Warden core

use thiserror::Error;

/// Result type alias for Warden core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur in the Warden core
#[derive(Debug, Error)]
pub enum Error {
    /// The transport endpoint is already bound
    #[error("endpoint is already bound")]
    AlreadyBound,

    /// The transport endpoint is not bound (or has been closed)
    #[error("endpoint is not bound")]
    NotBound,

    /// No pending request exists for the given correlation id
    #[error("no pending request for correlation '{0}'")]
    NoPendingRequest(String),

    /// The correlation is pending under a different connection identity
    #[error("correlation '{0}' is pending under a different connection identity")]
    IdentityMismatch(String),

    /// The connection identity is already bound to a session
    #[error("connection identity is already bound to session {0}")]
    DuplicateIdentity(String),

    /// The container id is already bound to a session
    #[error("container '{0}' is already bound to a session")]
    DuplicateContainer(String),

    /// Session lookup failure
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// A frame that could not be decoded into a wire message
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A frame exceeding the payload size limit
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge {
        /// Observed payload size in bytes
        size: usize,
        /// Configured limit in bytes
        limit: usize,
    },

    /// JSON nesting beyond the wire depth limit
    #[error("JSON nesting depth {depth} exceeds the limit of {limit}")]
    DepthExceeded {
        /// Observed nesting depth
        depth: usize,
        /// Configured depth limit
        limit: usize,
    },

    /// A tool schema that failed to compile
    #[error("invalid schema for tool '{tool}': {reason}")]
    Schema {
        /// Tool the schema belongs to
        tool: String,
        /// Compilation failure detail
        reason: String,
    },

    /// Configuration error
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Container engine error
    #[error("container runtime error: {0}")]
    Runtime(String),

    /// Transport endpoint error
    #[error("transport error: {0}")]
    Transport(String),

    /// Resume-session store error
    #[error("session store error: {0}")]
    Store(String),

    /// Event dispatcher error
    #[error("dispatch error: {0}")]
    Dispatch(String),

    /// Work refused because the supervisor is stopping
    #[error("supervisor is shutting down")]
    ShuttingDown,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
