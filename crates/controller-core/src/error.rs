//! Error type shared across the controller.

/// Errors surfaced to API clients.
///
/// The wire layer maps each variant onto the corresponding RPC status code;
/// everything internal (repos, the change log, the bus) speaks this type so
/// the mapping happens exactly once at the edge.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Malformed page token, unparseable name, or bad filter.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown app, release, or deployment.
    #[error("{0} not found")]
    NotFound(String),

    /// A deployment terminated with a failure status.
    #[error("{0}")]
    FailedPrecondition(String),

    /// A scale request was cancelled while a caller was waiting on it.
    #[error("{0}")]
    Aborted(String),

    /// A synchronous wait exceeded its configured timeout.
    #[error("timed out waiting for {0}")]
    DeadlineExceeded(String),

    /// The event bus cannot be started or has died.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// A subscriber was dropped because its channel stayed full.
    #[error("subscriber dropped: event channel full")]
    SlowConsumer,

    /// Unmarshal failure on an event payload, or an unexpected repo error.
    #[error("internal: {0}")]
    Internal(String),
}

/// Result alias used throughout the controller crates.
pub type Result<T> = std::result::Result<T, Error>;
