use thiserror::Error;

/// Errors surfaced by the queue engine, the exchange registry and the
/// sender path.
#[derive(Debug, Error)]
pub enum Error {
    #[error("queue {0} is locked by an exclusive consumer or owner")]
    ResourceLocked(String),

    #[error("queue {0} has been deleted")]
    ResourceDeleted(String),

    #[error("resource limit exceeded on queue {queue}: {reason}")]
    ResourceLimitExceeded { queue: String, reason: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("unknown exchange type: {0}")]
    UnknownExchangeType(String),

    #[error("sender error: {0}")]
    Sender(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("malformed message section: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, Error>;
