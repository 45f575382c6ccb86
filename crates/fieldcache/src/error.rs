use std::time::Duration;
use thiserror::Error;

/// Failures of the cache store backends.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("invalid store name: {0:?}")]
    InvalidName(String),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode entry metadata: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("corrupt cache entry: {0}")]
    Corrupt(String),

    #[error("storage task failed: {0}")]
    Task(String),
}

/// Failures of the network collaborator.
///
/// A non-success HTTP status is not an error: it arrives as a regular
/// [`Response`](crate::Response) and is simply never cached.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("upstream unreachable: {0}")]
    Unreachable(String),

    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("failed to read upstream body: {0}")]
    Body(String),
}

/// Lifecycle hooks called out of order or more than once.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("cannot {operation} a proxy in phase {phase:?}")]
    OutOfOrder {
        operation: &'static str,
        phase: crate::proxy::Phase,
    },
    #[error("cache version {0:?} is not a valid store name for this storage")]
    InvalidVersion(String),
}
