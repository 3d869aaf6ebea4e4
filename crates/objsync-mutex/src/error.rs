use std::time::Duration;

use objsync_provider::{ObjectLocation, ProviderError};

use crate::record::RecordError;

/// Errors surfaced by [`Mutex`](crate::Mutex) operations.
///
/// Contention (the lock is held elsewhere, or a concurrent writer won the
/// race) is never an error: `try_lock` reports it as `Ok(None)`, `lock`
/// retries on it and `unlock` absorbs it.
#[derive(thiserror::Error, Debug)]
pub enum LockError {
    #[error("storage provider failed: {0}")]
    Provider(#[source] ProviderError),

    #[error("lock record is unreadable: {0}")]
    Encoding(#[from] RecordError),

    #[error("lock acquisition cancelled")]
    Cancelled,

    #[error("lock acquisition timed out after {waited:?}")]
    DeadlineExceeded { waited: Duration },

    #[error("invalid lease duration {0:?}")]
    InvalidLease(Duration),

    #[error("lock object '{0}' does not exist")]
    NotInitialized(ObjectLocation),

    #[error("invalid mutex configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to load mutex configuration: {0}")]
    Config(#[from] config::ConfigError),
}

impl LockError {
    /// True for the caller-initiated aborts of a blocking wait
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded { .. })
    }
}
