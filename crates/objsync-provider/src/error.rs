//! Error taxonomy surfaced by storage providers

use std::error::Error;

/// Errors returned by [`StorageProvider::atomic_update`](crate::StorageProvider::atomic_update)
#[derive(thiserror::Error, Debug)]
pub enum ProviderError {
    /// The object changed between the read and the conditional write.
    /// Expected whenever several writers race on the same object.
    #[error("write conflict: object was modified concurrently")]
    Conflict,

    /// The transform refused to produce new content. Nothing was written.
    #[error("update aborted: {0}")]
    Aborted(#[source] Box<dyn Error + Send + Sync>),

    /// Transport, authentication or protocol failure in the backend
    #[error("storage adapter error: {0}")]
    Adapter(#[source] Box<dyn Error + Send + Sync>),
}

impl ProviderError {
    /// Wrap a transform-side error so it travels back to the caller unchanged
    pub fn aborted<E>(err: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::Aborted(Box::new(err))
    }

    /// Wrap a backend failure
    pub fn adapter<E>(err: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        Self::Adapter(err.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict)
    }
}
