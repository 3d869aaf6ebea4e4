//! Objsync Mutex - distributed locking on object storage
//!
//! This crate provides:
//! - Lock record data model and JSON encoding
//! - Non-blocking and blocking acquisition with leases
//! - Fencing tokens issued per acquisition
//! - Release and lease renewal guarded by the object's version tag
//! - Backoff and initialization configuration
//!
//! The only coordination point is the lock object itself, mutated through
//! [`StorageProvider::atomic_update`](objsync_provider::StorageProvider::atomic_update).
//! Mutual exclusion holds exactly as far as the provider's conditional write is
//! atomic.

pub mod backoff;
pub mod config;
pub mod error;
pub mod metrics;
pub mod mutex;
pub mod record;

pub use backoff::BackoffConfig;
pub use self::config::{InitPolicy, MutexConfig};
pub use error::LockError;
pub use self::metrics::describe_metrics;
pub use mutex::Mutex;
pub use record::{FencingToken, LockRecord, RecordError};

// Re-export the provider contract and the cancellation token used by `Mutex::lock`
pub use objsync_provider::{
    MemoryProvider, ObjectLocation, ProviderError, StorageProvider, UpdateFn, VersionTag,
};
pub use tokio_util::sync::CancellationToken;
