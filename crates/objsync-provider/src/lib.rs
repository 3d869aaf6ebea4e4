//! Objsync Provider - the storage contract the lock protocol is built on
//!
//! This crate provides:
//! - `StorageProvider`: a single atomic, conditional read-transform-write primitive
//! - `ObjectLocation` and `VersionTag`: where an object lives and which revision was seen
//! - `ProviderError`: conflict / aborted / adapter error taxonomy
//! - `MemoryProvider`: an in-process implementation with generation-number version tags
//!
//! Network backends (S3, GCS, ...) implement `StorageProvider` in their own crates.

mod error;
mod location;
mod memory;
mod provider;

pub use error::ProviderError;
pub use location::{ObjectLocation, VersionTag};
pub use memory::{MemoryProvider, StoredObject};
pub use provider::{StorageProvider, UpdateFn};
