//! In-memory storage provider
//!
//! Keeps objects in a `DashMap` and uses process-wide generation numbers as
//! version tags, mirroring how generation-based object stores behave. The read
//! and the conditional write are separate steps so concurrent updates can lose
//! the race and observe [`ProviderError::Conflict`] exactly like they would
//! against a remote bucket.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::error::ProviderError;
use crate::location::{ObjectLocation, VersionTag};
use crate::provider::{StorageProvider, UpdateFn};

/// A stored object revision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub version: VersionTag,
}

/// In-memory provider implementation
/// Suitable for tests and for coordinating tasks inside a single process
pub struct MemoryProvider {
    objects: DashMap<ObjectLocation, StoredObject>,
    /// Last issued generation, shared by all objects so tags are never reused
    generation: AtomicU64,
    /// Successful writes, for observing whether an operation touched storage
    writes: AtomicU64,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
            generation: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Current revision of an object, if it exists
    pub fn get(&self, location: &ObjectLocation) -> Option<StoredObject> {
        self.objects.get(location).map(|entry| entry.value().clone())
    }

    /// Current version tag of an object, if it exists
    pub fn version(&self, location: &ObjectLocation) -> Option<VersionTag> {
        self.objects
            .get(location)
            .map(|entry| entry.version.clone())
    }

    /// Unconditionally write an object, e.g. to seed state before a test
    pub fn put(&self, location: &ObjectLocation, data: impl Into<Vec<u8>>) -> VersionTag {
        let version = self.next_version();
        self.objects.insert(
            location.clone(),
            StoredObject {
                data: data.into(),
                version: version.clone(),
            },
        );
        self.writes.fetch_add(1, Ordering::Relaxed);
        version
    }

    /// Number of successful writes (conditional or not) since creation
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn next_version(&self) -> VersionTag {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        VersionTag::from(generation.to_string())
    }
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageProvider for MemoryProvider {
    async fn atomic_update(
        &self,
        location: &ObjectLocation,
        transform: Box<UpdateFn<'_>>,
    ) -> Result<VersionTag, ProviderError> {
        let snapshot = self.get(location);

        // Let other tasks run between the read and the conditional write.
        tokio::task::yield_now().await;

        let expected = snapshot.as_ref().map(|object| object.version.clone());
        let data = match &snapshot {
            Some(object) => transform(Some(&object.version), &object.data)?,
            None => transform(None, &[])?,
        };

        let version = self.next_version();
        let stored = StoredObject {
            data,
            version: version.clone(),
        };

        match self.objects.entry(location.clone()) {
            Entry::Occupied(mut entry) => {
                if expected.as_ref() != Some(&entry.get().version) {
                    tracing::trace!(%location, "conditional write rejected: version changed");
                    return Err(ProviderError::Conflict);
                }
                entry.insert(stored);
            }
            Entry::Vacant(entry) => {
                if expected.is_some() {
                    tracing::trace!(%location, "conditional write rejected: object vanished");
                    return Err(ProviderError::Conflict);
                }
                entry.insert(stored);
            }
        }

        self.writes.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(%location, %version, "object updated");
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn location() -> ObjectLocation {
        ObjectLocation::new("test", "object.json")
    }

    #[tokio::test]
    async fn test_absent_object_reads_empty() {
        let provider = MemoryProvider::new();

        let version = provider
            .atomic_update(
                &location(),
                Box::new(|version: Option<&VersionTag>, data: &[u8]| {
                    assert!(version.is_none());
                    assert!(data.is_empty());
                    Ok(b"{}".to_vec())
                }),
            )
            .await
            .unwrap();

        let stored = provider.get(&location()).unwrap();
        assert_eq!(stored.data, b"{}");
        assert_eq!(stored.version, version);
        assert_eq!(provider.write_count(), 1);
    }

    #[tokio::test]
    async fn test_transform_sees_current_version() {
        let provider = MemoryProvider::new();
        let seeded = provider.put(&location(), "first");

        let next = provider
            .atomic_update(
                &location(),
                Box::new(|version: Option<&VersionTag>, data: &[u8]| {
                    assert_eq!(version, Some(&seeded));
                    assert_eq!(data, b"first");
                    Ok(b"second".to_vec())
                }),
            )
            .await
            .unwrap();

        assert_ne!(next, seeded);
        assert_eq!(provider.version(&location()), Some(next));
    }

    #[tokio::test]
    async fn test_aborted_transform_writes_nothing() {
        let provider = MemoryProvider::new();
        provider.put(&location(), "keep");

        let result = provider
            .atomic_update(
                &location(),
                Box::new(|_: Option<&VersionTag>, _: &[u8]| {
                    Err(ProviderError::adapter("refused"))
                }),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(provider.get(&location()).unwrap().data, b"keep");
        assert_eq!(provider.write_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_never_lose_updates() {
        let provider = Arc::new(MemoryProvider::new());
        provider.put(&location(), "0");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let provider = provider.clone();
            handles.push(tokio::spawn(async move {
                let mut applied = 0u32;
                while applied < 10 {
                    let result = provider
                        .atomic_update(
                            &location(),
                            Box::new(|_: Option<&VersionTag>, data: &[u8]| {
                                let n: u64 = std::str::from_utf8(data)
                                    .map_err(ProviderError::aborted)?
                                    .parse()
                                    .map_err(ProviderError::aborted)?;
                                Ok((n + 1).to_string().into_bytes())
                            }),
                        )
                        .await;
                    match result {
                        Ok(_) => applied += 1,
                        Err(ProviderError::Conflict) => continue,
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(provider.get(&location()).unwrap().data, b"80");
    }
}
