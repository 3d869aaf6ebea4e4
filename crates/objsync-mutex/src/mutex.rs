//! Distributed mutex over a single conditionally-written object
//!
//! Every mutation is one `StorageProvider::atomic_update` call: the "is it
//! held?" check and the write happen inside the same transform, so the
//! provider's version-tag precondition is the only point of serialization.
//! Expiry is evaluated when acquiring; nothing sweeps stale records.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use objsync_provider::{ObjectLocation, ProviderError, StorageProvider, VersionTag};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{InitPolicy, MutexConfig};
use crate::error::LockError;
use crate::metrics::{
    LOCK_ACQUIRED_TOTAL, LOCK_CONTENDED_TOTAL, LOCK_RELEASED_TOTAL, LOCK_RENEWED_TOTAL,
    LOCK_STALE_RELEASE_TOTAL, LOCK_WAIT_SECONDS,
};
use crate::record::{self, FencingToken, LockRecord, RecordError};

/// Reasons a transform declines to write
#[derive(thiserror::Error, Debug)]
enum Abort {
    #[error("lock is held")]
    Held,
    #[error("lock was reassigned since it was acquired")]
    Stale,
    #[error("lock object does not exist")]
    Missing,
    #[error("lock object already exists")]
    Present,
}

/// Non-fatal outcomes of a provider call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Contention {
    /// Another holder's lease is still running
    Held,
    /// Our hold was taken over (version tag moved on)
    Stale,
    /// A concurrent writer won the conditional write
    Conflict,
    /// Initialization found an existing object
    Present,
}

/// Distributed mutex bound to one lock object.
///
/// A handle represents one holder identity; operations take `&mut self`, so a
/// handle cannot be shared between concurrent callers. Create one handle per
/// task or process that competes for the lock.
pub struct Mutex {
    provider: Arc<dyn StorageProvider>,
    location: ObjectLocation,
    config: MutexConfig,
    identity: String,
    /// Version tag written by our last successful acquisition or renewal
    version: Option<VersionTag>,
    /// Token of the current hold
    fence: Option<FencingToken>,
}

impl Mutex {
    /// Create a mutex with the default configuration and a random identity
    pub fn new(provider: Arc<dyn StorageProvider>, location: ObjectLocation) -> Self {
        Self {
            provider,
            location,
            config: MutexConfig::default(),
            identity: uuid::Uuid::new_v4().to_string(),
            version: None,
            fence: None,
        }
    }

    /// Create a mutex with a custom configuration
    pub fn with_config(
        provider: Arc<dyn StorageProvider>,
        location: ObjectLocation,
        config: MutexConfig,
    ) -> Result<Self, LockError> {
        config.validate()?;
        Ok(Self {
            config,
            ..Self::new(provider, location)
        })
    }

    /// Replace the random holder identity
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn location(&self) -> &ObjectLocation {
        &self.location
    }

    pub fn config(&self) -> &MutexConfig {
        &self.config
    }

    /// Token of the current hold, as last seen by this handle
    pub fn fencing_token(&self) -> Option<FencingToken> {
        self.fence
    }

    /// Whether this handle believes it holds the lock.
    ///
    /// This is local state only: the lease may have expired and the lock may
    /// have been reassigned since.
    pub fn is_locked(&self) -> bool {
        self.version.is_some()
    }

    /// Seed the lock object with an empty record if it does not exist yet.
    ///
    /// Returns `true` when this call created the object, `false` when it
    /// already existed (including when a concurrent caller created it first).
    #[tracing::instrument(skip(self), fields(location = %self.location))]
    pub async fn initialize(&self) -> Result<bool, LockError> {
        let result = self
            .provider
            .atomic_update(
                &self.location,
                Box::new(|version: Option<&VersionTag>, _: &[u8]| {
                    if version.is_some() {
                        return Err(ProviderError::aborted(Abort::Present));
                    }
                    LockRecord::default()
                        .encode()
                        .map_err(ProviderError::aborted)
                }),
            )
            .await;

        match result {
            Ok(_) => {
                info!("lock object created");
                Ok(true)
            }
            Err(err) => {
                let contention = classify(err, &self.location)?;
                debug!(?contention, "lock object already initialized");
                Ok(false)
            }
        }
    }

    /// Attempt to acquire the lock without blocking.
    ///
    /// Returns `Ok(Some(token))` when acquired and `Ok(None)` when the lock is
    /// held elsewhere or a concurrent writer won the race; try again later.
    #[tracing::instrument(skip(self), fields(location = %self.location))]
    pub async fn try_lock(&mut self, lease: Duration) -> Result<Option<FencingToken>, LockError> {
        let lease_delta = lease_delta(lease)?;
        let require_existing = self.config.init_policy == InitPolicy::RequireExisting;
        let identity = self.identity.clone();

        let mut issued: Option<FencingToken> = None;
        let issued_slot = &mut issued;
        let result = self
            .provider
            .atomic_update(
                &self.location,
                Box::new(move |version: Option<&VersionTag>, current: &[u8]| {
                    if require_existing && version.is_none() {
                        return Err(ProviderError::aborted(Abort::Missing));
                    }

                    let mut record = LockRecord::decode(current).map_err(ProviderError::aborted)?;
                    let now = Utc::now();
                    if record.is_held_at(now) {
                        return Err(ProviderError::aborted(Abort::Held));
                    }

                    let token = record
                        .acquire(identity, now, lease_delta)
                        .map_err(ProviderError::aborted)?;
                    *issued_slot = Some(token);
                    record.encode().map_err(ProviderError::aborted)
                }),
            )
            .await;

        match result {
            Ok(version) => {
                let Some(token) = issued else {
                    return Err(LockError::Provider(ProviderError::adapter(
                        "provider reported a write without running the transform",
                    )));
                };
                self.version = Some(version);
                self.fence = Some(token);
                metrics::counter!(LOCK_ACQUIRED_TOTAL).increment(1);
                info!(fence = %token, holder = %self.identity, "lock acquired");
                Ok(Some(token))
            }
            Err(err) => {
                let contention = classify(err, &self.location)?;
                metrics::counter!(LOCK_CONTENDED_TOTAL).increment(1);
                debug!(?contention, "lock not acquired");
                Ok(None)
            }
        }
    }

    /// Acquire the lock, retrying with backoff until it is acquired or `cancel` fires.
    ///
    /// Blocking under contention is expected: the loop keeps retrying for as
    /// long as the lock is held elsewhere. Provider and encoding errors end the
    /// loop immediately and are not retried.
    pub async fn lock(
        &mut self,
        lease: Duration,
        cancel: &CancellationToken,
    ) -> Result<FencingToken, LockError> {
        self.acquire_loop(lease, cancel, None).await
    }

    /// Acquire the lock, giving up with [`LockError::DeadlineExceeded`] after `timeout`
    pub async fn lock_with_timeout(
        &mut self,
        lease: Duration,
        timeout: Duration,
    ) -> Result<FencingToken, LockError> {
        let cancel = CancellationToken::new();
        // A timeout past the end of the clock never fires
        let deadline = Instant::now().checked_add(timeout);
        self.acquire_loop(lease, &cancel, deadline).await
    }

    #[tracing::instrument(skip(self, cancel), fields(location = %self.location))]
    async fn acquire_loop(
        &mut self,
        lease: Duration,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<FencingToken, LockError> {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            // Never start a round-trip once the caller has given up.
            if cancel.is_cancelled() {
                return Err(LockError::Cancelled);
            }
            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                return Err(LockError::DeadlineExceeded {
                    waited: started.elapsed(),
                });
            }

            if let Some(token) = self.try_lock(lease).await? {
                metrics::histogram!(LOCK_WAIT_SECONDS).record(started.elapsed().as_secs_f64());
                return Ok(token);
            }

            attempt = attempt.saturating_add(1);
            let delay = self.config.backoff.delay(attempt);
            debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "lock is busy, backing off"
            );

            let expired = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LockError::Cancelled),
                _ = expired => {
                    return Err(LockError::DeadlineExceeded {
                        waited: started.elapsed(),
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Release the lock if this handle still holds it.
    ///
    /// A no-op when nothing is held. When the lock has already been
    /// reassigned (our lease expired and someone else acquired it) the
    /// release is skipped and reported as success; the new holder's state is
    /// left untouched. On a provider error the handle keeps its state so the
    /// call can be retried.
    #[tracing::instrument(skip(self), fields(location = %self.location))]
    pub async fn unlock(&mut self) -> Result<(), LockError> {
        let Some(expected) = self.version.clone() else {
            debug!("unlock called without a held lock");
            return Ok(());
        };

        let result = self
            .provider
            .atomic_update(
                &self.location,
                Box::new(move |version: Option<&VersionTag>, current: &[u8]| {
                    if version != Some(&expected) {
                        return Err(ProviderError::aborted(Abort::Stale));
                    }

                    let mut record = LockRecord::decode(current).map_err(ProviderError::aborted)?;
                    record.release();
                    record.encode().map_err(ProviderError::aborted)
                }),
            )
            .await;

        let fence = self.fence;
        match result {
            Ok(_) => {
                metrics::counter!(LOCK_RELEASED_TOTAL).increment(1);
                info!(fence = ?fence, "lock released");
            }
            Err(err) => {
                let contention = classify(err, &self.location)?;
                metrics::counter!(LOCK_STALE_RELEASE_TOTAL).increment(1);
                warn!(
                    fence = ?fence,
                    ?contention,
                    "lock was reassigned before release"
                );
            }
        }

        self.version = None;
        self.fence = None;
        Ok(())
    }

    /// Extend the lease of the current hold to `now + lease`.
    ///
    /// Returns `false` when there is nothing to renew or the hold has been
    /// lost; the local state is cleared in the latter case. The fencing token
    /// does not change.
    #[tracing::instrument(skip(self), fields(location = %self.location))]
    pub async fn renew(&mut self, lease: Duration) -> Result<bool, LockError> {
        let lease_delta = lease_delta(lease)?;
        let Some(expected) = self.version.clone() else {
            return Ok(false);
        };
        let identity = self.identity.clone();

        let result = self
            .provider
            .atomic_update(
                &self.location,
                Box::new(move |version: Option<&VersionTag>, current: &[u8]| {
                    if version != Some(&expected) {
                        return Err(ProviderError::aborted(Abort::Stale));
                    }

                    let mut record = LockRecord::decode(current).map_err(ProviderError::aborted)?;
                    let now = Utc::now();
                    // An expired lease cannot be revived, even if nobody took over yet.
                    if !record.is_held_by(&identity, now) {
                        return Err(ProviderError::aborted(Abort::Stale));
                    }
                    record
                        .extend(now, lease_delta)
                        .map_err(ProviderError::aborted)?;
                    record.encode().map_err(ProviderError::aborted)
                }),
            )
            .await;

        match result {
            Ok(version) => {
                self.version = Some(version);
                metrics::counter!(LOCK_RENEWED_TOTAL).increment(1);
                debug!(fence = ?self.fence, "lease renewed");
                Ok(true)
            }
            Err(err) => {
                let contention = classify(err, &self.location)?;
                warn!(fence = ?self.fence, ?contention, "lease lost before renewal");
                self.version = None;
                self.fence = None;
                Ok(false)
            }
        }
    }
}

impl std::fmt::Debug for Mutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutex")
            .field("location", &self.location)
            .field("identity", &self.identity)
            .field("version", &self.version)
            .field("fence", &self.fence)
            .finish_non_exhaustive()
    }
}

fn lease_delta(lease: Duration) -> Result<TimeDelta, LockError> {
    if lease.is_zero() {
        return Err(LockError::InvalidLease(lease));
    }
    let delta = TimeDelta::from_std(lease).map_err(|_| LockError::InvalidLease(lease))?;
    // The expiry must stay representable as a timestamp
    record::expiry(Utc::now(), delta).map_err(|_| LockError::InvalidLease(lease))?;
    Ok(delta)
}

/// Split a provider failure into absorbed contention and fatal errors
fn classify(err: ProviderError, location: &ObjectLocation) -> Result<Contention, LockError> {
    let source = match err {
        ProviderError::Conflict => return Ok(Contention::Conflict),
        ProviderError::Aborted(source) => source,
        other => return Err(LockError::Provider(other)),
    };

    let source = match source.downcast::<Abort>() {
        Ok(abort) => {
            return match *abort {
                Abort::Held => Ok(Contention::Held),
                Abort::Stale => Ok(Contention::Stale),
                Abort::Present => Ok(Contention::Present),
                Abort::Missing => Err(LockError::NotInitialized(location.clone())),
            };
        }
        Err(source) => source,
    };

    match source.downcast::<RecordError>() {
        Ok(record_error) => Err(LockError::Encoding(*record_error)),
        Err(source) => Err(LockError::Provider(ProviderError::Aborted(source))),
    }
}

#[cfg(test)]
mod tests {
    use objsync_provider::MemoryProvider;

    use super::*;
    use crate::backoff::BackoffConfig;

    fn location() -> ObjectLocation {
        ObjectLocation::new("test", "unit.lock")
    }

    fn stored_record(provider: &MemoryProvider) -> LockRecord {
        let stored = provider.get(&location()).unwrap();
        LockRecord::decode(&stored.data).unwrap()
    }

    #[tokio::test]
    async fn test_basic_lock_acquire_release() {
        let provider = Arc::new(MemoryProvider::new());
        let mut mu = Mutex::new(provider.clone(), location());
        let mut other = Mutex::new(provider.clone(), location());

        let token = mu.try_lock(Duration::from_secs(30)).await.unwrap();
        assert_eq!(token, Some(FencingToken::new(1)));
        assert!(mu.is_locked());
        assert_eq!(mu.fencing_token(), token);

        let record = stored_record(&provider);
        assert_eq!(record.holder.as_deref(), Some(mu.identity()));
        assert_eq!(record.fence, 1);

        // Try to acquire with a different handle
        assert_eq!(other.try_lock(Duration::from_secs(30)).await.unwrap(), None);

        mu.unlock().await.unwrap();
        assert!(!mu.is_locked());
        assert_eq!(mu.fencing_token(), None);

        let record = stored_record(&provider);
        assert!(record.holder.is_none());
        assert!(record.expires_at.is_none());
        assert_eq!(record.fence, 1);

        // Now the other handle can acquire
        let token = other.try_lock(Duration::from_secs(30)).await.unwrap();
        assert_eq!(token, Some(FencingToken::new(2)));
    }

    #[tokio::test]
    async fn test_unlock_without_lock_is_noop() {
        let provider = Arc::new(MemoryProvider::new());
        let mut mu = Mutex::new(provider.clone(), location());

        mu.unlock().await.unwrap();
        assert_eq!(provider.write_count(), 0);
        assert!(provider.get(&location()).is_none());
    }

    #[tokio::test]
    async fn test_zero_lease_is_rejected() {
        let provider = Arc::new(MemoryProvider::new());
        let mut mu = Mutex::new(provider.clone(), location());

        assert!(matches!(
            mu.try_lock(Duration::ZERO).await,
            Err(LockError::InvalidLease(_))
        ));
        assert_eq!(provider.write_count(), 0);
    }

    #[tokio::test]
    async fn test_unrepresentable_lease_is_rejected() {
        let provider = Arc::new(MemoryProvider::new());
        let mut mu = Mutex::new(provider.clone(), location());

        // Fits in a TimeDelta but lands beyond the last representable date
        let lease = Duration::from_secs(10_000_000_000_000);
        assert!(matches!(
            mu.try_lock(lease).await,
            Err(LockError::InvalidLease(_))
        ));
        assert!(matches!(
            mu.try_lock(Duration::MAX).await,
            Err(LockError::InvalidLease(_))
        ));
        assert_eq!(provider.write_count(), 0);

        mu.try_lock(Duration::from_secs(30)).await.unwrap().unwrap();
        assert!(matches!(
            mu.renew(lease).await,
            Err(LockError::InvalidLease(_))
        ));
        // The hold survives the rejected renewal
        assert!(mu.is_locked());
        assert_eq!(provider.write_count(), 1);
    }

    #[tokio::test]
    async fn test_lock_with_unbounded_timeout() {
        let provider = Arc::new(MemoryProvider::new());
        let mut mu = Mutex::new(provider, location());

        let token = mu
            .lock_with_timeout(Duration::from_secs(5), Duration::MAX)
            .await
            .unwrap();
        assert_eq!(token, FencingToken::new(1));
    }

    #[tokio::test]
    async fn test_same_handle_cannot_reacquire_while_held() {
        let provider = Arc::new(MemoryProvider::new());
        let mut mu = Mutex::new(provider, location());

        assert!(mu.try_lock(Duration::from_secs(30)).await.unwrap().is_some());
        assert_eq!(mu.try_lock(Duration::from_secs(30)).await.unwrap(), None);
        // The failed attempt keeps the existing hold
        assert_eq!(mu.fencing_token(), Some(FencingToken::new(1)));
    }

    #[tokio::test]
    async fn test_with_identity() {
        let provider = Arc::new(MemoryProvider::new());
        let mut mu = Mutex::new(provider.clone(), location()).with_identity("worker-7");

        mu.try_lock(Duration::from_secs(30)).await.unwrap();
        assert_eq!(stored_record(&provider).holder.as_deref(), Some("worker-7"));
    }

    #[tokio::test]
    async fn test_with_config_validates() {
        let provider: Arc<dyn StorageProvider> = Arc::new(MemoryProvider::new());
        let config = MutexConfig::default().with_backoff(BackoffConfig {
            multiplier: 0.1,
            ..Default::default()
        });

        assert!(matches!(
            Mutex::with_config(provider, location(), config),
            Err(LockError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_renew_extends_lease_without_new_fence() {
        let provider = Arc::new(MemoryProvider::new());
        let mut mu = Mutex::new(provider.clone(), location());

        mu.try_lock(Duration::from_secs(1)).await.unwrap();
        let before = stored_record(&provider).expires_at.unwrap();

        assert!(mu.renew(Duration::from_secs(60)).await.unwrap());
        let record = stored_record(&provider);
        assert!(record.expires_at.unwrap() > before);
        assert_eq!(record.fence, 1);
        assert_eq!(mu.fencing_token(), Some(FencingToken::new(1)));

        // Release still works with the version written by the renewal
        mu.unlock().await.unwrap();
        assert!(stored_record(&provider).holder.is_none());
    }

    #[tokio::test]
    async fn test_renew_without_lock() {
        let provider = Arc::new(MemoryProvider::new());
        let mut mu = Mutex::new(provider.clone(), location());

        assert!(!mu.renew(Duration::from_secs(5)).await.unwrap());
        assert_eq!(provider.write_count(), 0);
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let provider = Arc::new(MemoryProvider::new());
        let mu = Mutex::new(provider.clone(), location());

        assert!(mu.initialize().await.unwrap());
        assert_eq!(provider.get(&location()).unwrap().data, b"{}");

        assert!(!mu.initialize().await.unwrap());
        assert_eq!(provider.write_count(), 1);
    }

    #[test]
    fn test_classify() {
        let loc = location();
        assert_eq!(
            classify(ProviderError::Conflict, &loc).unwrap(),
            Contention::Conflict
        );
        assert_eq!(
            classify(ProviderError::aborted(Abort::Held), &loc).unwrap(),
            Contention::Held
        );
        assert!(matches!(
            classify(ProviderError::aborted(Abort::Missing), &loc),
            Err(LockError::NotInitialized(_))
        ));
        assert!(matches!(
            classify(ProviderError::aborted(RecordError::FenceExhausted), &loc),
            Err(LockError::Encoding(RecordError::FenceExhausted))
        ));
        assert!(matches!(
            classify(ProviderError::adapter("timeout"), &loc),
            Err(LockError::Provider(ProviderError::Adapter(_)))
        ));
    }
}
