use async_trait::async_trait;

use crate::error::ProviderError;
use crate::location::{ObjectLocation, VersionTag};

/// Transform applied to the current content of an object.
///
/// Receives the version tag that was read (`None` when the object does not
/// exist) and the current bytes (empty when the object does not exist), and
/// returns the bytes to write back.
pub type UpdateFn<'a> =
    dyn FnOnce(Option<&VersionTag>, &[u8]) -> Result<Vec<u8>, ProviderError> + Send + 'a;

/// Storage provider trait
///
/// The single primitive the lock protocol depends on. Implementations must:
/// - treat a missing object as empty content with no version tag, not as an error
/// - call `transform` exactly once per invocation
/// - write the result only if the object's version tag is unchanged since the
///   read (or the object is still absent), otherwise fail with
///   [`ProviderError::Conflict`]
/// - return a transform error unchanged without writing anything
/// - report every other failure as [`ProviderError::Adapter`]
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Read, transform and conditionally write an object; returns the new version tag
    async fn atomic_update(
        &self,
        location: &ObjectLocation,
        transform: Box<UpdateFn<'_>>,
    ) -> Result<VersionTag, ProviderError>;
}

#[async_trait]
impl<P> StorageProvider for std::sync::Arc<P>
where
    P: StorageProvider + ?Sized,
{
    async fn atomic_update(
        &self,
        location: &ObjectLocation,
        transform: Box<UpdateFn<'_>>,
    ) -> Result<VersionTag, ProviderError> {
        (**self).atomic_update(location, transform).await
    }
}
