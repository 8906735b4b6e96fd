//! Loader contract implemented by concrete resource caches.

use std::fmt::Debug;
use std::hash::Hash;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::debug;

use super::{LoadError, MultiState, StoreRegistry};

/// How a concrete cache fetches its resources.
///
/// Implementors say how to fetch one resource and, optionally, how to fetch
/// many at once. The [`StateCache`](super::StateCache) decides when to call
/// them and how often.
#[async_trait]
pub trait ResourceLoader: Send + Sync + 'static {
    /// Identifier of one resource.
    type Key: Hash + Eq + Clone + Debug + Send + Sync + 'static;
    /// The cached resource type.
    type Resource: Send + Sync + 'static;

    /// Store namespace this loader writes into.
    const NAMESPACE: &'static str;

    /// Fetch exactly one resource.
    async fn load(&self, key: &Self::Key) -> Result<Self::Resource, LoadError>;

    /// Fetch many resources, writing each outcome into `store` as soon as it
    /// is known.
    ///
    /// Per-key failures must be written with [`MultiState::set_error`]
    /// instead of failing the whole batch. Returning `Err` marks every key
    /// the call did not write as errored.
    ///
    /// The default runs [`load`](Self::load) for every key concurrently.
    async fn load_all(
        &self,
        keys: &[Self::Key],
        store: &MultiState<Self::Key, Self::Resource>,
    ) -> Result<(), LoadError> {
        join_all(keys.iter().map(|key| async move {
            match self.load(key).await {
                Ok(resource) => store.set(key, resource),
                Err(e) => {
                    debug!("Load of {:?} in '{}' failed: {}", key, Self::NAMESPACE, e);
                    store.set_error(key, e);
                }
            }
        }))
        .await;

        Ok(())
    }

    /// Identify the store this loader's resources live in.
    fn resolve_store(&self, registry: &StoreRegistry) -> MultiState<Self::Key, Self::Resource> {
        registry.get_or_create(Self::NAMESPACE)
    }
}
