//! Project cache.
//!
//! Keys are the string form of project IDs. Batches go through the source's
//! bulk read; if that is rejected, the batch falls back to single reads so
//! one bad ID cannot fail its siblings.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, warn};

use crate::cache::{CacheConfig, LoadError, MultiState, ResourceLoader, StateCache, StoreRegistry};
use super::models::Project;
use super::source::ResourceSource;

/// Loads projects from a [`ResourceSource`].
pub struct ProjectLoader {
    source: Arc<dyn ResourceSource<Project>>,
}

impl ProjectLoader {
    pub fn new(source: Arc<dyn ResourceSource<Project>>) -> Self {
        Self { source }
    }
}

fn parse_id(key: &str) -> Result<u64, LoadError> {
    key.trim()
        .parse()
        .map_err(|_| LoadError::InvalidKey(key.to_string()))
}

#[async_trait]
impl ResourceLoader for ProjectLoader {
    type Key = String;
    type Resource = Project;
    const NAMESPACE: &'static str = "projects";

    async fn load(&self, key: &String) -> Result<Project, LoadError> {
        let id = parse_id(key)?;
        self.source.one(id).await?.ok_or(LoadError::NotFound)
    }

    async fn load_all(
        &self,
        keys: &[String],
        store: &MultiState<String, Project>,
    ) -> Result<(), LoadError> {
        let mut wanted = Vec::with_capacity(keys.len());
        for key in keys {
            match parse_id(key) {
                Ok(id) => wanted.push((id, key)),
                Err(e) => store.set_error(key, e),
            }
        }
        if wanted.is_empty() {
            return Ok(());
        }

        let ids: Vec<u64> = wanted.iter().map(|(id, _)| *id).collect();
        match self.source.many(&ids).await {
            Ok(projects) => {
                let by_id: HashMap<u64, Project> =
                    projects.into_iter().map(|p| (p.id, p)).collect();
                debug!("Bulk read returned {}/{} projects", by_id.len(), ids.len());

                for (id, key) in wanted {
                    match by_id.get(&id) {
                        Some(project) => store.set(key, project.clone()),
                        None => store.set_error(key, LoadError::NotFound),
                    }
                }
            }
            Err(e) => {
                warn!("Bulk project read failed, falling back to single reads: {:#}", e);
                join_all(wanted.into_iter().map(|(_, key)| async move {
                    match self.load(key).await {
                        Ok(project) => store.set(key, project),
                        Err(e) => store.set_error(key, e),
                    }
                }))
                .await;
            }
        }

        Ok(())
    }
}

/// Cache of projects keyed by the string form of their ID.
pub type ProjectCache = StateCache<ProjectLoader>;

impl ProjectCache {
    /// Create the project cache with the default freshness window.
    pub fn with_source(source: Arc<dyn ResourceSource<Project>>, registry: &StoreRegistry) -> Self {
        Self::new(ProjectLoader::new(source), registry, CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::resources::InMemorySource;

    fn setup() -> (Arc<InMemorySource<Project>>, ProjectCache) {
        let source = Arc::new(InMemorySource::new("projects"));
        source.insert(1, Project::new(1, "website", "Website"));
        source.insert(2, Project::new(2, "mobile", "Mobile App"));
        source.insert(3, Project::new(3, "ops", "Operations"));

        let cache = ProjectCache::with_source(source.clone(), &StoreRegistry::new());
        (source, cache)
    }

    fn keys(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[tokio::test]
    async fn test_batch_uses_one_bulk_read() {
        let (source, cache) = setup();

        cache.require(keys(&["1", "2", "3"])).await;

        assert_eq!(source.many_calls(), 1);
        assert_eq!(source.one_calls(), 0);
        assert_eq!(
            cache.value(&"2".to_string()).map(|p| p.identifier.clone()),
            Some("mobile".to_string())
        );
    }

    #[tokio::test]
    async fn test_missing_and_invalid_keys() {
        let (source, cache) = setup();

        cache.require(keys(&["1", "42", "abc"])).await;

        assert!(cache.get(&"1".to_string()).has_value());
        assert_eq!(cache.get(&"42".to_string()).error.as_deref(), Some(&LoadError::NotFound));
        assert_eq!(
            cache.get(&"abc".to_string()).error.as_deref(),
            Some(&LoadError::InvalidKey("abc".to_string()))
        );
        assert_eq!(source.many_calls(), 1);
        assert_eq!(cache.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_bulk_failure_falls_back_per_key() {
        let (source, cache) = setup();
        source.fail(2, "permission denied");

        cache.require(keys(&["1", "2", "3"])).await;

        assert_eq!(source.many_calls(), 1);
        assert_eq!(source.one_calls(), 3);
        assert!(cache.get(&"1".to_string()).has_value());
        assert!(cache.get(&"3".to_string()).has_value());

        let failed = cache.get(&"2".to_string());
        assert!(matches!(
            failed.error.as_deref(),
            Some(LoadError::Failed(reason)) if reason.contains("permission denied")
        ));
    }

    #[tokio::test]
    async fn test_retry_after_invalidate() {
        let (source, cache) = setup();
        source.fail(3, "timeout");
        cache.require(keys(&["3"])).await;
        assert!(cache.get(&"3".to_string()).has_error());

        source.recover(3);
        cache.invalidate(&"3".to_string());
        cache.require(keys(&["3"])).await;

        let slot = cache.get(&"3".to_string());
        assert!(!slot.has_error());
        assert_eq!(slot.get().map(|p| p.name.as_str()), Some("Operations"));
    }

    #[tokio::test]
    async fn test_stream_uses_single_read() {
        let (source, cache) = setup();

        let mut stream = cache.require_and_stream(&"1".to_string());

        assert!(stream.next().await.unwrap().is_pristine());
        let loaded = stream.next().await.unwrap();
        assert_eq!(loaded.get().map(|p| p.id), Some(1));
        assert_eq!(source.one_calls(), 1);
        assert_eq!(source.many_calls(), 0);
    }
}
