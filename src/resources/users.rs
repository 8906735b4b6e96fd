//! User cache.
//!
//! Batches fan out into one single read per user (the loader's default
//! `load_all`).

use std::sync::Arc;

use async_trait::async_trait;

use crate::cache::{CacheConfig, LoadError, ResourceLoader, StateCache, StoreRegistry};
use super::models::User;
use super::source::ResourceSource;

/// Loads users from a [`ResourceSource`].
pub struct UserLoader {
    source: Arc<dyn ResourceSource<User>>,
}

impl UserLoader {
    pub fn new(source: Arc<dyn ResourceSource<User>>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl ResourceLoader for UserLoader {
    type Key = u64;
    type Resource = User;
    const NAMESPACE: &'static str = "users";

    async fn load(&self, key: &u64) -> Result<User, LoadError> {
        self.source.one(*key).await?.ok_or(LoadError::NotFound)
    }
}

/// Cache of users keyed by ID.
pub type UserCache = StateCache<UserLoader>;

impl UserCache {
    /// Create the user cache. Users change rarely, so values stay fresh for
    /// an hour.
    pub fn with_source(source: Arc<dyn ResourceSource<User>>, registry: &StoreRegistry) -> Self {
        Self::new(UserLoader::new(source), registry, CacheConfig::cold_data())
    }
}
