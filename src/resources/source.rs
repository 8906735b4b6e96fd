//! Backing data service abstraction.
//!
//! The caches only decide when to fetch; a `ResourceSource` decides how.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

/// Read access to one resource type, keyed by numeric ID.
#[async_trait]
pub trait ResourceSource<V>: Send + Sync + 'static {
    /// Fetch one resource. `Ok(None)` means it does not exist.
    async fn one(&self, id: u64) -> Result<Option<V>>;

    /// Fetch many resources in one round trip.
    ///
    /// IDs that do not exist are left out of the result.
    async fn many(&self, ids: &[u64]) -> Result<Vec<V>>;
}

/// In-memory resource source.
///
/// Stands in for a remote data service: counts calls, can simulate latency,
/// and can be told to fail for specific IDs.
pub struct InMemorySource<V> {
    name: &'static str,
    records: DashMap<u64, V>,
    /// ID -> failure reason
    failing: DashMap<u64, String>,
    bulk_available: AtomicBool,
    latency: Option<Duration>,
    one_calls: AtomicUsize,
    many_calls: AtomicUsize,
}

impl<V> InMemorySource<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            records: DashMap::new(),
            failing: DashMap::new(),
            bulk_available: AtomicBool::new(true),
            latency: None,
            one_calls: AtomicUsize::new(0),
            many_calls: AtomicUsize::new(0),
        }
    }

    /// Delay every call by `latency` (builder pattern).
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn insert(&self, id: u64, record: V) {
        self.records.insert(id, record);
    }

    pub fn remove(&self, id: u64) -> Option<V> {
        self.records.remove(&id).map(|(_, record)| record)
    }

    /// Make every read touching `id` fail with `reason`.
    pub fn fail(&self, id: u64, reason: impl Into<String>) {
        self.failing.insert(id, reason.into());
    }

    /// Undo [`fail`](Self::fail).
    pub fn recover(&self, id: u64) {
        self.failing.remove(&id);
    }

    /// Toggle the bulk read endpoint.
    pub fn set_bulk_available(&self, available: bool) {
        self.bulk_available.store(available, Ordering::Relaxed);
    }

    pub fn one_calls(&self) -> usize {
        self.one_calls.load(Ordering::Relaxed)
    }

    pub fn many_calls(&self) -> usize {
        self.many_calls.load(Ordering::Relaxed)
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl<V> ResourceSource<V> for InMemorySource<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn one(&self, id: u64) -> Result<Option<V>> {
        self.one_calls.fetch_add(1, Ordering::Relaxed);
        self.delay().await;

        if let Some(reason) = self.failing.get(&id) {
            bail!("{} {}: {}", self.name, id, reason.value());
        }

        let record = self.records.get(&id).map(|r| r.value().clone());
        debug!("{} one({}): found={}", self.name, id, record.is_some());
        Ok(record)
    }

    async fn many(&self, ids: &[u64]) -> Result<Vec<V>> {
        self.many_calls.fetch_add(1, Ordering::Relaxed);
        self.delay().await;

        if !self.bulk_available.load(Ordering::Relaxed) {
            bail!("{} bulk read unavailable", self.name);
        }
        if let Some(id) = ids.iter().find(|id| self.failing.contains_key(*id)) {
            bail!("{} bulk read rejected because of {}", self.name, id);
        }

        let records: Vec<V> = ids
            .iter()
            .filter_map(|id| self.records.get(id).map(|r| r.value().clone()))
            .collect();
        debug!("{} many({:?}): {} found", self.name, ids, records.len());
        Ok(records)
    }
}
