//! Cache-with-loader coordinator.
//!
//! Wraps a [`MultiState`] with load deduplication and batch orchestration.
//! At most one load per key is outstanding; concurrent requests for a key
//! attach to the load that is already running.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::{BoxFuture, FutureExt, Shared, join_all};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::error::panic_message;
use super::{
    CacheConfig, LoadError, MultiState, ResourceLoader, Slot, SlotStream, StoreRegistry,
    Subscription,
};

/// Completion signal of one spawned load, shared by every waiter.
type LoadFuture = Shared<BoxFuture<'static, ()>>;

/// In-flight registry entry.
struct InFlight {
    /// Batch that owns the entry. Completion only removes its own entries.
    batch: u64,
    done: LoadFuture,
}

#[derive(Debug, Clone, Copy)]
enum LoadMode {
    /// One key through [`ResourceLoader::load`].
    Single,
    /// Any number of keys through [`ResourceLoader::load_all`].
    Batch,
}

struct Inner<L: ResourceLoader> {
    loader: L,
    store: MultiState<L::Key, L::Resource>,
    config: CacheConfig,
    in_flight: Mutex<HashMap<L::Key, InFlight>>,
    next_batch: AtomicU64,
}

/// A cache of resources fetched through a [`ResourceLoader`].
///
/// Reads are served from the store synchronously. Missing or stale keys are
/// fetched through the loader, with at most one outstanding load per key.
/// Load failures never surface as errors here; they set the error flag of
/// the affected slots.
///
/// Cloning is cheap and shares the same store and in-flight registry.
///
/// Loads are spawned on the ambient tokio runtime, so the load operations
/// must be called from within one.
pub struct StateCache<L: ResourceLoader> {
    inner: Arc<Inner<L>>,
}

impl<L: ResourceLoader> Clone for StateCache<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L: ResourceLoader> StateCache<L> {
    /// Create a cache writing into the store `loader` resolves in `registry`.
    pub fn new(loader: L, registry: &StoreRegistry, config: CacheConfig) -> Self {
        let store = loader.resolve_store(registry);
        debug!("Creating state cache for '{}' ({:?})", store.name(), config);

        Self {
            inner: Arc::new(Inner {
                loader,
                store,
                config,
                in_flight: Mutex::new(HashMap::new()),
                next_batch: AtomicU64::new(0),
            }),
        }
    }

    /// The store this cache writes into.
    pub fn store(&self) -> &MultiState<L::Key, L::Resource> {
        &self.inner.store
    }

    pub fn loader(&self) -> &L {
        &self.inner.loader
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Current slot for a key. Never triggers a load.
    pub fn get(&self, key: &L::Key) -> Slot<L::Resource> {
        self.inner.store.get(key)
    }

    /// Cached value for a key. Never triggers a load.
    pub fn value(&self, key: &L::Key) -> Option<Arc<L::Resource>> {
        self.inner.store.value(key)
    }

    /// Subscribe to a key without triggering a load.
    pub fn subscribe<F>(&self, key: &L::Key, callback: F) -> Subscription
    where
        F: Fn(&Slot<L::Resource>) + Send + Sync + 'static,
    {
        self.inner.store.subscribe(key, callback)
    }

    /// Whether a load for the key is outstanding.
    pub fn is_in_flight(&self, key: &L::Key) -> bool {
        self.inner.in_flight.lock().contains_key(key)
    }

    /// Number of keys with an outstanding load.
    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.lock().len()
    }

    /// Load the key if it is missing or stale, and stream its slot.
    ///
    /// A fresh cached value is served as is; no refresh is started. Use
    /// [`require_and_stream_forced`](Self::require_and_stream_forced) for an
    /// explicit refresh.
    ///
    /// # Panics
    /// Panics if a load is needed and there is no tokio runtime.
    pub fn require_and_stream(&self, key: &L::Key) -> SlotStream<L::Resource> {
        let stream = self.inner.store.stream(key);
        self.inner.trigger(key, false);
        stream
    }

    /// Like [`require_and_stream`](Self::require_and_stream), but refreshes
    /// even a fresh value. Still attaches to an outstanding load instead of
    /// starting a second one.
    ///
    /// # Panics
    /// Panics if there is no tokio runtime.
    pub fn require_and_stream_forced(&self, key: &L::Key) -> SlotStream<L::Resource> {
        let stream = self.inner.store.stream(key);
        self.inner.trigger(key, true);
        stream
    }

    /// Make sure every key has a terminal outcome (value or error flag).
    ///
    /// Keys that are fresh are skipped, keys with an outstanding load are
    /// waited on, and all remaining keys are fetched with a single
    /// [`ResourceLoader::load_all`] call. Partitioning and registration
    /// happen before this returns; the returned future only waits.
    ///
    /// # Panics
    /// Panics if a load is needed and there is no tokio runtime.
    pub fn require<I>(&self, keys: I) -> BoxFuture<'static, ()>
    where
        I: IntoIterator<Item = L::Key>,
    {
        let mut waits: HashMap<u64, LoadFuture> = HashMap::new();
        let mut missing = Vec::new();
        let mut seen = HashSet::new();
        let mut fresh = 0usize;

        {
            let mut in_flight = self.inner.in_flight.lock();

            for key in keys {
                if !seen.insert(key.clone()) {
                    continue;
                }
                if self.inner.is_fresh(&key) {
                    fresh += 1;
                } else if let Some(entry) = in_flight.get(&key) {
                    waits
                        .entry(entry.batch)
                        .or_insert_with(|| entry.done.clone());
                } else {
                    missing.push(key);
                }
            }

            debug!(
                "require on '{}': {} fresh, {} pending batches, {} to fetch",
                self.inner.store.name(),
                fresh,
                waits.len(),
                missing.len()
            );

            if !missing.is_empty() {
                let (batch, done) = self.inner.spawn_load(&mut in_flight, missing, LoadMode::Batch);
                waits.insert(batch, done);
            }
        }

        async move {
            join_all(waits.into_values()).await;
        }
        .boxed()
    }

    /// Drop the cached state and in-flight bookkeeping for a key.
    ///
    /// The next `require` issues a fresh load. A load already running for
    /// the key is not cancelled and still writes its result when it lands.
    pub fn invalidate(&self, key: &L::Key) {
        let was_in_flight = self.inner.in_flight.lock().remove(key).is_some();
        debug!(
            "Invalidating {:?} in '{}' (in flight: {})",
            key,
            self.inner.store.name(),
            was_in_flight
        );
        self.inner.store.clear(key);
    }

    /// Reset every slot owned by this cache and forget outstanding loads.
    pub fn clear_all(&self) {
        self.inner.in_flight.lock().clear();
        self.inner.store.clear_all();
        debug!("Cleared all slots in '{}'", self.inner.store.name());
    }
}

impl<L: ResourceLoader> Inner<L> {
    fn is_fresh(&self, key: &L::Key) -> bool {
        let slot = self.store.get(key);
        slot.has_value()
            && !slot.has_error()
            && !slot.age().is_some_and(|age| self.config.is_expired(age))
    }

    fn trigger(self: &Arc<Self>, key: &L::Key, force: bool) {
        let mut in_flight = self.in_flight.lock();

        if in_flight.contains_key(key) {
            debug!("{:?} in '{}' already in flight", key, self.store.name());
            return;
        }
        if !force && self.is_fresh(key) {
            return;
        }

        self.spawn_load(&mut in_flight, vec![key.clone()], LoadMode::Single);
    }

    /// Spawn a load and register it for every key.
    ///
    /// Runs under the in-flight lock so no other caller can register the
    /// same keys in between.
    fn spawn_load(
        self: &Arc<Self>,
        in_flight: &mut HashMap<L::Key, InFlight>,
        keys: Vec<L::Key>,
        mode: LoadMode,
    ) -> (u64, LoadFuture) {
        let batch = self.next_batch.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(self);
        let task_keys = keys.clone();

        let handle = tokio::spawn(async move { inner.run_load(batch, task_keys, mode).await });
        let done = handle.map(|_| ()).boxed().shared();

        for key in keys {
            in_flight.insert(
                key,
                InFlight {
                    batch,
                    done: done.clone(),
                },
            );
        }

        (batch, done)
    }

    async fn run_load(self: Arc<Self>, batch: u64, keys: Vec<L::Key>, mode: LoadMode) {
        let versions: Vec<u64> = keys.iter().map(|key| self.store.version(key)).collect();
        debug!(
            "Loading {} key(s) into '{}' (batch {}, {:?})",
            keys.len(),
            self.store.name(),
            batch,
            mode
        );

        let outcome = AssertUnwindSafe(self.fetch(&keys, mode)).catch_unwind().await;
        let fallback = match outcome {
            Ok(Ok(())) => LoadError::Unreported,
            Ok(Err(e)) => {
                warn!("Batch {} for '{}' failed: {}", batch, self.store.name(), e);
                e
            }
            Err(panic) => {
                let message = panic_message(&*panic);
                warn!("Loader for '{}' panicked: {}", self.store.name(), message);
                LoadError::Panicked(message)
            }
        };

        // Keys the loader never wrote still need a terminal outcome
        for (key, version) in keys.iter().zip(versions) {
            if self.store.version(key) == version {
                debug!("{:?} in '{}' not reported by loader: {}", key, self.store.name(), fallback);
                self.store.set_error(key, fallback.clone());
            }
        }

        let mut in_flight = self.in_flight.lock();
        for key in &keys {
            if in_flight.get(key).is_some_and(|entry| entry.batch == batch) {
                in_flight.remove(key);
            }
        }
    }

    async fn fetch(&self, keys: &[L::Key], mode: LoadMode) -> Result<(), LoadError> {
        match mode {
            LoadMode::Single => {
                for key in keys {
                    match self.loader.load(key).await {
                        Ok(resource) => self.store.set(key, resource),
                        Err(e) => {
                            debug!("Load of {:?} in '{}' failed: {}", key, self.store.name(), e);
                            self.store.set_error(key, e);
                        }
                    }
                }
                Ok(())
            }
            LoadMode::Batch => self.loader.load_all(keys, &self.store).await,
        }
    }
}

impl<L: ResourceLoader> fmt::Debug for StateCache<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateCache")
            .field("store", &self.inner.store)
            .field("config", &self.inner.config)
            .field("in_flight", &self.in_flight_count())
            .finish()
    }
}
