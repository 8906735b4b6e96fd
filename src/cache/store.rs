//! Reactive multi-entry store.
//!
//! Maps keys to independently observable [`Slot`]s. Every write to a slot is
//! pushed to that slot's subscribers; there is no global event bus.
//!
//! ## Delivery order
//!
//! Each slot has a delivery turn, held by one thread at a time while it
//! commits a write and runs the callbacks. Writers and subscribers on other
//! threads wait for the turn, so a write returns only after its subscribers
//! were notified, and a new subscriber's replay always comes before any
//! later write.
//!
//! A write issued from inside a callback cannot wait for the turn it already
//! holds. It is queued and delivered once the current round of callbacks
//! completes, so every subscriber still sees every update in the order the
//! store applied them. A panicking callback is logged and skipped.

use std::collections::VecDeque;
use std::fmt;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use chrono::Utc;
use dashmap::DashMap;
use futures::Stream;
use futures::StreamExt;
use futures::channel::mpsc;
use parking_lot::{Mutex, ReentrantMutex};
use tracing::{trace, warn};

use super::error::panic_message;
use super::{LoadError, Slot};

type Callback<V> = Arc<dyn Fn(&Slot<V>) + Send + Sync>;

struct Subscriber<V> {
    id: u64,
    /// Slot version at registration; only later writes are delivered.
    since: u64,
    callback: Callback<V>,
}

struct SlotState<V> {
    slot: Slot<V>,
    version: u64,
    subscribers: Vec<Subscriber<V>>,
    /// Writes committed from inside a callback, waiting for delivery.
    pending: VecDeque<(u64, Slot<V>)>,
    delivering: bool,
}

struct SlotCell<V> {
    /// Delivery turn. Reentrant so callbacks may write and subscribe.
    turn: ReentrantMutex<()>,
    state: Mutex<SlotState<V>>,
}

impl<V> SlotCell<V> {
    fn new() -> Self {
        Self {
            turn: ReentrantMutex::new(()),
            state: Mutex::new(SlotState {
                slot: Slot::default(),
                version: 0,
                subscribers: Vec::new(),
                pending: VecDeque::new(),
                delivering: false,
            }),
        }
    }
}

/// A mapping from key to an observable slot.
///
/// Cloning is cheap and shares the same underlying slots.
pub struct MultiState<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    cells: Arc<DashMap<K, Arc<SlotCell<V>>>>,
    next_subscriber: Arc<AtomicU64>,
    name: Arc<str>,
}

impl<K, V> Clone for MultiState<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            cells: Arc::clone(&self.cells),
            next_subscriber: Arc::clone(&self.next_subscriber),
            name: Arc::clone(&self.name),
        }
    }
}

impl<K, V> MultiState<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Create an empty store.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            cells: Arc::new(DashMap::new()),
            next_subscriber: Arc::new(AtomicU64::new(0)),
            name: name.into(),
        }
    }

    /// Name of the namespace this store serves.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn cell(&self, key: &K) -> Arc<SlotCell<V>> {
        if let Some(cell) = self.cells.get(key) {
            return Arc::clone(cell.value());
        }
        Arc::clone(
            self.cells
                .entry(key.clone())
                .or_insert_with(|| Arc::new(SlotCell::new()))
                .value(),
        )
    }

    /// Get the current slot for a key, creating an empty one if absent.
    ///
    /// Never triggers a load.
    pub fn get(&self, key: &K) -> Slot<V> {
        self.cell(key).state.lock().slot.clone()
    }

    /// Get the cached value for a key without creating a slot.
    pub fn value(&self, key: &K) -> Option<Arc<V>> {
        let cell = self.cells.get(key).map(|c| Arc::clone(c.value()))?;
        let value = cell.state.lock().slot.value.clone();
        value
    }

    /// Check if a slot exists for the key.
    pub fn contains(&self, key: &K) -> bool {
        self.cells.contains_key(key)
    }

    /// Keys of every slot created so far.
    pub fn keys(&self) -> Vec<K> {
        self.cells.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Write counter for a key. Bumped on every `set`, `set_error` and `clear`.
    pub(crate) fn version(&self, key: &K) -> u64 {
        self.cell(key).state.lock().version
    }

    /// Replace the slot's value, clear its error flag and notify subscribers.
    pub fn set(&self, key: &K, value: impl Into<Arc<V>>) {
        let value = value.into();
        self.write(key, move |slot| {
            slot.value = Some(value);
            slot.error = None;
            slot.last_updated = Some(Utc::now());
        });
    }

    /// Flag the slot as errored, keeping any previous value.
    pub fn set_error(&self, key: &K, error: LoadError) {
        let error = Arc::new(error);
        self.write(key, move |slot| slot.error = Some(error));
    }

    /// Reset a slot to absent / no error.
    pub fn clear(&self, key: &K) {
        self.write(key, |slot| *slot = Slot::default());
    }

    /// Reset every slot in the store.
    pub fn clear_all(&self) {
        for key in self.keys() {
            self.clear(&key);
        }
    }

    fn write(&self, key: &K, update: impl FnOnce(&mut Slot<V>)) {
        let cell = self.cell(key);
        let _turn = cell.turn.lock();
        {
            let mut state = cell.state.lock();
            update(&mut state.slot);
            state.version += 1;
            let entry = (state.version, state.slot.clone());
            state.pending.push_back(entry);
            if state.delivering {
                // Written from a callback; the running delivery picks it up.
                return;
            }
            state.delivering = true;
        }
        self.deliver(&cell);
    }

    /// Drain the pending writes of a cell. Caller holds the cell's turn.
    fn deliver(&self, cell: &SlotCell<V>) {
        loop {
            let (snapshot, callbacks) = {
                let mut state = cell.state.lock();
                let Some((version, snapshot)) = state.pending.pop_front() else {
                    state.delivering = false;
                    return;
                };
                let callbacks: Vec<Callback<V>> = state
                    .subscribers
                    .iter()
                    .filter(|s| s.since < version)
                    .map(|s| Arc::clone(&s.callback))
                    .collect();
                (snapshot, callbacks)
            };

            for callback in &callbacks {
                self.notify(callback, &snapshot);
            }
        }
    }

    fn notify(&self, callback: &Callback<V>, slot: &Slot<V>) {
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| callback(slot))) {
            warn!(
                "Subscriber callback on store '{}' panicked: {}",
                self.name,
                panic_message(&*panic)
            );
        }
    }

    /// Register a callback for a key.
    ///
    /// The callback runs once immediately with the current slot, then again
    /// after every subsequent write to that key. Dropping (or disposing) the
    /// returned [`Subscription`] deregisters it.
    pub fn subscribe<F>(&self, key: &K, callback: F) -> Subscription
    where
        F: Fn(&Slot<V>) + Send + Sync + 'static,
    {
        let callback: Callback<V> = Arc::new(callback);
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let cell = self.cell(key);

        {
            let _turn = cell.turn.lock();
            let snapshot = {
                let mut state = cell.state.lock();
                let since = state.version;
                state.subscribers.push(Subscriber {
                    id,
                    since,
                    callback: Arc::clone(&callback),
                });
                state.slot.clone()
            };
            trace!("Subscriber {} attached to store '{}'", id, self.name);

            self.notify(&callback, &snapshot);
        }

        Subscription::new(move || {
            cell.state.lock().subscribers.retain(|s| s.id != id);
        })
    }

    /// Stream of slot snapshots for a key, starting with the current one.
    pub fn stream(&self, key: &K) -> SlotStream<V> {
        let (tx, rx) = mpsc::unbounded();
        let subscription = self.subscribe(key, move |slot| {
            // Receiver gone means the stream was dropped; the subscription
            // goes with it.
            let _ = tx.unbounded_send(slot.clone());
        });
        SlotStream {
            rx,
            _subscription: subscription,
        }
    }

    /// Number of live subscribers on a key.
    pub fn subscriber_count(&self, key: &K) -> usize {
        self.cells
            .get(key)
            .map(|c| Arc::clone(c.value()))
            .map_or(0, |cell| cell.state.lock().subscribers.len())
    }
}

impl<K, V> fmt::Debug for MultiState<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiState")
            .field("name", &self.name)
            .field("slot_count", &self.cells.len())
            .finish()
    }
}

/// Disposer returned by [`MultiState::subscribe`].
///
/// Deregisters the callback on [`dispose`](Self::dispose) or drop.
#[must_use = "dropping a Subscription deregisters the callback"]
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    fn new(unsubscribe: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Deregister the callback now.
    pub fn dispose(mut self) {
        self.run();
    }

    fn run(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

/// Live stream of a key's slot snapshots.
///
/// Yields the slot as it was when the stream was created, then every later
/// write. Ends only when the stream is dropped.
pub struct SlotStream<V> {
    rx: mpsc::UnboundedReceiver<Slot<V>>,
    _subscription: Subscription,
}

impl<V> Stream for SlotStream<V> {
    type Item = Slot<V>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_next_unpin(cx)
    }
}

impl<V> fmt::Debug for SlotStream<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotStream").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Log = Arc<Mutex<Vec<(Option<u32>, bool)>>>;

    fn recorder(log: &Log) -> impl Fn(&Slot<u32>) + Send + Sync + 'static {
        let log = Arc::clone(log);
        move |slot: &Slot<u32>| log.lock().push((slot.get().copied(), slot.has_error()))
    }

    #[test]
    fn test_get_unknown_key_is_absent() {
        let store: MultiState<&str, u32> = MultiState::new("test");
        let slot = store.get(&"missing");

        assert!(slot.is_pristine());
        assert!(!slot.has_error());
        assert!(slot.last_updated.is_none());
        assert!(store.contains(&"missing"));
    }

    #[test]
    fn test_value_does_not_create_slot() {
        let store: MultiState<&str, u32> = MultiState::new("test");
        assert!(store.value(&"a").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_subscribe_replays_then_follows_writes() {
        let store: MultiState<&str, u32> = MultiState::new("test");
        let log = Log::default();
        let _sub = store.subscribe(&"a", recorder(&log));

        store.set(&"a", 1);
        store.set(&"a", 2);

        assert_eq!(*log.lock(), vec![(None, false), (Some(1), false), (Some(2), false)]);
    }

    #[test]
    fn test_every_subscriber_is_notified() {
        let store: MultiState<&str, u32> = MultiState::new("test");
        let first = Log::default();
        let second = Log::default();
        let _a = store.subscribe(&"k", recorder(&first));
        store.set(&"k", 7);
        let _b = store.subscribe(&"k", recorder(&second));
        store.set(&"k", 8);

        assert_eq!(*first.lock(), vec![(None, false), (Some(7), false), (Some(8), false)]);
        assert_eq!(*second.lock(), vec![(Some(7), false), (Some(8), false)]);
    }

    #[test]
    fn test_set_error_keeps_previous_value() {
        let store: MultiState<&str, u32> = MultiState::new("test");
        store.set(&"a", 5);
        let before = store.get(&"a").last_updated;

        store.set_error(&"a", LoadError::NotFound);

        let slot = store.get(&"a");
        assert_eq!(slot.get(), Some(&5));
        assert_eq!(slot.error.as_deref(), Some(&LoadError::NotFound));
        assert_eq!(slot.last_updated, before);

        store.set(&"a", 6);
        assert!(!store.get(&"a").has_error());
    }

    #[test]
    fn test_errors_do_not_leak_to_siblings() {
        let store: MultiState<u32, u32> = MultiState::new("test");
        store.set(&1, 1);
        store.set_error(&2, LoadError::Unreported);

        assert!(!store.get(&1).has_error());
        assert!(store.get(&2).has_error());
    }

    #[test]
    fn test_clear_resets_and_notifies() {
        let store: MultiState<&str, u32> = MultiState::new("test");
        let log = Log::default();
        store.set(&"a", 1);
        let _sub = store.subscribe(&"a", recorder(&log));

        store.clear(&"a");

        assert!(store.get(&"a").is_pristine());
        assert_eq!(*log.lock(), vec![(Some(1), false), (None, false)]);
    }

    #[test]
    fn test_clear_all_resets_every_slot() {
        let store: MultiState<u32, u32> = MultiState::new("test");
        store.set(&1, 10);
        store.set_error(&2, LoadError::NotFound);

        store.clear_all();

        assert!(store.get(&1).is_pristine());
        assert!(store.get(&2).is_pristine());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_dispose_and_drop_deregister() {
        let store: MultiState<&str, u32> = MultiState::new("test");
        let log = Log::default();

        let sub = store.subscribe(&"a", recorder(&log));
        assert_eq!(store.subscriber_count(&"a"), 1);
        sub.dispose();
        assert_eq!(store.subscriber_count(&"a"), 0);

        {
            let _sub = store.subscribe(&"a", recorder(&log));
        }
        assert_eq!(store.subscriber_count(&"a"), 0);

        store.set(&"a", 3);
        assert_eq!(*log.lock(), vec![(None, false), (None, false)]);
    }

    #[test]
    fn test_write_from_callback_keeps_order() {
        let store: MultiState<&str, u32> = MultiState::new("test");
        let first = Log::default();
        let second = Log::default();

        let inner = store.clone();
        let _bump = store.subscribe(&"a", move |slot| {
            if slot.get() == Some(&1) {
                inner.set(&"a", 2);
            }
        });
        let _a = store.subscribe(&"a", recorder(&first));
        let _b = store.subscribe(&"a", recorder(&second));

        store.set(&"a", 1);

        let expected = vec![(None, false), (Some(1), false), (Some(2), false)];
        assert_eq!(*first.lock(), expected);
        assert_eq!(*second.lock(), expected);
        assert_eq!(store.get(&"a").get(), Some(&2));
    }

    #[test]
    fn test_subscribe_from_callback_gets_no_stale_updates() {
        let store: MultiState<&str, u32> = MultiState::new("test");
        let late = Log::default();
        let late_subs = Arc::new(Mutex::new(Vec::new()));

        let inner = store.clone();
        let late_log = Arc::clone(&late);
        let subs = Arc::clone(&late_subs);
        let _watcher = store.subscribe(&"a", move |slot| {
            if slot.get() == Some(&1) {
                let sub = inner.subscribe(&"a", recorder(&late_log));
                subs.lock().push(sub);
            }
        });

        store.set(&"a", 1);
        store.set(&"a", 2);

        assert_eq!(*late.lock(), vec![(Some(1), false), (Some(2), false)]);
    }

    #[test]
    fn test_panicking_subscriber_does_not_mute_key() {
        let store: MultiState<&str, u32> = MultiState::new("test");
        let _boom = store.subscribe(&"a", |slot| {
            if slot.get() == Some(&1) {
                panic!("subscriber failure");
            }
        });
        let log = Log::default();
        let _sub = store.subscribe(&"a", recorder(&log));

        store.set(&"a", 1);
        let late = Log::default();
        let _late = store.subscribe(&"a", recorder(&late));
        store.set(&"a", 2);
        store.set(&"a", 3);

        assert_eq!(
            *log.lock(),
            vec![(None, false), (Some(1), false), (Some(2), false), (Some(3), false)]
        );
        assert_eq!(*late.lock(), vec![(Some(1), false), (Some(2), false), (Some(3), false)]);
    }

    #[test]
    fn test_replay_precedes_writes_from_other_threads() {
        let store: MultiState<u32, u32> = MultiState::new("test");
        let logs: Vec<Arc<Mutex<Vec<u32>>>> = (0..50).map(|_| Arc::default()).collect();

        std::thread::scope(|scope| {
            let writer = store.clone();
            scope.spawn(move || {
                for value in 1..=500 {
                    writer.set(&0, value);
                }
            });

            let mut subscriptions = Vec::new();
            for log in &logs {
                let log = Arc::clone(log);
                subscriptions.push(store.subscribe(&0, move |slot| {
                    log.lock().push(slot.get().copied().unwrap_or(0));
                    std::thread::sleep(std::time::Duration::from_micros(50));
                }));
            }
            drop(subscriptions);
        });

        for log in &logs {
            let seen = log.lock();
            assert!(!seen.is_empty());
            assert!(seen.windows(2).all(|w| w[0] < w[1]), "out of order: {seen:?}");
        }
    }

    #[tokio::test]
    async fn test_stream_yields_current_then_updates() {
        let store: MultiState<&str, u32> = MultiState::new("test");
        store.set(&"a", 1);
        let mut stream = store.stream(&"a");

        store.set(&"a", 2);
        store.set_error(&"a", LoadError::NotFound);

        assert_eq!(stream.next().await.and_then(|s| s.get().copied()), Some(1));
        assert_eq!(stream.next().await.and_then(|s| s.get().copied()), Some(2));
        let errored = stream.next().await.unwrap();
        assert!(errored.has_error());
        assert_eq!(errored.get(), Some(&2));

        drop(stream);
        assert_eq!(store.subscriber_count(&"a"), 0);
    }
}
