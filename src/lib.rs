//! Statecache - Reactive cache for asynchronously loaded resources.
//!
//! Serves cached reads synchronously, coalesces concurrent fetches of the
//! same key, batches multi-key loads and pushes slot changes (loaded,
//! errored, cleared) to subscribers.
//!
//! ## Architecture
//!
//! - `cache` - Reactive store, store registry, loader contract and coordinator
//! - `resources` - Concrete project and user caches over a pluggable source
//! - `config` - Environment configuration for the demo binary

pub mod cache;
pub mod config;
pub mod resources;

pub use cache::{
    CacheConfig, LoadError, MultiState, ResourceLoader, Slot, SlotStream, StateCache, StoreRegistry,
    Subscription,
};
pub use config::Config;
