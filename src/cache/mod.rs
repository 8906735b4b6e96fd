//! Cache module - Reactive resource caching.
//!
//! Two layers compose the cache:
//! - `MultiState` - Per-key observable slots (value, error flag, timestamp)
//! - `StateCache` - Load deduplication and batch orchestration on top of a
//!   store, driven by a pluggable `ResourceLoader`
//!
//! Stores are resolved through a `StoreRegistry`, so caches of different
//! resource types share one registry without key collisions.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let registry = StoreRegistry::new();
//! let projects = StateCache::new(ProjectLoader::new(source), &registry, CacheConfig::default());
//!
//! // Fetch missing keys with one batch call
//! projects.require(["1".to_string(), "2".to_string()]).await;
//!
//! // Observe a key
//! let _sub = projects.subscribe(&"1".to_string(), |slot| println!("{:?}", slot.get()));
//! ```

mod config;
mod coordinator;
mod error;
mod loader;
mod registry;
mod slot;
mod store;

pub use config::CacheConfig;
pub use coordinator::StateCache;
pub use error::LoadError;
pub use loader::ResourceLoader;
pub use registry::StoreRegistry;
pub use slot::Slot;
pub use store::{MultiState, SlotStream, Subscription};
