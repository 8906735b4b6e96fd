//! Store registry - Central management for all resource stores.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use super::MultiState;

/// Type-erased view of a registered store.
trait ErasedStore: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn clear_all(&self);
    fn slot_count(&self) -> usize;
}

impl<K, V> ErasedStore for MultiState<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn clear_all(&self) {
        MultiState::clear_all(self);
    }

    fn slot_count(&self) -> usize {
        self.len()
    }
}

/// Internal registry entry storing a type-erased store.
struct StoreEntry {
    store: Arc<dyn ErasedStore>,
    type_id: TypeId,
    type_name: &'static str,
}

/// Central registry of per-resource-type stores.
///
/// Each concrete cache resolves its own namespace here, so caches of
/// different resource types share the infrastructure without key
/// collisions. Cloning shares the same registry.
///
/// ## Example
///
/// ```rust
/// use statecache::StoreRegistry;
///
/// let registry = StoreRegistry::new();
/// let projects = registry.get_or_create::<String, u32>("projects");
/// projects.set(&"1".to_string(), 42);
///
/// // Later, the same namespace resolves to the same slots
/// let again = registry.get_or_create::<String, u32>("projects");
/// assert_eq!(again.value(&"1".to_string()).as_deref(), Some(&42));
/// ```
#[derive(Clone)]
pub struct StoreRegistry {
    stores: Arc<RwLock<HashMap<String, StoreEntry>>>,
}

impl StoreRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        info!("Store registry initialized");
        Self {
            stores: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get an existing store by namespace.
    ///
    /// # Panics
    /// Panics if the namespace exists with different key/value types.
    pub fn get<K, V>(&self, name: &str) -> Option<MultiState<K, V>>
    where
        K: Hash + Eq + Clone + Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        let stores = self.stores.read();
        stores.get(name).map(|entry| Self::downcast(name, entry))
    }

    /// Get the store for a namespace, creating it on first use.
    ///
    /// # Panics
    /// Panics if the namespace exists with different key/value types.
    pub fn get_or_create<K, V>(&self, name: &str) -> MultiState<K, V>
    where
        K: Hash + Eq + Clone + Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        if let Some(store) = self.get(name) {
            return store;
        }

        let mut stores = self.stores.write();
        // Another caller may have won the race between the read and write lock
        if let Some(existing) = stores.get(name) {
            return Self::downcast(name, existing);
        }

        debug!("Creating store: {}", name);
        let store = MultiState::<K, V>::new(name);
        stores.insert(
            name.to_string(),
            StoreEntry {
                store: Arc::new(store.clone()),
                type_id: TypeId::of::<MultiState<K, V>>(),
                type_name: std::any::type_name::<MultiState<K, V>>(),
            },
        );

        store
    }

    fn downcast<K, V>(name: &str, entry: &StoreEntry) -> MultiState<K, V>
    where
        K: Hash + Eq + Clone + Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        let expected = TypeId::of::<MultiState<K, V>>();
        match entry.store.as_any().downcast_ref::<MultiState<K, V>>() {
            Some(store) if entry.type_id == expected => store.clone(),
            _ => panic!(
                "Store '{}' type mismatch: expected {}, got {}",
                name,
                std::any::type_name::<MultiState<K, V>>(),
                entry.type_name
            ),
        }
    }

    /// Check if a namespace has been registered.
    pub fn contains(&self, name: &str) -> bool {
        self.stores.read().contains_key(name)
    }

    /// Get the number of registered stores.
    pub fn len(&self) -> usize {
        self.stores.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.read().is_empty()
    }

    /// Get a list of all registered namespaces.
    pub fn names(&self) -> Vec<String> {
        self.stores.read().keys().cloned().collect()
    }

    /// Reset every slot of every registered store.
    ///
    /// Subscribers stay attached and observe the reset.
    pub fn clear_all(&self) {
        // Callbacks fired by the reset may resolve stores again
        let stores: Vec<(String, Arc<dyn ErasedStore>)> = self
            .stores
            .read()
            .iter()
            .map(|(name, entry)| (name.clone(), Arc::clone(&entry.store)))
            .collect();

        for (name, store) in stores {
            store.clear_all();
            debug!("Cleared store '{}' ({} slots)", name, store.slot_count());
        }
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stores = self.stores.read();
        f.debug_struct("StoreRegistry")
            .field("store_count", &stores.len())
            .field("store_names", &stores.keys().collect::<Vec<_>>())
            .finish()
    }
}
