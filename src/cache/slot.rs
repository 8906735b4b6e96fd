//! Per-key cache entry.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::LoadError;

/// Snapshot of the latest known state for one key.
///
/// Cloning is cheap: the value and error are shared.
#[derive(Debug)]
pub struct Slot<V> {
    /// Last successfully loaded value, if any.
    pub value: Option<Arc<V>>,
    /// Set when the most recent load failed.
    pub error: Option<Arc<LoadError>>,
    /// When the slot was last written.
    pub last_updated: Option<DateTime<Utc>>,
}

// Manual impls that don't require V: Clone / V: Default
impl<V> Clone for Slot<V> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            error: self.error.clone(),
            last_updated: self.last_updated,
        }
    }
}

impl<V> Default for Slot<V> {
    fn default() -> Self {
        Self {
            value: None,
            error: None,
            last_updated: None,
        }
    }
}

impl<V> Slot<V> {
    /// True if nothing has ever been written (or the slot was cleared).
    pub fn is_pristine(&self) -> bool {
        self.value.is_none() && self.error.is_none()
    }

    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// Borrow the cached value.
    pub fn get(&self) -> Option<&V> {
        self.value.as_deref()
    }

    /// Time since the last write, `None` for pristine slots.
    pub fn age(&self) -> Option<std::time::Duration> {
        let updated = self.last_updated?;
        (Utc::now() - updated).to_std().ok().or(Some(std::time::Duration::ZERO))
    }
}
