//! Cache configuration.

use std::time::Duration;

/// Configuration for a [`StateCache`](super::StateCache) instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// How long a loaded value is considered fresh.
    /// Older values are refetched by the next `require`.
    /// `None` means values never go stale.
    pub ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Some(Duration::from_secs(120)), // 2 minutes
        }
    }
}

impl CacheConfig {
    /// Set the freshness window (builder pattern).
    #[must_use]
    pub fn ttl(mut self, duration: Duration) -> Self {
        self.ttl = Some(duration);
        self
    }

    /// Disable staleness (values stay fresh until invalidated).
    #[must_use]
    pub fn no_ttl(mut self) -> Self {
        self.ttl = None;
        self
    }

    /// Create config for frequently changing resources.
    pub fn hot_data() -> Self {
        Self {
            ttl: Some(Duration::from_secs(30)),
        }
    }

    /// Create config for rarely changing resources.
    pub fn cold_data() -> Self {
        Self {
            ttl: Some(Duration::from_secs(3600)), // 1 hour
        }
    }

    /// Whether a value written `age` ago is past the freshness window.
    pub fn is_expired(&self, age: Duration) -> bool {
        self.ttl.is_some_and(|ttl| age >= ttl)
    }
}
