//! Configuration module for the statecache demo.
//!
//! Loads configuration from environment variables.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::cache::CacheConfig;

/// Application configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Freshness window for cached projects. `None` disables staleness.
    pub cache_ttl: Option<Duration>,

    /// Number of projects seeded into the in-memory source.
    pub demo_projects: u64,

    /// Project IDs the in-memory source fails for (comma-separated).
    pub failing_ids: Vec<u64>,

    /// Simulated latency of every source read.
    pub source_latency: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_ttl: CacheConfig::default().ttl,
            demo_projects: 5,
            failing_ids: Vec::new(),
            source_latency: Duration::from_millis(50),
        }
    }
}

impl Config {
    /// Load configuration from environment variables (and `.env`).
    ///
    /// # Errors
    /// Returns error if a numeric variable cannot be parsed.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let cache_ttl = match parse_u64(&lookup, "CACHE_TTL_SECS")? {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.cache_ttl,
        };

        let demo_projects = parse_u64(&lookup, "DEMO_PROJECTS")?.unwrap_or(defaults.demo_projects);

        let source_latency = parse_u64(&lookup, "SOURCE_LATENCY_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.source_latency);

        // Parse failing IDs, skipping anything that is not a number
        let failing_ids = lookup("DEMO_FAILING_IDS")
            .unwrap_or_default()
            .split(',')
            .filter_map(|s| s.trim().parse::<u64>().ok())
            .collect();

        Ok(Self {
            cache_ttl,
            demo_projects,
            failing_ids,
            source_latency,
        })
    }

    /// Cache settings derived from this configuration.
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig { ttl: self.cache_ttl }
    }
}

fn parse_u64(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<u64>> {
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse::<u64>()
                .with_context(|| format!("{name} must be a non-negative integer, got '{raw}'"))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.cache_config(), CacheConfig::default());
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("CACHE_TTL_SECS", "0"),
            ("DEMO_PROJECTS", "12"),
            ("DEMO_FAILING_IDS", "2, 4,x"),
            ("SOURCE_LATENCY_MS", "5"),
        ]))
        .unwrap();

        assert_eq!(config.cache_ttl, None);
        assert_eq!(config.demo_projects, 12);
        assert_eq!(config.failing_ids, vec![2, 4]);
        assert_eq!(config.source_latency, Duration::from_millis(5));
    }

    #[test]
    fn test_invalid_number_is_an_error() {
        let err = Config::from_lookup(lookup(&[("CACHE_TTL_SECS", "soon")])).unwrap_err();
        assert!(err.to_string().contains("CACHE_TTL_SECS"));
    }
}
