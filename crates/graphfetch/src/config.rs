//! Prefetch engine configuration.
//!
//! Every limit has a default that matches the engine's historical behavior, so
//! `PrefetchConfig::default()` is the right choice for most sessions. A
//! configuration can also be read from JSON, where missing keys fall back to
//! their defaults.

use graphfetch_core::{ConfigError, Error, Result};
use serde::{Deserialize, Serialize};

/// Tunables of a [`PrefetchScheduler`](crate::PrefetchScheduler).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    /// Pending graph nodes that trigger an automatic cycle (default: 120)
    pub max_pending_nodes: usize,
    /// Keys per column fetch query (default: 40)
    pub max_keys_per_query: usize,
    /// Entries of the long-lived `(type, fields) -> columns` cache (default: 256)
    pub column_cache_capacity: usize,
    /// Entries of the fetch specification cache (default: 1024)
    pub plan_cache_capacity: usize,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            max_pending_nodes: 120,
            max_keys_per_query: 40,
            column_cache_capacity: 256,
            plan_cache_capacity: 1024,
        }
    }
}

impl PrefetchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pending-node threshold for automatic execution.
    #[must_use]
    pub fn with_max_pending_nodes(mut self, nodes: usize) -> Self {
        self.max_pending_nodes = nodes;
        self
    }

    /// Set the number of keys per column fetch query.
    #[must_use]
    pub fn with_max_keys_per_query(mut self, keys: usize) -> Self {
        self.max_keys_per_query = keys;
        self
    }

    #[must_use]
    pub fn with_column_cache_capacity(mut self, capacity: usize) -> Self {
        self.column_cache_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_plan_cache_capacity(mut self, capacity: usize) -> Self {
        self.plan_cache_capacity = capacity;
        self
    }

    /// Parse a configuration from JSON and validate it.
    ///
    /// ```
    /// use graphfetch::PrefetchConfig;
    ///
    /// let config = PrefetchConfig::from_json(r#"{ "max_keys_per_query": 25 }"#).unwrap();
    /// assert_eq!(config.max_keys_per_query, 25);
    /// assert_eq!(config.max_pending_nodes, 120);
    /// ```
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every limit is usable.
    pub fn validate(&self) -> Result<()> {
        let limits = [
            ("max_pending_nodes", self.max_pending_nodes),
            ("max_keys_per_query", self.max_keys_per_query),
            ("column_cache_capacity", self.column_cache_capacity),
            ("plan_cache_capacity", self.plan_cache_capacity),
        ];
        for (name, value) in limits {
            if value == 0 {
                return Err(Error::Config(ConfigError {
                    message: format!("{name} must be greater than zero"),
                    source: None,
                }));
            }
        }
        Ok(())
    }
}
