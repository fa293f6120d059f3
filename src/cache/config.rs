//! Cache configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Query cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL used when neither an override nor an association TTL applies.
    pub default_ttl: Duration,
    /// Per-association TTLs.
    pub association_ttls: BTreeMap<String, Duration>,
    /// Maximum number of entries.
    pub max_entries: usize,
    /// Maximum estimated memory footprint of all entries, in bytes.
    pub max_memory_bytes: usize,
    /// Background sweep interval; `None` disables the sweeper thread.
    pub sweep_interval: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(5 * 60),
            association_ttls: BTreeMap::new(),
            max_entries: 1000,
            max_memory_bytes: 64 * 1024 * 1024,
            sweep_interval: Some(Duration::from_secs(60)),
        }
    }
}

impl CacheConfig {
    /// Sets the fallback TTL.
    #[must_use]
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Sets a TTL for one association's entries.
    #[must_use]
    pub fn with_association_ttl(mut self, association: impl Into<String>, ttl: Duration) -> Self {
        self.association_ttls.insert(association.into(), ttl);
        self
    }

    /// Sets the entry-count limit.
    #[must_use]
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Sets the memory limit in bytes.
    #[must_use]
    pub fn with_max_memory_bytes(mut self, max_memory_bytes: usize) -> Self {
        self.max_memory_bytes = max_memory_bytes;
        self
    }

    /// Sets the background sweep interval; `None` disables the sweeper.
    #[must_use]
    pub fn with_sweep_interval(mut self, interval: Option<Duration>) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Resolves the TTL for an insert: override, then association, then default.
    #[must_use]
    pub fn ttl_for(&self, association: &str, ttl_override: Option<Duration>) -> Duration {
        ttl_override
            .or_else(|| self.association_ttls.get(association).copied())
            .unwrap_or(self.default_ttl)
    }

    /// Entries evicted per LRU round: 10% of capacity, at least one.
    #[must_use]
    pub fn eviction_batch(&self) -> usize {
        (self.max_entries / 10).max(1)
    }
}
