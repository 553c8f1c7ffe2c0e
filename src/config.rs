//! Runtime configuration for the cache.
//!
//! Configuration can be loaded from a JSON file or constructed
//! programmatically. All cache knobs (bucket namespacing, LRU bound,
//! subscription channel capacity, background task pacing) live here.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Namespacing prefix inside the KV bucket. Every cache key `k` is
    /// stored as `<kv_store_prefix>.<k>`.
    pub kv_store_prefix: String,

    /// Maximum number of tree nodes retained before the sweeper starts
    /// evicting the coldest values.
    pub lru_size: usize,

    /// Bounded capacity of each level-subscription channel.
    pub level_subscription_channel_size: usize,

    /// Sweeper pass interval in milliseconds.
    pub sweep_interval_ms: u64,

    /// Back-off before re-subscribing after a watch failure, in milliseconds.
    pub watch_retry_delay_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            kv_store_prefix: "store".to_string(),
            lru_size: 100_000,
            level_subscription_channel_size: 64,
            sweep_interval_ms: 100,
            watch_retry_delay_ms: 100,
        }
    }
}

impl CacheConfig {
    /// Create a configuration with the given bucket prefix and defaults for
    /// everything else.
    pub fn new(kv_store_prefix: impl Into<String>) -> Self {
        Self {
            kv_store_prefix: kv_store_prefix.into(),
            ..Self::default()
        }
    }

    pub fn with_lru_size(mut self, lru_size: usize) -> Self {
        self.lru_size = lru_size;
        self
    }

    pub fn with_level_subscription_channel_size(mut self, size: usize) -> Self {
        self.level_subscription_channel_size = size;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Load configuration from a JSON file, falling back to defaults when
    /// the file does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: CacheConfig = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(CacheConfig::default())
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn watch_retry_delay(&self) -> Duration {
        Duration::from_millis(self.watch_retry_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = CacheConfig::default();
        assert_eq!(cfg.kv_store_prefix, "store");
        assert_eq!(cfg.sweep_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_builder_setters() {
        let cfg = CacheConfig::new("graph")
            .with_lru_size(2)
            .with_sweep_interval(Duration::from_millis(10));
        assert_eq!(cfg.kv_store_prefix, "graph");
        assert_eq!(cfg.lru_size, 2);
        assert_eq!(cfg.sweep_interval_ms, 10);
    }
}
