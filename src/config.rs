//! Configuration for stratabd
//!
//! Centralized configuration with sensible defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Main configuration for the block engine and cache pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Layer Engine Configuration
    // -------------------------------------------------------------------------
    /// Max size of a single read/write operation in bytes (split above this)
    pub max_io_size: usize,

    /// Number of index inserts batched before the trailer is persisted
    pub index_group_commit: usize,

    // -------------------------------------------------------------------------
    // Cache Pool Configuration
    // -------------------------------------------------------------------------
    /// Total cache capacity in GiB
    pub cache_capacity_gb: u64,

    /// Interval between background eviction runs
    pub eviction_period: Duration,

    /// Minimum free disk space the pool tries to keep available, in bytes
    pub disk_avail_bytes: u64,

    /// Refill unit of cache stores, in bytes
    pub refill_unit: u32,

    /// Pause between evicted files, lets openers catch up
    pub delete_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_io_size: 512 * 1024,
            index_group_commit: 32,
            cache_capacity_gb: 32,
            eviction_period: Duration::from_secs(1),
            disk_avail_bytes: 0,
            refill_unit: 256 * 1024,
            delete_delay: Duration::from_micros(1000),
        }
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> crate::error::Result<()> {
        // I/O splitting works on 4 KiB granularity.
        if self.max_io_size == 0 || self.max_io_size % 4096 != 0 {
            return Err(crate::error::StrataError::invalid(format!(
                "max_io_size must be a positive multiple of 4096: {}",
                self.max_io_size
            )));
        }
        if self.refill_unit == 0 {
            return Err(crate::error::StrataError::invalid(
                "refill_unit must be positive",
            ));
        }
        Ok(())
    }
}
