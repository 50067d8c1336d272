//! Full-File Cache Pool Module
//!
//! Keeps recently used blob files local. One media file per cache key under
//! the pool root; there are no metadata files, accounting is rebuilt on
//! startup by walking the root. Background eviction truncates
//! least-recently-used files when usage crosses the cache watermark or free
//! disk falls under target.
//!
//! ```text
//!   CachePool ──── FileIndex (key → LruEntry) ──── recency list
//!       │                                               │
//!       ▼                                               ▼
//!   CacheStore (refill pwrite / pread)          eviction (truncate, unlink)
//! ```

mod lru;
mod pool;
mod store;

pub use pool::CachePool;
pub use store::CacheStore;

/// Usage summary of one store, in refill units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStat {
    /// Refill granularity in bytes
    pub refill_unit: u32,
    /// File size, rounded up to refill units
    pub total_size: u32,
    /// Allocated size on media, rounded up to refill units
    pub used_size: u32,
}
