//! Cache store
//!
//! A file-like handle over one media file of the pool. Refill writes update
//! the pool's space accounting; reads bypass it. The per-entry rw-lock keeps
//! eviction truncation out of the middle of an active refill.

use std::fs::File;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Result;

use super::pool::PoolInner;
use super::CacheStat;

/// `st_blocks` unit
const DISK_BLOCK_SIZE: u64 = 512;

/// Handle over one cached media file
pub struct CacheStore {
    pool: Arc<PoolInner>,
    key: String,
    file: File,
    lock: Arc<RwLock<()>>,
    refill_unit: u32,
    released: bool,
}

impl CacheStore {
    pub(super) fn new(
        pool: Arc<PoolInner>,
        key: String,
        file: File,
        lock: Arc<RwLock<()>>,
        refill_unit: u32,
    ) -> Self {
        CacheStore {
            pool,
            key,
            file,
            lock,
            refill_unit,
            released: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn refill_unit(&self) -> u32 {
        self.refill_unit
    }

    /// Read cached bytes; holes and short files read short
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.pool.touch(&self.key);
        let n = self.file.read_at(buf, offset)?;
        Ok(n)
    }

    /// Refill: write fetched bytes and account the new media size.
    ///
    /// Holds the entry's read lock so eviction cannot truncate mid-write;
    /// once this returns, the bytes are accounted.
    pub fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize> {
        {
            let _refill = self.lock.read();
            self.file.write_all_at(buf, offset)?;
        }
        let size = self.file.metadata()?.size();
        self.pool.update_space(&self.key, size);
        Ok(buf.len())
    }

    /// Round `[offset, offset + size)` out to whole refill units
    pub fn refill_range(&self, offset: u64, size: u64) -> (u64, u64) {
        let unit = self.refill_unit as u64;
        let begin = offset / unit * unit;
        let end = (offset + size).div_ceil(unit) * unit;
        (begin, end - begin)
    }

    /// Drop the cached bytes of this file; the cache granularity is the
    /// whole file, so any range evicts everything
    pub fn evict(&self, _offset: u64, _count: u64) -> Result<()> {
        self.pool.evict_entry(&self.key)
    }

    pub fn stat(&self) -> Result<CacheStat> {
        let md = self.file.metadata()?;
        let unit = self.refill_unit as u64;
        Ok(CacheStat {
            refill_unit: self.refill_unit,
            total_size: md.size().div_ceil(unit) as u32,
            used_size: (md.blocks() * DISK_BLOCK_SIZE).div_ceil(unit) as u32,
        })
    }

    pub fn fstat(&self) -> Result<std::fs::Metadata> {
        Ok(self.file.metadata()?)
    }

    /// Explicitly return the store to the pool
    pub fn close(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.pool.release(&self.key);
        }
    }
}

impl Drop for CacheStore {
    fn drop(&mut self) {
        self.release_once();
    }
}
