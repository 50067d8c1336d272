//! Cache pool
//!
//! Binds a media directory and hands out keyed stores. Accounting is kept in
//! memory (one `LruEntry` per key) and rebuilt on startup by walking the
//! root. Eviction runs off a background timer or synchronously when a refill
//! pushes usage over the risk mark; both paths go through a try-lock so only
//! one pass ever runs.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};

use crate::config::Config;
use crate::error::{Result, StrataError};

use super::lru::{LruList, CLEARED};
use super::store::CacheStore;
use super::CacheStat;

const K_GB: u64 = 1 << 30;

/// Free space the watermark never claims, even on huge disks
const K_MAX_FREE_SPACE: u64 = 50 * K_GB;

/// Headroom between the risk mark and capacity
const K_EVICTION_MARK: u64 = 5 * K_GB;

/// Cache watermark as a percentage of capacity
const K_WATER_MARK_RATIO: u64 = 90;

/// `st_blocks` unit
const K_DISK_BLOCK_SIZE: u64 = 512;

pub(super) struct LruEntry {
    /// Position in the recency list; `CLEARED` while out of it
    pub tick: u64,
    pub open_count: u32,
    /// Allocated bytes on media
    pub size: u64,
    /// Serializes eviction truncation against active refills
    pub lock: Arc<RwLock<()>>,
}

struct PoolState {
    entries: HashMap<String, LruEntry>,
    lru: LruList,
    total_used: u64,
    is_full: bool,
}

pub(crate) struct PoolInner {
    root: PathBuf,
    water_mark: u64,
    risk_mark: u64,
    disk_avail_target: u64,
    refill_unit: u32,
    delete_delay: Duration,
    state: Mutex<PoolState>,
    /// Single-runner guard for eviction
    eviction_guard: Mutex<()>,
    exit: AtomicBool,
}

/// Full-file cache pool over a media directory
pub struct CachePool {
    inner: Arc<PoolInner>,
    period: Duration,
    timer: Option<thread::JoinHandle<()>>,
    shutdown: Option<Sender<()>>,
}

impl CachePool {
    /// Bind a pool to `root`. Call `init` before use.
    pub fn new(root: impl Into<PathBuf>, config: &Config) -> Result<Self> {
        config.validate()?;
        let root = root.into();
        fs::create_dir_all(&root)?;

        let capacity = config.cache_capacity_gb * K_GB;
        let water_mark = calc_water_mark(capacity, K_MAX_FREE_SPACE);
        // keep this relation: water_mark < risk_mark < capacity
        let risk_mark = capacity
            .saturating_sub(K_EVICTION_MARK)
            .max((water_mark + capacity) / 2);

        Ok(CachePool {
            inner: Arc::new(PoolInner {
                root,
                water_mark,
                risk_mark,
                disk_avail_target: config.disk_avail_bytes,
                refill_unit: config.refill_unit,
                delete_delay: config.delete_delay,
                state: Mutex::new(PoolState {
                    entries: HashMap::new(),
                    lru: LruList::new(),
                    total_used: 0,
                    is_full: false,
                }),
                eviction_guard: Mutex::new(()),
                exit: AtomicBool::new(false),
            }),
            period: config.eviction_period,
            timer: None,
            shutdown: None,
        })
    }

    /// Rebuild accounting from the media root and start the eviction timer
    pub fn init(&mut self) -> Result<()> {
        let root = self.inner.root.clone();
        self.inner.traverse_dir(&root)?;

        let (tx, rx) = bounded::<()>(0);
        let inner = Arc::clone(&self.inner);
        let period = self.period;
        let handle = thread::Builder::new()
            .name("strata-cache-evict".to_string())
            .spawn(move || loop {
                match rx.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => inner.force_recycle(),
                    _ => break,
                }
            })?;
        self.timer = Some(handle);
        self.shutdown = Some(tx);
        Ok(())
    }

    /// Look up or create the entry for `key` and open its media file
    pub fn open(&self, key: &str, create: bool) -> Result<CacheStore> {
        self.inner.do_open(key, create)
    }

    /// Kick one eviction pass if none is running
    pub fn force_recycle(&self) {
        self.inner.force_recycle()
    }

    /// Run eviction synchronously; `ResourceFull` when a full pass could not
    /// get usage back under the risk mark
    pub fn recycle_now(&self) -> Result<()> {
        self.inner.recycle_now()
    }

    pub fn is_full(&self) -> bool {
        self.inner.state.lock().is_full
    }

    pub fn total_used(&self) -> u64 {
        self.inner.state.lock().total_used
    }

    pub fn water_mark(&self) -> u64 {
        self.inner.water_mark
    }

    pub fn risk_mark(&self) -> u64 {
        self.inner.risk_mark
    }

    pub fn entry_count(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    /// Pool-wide stat is not provided at this level
    pub fn stat(&self) -> Result<CacheStat> {
        Err(StrataError::Unsupported("pool-wide stat"))
    }

    /// Targeted eviction of one file is not provided at this level
    pub fn evict_file(&self, _name: &str) -> Result<()> {
        Err(StrataError::Unsupported("evict by name"))
    }

    /// Eviction of a byte amount is not provided at this level
    pub fn evict_bytes(&self, _size: u64) -> Result<()> {
        Err(StrataError::Unsupported("evict by size"))
    }
}

impl Drop for CachePool {
    fn drop(&mut self) {
        self.inner.exit.store(true, Ordering::Relaxed);
        self.shutdown.take();
        if let Some(handle) = self.timer.take() {
            let _ = handle.join();
        }
    }
}

fn calc_water_mark(capacity: u64, max_free_space: u64) -> u64 {
    (capacity * K_WATER_MARK_RATIO / 100).max(capacity.saturating_sub(max_free_space))
}

// =============================================================================
// Pool Internals
// =============================================================================

impl PoolInner {
    pub(super) fn do_open(self: &Arc<Self>, key: &str, create: bool) -> Result<CacheStore> {
        if key.is_empty() {
            return Err(StrataError::invalid("empty cache key"));
        }
        let path = self.root.join(key);
        if create {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(&path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StrataError::NotFound(key.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let lock = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let entry = state
                .entries
                .entry(key.to_string())
                .or_insert_with(|| LruEntry {
                    tick: CLEARED,
                    open_count: 0,
                    size: 0,
                    lock: Arc::new(RwLock::new(())),
                });
            entry.tick = if entry.tick == CLEARED {
                state.lru.push_front(key)
            } else {
                state.lru.touch(entry.tick, key)
            };
            entry.open_count += 1;
            entry.lock.clone()
        };

        Ok(CacheStore::new(
            Arc::clone(self),
            key.to_string(),
            file,
            lock,
            self.refill_unit,
        ))
    }

    /// Move `key` to the recent end, reviving cleared entries
    pub(super) fn touch(&self, key: &str) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(entry) = state.entries.get_mut(key) {
            entry.tick = if entry.tick == CLEARED {
                state.lru.push_front(key)
            } else {
                state.lru.touch(entry.tick, key)
            };
        }
    }

    pub(super) fn release(&self, key: &str) {
        let mut guard = self.state.lock();
        if let Some(entry) = guard.entries.get_mut(key) {
            entry.open_count = entry.open_count.saturating_sub(1);
        }
    }

    /// Account a refill that grew `key` to `new_size`. Crossing the risk
    /// mark triggers a synchronous recycle; the refill itself stands.
    pub(super) fn update_space(&self, key: &str, new_size: u64) {
        let over = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(entry) = state.entries.get_mut(key) else {
                return;
            };
            if new_size > entry.size {
                state.total_used += new_size - entry.size;
            }
            entry.size = new_size;
            if state.total_used >= self.risk_mark {
                state.is_full = true;
                true
            } else {
                false
            }
        };
        if over {
            tracing::warn!(
                key,
                "refill pushed cache over risk mark, recycling synchronously"
            );
            if let Err(e) = self.recycle_now() {
                tracing::warn!("synchronous recycle fell short: {}", e);
            }
        }
    }

    /// Full-file eviction of one entry, initiated by its store
    pub(super) fn evict_entry(&self, key: &str) -> Result<()> {
        let lock = {
            let guard = self.state.lock();
            match guard.entries.get(key) {
                Some(entry) => entry.lock.clone(),
                None => return Err(StrataError::NotFound(key.to_string())),
            }
        };
        {
            let _w = lock.write();
            truncate_media(&self.root.join(key))?;
        }
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(entry) = state.entries.get_mut(key) {
            state.total_used = state.total_used.saturating_sub(entry.size);
            entry.size = 0;
        }
        Ok(())
    }

    pub(super) fn force_recycle(&self) {
        if let Some(_guard) = self.eviction_guard.try_lock() {
            self.eviction();
        }
    }

    pub(super) fn recycle_now(&self) -> Result<()> {
        if let Some(_guard) = self.eviction_guard.try_lock() {
            self.eviction();
        } else {
            // someone else is already evicting
            return Ok(());
        }
        let state = self.state.lock();
        if state.total_used >= self.risk_mark {
            return Err(StrataError::ResourceFull {
                used: state.total_used,
                risk_mark: self.risk_mark,
            });
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Eviction
    // -------------------------------------------------------------------------

    fn eviction(&self) {
        self.eviction_pass();
        self.state.lock().is_full = false;
    }

    fn eviction_pass(&self) {
        let evict_by_disk = match nix::sys::statvfs::statvfs(self.root.as_path()) {
            Ok(st) => {
                let frsize = st.fragment_size() as u64;
                let capacity = frsize * st.blocks() as u64;
                let avail = frsize * st.blocks_available() as u64;
                if avail < self.disk_avail_target {
                    self.disk_avail_target - avail
                } else if capacity <= self.water_mark {
                    // the pool owns the whole disk
                    return;
                } else {
                    0
                }
            }
            Err(e) => {
                tracing::error!("statvfs failed on {:?}: {}", self.root, e);
                return;
            }
        };

        let evict_by_cache = self
            .state
            .lock()
            .total_used
            .saturating_sub(self.water_mark);
        let mut target = evict_by_cache.max(evict_by_disk);
        if target == 0 {
            return;
        }

        self.state.lock().is_full = true;
        tracing::info!(target, "eviction pass started");

        let mut stalled = 0usize;
        while target > 0 && !self.exit.load(Ordering::Relaxed) {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some((tick, key)) = state.lru.back().map(|(t, k)| (t, k.to_string())) else {
                break;
            };
            let lru_len = state.lru.len();
            let entry = state.entries.get_mut(&key).expect("lru entry without index");
            let size = entry.size;
            let open_count = entry.open_count;

            if open_count == 0 {
                state.lru.remove(tick);
                entry.tick = CLEARED;
            } else {
                // live openers keep the file resident in the recency order
                entry.tick = state.lru.touch(tick, &key);
            }

            if size == 0 {
                let mut unlink = None;
                if open_count == 0 {
                    state.entries.remove(&key);
                    unlink = Some(self.root.join(&key));
                }
                drop(guard);
                if let Some(path) = unlink {
                    remove_media(&path);
                }
                stalled += 1;
                if stalled > lru_len {
                    break;
                }
                thread::sleep(self.delete_delay);
                continue;
            }

            let lock = entry.lock.clone();
            drop(guard);

            let res = {
                let _w = lock.write();
                truncate_media(&self.root.join(&key))
            };
            match res {
                Ok(()) => {
                    let mut unlink = None;
                    {
                        let mut guard = self.state.lock();
                        let state = &mut *guard;
                        if let Some(entry) = state.entries.get_mut(&key) {
                            state.total_used = state.total_used.saturating_sub(size);
                            entry.size = 0;
                            if entry.open_count == 0 {
                                if entry.tick != CLEARED {
                                    state.lru.remove(entry.tick);
                                }
                                state.entries.remove(&key);
                                unlink = Some(self.root.join(&key));
                            }
                        }
                    }
                    if let Some(path) = unlink {
                        remove_media(&path);
                    }
                    target = target.saturating_sub(size);
                    stalled = 0;
                }
                Err(e) => {
                    tracing::error!(key = %key, "truncate failed during eviction: {}", e);
                    stalled += 1;
                    if stalled > lru_len {
                        break;
                    }
                }
            }
            thread::sleep(self.delete_delay);
        }
    }

    // -------------------------------------------------------------------------
    // Startup Scan
    // -------------------------------------------------------------------------

    /// Walk the media root and seed accounting; no metadata files exist
    fn traverse_dir(&self, dir: &Path) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let ftype = entry.file_type()?;
            if ftype.is_dir() {
                self.traverse_dir(&entry.path())?;
            } else if ftype.is_file() {
                self.insert_file(&entry.path());
            }
        }
        Ok(())
    }

    fn insert_file(&self, path: &Path) {
        use std::os::unix::fs::MetadataExt;

        let md = match fs::metadata(path) {
            Ok(md) => md,
            Err(e) => {
                tracing::error!("stat failed for {:?}: {}", path, e);
                return;
            }
        };
        let size = md.blocks() * K_DISK_BLOCK_SIZE;
        let key = match path.strip_prefix(&self.root) {
            Ok(rel) => rel.to_string_lossy().into_owned(),
            Err(_) => return,
        };

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let tick = state.lru.push_front(&key);
        state.entries.insert(
            key,
            LruEntry {
                tick,
                open_count: 0,
                size,
                lock: Arc::new(RwLock::new(())),
            },
        );
        state.total_used += size;
    }
}

/// Truncate a media file to zero; a vanished file counts as done
fn truncate_media(path: &Path) -> Result<()> {
    match OpenOptions::new().write(true).open(path) {
        Ok(f) => {
            f.set_len(0)?;
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Unlink a media file, logging anything but a vanished file
fn remove_media(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != ErrorKind::NotFound {
            tracing::error!("unlink failed for {:?}: {}", path, e);
        }
    }
}
