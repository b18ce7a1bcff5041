//! Registry: which keys are cached for readers and which are held by writers.
//!
//! Every key maps to at most one slot:
//!
//! ```text
//!            open_reader (first)         open_reader (later)
//!   (none) ----------------------> Opening -----> Reader(cache) <--+ ref_count += 1
//!     ^                                             |             |
//!     |  close_writer                  open_writer, |             |
//!     |                                ref_count==0 v             |
//!   Writer(lease) <--------------------------- Closing            |
//!     ^                free_and_teardown done                     |
//!     +-- open_writer on (none)                                   |
//! ```
//!
//! Readers block while the slot is `Opening`, `Closing` or `Writer`. Writers
//! block while it is `Opening`, `Closing`, `Writer`, or a `Reader` with live
//! references. A single mutex guards the whole table and one condvar wakes
//! every waiter on any transition; each waiter re-checks its own key. There
//! is no FIFO ordering among waiters.
//!
//! Slow work (running the source factory, a synchronous load, tearing a cache
//! down) happens outside the lock while the key sits in `Opening` or
//! `Closing`.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::{Arc, OnceLock};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{CacheConfig, LoadMode};
use crate::error::{CacheError, Result};
use crate::handle::{CachedReader, CachedWriter};
use crate::key::ResourceKey;
use crate::loader::LoadPool;
use crate::resource::ResourceCache;
use crate::stats::{RegistryStats, ResourceStats};

enum Slot {
    Opening,
    Reader(Arc<ResourceCache>),
    Closing,
    Writer(Uuid),
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Slot::Opening => f.write_str("Opening"),
            Slot::Reader(cache) => write!(f, "Reader(ref_count={})", cache.ref_count()),
            Slot::Closing => f.write_str("Closing"),
            Slot::Writer(lease) => write!(f, "Writer({lease})"),
        }
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    slots: HashMap<ResourceKey, Slot>,
    shutdown: bool,
}

pub(crate) struct RegistryInner {
    state: Mutex<RegistryState>,
    changed: Condvar,
    pool: LoadPool,
    config: CacheConfig,
}

impl RegistryInner {
    fn wait(&self, state: &mut MutexGuard<'_, RegistryState>) {
        self.changed.wait(state);
    }

    /// Release one reader reference; wakes waiters when it was the last one.
    pub(crate) fn release_reader(&self, cache: &ResourceCache) -> Result<()> {
        let reached_zero = cache.release()?;
        debug!(key = %cache.key(), ref_count = cache.ref_count(), "reader closed");
        if reached_zero {
            // Taking the lock orders this wake-up after any writer's check.
            let _state = self.state.lock();
            self.changed.notify_all();
        }
        Ok(())
    }

    /// Drop the writer lease `lease` on `key` and wake every waiter.
    pub(crate) fn release_writer(&self, key: &ResourceKey, lease: Uuid) -> Result<()> {
        let mut state = self.state.lock();
        match state.slots.get(key) {
            Some(Slot::Writer(held)) if *held == lease => {
                state.slots.remove(key);
                self.changed.notify_all();
                info!(%key, %lease, "writer lease released");
                Ok(())
            }
            other => {
                let found = format!("{other:?}");
                drop(state);
                Err(CacheError::invariant(format!(
                    "writer lease {lease} for {key} not held (slot: {found})"
                )))
            }
        }
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        for slot in self.state.get_mut().slots.values() {
            if let Slot::Reader(cache) = slot {
                cache.cancel_load(&self.pool);
            }
        }
    }
}

/// Removes an `Opening` slot if construction unwinds before completing.
struct OpeningGuard<'a> {
    inner: &'a RegistryInner,
    key: &'a ResourceKey,
    armed: bool,
}

impl Drop for OpeningGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.inner.state.lock();
            state.slots.remove(self.key);
            self.inner.changed.notify_all();
        }
    }
}

/// Table of cached resources and writer leases.
///
/// Cloning is cheap and yields a handle on the same table.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    /// Create a registry with its own loader pool.
    pub fn new(config: CacheConfig) -> Self {
        let pool = LoadPool::new(config.max_concurrent_loads);
        Self {
            inner: Arc::new(RegistryInner {
                state: Mutex::new(RegistryState::default()),
                changed: Condvar::new(),
                pool,
                config,
            }),
        }
    }

    /// The process-wide registry, configured from the environment on first use.
    pub fn global() -> &'static Registry {
        static GLOBAL: OnceLock<Registry> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            let config = CacheConfig::from_env().unwrap_or_else(|e| {
                warn!(error = %e, "invalid cache configuration in environment, using defaults");
                CacheConfig::default()
            });
            Registry::new(config)
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Open a reader on `key` using the configured load mode.
    ///
    /// `factory` runs only if no cache exists for `key`. Blocks while a
    /// writer holds the key or a hand-off is in progress.
    pub fn open_reader<F, S>(&self, key: impl Into<ResourceKey>, factory: F) -> Result<CachedReader>
    where
        F: FnOnce() -> io::Result<S>,
        S: Read + Send + 'static,
    {
        self.open_reader_with_mode(key, self.inner.config.load_mode, factory)
    }

    /// Open a reader on `key`, loading with `mode` if a new cache is built.
    ///
    /// An existing cache keeps the mode it was created with.
    pub fn open_reader_with_mode<F, S>(
        &self,
        key: impl Into<ResourceKey>,
        mode: LoadMode,
        factory: F,
    ) -> Result<CachedReader>
    where
        F: FnOnce() -> io::Result<S>,
        S: Read + Send + 'static,
    {
        let key = key.into();
        let inner = &self.inner;

        let mut state = inner.state.lock();
        loop {
            if state.shutdown {
                return Err(CacheError::InterruptedWait { key });
            }
            match state.slots.get(&key) {
                None => break,
                Some(Slot::Reader(cache)) => {
                    cache.acquire();
                    debug!(%key, ref_count = cache.ref_count(), "reader attached to cached resource");
                    return Ok(CachedReader::new(inner.clone(), cache.clone()));
                }
                Some(Slot::Opening | Slot::Closing | Slot::Writer(_)) => inner.wait(&mut state),
            }
        }
        state.slots.insert(key.clone(), Slot::Opening);
        drop(state);

        let mut guard = OpeningGuard {
            inner,
            key: &key,
            armed: true,
        };
        let built = ResourceCache::open(key.clone(), factory, mode, inner.config.chunk_size, &inner.pool);

        let mut state = inner.state.lock();
        guard.armed = false;
        inner.changed.notify_all();
        match built {
            Ok(cache) => {
                let cache = Arc::new(cache);
                cache.acquire();
                state.slots.insert(key.clone(), Slot::Reader(cache.clone()));
                debug!(%key, %mode, "reader opened new resource cache");
                Ok(CachedReader::new(inner.clone(), cache))
            }
            Err(e) => {
                state.slots.remove(&key);
                Err(e)
            }
        }
    }

    /// Take the exclusive writer lease on `key`, writing through `sink`.
    ///
    /// Blocks until no other writer holds the key and every reader handle on
    /// it is closed. An idle reader cache is then torn down (its load
    /// canceled and its source closed) before the lease is granted.
    pub fn open_writer<W>(&self, key: impl Into<ResourceKey>, sink: W) -> Result<CachedWriter>
    where
        W: Write + Send + 'static,
    {
        let key = key.into();
        let inner = &self.inner;

        let mut state = inner.state.lock();
        let retired = loop {
            if state.shutdown {
                return Err(CacheError::InterruptedWait { key });
            }
            match state.slots.get(&key) {
                None => break None,
                Some(Slot::Reader(cache)) => {
                    let refs = cache.ref_count();
                    if refs < 0 {
                        return Err(CacheError::invariant(format!(
                            "ref count for {key} is negative ({refs})"
                        )));
                    }
                    if refs == 0 {
                        break Some(cache.clone());
                    }
                    inner.wait(&mut state);
                }
                Some(Slot::Opening | Slot::Closing | Slot::Writer(_)) => inner.wait(&mut state),
            }
        };

        if let Some(cache) = retired {
            state.slots.insert(key.clone(), Slot::Closing);
            drop(state);

            info!(%key, loaded = cache.loaded_len(), "tearing down reader cache for writer");
            cache.free_and_teardown(&inner.pool);
            drop(cache);

            state = inner.state.lock();
            match state.slots.get(&key) {
                Some(Slot::Closing) => {}
                other => {
                    let found = format!("{other:?}");
                    drop(state);
                    return Err(CacheError::invariant(format!(
                        "slot for {key} changed during teardown (slot: {found})"
                    )));
                }
            }
        }

        let lease = Uuid::new_v4();
        state.slots.insert(key.clone(), Slot::Writer(lease));
        inner.changed.notify_all();
        drop(state);

        info!(%key, %lease, "writer lease granted");
        Ok(CachedWriter::new(inner.clone(), key, lease, Box::new(sink)))
    }

    /// Fail every blocked and future open with [`CacheError::InterruptedWait`].
    ///
    /// Open handles keep working and may still be closed.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.shutdown = true;
        self.inner.changed.notify_all();
        info!(slots = state.slots.len(), "registry shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.state.lock().shutdown
    }

    /// Whether a reader-side cache is registered for `key`.
    pub fn is_cached(&self, key: &ResourceKey) -> bool {
        matches!(self.inner.state.lock().slots.get(key), Some(Slot::Reader(_)))
    }

    /// Whether a writer currently holds `key`.
    pub fn has_writer(&self, key: &ResourceKey) -> bool {
        matches!(self.inner.state.lock().slots.get(key), Some(Slot::Writer(_)))
    }

    /// Keys currently leased to writers.
    pub fn writer_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .slots
            .values()
            .filter(|slot| matches!(slot, Slot::Writer(_)))
            .count()
    }

    /// Live reader handles on `key`, if a cache is registered.
    pub fn ref_count(&self, key: &ResourceKey) -> Option<isize> {
        match self.inner.state.lock().slots.get(key) {
            Some(Slot::Reader(cache)) => Some(cache.ref_count()),
            _ => None,
        }
    }

    /// Reader caches, most recently accessed first.
    pub fn snapshot(&self) -> Vec<ResourceStats> {
        let state = self.inner.state.lock();
        let mut entries: Vec<ResourceStats> = state
            .slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Reader(cache) => Some(cache.stats()),
                _ => None,
            })
            .collect();
        drop(state);
        entries.sort_by(|a, b| b.last_access.cmp(&a.last_access));
        entries
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            loads_active: self.inner.pool.active(),
            loads_queued: self.inner.pool.queued(),
            ..RegistryStats::default()
        };
        let state = self.inner.state.lock();
        for slot in state.slots.values() {
            match slot {
                Slot::Opening => stats.opening += 1,
                Slot::Reader(_) => stats.readers += 1,
                Slot::Closing => stats.closing += 1,
                Slot::Writer(_) => stats.writers += 1,
            }
        }
        stats
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("config", &self.inner.config)
            .field("pool", &self.inner.pool)
            .finish()
    }
}
