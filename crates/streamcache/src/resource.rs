//! ResourceCache: one loaded (or loading) resource shared by many readers.
//!
//! A cache owns its [`ChunkStore`] and the load that fills it. Readers never
//! share positions: each brings its own [`ReadCursor`], and the cache only
//! translates cursor positions into store offsets.
//!
//! The reference count tracks live reader handles. Reaching zero does not
//! free anything; only a writer hand-off calls [`ResourceCache::free_and_teardown`].

use std::io::{self, Read};
use std::sync::atomic::{AtomicI64, AtomicIsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, warn};

use crate::config::LoadMode;
use crate::error::{CacheError, Result};
use crate::handle::ReadCursor;
use crate::key::ResourceKey;
use crate::loader::{run_load, LoadPool};
use crate::stats::ResourceStats;
use crate::store::{ChunkStore, ReadOutcome};

#[derive(Debug)]
pub struct ResourceCache {
    key: ResourceKey,
    store: Arc<ChunkStore>,
    mode: LoadMode,
    ref_count: AtomicIsize,
    /// Milliseconds since the Unix epoch.
    last_access: AtomicI64,
}

impl ResourceCache {
    /// Obtain the source from `factory` and start loading it.
    ///
    /// The factory always runs on the calling thread so its failure reaches
    /// the opener. In [`LoadMode::Sync`] the whole source is loaded before
    /// this returns; in [`LoadMode::Async`] the load is queued on `pool`.
    pub(crate) fn open<F, S>(
        key: ResourceKey,
        factory: F,
        mode: LoadMode,
        chunk_size: usize,
        pool: &LoadPool,
    ) -> Result<Self>
    where
        F: FnOnce() -> io::Result<S>,
        S: Read + Send + 'static,
    {
        let source = factory().map_err(|source| {
            warn!(%key, error = %source, "source factory failed");
            CacheError::SourceCreation {
                key: key.clone(),
                source,
            }
        })?;

        let store = Arc::new(ChunkStore::new());
        match mode {
            LoadMode::Sync => run_load(&key, &store, source, chunk_size),
            LoadMode::Async => pool.submit(key.clone(), store.clone(), Box::new(source), chunk_size),
        }
        debug!(%key, %mode, "resource cache created");

        Ok(Self {
            key,
            store,
            mode,
            ref_count: AtomicIsize::new(0),
            last_access: AtomicI64::new(Utc::now().timestamp_millis()),
        })
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn load_mode(&self) -> LoadMode {
        self.mode
    }

    pub fn ref_count(&self) -> isize {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Bytes loaded so far.
    pub fn loaded_len(&self) -> usize {
        self.store.len()
    }

    pub fn is_fully_loaded(&self) -> bool {
        self.store.is_finished()
    }

    pub(crate) fn acquire(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
        self.touch();
    }

    /// Drop one reference. Returns `true` when the count reached zero.
    pub(crate) fn release(&self) -> Result<bool> {
        let previous = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        if previous <= 0 {
            self.ref_count.fetch_add(1, Ordering::AcqRel);
            return Err(CacheError::invariant(format!(
                "ref count for {} went negative ({})",
                self.key,
                previous - 1
            )));
        }
        Ok(previous == 1)
    }

    pub fn touch(&self) {
        self.last_access
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_access(&self) -> DateTime<Utc> {
        let millis = self.last_access.load(Ordering::Relaxed);
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or_else(Utc::now)
    }

    /// Read at `cursor`, advancing it by the number of bytes copied.
    pub fn read(
        &self,
        buf: &mut [u8],
        offset: usize,
        len: usize,
        cursor: &mut ReadCursor,
        blocking: bool,
    ) -> Result<ReadOutcome> {
        let outcome = self.read_at(buf, offset, len, cursor.position(), blocking)?;
        if let ReadOutcome::Bytes(n) = outcome {
            cursor.advance(n);
        }
        Ok(outcome)
    }

    /// Read at an absolute stream position without any cursor.
    pub fn read_at(
        &self,
        buf: &mut [u8],
        offset: usize,
        len: usize,
        position: usize,
        blocking: bool,
    ) -> Result<ReadOutcome> {
        let outcome = self.store.read(buf, offset, len, position, blocking)?;
        if len > 0 {
            self.touch();
        }
        Ok(outcome)
    }

    /// Blocking single-byte read. `None` at end of stream.
    ///
    /// Fine for the occasional byte; use [`ResourceCache::read`] for anything more.
    pub fn read_byte(&self, cursor: &mut ReadCursor) -> Result<Option<u8>> {
        let mut byte = [0u8; 1];
        match self.read(&mut byte, 0, 1, cursor, true)? {
            ReadOutcome::Bytes(1) => Ok(Some(byte[0])),
            _ => Ok(None),
        }
    }

    /// Advance `cursor` by up to `len` bytes, never past what is loaded.
    pub fn skip(&self, len: usize, cursor: &mut ReadCursor) -> usize {
        let skipped = cursor.possible_read_len(len, self.store.len());
        cursor.advance(skipped);
        skipped
    }

    /// Bytes readable at `cursor` without blocking.
    pub fn available(&self, cursor: &ReadCursor) -> usize {
        self.store.len().saturating_sub(cursor.position())
    }

    /// Cancel the load and wait until the source has been closed.
    ///
    /// A load still queued on `pool` is dropped there, so this never waits
    /// behind other keys' loads.
    pub(crate) fn free_and_teardown(&self, pool: &LoadPool) {
        self.cancel_load(pool);
        self.store.wait_finished();
        debug!(key = %self.key, loaded = self.store.len(), "resource cache torn down");
    }

    /// Stop loading without waiting.
    pub(crate) fn cancel_load(&self, pool: &LoadPool) {
        self.store.cancel();
        pool.cancel(&self.store);
    }

    pub fn stats(&self) -> ResourceStats {
        ResourceStats {
            key: self.key.clone(),
            ref_count: self.ref_count() as i64,
            loaded_bytes: self.store.len() as u64,
            chunks: self.store.chunk_count() as u64,
            finished: self.store.is_finished(),
            load_mode: self.mode,
            last_access: self.last_access(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sync_cache(data: &'static [u8]) -> ResourceCache {
        let pool = LoadPool::new(1);
        ResourceCache::open(
            ResourceKey::new("test"),
            move || Ok(Cursor::new(data)),
            LoadMode::Sync,
            4,
            &pool,
        )
        .unwrap()
    }

    #[test]
    fn test_sync_open_loads_everything() {
        let cache = sync_cache(b"0123456789");
        assert!(cache.is_fully_loaded());
        assert_eq!(cache.loaded_len(), 10);
        assert_eq!(cache.ref_count(), 0);
        assert_eq!(cache.load_mode(), LoadMode::Sync);
    }

    #[test]
    fn test_factory_failure() {
        let pool = LoadPool::new(1);
        let result = ResourceCache::open(
            ResourceKey::new("missing"),
            || -> io::Result<Cursor<Vec<u8>>> { Err(io::Error::new(io::ErrorKind::NotFound, "nope")) },
            LoadMode::Async,
            4,
            &pool,
        );
        match result {
            Err(CacheError::SourceCreation { key, source }) => {
                assert_eq!(key.as_str(), "missing");
                assert_eq!(source.kind(), io::ErrorKind::NotFound);
            }
            other => panic!("expected SourceCreation, got {other:?}"),
        }
    }

    #[test]
    fn test_read_advances_cursor() -> Result<()> {
        let cache = sync_cache(b"0123456789");
        let mut cursor = ReadCursor::new();
        let mut buf = [0u8; 6];

        assert_eq!(cache.read(&mut buf, 0, 6, &mut cursor, true)?, ReadOutcome::Bytes(6));
        assert_eq!(cursor.position(), 6);
        assert_eq!(cache.read(&mut buf, 0, 6, &mut cursor, true)?, ReadOutcome::Bytes(4));
        assert_eq!(&buf[..4], b"6789");
        assert_eq!(cursor.position(), 10);
        assert_eq!(cache.read(&mut buf, 0, 6, &mut cursor, true)?, ReadOutcome::EndOfStream);
        assert_eq!(cursor.position(), 10);
        Ok(())
    }

    #[test]
    fn test_zero_length_read_leaves_cursor() -> Result<()> {
        let cache = sync_cache(b"abc");
        let mut cursor = ReadCursor::at(1);
        let mut buf = [0u8; 1];
        assert_eq!(cache.read(&mut buf, 0, 0, &mut cursor, true)?, ReadOutcome::Bytes(0));
        assert_eq!(cursor.position(), 1);
        Ok(())
    }

    #[test]
    fn test_read_byte() -> Result<()> {
        let cache = sync_cache(b"xy");
        let mut cursor = ReadCursor::new();
        assert_eq!(cache.read_byte(&mut cursor)?, Some(b'x'));
        assert_eq!(cache.read_byte(&mut cursor)?, Some(b'y'));
        assert_eq!(cache.read_byte(&mut cursor)?, None);
        Ok(())
    }

    #[test]
    fn test_skip_is_clamped() {
        let cache = sync_cache(b"0123456789");
        let mut cursor = ReadCursor::new();
        assert_eq!(cache.skip(4, &mut cursor), 4);
        assert_eq!(cache.available(&cursor), 6);
        assert_eq!(cache.skip(100, &mut cursor), 6);
        assert_eq!(cursor.position(), 10);
        assert_eq!(cache.skip(1, &mut cursor), 0);
        assert_eq!(cache.available(&cursor), 0);
    }

    #[test]
    fn test_release_below_zero_is_invariant_violation() {
        let cache = sync_cache(b"a");
        cache.acquire();
        assert!(cache.release().unwrap());
        assert!(matches!(cache.release(), Err(CacheError::InvariantViolation(_))));
        assert_eq!(cache.ref_count(), 0);

        // The count is still usable after the failed release.
        cache.acquire();
        assert_eq!(cache.ref_count(), 1);
        assert!(cache.release().unwrap());
    }

    #[test]
    fn test_teardown_waits_for_async_load() {
        let pool = LoadPool::new(1);
        let cache = ResourceCache::open(
            ResourceKey::new("big"),
            || Ok(Cursor::new(vec![0u8; 1 << 20])),
            LoadMode::Async,
            64,
            &pool,
        )
        .unwrap();

        cache.free_and_teardown(&pool);
        assert!(cache.is_fully_loaded());
        assert!(cache.loaded_len() <= 1 << 20);
    }

    #[test]
    fn test_teardown_drops_queued_load() {
        let pool = LoadPool::new(1);
        let (gate, blocks) = std::sync::mpsc::channel::<()>();
        let busy = ResourceCache::open(
            ResourceKey::new("busy"),
            move || Ok(BlockedSource(blocks)),
            LoadMode::Async,
            16,
            &pool,
        )
        .unwrap();
        while pool.queued() > 0 {
            std::thread::yield_now();
        }
        let queued = ResourceCache::open(
            ResourceKey::new("queued"),
            || Ok(Cursor::new(vec![1u8; 64])),
            LoadMode::Async,
            16,
            &pool,
        )
        .unwrap();
        assert_eq!(pool.queued(), 1);

        queued.free_and_teardown(&pool);
        assert!(queued.is_fully_loaded());
        assert_eq!(queued.loaded_len(), 0);
        assert_eq!(pool.queued(), 0);
        assert!(!busy.is_fully_loaded());

        drop(gate);
        busy.free_and_teardown(&pool);
        assert!(busy.is_fully_loaded());
    }

    /// Blocks in `read` until its sender is dropped.
    struct BlockedSource(std::sync::mpsc::Receiver<()>);

    impl Read for BlockedSource {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            let _ = self.0.recv();
            Ok(0)
        }
    }

    #[test]
    fn test_stats_reflect_state() {
        let cache = sync_cache(b"abcdefgh");
        cache.acquire();
        let stats = cache.stats();
        assert_eq!(stats.key.as_str(), "test");
        assert_eq!(stats.ref_count, 1);
        assert_eq!(stats.loaded_bytes, 8);
        assert_eq!(stats.chunks, 2);
        assert!(stats.finished);
    }
}
