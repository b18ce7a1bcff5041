//! Load supervision: pulling bytes from a source into a [`ChunkStore`].
//!
//! Synchronous loads call [`run_load`] on the opener's thread. Asynchronous
//! loads go through a [`LoadPool`], a bounded set of worker threads spawned on
//! demand. When every worker is busy further loads wait in a queue, so at most
//! `max_workers` transfer buffers and loader threads exist at once.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::key::ResourceKey;
use crate::store::ChunkStore;

/// Byte source handed to a loader.
pub type BoxedSource = Box<dyn Read + Send>;

/// Load `source` into `store` until EOF, a source error, or cancellation.
///
/// The source is dropped (closed) before the store is marked finished, so
/// anyone waiting on [`ChunkStore::wait_finished`] knows the source is gone.
pub fn run_load<R: Read>(key: &ResourceKey, store: &ChunkStore, mut source: R, chunk_size: usize) {
    let mut buf = vec![0u8; chunk_size];
    let mut loaded = 0usize;

    loop {
        if store.is_canceled() {
            debug!(%key, loaded, "load canceled");
            break;
        }
        match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                // The read may have blocked past a cancel; its bytes are discarded.
                if !store.append(&buf[..n]) {
                    debug!(%key, loaded, "load canceled during source read");
                    break;
                }
                loaded += n;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(%key, loaded, error = %e, "source read failed, ending load");
                break;
            }
        }
    }

    drop(source);
    store.finish();
    debug!(%key, loaded, chunks = store.chunk_count(), "load finished");
}

struct LoadJob {
    key: ResourceKey,
    store: Arc<ChunkStore>,
    source: BoxedSource,
    chunk_size: usize,
}

impl LoadJob {
    fn run(self) {
        run_load(&self.key, &self.store, self.source, self.chunk_size);
    }
}

#[derive(Default)]
struct PoolState {
    queue: VecDeque<LoadJob>,
    workers: usize,
    idle: usize,
    /// Idle workers already signalled for a queued job.
    wakeups: usize,
    shutdown: bool,
}

struct PoolInner {
    state: Mutex<PoolState>,
    work: Condvar,
    max_workers: usize,
}

/// Bounded pool of background loader threads.
pub struct LoadPool {
    inner: Arc<PoolInner>,
}

impl LoadPool {
    /// Create a pool that runs at most `max_workers` loads at once.
    pub fn new(max_workers: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState::default()),
                work: Condvar::new(),
                max_workers: max_workers.max(1),
            }),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.inner.max_workers
    }

    /// Number of worker threads currently running a load.
    pub fn active(&self) -> usize {
        let state = self.inner.state.lock();
        state.workers - state.idle
    }

    /// Loads waiting for a free worker.
    pub fn queued(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Queue a load of `source` into `store`.
    pub fn submit(&self, key: ResourceKey, store: Arc<ChunkStore>, source: BoxedSource, chunk_size: usize) {
        let job = LoadJob {
            key,
            store,
            source,
            chunk_size,
        };

        let mut state = self.inner.state.lock();
        state.queue.push_back(job);
        if state.idle > state.wakeups {
            state.wakeups += 1;
            self.inner.work.notify_one();
            return;
        }
        if state.workers >= self.inner.max_workers {
            return;
        }

        state.workers += 1;
        let worker_id = state.workers;
        drop(state);

        let inner = self.inner.clone();
        let spawned = thread::Builder::new()
            .name(format!("streamcache-load-{worker_id}"))
            .spawn(move || worker_loop(&inner));

        if let Err(e) = spawned {
            warn!(error = %e, "failed to spawn loader thread, loading inline");
            let orphaned: Vec<LoadJob> = {
                let mut state = self.inner.state.lock();
                state.workers -= 1;
                if state.workers == 0 {
                    state.queue.drain(..).collect()
                } else {
                    Vec::new()
                }
            };
            for job in orphaned {
                job.run();
            }
        }
    }

    /// Drop any queued load for `store` and mark the store finished.
    ///
    /// A load already picked up by a worker is left to notice the store's
    /// cancel flag. Returns whether a queued job was removed.
    pub fn cancel(&self, store: &Arc<ChunkStore>) -> bool {
        let removed: Vec<LoadJob> = {
            let mut state = self.inner.state.lock();
            let (matching, rest): (VecDeque<LoadJob>, VecDeque<LoadJob>) = state
                .queue
                .drain(..)
                .partition(|job| Arc::ptr_eq(&job.store, store));
            state.queue = rest;
            matching.into()
        };
        if removed.is_empty() {
            return false;
        }
        for job in removed {
            debug!(key = %job.key, "queued load dropped");
            let LoadJob { store, source, .. } = job;
            drop(source);
            store.finish();
        }
        true
    }
}

fn worker_loop(inner: &PoolInner) {
    let mut state = inner.state.lock();
    loop {
        if let Some(job) = state.queue.pop_front() {
            drop(state);
            job.run();
            state = inner.state.lock();
            continue;
        }
        if state.shutdown {
            state.workers -= 1;
            return;
        }
        state.idle += 1;
        inner.work.wait(&mut state);
        state.idle -= 1;
        state.wakeups = state.wakeups.saturating_sub(1);
    }
}

impl Drop for LoadPool {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.shutdown = true;
        self.inner.work.notify_all();
    }
}

impl std::fmt::Debug for LoadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("LoadPool")
            .field("max_workers", &self.inner.max_workers)
            .field("workers", &state.workers)
            .field("idle", &state.idle)
            .field("queued", &state.queue.len())
            .finish()
    }
}
