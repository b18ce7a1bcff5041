//! ChunkStore: the bytes of one resource loaded so far.
//!
//! The store is an append-only list of immutable chunks. A loader appends
//! chunks as it pulls bytes from the source while any number of readers copy
//! out of the already appended chunks at arbitrary offsets.
//!
//! Layout for a 10000 byte resource loaded with 4096 byte reads:
//! ```text
//! chunks:  [0 ........ 4096)[4096 ..... 8192)[8192 .. 10000)
//! loaded_len = 10000, finished = true
//! ```
//!
//! Chunk boundaries follow whatever the source returned per read, so a slow
//! source yields many small chunks. Chunk coverage is always gapless.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::error::{CacheError, Result};

/// Immutable contiguous run of bytes starting at `start` in the stream.
#[derive(Debug, Clone)]
pub struct Chunk {
    start: usize,
    data: Bytes,
}

impl Chunk {
    /// Position of the first byte of this chunk in the stream.
    pub fn start(&self) -> usize {
        self.start
    }

    /// One past the position of the last byte.
    pub fn end(&self) -> usize {
        self.start + self.data.len()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

/// Result of a read against a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// This many bytes were copied. Zero only for a zero-length request.
    Bytes(usize),
    /// Nothing loaded at this position yet, and the read was non-blocking.
    NotYet,
    /// The position is at or past the end of a fully loaded resource.
    EndOfStream,
}

impl ReadOutcome {
    /// Number of bytes copied, zero for `NotYet` and `EndOfStream`.
    pub fn bytes(&self) -> usize {
        match self {
            ReadOutcome::Bytes(n) => *n,
            _ => 0,
        }
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, ReadOutcome::EndOfStream)
    }

    /// Classic stream sentinel: byte count, `0` for "not yet", `-1` for EOF.
    pub fn as_sentinel(&self) -> i64 {
        match self {
            ReadOutcome::Bytes(n) => *n as i64,
            ReadOutcome::NotYet => 0,
            ReadOutcome::EndOfStream => -1,
        }
    }
}

#[derive(Debug, Default)]
struct StoreState {
    chunks: Vec<Chunk>,
    loaded_len: usize,
    finished: bool,
}

/// Growing, offset-ordered collection of chunks for one resource.
#[derive(Debug, Default)]
pub struct ChunkStore {
    state: Mutex<StoreState>,
    changed: Condvar,
    canceled: AtomicBool,
}

impl ChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes loaded so far.
    pub fn len(&self) -> usize {
        self.state.lock().loaded_len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether loading has stopped (EOF, error or cancellation).
    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    pub fn chunk_count(&self) -> usize {
        self.state.lock().chunks.len()
    }

    /// Append a copy of `data` as a new chunk and wake blocked readers.
    ///
    /// Returns `false` without storing anything once the store is canceled or
    /// finished.
    pub fn append(&self, data: &[u8]) -> bool {
        if data.is_empty() {
            return true;
        }
        let mut state = self.state.lock();
        if state.finished || self.is_canceled() {
            return false;
        }
        let chunk = Chunk {
            start: state.loaded_len,
            data: Bytes::copy_from_slice(data),
        };
        state.loaded_len += data.len();
        state.chunks.push(chunk);
        self.changed.notify_all();
        true
    }

    /// Mark loading as over and release everyone waiting on the store.
    pub fn finish(&self) {
        let mut state = self.state.lock();
        state.finished = true;
        self.changed.notify_all();
    }

    /// Ask the loader to stop at its next opportunity.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    /// Block until the store is finished.
    pub fn wait_finished(&self) {
        let mut state = self.state.lock();
        while !state.finished {
            self.changed.wait(&mut state);
        }
    }

    /// Copy up to `len` bytes starting at stream `position` into
    /// `buf[offset..offset + len]`.
    ///
    /// Never reads past what is currently loaded. When `blocking` is set and
    /// nothing is loaded at `position`, waits until bytes arrive or loading
    /// ends.
    pub fn read(
        &self,
        buf: &mut [u8],
        offset: usize,
        len: usize,
        position: usize,
        blocking: bool,
    ) -> Result<ReadOutcome> {
        let in_bounds = offset
            .checked_add(len)
            .is_some_and(|end| end <= buf.len());
        if !in_bounds {
            return Err(CacheError::InvalidArgument {
                offset,
                len,
                buf_len: buf.len(),
            });
        }
        if len == 0 {
            return Ok(ReadOutcome::Bytes(0));
        }

        let mut state = self.state.lock();
        if position >= state.loaded_len {
            if state.finished {
                return Ok(ReadOutcome::EndOfStream);
            }
            if !blocking {
                return Ok(ReadOutcome::NotYet);
            }
            while position >= state.loaded_len && !state.finished {
                self.changed.wait(&mut state);
            }
            if position >= state.loaded_len {
                return Ok(ReadOutcome::EndOfStream);
            }
        }

        let want = len.min(state.loaded_len - position);
        let range_end = position + want;
        let first = state.chunks.partition_point(|c| c.end() <= position);
        let overlapping: Vec<Chunk> = state.chunks[first..]
            .iter()
            .take_while(|c| c.start < range_end)
            .cloned()
            .collect();
        drop(state);

        let mut copied = 0;
        for chunk in &overlapping {
            let from = position + copied - chunk.start;
            let take = (chunk.len() - from).min(want - copied);
            let dest = offset + copied;
            buf[dest..dest + take].copy_from_slice(&chunk.data[from..from + take]);
            copied += take;
        }
        debug_assert_eq!(copied, want);

        Ok(ReadOutcome::Bytes(copied))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn store_with(parts: &[&[u8]], finished: bool) -> ChunkStore {
        let store = ChunkStore::new();
        for part in parts {
            assert!(store.append(part));
        }
        if finished {
            store.finish();
        }
        store
    }

    #[test]
    fn test_append_tracks_offsets() {
        let store = store_with(&[b"abc", b"defg", b"h"], false);
        assert_eq!(store.len(), 8);
        assert_eq!(store.chunk_count(), 3);

        let state = store.state.lock();
        let starts: Vec<usize> = state.chunks.iter().map(Chunk::start).collect();
        assert_eq!(starts, vec![0, 3, 7]);
        assert_eq!(state.chunks[1].end(), 7);
    }

    #[test]
    fn test_read_across_chunks() -> Result<()> {
        let store = store_with(&[b"hello ", b"cached ", b"world"], true);
        let mut buf = [0u8; 12];
        let outcome = store.read(&mut buf, 2, 10, 3, true)?;
        assert_eq!(outcome, ReadOutcome::Bytes(10));
        assert_eq!(&buf[2..], b"lo cached ");
        assert_eq!(&buf[..2], &[0, 0]);
        Ok(())
    }

    #[test]
    fn test_read_clamps_to_loaded() -> Result<()> {
        let store = store_with(&[b"0123456789"], false);
        let mut buf = [0u8; 32];
        assert_eq!(store.read(&mut buf, 0, 32, 6, false)?, ReadOutcome::Bytes(4));
        assert_eq!(&buf[..4], b"6789");
        Ok(())
    }

    #[test]
    fn test_eof_is_idempotent() -> Result<()> {
        let store = store_with(&[b"data"], true);
        let mut buf = [0u8; 4];
        for _ in 0..5 {
            assert_eq!(store.read(&mut buf, 0, 4, 4, true)?, ReadOutcome::EndOfStream);
            assert_eq!(store.read(&mut buf, 0, 4, 100, false)?, ReadOutcome::EndOfStream);
        }
        Ok(())
    }

    #[test]
    fn test_non_blocking_read_before_finish() -> Result<()> {
        let store = store_with(&[b"data"], false);
        let mut buf = [0u8; 4];
        assert_eq!(store.read(&mut buf, 0, 4, 4, false)?, ReadOutcome::NotYet);
        assert_eq!(ReadOutcome::NotYet.as_sentinel(), 0);
        Ok(())
    }

    #[test]
    fn test_zero_length_read() -> Result<()> {
        let store = ChunkStore::new();
        let mut buf = [0u8; 4];
        assert_eq!(store.read(&mut buf, 0, 0, 4521, true)?, ReadOutcome::Bytes(0));
        assert_eq!(store.read(&mut buf, 4, 0, 0, true)?, ReadOutcome::Bytes(0));
        Ok(())
    }

    #[test]
    fn test_invalid_arguments() {
        let store = store_with(&[b"data"], true);
        let mut buf = [0u8; 4];
        assert!(matches!(
            store.read(&mut buf, 2, 3, 0, true),
            Err(CacheError::InvalidArgument { offset: 2, len: 3, buf_len: 4 })
        ));
        assert!(matches!(
            store.read(&mut buf, usize::MAX, 2, 0, true),
            Err(CacheError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_blocking_read_wakes_on_append() {
        let store = Arc::new(ChunkStore::new());

        let reader = {
            let store = store.clone();
            thread::spawn(move || {
                let mut buf = [0u8; 8];
                let outcome = store.read(&mut buf, 0, 8, 0, true).unwrap();
                (outcome, buf)
            })
        };

        thread::sleep(Duration::from_millis(50));
        store.append(b"late");

        let (outcome, buf) = reader.join().unwrap();
        assert_eq!(outcome, ReadOutcome::Bytes(4));
        assert_eq!(&buf[..4], b"late");
    }

    #[test]
    fn test_blocking_read_released_by_finish() {
        let store = Arc::new(store_with(&[b"ab"], false));

        let reader = {
            let store = store.clone();
            thread::spawn(move || {
                let mut buf = [0u8; 2];
                store.read(&mut buf, 0, 2, 2, true).unwrap()
            })
        };

        thread::sleep(Duration::from_millis(50));
        store.finish();
        assert_eq!(reader.join().unwrap(), ReadOutcome::EndOfStream);
    }

    #[test]
    fn test_cancel_rejects_append() {
        let store = store_with(&[b"kept"], false);
        store.cancel();
        assert!(store.is_canceled());
        assert!(!store.append(b"dropped"));
        assert_eq!(store.len(), 4);
    }

    #[test]
    fn test_append_after_finish_rejected() {
        let store = store_with(&[b"kept"], true);
        assert!(!store.append(b"more"));
        assert_eq!(store.len(), 4);
    }

    #[test]
    fn test_wait_finished_returns_after_finish() {
        let store = Arc::new(ChunkStore::new());
        let waiter = {
            let store = store.clone();
            thread::spawn(move || store.wait_finished())
        };
        thread::sleep(Duration::from_millis(20));
        store.finish();
        waiter.join().unwrap();
        assert!(store.is_finished());
    }
}
