//! Handles: per-consumer facades over the shared cache.
//!
//! - [`CachedReader`] holds one reference on a [`ResourceCache`] plus a private
//!   [`ReadCursor`]. It implements [`std::io::Read`] with blocking semantics.
//! - [`CachedWriter`] holds the writer lease for a key and wraps the sink. It
//!   implements [`std::io::Write`].
//!
//! Both release what they hold exactly once: on `close()` or, failing that,
//! on drop. A reader handle is not meant to be shared across threads; open
//! another one for the same key instead.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::key::ResourceKey;
use crate::registry::RegistryInner;
use crate::resource::ResourceCache;
use crate::store::ReadOutcome;

/// A read position in one resource stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadCursor {
    pos: usize,
}

impl ReadCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at(pos: usize) -> Self {
        Self { pos }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Move forward by `amount`, returning the new position.
    pub fn advance(&mut self, amount: usize) -> usize {
        self.pos += amount;
        self.pos
    }

    /// How much of a `len` byte request fits before `max_pos`. Zero when the
    /// cursor is already there or beyond.
    pub fn possible_read_len(&self, len: usize, max_pos: usize) -> usize {
        len.min(max_pos.saturating_sub(self.pos))
    }
}

/// A consumer's handle on a cached resource.
pub struct CachedReader {
    registry: Arc<RegistryInner>,
    cache: Arc<ResourceCache>,
    cursor: ReadCursor,
    released: bool,
}

impl CachedReader {
    pub(crate) fn new(registry: Arc<RegistryInner>, cache: Arc<ResourceCache>) -> Self {
        Self {
            registry,
            cache,
            cursor: ReadCursor::new(),
            released: false,
        }
    }

    pub fn key(&self) -> &ResourceKey {
        self.cache.key()
    }

    pub fn position(&self) -> usize {
        self.cursor.position()
    }

    /// Read into `buf[offset..offset + len]` at this handle's position.
    pub fn read_into(&mut self, buf: &mut [u8], offset: usize, len: usize, blocking: bool) -> Result<ReadOutcome> {
        self.cache.read(buf, offset, len, &mut self.cursor, blocking)
    }

    /// Read at an absolute position. The handle's own position is untouched.
    pub fn read_at(&self, buf: &mut [u8], position: usize, blocking: bool) -> Result<ReadOutcome> {
        self.cache.read_at(buf, 0, buf.len(), position, blocking)
    }

    /// Blocking single-byte read. `None` at end of stream.
    pub fn read_byte(&mut self) -> Result<Option<u8>> {
        self.cache.read_byte(&mut self.cursor)
    }

    /// Skip up to `len` already loaded bytes.
    pub fn skip(&mut self, len: usize) -> usize {
        self.cache.skip(len, &mut self.cursor)
    }

    /// Bytes readable right now without blocking.
    pub fn available(&self) -> usize {
        self.cache.available(&self.cursor)
    }

    /// Live handles on the underlying cache, this one included.
    pub fn ref_count(&self) -> isize {
        self.cache.ref_count()
    }

    pub fn loaded_len(&self) -> usize {
        self.cache.loaded_len()
    }

    pub fn is_fully_loaded(&self) -> bool {
        self.cache.is_fully_loaded()
    }

    /// Whether `other` reads from the same underlying cache.
    pub fn shares_cache_with(&self, other: &CachedReader) -> bool {
        Arc::ptr_eq(&self.cache, &other.cache)
    }

    /// Release this handle's reference. The cache stays registered.
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.registry.release_reader(&self.cache)
    }
}

impl Read for CachedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = buf.len();
        match self.read_into(buf, 0, len, true)? {
            ReadOutcome::Bytes(n) => Ok(n),
            ReadOutcome::NotYet | ReadOutcome::EndOfStream => Ok(0),
        }
    }
}

impl Drop for CachedReader {
    fn drop(&mut self) {
        // Invariant violations are already logged by release.
        let _ = self.release();
    }
}

impl fmt::Debug for CachedReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedReader")
            .field("key", self.cache.key())
            .field("position", &self.cursor.position())
            .field("released", &self.released)
            .finish()
    }
}

/// Exclusive writer on a key.
///
/// While this exists no reader cache can exist for the key; readers opening
/// it block until the writer is closed.
pub struct CachedWriter {
    registry: Arc<RegistryInner>,
    key: ResourceKey,
    lease: Uuid,
    /// Sink, `None` once closed.
    sink: Option<Box<dyn Write + Send>>,
    bytes_written: u64,
}

impl CachedWriter {
    pub(crate) fn new(
        registry: Arc<RegistryInner>,
        key: ResourceKey,
        lease: Uuid,
        sink: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            registry,
            key,
            lease,
            sink: Some(sink),
            bytes_written: 0,
        }
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// Identifier of the lease this writer holds.
    pub fn lease_id(&self) -> Uuid {
        self.lease
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn is_open(&self) -> bool {
        self.sink.is_some()
    }

    /// Flush and close the sink, then release the lease.
    ///
    /// The lease is released even when flushing fails; the flush error is
    /// returned.
    pub fn close(mut self) -> Result<()> {
        let flushed = self.close_sink();
        let released = self.registry.release_writer(&self.key, self.lease);
        flushed?;
        released
    }

    fn close_sink(&mut self) -> Result<()> {
        match self.sink.take() {
            Some(mut sink) => {
                sink.flush()?;
                debug!(key = %self.key, bytes = self.bytes_written, "writer sink closed");
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn closed_error() -> io::Error {
        io::Error::other("writer already closed")
    }
}

impl Write for CachedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let sink = self.sink.as_mut().ok_or_else(Self::closed_error)?;
        let n = sink.write(buf)?;
        self.bytes_written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.sink.as_mut() {
            Some(sink) => sink.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for CachedWriter {
    fn drop(&mut self) {
        // `close` already took the sink and released the lease.
        if self.sink.is_none() {
            return;
        }
        if let Err(e) = self.close_sink() {
            tracing::warn!(key = %self.key, error = %e, "flush failed while dropping writer");
        }
        let _ = self.registry.release_writer(&self.key, self.lease);
    }
}

impl fmt::Debug for CachedWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedWriter")
            .field("key", &self.key)
            .field("lease", &self.lease)
            .field("bytes_written", &self.bytes_written)
            .field("open", &self.sink.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_advance() {
        let mut cursor = ReadCursor::new();
        assert_eq!(cursor.advance(3), 3);
        assert_eq!(cursor.advance(2), 5);
        assert_eq!(cursor.position(), 5);
    }

    #[test]
    fn test_possible_read_len() {
        let cursor = ReadCursor::at(6);
        assert_eq!(cursor.possible_read_len(2, 10), 2);
        assert_eq!(cursor.possible_read_len(4, 10), 4);
        assert_eq!(cursor.possible_read_len(40, 10), 4);
        assert_eq!(ReadCursor::at(12).possible_read_len(5, 10), 0);
    }
}
