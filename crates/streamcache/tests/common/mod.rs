//! Shared sources and helpers for the streamcache integration tests.

#![allow(dead_code)]

use std::io::{self, Cursor, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use streamcache::{CacheConfig, LoadMode, Registry};

pub const INT_COUNT: u32 = 1_000_000;

/// `count` consecutive big-endian u32 values starting at zero.
pub fn counter_bytes(count: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity(count as usize * 4);
    for i in 0..count {
        data.extend_from_slice(&i.to_be_bytes());
    }
    data
}

pub fn counter_source(count: u32) -> io::Result<Cursor<Vec<u8>>> {
    Ok(Cursor::new(counter_bytes(count)))
}

pub fn registry(mode: LoadMode) -> Registry {
    Registry::new(CacheConfig::default().with_load_mode(mode))
}

/// Small deterministic generator so random-access tests are reproducible.
pub struct Lcg(u64);

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Self(seed)
    }

    pub fn next_u32(&mut self) -> u32 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        (self.0 >> 33) as u32
    }

    pub fn below(&mut self, bound: u32) -> u32 {
        self.next_u32() % bound
    }
}

/// Source that yields nothing until the test sends it a block of bytes.
///
/// Dropping the sender ends the stream with an error. `closed` flips when
/// the source itself is dropped.
pub struct GatedSource {
    blocks: Receiver<Vec<u8>>,
    pending: Cursor<Vec<u8>>,
    closed: Arc<AtomicBool>,
}

impl GatedSource {
    pub fn new(blocks: Receiver<Vec<u8>>, closed: Arc<AtomicBool>) -> Self {
        Self {
            blocks,
            pending: Cursor::new(Vec::new()),
            closed,
        }
    }
}

impl Read for GatedSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = self.pending.read(buf)?;
            if n > 0 {
                return Ok(n);
            }
            match self.blocks.recv() {
                Ok(block) if block.is_empty() => return Ok(0),
                Ok(block) => self.pending = Cursor::new(block),
                Err(_) => return Err(io::Error::new(io::ErrorKind::BrokenPipe, "gate dropped")),
            }
        }
    }
}

impl Drop for GatedSource {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
