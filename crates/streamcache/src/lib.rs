//! Resource-keyed byte stream cache for streaming sources.
//!
//! Many readers of the same resource share one in-memory copy that is loaded
//! from the source once, in chunks, while readers consume it. Writers get
//! exclusive access to a key: a writer waits until every reader has closed,
//! tears the cached copy down, and blocks new readers until it is done.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::fs::File;
//! use std::io::Read;
//! use streamcache::{CacheConfig, Registry};
//!
//! let registry = Registry::new(CacheConfig::from_env().unwrap());
//!
//! // First reader builds the cache; later readers share it.
//! let mut a = registry.open_reader("/data/a.bin", || File::open("/data/a.bin")).unwrap();
//! let b = registry.open_reader("/data/a.bin", || File::open("/data/a.bin")).unwrap();
//! assert!(a.shares_cache_with(&b));
//!
//! let mut header = [0u8; 16];
//! a.read_exact(&mut header).unwrap();
//! a.close().unwrap();
//! b.close().unwrap();
//!
//! // Exclusive write once all readers are gone.
//! let mut w = registry
//!     .open_writer("/data/a.bin", File::create("/data/a.bin").unwrap())
//!     .unwrap();
//! std::io::Write::write_all(&mut w, b"new contents").unwrap();
//! w.close().unwrap();
//! ```
//!
//! # Configuration
//!
//! Environment variables:
//! - `STREAMCACHE_CHUNK_SIZE`: Bytes per source read (default 4096)
//! - `STREAMCACHE_MAX_CONCURRENT_LOADS`: Cap on background loads (default 100)
//! - `STREAMCACHE_LOAD_MODE`: `sync` or `async` (default `async`)
//!
//! # Concurrency
//!
//! - Reads on one handle never interfere with reads on another
//! - A key is either cached for readers or leased to one writer, never both
//! - Waits on a key can be ended with [`Registry::shutdown`]
//! - Cached data is kept until a writer claims the key; there is no eviction

pub mod config;
pub mod error;
pub mod handle;
pub mod key;
pub mod loader;
pub mod registry;
pub mod resource;
pub mod stats;
pub mod store;

// Re-exports for convenience
pub use config::{CacheConfig, LoadMode, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_CONCURRENT_LOADS};
pub use error::{CacheError, Result};
pub use handle::{CachedReader, CachedWriter, ReadCursor};
pub use key::{KeyError, ResourceKey};
pub use loader::LoadPool;
pub use registry::Registry;
pub use resource::ResourceCache;
pub use stats::{RegistryStats, ResourceStats};
pub use store::{Chunk, ChunkStore, ReadOutcome};
