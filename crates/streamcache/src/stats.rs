//! Snapshot types describing registry state.
//!
//! These are plain serializable values captured under the registry lock, so
//! callers can log or export them without holding anything.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::LoadMode;
use crate::key::ResourceKey;

/// State of one reader-side resource cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceStats {
    /// Key the cache is registered under.
    pub key: ResourceKey,

    /// Live reader handles.
    pub ref_count: i64,

    /// Bytes loaded so far.
    pub loaded_bytes: u64,

    /// Number of chunks backing the loaded bytes.
    pub chunks: u64,

    /// Whether the load has stopped.
    pub finished: bool,

    pub load_mode: LoadMode,

    /// Last open or read against this cache.
    pub last_access: DateTime<Utc>,
}

impl ResourceStats {
    /// A cache with no readers could be reclaimed without waiting.
    pub fn is_idle(&self) -> bool {
        self.ref_count == 0
    }
}

/// Aggregate counts over the whole registry.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryStats {
    /// Keys with a reader-side cache.
    pub readers: usize,
    /// Keys held by a writer lease.
    pub writers: usize,
    /// Keys mid hand-off from readers to a writer.
    pub closing: usize,
    /// Keys whose first reader is still constructing the cache.
    pub opening: usize,
    /// Background loads running right now.
    pub loads_active: usize,
    /// Background loads waiting for a worker.
    pub loads_queued: usize,
}
