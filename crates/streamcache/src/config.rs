//! Cache tunables with environment variable and file-based loading.
//!
//! Environment variables:
//! - `STREAMCACHE_CHUNK_SIZE`: Transfer buffer size per source read (default 4096)
//! - `STREAMCACHE_MAX_CONCURRENT_LOADS`: Background loader cap (default 100)
//! - `STREAMCACHE_LOAD_MODE`: `sync` or `async` (default `async`)
//!
//! Default config file: `~/.config/streamcache/config.toml`

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Default transfer chunk size. Close to typical I/O read granularity while
/// keeping the delay before new bytes become visible short.
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024;

/// Default cap on simultaneously running background loads.
pub const DEFAULT_MAX_CONCURRENT_LOADS: usize = 100;

/// How a resource cache populates its chunk store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    /// Load the whole source on the opening thread before returning.
    Sync,
    /// Hand the source to the background pool and return immediately.
    #[default]
    Async,
}

impl FromStr for LoadMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "sync" | "blocking" => Ok(LoadMode::Sync),
            "async" | "background" => Ok(LoadMode::Async),
            other => anyhow::bail!("unknown load mode: {other}"),
        }
    }
}

impl fmt::Display for LoadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadMode::Sync => write!(f, "sync"),
            LoadMode::Async => write!(f, "async"),
        }
    }
}

/// Configuration for a [`Registry`](crate::Registry).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Bytes requested from the source per read. Each chunk is at most this long.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Maximum number of background loads running at once.
    /// Every running load holds one transfer buffer and one worker thread.
    #[serde(default = "default_max_concurrent_loads")]
    pub max_concurrent_loads: usize,

    /// Load mode used when the opener does not pick one.
    #[serde(default)]
    pub load_mode: LoadMode,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_max_concurrent_loads() -> usize {
    DEFAULT_MAX_CONCURRENT_LOADS
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_concurrent_loads: DEFAULT_MAX_CONCURRENT_LOADS,
            load_mode: LoadMode::default(),
        }
    }
}

/// Get the default config file path (~/.config/streamcache/config.toml).
fn default_config_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|dirs| dirs.config_dir().join("streamcache").join("config.toml"))
}

impl CacheConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file, then apply env overrides.
    ///
    /// The file should contain a `[cache]` section:
    /// ```toml
    /// [cache]
    /// chunk_size = 4096
    /// max_concurrent_loads = 100
    /// load_mode = "async"
    /// ```
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let mut config = Self::from_toml_str(&contents)
            .with_context(|| format!("failed to parse TOML: {}", path.display()))?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse the `[cache]` section of a TOML document.
    ///
    /// A document without a `[cache]` section yields the defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let table: toml::Table = contents.parse()?;

        match table.get("cache") {
            Some(section) => section
                .clone()
                .try_into()
                .context("failed to parse [cache] section"),
            None => Ok(Self::default()),
        }
    }

    /// Load the user config file if present, otherwise the environment.
    pub fn discover() -> Result<Self> {
        match default_config_path() {
            Some(path) if path.exists() => Self::from_file(&path),
            _ => Self::from_env(),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(v) = env::var("STREAMCACHE_CHUNK_SIZE") {
            self.chunk_size = v
                .parse()
                .with_context(|| format!("invalid STREAMCACHE_CHUNK_SIZE: {v}"))?;
        }
        if let Ok(v) = env::var("STREAMCACHE_MAX_CONCURRENT_LOADS") {
            self.max_concurrent_loads = v
                .parse()
                .with_context(|| format!("invalid STREAMCACHE_MAX_CONCURRENT_LOADS: {v}"))?;
        }
        if let Ok(v) = env::var("STREAMCACHE_LOAD_MODE") {
            self.load_mode = v.parse()?;
        }
        Ok(())
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            anyhow::bail!("chunk_size must be greater than zero");
        }
        if self.max_concurrent_loads == 0 {
            anyhow::bail!("max_concurrent_loads must be greater than zero");
        }
        Ok(())
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_max_concurrent_loads(mut self, max: usize) -> Self {
        self.max_concurrent_loads = max;
        self
    }

    pub fn with_load_mode(mut self, mode: LoadMode) -> Self {
        self.load_mode = mode;
        self
    }
}
