//! Error taxonomy for the cache core.
//!
//! End of stream is not an error: it is reported through
//! [`ReadOutcome::EndOfStream`](crate::store::ReadOutcome).

use std::io;

use thiserror::Error;

use crate::key::ResourceKey;

/// Errors surfaced by the registry, resource caches and handles.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The source factory (or sink acquisition) failed. Nothing was registered.
    #[error("failed to create source for {key}: {source}")]
    SourceCreation {
        key: ResourceKey,
        #[source]
        source: io::Error,
    },

    /// Malformed read parameters. No state was touched.
    #[error("invalid read arguments: offset {offset} + len {len} exceeds buffer of {buf_len} bytes")]
    InvalidArgument {
        offset: usize,
        len: usize,
        buf_len: usize,
    },

    /// Reference count went negative, a lease was missing on release, or a
    /// lease coexisted with a reader cache. Never retried.
    #[error("critical invariant violation: {0}")]
    InvariantViolation(String),

    /// A blocking lease wait was cancelled by [`Registry::shutdown`](crate::Registry::shutdown).
    #[error("wait on {key} interrupted: registry is shutting down")]
    InterruptedWait { key: ResourceKey },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CacheError {
    /// Whether this error belongs to the I/O class (as opposed to a
    /// programming error).
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            CacheError::SourceCreation { .. } | CacheError::InterruptedWait { .. } | CacheError::Io(_)
        )
    }

    pub(crate) fn invariant(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(%message, "cache invariant violated");
        CacheError::InvariantViolation(message)
    }
}

impl From<CacheError> for io::Error {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Io(e) => e,
            CacheError::SourceCreation { source, .. } => source,
            CacheError::InvalidArgument { .. } => io::Error::new(io::ErrorKind::InvalidInput, err),
            CacheError::InterruptedWait { .. } => io::Error::new(io::ErrorKind::Interrupted, err),
            CacheError::InvariantViolation(_) => io::Error::other(err),
        }
    }
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_classification() {
        let key = ResourceKey::new("a");
        assert!(CacheError::InterruptedWait { key: key.clone() }.is_io());
        assert!(CacheError::SourceCreation {
            key,
            source: io::Error::other("boom"),
        }
        .is_io());
        assert!(!CacheError::InvariantViolation("x".into()).is_io());
        assert!(!CacheError::InvalidArgument {
            offset: 1,
            len: 2,
            buf_len: 2
        }
        .is_io());
    }

    #[test]
    fn test_into_io_error_kind() {
        let err: io::Error = CacheError::InvalidArgument {
            offset: 0,
            len: 9,
            buf_len: 4,
        }
        .into();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let err: io::Error = CacheError::InterruptedWait {
            key: ResourceKey::new("k"),
        }
        .into();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }
}
