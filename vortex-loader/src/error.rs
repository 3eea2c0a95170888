//! Error types for the shard loader
//!
//! Configuration errors surface synchronously at setup time. Per-shard
//! decode and I/O errors are recovered by the loader (logged, served as an
//! empty shard) and only escape through the direct decoding APIs.

use std::path::PathBuf;
use thiserror::Error;

/// Primary error type for all loader operations
#[derive(Debug, Error)]
pub enum LoaderError {
    // ========== Configuration Errors ==========

    /// Bad configuration value (rank/size, window, empty catalog, ...)
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// Shard index outside the catalog
    #[error("Shard index {index} out of range for {num_shards} shards")]
    ShardIndexOutOfRange { index: usize, num_shards: usize },

    // ========== Shard Errors ==========

    /// File could not be listed, opened or read
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A feature record could not be parsed as a tensor
    #[error("Failed to decode tensor record at byte {offset}: {reason}")]
    Decode { offset: usize, reason: String },

    /// The stream ended in the middle of a sample
    #[error("Truncated shard: needed {needed} bytes at byte {offset}, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    // ========== Runtime Errors ==========

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl LoaderError {
    /// Shorthand for [`LoaderError::InvalidArgument`]
    pub fn invalid(reason: impl Into<String>) -> Self {
        LoaderError::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Wrap an I/O error with the path it happened on
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        LoaderError::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, LoaderError::Io { .. })
    }

    /// Returns true if this error indicates a corrupt shard
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            LoaderError::Decode { .. } | LoaderError::Truncated { .. }
        )
    }
}

/// Result type alias for loader operations
pub type Result<T> = std::result::Result<T, LoaderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let io = LoaderError::io(
            "/tmp/x.pb",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(io.is_retryable());
        assert!(!io.is_corruption());

        let truncated = LoaderError::Truncated {
            offset: 10,
            needed: 4,
            available: 1,
        };
        assert!(truncated.is_corruption());
        assert!(!truncated.is_retryable());

        assert!(!LoaderError::invalid("bad").is_retryable());
    }
}
