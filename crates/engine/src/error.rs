//! Error types for the download engine.
//!
//! [`EngineError`] covers failures fatal to a download: they surface as an
//! `error` event on the Transport and end the Coordinator. [`ChunkError`]
//! is an internal classification consumed only by [`crate::worker`]'s
//! retry loop; it never crosses the Transport directly, only the resulting
//! log/event text does.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("preflight failed: {0}")]
    Preflight(String),

    #[error("server did not report a usable Content-Length")]
    UnknownSize,

    #[error("file is empty (size 0)")]
    EmptyFile,

    #[error("{url} is already in progress")]
    AlreadyInProgress { url: String },

    #[error("chunk {id} is not completed: {reason}")]
    IncompleteChunk { id: u32, reason: String },

    #[error("merge failed: {0}")]
    Merge(#[from] storage::StorageError),

    #[error("checksum computation failed: {0}")]
    Checksum(std::io::Error),

    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
}

/// Classification of a single chunk-GET failure, used to decide whether to
/// retry or fail the chunk immediately. Never surfaces to the Transport as
/// a type; only the chosen wire event (`chunk_retry` vs. the chunk's final
/// error string) does.
#[derive(Debug, Clone)]
pub enum ChunkError {
    /// Network I/O error, timeout, 5xx, or a non-206 response mid-stream
    /// that might succeed on retry.
    Transient(String),
    /// No forward progress for the stall window.
    Stall,
    /// 4xx (other than a retryable range mismatch) or any error the spec
    /// defines as non-retryable.
    Permanent(String),
}

impl ChunkError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ChunkError::Permanent(_))
    }

    pub fn message(&self) -> String {
        match self {
            ChunkError::Transient(m) => m.clone(),
            ChunkError::Stall => "stalled: no forward progress".to_string(),
            ChunkError::Permanent(m) => m.clone(),
        }
    }
}

impl std::fmt::Display for ChunkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}
