//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid upload identity: {0}")]
    InvalidIdentity(String),

    #[error("invalid file name: {0}")]
    InvalidFileName(String),

    #[error("invalid upload session: {0}")]
    InvalidSession(String),

    #[error("chunk index {index} out of range (valid range: 0..{chunk_count})")]
    ChunkIndexOutOfRange { index: u32, chunk_count: u32 },

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
