//! Splitting a local file into upload chunks.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;

/// How a file of `file_size` bytes is cut into chunks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkPlan {
    pub file_size: u64,
    pub chunk_size: u64,
    pub chunk_count: u32,
}

impl ChunkPlan {
    pub fn new(file_size: u64, chunk_size: u64) -> Result<Self> {
        anyhow::ensure!(file_size > 0, "cannot upload an empty file");
        anyhow::ensure!(chunk_size > 0, "chunk size must be greater than 0");
        let chunk_count = u32::try_from(file_size.div_ceil(chunk_size))
            .context("file needs more chunks than the protocol allows; raise --chunk-size")?;
        Ok(Self {
            file_size,
            chunk_size,
            chunk_count,
        })
    }

    /// Byte offset and length of chunk `index`. The last chunk may be short.
    pub fn chunk_range(&self, index: u32) -> (u64, u64) {
        let offset = u64::from(index) * self.chunk_size;
        let len = self.chunk_size.min(self.file_size.saturating_sub(offset));
        (offset, len)
    }
}

/// Hex SHA-256 of the file at `path`, read in 1 MiB blocks.
pub async fn file_digest(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
