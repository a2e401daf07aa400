//! Database models mapping to the metadata schema.

use crate::error::{MetadataError, MetadataResult};
use sqlx::FromRow;
use tessera_core::{ChunkBitmap, UploadIdentity, UploadSession};
use time::OffsetDateTime;

// =============================================================================
// Upload sessions
// =============================================================================

/// Upload session record. Metadata and the presence bitmap share one row.
///
/// Timestamps are unix milliseconds so expiry can be compared in SQL.
#[derive(Debug, Clone, FromRow)]
pub struct UploadSessionRow {
    pub owner_id: String,
    pub content_digest: String,
    pub file_name: String,
    pub file_size: i64,
    pub chunk_count: i64,
    pub chunk_size: i64,
    pub bitmap: Vec<u8>,
    pub created_at: i64,
    pub expires_at: i64,
}

impl UploadSessionRow {
    pub fn from_session(session: &UploadSession, bitmap: &ChunkBitmap) -> MetadataResult<Self> {
        Ok(Self {
            owner_id: session.identity.owner_id().to_string(),
            content_digest: session.identity.content_digest().to_string(),
            file_name: session.file_name.clone(),
            file_size: size_to_db("file_size", session.file_size)?,
            chunk_count: i64::from(session.chunk_count),
            chunk_size: size_to_db("chunk_size", session.chunk_size)?,
            bitmap: bitmap.to_bytes(),
            created_at: to_unix_millis(session.created_at),
            expires_at: to_unix_millis(session.expires_at),
        })
    }

    pub fn chunk_count(&self) -> MetadataResult<u32> {
        u32::try_from(self.chunk_count).map_err(|_| {
            MetadataError::Corrupt(format!(
                "chunk_count {} out of range for {}:{}",
                self.chunk_count, self.owner_id, self.content_digest
            ))
        })
    }

    pub fn bitmap(&self) -> MetadataResult<ChunkBitmap> {
        Ok(ChunkBitmap::from_bytes(self.chunk_count()?, &self.bitmap))
    }

    pub fn into_session(self) -> MetadataResult<UploadSession> {
        let chunk_count = self.chunk_count()?;
        let identity = UploadIdentity::new(self.owner_id, self.content_digest)
            .map_err(|e| MetadataError::Corrupt(e.to_string()))?;
        Ok(UploadSession {
            identity,
            file_name: self.file_name,
            file_size: size_from_db("file_size", self.file_size)?,
            chunk_count,
            chunk_size: size_from_db("chunk_size", self.chunk_size)?,
            created_at: from_unix_millis(self.created_at)?,
            expires_at: from_unix_millis(self.expires_at)?,
        })
    }
}

// =============================================================================
// Upload ledger
// =============================================================================

/// A completed upload.
#[derive(Debug, Clone, FromRow)]
pub struct UploadRecord {
    pub id: i64,
    pub owner_id: String,
    pub content_digest: String,
    pub file_name: String,
    pub final_path: String,
    pub file_size: i64,
    pub content_type: String,
    pub created_at: OffsetDateTime,
    pub is_deleted: bool,
}

/// Fields of a ledger entry about to be written.
#[derive(Debug, Clone)]
pub struct NewUploadRecord {
    pub identity: UploadIdentity,
    pub file_name: String,
    pub final_path: String,
    pub file_size: u64,
    pub content_type: String,
    pub created_at: OffsetDateTime,
}

pub(crate) fn size_to_db(field: &str, size: u64) -> MetadataResult<i64> {
    i64::try_from(size)
        .map_err(|_| MetadataError::Constraint(format!("{field} {size} exceeds storable range")))
}

pub(crate) fn size_from_db(field: &str, size: i64) -> MetadataResult<u64> {
    u64::try_from(size).map_err(|_| MetadataError::Corrupt(format!("negative {field} {size}")))
}

pub(crate) fn to_unix_millis(t: OffsetDateTime) -> i64 {
    (t.unix_timestamp_nanos() / 1_000_000) as i64
}

pub(crate) fn from_unix_millis(ms: i64) -> MetadataResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .map_err(|e| MetadataError::Corrupt(format!("timestamp {ms}: {e}")))
}
