//! Request and response payloads for the upload API.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Content type used when the file name gives no hint.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Guess the content type of a merged file from its name.
pub fn guess_content_type(file_name: &str) -> String {
    mime_guess::from_path(file_name)
        .first_raw()
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_string()
}

/// Request to initialize (or resume) an upload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitUploadRequest {
    pub owner_id: String,
    /// Content digest of the whole file, typically hex SHA-256.
    pub content_digest: String,
    pub file_name: String,
    /// Total file size in bytes.
    pub file_size: u64,
    pub chunk_count: u32,
    /// Nominal chunk size (optional, derived from size and count if absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
}

/// Response from init.
///
/// On resume the stored session values are returned, not the values in the
/// request that triggered the resume.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitUploadResponse {
    pub owner_id: String,
    pub content_digest: String,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_count: u32,
    pub chunk_size: u64,
    /// Number of chunks already stored.
    pub uploaded_chunks: u32,
    /// Percentage, rounded to 2 decimals.
    pub progress: f64,
    /// Whether an existing session was found.
    pub resumed: bool,
    /// Whether any chunk still has to be sent.
    pub need_upload: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

/// Response from uploading one chunk.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkUploadResponse {
    pub chunk_index: u32,
    /// True when the chunk was already present and the write was skipped.
    pub already_uploaded: bool,
    pub uploaded_chunks: u32,
    pub chunk_count: u32,
    pub progress: f64,
    pub is_complete: bool,
    /// Object key of the stored chunk.
    pub chunk_path: String,
    pub message: String,
}

/// Response from querying upload status.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadStatusResponse {
    pub file_name: String,
    pub file_size: u64,
    pub chunk_count: u32,
    /// Indices already stored, ascending.
    pub uploaded: Vec<u32>,
    /// Indices still missing, ascending.
    pub missing: Vec<u32>,
    pub uploaded_count: u32,
    pub progress: f64,
    pub is_complete: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub message: String,
}

/// Non-fatal anomaly detected after a successful merge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityWarning {
    /// Machine-readable kind, e.g. `size_mismatch`.
    pub kind: String,
    pub expected: u64,
    pub actual: u64,
    pub message: String,
}

impl IntegrityWarning {
    pub const SIZE_MISMATCH: &'static str = "size_mismatch";

    pub fn size_mismatch(expected: u64, actual: u64) -> Self {
        Self {
            kind: Self::SIZE_MISMATCH.to_string(),
            expected,
            actual,
            message: format!(
                "merged object is {actual} bytes but the session declared {expected} bytes"
            ),
        }
    }
}

/// Response from a successful merge.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MergeResponse {
    pub file_name: String,
    /// Object key of the merged file.
    pub final_path: String,
    /// Actual size of the merged object.
    pub file_size: u64,
    /// Size declared at init.
    pub expected_size: u64,
    pub content_type: String,
    pub chunk_count: u32,
    pub merge_duration_ms: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub merged_at: OffsetDateTime,
    /// Non-fatal anomalies; empty when the merge is clean.
    #[serde(default)]
    pub warnings: Vec<IntegrityWarning>,
}

/// A completed upload as recorded in the ledger.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadRecordResponse {
    pub id: i64,
    pub owner_id: String,
    pub content_digest: String,
    pub file_name: String,
    pub final_path: String,
    pub file_size: u64,
    pub content_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Error body returned by the API.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    /// Missing chunk indices, present for `incomplete_upload`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_chunks: Option<Vec<u32>>,
}
