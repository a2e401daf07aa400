//! Upload error taxonomy and its HTTP mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tessera_core::UploadIdentity;
use tessera_core::upload::ErrorResponse;
use tessera_metadata::MetadataError;
use tessera_storage::StorageError;

/// Format missing chunks for display, capping at MAX_DISPLAYED to prevent log/response bloat.
fn format_missing_chunks(chunks: &[u32]) -> String {
    const MAX_DISPLAYED: usize = 5;
    if chunks.len() <= MAX_DISPLAYED {
        format!("{:?}", chunks)
    } else {
        let sample: Vec<_> = chunks.iter().take(MAX_DISPLAYED).collect();
        format!("{:?} (and {} more)", sample, chunks.len() - MAX_DISPLAYED)
    }
}

/// Errors returned by the upload coordinator.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("upload {0} is not initialized")]
    NotInitialized(UploadIdentity),

    #[error("chunk index {index} out of range (valid range: 0..{chunk_count})")]
    InvalidChunkIndex { index: i64, chunk_count: u32 },

    #[error("incomplete upload: missing {} chunks {}", .missing.len(), format_missing_chunks(.missing))]
    IncompleteUpload { missing: Vec<u32> },

    #[error("merge already in progress for upload {0}")]
    MergeInProgress(UploadIdentity),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("state store error: {0}")]
    StateStore(#[from] MetadataError),
}

impl From<tessera_core::Error> for UploadError {
    fn from(err: tessera_core::Error) -> Self {
        match err {
            tessera_core::Error::ChunkIndexOutOfRange { index, chunk_count } => {
                Self::InvalidChunkIndex {
                    index: i64::from(index),
                    chunk_count,
                }
            }
            other => Self::InvalidRequest(other.to_string()),
        }
    }
}

impl UploadError {
    /// Stable label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::NotInitialized(_) => "upload_not_initialized",
            Self::InvalidChunkIndex { .. } => "invalid_chunk_index",
            Self::IncompleteUpload { .. } => "incomplete_upload",
            Self::MergeInProgress(_) => "merge_in_progress",
            Self::Storage(_) => "storage_error",
            Self::StateStore(_) => "state_store_error",
        }
    }

    /// Whether the caller may retry the same request unchanged.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::MergeInProgress(_) | Self::Storage(_) | Self::StateStore(_)
        )
    }
}

/// Result type for coordinator operations.
pub type UploadResult<T> = std::result::Result<T, UploadError>;

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Upload(e) => e.kind(),
            Self::NotFound(_) => "not_found",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Upload(e) => match e {
                UploadError::InvalidRequest(_) | UploadError::InvalidChunkIndex { .. } => {
                    StatusCode::BAD_REQUEST
                }
                UploadError::NotInitialized(_) => StatusCode::NOT_FOUND,
                UploadError::IncompleteUpload { .. } | UploadError::MergeInProgress(_) => {
                    StatusCode::CONFLICT
                }
                UploadError::Storage(_) => StatusCode::BAD_GATEWAY,
                UploadError::StateStore(_) => StatusCode::SERVICE_UNAVAILABLE,
            },
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<tessera_core::Error> for ApiError {
    fn from(err: tessera_core::Error) -> Self {
        Self::Upload(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(code = self.code(), error = %self, "Request failed");
        }
        let missing_chunks = match &self {
            Self::Upload(UploadError::IncompleteUpload { missing }) => Some(missing.clone()),
            _ => None,
        };
        let body = ErrorResponse {
            code: self.code().to_string(),
            message: self.to_string(),
            missing_chunks,
        };
        (status, Json(body)).into_response()
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incomplete_upload_message_caps_list() {
        let err = UploadError::IncompleteUpload {
            missing: (0..8).collect(),
        };
        let msg = err.to_string();
        assert!(msg.contains("missing 8 chunks"));
        assert!(msg.contains("and 3 more"));
    }

    #[test]
    fn test_status_mapping() {
        let id = UploadIdentity::new("u", "d").unwrap();
        let cases = [
            (
                ApiError::from(UploadError::InvalidRequest("x".into())),
                StatusCode::BAD_REQUEST,
                "invalid_request",
            ),
            (
                UploadError::InvalidChunkIndex {
                    index: 5,
                    chunk_count: 5,
                }
                .into(),
                StatusCode::BAD_REQUEST,
                "invalid_chunk_index",
            ),
            (
                UploadError::NotInitialized(id.clone()).into(),
                StatusCode::NOT_FOUND,
                "upload_not_initialized",
            ),
            (
                UploadError::IncompleteUpload { missing: vec![4] }.into(),
                StatusCode::CONFLICT,
                "incomplete_upload",
            ),
            (
                UploadError::MergeInProgress(id).into(),
                StatusCode::CONFLICT,
                "merge_in_progress",
            ),
            (
                UploadError::Storage(StorageError::Compose("x".into())).into(),
                StatusCode::BAD_GATEWAY,
                "storage_error",
            ),
            (
                UploadError::StateStore(MetadataError::Internal("x".into())).into(),
                StatusCode::SERVICE_UNAVAILABLE,
                "state_store_error",
            ),
            (
                ApiError::NotFound("x".into()),
                StatusCode::NOT_FOUND,
                "not_found",
            ),
            (
                ApiError::Internal("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
            ),
        ];
        for (err, status, code) in cases {
            assert_eq!(err.status_code(), status, "{err}");
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn test_core_errors_map_to_validation_errors() {
        let err: UploadError = tessera_core::Error::ChunkIndexOutOfRange {
            index: 9,
            chunk_count: 3,
        }
        .into();
        assert!(matches!(
            err,
            UploadError::InvalidChunkIndex {
                index: 9,
                chunk_count: 3
            }
        ));

        let err: UploadError = tessera_core::Error::InvalidSession("bad".into()).into();
        assert!(matches!(err, UploadError::InvalidRequest(_)));
        assert!(!err.is_retriable());
    }
}
