//! Upload handlers: init, chunk upload, status, merge, and record lookup.

use crate::error::{ApiError, ApiResult, UploadError};
use crate::state::AppState;
use axum::Json;
use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use std::num::IntErrorKind;
use tessera_core::upload::{
    ChunkUploadResponse, InitUploadRequest, InitUploadResponse, MergeResponse,
    UploadRecordResponse, UploadStatusResponse,
};
use tessera_core::{SessionParams, UploadIdentity};
use tracing::instrument;

/// Parse the identity path segments.
fn identity_from_path(owner_id: String, content_digest: String) -> ApiResult<UploadIdentity> {
    Ok(UploadIdentity::new(owner_id, content_digest)?)
}

/// Chunk indices arrive as raw path text so malformed values map to our own error body.
///
/// Any integer is accepted here; the coordinator range-checks it after the session lookup.
/// Integers too large for `i64` saturate so they still fail as out of range.
fn parse_chunk_index(raw: &str) -> ApiResult<i64> {
    raw.parse::<i64>().or_else(|e| match e.kind() {
        IntErrorKind::PosOverflow => Ok(i64::MAX),
        IntErrorKind::NegOverflow => Ok(i64::MIN),
        _ => Err(UploadError::InvalidRequest(format!(
            "chunk index must be an integer, got {raw:?}"
        ))
        .into()),
    })
}

/// POST /v1/uploads
#[instrument(skip(state, payload))]
pub async fn init_upload(
    State(state): State<AppState>,
    payload: Result<Json<InitUploadRequest>, JsonRejection>,
) -> ApiResult<Json<InitUploadResponse>> {
    let Json(req) = payload.map_err(|e| UploadError::InvalidRequest(e.body_text()))?;
    let identity = UploadIdentity::new(req.owner_id, req.content_digest)?;
    let params = SessionParams {
        file_name: req.file_name,
        file_size: req.file_size,
        chunk_count: req.chunk_count,
        chunk_size: req.chunk_size,
    };

    let response = state.coordinator.init_upload(identity, params).await?;
    Ok(Json(response))
}

/// PUT /v1/uploads/{owner_id}/{content_digest}/chunks/{index}
#[instrument(skip(state, body), fields(size = body.len()))]
pub async fn upload_chunk(
    State(state): State<AppState>,
    Path((owner_id, content_digest, index)): Path<(String, String, String)>,
    body: Bytes,
) -> ApiResult<Json<ChunkUploadResponse>> {
    let identity = identity_from_path(owner_id, content_digest)?;
    let chunk_index = parse_chunk_index(&index)?;

    let response = state
        .coordinator
        .upload_chunk(&identity, chunk_index, body)
        .await?;
    Ok(Json(response))
}

/// GET /v1/uploads/{owner_id}/{content_digest}
#[instrument(skip(state))]
pub async fn get_upload_status(
    State(state): State<AppState>,
    Path((owner_id, content_digest)): Path<(String, String)>,
) -> ApiResult<Json<UploadStatusResponse>> {
    let identity = identity_from_path(owner_id, content_digest)?;
    Ok(Json(state.coordinator.query_status(&identity).await?))
}

/// POST /v1/uploads/{owner_id}/{content_digest}/merge
#[instrument(skip(state))]
pub async fn merge_upload(
    State(state): State<AppState>,
    Path((owner_id, content_digest)): Path<(String, String)>,
) -> ApiResult<Json<MergeResponse>> {
    let identity = identity_from_path(owner_id, content_digest)?;
    Ok(Json(state.coordinator.merge(&identity).await?))
}

/// GET /v1/records/{owner_id}/{content_digest}
#[instrument(skip(state))]
pub async fn get_upload_record(
    State(state): State<AppState>,
    Path((owner_id, content_digest)): Path<(String, String)>,
) -> ApiResult<Json<UploadRecordResponse>> {
    let identity = identity_from_path(owner_id, content_digest)?;
    state
        .coordinator
        .find_record(&identity)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no merged upload for {identity}")))
}
