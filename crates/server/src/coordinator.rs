//! Chunk upload coordinator: init, chunk upload, status, and merge.
//!
//! The coordinator keeps no per-upload state of its own. Sessions and
//! presence bitmaps live in the [`SessionStore`], bytes live in the
//! [`ObjectStore`], so any number of server instances can share the work
//! as long as they share those backends.
//!
//! A chunk's presence bit is only set after its bytes are durably stored,
//! so a failed storage write leaves nothing behind that a retry would
//! mistake for success.

use crate::cleanup::CleanupDispatcher;
use crate::error::{UploadError, UploadResult};
use crate::metrics::{
    CHUNK_BYTES, CHUNK_UPLOAD_DURATION, CHUNKS_DEDUPLICATED, CHUNKS_UPLOADED, CLEANUP_FAILURES,
    INTEGRITY_WARNINGS, MERGE_DURATION, MERGES, UPLOADS_INITIALIZED, UPLOADS_RESUMED,
    record_merge_failure,
};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tessera_core::config::AppConfig;
use tessera_core::upload::{
    ChunkUploadResponse, InitUploadResponse, IntegrityWarning, MergeResponse,
    UploadRecordResponse, UploadStatusResponse,
};
use tessera_core::{
    ChunkBitmap, SessionParams, UploadIdentity, UploadSession, guess_content_type,
    progress_percent,
};
use tessera_metadata::{MetadataError, NewUploadRecord, SessionStore, UploadLedger, UploadRecord};
use tessera_storage::ObjectStore;
use time::{Duration, OffsetDateTime};
use tracing::instrument;
use uuid::Uuid;

/// Limits and lifetimes applied by the coordinator.
#[derive(Clone, Debug)]
pub struct CoordinatorSettings {
    /// Sliding TTL of a session.
    pub session_ttl: Duration,
    /// TTL of the merge-in-progress marker.
    pub merge_lock_ttl: Duration,
    /// Upper bound on a session's chunk count.
    pub max_chunk_count: u32,
}

impl CoordinatorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            session_ttl: config.session.ttl(),
            merge_lock_ttl: config.session.merge_lock_ttl(),
            max_chunk_count: config.server.max_chunk_count,
        }
    }
}

/// Orchestrates uploads over the shared session store and object store.
pub struct UploadCoordinator {
    storage: Arc<dyn ObjectStore>,
    sessions: Arc<dyn SessionStore>,
    ledger: Arc<dyn UploadLedger>,
    cleanup: Arc<dyn CleanupDispatcher>,
    settings: CoordinatorSettings,
}

impl UploadCoordinator {
    pub fn new(
        storage: Arc<dyn ObjectStore>,
        sessions: Arc<dyn SessionStore>,
        ledger: Arc<dyn UploadLedger>,
        cleanup: Arc<dyn CleanupDispatcher>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            storage,
            sessions,
            ledger,
            cleanup,
            settings,
        }
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    /// Create a session for `identity`, or resume the existing one.
    ///
    /// On resume the stored session wins: `params` are ignored.
    #[instrument(
        skip(self, identity, params),
        fields(owner_id = %identity.owner_id(), content_digest = %identity.content_digest())
    )]
    pub async fn init_upload(
        &self,
        identity: UploadIdentity,
        params: SessionParams,
    ) -> UploadResult<InitUploadResponse> {
        if let Some(existing) = self.sessions.get_session(&identity).await? {
            return self.resume(existing).await;
        }

        let session = UploadSession::new(
            identity,
            params,
            self.settings.max_chunk_count,
            self.settings.session_ttl,
        )?;

        if !self.sessions.create_session(&session).await? {
            // Another init for the same identity got there first.
            return match self.sessions.get_session(&session.identity).await? {
                Some(existing) => self.resume(existing).await,
                None => Err(UploadError::StateStore(MetadataError::Internal(format!(
                    "session {} vanished during init",
                    session.identity
                )))),
            };
        }

        UPLOADS_INITIALIZED.inc();
        tracing::info!(
            file_name = %session.file_name,
            file_size = session.file_size,
            chunk_count = session.chunk_count,
            "Upload session created"
        );
        Ok(init_response(&session, 0, false))
    }

    async fn resume(&self, mut session: UploadSession) -> UploadResult<InitUploadResponse> {
        if let Some(expires_at) = self
            .sessions
            .refresh_ttl(&session.identity, self.settings.session_ttl)
            .await?
        {
            session.expires_at = expires_at;
        }
        let uploaded = self.sessions.uploaded_count(&session.identity).await?;

        UPLOADS_RESUMED.inc();
        tracing::info!(
            uploaded,
            chunk_count = session.chunk_count,
            "Resuming upload session"
        );
        Ok(init_response(&session, uploaded, true))
    }

    /// Store one chunk and mark it present.
    ///
    /// A chunk that is already marked is not written again.
    #[instrument(
        skip(self, identity, data),
        fields(
            owner_id = %identity.owner_id(),
            content_digest = %identity.content_digest(),
            size = data.len()
        )
    )]
    pub async fn upload_chunk(
        &self,
        identity: &UploadIdentity,
        chunk_index: i64,
        data: Bytes,
    ) -> UploadResult<ChunkUploadResponse> {
        let start = Instant::now();
        let session = self.require_session(identity).await?;

        let Some(chunk_index) = session.checked_index(chunk_index) else {
            return Err(UploadError::InvalidChunkIndex {
                index: chunk_index,
                chunk_count: session.chunk_count,
            });
        };
        if data.is_empty() {
            return Err(UploadError::InvalidRequest(
                "chunk body is empty".to_string(),
            ));
        }

        let chunk_path = identity.chunk_key(chunk_index);

        if self.sessions.is_chunk_present(identity, chunk_index).await? {
            let uploaded = self.sessions.uploaded_count(identity).await?;
            CHUNKS_DEDUPLICATED.inc();
            tracing::debug!(uploaded, "Chunk already uploaded, skipping write");
            return Ok(chunk_response(&session, chunk_index, true, uploaded, chunk_path));
        }

        let size = data.len() as u64;
        self.storage.put(&chunk_path, data).await?;

        let mark = match self
            .sessions
            .mark_chunk(identity, chunk_index, self.settings.session_ttl)
            .await
        {
            Ok(mark) => mark,
            // Expired or merged while the bytes were in flight.
            Err(e) if e.is_not_found() => {
                return Err(UploadError::NotInitialized(identity.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        CHUNKS_UPLOADED.inc();
        CHUNK_BYTES.inc_by(size);
        CHUNK_UPLOAD_DURATION.observe(start.elapsed().as_secs_f64());
        tracing::debug!(
            uploaded = mark.uploaded,
            chunk_count = session.chunk_count,
            "Chunk stored"
        );

        Ok(chunk_response(
            &session,
            chunk_index,
            !mark.newly_set,
            mark.uploaded,
            chunk_path,
        ))
    }

    /// Report which chunks are present and which are missing. Read-only.
    #[instrument(
        skip(self, identity),
        fields(owner_id = %identity.owner_id(), content_digest = %identity.content_digest())
    )]
    pub async fn query_status(
        &self,
        identity: &UploadIdentity,
    ) -> UploadResult<UploadStatusResponse> {
        let session = self.require_session(identity).await?;
        let bitmap = self.require_bitmap(identity).await?;
        let (uploaded, missing) = bitmap.partition();
        let uploaded_count = bitmap.count_ones();
        let is_complete = missing.is_empty();

        Ok(UploadStatusResponse {
            file_name: session.file_name.clone(),
            file_size: session.file_size,
            chunk_count: session.chunk_count,
            message: progress_message(session.chunk_count, uploaded_count),
            uploaded,
            missing,
            uploaded_count,
            progress: session.progress(uploaded_count),
            is_complete,
            expires_at: session.expires_at,
        })
    }

    /// Compose all chunks into the final object, record it, and retire the session.
    ///
    /// Only one merge per identity runs at a time; concurrent callers get
    /// `MergeInProgress`.
    #[instrument(
        skip(self, identity),
        fields(owner_id = %identity.owner_id(), content_digest = %identity.content_digest())
    )]
    pub async fn merge(&self, identity: &UploadIdentity) -> UploadResult<MergeResponse> {
        let token = Uuid::new_v4();
        if !self
            .sessions
            .try_acquire_merge_lock(identity, token, self.settings.merge_lock_ttl)
            .await?
        {
            tracing::info!("Merge already in progress");
            return Err(UploadError::MergeInProgress(identity.clone()));
        }

        let result = self.merge_locked(identity).await;

        if let Err(e) = self.sessions.release_merge_lock(identity, token).await {
            tracing::warn!(error = %e, "Failed to release merge lock; it will expire on its own");
        }

        match &result {
            Ok(_) => MERGES.inc(),
            Err(e) => {
                record_merge_failure(e.kind());
                tracing::warn!(error = %e, "Merge failed");
            }
        }
        result
    }

    async fn merge_locked(&self, identity: &UploadIdentity) -> UploadResult<MergeResponse> {
        let start = Instant::now();
        let session = self.require_session(identity).await?;
        let bitmap = self.require_bitmap(identity).await?;
        if !bitmap.is_complete() {
            return Err(UploadError::IncompleteUpload {
                missing: bitmap.missing(),
            });
        }

        let sources = identity.chunk_keys(session.chunk_count);
        let final_path = identity.final_object_key(&session.file_name);
        let content_type = guess_content_type(&session.file_name);

        // A failed compose leaves the session untouched so the merge can be retried.
        self.storage
            .compose(&sources, &final_path, Some(&content_type))
            .await?;
        let actual_size = self.storage.head(&final_path).await?.size;

        let mut warnings = Vec::new();
        if actual_size != session.file_size {
            INTEGRITY_WARNINGS.inc();
            tracing::warn!(
                expected = session.file_size,
                actual = actual_size,
                final_path = %final_path,
                "Merged object size does not match declared file size"
            );
            warnings.push(IntegrityWarning::size_mismatch(
                session.file_size,
                actual_size,
            ));
        }

        let merged_at = OffsetDateTime::now_utc();
        self.ledger
            .record_upload(&NewUploadRecord {
                identity: identity.clone(),
                file_name: session.file_name.clone(),
                final_path: final_path.clone(),
                file_size: actual_size,
                content_type: content_type.clone(),
                created_at: merged_at,
            })
            .await?;

        self.sessions.delete_session(identity).await?;

        if let Err(e) = self.cleanup.schedule_chunk_deletion(identity) {
            CLEANUP_FAILURES.inc();
            tracing::warn!(error = %e, "Failed to schedule chunk cleanup");
        }

        let elapsed = start.elapsed();
        MERGE_DURATION.observe(elapsed.as_secs_f64());
        tracing::info!(
            final_path = %final_path,
            file_size = actual_size,
            chunk_count = session.chunk_count,
            duration_ms = elapsed.as_millis() as u64,
            "Upload merged"
        );

        Ok(MergeResponse {
            file_name: session.file_name,
            final_path,
            file_size: actual_size,
            expected_size: session.file_size,
            content_type,
            chunk_count: session.chunk_count,
            merge_duration_ms: elapsed.as_millis() as u64,
            merged_at,
            warnings,
        })
    }

    /// Latest ledger record for `identity`, if it was ever merged.
    pub async fn find_record(
        &self,
        identity: &UploadIdentity,
    ) -> UploadResult<Option<UploadRecordResponse>> {
        Ok(self.ledger.find_upload(identity).await?.map(record_response))
    }

    /// Check connectivity of the storage and session backends.
    pub async fn health_check(&self) -> UploadResult<()> {
        self.storage.health_check().await?;
        self.sessions.health_check().await?;
        Ok(())
    }

    pub fn storage_backend(&self) -> &'static str {
        self.storage.backend_name()
    }

    pub fn session_backend(&self) -> &'static str {
        self.sessions.backend_name()
    }

    async fn require_session(&self, identity: &UploadIdentity) -> UploadResult<UploadSession> {
        self.sessions
            .get_session(identity)
            .await?
            .ok_or_else(|| UploadError::NotInitialized(identity.clone()))
    }

    async fn require_bitmap(&self, identity: &UploadIdentity) -> UploadResult<ChunkBitmap> {
        self.sessions
            .bitmap(identity)
            .await?
            .ok_or_else(|| UploadError::NotInitialized(identity.clone()))
    }
}

fn init_response(session: &UploadSession, uploaded: u32, resumed: bool) -> InitUploadResponse {
    InitUploadResponse {
        owner_id: session.identity.owner_id().to_string(),
        content_digest: session.identity.content_digest().to_string(),
        file_name: session.file_name.clone(),
        file_size: session.file_size,
        chunk_count: session.chunk_count,
        chunk_size: session.chunk_size,
        uploaded_chunks: uploaded,
        progress: session.progress(uploaded),
        resumed,
        need_upload: uploaded < session.chunk_count,
        expires_at: session.expires_at,
    }
}

fn chunk_response(
    session: &UploadSession,
    chunk_index: u32,
    already_uploaded: bool,
    uploaded: u32,
    chunk_path: String,
) -> ChunkUploadResponse {
    let message = if already_uploaded {
        format!("chunk {chunk_index} already uploaded")
    } else {
        progress_message(session.chunk_count, uploaded)
    };
    ChunkUploadResponse {
        chunk_index,
        already_uploaded,
        uploaded_chunks: uploaded,
        chunk_count: session.chunk_count,
        progress: progress_percent(uploaded, session.chunk_count),
        is_complete: uploaded == session.chunk_count,
        chunk_path,
        message,
    }
}

fn progress_message(chunk_count: u32, uploaded: u32) -> String {
    let remaining = chunk_count.saturating_sub(uploaded);
    if remaining == 0 {
        "all chunks uploaded, ready to merge".to_string()
    } else {
        format!("{remaining} chunks remaining")
    }
}

fn record_response(record: UploadRecord) -> UploadRecordResponse {
    UploadRecordResponse {
        id: record.id,
        owner_id: record.owner_id,
        content_digest: record.content_digest,
        file_name: record.file_name,
        final_path: record.final_path,
        file_size: record.file_size.max(0) as u64,
        content_type: record.content_type,
        created_at: record.created_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_message() {
        assert_eq!(progress_message(5, 5), "all chunks uploaded, ready to merge");
        assert_eq!(progress_message(5, 2), "3 chunks remaining");
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = AppConfig::default();
        config.session.ttl_secs = 60;
        config.session.merge_lock_ttl_secs = 5;
        config.server.max_chunk_count = 10;

        let settings = CoordinatorSettings::from_config(&config);
        assert_eq!(settings.session_ttl, Duration::seconds(60));
        assert_eq!(settings.merge_lock_ttl, Duration::seconds(5));
        assert_eq!(settings.max_chunk_count, 10);
    }
}
