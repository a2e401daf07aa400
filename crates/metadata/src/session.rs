//! Session state store: upload metadata plus the chunk presence bitmap.

use crate::error::MetadataResult;
use async_trait::async_trait;
use tessera_core::{ChunkBitmap, UploadIdentity, UploadSession};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// Outcome of marking a chunk present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkMark {
    /// False when the bit was already set.
    pub newly_set: bool,
    /// Popcount after the mark.
    pub uploaded: u32,
}

/// Keyed, TTL-bounded store of in-flight upload sessions.
///
/// Metadata and bitmap are created and destroyed together. Expired sessions
/// read as absent even before `purge_expired` removes them.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Get the live session for `identity`.
    async fn get_session(&self, identity: &UploadIdentity)
    -> MetadataResult<Option<UploadSession>>;

    /// Insert a session with an all-zero bitmap.
    ///
    /// Returns false when a live session already exists; the existing one is
    /// left untouched. An expired session is replaced.
    async fn create_session(&self, session: &UploadSession) -> MetadataResult<bool>;

    /// Slide the expiry to `now + ttl`. Returns the new expiry, or None if
    /// there is no live session.
    async fn refresh_ttl(
        &self,
        identity: &UploadIdentity,
        ttl: Duration,
    ) -> MetadataResult<Option<OffsetDateTime>>;

    /// Whether the presence bit for `index` is set. False if there is no session.
    async fn is_chunk_present(&self, identity: &UploadIdentity, index: u32)
    -> MetadataResult<bool>;

    /// Set the presence bit for `index` and refresh the TTL in one step.
    ///
    /// Fails with `NotFound` if the session is gone and `Constraint` if
    /// `index` is out of range.
    async fn mark_chunk(
        &self,
        identity: &UploadIdentity,
        index: u32,
        ttl: Duration,
    ) -> MetadataResult<ChunkMark>;

    /// Number of chunks marked present. Zero if there is no session.
    async fn uploaded_count(&self, identity: &UploadIdentity) -> MetadataResult<u32>;

    /// Snapshot of the presence bitmap.
    async fn bitmap(&self, identity: &UploadIdentity) -> MetadataResult<Option<ChunkBitmap>>;

    /// Remove the session and its bitmap. Missing sessions are not an error.
    async fn delete_session(&self, identity: &UploadIdentity) -> MetadataResult<()>;

    /// Take the merge-in-progress marker for `identity`.
    ///
    /// Succeeds if no marker exists or the existing one has expired.
    async fn try_acquire_merge_lock(
        &self,
        identity: &UploadIdentity,
        token: Uuid,
        ttl: Duration,
    ) -> MetadataResult<bool>;

    /// Drop the merge marker if it is still held under `token`.
    async fn release_merge_lock(&self, identity: &UploadIdentity, token: Uuid)
    -> MetadataResult<()>;

    /// Delete sessions and merge markers that expired at or before `now`.
    ///
    /// Returns the identities of the sessions removed.
    async fn purge_expired(&self, now: OffsetDateTime) -> MetadataResult<Vec<UploadIdentity>>;

    /// Check backend connectivity.
    async fn health_check(&self) -> MetadataResult<()>;

    /// Static identifier for logging ("sqlite", "memory").
    fn backend_name(&self) -> &'static str;
}
