//! In-process session store for single-instance deployments and tests.

use crate::error::{MetadataError, MetadataResult};
use crate::session::{ChunkMark, SessionStore};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tessera_core::{ChunkBitmap, UploadIdentity, UploadSession};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct SessionEntry {
    session: UploadSession,
    bitmap: ChunkBitmap,
}

#[derive(Debug, Clone, Copy)]
struct MergeLock {
    token: Uuid,
    expires_at: OffsetDateTime,
}

/// Session store backed by concurrent hash maps. State does not survive a restart.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: DashMap<UploadIdentity, SessionEntry>,
    merge_locks: DashMap<UploadIdentity, MergeLock>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against the live entry for `identity`, evicting it if expired.
    fn with_live<T>(
        &self,
        identity: &UploadIdentity,
        f: impl FnOnce(&mut SessionEntry) -> T,
    ) -> Option<T> {
        let now = OffsetDateTime::now_utc();
        match self.sessions.entry(identity.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().session.is_expired_at(now) {
                    entry.remove();
                    None
                } else {
                    Some(f(entry.get_mut()))
                }
            }
            Entry::Vacant(_) => None,
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get_session(
        &self,
        identity: &UploadIdentity,
    ) -> MetadataResult<Option<UploadSession>> {
        Ok(self.with_live(identity, |entry| entry.session.clone()))
    }

    async fn create_session(&self, session: &UploadSession) -> MetadataResult<bool> {
        let fresh = SessionEntry {
            session: session.clone(),
            bitmap: ChunkBitmap::new(session.chunk_count),
        };
        match self.sessions.entry(session.identity.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().session.is_expired_at(session.created_at) {
                    entry.insert(fresh);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn refresh_ttl(
        &self,
        identity: &UploadIdentity,
        ttl: Duration,
    ) -> MetadataResult<Option<OffsetDateTime>> {
        Ok(self.with_live(identity, |entry| {
            entry.session.expires_at = OffsetDateTime::now_utc() + ttl;
            entry.session.expires_at
        }))
    }

    async fn is_chunk_present(
        &self,
        identity: &UploadIdentity,
        index: u32,
    ) -> MetadataResult<bool> {
        Ok(self
            .with_live(identity, |entry| entry.bitmap.get(index))
            .unwrap_or(false))
    }

    async fn mark_chunk(
        &self,
        identity: &UploadIdentity,
        index: u32,
        ttl: Duration,
    ) -> MetadataResult<ChunkMark> {
        let marked = self.with_live(identity, |entry| {
            let newly_set = entry.bitmap.set(index)?;
            entry.session.expires_at = OffsetDateTime::now_utc() + ttl;
            Ok::<_, tessera_core::Error>(ChunkMark {
                newly_set,
                uploaded: entry.bitmap.count_ones(),
            })
        });
        match marked {
            Some(result) => result.map_err(|e| MetadataError::Constraint(e.to_string())),
            None => Err(MetadataError::NotFound(format!("upload session {identity}"))),
        }
    }

    async fn uploaded_count(&self, identity: &UploadIdentity) -> MetadataResult<u32> {
        Ok(self
            .with_live(identity, |entry| entry.bitmap.count_ones())
            .unwrap_or(0))
    }

    async fn bitmap(&self, identity: &UploadIdentity) -> MetadataResult<Option<ChunkBitmap>> {
        Ok(self.with_live(identity, |entry| entry.bitmap.clone()))
    }

    async fn delete_session(&self, identity: &UploadIdentity) -> MetadataResult<()> {
        self.sessions.remove(identity);
        Ok(())
    }

    async fn try_acquire_merge_lock(
        &self,
        identity: &UploadIdentity,
        token: Uuid,
        ttl: Duration,
    ) -> MetadataResult<bool> {
        let now = OffsetDateTime::now_utc();
        let lock = MergeLock {
            token,
            expires_at: now + ttl,
        };
        match self.merge_locks.entry(identity.clone()) {
            Entry::Occupied(mut entry) => {
                if now >= entry.get().expires_at {
                    entry.insert(lock);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(lock);
                Ok(true)
            }
        }
    }

    async fn release_merge_lock(
        &self,
        identity: &UploadIdentity,
        token: Uuid,
    ) -> MetadataResult<()> {
        self.merge_locks
            .remove_if(identity, |_, lock| lock.token == token);
        Ok(())
    }

    async fn purge_expired(&self, now: OffsetDateTime) -> MetadataResult<Vec<UploadIdentity>> {
        let expired: Vec<UploadIdentity> = self
            .sessions
            .iter()
            .filter(|entry| entry.session.is_expired_at(now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut purged = Vec::with_capacity(expired.len());
        for identity in expired {
            // Re-check under the shard lock; the session may have been refreshed.
            if self
                .sessions
                .remove_if(&identity, |_, entry| entry.session.is_expired_at(now))
                .is_some()
            {
                purged.push(identity);
            }
        }

        self.merge_locks.retain(|_, lock| now < lock.expires_at);
        Ok(purged)
    }

    async fn health_check(&self) -> MetadataResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::SessionParams;

    fn session(digest: &str, chunk_count: u32, ttl: Duration) -> UploadSession {
        UploadSession::new(
            UploadIdentity::new("owner", digest).unwrap(),
            SessionParams {
                file_name: "file.bin".to_string(),
                file_size: u64::from(chunk_count) * 10,
                chunk_count,
                chunk_size: Some(10),
            },
            1000,
            ttl,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_expired_session_reads_as_absent() {
        let store = MemorySessionStore::new();
        let mut s = session("d1", 4, Duration::hours(1));
        s.expires_at = s.created_at - Duration::seconds(1);
        store.sessions.insert(
            s.identity.clone(),
            SessionEntry {
                session: s.clone(),
                bitmap: ChunkBitmap::new(4),
            },
        );

        assert!(store.get_session(&s.identity).await.unwrap().is_none());
        assert!(store.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_mark_chunk_out_of_range_is_constraint() {
        let store = MemorySessionStore::new();
        let s = session("d2", 4, Duration::hours(1));
        store.create_session(&s).await.unwrap();

        let err = store
            .mark_chunk(&s.identity, 4, Duration::hours(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::Constraint(_)));
        assert_eq!(store.uploaded_count(&s.identity).await.unwrap(), 0);
    }
}
