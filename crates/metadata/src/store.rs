//! SQLite implementation of the session store and upload ledger.

use crate::error::{MetadataError, MetadataResult};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// SQLite-backed metadata store.
///
/// Holds both the ephemeral session state and the durable upload ledger.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Create a new SQLite store and apply the schema.
    ///
    /// `query_timeout_secs` bounds how long a statement waits on a locked
    /// database before failing.
    pub async fn new(
        path: impl AsRef<Path>,
        query_timeout_secs: Option<u64>,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();
        let busy_timeout = Duration::from_secs(query_timeout_secs.unwrap_or(30));

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(busy_timeout);

        let pool = SqlitePoolOptions::new()
            // SQLite permits limited write concurrency; a single connection
            // serializes every read-modify-write on the bitmap.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Apply the schema. Idempotent.
    pub async fn migrate(&self) -> MetadataResult<()> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    /// Check database connectivity.
    pub async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

mod sqlite_impl {
    use super::*;
    use crate::ledger::UploadLedger;
    use crate::models::*;
    use crate::session::{ChunkMark, SessionStore};
    use async_trait::async_trait;
    use tessera_core::{ChunkBitmap, UploadIdentity, UploadSession};
    use time::OffsetDateTime;
    use uuid::Uuid;

    fn now_millis() -> i64 {
        to_unix_millis(OffsetDateTime::now_utc())
    }

    #[async_trait]
    impl SessionStore for SqliteStore {
        async fn get_session(
            &self,
            identity: &UploadIdentity,
        ) -> MetadataResult<Option<UploadSession>> {
            let row = sqlx::query_as::<_, UploadSessionRow>(
                "SELECT * FROM upload_sessions WHERE owner_id = ? AND content_digest = ? AND expires_at > ?",
            )
            .bind(identity.owner_id())
            .bind(identity.content_digest())
            .bind(now_millis())
            .fetch_optional(&self.pool)
            .await?;
            row.map(UploadSessionRow::into_session).transpose()
        }

        async fn create_session(&self, session: &UploadSession) -> MetadataResult<bool> {
            let row =
                UploadSessionRow::from_session(session, &ChunkBitmap::new(session.chunk_count))?;
            // An expired row is overwritten in place; a live one wins.
            let result = sqlx::query(
                r#"
                INSERT INTO upload_sessions (
                    owner_id, content_digest, file_name, file_size, chunk_count,
                    chunk_size, bitmap, created_at, expires_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (owner_id, content_digest) DO UPDATE SET
                    file_name = excluded.file_name,
                    file_size = excluded.file_size,
                    chunk_count = excluded.chunk_count,
                    chunk_size = excluded.chunk_size,
                    bitmap = excluded.bitmap,
                    created_at = excluded.created_at,
                    expires_at = excluded.expires_at
                WHERE upload_sessions.expires_at <= excluded.created_at
                "#,
            )
            .bind(&row.owner_id)
            .bind(&row.content_digest)
            .bind(&row.file_name)
            .bind(row.file_size)
            .bind(row.chunk_count)
            .bind(row.chunk_size)
            .bind(&row.bitmap)
            .bind(row.created_at)
            .bind(row.expires_at)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn refresh_ttl(
            &self,
            identity: &UploadIdentity,
            ttl: time::Duration,
        ) -> MetadataResult<Option<OffsetDateTime>> {
            let now = OffsetDateTime::now_utc();
            let expires_at = now + ttl;
            let result = sqlx::query(
                "UPDATE upload_sessions SET expires_at = ? WHERE owner_id = ? AND content_digest = ? AND expires_at > ?",
            )
            .bind(to_unix_millis(expires_at))
            .bind(identity.owner_id())
            .bind(identity.content_digest())
            .bind(to_unix_millis(now))
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Ok(None);
            }
            // Reported at the stored precision.
            Ok(Some(from_unix_millis(to_unix_millis(expires_at))?))
        }

        async fn is_chunk_present(
            &self,
            identity: &UploadIdentity,
            index: u32,
        ) -> MetadataResult<bool> {
            Ok(self
                .bitmap(identity)
                .await?
                .is_some_and(|bitmap| bitmap.get(index)))
        }

        async fn mark_chunk(
            &self,
            identity: &UploadIdentity,
            index: u32,
            ttl: time::Duration,
        ) -> MetadataResult<ChunkMark> {
            let now = OffsetDateTime::now_utc();
            let mut tx = self.pool.begin().await?;

            let row: Option<(i64, Vec<u8>)> = sqlx::query_as(
                "SELECT chunk_count, bitmap FROM upload_sessions WHERE owner_id = ? AND content_digest = ? AND expires_at > ?",
            )
            .bind(identity.owner_id())
            .bind(identity.content_digest())
            .bind(to_unix_millis(now))
            .fetch_optional(&mut *tx)
            .await?;

            let Some((chunk_count, bytes)) = row else {
                return Err(MetadataError::NotFound(format!("upload session {identity}")));
            };
            let chunk_count = u32::try_from(chunk_count).map_err(|_| {
                MetadataError::Corrupt(format!("chunk_count {chunk_count} for {identity}"))
            })?;
            let mut bitmap = ChunkBitmap::from_bytes(chunk_count, &bytes);
            let newly_set = bitmap
                .set(index)
                .map_err(|e| MetadataError::Constraint(e.to_string()))?;

            sqlx::query(
                "UPDATE upload_sessions SET bitmap = ?, expires_at = ? WHERE owner_id = ? AND content_digest = ?",
            )
            .bind(bitmap.to_bytes())
            .bind(to_unix_millis(now + ttl))
            .bind(identity.owner_id())
            .bind(identity.content_digest())
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;

            Ok(ChunkMark {
                newly_set,
                uploaded: bitmap.count_ones(),
            })
        }

        async fn uploaded_count(&self, identity: &UploadIdentity) -> MetadataResult<u32> {
            Ok(self
                .bitmap(identity)
                .await?
                .map_or(0, |bitmap| bitmap.count_ones()))
        }

        async fn bitmap(&self, identity: &UploadIdentity) -> MetadataResult<Option<ChunkBitmap>> {
            let row: Option<(i64, Vec<u8>)> = sqlx::query_as(
                "SELECT chunk_count, bitmap FROM upload_sessions WHERE owner_id = ? AND content_digest = ? AND expires_at > ?",
            )
            .bind(identity.owner_id())
            .bind(identity.content_digest())
            .bind(now_millis())
            .fetch_optional(&self.pool)
            .await?;

            row.map(|(chunk_count, bytes)| {
                u32::try_from(chunk_count)
                    .map(|count| ChunkBitmap::from_bytes(count, &bytes))
                    .map_err(|_| {
                        MetadataError::Corrupt(format!("chunk_count {chunk_count} for {identity}"))
                    })
            })
            .transpose()
        }

        async fn delete_session(&self, identity: &UploadIdentity) -> MetadataResult<()> {
            sqlx::query("DELETE FROM upload_sessions WHERE owner_id = ? AND content_digest = ?")
                .bind(identity.owner_id())
                .bind(identity.content_digest())
                .execute(&self.pool)
                .await?;
            Ok(())
        }

        async fn try_acquire_merge_lock(
            &self,
            identity: &UploadIdentity,
            token: Uuid,
            ttl: time::Duration,
        ) -> MetadataResult<bool> {
            let now = OffsetDateTime::now_utc();
            let result = sqlx::query(
                r#"
                INSERT INTO merge_locks (owner_id, content_digest, token, expires_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT (owner_id, content_digest) DO UPDATE SET
                    token = excluded.token,
                    expires_at = excluded.expires_at
                WHERE merge_locks.expires_at <= ?
                "#,
            )
            .bind(identity.owner_id())
            .bind(identity.content_digest())
            .bind(token)
            .bind(to_unix_millis(now + ttl))
            .bind(to_unix_millis(now))
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn release_merge_lock(
            &self,
            identity: &UploadIdentity,
            token: Uuid,
        ) -> MetadataResult<()> {
            sqlx::query(
                "DELETE FROM merge_locks WHERE owner_id = ? AND content_digest = ? AND token = ?",
            )
            .bind(identity.owner_id())
            .bind(identity.content_digest())
            .bind(token)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn purge_expired(&self, now: OffsetDateTime) -> MetadataResult<Vec<UploadIdentity>> {
            let cutoff = to_unix_millis(now);
            let mut tx = self.pool.begin().await?;

            let expired: Vec<(String, String)> = sqlx::query_as(
                "DELETE FROM upload_sessions WHERE expires_at <= ? RETURNING owner_id, content_digest",
            )
            .bind(cutoff)
            .fetch_all(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM merge_locks WHERE expires_at <= ?")
                .bind(cutoff)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;

            let mut identities = Vec::with_capacity(expired.len());
            for (owner_id, content_digest) in expired {
                match UploadIdentity::new(owner_id, content_digest) {
                    Ok(identity) => identities.push(identity),
                    Err(e) => tracing::warn!(error = %e, "Purged session with invalid identity"),
                }
            }
            Ok(identities)
        }

        async fn health_check(&self) -> MetadataResult<()> {
            SqliteStore::health_check(self).await
        }

        fn backend_name(&self) -> &'static str {
            "sqlite"
        }
    }

    #[async_trait]
    impl UploadLedger for SqliteStore {
        async fn record_upload(&self, record: &NewUploadRecord) -> MetadataResult<UploadRecord> {
            let file_size = size_to_db("file_size", record.file_size)?;
            let row = sqlx::query_as::<_, UploadRecord>(
                r#"
                INSERT INTO upload_records (
                    owner_id, content_digest, file_name, final_path,
                    file_size, content_type, created_at, is_deleted
                ) VALUES (?, ?, ?, ?, ?, ?, ?, 0)
                RETURNING *
                "#,
            )
            .bind(record.identity.owner_id())
            .bind(record.identity.content_digest())
            .bind(&record.file_name)
            .bind(&record.final_path)
            .bind(file_size)
            .bind(&record.content_type)
            .bind(record.created_at)
            .fetch_one(&self.pool)
            .await?;
            Ok(row)
        }

        async fn find_upload(
            &self,
            identity: &UploadIdentity,
        ) -> MetadataResult<Option<UploadRecord>> {
            let row = sqlx::query_as::<_, UploadRecord>(
                r#"
                SELECT * FROM upload_records
                WHERE owner_id = ? AND content_digest = ? AND is_deleted = 0
                ORDER BY id DESC
                LIMIT 1
                "#,
            )
            .bind(identity.owner_id())
            .bind(identity.content_digest())
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }
    }
}

const SCHEMA_SQL: &str = r#"
-- In-flight upload sessions; the presence bitmap lives in the same row
CREATE TABLE IF NOT EXISTS upload_sessions (
    owner_id TEXT NOT NULL,
    content_digest TEXT NOT NULL,
    file_name TEXT NOT NULL,
    file_size INTEGER NOT NULL,
    chunk_count INTEGER NOT NULL,
    chunk_size INTEGER NOT NULL,
    bitmap BLOB NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    PRIMARY KEY (owner_id, content_digest)
);
CREATE INDEX IF NOT EXISTS idx_upload_sessions_expires ON upload_sessions(expires_at);

-- Merge-in-progress markers
CREATE TABLE IF NOT EXISTS merge_locks (
    owner_id TEXT NOT NULL,
    content_digest TEXT NOT NULL,
    token BLOB NOT NULL,
    expires_at INTEGER NOT NULL,
    PRIMARY KEY (owner_id, content_digest)
);

-- Completed uploads
CREATE TABLE IF NOT EXISTS upload_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id TEXT NOT NULL,
    content_digest TEXT NOT NULL,
    file_name TEXT NOT NULL,
    final_path TEXT NOT NULL,
    file_size INTEGER NOT NULL,
    content_type TEXT NOT NULL,
    created_at TEXT NOT NULL,
    is_deleted INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_upload_records_identity ON upload_records(owner_id, content_digest);
"#;
