use std::sync::Arc;
use tempfile::TempDir;
use tessera_core::{SessionParams, UploadIdentity, UploadSession};
use tessera_metadata::{MemorySessionStore, SessionStore, SqliteStore};

pub fn identity(digest: &str) -> UploadIdentity {
    UploadIdentity::new("user-1", digest).unwrap()
}

pub fn new_session(digest: &str, chunk_count: u32, ttl: time::Duration) -> UploadSession {
    UploadSession::new(
        identity(digest),
        SessionParams {
            file_name: format!("{digest}.bin"),
            file_size: u64::from(chunk_count) * 1024,
            chunk_count,
            chunk_size: Some(1024),
        },
        100_000,
        ttl,
    )
    .unwrap()
}

pub async fn sqlite_store() -> (TempDir, Arc<SqliteStore>) {
    let dir = TempDir::new().unwrap();
    let store = SqliteStore::new(dir.path().join("metadata.db"), Some(5))
        .await
        .unwrap();
    (dir, Arc::new(store))
}

/// Every session store backend, each with the temp dir it needs kept alive.
pub async fn all_session_stores() -> Vec<(Option<TempDir>, Arc<dyn SessionStore>)> {
    let (dir, sqlite) = sqlite_store().await;
    vec![
        (Some(dir), sqlite as Arc<dyn SessionStore>),
        (None, Arc::new(MemorySessionStore::new())),
    ]
}
