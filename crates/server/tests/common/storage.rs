//! Storage test utilities.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tessera_core::UploadSession;
use tessera_metadata::SessionStore;
use tessera_storage::{
    FilesystemBackend, KeyStream, ObjectMeta, ObjectStore, StorageError,
    StorageResult,
};

/// Filesystem-backed store that can be told to fail the next N writes.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct FlakyStore {
    inner: FilesystemBackend,
    put_failures: AtomicU32,
    compose_failures: AtomicU32,
    delete_failures: AtomicU32,
    puts: AtomicU32,
    reinit_after_delete: Mutex<Option<(Arc<dyn SessionStore>, UploadSession)>>,
}

#[allow(dead_code)]
impl FlakyStore {
    pub async fn new(root: &std::path::Path) -> Arc<Self> {
        let inner = FilesystemBackend::new(root)
            .await
            .expect("Failed to create storage backend");
        Arc::new(Self {
            inner,
            put_failures: AtomicU32::new(0),
            compose_failures: AtomicU32::new(0),
            delete_failures: AtomicU32::new(0),
            puts: AtomicU32::new(0),
            reinit_after_delete: Mutex::new(None),
        })
    }

    pub fn fail_next_puts(&self, n: u32) {
        self.put_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_composes(&self, n: u32) {
        self.compose_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_deletes(&self, n: u32) {
        self.delete_failures.store(n, Ordering::SeqCst);
    }

    /// Create `session` right after the next successful delete, as a client
    /// re-initializing the upload mid-cleanup would.
    pub fn reinit_after_next_delete(&self, sessions: Arc<dyn SessionStore>, session: UploadSession) {
        *self.reinit_after_delete.lock().unwrap() = Some((sessions, session));
    }

    /// Number of successful puts so far.
    pub fn put_count(&self) -> u32 {
        self.puts.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn injected(op: &str) -> StorageError {
        StorageError::Io(std::io::Error::other(format!("injected {op} failure")))
    }
}

#[async_trait]
impl ObjectStore for FlakyStore {
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.inner.head(key).await
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        if Self::take_failure(&self.put_failures) {
            return Err(Self::injected("put"));
        }
        self.inner.put(key, data).await?;
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        if Self::take_failure(&self.delete_failures) {
            return Err(Self::injected("delete"));
        }
        self.inner.delete(key).await?;
        let pending = self.reinit_after_delete.lock().unwrap().take();
        if let Some((sessions, session)) = pending {
            sessions
                .create_session(&session)
                .await
                .expect("Failed to re-create session");
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.inner.list(prefix).await
    }

    async fn list_stream(&self, prefix: &str) -> StorageResult<KeyStream> {
        self.inner.list_stream(prefix).await
    }

    async fn compose(
        &self,
        sources: &[String],
        dest: &str,
        content_type: Option<&str>,
    ) -> StorageResult<ObjectMeta> {
        if Self::take_failure(&self.compose_failures) {
            return Err(StorageError::Compose("injected compose failure".to_string()));
        }
        self.inner.compose(sources, dest, content_type).await
    }

    fn backend_name(&self) -> &'static str {
        "flaky"
    }
}
