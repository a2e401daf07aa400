//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

/// A boxed stream of object keys for streaming list operations.
pub type KeyStream = Pin<Box<dyn Stream<Item = StorageResult<String>> + Send>>;

/// Object store holding chunk objects and merged files.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Stat an object without fetching content.
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta>;

    /// Get an object's content.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Put an object atomically. Overwrites any existing object at `key`.
    ///
    /// Returns only once the bytes are durable.
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()>;

    /// Delete an object. Returns `NotFound` if it does not exist.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// List objects with a prefix.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// List objects with a prefix, returning a stream of keys.
    async fn list_stream(&self, prefix: &str) -> StorageResult<KeyStream>;

    /// Concatenate `sources`, in order, into a single object at `dest`.
    ///
    /// `dest` is replaced atomically: readers see either the previous object
    /// or the complete result. Sources are left in place. Returns the
    /// metadata of the composed object.
    async fn compose(
        &self,
        sources: &[String],
        dest: &str,
        content_type: Option<&str>,
    ) -> StorageResult<ObjectMeta>;

    /// Static identifier for the backend type (e.g., "s3", "filesystem").
    /// Used for metrics and logging.
    fn backend_name(&self) -> &'static str;

    /// Verify storage backend connectivity.
    ///
    /// Called at startup and by the health endpoint. The default
    /// implementation returns Ok(()).
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Metadata about a stored object.
#[derive(Clone, Debug)]
pub struct ObjectMeta {
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time (if available).
    pub last_modified: Option<time::OffsetDateTime>,
    /// Content type (if available).
    pub content_type: Option<String>,
}
