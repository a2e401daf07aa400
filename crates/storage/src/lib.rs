//! Object storage abstraction and backends for Tessera.
//!
//! This crate provides:
//! - Atomic, durable object writes for uploaded chunks
//! - Ordered server-side composition of chunks into a final object
//! - Backends: local filesystem and S3-compatible

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::{filesystem::FilesystemBackend, s3::S3Backend};
pub use error::{StorageError, StorageResult};
pub use traits::{KeyStream, ObjectMeta, ObjectStore};

use std::sync::Arc;
use tessera_core::config::StorageConfig;

/// Create an object store from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn ObjectStore>> {
    config.validate().map_err(StorageError::Config)?;

    let store: Arc<dyn ObjectStore> = match config {
        StorageConfig::Filesystem { path } => {
            tracing::info!(path = %path.display(), "Using filesystem object store");
            Arc::new(FilesystemBackend::new(path).await?)
        }
        StorageConfig::S3 {
            bucket,
            endpoint,
            region,
            prefix,
            access_key_id,
            secret_access_key,
            force_path_style,
        } => {
            tracing::info!(bucket = %bucket, prefix = ?prefix, "Using S3 object store");
            Arc::new(
                S3Backend::new(
                    bucket,
                    endpoint.clone(),
                    region.clone(),
                    prefix.clone(),
                    access_key_id.clone(),
                    secret_access_key.clone(),
                    *force_path_style,
                )
                .await?,
            )
        }
    };
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_filesystem_store_composes_chunks() {
        let temp = tempdir().unwrap();
        let config = StorageConfig::Filesystem {
            path: temp.path().join("store"),
        };

        let store = from_config(&config).await.unwrap();
        assert_eq!(store.backend_name(), "filesystem");
        for (i, part) in [&b"tes"[..], b"se", b"ra"].into_iter().enumerate() {
            store
                .put(&format!("chunks/u/d/chunk_{i}"), Bytes::copy_from_slice(part))
                .await
                .unwrap();
        }

        let sources: Vec<String> = (0..3).map(|i| format!("chunks/u/d/chunk_{i}")).collect();
        let meta = store
            .compose(&sources, "files/u/out.txt", Some("text/plain"))
            .await
            .unwrap();
        assert_eq!(meta.size, 7);
        assert_eq!(store.get("files/u/out.txt").await.unwrap().as_ref(), b"tessera");
    }

    #[tokio::test]
    async fn test_s3_store_from_config() {
        let config = StorageConfig::S3 {
            bucket: "bucket".to_string(),
            endpoint: Some("minio:9000".to_string()),
            region: Some("us-east-1".to_string()),
            prefix: Some("tessera".to_string()),
            access_key_id: None,
            secret_access_key: None,
            force_path_style: true,
        };

        let store = from_config(&config).await.unwrap();
        assert_eq!(store.backend_name(), "s3");
    }

    #[tokio::test]
    async fn test_partial_credentials_rejected() {
        let config = StorageConfig::S3 {
            bucket: "bucket".to_string(),
            endpoint: None,
            region: None,
            prefix: None,
            access_key_id: Some("access".to_string()),
            secret_access_key: None,
            force_path_style: false,
        };

        match from_config(&config).await {
            Ok(_) => panic!("expected error"),
            Err(StorageError::Config(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
}
