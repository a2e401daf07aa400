//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::Duration;

/// HTTP server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Maximum accepted chunk body in bytes.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,
    /// Maximum chunk count a session may declare. Bounds bitmap size.
    #[serde(default = "default_max_chunk_count")]
    pub max_chunk_count: u32,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_max_chunk_size() -> u64 {
    crate::MAX_CHUNK_SIZE
}

fn default_max_chunk_count() -> u32 {
    crate::MAX_CHUNK_COUNT
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_chunk_size: default_max_chunk_size(),
            max_chunk_count: default_max_chunk_count(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

/// Storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
    /// S3-compatible storage.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for MinIO, etc.).
        endpoint: Option<String>,
        /// AWS region.
        region: Option<String>,
        /// Optional key prefix.
        prefix: Option<String>,
        /// AWS access key ID. Falls back to the ambient credential chain if not set.
        access_key_id: Option<String>,
        /// AWS secret access key. Falls back to the ambient credential chain if not set.
        secret_access_key: Option<String>,
        /// Force path-style URLs (`endpoint/bucket/key`). Required for MinIO.
        #[serde(default)]
        force_path_style: bool,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/storage"),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::S3 {
                bucket,
                access_key_id,
                secret_access_key,
                ..
            } => {
                if bucket.is_empty() {
                    return Err("s3 config requires a non-empty bucket".to_string());
                }
                match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                    (Some(_), Some(_)) | (None, None) => Ok(()),
                    _ => Err(
                        "s3 config requires both access_key_id and secret_access_key when either is set"
                            .to_string(),
                    ),
                }
            }
            StorageConfig::Filesystem { .. } => Ok(()),
        }
    }
}

/// Durable metadata (ledger, and session state when `session.backend = "sqlite"`).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database.
    Sqlite {
        /// Database file path.
        path: PathBuf,
        /// Seconds a statement waits on a locked database before failing.
        #[serde(default = "default_sqlite_query_timeout_secs")]
        query_timeout_secs: Option<u64>,
    },
}

fn default_sqlite_query_timeout_secs() -> Option<u64> {
    Some(30)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
            query_timeout_secs: default_sqlite_query_timeout_secs(),
        }
    }
}

/// Where session metadata and chunk bitmaps live.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionBackend {
    /// Shared SQLite database from the metadata config.
    #[default]
    Sqlite,
    /// Process-local memory. Single instance only.
    Memory,
}

/// Upload session lifetime settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub backend: SessionBackend,
    /// Sliding TTL of an upload session in seconds.
    #[serde(default = "default_session_ttl_secs")]
    pub ttl_secs: u64,
    /// TTL of the merge-in-progress marker in seconds.
    #[serde(default = "default_merge_lock_ttl_secs")]
    pub merge_lock_ttl_secs: u64,
    /// Interval between sweeps of expired sessions in seconds.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// Upper bound on `session.ttl_secs` so expiry timestamps stay representable.
const MAX_SESSION_TTL_SECS: u64 = 10 * 365 * 86400;

fn default_session_ttl_secs() -> u64 {
    86400 // 24 hours
}

fn default_merge_lock_ttl_secs() -> u64 {
    120
}

fn default_sweep_interval_secs() -> u64 {
    300
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backend: SessionBackend::default(),
            ttl_secs: default_session_ttl_secs(),
            merge_lock_ttl_secs: default_merge_lock_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl SessionConfig {
    /// Session TTL as a Duration.
    pub fn ttl(&self) -> Duration {
        saturating_seconds(self.ttl_secs)
    }

    /// Merge lock TTL as a Duration.
    pub fn merge_lock_ttl(&self) -> Duration {
        saturating_seconds(self.merge_lock_ttl_secs)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Post-merge chunk cleanup settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Capacity of the cleanup task queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Attempts per task before it is dropped.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base backoff between attempts; doubles per attempt.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    500
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl CleanupConfig {
    /// Backoff before retry number `attempt` (1-based), capped at 2^10 times the base.
    pub fn backoff_for(&self, attempt: u32) -> std::time::Duration {
        let exp = attempt.saturating_sub(1).min(10);
        std::time::Duration::from_millis(self.retry_backoff_ms.saturating_mul(1 << exp))
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
}

impl AppConfig {
    /// Create a test configuration rooted at `dir`.
    ///
    /// **For testing only.** Uses filesystem storage and SQLite metadata.
    pub fn for_testing(dir: &std::path::Path) -> Self {
        Self {
            storage: StorageConfig::Filesystem {
                path: dir.join("storage"),
            },
            metadata: MetadataConfig::Sqlite {
                path: dir.join("metadata.db"),
                query_timeout_secs: None,
            },
            ..Self::default()
        }
    }

    /// Validate all sections. Returns the first problem found.
    pub fn validate(&self) -> crate::Result<()> {
        self.storage.validate().map_err(crate::Error::Config)?;

        let checks: [(bool, &str); 8] = [
            (self.server.max_chunk_size == 0, "server.max_chunk_size cannot be 0"),
            (self.server.max_chunk_count == 0, "server.max_chunk_count cannot be 0"),
            (self.session.ttl_secs == 0, "session.ttl_secs cannot be 0"),
            (
                self.session.ttl_secs > MAX_SESSION_TTL_SECS,
                "session.ttl_secs cannot exceed 10 years",
            ),
            (
                self.session.merge_lock_ttl_secs == 0,
                "session.merge_lock_ttl_secs cannot be 0",
            ),
            (
                self.session.sweep_interval_secs == 0,
                "session.sweep_interval_secs cannot be 0",
            ),
            (
                self.cleanup.queue_capacity == 0,
                "cleanup.queue_capacity cannot be 0",
            ),
            (self.cleanup.max_attempts == 0, "cleanup.max_attempts cannot be 0"),
        ];
        if let Some((_, msg)) = checks.iter().find(|(bad, _)| *bad) {
            return Err(crate::Error::Config((*msg).to_string()));
        }
        Ok(())
    }
}

fn saturating_seconds(secs: u64) -> Duration {
    // Saturate at i64::MAX to prevent overflow wrapping to negative
    Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.session.ttl_secs, 86400);
        assert_eq!(config.session.backend, SessionBackend::Sqlite);
        assert!(config.server.metrics_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let json = r#"{"session": {"backend": "memory", "ttl_secs": 60}}"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.session.backend, SessionBackend::Memory);
        assert_eq!(config.session.ttl(), Duration::seconds(60));
        assert_eq!(config.session.merge_lock_ttl_secs, 120);
        assert_eq!(config.cleanup.max_attempts, 5);
    }

    #[test]
    fn test_storage_config_s3_tagged() {
        let json = r#"{"type": "s3", "bucket": "uploads", "endpoint": "minio:9000", "region": null, "prefix": null, "access_key_id": null, "secret_access_key": null}"#;
        let config: StorageConfig = serde_json::from_str(json).unwrap();
        match config {
            StorageConfig::S3 {
                bucket,
                force_path_style,
                ..
            } => {
                assert_eq!(bucket, "uploads");
                assert!(!force_path_style);
            }
            _ => panic!("expected S3 config"),
        }
    }

    #[test]
    fn test_storage_config_s3_validate_partial_credentials() {
        let invalid = StorageConfig::S3 {
            bucket: "bucket".to_string(),
            endpoint: None,
            region: None,
            prefix: None,
            access_key_id: Some("access-key".to_string()),
            secret_access_key: None,
            force_path_style: false,
        };
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_ttl() {
        let mut config = AppConfig::default();
        config.session.ttl_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("session.ttl_secs"));
    }

    #[test]
    fn test_ttl_saturates() {
        let config = SessionConfig {
            ttl_secs: u64::MAX,
            ..SessionConfig::default()
        };
        assert_eq!(config.ttl(), Duration::seconds(i64::MAX));
    }

    #[test]
    fn test_cleanup_backoff_doubles() {
        let config = CleanupConfig {
            retry_backoff_ms: 100,
            ..CleanupConfig::default()
        };
        assert_eq!(config.backoff_for(1).as_millis(), 100);
        assert_eq!(config.backoff_for(2).as_millis(), 200);
        assert_eq!(config.backoff_for(4).as_millis(), 800);
        assert_eq!(config.backoff_for(50).as_millis(), 102_400);
    }
}
