//! Session state and upload ledger for Tessera.
//!
//! This crate provides:
//! - The session state store: per-upload metadata plus a chunk presence
//!   bitmap, bounded by a sliding TTL, and short-lived merge markers
//! - The upload ledger: durable records of completed uploads
//! - Backends: SQLite (both roles) and in-memory (sessions only)

pub mod error;
pub mod ledger;
pub mod memory;
pub mod models;
pub mod session;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use ledger::UploadLedger;
pub use memory::MemorySessionStore;
pub use models::{NewUploadRecord, UploadRecord};
pub use session::{ChunkMark, SessionStore};
pub use store::SqliteStore;

use std::sync::Arc;
use tessera_core::config::{MetadataConfig, SessionBackend};

/// Metadata backends built from configuration.
pub struct MetadataStores {
    pub sessions: Arc<dyn SessionStore>,
    pub ledger: Arc<dyn UploadLedger>,
}

/// Create the session store and ledger from configuration.
///
/// The ledger always lives in SQLite. Sessions share that database unless
/// the memory backend is selected.
pub async fn from_config(
    config: &MetadataConfig,
    session_backend: SessionBackend,
) -> MetadataResult<MetadataStores> {
    let sqlite = match config {
        MetadataConfig::Sqlite {
            path,
            query_timeout_secs,
        } => Arc::new(SqliteStore::new(path, *query_timeout_secs).await?),
    };

    let sessions: Arc<dyn SessionStore> = match session_backend {
        SessionBackend::Sqlite => sqlite.clone(),
        SessionBackend::Memory => {
            tracing::info!("Using in-memory session store; sessions will not survive a restart");
            Arc::new(MemorySessionStore::new())
        }
    };

    Ok(MetadataStores {
        sessions,
        ledger: sqlite,
    })
}
