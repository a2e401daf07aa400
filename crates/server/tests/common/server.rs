//! Server test utilities.

use super::storage::FlakyStore;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tessera_core::UploadIdentity;
use tessera_core::config::{AppConfig, SessionBackend};
use tessera_metadata::{MemorySessionStore, SessionStore, SqliteStore, UploadLedger};
use tessera_server::cleanup::{CleanupDispatcher, CleanupError};
use tessera_server::{AppState, UploadCoordinator, create_router};

/// Dispatcher that records every scheduled identity.
#[derive(Default)]
#[allow(dead_code)]
pub struct RecordingDispatcher {
    scheduled: Mutex<Vec<UploadIdentity>>,
}

#[allow(dead_code)]
impl RecordingDispatcher {
    pub fn scheduled(&self) -> Vec<UploadIdentity> {
        self.scheduled.lock().unwrap().clone()
    }
}

impl CleanupDispatcher for RecordingDispatcher {
    fn schedule_chunk_deletion(&self, identity: &UploadIdentity) -> Result<(), CleanupError> {
        self.scheduled.lock().unwrap().push(identity.clone());
        Ok(())
    }
}

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    pub storage: Arc<FlakyStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub ledger: Arc<dyn UploadLedger>,
    pub cleanup: Arc<RecordingDispatcher>,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    /// Create a new test server with temporary storage and SQLite metadata.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server with custom config modifications.
    pub async fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let mut config = AppConfig::for_testing(temp_dir.path());
        modifier(&mut config);

        let storage = FlakyStore::new(&temp_dir.path().join("storage")).await;

        let sqlite = Arc::new(
            SqliteStore::new(temp_dir.path().join("metadata.db"), None)
                .await
                .expect("Failed to create metadata store"),
        );
        let sessions: Arc<dyn SessionStore> = match config.session.backend {
            SessionBackend::Sqlite => sqlite.clone(),
            SessionBackend::Memory => Arc::new(MemorySessionStore::new()),
        };
        let ledger: Arc<dyn UploadLedger> = sqlite;
        let cleanup = Arc::new(RecordingDispatcher::default());

        let state = AppState::new(
            config,
            storage.clone(),
            sessions.clone(),
            ledger.clone(),
            cleanup.clone(),
        );
        let router = create_router(state.clone());

        Self {
            router,
            state,
            storage,
            sessions,
            ledger,
            cleanup,
            _temp_dir: temp_dir,
        }
    }

    pub fn coordinator(&self) -> Arc<UploadCoordinator> {
        self.state.coordinator.clone()
    }
}
