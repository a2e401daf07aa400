//! Application state shared across handlers.

use crate::cleanup::CleanupDispatcher;
use crate::coordinator::{CoordinatorSettings, UploadCoordinator};
use std::sync::Arc;
use tessera_core::config::AppConfig;
use tessera_metadata::{SessionStore, UploadLedger};
use tessera_storage::ObjectStore;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub coordinator: Arc<UploadCoordinator>,
}

impl AppState {
    /// Create a new application state.
    pub fn new(
        config: AppConfig,
        storage: Arc<dyn ObjectStore>,
        sessions: Arc<dyn SessionStore>,
        ledger: Arc<dyn UploadLedger>,
        cleanup: Arc<dyn CleanupDispatcher>,
    ) -> Self {
        let coordinator = UploadCoordinator::new(
            storage,
            sessions,
            ledger,
            cleanup,
            CoordinatorSettings::from_config(&config),
        );
        Self {
            config: Arc::new(config),
            coordinator: Arc::new(coordinator),
        }
    }
}
