//! Tessera chunked-upload server library.

pub mod cleanup;
pub mod coordinator;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod routes;
pub mod state;

pub use cleanup::{
    ChannelCleanupDispatcher, ChunkCleanupTask, CleanupDispatcher, CleanupError, CleanupWorker,
    spawn_session_sweeper, sweep_expired_sessions,
};
pub use coordinator::{CoordinatorSettings, UploadCoordinator};
pub use error::{ApiError, ApiResult, UploadError, UploadResult};
pub use routes::create_router;
pub use state::AppState;
