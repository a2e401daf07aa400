//! Asynchronous deletion of chunk objects after merge or expiry.
//!
//! The coordinator only enqueues work; a background [`CleanupWorker`]
//! drains the queue and retries failed deletions with exponential backoff.
//! Nothing here reports back to the caller that triggered the cleanup.

use crate::metrics::{CLEANUP_FAILURES, CLEANUP_OBJECTS_DELETED, SESSIONS_EXPIRED};
use std::sync::Arc;
use std::time::Duration;
use tessera_core::UploadIdentity;
use tessera_core::config::CleanupConfig;
use tessera_core::identity::CHUNK_NAMESPACE;
use tessera_metadata::SessionStore;
use tessera_storage::{ObjectStore, StorageError};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::instrument;

/// Failure to hand a task to the cleanup queue.
#[derive(Debug, thiserror::Error)]
pub enum CleanupError {
    #[error("cleanup queue is full")]
    QueueFull,

    #[error("cleanup queue is closed")]
    QueueClosed,
}

/// Fire-and-forget scheduling of chunk deletion.
pub trait CleanupDispatcher: Send + Sync {
    /// Enqueue deletion of every chunk object of `identity`. Never blocks.
    fn schedule_chunk_deletion(&self, identity: &UploadIdentity) -> Result<(), CleanupError>;
}

/// One unit of cleanup work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkCleanupTask {
    pub identity: UploadIdentity,
    /// Storage prefix to clear. Must be the identity's chunk prefix.
    pub prefix: String,
    /// 1-based attempt number.
    pub attempt: u32,
}

impl ChunkCleanupTask {
    pub fn new(identity: UploadIdentity) -> Self {
        let prefix = identity.chunk_prefix();
        Self {
            identity,
            prefix,
            attempt: 1,
        }
    }

    fn next_attempt(mut self) -> Self {
        self.attempt += 1;
        self
    }

    /// The prefix must name this identity's chunk directory and nothing else.
    fn validate(&self) -> Result<(), String> {
        let expected = self.identity.chunk_prefix();
        if self.prefix != expected || !self.prefix.starts_with(&format!("{CHUNK_NAMESPACE}/")) {
            return Err(format!(
                "prefix {:?} does not match chunk prefix {:?}",
                self.prefix, expected
            ));
        }
        Ok(())
    }
}

/// Dispatcher backed by a bounded tokio channel.
#[derive(Clone, Debug)]
pub struct ChannelCleanupDispatcher {
    tx: mpsc::Sender<ChunkCleanupTask>,
}

impl ChannelCleanupDispatcher {
    /// Create a dispatcher and the receiving end for a [`CleanupWorker`].
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ChunkCleanupTask>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl CleanupDispatcher for ChannelCleanupDispatcher {
    fn schedule_chunk_deletion(&self, identity: &UploadIdentity) -> Result<(), CleanupError> {
        self.tx
            .try_send(ChunkCleanupTask::new(identity.clone()))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => CleanupError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => CleanupError::QueueClosed,
            })
    }
}

/// Drains the cleanup queue.
///
/// Retries re-enter the same queue through a weak sender, so the worker
/// stops once every dispatcher has been dropped.
pub struct CleanupWorker {
    storage: Arc<dyn ObjectStore>,
    sessions: Arc<dyn SessionStore>,
    rx: mpsc::Receiver<ChunkCleanupTask>,
    retry_tx: mpsc::WeakSender<ChunkCleanupTask>,
    config: CleanupConfig,
}

impl CleanupWorker {
    pub fn new(
        storage: Arc<dyn ObjectStore>,
        sessions: Arc<dyn SessionStore>,
        dispatcher: &ChannelCleanupDispatcher,
        rx: mpsc::Receiver<ChunkCleanupTask>,
        config: CleanupConfig,
    ) -> Self {
        Self {
            storage,
            sessions,
            rx,
            retry_tx: dispatcher.tx.downgrade(),
            config,
        }
    }

    /// Spawn the worker loop.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        tracing::info!(
            max_attempts = self.config.max_attempts,
            "Cleanup worker started"
        );
        while let Some(task) = self.rx.recv().await {
            self.handle(task).await;
        }
        tracing::info!("Cleanup worker stopped");
    }

    async fn handle(&self, task: ChunkCleanupTask) {
        if let Err(reason) = task.validate() {
            tracing::error!(identity = %task.identity, %reason, "Rejected malformed cleanup task");
            return;
        }

        match self.process(&task).await {
            Ok(deleted) => {
                CLEANUP_OBJECTS_DELETED.inc_by(deleted as u64);
                tracing::info!(
                    identity = %task.identity,
                    deleted,
                    attempt = task.attempt,
                    "Chunk cleanup completed"
                );
            }
            Err(e) => {
                CLEANUP_FAILURES.inc();
                if task.attempt >= self.config.max_attempts {
                    tracing::error!(
                        identity = %task.identity,
                        attempts = task.attempt,
                        error = %e,
                        "Chunk cleanup abandoned"
                    );
                    return;
                }
                let delay = self.config.backoff_for(task.attempt);
                tracing::warn!(
                    identity = %task.identity,
                    attempt = task.attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "Chunk cleanup failed, will retry"
                );
                self.schedule_retry(task.next_attempt(), delay);
            }
        }
    }

    fn schedule_retry(&self, task: ChunkCleanupTask, delay: Duration) {
        let retry_tx = self.retry_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(tx) = retry_tx.upgrade() else {
                tracing::warn!(identity = %task.identity, "Cleanup queue closed, dropping retry");
                return;
            };
            if tx.send(task).await.is_err() {
                tracing::warn!("Cleanup queue closed, dropping retry");
            }
        });
    }

    /// Delete every object under the task's prefix. Returns how many were deleted.
    ///
    /// Stops as soon as the identity has a live session again, since its chunk
    /// objects then belong to the new upload. The session is checked before
    /// every delete; a re-init landing between a check and its delete can
    /// still lose that one chunk.
    #[instrument(skip(self, task), fields(identity = %task.identity, attempt = task.attempt))]
    pub async fn process(&self, task: &ChunkCleanupTask) -> Result<usize, StorageError> {
        if self.has_live_session(task).await {
            tracing::info!("Upload re-initialized, skipping chunk cleanup");
            return Ok(0);
        }

        let keys = self.storage.list(&task.prefix).await?;
        let mut deleted = 0;
        for key in keys {
            if self.has_live_session(task).await {
                tracing::info!(deleted, "Upload re-initialized mid-cleanup, stopping");
                break;
            }
            match self.storage.delete(&key).await {
                Ok(()) => deleted += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(deleted)
    }

    async fn has_live_session(&self, task: &ChunkCleanupTask) -> bool {
        match self.sessions.get_session(&task.identity).await {
            Ok(session) => session.is_some(),
            Err(e) => {
                tracing::warn!(error = %e, "Session lookup failed, cleaning up anyway");
                false
            }
        }
    }
}

/// Remove expired sessions and schedule deletion of their chunks.
///
/// Returns the number of sessions removed.
pub async fn sweep_expired_sessions(
    sessions: &dyn SessionStore,
    cleanup: &dyn CleanupDispatcher,
    now: OffsetDateTime,
) -> usize {
    let purged = match sessions.purge_expired(now).await {
        Ok(purged) => purged,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to purge expired sessions");
            return 0;
        }
    };

    for identity in &purged {
        if let Err(e) = cleanup.schedule_chunk_deletion(identity) {
            CLEANUP_FAILURES.inc();
            tracing::warn!(identity = %identity, error = %e, "Failed to schedule cleanup for expired session");
        }
    }

    if !purged.is_empty() {
        SESSIONS_EXPIRED.inc_by(purged.len() as u64);
        tracing::info!(count = purged.len(), "Evicted expired upload sessions");
    }
    purged.len()
}

/// Spawn the periodic session sweeper.
pub fn spawn_session_sweeper(
    sessions: Arc<dyn SessionStore>,
    cleanup: Arc<dyn CleanupDispatcher>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(
            interval_secs = interval.as_secs(),
            "Session sweeper started"
        );
        loop {
            ticker.tick().await;
            sweep_expired_sessions(sessions.as_ref(), cleanup.as_ref(), OffsetDateTime::now_utc())
                .await;
        }
    })
}
