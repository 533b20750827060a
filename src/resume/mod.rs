//! Checkpoint persistence
//!
//! [`CheckpointStore`] is the persistence seam for crash recovery. Two stores
//! ship with the engine: [`MemoryCheckpointStore`] keeps every checkpoint in
//! memory, and [`FileCheckpointStore`] keeps one atomically-replaced JSON
//! state file per job.

pub mod checkpoint;
pub mod state;

pub use checkpoint::Checkpoint;
pub use state::{FileCheckpointStore, JobState, StateMetadata};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Checkpoint store errors
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error
    #[error("deserialization error: {0}")]
    DeserializationError(String),

    /// Lock acquisition failed
    #[error("lock error: {0}")]
    LockError(String),

    /// Schema version mismatch
    #[error("schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch {
        /// Expected schema version
        expected: String,
        /// Found schema version
        found: String,
    },

    /// State file exceeds maximum allowed size
    #[error("state file too large: {size} bytes exceeds maximum {max} bytes")]
    StateTooLarge {
        /// Actual file size in bytes
        size: u64,
        /// Maximum allowed size in bytes
        max: u64,
    },
}

/// Durable checkpoint storage
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist `checkpoint`; it must be durable when this returns `Ok`
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    /// Latest checkpoint for `job_id`
    async fn load_checkpoint(&self, job_id: Uuid) -> Result<Option<Checkpoint>, CheckpointError>;

    /// Jobs with at least one checkpoint
    async fn list_jobs(&self) -> Result<Vec<Uuid>, CheckpointError>;
}

/// In-memory store that keeps every checkpoint ever written
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    history: Mutex<HashMap<Uuid, Vec<Checkpoint>>>,
    failing: AtomicBool,
}

impl MemoryCheckpointStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// All checkpoints written for `job_id`, oldest first
    pub async fn history(&self, job_id: Uuid) -> Vec<Checkpoint> {
        self.history
            .lock()
            .await
            .get(&job_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Make subsequent writes fail, simulating a full or read-only disk
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CheckpointError::IoError("checkpoint store unavailable".to_string()));
        }
        self.history
            .lock()
            .await
            .entry(checkpoint.job_id)
            .or_default()
            .push(checkpoint.clone());
        Ok(())
    }

    async fn load_checkpoint(&self, job_id: Uuid) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self
            .history
            .lock()
            .await
            .get(&job_id)
            .and_then(|h| h.last().cloned()))
    }

    async fn list_jobs(&self) -> Result<Vec<Uuid>, CheckpointError> {
        let mut jobs: Vec<Uuid> = self.history.lock().await.keys().copied().collect();
        jobs.sort();
        Ok(jobs)
    }
}
