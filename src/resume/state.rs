//! File-backed checkpoint store
//!
//! One JSON state file per job, replaced atomically on every checkpoint.
//! A sibling `.lock` file coordinates concurrent readers and writers.

use super::{Checkpoint, CheckpointError, CheckpointStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fd_lock::RwLock;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Current job state schema version
const SCHEMA_VERSION: &str = "1.0.0";

/// Maximum allowed state file size (10 MB)
pub const MAX_STATE_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Checkpoints retained per job; only the newest is needed to resume
pub const MAX_CHECKPOINTS: usize = 5;

/// Persisted state of a single job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobState {
    schema_version: String,
    job_id: Uuid,
    checkpoints: Vec<Checkpoint>,
    metadata: StateMetadata,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl JobState {
    /// Empty state for `job_id`
    pub fn new(job_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            job_id,
            checkpoints: Vec::new(),
            metadata: StateMetadata::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Job id
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Retained checkpoints, oldest first
    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    /// Newest checkpoint
    pub fn latest(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }

    /// Running totals
    pub fn metadata(&self) -> &StateMetadata {
        &self.metadata
    }

    /// Append a checkpoint, pruning history beyond [`MAX_CHECKPOINTS`]
    pub fn add_checkpoint(&mut self, checkpoint: Checkpoint) {
        self.metadata.total_checkpoints += 1;
        self.metadata.records_emitted = checkpoint.records_emitted;
        self.metadata.pages_completed = checkpoint.pages_completed;

        self.checkpoints.push(checkpoint);
        if self.checkpoints.len() > MAX_CHECKPOINTS {
            let drain_count = self.checkpoints.len() - MAX_CHECKPOINTS;
            self.checkpoints.drain(0..drain_count);
            debug!(
                job_id = %self.job_id,
                retained_checkpoints = self.checkpoints.len(),
                "Pruned old checkpoints"
            );
        }

        self.updated_at = Utc::now();
    }

    /// Save state with an exclusive lock and an atomic rename
    pub fn save(&self, path: &Path) -> Result<(), CheckpointError> {
        debug!(
            path = %path.display(),
            checkpoints = self.checkpoints.len(),
            "Saving job state"
        );

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CheckpointError::IoError(e.to_string()))?;
        }

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| CheckpointError::SerializationError(e.to_string()))?;

        let mut lock = RwLock::new(open_lock_file(path)?);
        let _guard = lock
            .write()
            .map_err(|e| CheckpointError::LockError(format!("Failed to acquire write lock: {e}")))?;

        let parent_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp_file = tempfile::NamedTempFile::new_in(parent_dir)
            .map_err(|e| CheckpointError::IoError(format!("Failed to create temp file: {e}")))?;
        temp_file
            .write_all(json.as_bytes())
            .map_err(|e| CheckpointError::IoError(format!("Failed to write temp file: {e}")))?;
        temp_file
            .flush()
            .map_err(|e| CheckpointError::IoError(format!("Failed to flush temp file: {e}")))?;
        temp_file
            .as_file()
            .sync_all()
            .map_err(|e| CheckpointError::IoError(format!("Failed to sync temp file: {e}")))?;
        temp_file
            .persist(path)
            .map_err(|e| CheckpointError::IoError(format!("Failed to persist temp file: {e}")))?;

        // The rename is only durable once the directory entry is synced.
        if let Some(parent) = path.parent() {
            if let Ok(dir) = std::fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        debug!(
            path = %path.display(),
            records_emitted = self.metadata.records_emitted,
            "Job state saved"
        );
        Ok(())
    }

    /// Load state under a shared lock
    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        let lock = RwLock::new(open_lock_file(path)?);
        let _guard = lock
            .read()
            .map_err(|e| CheckpointError::LockError(format!("Failed to acquire read lock: {e}")))?;

        let metadata = std::fs::metadata(path).map_err(|e| CheckpointError::IoError(e.to_string()))?;
        if metadata.len() > MAX_STATE_FILE_SIZE {
            return Err(CheckpointError::StateTooLarge {
                size: metadata.len(),
                max: MAX_STATE_FILE_SIZE,
            });
        }

        let contents =
            std::fs::read_to_string(path).map_err(|e| CheckpointError::IoError(e.to_string()))?;
        let state: JobState = serde_json::from_str(&contents).map_err(|e| {
            warn!(path = %path.display(), error = %e, "Failed to deserialize job state");
            CheckpointError::DeserializationError(e.to_string())
        })?;

        if state.schema_version != SCHEMA_VERSION {
            warn!(
                found_version = %state.schema_version,
                expected_version = SCHEMA_VERSION,
                "Job state schema version mismatch"
            );
            return Err(CheckpointError::SchemaVersionMismatch {
                expected: SCHEMA_VERSION.to_string(),
                found: state.schema_version,
            });
        }

        Ok(state)
    }
}

fn open_lock_file(path: &Path) -> Result<std::fs::File, CheckpointError> {
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path.with_extension("lock"))
        .map_err(|e| CheckpointError::LockError(format!("Failed to create lock file: {e}")))
}

/// Running totals kept alongside the checkpoint history
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateMetadata {
    total_checkpoints: u64,
    records_emitted: u64,
    pages_completed: u64,
}

impl StateMetadata {
    /// Checkpoints ever written, including pruned ones
    pub fn total_checkpoints(&self) -> u64 {
        self.total_checkpoints
    }

    /// Records emitted as of the newest checkpoint
    pub fn records_emitted(&self) -> u64 {
        self.records_emitted
    }

    /// Pages completed as of the newest checkpoint
    pub fn pages_completed(&self) -> u64 {
        self.pages_completed
    }
}

/// Checkpoint store writing `<dir>/<job_id>.json`
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Store rooted at `dir`; the directory is created on first write
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// State file path for `job_id`
    pub fn path_for(&self, job_id: Uuid) -> PathBuf {
        self.dir.join(format!("{job_id}.json"))
    }

    /// Full persisted state for `job_id`
    pub async fn load_state(&self, job_id: Uuid) -> Result<Option<JobState>, CheckpointError> {
        let path = self.path_for(job_id);
        tokio::task::spawn_blocking(move || {
            if !path.exists() {
                return Ok(None);
            }
            JobState::load(&path).map(Some)
        })
        .await
        .map_err(|e| CheckpointError::IoError(format!("Checkpoint task failed: {e}")))?
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let path = self.path_for(checkpoint.job_id);
        let checkpoint = checkpoint.clone();
        tokio::task::spawn_blocking(move || {
            let mut state = if path.exists() {
                JobState::load(&path)?
            } else {
                info!(job_id = %checkpoint.job_id, path = %path.display(), "Creating job state file");
                JobState::new(checkpoint.job_id)
            };
            state.add_checkpoint(checkpoint);
            state.save(&path)
        })
        .await
        .map_err(|e| CheckpointError::IoError(format!("Checkpoint task failed: {e}")))?
    }

    async fn load_checkpoint(&self, job_id: Uuid) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self
            .load_state(job_id)
            .await?
            .and_then(|state| state.latest().cloned()))
    }

    async fn list_jobs(&self) -> Result<Vec<Uuid>, CheckpointError> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(CheckpointError::IoError(e.to_string())),
            };

            let mut jobs = Vec::new();
            for entry in entries {
                let path = entry.map_err(|e| CheckpointError::IoError(e.to_string()))?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                if let Some(id) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| Uuid::parse_str(s).ok())
                {
                    jobs.push(id);
                }
            }
            jobs.sort();
            Ok(jobs)
        })
        .await
        .map_err(|e| CheckpointError::IoError(format!("Checkpoint task failed: {e}")))?
    }
}
