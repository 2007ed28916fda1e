// ABOUTME: Durable checkpoint of migration progress enabling resume after interruption
// ABOUTME: Every update is written as a full snapshot and atomically renamed into place

use crate::providers::ProviderKind;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tempfile::NamedTempFile;

/// File name used when no checkpoint path is configured
pub const DEFAULT_CHECKPOINT_FILE: &str = "migration_checkpoint.json";

/// Persisted progress of one migration session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    /// Table currently being copied, if any
    pub current_table: Option<String>,
    /// Rows of `current_table` confirmed written
    pub current_table_offset: u64,
    /// Fully copied tables, in completion order
    pub completed_tables: Vec<String>,
    /// Rows of all completed tables
    pub total_rows_migrated: u64,
    pub source_type: ProviderKind,
    pub target_type: ProviderKind,
    pub is_complete: bool,
}

impl CheckpointState {
    fn new(source_type: ProviderKind, target_type: ProviderKind) -> Self {
        let now = Utc::now();
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            started_at: now,
            last_updated_at: now,
            current_table: None,
            current_table_offset: 0,
            completed_tables: Vec::new(),
            total_rows_migrated: 0,
            source_type,
            target_type,
            is_complete: false,
        }
    }

    pub fn is_table_complete(&self, table: &str) -> bool {
        self.completed_tables.iter().any(|t| t == table)
    }

    /// Offset to resume `table` from: the confirmed offset if it is the current table
    pub fn resume_offset(&self, table: &str) -> u64 {
        match &self.current_table {
            Some(current) if current == table => self.current_table_offset,
            _ => 0,
        }
    }

    pub fn summary(&self) -> CheckpointSummary {
        CheckpointSummary {
            session_id: self.session_id.clone(),
            current_table: self.current_table.clone(),
            current_offset: self.current_table_offset,
            total_rows_migrated: self.total_rows_migrated + self.current_table_offset,
            completed_tables: self.completed_tables.len(),
            last_updated_at: self.last_updated_at,
            source_type: self.source_type,
            target_type: self.target_type,
        }
    }
}

/// What the operator sees before deciding whether to resume
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointSummary {
    pub session_id: String,
    pub current_table: Option<String>,
    pub current_offset: u64,
    pub total_rows_migrated: u64,
    pub completed_tables: usize,
    pub last_updated_at: DateTime<Utc>,
    pub source_type: ProviderKind,
    pub target_type: ProviderKind,
}

impl fmt::Display for CheckpointSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Session:        {}", self.session_id)?;
        writeln!(f, "Engines:        {} -> {}", self.source_type, self.target_type)?;
        match &self.current_table {
            Some(table) => writeln!(f, "Current table:  {} (row {})", table, self.current_offset)?,
            None => writeln!(f, "Current table:  (between tables)")?,
        }
        writeln!(f, "Tables done:    {}", self.completed_tables)?;
        writeln!(f, "Rows migrated:  {}", self.total_rows_migrated)?;
        write!(
            f,
            "Last updated:   {}",
            self.last_updated_at.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }
}

/// Crash-consistent checkpoint file plus its in-memory copy
///
/// Mutators take the lock, update the in-memory state, and write the snapshot before
/// releasing it, so a concurrent completion can never race a progress update on disk.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    state: Mutex<Option<CheckpointState>>,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(None),
        }
    }

    /// Checkpoint location beside the running executable, falling back to the working directory
    pub fn default_path() -> PathBuf {
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."))
            .join(DEFAULT_CHECKPOINT_FILE)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load a resumable checkpoint from disk
    ///
    /// Returns `None` when the file is missing, unreadable, malformed, or belongs to a finished
    /// session. A loaded checkpoint becomes the store's active state.
    pub fn load_existing(&self) -> Option<CheckpointState> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(
                    "⚠ Ignoring unreadable checkpoint {}: {}",
                    self.path.display(),
                    e
                );
                return None;
            }
        };

        let state: CheckpointState = match serde_json::from_str(&content) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(
                    "⚠ Ignoring malformed checkpoint {}: {}",
                    self.path.display(),
                    e
                );
                return None;
            }
        };

        if state.is_complete {
            tracing::debug!("Checkpoint {} is already complete", state.session_id);
            return None;
        }

        if let Ok(mut guard) = self.state.lock() {
            *guard = Some(state.clone());
        }
        Some(state)
    }

    /// Start a fresh session and persist it immediately
    pub fn create_session(
        &self,
        source_type: ProviderKind,
        target_type: ProviderKind,
    ) -> Result<CheckpointState> {
        let mut guard = self.lock()?;
        let state = CheckpointState::new(source_type, target_type);
        self.persist(&state)?;
        *guard = Some(state.clone());
        tracing::info!("Started migration session {}", state.session_id);
        Ok(state)
    }

    /// Record that `processed_rows` rows of `table` are durably written
    ///
    /// The snapshot is on disk before this returns.
    pub fn update_progress(&self, table: &str, processed_rows: u64) -> Result<()> {
        self.mutate(|state| {
            state.current_table = Some(table.to_string());
            state.current_table_offset = processed_rows;
        })
    }

    /// Move `table` into the completed set, folding its offset into the running total
    ///
    /// Calling it again for the same table changes nothing.
    pub fn mark_table_complete(&self, table: &str) -> Result<()> {
        self.mutate(|state| {
            if state.is_table_complete(table) {
                return;
            }
            if state.current_table.as_deref() == Some(table) {
                state.total_rows_migrated += state.current_table_offset;
                state.current_table = None;
                state.current_table_offset = 0;
            }
            state.completed_tables.push(table.to_string());
        })
    }

    /// Mark the session finished and remove the checkpoint file
    pub fn complete(&self) -> Result<()> {
        let mut guard = self.lock()?;
        if let Some(state) = guard.as_mut() {
            state.is_complete = true;
            state.last_updated_at = Utc::now();
            tracing::info!(
                "✓ Session {} complete ({} rows)",
                state.session_id,
                state.total_rows_migrated
            );
        }
        self.remove_file()
    }

    /// Forget any checkpoint, on disk and in memory
    pub fn clear(&self) -> Result<()> {
        let mut guard = self.lock()?;
        *guard = None;
        self.remove_file()
    }

    /// Copy of the current in-memory state
    pub fn snapshot(&self) -> Option<CheckpointState> {
        self.state.lock().ok().and_then(|guard| guard.clone())
    }

    fn mutate(&self, apply: impl FnOnce(&mut CheckpointState)) -> Result<()> {
        let mut guard = self.lock()?;
        let state = guard
            .as_mut()
            .ok_or_else(|| anyhow!("No active migration session to checkpoint"))?;
        apply(state);
        state.last_updated_at = Utc::now();
        let snapshot = state.clone();
        self.persist(&snapshot)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<CheckpointState>>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("Checkpoint state lock poisoned"))
    }

    fn persist(&self, state: &CheckpointState) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create checkpoint directory {}", dir.display()))?;

        let mut temp = NamedTempFile::new_in(&dir)
            .with_context(|| format!("Failed to create temp checkpoint in {}", dir.display()))?;
        serde_json::to_writer_pretty(&mut temp, state).context("Failed to serialize checkpoint")?;
        temp.flush().context("Failed to flush checkpoint")?;
        temp.as_file()
            .sync_all()
            .context("Failed to sync checkpoint to disk")?;
        temp.persist(&self.path).map_err(|e| {
            anyhow!(
                "Failed to replace checkpoint {}: {}",
                self.path.display(),
                e.error
            )
        })?;
        sync_dir(&dir)
    }

    fn remove_file(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to delete checkpoint {}", self.path.display())),
        }
    }
}

/// Flush the directory entry so the rename survives a power loss
#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    std::fs::File::open(dir)
        .and_then(|handle| handle.sync_all())
        .with_context(|| format!("Failed to sync checkpoint directory {}", dir.display()))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    // Directories cannot be opened as files here; the rename is as durable as the platform allows
    Ok(())
}
