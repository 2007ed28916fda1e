// ABOUTME: Status command implementation - Report on an interrupted migration
// ABOUTME: Shows where the last session stopped without touching either database

use crate::checkpoint::{CheckpointState, CheckpointStore};
use crate::config::Config;
use anyhow::Result;
use std::path::Path;

/// Print the resumable checkpoint for a configuration, if any
///
/// Returns the loaded checkpoint so callers can act on it.
pub fn status(config_path: &Path) -> Result<Option<CheckpointState>> {
    let config = Config::load(config_path)?;
    let store = CheckpointStore::new(config.checkpoint_path());

    let Some(state) = store.load_existing() else {
        tracing::info!(
            "No resumable migration (checkpoint {} not present)",
            store.path().display()
        );
        return Ok(None);
    };

    tracing::info!("");
    tracing::info!("========================================");
    tracing::info!("Migration Checkpoint");
    tracing::info!("========================================");
    for line in state.summary().to_string().lines() {
        tracing::info!("{}", line);
    }
    if !state.completed_tables.is_empty() {
        tracing::info!("Completed tables:");
        for table in &state.completed_tables {
            tracing::info!("  ✓ {}", table);
        }
    }
    tracing::info!("");
    tracing::info!("Run `migrate` to resume, or `reset` to start over.");

    Ok(Some(state))
}
