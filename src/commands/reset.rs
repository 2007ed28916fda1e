// ABOUTME: Reset command implementation - Discard an interrupted migration's checkpoint
// ABOUTME: The next migrate run then starts a fresh session from the first table

use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use anyhow::{Context, Result};
use dialoguer::{theme::ColorfulTheme, Confirm};
use std::path::Path;

/// Delete the checkpoint for a configuration
///
/// Asks for confirmation unless `skip_confirmation` is set. Returns `true` when a checkpoint
/// file was removed.
pub fn reset(config_path: &Path, skip_confirmation: bool) -> Result<bool> {
    let config = Config::load(config_path)?;
    let store = CheckpointStore::new(config.checkpoint_path());

    if !store.path().exists() {
        tracing::info!("Nothing to reset: {} not present", store.path().display());
        return Ok(false);
    }

    match store.load_existing() {
        Some(state) => {
            if !skip_confirmation {
                println!("{}", state.summary());
                let confirmed = Confirm::with_theme(&ColorfulTheme::default())
                    .with_prompt("Discard this checkpoint? The next run starts from scratch")
                    .default(false)
                    .interact()
                    .context("Failed to get reset confirmation")?;
                if !confirmed {
                    tracing::info!("Reset cancelled");
                    return Ok(false);
                }
            }
        }
        None => tracing::warn!(
            "⚠ {} is not a resumable checkpoint; removing it",
            store.path().display()
        ),
    }

    store.clear()?;
    tracing::info!("✓ Removed checkpoint {}", store.path().display());
    Ok(true)
}
