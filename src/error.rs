// ABOUTME: Typed error conditions that callers need to tell apart
// ABOUTME: Wrapped in anyhow errors and detected by walking the error chain

use thiserror::Error;

/// Conditions the migration distinguishes from ordinary failures
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Invalid or incomplete configuration, detected before any data moves
    #[error("Configuration error: {0}")]
    Config(String),

    /// The initial connection probe failed
    #[error("Cannot connect to {role} database ({kind})")]
    Connectivity { role: &'static str, kind: String },

    /// A strict write hit a row that already exists on the target
    #[error("Duplicate key while writing table '{table}'")]
    DuplicateKey { table: String },

    /// Strict-path duplicate: the target already holds data for this table
    #[error(
        "Target table '{table}' is not empty.\n\
         Point the migration at an empty target, or resume the previous session."
    )]
    TargetNotEmpty { table: String },

    /// A table in the migration order has no registered batch strategy
    #[error("No batch strategy registered for table '{0}'")]
    UnregisteredTable(String),

    /// A batch kept failing after every allowed attempt
    #[error("Batch for table '{table}' at offset {offset} failed after {attempts} attempt(s)")]
    RetriesExhausted {
        table: String,
        offset: u64,
        attempts: u32,
    },
}

impl MigrationError {
    /// Find a `MigrationError` anywhere in an anyhow error chain
    ///
    /// Matches both a wrapped source error and a `MigrationError` attached as context.
    pub fn find(err: &anyhow::Error) -> Option<&MigrationError> {
        err.downcast_ref::<MigrationError>()
            .or_else(|| err.chain().find_map(|cause| cause.downcast_ref::<MigrationError>()))
    }
}

/// Returns true when the error (or any cause) is a duplicate-key condition
pub fn is_duplicate_key(err: &anyhow::Error) -> bool {
    matches!(
        MigrationError::find(err),
        Some(MigrationError::DuplicateKey { .. })
    )
}
