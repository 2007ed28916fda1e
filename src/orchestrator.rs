// ABOUTME: Top-level migration state machine composing providers, checkpoint, watchdog and progress
// ABOUTME: Copies tables one batch at a time in dependency order and can resume after interruption

use crate::checkpoint::{CheckpointState, CheckpointStore, CheckpointSummary};
use crate::config::MigrationSettings;
use crate::error::{is_duplicate_key, MigrationError};
use crate::progress::{DisplayState, ProgressChannel, ProgressReporter};
use crate::providers::{ProviderFactory, ProviderKind, SourceProvider, TargetProvider};
use crate::schema::{Row, TableDescriptor};
use crate::strategy::{BatchStrategy, StrategyRegistry};
use crate::utils::{retry_with_backoff, RetryPolicy};
use crate::watchdog::Watchdog;
use anyhow::{Context, Result};
use futures::TryStreamExt;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Steps of a migration run, in the order they are entered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    ResumeCheck,
    Configure,
    ApplySchema,
    SessionReady,
    MigrateTables,
    Finalize,
    Done,
    Error,
    Cancelled,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "init",
            Phase::ResumeCheck => "resume-check",
            Phase::Configure => "configure",
            Phase::ApplySchema => "apply-schema",
            Phase::SessionReady => "session-ready",
            Phase::MigrateTables => "migrate-tables",
            Phase::Finalize => "finalize",
            Phase::Done => "done",
            Phase::Error => "error",
            Phase::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Decisions the orchestrator delegates to whoever is running it
pub trait Operator: Send + Sync {
    /// Pick the source and target engines from those that are configured
    fn select_engines(
        &self,
        sources: &[ProviderKind],
        targets: &[ProviderKind],
    ) -> Result<(ProviderKind, ProviderKind)>;

    /// Decide whether to continue the interrupted session described by `summary`
    fn confirm_resume(&self, summary: &CheckpointSummary) -> Result<bool>;
}

/// Batch sizing and retry behaviour for one run
#[derive(Debug, Clone, Copy)]
pub struct RunSettings {
    pub batch_size: usize,
    pub retry: RetryPolicy,
}

impl RunSettings {
    pub fn from_config(settings: &MigrationSettings) -> Self {
        Self {
            batch_size: settings.batch_size,
            retry: RetryPolicy::new(
                settings.max_retries,
                Duration::from_secs(settings.retry_base_delay_secs),
            ),
        }
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        Self::from_config(&MigrationSettings::default())
    }
}

/// How a run ended
#[derive(Debug)]
pub enum Outcome {
    Completed,
    /// Stopped at a batch boundary; the checkpoint is kept for the next launch
    Cancelled,
    /// Stopped by an error; the checkpoint holds the last confirmed offset
    Failed(anyhow::Error),
}

/// What happened during a run, reported after cleanup has finished
#[derive(Debug)]
pub struct RunReport {
    pub outcome: Outcome,
    /// Every phase entered, ending in `Done`, `Error` or `Cancelled`
    pub phases: Vec<Phase>,
    /// Rows written during this run (excludes rows copied by earlier sessions)
    pub rows_migrated: u64,
    pub elapsed: Duration,
    /// Final state of the progress display
    pub display: DisplayState,
}

impl RunReport {
    pub fn final_phase(&self) -> Phase {
        self.phases.last().copied().unwrap_or(Phase::Init)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Finished,
    Cancelled,
}

/// Runs one migration from resume check to finalization
///
/// Cleanup (watchdog stop, progress drain) happens on every exit path before the report is
/// returned.
pub struct Orchestrator {
    factory: Arc<dyn ProviderFactory>,
    operator: Arc<dyn Operator>,
    checkpoint: Arc<CheckpointStore>,
    watchdog: Arc<Watchdog>,
    progress: ProgressChannel,
    settings: RunSettings,
    cancel: watch::Receiver<bool>,
}

impl Orchestrator {
    pub fn new(
        factory: Arc<dyn ProviderFactory>,
        operator: Arc<dyn Operator>,
        checkpoint: Arc<CheckpointStore>,
        watchdog: Arc<Watchdog>,
        progress: ProgressChannel,
    ) -> Self {
        let (_, cancel) = watch::channel(false);
        Self {
            factory,
            operator,
            checkpoint,
            watchdog,
            progress,
            settings: RunSettings::default(),
            cancel,
        }
    }

    pub fn with_settings(mut self, settings: RunSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Observe `cancel`; setting it to `true` stops the run at the next batch boundary
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn run(self) -> RunReport {
        let started = Instant::now();
        let reporter = self.progress.reporter();

        let mut run = Run {
            factory: self.factory.as_ref(),
            operator: self.operator.as_ref(),
            checkpoint: self.checkpoint.as_ref(),
            watchdog: self.watchdog.as_ref(),
            reporter: reporter.clone(),
            settings: self.settings,
            cancel: self.cancel.clone(),
            phases: vec![Phase::Init],
            rows_migrated: 0,
        };
        let result = run.execute().await;
        let Run {
            mut phases,
            rows_migrated,
            ..
        } = run;

        self.watchdog.stop();

        let outcome = match result {
            Ok(Flow::Finished) => {
                phases.push(Phase::Done);
                Outcome::Completed
            }
            Ok(Flow::Cancelled) => {
                phases.push(Phase::Cancelled);
                tracing::warn!(
                    "⚠ Migration cancelled; progress kept in {}",
                    self.checkpoint.path().display()
                );
                Outcome::Cancelled
            }
            Err(e) => {
                phases.push(Phase::Error);
                tracing::error!("Migration failed: {:#}", e);
                reporter.error(format!("Migration failed: {}", e));
                Outcome::Failed(e)
            }
        };

        let display = self.progress.complete().await;
        let elapsed = started.elapsed();
        if matches!(outcome, Outcome::Completed) {
            tracing::info!(
                "✓ Migration complete: {} rows in {:.1}s",
                rows_migrated,
                elapsed.as_secs_f64()
            );
        }

        RunReport {
            outcome,
            phases,
            rows_migrated,
            elapsed,
            display,
        }
    }
}

/// Borrowed state of one run; dropped before cleanup
struct Run<'a> {
    factory: &'a dyn ProviderFactory,
    operator: &'a dyn Operator,
    checkpoint: &'a CheckpointStore,
    watchdog: &'a Watchdog,
    reporter: ProgressReporter,
    settings: RunSettings,
    cancel: watch::Receiver<bool>,
    phases: Vec<Phase>,
    rows_migrated: u64,
}

impl Run<'_> {
    fn enter(&mut self, phase: Phase) {
        tracing::debug!("Entering phase {}", phase);
        self.phases.push(phase);
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    async fn execute(&mut self) -> Result<Flow> {
        self.enter(Phase::ResumeCheck);
        let resumed = self.resume_check()?;

        self.enter(Phase::Configure);
        let (source_kind, target_kind) = match &resumed {
            Some(state) => (state.source_type, state.target_type),
            None => self
                .operator
                .select_engines(&self.factory.source_kinds(), &self.factory.target_kinds())?,
        };
        tracing::info!("Migrating {} → {}", source_kind, target_kind);

        let source = self
            .factory
            .open_source(source_kind)
            .await
            .with_context(|| format!("Failed to open {} source", source_kind))?;
        if !source.test_connection().await {
            return Err(MigrationError::Connectivity {
                role: "source",
                kind: source_kind.to_string(),
            }
            .into());
        }
        tracing::info!("✓ Connected to {} source", source_kind);

        let target = self
            .factory
            .open_target(target_kind)
            .await
            .with_context(|| format!("Failed to open {} target", target_kind))?;
        if !target.test_connection().await {
            return Err(MigrationError::Connectivity {
                role: "target",
                kind: target_kind.to_string(),
            }
            .into());
        }
        tracing::info!("✓ Connected to {} target", target_kind);

        if resumed.is_none() {
            self.enter(Phase::ApplySchema);
            if self.is_cancelled() {
                return Ok(Flow::Cancelled);
            }
            source
                .apply_schema()
                .await
                .context("Failed to apply source schema")?;
            if self.is_cancelled() {
                return Ok(Flow::Cancelled);
            }
            target
                .apply_schema()
                .await
                .context("Failed to apply target schema")?;
        }

        self.enter(Phase::SessionReady);
        let state = match resumed {
            Some(state) => state,
            None => self.checkpoint.create_session(source_kind, target_kind)?,
        };
        let order = source
            .get_migration_order()
            .await
            .context("Failed to resolve migration order")?;
        let strategies = StrategyRegistry::for_order(&order, target.accepts_non_finite());
        tracing::info!(
            "Migration order ({} tables): {}",
            order.len(),
            order.names().join(", ")
        );

        self.enter(Phase::MigrateTables);
        self.watchdog.start(&format!("session {}", state.session_id));
        for table in order.iter() {
            if state.is_table_complete(&table.name) {
                tracing::info!("  Skipping '{}' (already migrated)", table.name);
                continue;
            }
            let strategy = strategies.get(&table.name)?;
            let flow = self
                .migrate_table(
                    source.as_ref(),
                    target.as_ref(),
                    table,
                    strategy.as_ref(),
                    &state,
                )
                .await?;
            if flow == Flow::Cancelled {
                return Ok(Flow::Cancelled);
            }
        }

        self.enter(Phase::Finalize);
        target
            .update_sequences(&order)
            .await
            .context("Failed to resynchronize target sequences")?;
        self.checkpoint.complete()?;
        Ok(Flow::Finished)
    }

    /// Load a checkpoint and ask whether to continue it; anything not resumed is cleared
    fn resume_check(&self) -> Result<Option<CheckpointState>> {
        if let Some(state) = self.checkpoint.load_existing() {
            let summary = state.summary();
            tracing::info!("Found checkpoint from a previous run:\n{}", summary);
            if self.operator.confirm_resume(&summary)? {
                tracing::info!("✓ Resuming session {}", state.session_id);
                return Ok(Some(state));
            }
            tracing::info!("Starting a new session; previous checkpoint discarded");
        }
        self.checkpoint.clear()?;
        Ok(None)
    }

    async fn migrate_table(
        &mut self,
        source: &dyn SourceProvider,
        target: &dyn TargetProvider,
        table: &TableDescriptor,
        strategy: &dyn BatchStrategy,
        resume: &CheckpointState,
    ) -> Result<Flow> {
        let name = table.name.as_str();
        self.reporter.table_start(name, None);
        let total = source
            .get_count(table)
            .await
            .with_context(|| format!("Failed to count rows in '{}'", name))?;
        self.reporter.table_start(name, Some(total));

        let mut offset = resume.resume_offset(name);
        // The last checkpointed offset may trail rows the target already holds
        let mut tolerant = resume.current_table.as_deref() == Some(name);
        if tolerant {
            tracing::info!("Resuming '{}' at row {} of {}", name, offset, total);
            self.reporter.progress(name, offset);
        } else {
            tracing::info!("Migrating '{}' ({} rows)", name, total);
        }

        let mut batches = source.read_batches_from_offset(table, self.settings.batch_size, offset);
        loop {
            if self.is_cancelled() {
                return Ok(Flow::Cancelled);
            }
            let Some(rows) = batches
                .try_next()
                .await
                .with_context(|| format!("Failed to read '{}' at row {}", name, offset))?
            else {
                break;
            };

            let rows = strategy.prepare(rows);
            let written = rows.len() as u64;
            self.write_batch(target, table, &rows, offset, tolerant).await?;
            tolerant = false;

            offset += written;
            self.rows_migrated += written;
            self.checkpoint.update_progress(name, offset)?;
            self.reporter.progress(name, offset);
            self.watchdog.heartbeat(&format!("{} @ {}", name, offset));
        }

        self.checkpoint.mark_table_complete(name)?;
        self.reporter.table_complete(name);
        tracing::info!("  ✓ '{}' complete ({} rows)", name, offset);
        Ok(Flow::Finished)
    }

    /// Write one batch, retrying transient failures with exponential backoff
    ///
    /// A duplicate key on the strict path is not retried: it means the target already holds
    /// data this session did not write.
    async fn write_batch(
        &self,
        target: &dyn TargetProvider,
        table: &TableDescriptor,
        rows: &[Row],
        offset: u64,
        tolerant: bool,
    ) -> Result<()> {
        let policy = self.settings.retry;
        let reporter = &self.reporter;

        let result = retry_with_backoff(
            |_| async move {
                if tolerant {
                    target.write_batch_ignore_duplicates(table, rows).await
                } else {
                    target.write_batch(table, rows).await
                }
            },
            &policy,
            |attempt, err| {
                reporter.error(format!(
                    "'{}' batch at row {} failed (attempt {}/{}): {}",
                    table.name, offset, attempt, policy.max_attempts, err
                ));
                tolerant || !is_duplicate_key(err)
            },
        )
        .await;

        result.map_err(|e| {
            if !tolerant && is_duplicate_key(&e) {
                e.context(MigrationError::TargetNotEmpty {
                    table: table.name.clone(),
                })
            } else {
                e.context(MigrationError::RetriesExhausted {
                    table: table.name.clone(),
                    offset,
                    attempts: policy.max_attempts,
                })
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderKind;

    #[test]
    fn test_run_settings_from_config() {
        let settings = RunSettings::from_config(&MigrationSettings {
            batch_size: 250,
            max_retries: 5,
            retry_base_delay_secs: 2,
            checkpoint_path: None,
        });
        assert_eq!(settings.batch_size, 250);
        assert_eq!(settings.retry.max_attempts, 5);
        assert_eq!(settings.retry.delay_for(1), Duration::from_secs(4));
    }

    #[test]
    fn test_final_phase() {
        let report = RunReport {
            outcome: Outcome::Failed(anyhow::anyhow!("boom")),
            phases: vec![Phase::Init, Phase::ResumeCheck, Phase::Error],
            rows_migrated: 0,
            elapsed: Duration::ZERO,
            display: DisplayState::default(),
        };
        assert_eq!(report.final_phase(), Phase::Error);
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::MigrateTables.to_string(), "migrate-tables");
        assert_eq!(ProviderKind::Sqlite.to_string(), "sqlite");
    }
}
