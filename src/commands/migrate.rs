// ABOUTME: Migrate command implementation - Copy every configured table from source to target
// ABOUTME: Wires configuration, providers, checkpoint, watchdog, progress bars and Ctrl-C together

use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::error::MigrationError;
use crate::interactive::{CliOperator, InteractiveOperator, OperatorChoices};
use crate::orchestrator::{Operator, Orchestrator, Outcome, RunSettings};
use crate::progress::{ProgressChannel, TerminalView};
use crate::providers::postgres::{PostgresSource, PostgresTarget};
use crate::providers::sqlite::{SqliteSource, SqliteTarget};
use crate::providers::{ProviderFactory, ProviderKind, SourceProvider, TargetProvider};
use crate::watchdog::Watchdog;
use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;

/// Opens the endpoints declared in a configuration file
pub struct ConfigProviderFactory {
    config: Config,
}

impl ConfigProviderFactory {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ProviderFactory for ConfigProviderFactory {
    async fn open_source(&self, kind: ProviderKind) -> Result<Box<dyn SourceProvider>> {
        let endpoint = self.config.source_endpoint(kind)?;
        let tables = self.config.tables.clone();
        match kind {
            ProviderKind::Sqlite => {
                if endpoint.url != ":memory:" && !Path::new(&endpoint.url).is_file() {
                    return Err(MigrationError::Config(format!(
                        "Source database file not found: {}",
                        endpoint.url
                    ))
                    .into());
                }
                Ok(Box::new(SqliteSource::open(
                    &endpoint.url,
                    tables,
                    endpoint.schema.clone(),
                )?))
            }
            ProviderKind::Postgres => Ok(Box::new(
                PostgresSource::connect(&endpoint.url, tables, endpoint.schema.clone()).await?,
            )),
        }
    }

    async fn open_target(&self, kind: ProviderKind) -> Result<Box<dyn TargetProvider>> {
        let endpoint = self.config.target_endpoint(kind)?;
        match kind {
            ProviderKind::Sqlite => Ok(Box::new(SqliteTarget::open(
                &endpoint.url,
                endpoint.schema.clone(),
            )?)),
            ProviderKind::Postgres => Ok(Box::new(
                PostgresTarget::connect(&endpoint.url, endpoint.schema.clone()).await?,
            )),
        }
    }

    fn source_kinds(&self) -> Vec<ProviderKind> {
        self.config.source.keys().copied().collect()
    }

    fn target_kinds(&self) -> Vec<ProviderKind> {
        self.config.target.keys().copied().collect()
    }
}

/// Run (or resume) a migration described by a configuration file
///
/// Interactive mode prompts for anything the flags leave open and asks before resuming.
/// Ctrl-C stops the run after the batch in flight; the checkpoint is kept so the next launch
/// can resume.
///
/// # Examples
///
/// ```no_run
/// # use anyhow::Result;
/// # use std::path::Path;
/// # use seren_table_migrator::commands::migrate;
/// # use seren_table_migrator::interactive::OperatorChoices;
/// # async fn example() -> Result<()> {
/// migrate(Path::new("migration.toml"), OperatorChoices::default(), false).await?;
/// # Ok(())
/// # }
/// ```
pub async fn migrate(
    config_path: &Path,
    choices: OperatorChoices,
    interactive: bool,
) -> Result<()> {
    let config = Config::load(config_path)?;
    tracing::info!("✓ Loaded configuration from {}", config_path.display());
    tracing::info!(
        "  {} table(s), batch size {}, {} attempt(s) per batch",
        config.tables.len(),
        config.migration.batch_size,
        config.migration.max_retries
    );

    let checkpoint = Arc::new(CheckpointStore::new(config.checkpoint_path()));

    let mut progress = ProgressChannel::new();
    let alerts = progress.reporter();
    let watchdog = Arc::new(Watchdog::with_alert_handler(
        config.watchdog_config(),
        move |alert| {
            alerts.error(format!(
                "No progress for {}s (last activity: {})",
                alert.elapsed.as_secs(),
                alert.context
            ));
        },
    ));

    let operator: Arc<dyn Operator> = if interactive {
        Arc::new(InteractiveOperator::new(choices))
    } else {
        Arc::new(CliOperator::new(choices))
    };

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("⚠ Interrupt received; stopping after the current batch");
            let _ = cancel_tx.send(true);
        }
    });

    progress.start(TerminalView::new());
    let settings = RunSettings::from_config(&config.migration);
    let factory = Arc::new(ConfigProviderFactory::new(config));
    let report = Orchestrator::new(
        factory,
        operator,
        Arc::clone(&checkpoint),
        watchdog,
        progress,
    )
    .with_settings(settings)
    .with_cancel(cancel_rx)
    .run()
    .await;
    interrupt.abort();

    match report.outcome {
        Outcome::Completed => {
            tracing::info!("");
            tracing::info!("========================================");
            tracing::info!("✓ Migration complete");
            tracing::info!("========================================");
            tracing::info!("  Rows migrated: {}", report.rows_migrated);
            tracing::info!("  Duration: {:.1}s", report.elapsed.as_secs_f64());
            Ok(())
        }
        Outcome::Cancelled => {
            tracing::info!("Run the same command again to resume where this run stopped.");
            Ok(())
        }
        Outcome::Failed(e) => {
            if checkpoint.path().exists() {
                tracing::info!(
                    "Progress is saved in {}; run the same command again to resume.",
                    checkpoint.path().display()
                );
            }
            Err(e)
        }
    }
}
