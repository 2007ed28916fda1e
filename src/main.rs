// ABOUTME: CLI entry point for seren-table-migrator
// ABOUTME: Parses commands and routes to appropriate handlers

use clap::{Parser, Subcommand};
use seren_table_migrator::commands;
use seren_table_migrator::config::DEFAULT_CONFIG_FILE;
use seren_table_migrator::interactive::OperatorChoices;
use seren_table_migrator::providers::ProviderKind;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "seren-table-migrator")]
#[command(
    about = "Resumable table migration between SQLite and PostgreSQL",
    long_about = None
)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy every configured table from source to target, resuming if interrupted
    Migrate {
        /// Path to the migration configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        /// Source engine (sqlite or postgres) when several are configured
        #[arg(long)]
        source: Option<ProviderKind>,
        /// Target engine (sqlite or postgres) when several are configured
        #[arg(long)]
        target: Option<ProviderKind>,
        /// Skip confirmation prompts (resume automatically)
        #[arg(short = 'y', long)]
        yes: bool,
        /// Ignore any previous checkpoint and start a fresh run
        #[arg(long)]
        no_resume: bool,
        /// Disable interactive mode (use CLI flags instead)
        #[arg(long)]
        no_interactive: bool,
    },
    /// Show where an interrupted migration stopped
    Status {
        /// Path to the migration configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },
    /// Discard the checkpoint so the next run starts from scratch
    Reset {
        /// Path to the migration configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        /// Skip confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging - default to INFO level if RUST_LOG not set
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Migrate {
            config,
            source,
            target,
            yes,
            no_resume,
            no_interactive,
        } => {
            // --yes implies automation, so it disables interactive mode
            let interactive = !no_interactive && !yes;
            let choices = OperatorChoices {
                source,
                target,
                no_resume,
                assume_yes: yes,
            };
            commands::migrate(&config, choices, interactive).await
        }
        Commands::Status { config } => commands::status(&config).map(|_| ()),
        Commands::Reset { config, yes } => commands::reset(&config, yes).map(|_| ()),
    }
}
