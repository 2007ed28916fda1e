// ABOUTME: Operator implementations: interactive terminal prompts and flag-driven automation
// ABOUTME: Chooses source/target engines and answers the resume question for the orchestrator

use crate::checkpoint::CheckpointSummary;
use crate::error::MigrationError;
use crate::orchestrator::Operator;
use crate::providers::ProviderKind;
use anyhow::{Context, Result};
use dialoguer::{theme::ColorfulTheme, Confirm, Select};

/// Engine choices and resume policy taken from command-line flags
#[derive(Debug, Clone, Default)]
pub struct OperatorChoices {
    pub source: Option<ProviderKind>,
    pub target: Option<ProviderKind>,
    /// Never resume; always start a fresh session
    pub no_resume: bool,
    /// Answer yes to every confirmation
    pub assume_yes: bool,
}

/// Resolve one engine from a flag or a single configured candidate
///
/// Returns `Ok(None)` when several engines are configured and none was requested.
fn preselect(
    role: &str,
    requested: Option<ProviderKind>,
    available: &[ProviderKind],
) -> Result<Option<ProviderKind>> {
    if available.is_empty() {
        return Err(MigrationError::Config(format!("no {} endpoint is configured", role)).into());
    }
    match requested {
        Some(kind) if available.contains(&kind) => Ok(Some(kind)),
        Some(kind) => Err(MigrationError::Config(format!(
            "--{} {} requested, but no [{}.{}] endpoint is configured",
            role, kind, role, kind
        ))
        .into()),
        None if available.len() == 1 => Ok(Some(available[0])),
        None => Ok(None),
    }
}

/// Non-interactive operator driven entirely by flags
#[derive(Debug, Clone, Default)]
pub struct CliOperator {
    choices: OperatorChoices,
}

impl CliOperator {
    pub fn new(choices: OperatorChoices) -> Self {
        Self { choices }
    }

    fn pick(
        role: &str,
        requested: Option<ProviderKind>,
        available: &[ProviderKind],
    ) -> Result<ProviderKind> {
        preselect(role, requested, available)?.ok_or_else(|| {
            let names: Vec<&str> = available.iter().map(ProviderKind::as_str).collect();
            MigrationError::Config(format!(
                "several {} engines are configured ({}); pass --{} to choose one",
                role,
                names.join(", "),
                role
            ))
            .into()
        })
    }
}

impl Operator for CliOperator {
    fn select_engines(
        &self,
        sources: &[ProviderKind],
        targets: &[ProviderKind],
    ) -> Result<(ProviderKind, ProviderKind)> {
        Ok((
            Self::pick("source", self.choices.source, sources)?,
            Self::pick("target", self.choices.target, targets)?,
        ))
    }

    fn confirm_resume(&self, _summary: &CheckpointSummary) -> Result<bool> {
        if self.choices.no_resume {
            tracing::info!("--no-resume given; ignoring previous checkpoint");
            return Ok(false);
        }
        Ok(true)
    }
}

/// Terminal prompts for anything the flags leave open
#[derive(Debug, Clone, Default)]
pub struct InteractiveOperator {
    choices: OperatorChoices,
}

impl InteractiveOperator {
    pub fn new(choices: OperatorChoices) -> Self {
        Self { choices }
    }

    fn pick(
        &self,
        role: &str,
        requested: Option<ProviderKind>,
        available: &[ProviderKind],
    ) -> Result<ProviderKind> {
        if let Some(kind) = preselect(role, requested, available)? {
            tracing::info!("✓ Using {} {}", kind, role);
            return Ok(kind);
        }

        let items: Vec<&str> = available.iter().map(ProviderKind::as_str).collect();
        let selection = Select::with_theme(&ColorfulTheme::default())
            .with_prompt(format!("Select the {} database", role))
            .items(&items)
            .default(0)
            .interact()
            .with_context(|| format!("Failed to get {} selection", role))?;
        Ok(available[selection])
    }
}

impl Operator for InteractiveOperator {
    fn select_engines(
        &self,
        sources: &[ProviderKind],
        targets: &[ProviderKind],
    ) -> Result<(ProviderKind, ProviderKind)> {
        let source = self.pick("source", self.choices.source, sources)?;
        let target = self.pick("target", self.choices.target, targets)?;
        Ok((source, target))
    }

    fn confirm_resume(&self, summary: &CheckpointSummary) -> Result<bool> {
        if self.choices.no_resume {
            return Ok(false);
        }
        if self.choices.assume_yes {
            return Ok(true);
        }

        println!();
        println!("An interrupted migration was found:");
        println!("{}", summary);
        println!();

        Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt("Resume this migration?")
            .default(true)
            .interact()
            .context("Failed to get resume confirmation")
    }
}
