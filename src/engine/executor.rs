//! Interactive apply and destroy flows

use anyhow::{Context as _, Result};
use colored::Colorize;
use declarative::{DesiredGraph, Orchestrator, Outcome, RunResult, RunSummary, Scope};

use super::differ::display_plan;
use crate::progress::ProgressObserver;
use crate::ui;

/// Options for an interactive run
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Don't make changes, just show what would happen
    pub dry_run: bool,
    /// Skip confirmation prompts
    pub yes: bool,
    /// Hide the progress bar
    pub quiet: bool,
    /// List unchanged resources in the plan
    pub verbose: bool,
}

/// Show the plan, confirm, then converge `scope` to `desired`
pub async fn apply(
    orchestrator: &Orchestrator,
    scope: &mut Scope,
    desired: &DesiredGraph,
    opts: &ExecuteOptions,
) -> Result<RunSummary> {
    let plan = orchestrator.plan(scope, desired)?;
    display_plan(&plan, opts.verbose);

    if !plan.has_changes() {
        return Ok(RunSummary {
            noop: plan.summary().unchanged,
            ..RunSummary::default()
        });
    }

    if opts.dry_run {
        println!();
        println!("  {} Dry run - no changes made", "ℹ".blue());
        return Ok(RunSummary::default());
    }

    if !opts.yes && !confirm_proceed().await? {
        println!();
        println!("  {} Aborted", "✗".red());
        return Ok(RunSummary::default());
    }

    println!();
    println!(
        "  {} Applying {} changes...",
        "→".cyan(),
        plan.summary().total()
    );

    let mut observer = ProgressObserver::new("Applying", opts.quiet);
    let result = orchestrator.apply_with(scope, desired, &mut observer).await?;
    print_summary(&result, "Configuration applied");
    Ok(result.summary())
}

/// Show what will be removed, confirm, then tear down `scope`
pub async fn destroy(
    orchestrator: &Orchestrator,
    scope: &mut Scope,
    opts: &ExecuteOptions,
) -> Result<RunSummary> {
    if scope.is_empty() {
        println!();
        println!("  {} Scope '{}' has no resources", "✓".green(), scope.id());
        return Ok(RunSummary::default());
    }

    println!();
    println!("{}", ui::box_top(&format!("Destroy scope '{}'", scope.id())));
    println!("│");
    for id in scope.teardown_order() {
        let resource_type = scope
            .get(id)
            .map(|i| i.resource_type.to_string())
            .unwrap_or_default();
        println!("│   {} {:<30} {}", "-".red(), id, resource_type.dimmed());
    }
    println!("│");
    println!("└─────────────────────────────────────────────────────┘");

    if opts.dry_run {
        println!();
        println!("  {} Dry run - no changes made", "ℹ".blue());
        return Ok(RunSummary::default());
    }

    if !opts.yes && !confirm_proceed().await? {
        println!();
        println!("  {} Aborted", "✗".red());
        return Ok(RunSummary::default());
    }

    let mut observer = ProgressObserver::new("Destroying", opts.quiet);
    let result = orchestrator.destroy_with(scope, &mut observer).await?;
    print_summary(&result, "Scope destroyed");
    Ok(result.summary())
}

/// Confirm with user
async fn confirm_proceed() -> Result<bool> {
    tokio::task::spawn_blocking(|| {
        dialoguer::Confirm::new()
            .with_prompt("Continue?")
            .default(true)
            .interact()
            .context("Failed to read confirmation")
    })
    .await
    .context("Confirmation prompt panicked")?
}

/// Print final summary
fn print_summary(result: &RunResult, done: &str) {
    let summary = result.summary();
    println!();
    if summary.is_success() {
        println!("  {} {done} successfully!", "✓".green().bold());
    } else {
        println!("  {} {done} with errors", "⚠".yellow().bold());
    }

    for line in summary_lines(&summary) {
        println!("    • {line}");
    }

    let failures: Vec<_> = result.failures().collect();
    if !failures.is_empty() {
        println!();
        println!("  {}", "Failures:".red().bold());
        for (id, err) in failures {
            println!("    {} {id}: {err}", "✗".red());
        }
    }

    let skipped: Vec<_> = result
        .outcomes
        .iter()
        .filter_map(|o| match &o.outcome {
            Outcome::Skipped(reason) => Some((o.id.as_str(), reason)),
            _ => None,
        })
        .collect();
    if !skipped.is_empty() {
        println!();
        println!("  {}", "Skipped:".yellow().bold());
        for (id, reason) in skipped {
            println!("    {} {id}: {}", "⊘".yellow(), reason.to_string().dimmed());
        }
    }
}

fn summary_lines(summary: &RunSummary) -> Vec<String> {
    [
        (summary.created, "created"),
        (summary.updated, "updated"),
        (summary.deleted, "removed"),
        (summary.noop, "unchanged"),
        (summary.skipped, "skipped"),
        (summary.failed, "failed"),
    ]
    .into_iter()
    .filter(|(count, _)| *count > 0)
    .map(|(count, label)| format!("{count} resources {label}"))
    .collect()
}
