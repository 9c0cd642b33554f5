//! Plan, apply and destroy commands

use anyhow::{Result, bail};
use declarative::{Orchestrator, RunOptions, RunSummary};
use std::path::Path;
use std::sync::Arc;

use crate::Context;
use crate::cli::{ApplyArgs, DestroyArgs, ManifestArgs};
use crate::config::Manifest;
use crate::engine::{self, ExecuteOptions, display_plan};
use crate::resource;
use crate::state::FileStore;
use crate::ui;

/// Build an orchestrator over the built-in types and a file store
pub fn orchestrator(ctx: &Context, state_dir: &Path, options: RunOptions) -> Result<Orchestrator> {
    log::debug!("State directory: {}", state_dir.display());
    let store = FileStore::new(state_dir);
    Ok(
        Orchestrator::new(Arc::new(resource::registry()?), Arc::new(store))
            .with_options(options)
            .with_cancellation(ctx.cancel.clone()),
    )
}

/// Show what `apply` would change
pub async fn plan(ctx: &Context, args: &ManifestArgs) -> Result<()> {
    let manifest = Manifest::load(&args.manifest)?;
    let desired = manifest.desired()?;
    let orchestrator = orchestrator(ctx, &manifest.state_dir()?, manifest.run_options(None))?;
    let scope = orchestrator.open_scope(&manifest.scope.name).await?;

    let plan = orchestrator.plan(&scope, &desired)?;
    display_plan(&plan, ctx.verbose > 0);
    Ok(())
}

pub async fn apply(ctx: &Context, args: &ApplyArgs) -> Result<()> {
    let manifest = Manifest::load(&args.manifest.manifest)?;
    let desired = manifest.desired()?;
    let orchestrator = orchestrator(ctx, &manifest.state_dir()?, manifest.run_options(args.jobs))?;
    let mut scope = orchestrator.open_scope(&manifest.scope.name).await?;

    if !ctx.quiet {
        ui::header(&format!("Applying {}", args.manifest.manifest.display()));
    }

    let opts = ExecuteOptions {
        dry_run: args.dry_run,
        yes: args.yes,
        quiet: ctx.quiet,
        verbose: ctx.verbose > 0,
    };
    let summary = engine::apply(&orchestrator, &mut scope, &desired, &opts).await?;
    check(&summary)
}

pub async fn destroy(ctx: &Context, args: &DestroyArgs) -> Result<()> {
    let (scope_name, state_dir, options) = match (&args.manifest, &args.scope) {
        (Some(path), _) => {
            let manifest = Manifest::load(path)?;
            (
                manifest.scope.name.clone(),
                manifest.state_dir()?,
                manifest.run_options(args.jobs),
            )
        }
        (None, Some(scope)) => (
            scope.clone(),
            crate::paths::state_dir()?,
            RunOptions {
                concurrency: args.jobs.unwrap_or(RunOptions::default().concurrency),
                ..RunOptions::default()
            },
        ),
        (None, None) => bail!("Pass a manifest or --scope to choose what to destroy"),
    };
    if options.concurrency == 0 {
        bail!("--jobs must be at least 1");
    }

    let orchestrator = orchestrator(ctx, &state_dir, options)?;
    let mut scope = orchestrator.open_scope(&scope_name).await?;

    let opts = ExecuteOptions {
        dry_run: args.dry_run,
        yes: args.yes,
        quiet: ctx.quiet,
        verbose: ctx.verbose > 0,
    };
    let summary = engine::destroy(&orchestrator, &mut scope, &opts).await?;
    check(&summary)
}

/// Turn failed or skipped resources into a non-zero exit
fn check(summary: &RunSummary) -> Result<()> {
    if summary.is_success() {
        Ok(())
    } else {
        bail!(
            "{} resources failed, {} skipped",
            summary.failed,
            summary.skipped
        )
    }
}
