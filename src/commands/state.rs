//! Read-only views of recorded state

use anyhow::{Context as _, Result, bail};
use colored::Colorize;
use declarative::{StateRecord, StateStore};

use crate::Context;
use crate::cli::StateCommand;
use crate::state::FileStore;
use crate::ui;

pub async fn run(ctx: &Context, cmd: StateCommand) -> Result<()> {
    let store = FileStore::new(crate::paths::state_dir()?);
    match cmd {
        StateCommand::List { scope: None } => list_scopes(ctx, &store).await,
        StateCommand::List { scope: Some(scope) } => list_records(&store, &scope).await,
        StateCommand::Show { scope, id } => show(&store, &scope, &id).await,
    }
}

async fn list_scopes(ctx: &Context, store: &FileStore) -> Result<()> {
    let scopes = store.scopes().await?;
    ui::header("Scopes");
    if !ctx.quiet {
        ui::kv("State directory", &store.root().display().to_string());
    }
    if scopes.is_empty() {
        ui::dim("No recorded scopes");
        return Ok(());
    }

    println!();
    for scope in scopes {
        let count = store.list(&scope).await?.len();
        println!("  {} {:<30} {}", "●".cyan(), scope, format!("{count} resources").dimmed());
    }
    Ok(())
}

async fn list_records(store: &FileStore, scope: &str) -> Result<()> {
    let records = store.list(scope).await?;
    ui::header(&format!("Scope '{scope}'"));
    if records.is_empty() {
        ui::dim("No recorded resources");
        return Ok(());
    }

    println!();
    for record in &records {
        println!("  {}", record_line(record));
    }
    Ok(())
}

async fn show(store: &FileStore, scope: &str, id: &str) -> Result<()> {
    let Some(record) = store.get(scope, id).await? else {
        bail!("No resource '{id}' recorded in scope '{scope}'");
    };

    ui::header(&record.id);
    ui::kv("Type", record.resource_type.as_str());
    ui::kv("Sequence", &record.sequence.to_string());
    ui::kv("Last updated", &record.last_updated.to_rfc3339());
    if !record.dependencies.is_empty() {
        ui::kv("Depends on", &record.dependencies.join(", "));
    }

    ui::section("Props");
    println!("{}", pretty(&record.props)?);
    ui::section("Output");
    println!("{}", pretty(&record.output)?);
    Ok(())
}

fn record_line(record: &StateRecord) -> String {
    format!(
        "{:>3}. {:<30} {:<16} {}",
        record.sequence,
        record.id,
        record.resource_type.as_str(),
        record
            .last_updated
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .dimmed()
    )
}

fn pretty(value: &serde_json::Value) -> Result<String> {
    serde_json::to_string_pretty(value).context("Failed to render JSON")
}
