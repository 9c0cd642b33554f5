mod cli;
mod commands;
mod config;
mod engine;
mod paths;
mod progress;
mod resource;
mod state;
mod ui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use std::io;
use tokio_util::sync::CancellationToken;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
    /// Cancelled on Ctrl-C; runs stop starting new invocations
    pub cancel: CancellationToken,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
        cancel: CancellationToken::new(),
    };

    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted, waiting for running resources to finish");
            cancel.cancel();
        }
    });

    match cli.command {
        Command::Plan(args) => commands::converge::plan(&ctx, &args).await,
        Command::Apply(args) => commands::converge::apply(&ctx, &args).await,
        Command::Destroy(args) => commands::converge::destroy(&ctx, &args).await,
        Command::State(cmd) => commands::state::run(&ctx, cmd).await,
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "provision", &mut io::stdout());
            Ok(())
        }
    }
}
