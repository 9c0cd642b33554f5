use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "provision")]
#[command(version)]
#[command(about = "Declarative provisioning of local resources", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show what apply would change
    Plan(ManifestArgs),

    /// Make the scope match the manifest
    Apply(ApplyArgs),

    /// Delete every resource recorded for a scope
    Destroy(DestroyArgs),

    /// Inspect recorded state
    #[command(subcommand)]
    State(StateCommand),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args)]
pub struct ManifestArgs {
    /// Manifest file
    #[arg(default_value = "provision.toml", env = "PROVISION_MANIFEST")]
    pub manifest: PathBuf,
}

#[derive(Args)]
pub struct ApplyArgs {
    #[command(flatten)]
    pub manifest: ManifestArgs,

    /// Show the plan without applying it
    #[arg(long)]
    pub dry_run: bool,

    /// Number of parallel jobs
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Skip confirmation prompt
    #[arg(short, long)]
    pub yes: bool,
}

#[derive(Args)]
pub struct DestroyArgs {
    /// Manifest naming the scope and its state directory
    #[arg(env = "PROVISION_MANIFEST")]
    pub manifest: Option<PathBuf>,

    /// Scope to destroy when no manifest is given
    #[arg(long, conflicts_with = "manifest")]
    pub scope: Option<String>,

    /// Show what would be removed
    #[arg(long)]
    pub dry_run: bool,

    /// Number of parallel jobs
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Skip confirmation prompt
    #[arg(short, long)]
    pub yes: bool,
}

#[derive(Subcommand)]
pub enum StateCommand {
    /// List recorded scopes, or the resources of one scope
    List {
        /// Scope to list
        #[arg(long)]
        scope: Option<String>,
    },

    /// Show the recorded props and output of one resource
    Show {
        /// Scope holding the resource
        #[arg(long)]
        scope: String,

        /// Resource id
        id: String,
    },
}
