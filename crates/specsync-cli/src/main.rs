mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "specsync",
    about = "Deterministic specification-to-artifact sync — normalize, extract, emit, canonicalize, receipt",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from specsync.yaml or .git/)
    #[arg(long, global = true, env = "SPECSYNC_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scaffold a manifest and a worked example transform
    Init,

    /// Run transforms: graph in, artifact plus receipt out
    Sync {
        /// Transform name (omit to run all)
        name: Option<String>,

        /// Perform every stage except the final writes
        #[arg(long)]
        dry_run: bool,

        /// Keep running, re-syncing when any referenced file changes
        #[arg(long)]
        watch: bool,

        /// Watch poll interval in seconds
        #[arg(long, default_value = "2")]
        interval_secs: u64,
    },

    /// List the transforms defined in the manifest
    List,

    /// Validate the manifest for common mistakes
    Validate,

    /// Check receipts against the current inputs and outputs
    Verify {
        /// Transform name (omit to verify all)
        name: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root),
        Commands::Sync {
            name,
            dry_run,
            watch,
            interval_secs,
        } => cmd::sync::run(
            &root,
            name.as_deref(),
            dry_run,
            watch,
            interval_secs,
            cli.json,
        ),
        Commands::List => cmd::list::run(&root, cli.json),
        Commands::Validate => cmd::validate::run(&root, cli.json),
        Commands::Verify { name } => cmd::verify::run(&root, name.as_deref(), cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
