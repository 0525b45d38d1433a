use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use config::CliConfig;

/// ot-cli: Maintenance tool for ot-kit commit repositories.
///
/// Inspect, merge, snapshot and clean up SQLite repositories of
/// call-signaling operations from the command line.
#[derive(Parser)]
#[command(name = "ot", version, about, long_about = None)]
struct Cli {
    /// Path to the SQLite database file.
    #[arg(long, global = true, default_value = "ot.db")]
    db: PathBuf,

    /// Path to a TOML config file. Defaults to ./ot.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless OT_LOG or RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database with an empty root commit.
    Init,

    /// Show heads and row counts.
    Status,

    /// List commits, newest first.
    Log {
        /// Limit the number of commits shown.
        #[arg(long, default_value = "20")]
        last: usize,
    },

    /// Print a commit and its parent diffs as JSON.
    Show {
        /// Commit id.
        id: u64,
    },

    /// Print the materialized state of a commit as JSON.
    Checkout {
        /// Commit id. Defaults to the newest head.
        id: Option<u64>,
    },

    /// Merge all heads into one and publish it.
    Merge,

    /// Store a materialized snapshot for a commit.
    Snapshot {
        /// Commit id.
        id: u64,
    },

    /// Delete unreachable commits older than a commit by the retention margin.
    Cleanup {
        /// Commit whose timestamp anchors the retention window.
        min_id: u64,
    },

    /// Write a point-in-time copy of a commit to the backup table.
    Backup {
        /// Commit id.
        id: u64,
    },

    /// Run two replicas placing concurrent calls against an in-memory database.
    Demo,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env("OT_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result: Result<(), Box<dyn std::error::Error>> =
        match CliConfig::discover(cli.config.as_deref()) {
            Ok(config) => run(cli.command, commands::Context::new(cli.db, config)).await,
            Err(e) => Err(e.into()),
        };

    if let Err(e) = result {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

async fn run(command: Commands, ctx: commands::Context) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Init => commands::init(&ctx).await,
        Commands::Status => commands::status(&ctx).await,
        Commands::Log { last } => commands::log(&ctx, last).await,
        Commands::Show { id } => commands::show(&ctx, id).await,
        Commands::Checkout { id } => commands::checkout(&ctx, id).await,
        Commands::Merge => commands::merge(&ctx).await,
        Commands::Snapshot { id } => commands::snapshot(&ctx, id).await,
        Commands::Cleanup { min_id } => commands::cleanup(&ctx, min_id).await,
        Commands::Backup { id } => commands::backup(&ctx, id).await,
        Commands::Demo => commands::demo(&ctx).await,
    }
}
