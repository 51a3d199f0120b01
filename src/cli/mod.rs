use anyhow::Result;
use clap::{Parser, Subcommand};

// CLI Commands (cmd_ prefix)
mod cmd_inspect;
mod cmd_run;
mod cmd_state;

// Helper modules (no cmd_ prefix)
mod logger;
mod utils;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "blockbundle")]
#[command(version = VERSION)]
#[command(about = concat!("blockbundle v", env!("CARGO_PKG_VERSION"), " - one-block file merger"))]
#[command(long_about = concat!(
    "blockbundle v", env!("CARGO_PKG_VERSION"), " - one-block file merger\n\n",
    "Merges the one-block archive files produced by upstream ingestion\n",
    "nodes into fixed-size, fork-aware merged bundles stored in a blob\n",
    "directory, deleting consumed one-block files afterwards."
))]
#[command(propagate_version = true)]
struct Cli {
    /// Suppress progress output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the merge loop against a pair of stores
    Run(cmd_run::RunCommand),
    /// Print the contents of a written merged bundle
    Inspect(cmd_inspect::InspectCommand),
    /// Describe a bundler state file
    State(cmd_state::StateCommand),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    logger::init_logger(cli.verbose, cli.quiet);

    match cli.command {
        Commands::Run(cmd) => cmd_run::run(cmd)?,
        Commands::Inspect(cmd) => cmd_inspect::run(cmd)?,
        Commands::State(cmd) => cmd_state::run(cmd)?,
    }

    Ok(())
}
