//! Atlas launcher
//!
//! - `serve`: HTTP API over the card engine
//! - `cards`, `run`, `evidence`: one-shot commands against the same config

use anyhow::Result;
use atlas_logging::{init_logging, LogConfig};
use atlas_server::EngineArgs;
use clap::{Parser, Subcommand};
use std::process::ExitCode;
use tracing::error;

mod cli;

#[derive(Parser, Debug)]
#[command(name = "atlas", about = "Card orchestration engine", version)]
struct Cli {
    /// Enable verbose logging (debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(flatten)]
    engine: EngineArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the HTTP API
    Serve(cli::serve::ServeArgs),

    /// Inspect cards
    Cards {
        #[command(subcommand)]
        action: cli::cards::CardsAction,
    },

    /// Execute a card and print the Dossier
    Run(cli::run::RunArgs),

    /// Manage the evidence store
    Evidence {
        #[command(subcommand)]
        action: cli::evidence::EvidenceAction,
    },
}

async fn run_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Serve(args) => cli::serve::run(args, &cli.engine).await,
        Commands::Cards { action } => cli::cards::run(action, &cli.engine),
        Commands::Run(args) => cli::run::run(args, &cli.engine).await,
        Commands::Evidence { action } => cli::evidence::run(action, &cli.engine).await,
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(LogConfig {
        app_name: "atlas",
        verbose: cli.verbose,
    }) {
        eprintln!("Warning: logging disabled: {:#}", e);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run_command(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
