use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod classify;
mod commands;
mod config;
mod listing;
mod runner;
mod sandbox;
mod transport;

#[derive(Parser)]
#[command(name = "repro-runner")]
#[command(
    author,
    version,
    about = "Verify published vulnerability reproductions in disposable sandboxes"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify a batch of reproductions, one sandbox each
    Verify {
        /// Comma-separated reproduction ids (default: latest published)
        #[arg(long, value_delimiter = ',')]
        repro_ids: Vec<String>,

        /// How many published reproductions to fetch when no ids are given
        #[arg(long)]
        latest: Option<usize>,

        /// Maximum sandboxes running at once
        #[arg(short, long)]
        concurrency: Option<usize>,

        /// Per-task deadline in seconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Write a JSON report to this path
        #[arg(long, env = "RESULTS_FILE")]
        results_file: Option<PathBuf>,

        /// Skip TLS certificate validation on platform channels
        #[arg(long)]
        insecure_skip_verify: bool,
    },

    /// Open an interactive shell in a sandbox
    Shell {
        /// Reproduction to preconfigure the sandbox for
        #[arg(long)]
        repro_id: Option<String>,
    },

    /// Check that the platform endpoint is reachable
    Probe {
        /// Override the platform host
        #[arg(long)]
        host: Option<String>,

        /// Override the platform port
        #[arg(long)]
        port: Option<u16>,

        /// Skip TLS certificate validation
        #[arg(long)]
        insecure_skip_verify: bool,
    },

    /// Remove orphaned sandboxes
    Clean,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("repro_runner=debug")
    } else {
        EnvFilter::new("repro_runner=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Verify {
            repro_ids,
            latest,
            concurrency,
            timeout,
            results_file,
            insecure_skip_verify,
        } => {
            let all_passed = commands::verify::run(commands::verify::VerifyArgs {
                repro_ids,
                latest,
                concurrency,
                timeout_secs: timeout,
                results_file,
                insecure_skip_verify,
            })
            .await?;
            if !all_passed {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Shell { repro_id } => {
            commands::shell::run(repro_id).await?;
        }
        Commands::Probe {
            host,
            port,
            insecure_skip_verify,
        } => {
            commands::probe::run(host, port, insecure_skip_verify).await?;
        }
        Commands::Clean => {
            commands::clean::run().await?;
        }
    }

    Ok(ExitCode::SUCCESS)
}
