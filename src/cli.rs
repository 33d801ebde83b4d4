//! CLI entry points, per SPEC_FULL.md §10.4.
//!
//! Mirrors the teacher's `cli/cli.rs` shape: a `clap::Parser` with a `Run`/
//! `Validate`/`Version` subcommand set, delegating `Run` straight into
//! [`crate::runtime::run`].

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "lotus", version, about = "Single-node log ingestion and query gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server (ingestion, query surfaces, retention, backup).
    Run {
        #[arg(short, long, default_value = "/etc/lotus.toml")]
        config: PathBuf,
    },
    /// Load and validate a configuration file without starting the server.
    Validate {
        #[arg(short, long, default_value = "/etc/lotus.toml")]
        config: PathBuf,
    },
    /// Print version information.
    Version,
}

/// Entry function for the CLI.
pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => crate::runtime::run(config).await?,
        Commands::Validate { config } => validate_config(config)?,
        Commands::Version => show_version(),
    }

    Ok(())
}

fn validate_config(config: PathBuf) -> Result<()> {
    println!("Validating configuration file: {}", config.display());
    let cfg = crate::config::Config::load(&config)?;
    println!("Configuration valid:\n{cfg:#?}");
    Ok(())
}

fn show_version() {
    println!("lotus {}", env!("CARGO_PKG_VERSION"));
}
