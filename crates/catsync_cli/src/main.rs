//! catsync CLI
//!
//! Runs the staged sync engine against the in-memory mock catalog.
//!
//! # Commands
//!
//! - `simulate` - Stage, approve, apply and optionally roll back a fixture
//! - `config` - Print the default engine configuration
//! - `rules` - Print the default conflict rule table

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Staged catalog sync simulator.
#[derive(Parser)]
#[command(name = "catsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a staged sync simulation from a JSON fixture
    Simulate {
        /// Fixture with products and their candidate edits
        fixture: PathBuf,

        /// Engine configuration (JSON, missing keys use defaults)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Make the remote reject every mutation of this product key
        #[arg(long = "reject-entity", value_name = "KEY")]
        reject: Vec<String>,

        /// Throttle every Nth remote mutation
        #[arg(long, value_name = "N")]
        throttle_every: Option<u64>,

        /// Roll every finished batch back afterwards
        #[arg(long)]
        rollback: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Print the default engine configuration as JSON
    Config,

    /// Print the default conflict rule table as JSON
    Rules,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Simulate {
            fixture,
            config,
            reject,
            throttle_every,
            rollback,
            format,
        } => {
            let options = commands::simulate::Options {
                fixture,
                config,
                reject,
                throttle_every,
                rollback,
            };
            commands::simulate::run(&options, &format)?;
        }
        Commands::Config => commands::config::run()?,
        Commands::Rules => commands::rules::run()?,
    }

    Ok(())
}
