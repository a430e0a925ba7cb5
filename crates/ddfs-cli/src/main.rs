//! # ddfs CLI
//!
//! Command-line front end for the ddfs block-map auditor.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ddfs_audit::AuditMode;
use ddfs_config::logging::{init_logging, LogLevel};
use ddfs_config::DedupConfig;

mod audit;
mod progress;

/// ddfs - deduplicated volume maintenance
#[derive(Parser, Debug)]
#[command(name = "ddfs")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file (default: ~/.ddfs/config.toml merged with .ddfs/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Verify that every chunk referenced by a block map exists
    Check(audit::AuditArgs),

    /// Verify and restore the target replica count of every chunk
    Repair(audit::AuditArgs),

    /// Print the effective configuration as TOML
    Config,
}

fn load_config(path: Option<&PathBuf>) -> Result<DedupConfig> {
    match path {
        Some(path) => DedupConfig::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => DedupConfig::load().context("Failed to load config"),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(LogLevel::from_verbosity(cli.verbose));

    let config = load_config(cli.config.as_ref())?;
    match cli.command {
        Commands::Check(args) => audit::run(AuditMode::VerifyOnly, config, args),
        Commands::Repair(args) => audit::run(AuditMode::Repair, config, args),
        Commands::Config => {
            print!("{}", config.to_toml());
            Ok(())
        }
    }
}
