use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Delta-neutral funding-rate arbitrage keeper — scan perp venues for
/// funding spreads, open balanced pairs, collect funding, manage the risk.
#[derive(Parser)]
#[command(name = "funding-keeper", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the keeper daemon
    Run {
        /// Path to the keeper config file (TOML or JSON)
        config: PathBuf,

        /// Trade against in-process paper venues with synthetic markets
        /// instead of live adapters
        #[arg(long)]
        dry_run: bool,

        /// Execute one pass of every loop then exit (for external cron)
        #[arg(long)]
        once: bool,

        /// Seed for the paper venues' slippage jitter
        #[arg(long, default_value = "42")]
        seed: u64,
    },

    /// Validate a config file and report what would run
    CheckConfig {
        /// Path to the keeper config file
        config: PathBuf,
    },

    /// Output the JSON schema for the config file
    Schema,

    /// Output an example config TOML to stdout
    Example,
}
