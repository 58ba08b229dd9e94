//! CLI argument definitions and dispatch.

mod simulate;
mod window;

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use multipath_budget::BudgetConfig;

#[derive(Parser)]
#[command(
    name = "multipath-budget",
    version,
    about = "Daily opportunistic data budget for a secondary metered network"
)]
pub(crate) struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json: bool,

    /// Config file (default: ~/.multipath-budget/config.json)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run a scenario file against in-memory collaborators
    Simulate {
        /// Path to the scenario JSON
        scenario: PathBuf,
    },
    /// Print the cycle window containing an instant
    Window {
        /// Cycle anchor (RFC 3339); its offset is used as the local timezone
        #[arg(long, value_parser = parse_instant)]
        start: DateTime<FixedOffset>,
        /// Whole months per cycle
        #[arg(long, default_value_t = 1)]
        months: i32,
        /// Extra days per cycle
        #[arg(long, default_value_t = 0)]
        days: i32,
        /// Instant to evaluate (default: now)
        #[arg(long, value_parser = parse_instant)]
        now: Option<DateTime<FixedOffset>>,
    },
    /// Print the effective configuration
    Config,
}

pub(crate) fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.unwrap_or_else(BudgetConfig::path);
    let config = BudgetConfig::load_or_default(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    match cli.command {
        Command::Simulate { scenario } => simulate::cmd_simulate(&scenario, &config).await,
        Command::Window {
            start,
            months,
            days,
            now,
        } => window::cmd_window(start, months, days, now),
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn parse_instant(raw: &str) -> std::result::Result<DateTime<FixedOffset>, String> {
    DateTime::parse_from_rfc3339(raw).map_err(|e| format!("expected RFC 3339 timestamp: {e}"))
}
