//! `multipath-budget` command-line entry point.

mod cli;

use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    // Missing .env is fine.
    let _ = dotenvy::dotenv();

    let args = cli::Cli::parse();
    cli::init_logging(args.json);
    cli::run(args).await
}
