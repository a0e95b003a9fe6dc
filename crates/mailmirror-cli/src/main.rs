use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod mbox;

use cli::{Cli, output_error, run_cli};

const CLI_SCHEMA_VERSION: u32 = 1;
const LOG_ENV: &str = "MAILMIRROR_LOG";

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout carries command output only.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    let rt = Arc::new(tokio::runtime::Runtime::new()?);
    if let Err(err) = run_cli(&rt, cli) {
        return output_error(&format!("{:#}", err));
    }
    Ok(())
}
