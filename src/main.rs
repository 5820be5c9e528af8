mod cli;
mod config;
mod error;
mod graphics;
mod identity;
mod launch;
mod library;
mod progress;
mod runtime;
mod session;
mod settings;
mod supervisor;
mod tool;
mod utils;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    let config = config::Config::load(cli.config.as_deref())?;

    let default_level = if cli.verbose {
        "debug"
    } else {
        config.general.log_level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    cli.execute(config).await
}
