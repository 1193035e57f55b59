mod cli;
mod commands;
mod config;
mod storage;

use std::sync::Arc;

use crate::cli::{Command, ConfigCommand};
use clap::Parser;
use color_eyre::Result;
use tracing::{debug, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vaultpref_storage::EntryStore;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    let config = config::load()?;
    match cli.command {
        Command::Version => print_version(),
        Command::Config(ConfigCommand::Init) => init_config(&config)?,
        command => {
            let store = Arc::new(storage::store_from_config(&config)?);
            spawn_warm_up(Arc::clone(&store));
            let worker = Arc::clone(&store);
            tokio::task::spawn_blocking(move || commands::run(command, &worker)).await??;
            store.close()?;
        }
    }

    Ok(())
}

fn init_tracing() {
    // Respect user-provided filters, default to info to avoid noisy stdout.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

/// Pre-build cipher instances off the main path; the store works without it.
fn spawn_warm_up(store: Arc<EntryStore>) {
    tokio::task::spawn_blocking(move || match store.warm_up() {
        Ok(()) => debug!("cipher pool warm-up finished"),
        Err(err) => warn!(%err, "cipher pool warm-up failed"),
    });
}

fn print_version() {
    println!("vaultpref {}", env!("CARGO_PKG_VERSION"));
}

fn init_config(config: &config::Config) -> Result<()> {
    let path = config::write_default_if_missing(config)?;
    println!("Config initialized at {}", path.display());
    Ok(())
}
