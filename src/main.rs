//! deckd - Stream Deck style macro keypad daemon
//!
//! Entry point: logging setup and command dispatch.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use deckd::config::Config;
use deckd::handler::ModuleRegistry;
use deckd_transport::HidDiscovery;

mod cli;
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config_path = cli.config.unwrap_or_else(Config::default_path);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!("Starting deckd {}", env!("CARGO_PKG_VERSION"));
            deckd::daemon::run(config_path)
                .await
                .context("daemon failed")?;
        }
        Commands::List => list_decks()?,
        Commands::Modules => print_modules(&config_path)?,
    }
    Ok(())
}

fn list_decks() -> Result<()> {
    let discovery = HidDiscovery::new();
    let decks = discovery
        .list_devices()
        .context("failed to enumerate HID devices")?;
    if decks.is_empty() {
        println!("No decks found");
        return Ok(());
    }

    for found in &decks {
        let firmware = match discovery.open(found) {
            Ok((deck, _reader)) => deck
                .firmware_version()
                .unwrap_or_else(|e| format!("unknown ({e})")),
            Err(e) => format!("cannot open ({e})"),
        };
        println!(
            "{:<12} {:<14} {:<12} {}",
            found.descriptor.name,
            found.info.identity(),
            firmware,
            found.info.device_path
        );
    }
    Ok(())
}

fn print_modules(config_path: &Path) -> Result<()> {
    let registry = ModuleRegistry::with_builtins();
    if config_path.exists() {
        let config = Config::load(config_path)
            .with_context(|| format!("failed to load {}", config_path.display()))?;
        let loaded = registry.load_all(&config.modules);
        if loaded < config.modules.len() {
            warn!("{} modules failed to load", config.modules.len() - loaded);
        }
    }
    println!("{}", serde_json::to_string_pretty(&registry.list())?);
    Ok(())
}
