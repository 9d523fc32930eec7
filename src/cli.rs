// CLI definitions using clap

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "deckd")]
#[command(author, version, about = "Daemon for Stream Deck style USB macro keypads")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Config file path (default: $XDG_CONFIG_HOME/.streamdeck-config.json)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Clone, Copy)]
pub enum Commands {
    /// Run the daemon (default)
    Run,

    /// List connected decks with model, serial and firmware
    #[command(visible_aliases = ["ls"])]
    List,

    /// Print registered handler modules as JSON
    Modules,
}
