//! deckd - daemon for Stream Deck style macro keypads
//!
//! Per-deck runtime, handler plugin contract, configuration, focus tracking
//! and the D-Bus control plane. Wire protocol and HID access live in
//! `deckd-transport`.

pub mod actions;
pub mod app_context;
pub mod config;
pub mod daemon;
pub mod dbus;
pub mod error;
pub mod handler;
pub mod keyboard;
pub mod lifecycle;
pub mod render;
pub mod runtime;

pub use app_context::{ApplicationContext, FocusWatcher};
pub use config::{Config, ConfigStore};
pub use error::DaemonError;
pub use handler::{DeckInfo, ModuleRegistry};
pub use lifecycle::{DeckManager, DeckSource};
pub use runtime::{PageChanged, Position, Services, VirtualDevice};
