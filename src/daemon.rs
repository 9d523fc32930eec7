//! Daemon: deck lifecycle + D-Bus server + focus tracking.

use std::path::PathBuf;
use std::sync::Arc;

use deckd_transport::HidDiscovery;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::actions::ShellLauncher;
use crate::app_context::{ApplicationContext, FocusWatcher};
use crate::config::ConfigStore;
use crate::dbus::{self, DaemonInterface, BUS_NAME, OBJECT_PATH};
use crate::error::DaemonError;
use crate::handler::ModuleRegistry;
use crate::keyboard::{self, KeyHolder, VirtualKeyboard};
use crate::lifecycle::DeckManager;
use crate::runtime::Services;

/// Run the daemon until Ctrl-C or SIGTERM.
///
/// - Loads the config (writing a default one on first run)
/// - Registers built-in handlers and loads configured modules
/// - Starts a D-Bus server on `org.deckd.Daemon1`
/// - Polls for decks and drives them until shutdown, then resets them
pub async fn run(config_path: PathBuf) -> Result<(), DaemonError> {
    let config = Arc::new(ConfigStore::open(config_path)?);
    info!("Config: {}", config.path().display());

    let registry = Arc::new(ModuleRegistry::with_builtins());
    let modules = config.modules();
    if !modules.is_empty() {
        let loaded = registry.load_all(&modules);
        info!("Loaded {}/{} handler modules", loaded, modules.len());
    }

    let keys: Option<Arc<dyn KeyHolder>> = match VirtualKeyboard::new(keyboard::DEVICE_NAME) {
        Ok(kb) => Some(Arc::new(kb)),
        Err(e) => {
            warn!("Virtual keyboard unavailable, key_hold disabled: {}", e);
            None
        }
    };
    let services = Arc::new(Services::new(registry, Arc::new(ShellLauncher), keys));
    let context = Arc::new(ApplicationContext::new());
    let manager = DeckManager::new(
        config,
        Arc::clone(&services),
        Arc::new(HidDiscovery::new()),
        Arc::clone(&context),
    );

    // Ctrl-C / SIGTERM
    let token = CancellationToken::new();
    let ctrlc_token = token.clone();
    if let Err(e) = ctrlc::set_handler(move || ctrlc_token.cancel()) {
        warn!("Failed to install signal handler: {}", e);
    }

    let conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, DaemonInterface::new(Arc::clone(&manager)))?
        .build()
        .await?;
    info!("D-Bus: {} on session bus", BUS_NAME);

    tokio::spawn(dbus::forward_pages(
        conn.clone(),
        services.pages.subscribe(),
        token.clone(),
    ));
    let lock_conn = conn.clone();
    let lock_manager = Arc::clone(&manager);
    let lock_token = token.clone();
    tokio::spawn(async move {
        if let Err(e) = dbus::watch_screen_lock(lock_conn, lock_manager, lock_token).await {
            warn!("Screen lock tracking unavailable: {}", e);
        }
    });
    tokio::spawn(FocusWatcher::new(context).run(token.clone()));

    info!("Ready. Ctrl+C to stop.");
    manager.run(token).await;

    drop(conn);
    info!("Done.");
    Ok(())
}
