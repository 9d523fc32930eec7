//! D-Bus control plane
//!
//! Bus name: `org.deckd.Daemon1`
//! Object path: `/org/deckd/Daemon1`
//!
//! Configuration and deck state travel as JSON strings so configurator
//! frontends can reuse the file format as is.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zbus::object_server::SignalEmitter;
use zbus::{interface, proxy, Connection};

use crate::error::DaemonError;
use crate::lifecycle::DeckManager;
use crate::runtime::PageChanged;

pub const BUS_NAME: &str = "org.deckd.Daemon1";
pub const OBJECT_PATH: &str = "/org/deckd/Daemon1";

/// D-Bus interface implementation.
pub struct DaemonInterface {
    manager: Arc<DeckManager>,
}

impl DaemonInterface {
    pub fn new(manager: Arc<DeckManager>) -> Self {
        Self { manager }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| DaemonError::from(e).into())
}

#[interface(name = "org.deckd.Daemon1")]
impl DaemonInterface {
    /// Every known deck, connected or not
    async fn get_deck_info(&self) -> zbus::fdo::Result<String> {
        to_json(&self.manager.deck_infos())
    }

    async fn get_config(&self) -> zbus::fdo::Result<String> {
        Ok(self.manager.config().to_json()?)
    }

    /// Re-read the config file, discarding uncommitted changes
    async fn reload_config(&self) -> zbus::fdo::Result<()> {
        Ok(self.manager.reload_config().await?)
    }

    /// Show a page (0-indexed)
    async fn set_page(&self, serial: &str, page: u32) -> zbus::fdo::Result<()> {
        Ok(self.manager.set_page(serial, page as usize).await?)
    }

    /// Apply a config document without saving it
    async fn set_config(&self, config: &str) -> zbus::fdo::Result<()> {
        Ok(self.manager.set_config(config).await?)
    }

    /// Save the current config to disk
    async fn commit_config(&self) -> zbus::fdo::Result<()> {
        Ok(self.manager.commit_config()?)
    }

    /// Registered handler modules with their declared fields
    async fn get_modules(&self) -> zbus::fdo::Result<String> {
        to_json(&self.manager.services().registry.list())
    }

    /// Simulate a press and release of a key
    async fn press_button(&self, serial: &str, index: u32) -> zbus::fdo::Result<()> {
        Ok(self.manager.press_button(serial, index as usize).await?)
    }

    /// First frame of an icon handler for `key_config`, as a PNG data URL
    async fn get_handler_example(
        &self,
        serial: &str,
        key_config: &str,
    ) -> zbus::fdo::Result<String> {
        Ok(self.manager.preview(serial, key_config).await?)
    }

    #[zbus(signal)]
    async fn page(emitter: &SignalEmitter<'_>, serial: &str, page: u32) -> zbus::Result<()>;
}

/// Emit `Page` for every page change until cancelled
pub async fn forward_pages(
    conn: Connection,
    mut pages: broadcast::Receiver<PageChanged>,
    token: CancellationToken,
) {
    let emitter = match SignalEmitter::new(&conn, OBJECT_PATH) {
        Ok(emitter) => emitter,
        Err(e) => {
            warn!("Cannot emit page signals: {}", e);
            return;
        }
    };
    loop {
        let changed = tokio::select! {
            _ = token.cancelled() => break,
            changed = pages.recv() => changed,
        };
        match changed {
            Ok(changed) => {
                let page = u32::try_from(changed.page).unwrap_or(u32::MAX);
                if let Err(e) = DaemonInterface::page(&emitter, &changed.serial, page).await {
                    warn!(serial = %changed.serial, "Failed to emit page signal: {}", e);
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                debug!("Dropped {} page signals", missed);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[proxy(
    interface = "org.freedesktop.ScreenSaver",
    default_service = "org.freedesktop.ScreenSaver",
    default_path = "/org/freedesktop/ScreenSaver"
)]
trait ScreenSaver {
    #[zbus(signal)]
    fn active_changed(&self, active: bool) -> zbus::Result<()>;
}

/// Lock and unlock every deck with the screen saver
pub async fn watch_screen_lock(
    conn: Connection,
    manager: Arc<DeckManager>,
    token: CancellationToken,
) -> Result<(), DaemonError> {
    let proxy = ScreenSaverProxy::new(&conn).await?;
    let mut changes = proxy.receive_active_changed().await?;
    info!("Watching screen saver for lock state");
    loop {
        let signal = tokio::select! {
            _ = token.cancelled() => break,
            signal = changes.next() => signal,
        };
        let Some(signal) = signal else {
            break;
        };
        match signal.args() {
            Ok(args) => manager.set_locked(*args.active()).await,
            Err(e) => warn!("Malformed ActiveChanged signal: {}", e),
        }
    }
    Ok(())
}
