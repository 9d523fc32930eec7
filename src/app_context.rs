//! Foreground application tracking
//!
//! The focused application's id selects which configuration variant each key
//! shows. Only Hyprland is supported; elsewhere every deck keeps its default
//! variants.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::DaemonError;

/// Consecutive `hyprctl` failures before focus tracking gives up
const MAX_FAILURES: u32 = 10;

pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Currently focused application id ("" when unknown)
pub struct ApplicationContext {
    tx: watch::Sender<String>,
}

impl ApplicationContext {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(String::new());
        Self { tx }
    }

    pub fn current(&self) -> String {
        self.tx.borrow().clone()
    }

    /// Record the focused application, returning whether it changed
    pub fn set(&self, app: &str) -> bool {
        self.tx.send_if_modified(|current| {
            if current == app {
                false
            } else {
                *current = app.to_string();
                true
            }
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<String> {
        self.tx.subscribe()
    }
}

impl Default for ApplicationContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Polls the compositor for the active window's class
pub struct FocusWatcher {
    context: Arc<ApplicationContext>,
    interval: Duration,
}

impl FocusWatcher {
    pub fn new(context: Arc<ApplicationContext>) -> Self {
        Self {
            context,
            interval: POLL_INTERVAL,
        }
    }

    pub async fn run(self, token: CancellationToken) {
        let desktop = std::env::var("XDG_CURRENT_DESKTOP").unwrap_or_default();
        if desktop != "Hyprland" {
            warn!(
                "Focus tracking is not supported on desktop {:?}, using default variants",
                desktop
            );
            return;
        }
        info!("Tracking focused window through hyprctl");

        let mut failures = 0;
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(self.interval) => {}
            }
            match active_class().await {
                Ok(class) => {
                    failures = 0;
                    if self.context.set(&class) {
                        debug!(app = %class, "Focused application changed");
                    }
                }
                Err(e) => {
                    failures += 1;
                    warn!("Failed to query active window ({}/{}): {}", failures, MAX_FAILURES, e);
                    if failures >= MAX_FAILURES {
                        error!("Giving up on focus tracking");
                        return;
                    }
                }
            }
        }
    }
}

async fn active_class() -> Result<String, DaemonError> {
    let output = tokio::process::Command::new("hyprctl")
        .args(["activewindow", "-j"])
        .output()
        .await?;
    if !output.status.success() {
        return Err(std::io::Error::other(format!("hyprctl exited with {}", output.status)).into());
    }
    parse_active_class(&output.stdout)
}

/// `class` of `hyprctl activewindow -j` output, "" without a focused window
pub fn parse_active_class(json: &[u8]) -> Result<String, DaemonError> {
    let value: Value = serde_json::from_slice(json)?;
    Ok(value
        .get("class")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string())
}
