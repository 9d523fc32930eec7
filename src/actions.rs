//! External side effects of key and knob actions
//!
//! Commands run detached through `sh -c nohup ...` in their own process group
//! so they outlive the daemon. The [`Launcher`] trait is the seam the runtime
//! calls through; tests substitute a recorder.

use std::collections::BTreeMap;
use std::os::unix::process::CommandExt;
use std::process::Stdio;

use tracing::{info, warn};

/// Runs action side effects
pub trait Launcher: Send + Sync {
    /// Run a shell command detached from the daemon
    fn run(&self, command: &str);

    /// Synthesize a key chord (`ctrl+c`, `XF86AudioPlay`, ...)
    fn keybind(&self, keys: &str) {
        self.run(&format!("xdotool key {keys}"));
    }

    fn open_url(&self, url: &str) {
        self.run(&format!("xdg-open {url}"));
    }

    /// Named integration command (e.g. a streaming-software scene switch)
    fn integration(&self, command: &str, params: &BTreeMap<String, String>) {
        warn!(
            command,
            ?params,
            "No integration available for command, ignoring"
        );
    }
}

/// Launcher spawning real processes
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellLauncher;

impl Launcher for ShellLauncher {
    fn run(&self, command: &str) {
        let mut cmd = std::process::Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(format!("nohup {command}"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0);

        match cmd.spawn() {
            Ok(mut child) => {
                info!("{} has been started with pid {}", command, child.id());
                // reap in the background so no zombie is left behind
                let command = command.to_string();
                let spawned = std::thread::Builder::new()
                    .name("deckd-reaper".into())
                    .spawn(move || {
                        if let Err(e) = child.wait() {
                            warn!("Failed to wait for {}: {}", command, e);
                        }
                    });
                if let Err(e) = spawned {
                    warn!("Failed to spawn reaper thread: {}", e);
                }
            }
            Err(e) => warn!("There was a problem running {}: {}", command, e),
        }
    }
}
