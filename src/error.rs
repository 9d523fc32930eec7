//! Daemon error types

use deckd_transport::TransportError;
use thiserror::Error;

use crate::keyboard::KeyboardError;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("config I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image: {0}")]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Keyboard(#[from] KeyboardError),

    #[error("D-Bus: {0}")]
    DBus(#[from] zbus::Error),

    #[error("failed to load module {path}: {reason}")]
    ModuleLoad { path: String, reason: String },

    #[error("module ABI mismatch: expected {expected}, got {actual}")]
    AbiMismatch { expected: u32, actual: u32 },

    #[error("Can't find connected device: {0}")]
    UnknownDevice(String),

    #[error("Invalid icon handler: {0}")]
    UnknownHandler(String),

    #[error("page {page} out of range ({pages} pages)")]
    InvalidPage { page: usize, pages: usize },

    #[error("key {index} out of range ({keys} keys)")]
    InvalidKey { index: usize, keys: usize },

    #[error("Handler {0} did not respond in a timely fashion")]
    PreviewTimeout(String),
}

impl DaemonError {
    /// Whether this wraps a transport failure meaning the device is gone
    pub fn is_device_gone(&self) -> bool {
        matches!(self, DaemonError::Transport(e) if e.is_device_gone())
    }
}

impl From<DaemonError> for zbus::fdo::Error {
    fn from(e: DaemonError) -> Self {
        match e {
            DaemonError::Json(_)
            | DaemonError::InvalidPage { .. }
            | DaemonError::InvalidKey { .. }
            | DaemonError::UnknownHandler(_) => zbus::fdo::Error::InvalidArgs(e.to_string()),
            other => zbus::fdo::Error::Failed(other.to_string()),
        }
    }
}
