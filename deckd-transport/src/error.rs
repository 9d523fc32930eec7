//! Transport error types

use thiserror::Error;

/// Errors that can occur during transport operations
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Unsupported device {vid:04x}:{pid:04x}")]
    Unsupported { vid: u16, pid: u16 },

    /// Bitmap handed to the codec does not match the panel
    #[error("supplied image has wrong dimensions, expected {expected_w}x{expected_h} pixels, got {actual_w}x{actual_h}")]
    WrongDimensions {
        expected_w: u32,
        expected_h: u32,
        actual_w: u32,
        actual_h: u32,
    },

    #[error("Cannot encode image: {0}")]
    Encode(String),

    #[error("Index {index} out of range (max {max})")]
    OutOfRange { index: usize, max: usize },

    // HID-specific errors
    #[error("HID error: {0}")]
    HidError(String),

    #[error("HID permission denied: {0}")]
    HidPermissionDenied(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TransportError {
    /// True when the failure means the physical device is gone and the
    /// connection must be torn down.
    pub fn is_device_gone(&self) -> bool {
        matches!(
            self,
            TransportError::Disconnected
                | TransportError::HidError(_)
                | TransportError::DeviceNotFound(_)
        )
    }
}

impl From<hidapi::HidError> for TransportError {
    fn from(e: hidapi::HidError) -> Self {
        let msg = e.to_string();
        if msg.contains("Permission denied") || msg.contains("EPERM") {
            TransportError::HidPermissionDenied(msg)
        } else {
            TransportError::HidError(msg)
        }
    }
}

impl From<image::ImageError> for TransportError {
    fn from(e: image::ImageError) -> Self {
        TransportError::Encode(e.to_string())
    }
}
