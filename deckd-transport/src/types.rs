//! Common types for the transport layer

use serde::Serialize;

use crate::device_registry::DeviceDescriptor;

/// Device identification information
#[derive(Debug, Clone, Serialize)]
pub struct TransportDeviceInfo {
    /// USB Vendor ID
    pub vid: u16,
    /// USB Product ID
    pub pid: u16,
    /// OS device path
    pub device_path: String,
    /// Serial number if available
    pub serial: Option<String>,
    pub manufacturer: Option<String>,
    pub product_name: Option<String>,
}

/// Length of a genuine hardware serial
pub const SERIAL_LEN: usize = 12;

impl TransportDeviceInfo {
    pub fn new(vid: u16, pid: u16, device_path: &str, serial: Option<&str>) -> Self {
        Self {
            vid,
            pid,
            device_path: device_path.to_string(),
            serial: serial.map(str::to_string),
            manufacturer: None,
            product_name: None,
        }
    }

    /// Whether the serial looks like a real hardware serial
    ///
    /// Freshly flashed or half-enumerated devices report an empty or
    /// truncated serial.
    pub fn has_valid_serial(&self) -> bool {
        self.serial
            .as_deref()
            .map(|s| s.len() == SERIAL_LEN && s.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or(false)
    }

    /// Identity used to bind configuration: serial, falling back to the path
    pub fn identity(&self) -> &str {
        match &self.serial {
            Some(s) if self.has_valid_serial() => s,
            _ => &self.device_path,
        }
    }

    /// "Manufacturer Product" display name
    pub fn display_name(&self) -> String {
        match (&self.manufacturer, &self.product_name) {
            (Some(m), Some(p)) => format!("{m} {p}"),
            (None, Some(p)) => p.clone(),
            (Some(m), None) => m.clone(),
            (None, None) => String::new(),
        }
    }
}

/// A supported device seen during enumeration
#[derive(Debug, Clone)]
pub struct DiscoveredDeck {
    pub info: TransportDeviceInfo,
    pub descriptor: &'static DeviceDescriptor,
}
