//! Device discovery for Stream Deck keypads

use std::ffi::CString;

use hidapi::HidApi;
use tracing::debug;

use crate::device_registry::{self, VENDOR_ID};
use crate::error::TransportError;
use crate::event_parser::ReportReader;
use crate::hid_wired::Deck;
use crate::types::{DiscoveredDeck, TransportDeviceInfo};

/// HID enumeration restricted to supported models
#[derive(Debug, Default, Clone, Copy)]
pub struct HidDiscovery;

impl HidDiscovery {
    pub fn new() -> Self {
        Self
    }

    /// List every attached supported device
    ///
    /// Unknown product IDs from the vendor are skipped silently.
    pub fn list_devices(&self) -> Result<Vec<DiscoveredDeck>, TransportError> {
        let api = HidApi::new()?;
        let mut devices = Vec::new();

        for device_info in api.device_list() {
            let vid = device_info.vendor_id();
            let pid = device_info.product_id();
            if vid != VENDOR_ID {
                continue;
            }
            let Some(descriptor) = device_registry::find_descriptor(vid, pid) else {
                debug!("Skipping unsupported device {:04x}:{:04x}", vid, pid);
                continue;
            };

            let path = device_info.path().to_string_lossy().to_string();
            let mut info = TransportDeviceInfo::new(vid, pid, &path, device_info.serial_number());
            info.manufacturer = device_info.manufacturer_string().map(str::to_string);
            info.product_name = device_info.product_string().map(str::to_string);

            debug!(
                "Found device: VID={:04X} PID={:04X} model={:?} path={}",
                vid, pid, descriptor.model, path
            );
            devices.push(DiscoveredDeck { info, descriptor });
        }

        Ok(devices)
    }

    /// Open a discovered device
    ///
    /// Returns the write-side [`Deck`] and a second handle on the same path
    /// for the blocking input loop.
    pub fn open(
        &self,
        device: &DiscoveredDeck,
    ) -> Result<(Deck, Box<dyn ReportReader>), TransportError> {
        let api = HidApi::new()?;
        let path = CString::new(device.info.device_path.clone())
            .map_err(|e| TransportError::Internal(e.to_string()))?;

        let output = api.open_path(&path)?;
        let input = api.open_path(&path)?;
        debug!("Opened {} at {}", device.info.identity(), device.info.device_path);

        Ok((
            Deck::new(device.descriptor, device.info.clone(), Box::new(output)),
            Box::new(input),
        ))
    }
}
