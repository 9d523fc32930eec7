//! Wired HID device handle
//!
//! A [`Deck`] is one open physical connection. Every output and feature
//! report goes through a single mutex so a multi-page image transfer is never
//! interleaved with another write. Encoding happens before the lock is taken.

use std::time::{Duration, Instant};

use image::{Rgba, RgbaImage};
use parking_lot::Mutex;
use tracing::debug;

use crate::codec::{encode_bitmap, encode_lcd};
use crate::device_registry::DeviceDescriptor;
use crate::error::TransportError;
use crate::protocol::{
    self, build_feature_report, build_lcd_page_header, frame_reports, timing, FeatureCommand,
    LcdRegion, LCD_HEADER_SIZE,
};
use crate::types::TransportDeviceInfo;

/// Write side of a device handle
pub trait ReportWire: Send {
    /// Write one output report
    fn write_report(&mut self, data: &[u8]) -> Result<usize, TransportError>;
    fn send_feature_report(&mut self, data: &[u8]) -> Result<(), TransportError>;
    /// Read a feature report; `buf[0]` carries the command on entry
    fn get_feature_report(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;
}

impl ReportWire for hidapi::HidDevice {
    fn write_report(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        Ok(self.write(data)?)
    }

    fn send_feature_report(&mut self, data: &[u8]) -> Result<(), TransportError> {
        Ok(hidapi::HidDevice::send_feature_report(self, data)?)
    }

    fn get_feature_report(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        Ok(hidapi::HidDevice::get_feature_report(self, buf)?)
    }
}

#[derive(Debug, Clone, Copy)]
struct PowerState {
    brightness: u8,
    asleep: bool,
    pre_sleep_brightness: u8,
}

/// One open keypad
pub struct Deck {
    descriptor: &'static DeviceDescriptor,
    info: TransportDeviceInfo,
    /// `None` once closed
    wire: Mutex<Option<Box<dyn ReportWire>>>,
    power: Mutex<PowerState>,
    last_activity: Mutex<Instant>,
}

impl Deck {
    pub fn new(
        descriptor: &'static DeviceDescriptor,
        info: TransportDeviceInfo,
        wire: Box<dyn ReportWire>,
    ) -> Self {
        Self {
            descriptor,
            info,
            wire: Mutex::new(Some(wire)),
            power: Mutex::new(PowerState {
                brightness: protocol::MAX_BRIGHTNESS,
                asleep: false,
                pre_sleep_brightness: protocol::MAX_BRIGHTNESS,
            }),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn descriptor(&self) -> &'static DeviceDescriptor {
        self.descriptor
    }

    pub fn info(&self) -> &TransportDeviceInfo {
        &self.info
    }

    /// Stable identity: hardware serial, or the HID path for devices without one
    pub fn serial(&self) -> &str {
        self.info.identity()
    }

    pub fn is_open(&self) -> bool {
        self.wire.lock().is_some()
    }

    /// Drop the OS handle; later writes fail with `Disconnected`
    pub fn close(&self) {
        if self.wire.lock().take().is_some() {
            debug!("Closed {}", self.serial());
        }
    }

    fn with_wire<T>(
        &self,
        f: impl FnOnce(&mut dyn ReportWire) -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        let mut guard = self.wire.lock();
        let wire = guard.as_mut().ok_or(TransportError::Disconnected)?;
        f(wire.as_mut())
    }

    fn send_feature(&self, command: FeatureCommand) -> Result<(), TransportError> {
        let report = build_feature_report(
            self.descriptor.commands,
            command,
            self.descriptor.feature_report_size,
        );
        self.with_wire(|w| w.send_feature_report(&report))
    }

    pub fn firmware_version(&self) -> Result<String, TransportError> {
        let mut report = build_feature_report(
            self.descriptor.commands,
            FeatureCommand::FirmwareVersion,
            self.descriptor.feature_report_size,
        );
        self.with_wire(|w| w.get_feature_report(&mut report))?;
        Ok(protocol::parse_firmware_version(
            &report,
            self.descriptor.firmware_offset,
        ))
    }

    /// Clear all keys and show the standby logo
    pub fn reset(&self) -> Result<(), TransportError> {
        if !self.descriptor.has_screen() {
            return Ok(());
        }
        self.send_feature(FeatureCommand::Reset)
    }

    /// Set backlight brightness (0..=100, clamped)
    ///
    /// While asleep a non-zero value is only remembered for the wake-up.
    pub fn set_brightness(&self, percent: u8) -> Result<(), TransportError> {
        if !self.descriptor.has_screen() {
            return Ok(());
        }
        let percent = percent.min(protocol::MAX_BRIGHTNESS);
        {
            let mut power = self.power.lock();
            power.brightness = percent;
            if power.asleep && percent > 0 {
                power.pre_sleep_brightness = percent;
                return Ok(());
            }
        }
        self.send_feature(FeatureCommand::Brightness(percent))
    }

    pub fn brightness(&self) -> u8 {
        self.power.lock().brightness
    }

    /// Ramp brightness from `start` to `end` over `duration` (blocking)
    pub fn fade(&self, start: u8, end: u8, duration: Duration) -> Result<(), TransportError> {
        if !self.descriptor.has_screen() {
            return Ok(());
        }
        let steps = (duration.as_millis() as u64 / timing::FADE_STEP_MS).max(1);
        for step in 1..=steps {
            let value = start as f64 + (end as f64 - start as f64) * step as f64 / steps as f64;
            self.send_feature(FeatureCommand::Brightness(value.round() as u8))?;
            if step < steps {
                std::thread::sleep(Duration::from_millis(timing::FADE_STEP_MS));
            }
        }
        self.power.lock().brightness = end;
        Ok(())
    }

    /// Fade the backlight out, remembering the current brightness
    pub fn sleep(&self, fade: Duration) -> Result<(), TransportError> {
        let current = {
            let mut power = self.power.lock();
            if power.asleep {
                return Ok(());
            }
            power.pre_sleep_brightness = power.brightness;
            power.brightness
        };
        self.fade(current, 0, fade)?;
        self.power.lock().asleep = true;
        Ok(())
    }

    /// Restore the pre-sleep brightness. Returns whether the device was asleep.
    pub fn wake(&self, fade: Duration) -> Result<bool, TransportError> {
        let target = {
            let mut power = self.power.lock();
            if !power.asleep {
                return Ok(false);
            }
            power.asleep = false;
            power.pre_sleep_brightness
        };
        self.fade(0, target, fade)?;
        Ok(true)
    }

    pub fn is_asleep(&self) -> bool {
        self.power.lock().asleep
    }

    /// Record user activity (drives idle sleep)
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Push a key image; `index` is the physical (row-major, left-to-right) index
    pub fn write_key_image(&self, index: u8, img: &RgbaImage) -> Result<(), TransportError> {
        let Some(screen) = self.descriptor.screen else {
            return Ok(());
        };
        let max = self.descriptor.key_count();
        if index as usize >= max {
            return Err(TransportError::OutOfRange {
                index: index as usize,
                max,
            });
        }
        let Some(data) = encode_bitmap(img, self.descriptor)? else {
            return Ok(());
        };
        let key = self.descriptor.translate_key(index);
        let reports = frame_reports(
            &data,
            screen.image_page_size,
            screen.header.size(),
            |page, len, last| screen.header.build(page, key, len, last),
        );
        self.write_reports(&reports)
            .map_err(|e| annotate(e, reports.len(), data.len()))
    }

    /// Push one LCD strip segment
    pub fn write_lcd_image(&self, segment: u8, img: &RgbaImage) -> Result<(), TransportError> {
        let (Some(lcd), Some(screen)) = (self.descriptor.lcd, self.descriptor.screen) else {
            return Ok(());
        };
        if segment >= lcd.segments {
            return Err(TransportError::OutOfRange {
                index: segment as usize,
                max: lcd.segments as usize,
            });
        }
        let data = encode_lcd(img, &lcd)?;
        let region = LcdRegion {
            x: segment as u16 * lcd.width as u16,
            y: 0,
            width: lcd.width as u16,
            height: lcd.height as u16,
        };
        let reports = frame_reports(
            &data,
            screen.image_page_size,
            LCD_HEADER_SIZE,
            |page, len, last| build_lcd_page_header(region, page, len, last),
        );
        self.write_reports(&reports)
            .map_err(|e| annotate(e, reports.len(), data.len()))
    }

    /// Paint every key black
    pub fn clear(&self) -> Result<(), TransportError> {
        let pixels = self.descriptor.pixels();
        if pixels == 0 {
            return Ok(());
        }
        let black = RgbaImage::from_pixel(pixels, pixels, Rgba([0, 0, 0, 255]));
        for index in 0..self.descriptor.key_count() {
            self.write_key_image(index as u8, &black)?;
        }
        Ok(())
    }

    /// Write a full transfer while holding the wire lock
    fn write_reports(&self, reports: &[Vec<u8>]) -> Result<(), TransportError> {
        self.with_wire(|wire| {
            for report in reports {
                wire.write_report(report)?;
            }
            Ok(())
        })
    }
}

fn annotate(e: TransportError, pages: usize, bytes: usize) -> TransportError {
    match e {
        TransportError::HidError(msg) => TransportError::HidError(format!(
            "cannot write image ({} pages, {} bytes): {}",
            pages, bytes, msg
        )),
        other => other,
    }
}
