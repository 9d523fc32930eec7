//! Input report decoding and the blocking reader loop
//!
//! A dedicated OS thread blocks on the input handle and turns every raw
//! report into zero or more [`InputEvent`]s. The decoder keeps the previous
//! key-state block so that basic hardware (which reports the full key state
//! on every change) yields exactly one press and one release per physical
//! transition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use serde::Serialize;
use tracing::{debug, warn};

use crate::device_registry::{DeviceDescriptor, InputProtocol, KeyIndexMap};
use crate::error::TransportError;
use crate::protocol::timing;

/// Plus report types (byte 1)
pub mod report {
    pub const KEYS: u8 = 0x00;
    pub const TOUCH: u8 = 0x02;
    pub const KNOBS: u8 = 0x03;
}

/// Touch strip gesture codes (byte 4 of a touch report)
pub mod gesture {
    pub const SHORT_TAP: u8 = 0x01;
    pub const LONG_TAP: u8 = 0x02;
    pub const SWIPE: u8 = 0x03;
}

/// Width of one touch strip segment in touch coordinates
pub const TOUCH_SEGMENT_WIDTH: u16 = 200;
/// Largest valid touch x coordinate
pub const TOUCH_MAX_X: u16 = 800;

/// Decoded physical input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InputEvent {
    KeyPress { index: u8 },
    KeyRelease { index: u8 },
    KnobPress { index: u8 },
    KnobCw { index: u8, notches: u8 },
    KnobCcw { index: u8, notches: u8 },
    ShortTap { segment: u8 },
    LongTap { segment: u8 },
    Swipe { x: u16, y: u16, end_x: u16, end_y: u16 },
}

impl InputEvent {
    pub fn is_key(&self) -> bool {
        matches!(self, InputEvent::KeyPress { .. } | InputEvent::KeyRelease { .. })
    }

    /// Position the event refers to (key, knob or strip segment)
    pub fn index(&self) -> Option<u8> {
        match *self {
            InputEvent::KeyPress { index }
            | InputEvent::KeyRelease { index }
            | InputEvent::KnobPress { index }
            | InputEvent::KnobCw { index, .. }
            | InputEvent::KnobCcw { index, .. } => Some(index),
            InputEvent::ShortTap { segment } | InputEvent::LongTap { segment } => Some(segment),
            InputEvent::Swipe { .. } => None,
        }
    }
}

/// Per-variant input state machine
#[derive(Debug, Clone)]
pub enum InputDecoder {
    Basic {
        key_state: Vec<u8>,
        offset: usize,
        columns: u8,
        map: KeyIndexMap,
    },
    Plus {
        keys: usize,
        knobs: usize,
        offset: usize,
        columns: u8,
        map: KeyIndexMap,
    },
}

impl InputDecoder {
    pub fn for_descriptor(descriptor: &DeviceDescriptor) -> Self {
        match descriptor.input {
            InputProtocol::Basic => InputDecoder::Basic {
                key_state: vec![0; descriptor.key_count()],
                offset: descriptor.key_state_offset,
                columns: descriptor.columns,
                map: descriptor.key_index,
            },
            InputProtocol::Plus => InputDecoder::Plus {
                keys: descriptor.key_count(),
                knobs: descriptor.knobs as usize,
                offset: descriptor.key_state_offset,
                columns: descriptor.columns,
                map: descriptor.key_index,
            },
        }
    }

    /// Bytes to request from the device per read
    pub fn report_len(&self) -> usize {
        match self {
            InputDecoder::Basic {
                key_state, offset, ..
            } => offset + key_state.len(),
            // touch reports carry two coordinate pairs past byte 6
            InputDecoder::Plus { keys, offset, .. } => (offset + keys + 3).max(14),
        }
    }

    /// Decode one raw report
    pub fn decode(&mut self, report: &[u8]) -> Vec<InputEvent> {
        match self {
            InputDecoder::Basic {
                key_state,
                offset,
                columns,
                map,
            } => decode_basic(report, key_state, *offset, *columns, *map),
            InputDecoder::Plus {
                keys,
                knobs,
                offset,
                columns,
                map,
            } => decode_plus(report, *keys, *knobs, *offset, *columns, *map),
        }
    }
}

fn decode_basic(
    report: &[u8],
    key_state: &mut [u8],
    offset: usize,
    columns: u8,
    map: KeyIndexMap,
) -> Vec<InputEvent> {
    let mut events = Vec::new();
    let block = report.get(offset..).unwrap_or_default();
    for (i, (&now, before)) in block.iter().zip(key_state.iter_mut()).enumerate() {
        let pressed = now == 0x01;
        let was_pressed = *before == 0x01;
        if pressed == was_pressed {
            continue;
        }
        *before = if pressed { 0x01 } else { 0x00 };
        let index = map.translate(i as u8, columns);
        events.push(if pressed {
            InputEvent::KeyPress { index }
        } else {
            InputEvent::KeyRelease { index }
        });
    }
    events
}

fn read_u16(report: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_le_bytes([*report.get(at)?, *report.get(at + 1)?]))
}

fn decode_plus(
    report: &[u8],
    keys: usize,
    knobs: usize,
    offset: usize,
    columns: u8,
    map: KeyIndexMap,
) -> Vec<InputEvent> {
    let mut events = Vec::new();
    let Some(&kind) = report.get(1) else {
        return events;
    };

    match kind {
        // hardware sends no release for Plus keys
        report::KEYS => {
            let block = report.get(offset..).unwrap_or_default();
            for (i, &b) in block.iter().take(keys).enumerate() {
                if b == 0x01 {
                    events.push(InputEvent::KeyPress {
                        index: map.translate(i as u8, columns),
                    });
                }
            }
        }
        report::TOUCH => {
            let (Some(x), Some(y)) = (read_u16(report, 6), read_u16(report, 8)) else {
                return events;
            };
            if x > TOUCH_MAX_X {
                debug!("Ignoring touch at invalid x position {}", x);
                return events;
            }
            // the strip's right edge belongs to the last segment
            let segment = (x / TOUCH_SEGMENT_WIDTH).min(TOUCH_MAX_X / TOUCH_SEGMENT_WIDTH - 1) as u8;
            match report.get(4).copied() {
                Some(gesture::SHORT_TAP) => events.push(InputEvent::ShortTap { segment }),
                Some(gesture::LONG_TAP) => events.push(InputEvent::LongTap { segment }),
                Some(gesture::SWIPE) => {
                    if let (Some(end_x), Some(end_y)) = (read_u16(report, 10), read_u16(report, 12)) {
                        events.push(InputEvent::Swipe { x, y, end_x, end_y });
                    }
                }
                _ => {}
            }
        }
        report::KNOBS => {
            let is_press = report.get(4) == Some(&0x00);
            for (i, &b) in report.iter().skip(5).take(knobs).enumerate() {
                let index = i as u8;
                if is_press {
                    if b == 0x01 {
                        events.push(InputEvent::KnobPress { index });
                    }
                } else if b != 0x00 {
                    let delta = b as i8;
                    let notches = delta.unsigned_abs();
                    events.push(if delta < 0 {
                        InputEvent::KnobCcw { index, notches }
                    } else {
                        InputEvent::KnobCw { index, notches }
                    });
                }
            }
        }
        other => debug!("Ignoring unknown input report type 0x{:02X}", other),
    }
    events
}

/// Read side of a device handle
pub trait ReportReader: Send {
    /// Read one input report, returning 0 on timeout
    fn read_report(&mut self, buf: &mut [u8], timeout_ms: i32) -> Result<usize, TransportError>;
}

impl ReportReader for hidapi::HidDevice {
    fn read_report(&mut self, buf: &mut [u8], timeout_ms: i32) -> Result<usize, TransportError> {
        Ok(self.read_timeout(buf, timeout_ms)?)
    }
}

/// Blocking input loop
///
/// Returns `Ok(())` when `shutdown` is raised and the read error otherwise;
/// a failed read always ends the loop since it means the device is gone.
pub fn run_input_reader_loop<F>(
    reader: &mut dyn ReportReader,
    decoder: &mut InputDecoder,
    shutdown: &AtomicBool,
    name: &str,
    mut on_event: F,
) -> Result<(), TransportError>
where
    F: FnMut(InputEvent),
{
    debug!("{} input reader thread started", name);
    let mut buf = vec![0u8; decoder.report_len()];

    while !shutdown.load(Ordering::Relaxed) {
        match reader.read_report(&mut buf, timing::READ_TIMEOUT_MS) {
            Ok(len) if len > 0 => {
                debug!(
                    "{} input reader got {} bytes: {:02X?}",
                    name,
                    len,
                    &buf[..len.min(16)]
                );
                for event in decoder.decode(&buf[..len]) {
                    on_event(event);
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!("{} input reader error: {}", name, e);
                return Err(e);
            }
        }
    }

    debug!("{} input reader thread exiting", name);
    Ok(())
}

/// Spawn the input loop on its own named thread
///
/// `on_exit` receives the error that ended the loop, or `None` on shutdown.
pub fn spawn_input_reader<F, X>(
    mut reader: Box<dyn ReportReader>,
    mut decoder: InputDecoder,
    shutdown: Arc<AtomicBool>,
    name: String,
    on_event: F,
    on_exit: X,
) -> std::io::Result<JoinHandle<()>>
where
    F: FnMut(InputEvent) + Send + 'static,
    X: FnOnce(Option<TransportError>) + Send + 'static,
{
    std::thread::Builder::new()
        .name(format!("{name}-input"))
        .spawn(move || {
            let result =
                run_input_reader_loop(reader.as_mut(), &mut decoder, &shutdown, &name, on_event);
            on_exit(result.err());
        })
}
