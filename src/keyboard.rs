//! Virtual keyboard device using evdev/uinput
//!
//! Backs the `key_hold` action: a configured key goes down when the deck key
//! is pressed and comes back up on release or when the active variant
//! changes underneath it.

use evdev::{
    uinput::{VirtualDevice, VirtualDeviceBuilder},
    AttributeSet, EventType, InputEvent, Key,
};
use parking_lot::Mutex;
use thiserror::Error;

/// Name shown in `evtest` and `libinput list-devices`
pub const DEVICE_NAME: &str = "deckd";

/// Highest keycode registered on the device (KEY_MICMUTE)
const MAX_KEYCODE: u16 = 248;

/// Errors from virtual keyboard operations
#[derive(Debug, Error)]
pub enum KeyboardError {
    #[error("Failed to create virtual device: {0}")]
    CreateDevice(#[source] std::io::Error),
    #[error("Failed to emit event: {0}")]
    EmitEvent(#[source] std::io::Error),
    #[error("Keycode {0} is not supported")]
    UnsupportedKey(u16),
}

/// Presses and releases held keys
pub trait KeyHolder: Send + Sync {
    fn key_down(&self, code: u16) -> Result<(), KeyboardError>;
    fn key_up(&self, code: u16) -> Result<(), KeyboardError>;
}

/// uinput keyboard
pub struct VirtualKeyboard {
    device: Mutex<VirtualDevice>,
}

impl VirtualKeyboard {
    pub fn new(name: &str) -> Result<Self, KeyboardError> {
        let mut keys = AttributeSet::<Key>::new();
        for code in 1..=MAX_KEYCODE {
            keys.insert(Key::new(code));
        }

        let device = VirtualDeviceBuilder::new()
            .map_err(KeyboardError::CreateDevice)?
            .name(name)
            .with_keys(&keys)
            .map_err(KeyboardError::CreateDevice)?
            .build()
            .map_err(KeyboardError::CreateDevice)?;

        Ok(Self {
            device: Mutex::new(device),
        })
    }

    fn emit(&self, code: u16, value: i32) -> Result<(), KeyboardError> {
        if code == 0 || code > MAX_KEYCODE {
            return Err(KeyboardError::UnsupportedKey(code));
        }
        let event = InputEvent::new_now(EventType::KEY, code, value);
        self.device
            .lock()
            .emit(&[event])
            .map_err(KeyboardError::EmitEvent)
    }
}

impl KeyHolder for VirtualKeyboard {
    fn key_down(&self, code: u16) -> Result<(), KeyboardError> {
        self.emit(code, 1)
    }

    fn key_up(&self, code: u16) -> Result<(), KeyboardError> {
        self.emit(code, 0)
    }
}
