//! Device registry - per-model capability records selected by USB ID
//!
//! Every supported keypad is described by one static [`DeviceDescriptor`].
//! The descriptor is picked once at enumeration and never mutated; all
//! model-specific behaviour (header layout, orientation, pixel format,
//! input report shape) hangs off the small strategy enums it carries.

use serde::Serialize;

/// Elgato vendor ID
pub const VENDOR_ID: u16 = 0x0fd9;

/// Known product IDs
pub mod pid {
    pub const ORIGINAL: u16 = 0x0060;
    pub const MINI: u16 = 0x0063;
    pub const XL: u16 = 0x006c;
    pub const V2: u16 = 0x006d;
    pub const MK2: u16 = 0x0080;
    pub const PLUS: u16 = 0x0084;
    pub const PEDAL: u16 = 0x0086;
    pub const MINI_MK2: u16 = 0x0090;
}

/// Hardware family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Model {
    Original,
    Mini,
    V2,
    Xl,
    Pedal,
    Plus,
}

/// How a physical key index maps onto the index the firmware expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyIndexMap {
    Identity,
    /// First generation hardware numbers keys right-to-left
    RightToLeft,
}

impl KeyIndexMap {
    /// Translate between physical and firmware index (the mapping is its own inverse)
    pub fn translate(self, index: u8, columns: u8) -> u8 {
        match self {
            KeyIndexMap::Identity => index,
            KeyIndexMap::RightToLeft => {
                let col = index % columns;
                (index - col) + (columns - 1) - col
            }
        }
    }
}

/// Transform applied to a bitmap before encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Identity,
    FlipHorizontal,
    FlipBoth,
    RotateCounterClockwise,
}

/// Pixel format of key images on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Bmp,
    Jpeg,
}

/// Image page header layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageHeader {
    Rev1,
    Mini,
    Rev2,
}

impl PageHeader {
    pub const fn size(self) -> usize {
        match self {
            PageHeader::Rev1 | PageHeader::Mini => 16,
            PageHeader::Rev2 => 8,
        }
    }
}

/// Feature report command family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandSet {
    Rev1,
    Rev2,
}

/// Shape of the input reports the device emits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputProtocol {
    /// One key-state block, press and release are both reported
    Basic,
    /// Typed reports: keys, touch strip, knobs
    Plus,
}

/// Key display parameters (absent on screenless hardware)
#[derive(Debug, Clone, Copy)]
pub struct ScreenSpec {
    pub pixels: u32,
    pub image_page_size: usize,
    pub header: PageHeader,
    pub orientation: Orientation,
    pub format: ImageFormat,
}

/// LCD strip parameters
#[derive(Debug, Clone, Copy)]
pub struct LcdSpec {
    pub width: u32,
    pub height: u32,
    pub segments: u8,
}

/// Immutable per-model capability record
#[derive(Debug)]
pub struct DeviceDescriptor {
    pub model: Model,
    pub name: &'static str,
    pub product_ids: &'static [u16],
    pub columns: u8,
    pub rows: u8,
    pub key_index: KeyIndexMap,
    pub commands: CommandSet,
    pub feature_report_size: usize,
    pub firmware_offset: usize,
    pub key_state_offset: usize,
    pub screen: Option<ScreenSpec>,
    pub lcd: Option<LcdSpec>,
    pub knobs: u8,
    pub input: InputProtocol,
}

impl DeviceDescriptor {
    pub fn key_count(&self) -> usize {
        self.columns as usize * self.rows as usize
    }

    /// Edge length of a key image, 0 when the model has no screen
    pub fn pixels(&self) -> u32 {
        self.screen.map(|s| s.pixels).unwrap_or(0)
    }

    pub fn has_screen(&self) -> bool {
        self.screen.is_some()
    }

    pub fn has_lcd(&self) -> bool {
        self.lcd.is_some()
    }

    /// Payload bytes per image page
    pub fn page_payload_size(&self) -> Option<usize> {
        self.screen.map(|s| s.image_page_size - s.header.size())
    }

    pub fn translate_key(&self, index: u8) -> u8 {
        self.key_index.translate(index, self.columns)
    }
}

const REV1_FEATURE: (usize, usize, usize) = (17, 5, 1);
const REV2_FEATURE: (usize, usize, usize) = (32, 6, 4);

const REV2_SCREEN_72: ScreenSpec = ScreenSpec {
    pixels: 72,
    image_page_size: 1024,
    header: PageHeader::Rev2,
    orientation: Orientation::FlipBoth,
    format: ImageFormat::Jpeg,
};

/// All supported models
pub static DESCRIPTORS: &[DeviceDescriptor] = &[
    DeviceDescriptor {
        model: Model::Original,
        name: "Stream Deck",
        product_ids: &[pid::ORIGINAL],
        columns: 5,
        rows: 3,
        key_index: KeyIndexMap::RightToLeft,
        commands: CommandSet::Rev1,
        feature_report_size: REV1_FEATURE.0,
        firmware_offset: REV1_FEATURE.1,
        key_state_offset: REV1_FEATURE.2,
        screen: Some(ScreenSpec {
            pixels: 72,
            image_page_size: 7819,
            header: PageHeader::Rev1,
            orientation: Orientation::FlipHorizontal,
            format: ImageFormat::Bmp,
        }),
        lcd: None,
        knobs: 0,
        input: InputProtocol::Basic,
    },
    DeviceDescriptor {
        model: Model::Mini,
        name: "Stream Deck Mini",
        product_ids: &[pid::MINI, pid::MINI_MK2],
        columns: 3,
        rows: 2,
        key_index: KeyIndexMap::Identity,
        commands: CommandSet::Rev1,
        feature_report_size: REV1_FEATURE.0,
        firmware_offset: REV1_FEATURE.1,
        key_state_offset: REV1_FEATURE.2,
        screen: Some(ScreenSpec {
            pixels: 80,
            image_page_size: 1024,
            header: PageHeader::Mini,
            orientation: Orientation::RotateCounterClockwise,
            format: ImageFormat::Bmp,
        }),
        lcd: None,
        knobs: 0,
        input: InputProtocol::Basic,
    },
    DeviceDescriptor {
        model: Model::V2,
        name: "Stream Deck V2",
        product_ids: &[pid::V2, pid::MK2],
        columns: 5,
        rows: 3,
        key_index: KeyIndexMap::Identity,
        commands: CommandSet::Rev2,
        feature_report_size: REV2_FEATURE.0,
        firmware_offset: REV2_FEATURE.1,
        key_state_offset: REV2_FEATURE.2,
        screen: Some(REV2_SCREEN_72),
        lcd: None,
        knobs: 0,
        input: InputProtocol::Basic,
    },
    DeviceDescriptor {
        model: Model::Xl,
        name: "Stream Deck XL",
        product_ids: &[pid::XL],
        columns: 8,
        rows: 4,
        key_index: KeyIndexMap::Identity,
        commands: CommandSet::Rev2,
        feature_report_size: REV2_FEATURE.0,
        firmware_offset: REV2_FEATURE.1,
        key_state_offset: REV2_FEATURE.2,
        screen: Some(ScreenSpec {
            pixels: 96,
            ..REV2_SCREEN_72
        }),
        lcd: None,
        knobs: 0,
        input: InputProtocol::Basic,
    },
    DeviceDescriptor {
        model: Model::Pedal,
        name: "Stream Deck Pedal",
        product_ids: &[pid::PEDAL],
        columns: 3,
        rows: 1,
        key_index: KeyIndexMap::Identity,
        commands: CommandSet::Rev2,
        feature_report_size: REV2_FEATURE.0,
        firmware_offset: REV2_FEATURE.1,
        key_state_offset: REV2_FEATURE.2,
        screen: None,
        lcd: None,
        knobs: 0,
        input: InputProtocol::Basic,
    },
    DeviceDescriptor {
        model: Model::Plus,
        name: "Stream Deck +",
        product_ids: &[pid::PLUS],
        columns: 4,
        rows: 2,
        key_index: KeyIndexMap::Identity,
        commands: CommandSet::Rev2,
        feature_report_size: REV2_FEATURE.0,
        firmware_offset: REV2_FEATURE.1,
        key_state_offset: REV2_FEATURE.2,
        screen: Some(ScreenSpec {
            pixels: 120,
            orientation: Orientation::Identity,
            ..REV2_SCREEN_72
        }),
        lcd: Some(LcdSpec {
            width: 200,
            height: 100,
            segments: 4,
        }),
        knobs: 4,
        input: InputProtocol::Plus,
    },
];

/// Look up the descriptor for a USB ID. Unknown devices yield `None`.
pub fn find_descriptor(vid: u16, pid: u16) -> Option<&'static DeviceDescriptor> {
    if vid != VENDOR_ID {
        return None;
    }
    DESCRIPTORS.iter().find(|d| d.product_ids.contains(&pid))
}

#[inline]
pub fn is_supported(vid: u16, pid: u16) -> bool {
    find_descriptor(vid, pid).is_some()
}
