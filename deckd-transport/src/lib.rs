//! Transport layer for Stream Deck style macro keypads
//!
//! - Device descriptor table keyed by USB vendor/product ID
//! - Feature report and image page framing per hardware revision
//! - Bitmap orientation and encoding (BMP for first generation, JPEG after)
//! - Input report decoding (keys, knobs, touch strip)
//! - A write-serialized HID handle and the blocking input reader

pub mod codec;
pub mod device_registry;
pub mod error;
pub mod event_parser;
pub mod protocol;
pub mod types;

mod discovery;
mod hid_wired;

pub use codec::{check_dimensions, encode_bitmap, encode_lcd};
pub use device_registry::{find_descriptor, is_supported, DeviceDescriptor, Model, VENDOR_ID};
pub use discovery::HidDiscovery;
pub use error::TransportError;
pub use event_parser::{
    run_input_reader_loop, spawn_input_reader, InputDecoder, InputEvent, ReportReader,
};
pub use hid_wired::{Deck, ReportWire};
pub use protocol::{build_feature_report, build_image_page_header, FeatureCommand, ImagePages};
pub use types::{DiscoveredDeck, TransportDeviceInfo};
