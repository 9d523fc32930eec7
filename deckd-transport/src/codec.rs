//! Bitmap encoding for key and LCD images
//!
//! Images must already have the panel's exact size; this layer orients and
//! encodes, it never resizes.

use image::codecs::jpeg::JpegEncoder;
use image::{imageops, DynamicImage, RgbaImage};

use crate::device_registry::{DeviceDescriptor, ImageFormat, LcdSpec, Orientation};
use crate::error::TransportError;

/// JPEG quality used for every compressed image
pub const JPEG_QUALITY: u8 = 100;

/// BMP file header plus BITMAPINFOHEADER as expected by first generation
/// firmware (72x72, 24 bpp). The firmware ignores the size fields, so the
/// same header is sent for the 80x80 Mini.
pub const BMP_HEADER: [u8; 54] = [
    0x42, 0x4d, 0xf6, 0x3c, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x36, 0x00, 0x00, 0x00, 0x28, 0x00,
    0x00, 0x00, 0x48, 0x00, 0x00, 0x00, 0x48, 0x00, 0x00, 0x00, 0x01, 0x00, 0x18, 0x00, 0x00, 0x00,
    0x00, 0x00, 0xc0, 0x3c, 0x00, 0x00, 0xc4, 0x0e, 0x00, 0x00, 0xc4, 0x0e, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

impl Orientation {
    pub fn apply(self, img: &RgbaImage) -> RgbaImage {
        match self {
            Orientation::Identity => img.clone(),
            Orientation::FlipHorizontal => imageops::flip_horizontal(img),
            Orientation::FlipBoth => imageops::rotate180(img),
            Orientation::RotateCounterClockwise => imageops::rotate270(img),
        }
    }
}

impl ImageFormat {
    pub fn encode(self, img: &RgbaImage) -> Result<Vec<u8>, TransportError> {
        match self {
            ImageFormat::Bmp => Ok(to_bmp(img)),
            ImageFormat::Jpeg => to_jpeg(img),
        }
    }
}

/// Raw BGR rows behind the fixed header
fn to_bmp(img: &RgbaImage) -> Vec<u8> {
    let mut buf = Vec::with_capacity(BMP_HEADER.len() + (img.width() * img.height() * 3) as usize);
    buf.extend_from_slice(&BMP_HEADER);
    for pixel in img.pixels() {
        let [r, g, b, _] = pixel.0;
        buf.extend_from_slice(&[b, g, r]);
    }
    buf
}

fn to_jpeg(img: &RgbaImage) -> Result<Vec<u8>, TransportError> {
    let rgb = DynamicImage::ImageRgba8(img.clone()).to_rgb8();
    let mut buf = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY);
    encoder.encode_image(&rgb)?;
    Ok(buf)
}

/// Reject images that do not match the panel exactly
pub fn check_dimensions(img: &RgbaImage, width: u32, height: u32) -> Result<(), TransportError> {
    if img.width() != width || img.height() != height {
        return Err(TransportError::WrongDimensions {
            expected_w: width,
            expected_h: height,
            actual_w: img.width(),
            actual_h: img.height(),
        });
    }
    Ok(())
}

/// Orient and encode a key image for `descriptor`
///
/// Screenless models yield `Ok(None)`.
pub fn encode_bitmap(
    img: &RgbaImage,
    descriptor: &DeviceDescriptor,
) -> Result<Option<Vec<u8>>, TransportError> {
    let Some(screen) = descriptor.screen else {
        return Ok(None);
    };
    check_dimensions(img, screen.pixels, screen.pixels)?;
    let oriented = screen.orientation.apply(img);
    screen.format.encode(&oriented).map(Some)
}

/// Encode one LCD strip segment (always JPEG, never oriented)
pub fn encode_lcd(img: &RgbaImage, lcd: &LcdSpec) -> Result<Vec<u8>, TransportError> {
    check_dimensions(img, lcd.width, lcd.height)?;
    to_jpeg(img)
}
