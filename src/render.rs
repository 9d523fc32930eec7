//! Bitmap composition for keys and LCD segments
//!
//! Backgrounds are a loaded icon or plain black. Text is drawn with the
//! embedded-graphics ASCII mono fonts: the largest face whose wrapped lines fit
//! the panel is chosen unless the configuration asks for a size.

use std::convert::Infallible;
use std::io::Cursor;
use std::path::Path;

use base64::Engine;
use embedded_graphics::mono_font::ascii::{
    FONT_10X20, FONT_4X6, FONT_5X8, FONT_6X10, FONT_7X13, FONT_8X13, FONT_9X15, FONT_9X18,
};
use embedded_graphics::mono_font::{MonoFont, MonoTextStyle};
use embedded_graphics::pixelcolor::Rgb888;
use embedded_graphics::prelude::*;
use embedded_graphics::text::{Alignment, Baseline, Text, TextStyleBuilder};
use image::imageops::FilterType;
use image::{Rgba, RgbaImage};

use crate::error::DaemonError;

/// Default LCD segment canvas
pub const LCD_CANVAS: (u32, u32) = (200, 100);

/// Horizontal padding on each side of a text block
const TEXT_MARGIN: u32 = 5;

/// Largest first
const FONTS: [&MonoFont<'static>; 8] = [
    &FONT_10X20,
    &FONT_9X18,
    &FONT_9X15,
    &FONT_8X13,
    &FONT_7X13,
    &FONT_6X10,
    &FONT_5X8,
    &FONT_4X6,
];

/// Vertical placement of the text block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextAlignment {
    Top,
    #[default]
    Center,
    Bottom,
}

impl TextAlignment {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "TOP" => TextAlignment::Top,
            "BOTTOM" => TextAlignment::Bottom,
            _ => TextAlignment::Center,
        }
    }
}

/// Text overlay request
#[derive(Debug, Clone, Default)]
pub struct Overlay<'a> {
    pub text: &'a str,
    /// Requested glyph height in pixels; `None` auto-fits
    pub size: Option<u32>,
    pub alignment: TextAlignment,
}

impl<'a> Overlay<'a> {
    pub fn new(text: &'a str, size: Option<u32>, alignment: &str) -> Self {
        Self {
            text,
            size: size.filter(|&s| s > 0),
            alignment: TextAlignment::parse(alignment),
        }
    }
}

struct Canvas<'a>(&'a mut RgbaImage);

impl OriginDimensions for Canvas<'_> {
    fn size(&self) -> Size {
        Size::new(self.0.width(), self.0.height())
    }
}

impl DrawTarget for Canvas<'_> {
    type Color = Rgb888;
    type Error = Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        let (w, h) = self.0.dimensions();
        for Pixel(coord, color) in pixels {
            if coord.x >= 0 && coord.y >= 0 && (coord.x as u32) < w && (coord.y as u32) < h {
                self.0.put_pixel(
                    coord.x as u32,
                    coord.y as u32,
                    Rgba([color.r(), color.g(), color.b(), 255]),
                );
            }
        }
        Ok(())
    }
}

pub fn black(width: u32, height: u32) -> RgbaImage {
    RgbaImage::from_pixel(width, height, Rgba([0, 0, 0, 255]))
}

/// Resize to exactly `width`x`height` unless it already matches
pub fn fit(img: RgbaImage, width: u32, height: u32) -> RgbaImage {
    if img.dimensions() == (width, height) {
        img
    } else {
        image::imageops::resize(&img, width, height, FilterType::Triangle)
    }
}

pub fn load_icon(path: &Path, width: u32, height: u32) -> Result<RgbaImage, DaemonError> {
    let img = image::open(path)?.to_rgba8();
    Ok(fit(img, width, height))
}

fn advance(font: &MonoFont<'_>) -> u32 {
    font.character_size.width + font.character_spacing
}

/// Greedy word wrap to `max_chars` columns, hard-splitting long words
fn wrap(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut lines = Vec::new();
    for raw in text.split('\n') {
        let mut line = String::new();
        for word in raw.split_whitespace() {
            let mut word: Vec<char> = word.chars().collect();
            while word.len() > max_chars {
                if !line.is_empty() {
                    lines.push(std::mem::take(&mut line));
                }
                lines.push(word.drain(..max_chars).collect());
            }
            let word: String = word.into_iter().collect();
            if word.is_empty() {
                continue;
            }
            let needed = if line.is_empty() {
                word.len()
            } else {
                line.chars().count() + 1 + word.len()
            };
            if needed > max_chars {
                lines.push(std::mem::take(&mut line));
            }
            if !line.is_empty() {
                line.push(' ');
            }
            line.push_str(&word);
        }
        lines.push(line);
    }
    lines
}

/// Font and wrapped lines for `text` on a `width`x`height` panel
fn layout(
    text: &str,
    width: u32,
    height: u32,
    size: Option<u32>,
) -> (&'static MonoFont<'static>, Vec<String>) {
    let usable = width.saturating_sub(2 * TEXT_MARGIN).max(1);
    let candidates: Vec<&'static MonoFont<'static>> = match size {
        Some(size) => FONTS
            .iter()
            .copied()
            .filter(|f| f.character_size.height <= size)
            .collect(),
        None => FONTS.to_vec(),
    };

    let longest_word = text
        .split_whitespace()
        .map(|w| w.chars().count())
        .max()
        .unwrap_or(0);

    // first pass keeps words whole, second allows splitting them
    for whole_words in [true, false] {
        for font in &candidates {
            let max_chars = (usable / advance(font)) as usize;
            if max_chars == 0 || (whole_words && longest_word > max_chars) {
                continue;
            }
            let lines = wrap(text, max_chars);
            let block = lines.len() as u32 * font.character_size.height;
            // a requested size is honoured even if the block overflows vertically
            if size.is_some() || block <= height {
                return (font, lines);
            }
        }
    }

    let font = FONTS[FONTS.len() - 1];
    let max_chars = (usable / advance(font)).max(1) as usize;
    (font, wrap(text, max_chars))
}

/// Draw white text over `img`
pub fn draw_text(img: &mut RgbaImage, overlay: &Overlay<'_>) {
    if overlay.text.is_empty() {
        return;
    }
    let (width, height) = img.dimensions();
    let (font, lines) = layout(overlay.text, width, height, overlay.size);
    let block = lines.len() as u32 * font.character_size.height;
    let top = match overlay.alignment {
        TextAlignment::Top => TEXT_MARGIN as i32,
        TextAlignment::Center => (height as i32 - block as i32) / 2,
        TextAlignment::Bottom => height as i32 - TEXT_MARGIN as i32 - block as i32,
    };

    let character_style = MonoTextStyle::new(font, Rgb888::WHITE);
    let text_style = TextStyleBuilder::new()
        .alignment(Alignment::Center)
        .baseline(Baseline::Top)
        .build();
    let joined = lines.join("\n");
    let mut canvas = Canvas(img);
    let _ = Text::with_text_style(
        &joined,
        Point::new(width as i32 / 2, top),
        character_style,
        text_style,
    )
    .draw(&mut canvas);
}

/// Static bitmap for a position without an icon handler
pub fn compose(
    icon: &str,
    overlay: &Overlay<'_>,
    width: u32,
    height: u32,
) -> Result<RgbaImage, DaemonError> {
    let mut img = if icon.is_empty() {
        black(width, height)
    } else {
        load_icon(Path::new(icon), width, height)?
    };
    draw_text(&mut img, overlay);
    Ok(img)
}

/// `data:image/png;base64,...` for previews
pub fn png_data_url(img: &RgbaImage) -> Result<String, DaemonError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(&buf)
    ))
}
