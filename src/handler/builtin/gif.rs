// Animated GIF icons
// Decodes every frame up front, scaled to the panel, then loops them

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use image::{AnimationDecoder, RgbaImage};
use tracing::warn;

use super::{emit, Producer, Surface};
use crate::error::DaemonError;
use crate::handler::{DeckInfo, Field, FieldType, FrameSink, HandlerConfig, IconHandler, Module};
use crate::render::{self, Overlay};

/// Delay used when a frame does not specify one
const DEFAULT_DELAY_MS: u64 = 100;

/// A single decoded frame
#[derive(Debug, Clone)]
pub struct GifFrame {
    pub image: RgbaImage,
    pub delay_ms: u64,
}

/// Frames of a loaded GIF, already scaled to the panel
#[derive(Debug)]
pub struct GifAnimation {
    pub frames: Vec<GifFrame>,
}

/// Load a GIF file, scaling each frame to `size`
pub fn load_gif<P: AsRef<Path>>(path: P, size: (u32, u32)) -> Result<GifAnimation, DaemonError> {
    let file = File::open(path.as_ref())?;
    let reader = BufReader::new(file);

    let decoder = image::codecs::gif::GifDecoder::new(reader)?;

    let mut frames = Vec::new();
    for frame_result in decoder.into_frames() {
        let frame = frame_result?;
        let (numer, denom) = frame.delay().numer_denom_ms();
        let delay_ms = (numer / denom.max(1)) as u64;
        let delay_ms = if delay_ms == 0 { DEFAULT_DELAY_MS } else { delay_ms };

        let image = render::fit(frame.into_buffer(), size.0, size.1);
        frames.push(GifFrame { image, delay_ms });
    }

    Ok(GifAnimation { frames })
}

/// Load a static image (PNG, etc.) as a single frame
pub fn load_image<P: AsRef<Path>>(path: P, size: (u32, u32)) -> Result<GifAnimation, DaemonError> {
    let img = image::open(path.as_ref())?.to_rgba8();
    Ok(GifAnimation {
        frames: vec![GifFrame {
            image: render::fit(img, size.0, size.1),
            delay_ms: DEFAULT_DELAY_MS,
        }],
    })
}

fn load_any(path: &Path, size: (u32, u32)) -> Result<GifAnimation, DaemonError> {
    let is_gif = path
        .extension()
        .map(|e| e.eq_ignore_ascii_case("gif"))
        .unwrap_or(false);
    if is_gif {
        load_gif(path, size)
    } else {
        load_image(path, size)
    }
}

pub struct GifIcon {
    surface: Surface,
    producer: Producer,
}

impl IconHandler for GifIcon {
    fn start(&self, config: HandlerConfig, info: DeckInfo, sink: FrameSink) {
        let Some(path) = config.str_field("icon").map(str::to_string) else {
            warn!(handler = "Gif", "No icon configured");
            return;
        };
        let size = self.surface.size(&info);
        self.producer.spawn("Gif", move |token| async move {
            let loaded =
                tokio::task::spawn_blocking(move || load_any(Path::new(&path), size)).await;
            let mut animation = match loaded {
                Ok(Ok(animation)) if !animation.frames.is_empty() => animation,
                Ok(Ok(_)) => return,
                Ok(Err(e)) => {
                    warn!(handler = "Gif", "Failed to load animation: {}", e);
                    return;
                }
                Err(e) => {
                    warn!(handler = "Gif", "Animation loader failed: {}", e);
                    return;
                }
            };

            let overlay = Overlay::new(
                config.str_field("text").unwrap_or_default(),
                config.u32_field("text_size"),
                config.str_field("text_alignment").unwrap_or_default(),
            );
            for frame in &mut animation.frames {
                render::draw_text(&mut frame.image, &overlay);
            }

            // a single frame is drawn once
            let animated = animation.frames.len() > 1;
            loop {
                for frame in &animation.frames {
                    if !emit(&token, &sink, frame.image.clone()) {
                        return;
                    }
                    if !animated {
                        return;
                    }
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_millis(frame.delay_ms)) => {}
                    }
                }
            }
        });
    }

    fn is_running(&self) -> bool {
        self.producer.is_running()
    }

    fn set_running(&self, running: bool) {
        self.producer.set_running(running);
    }

    fn stop(&self) {
        self.producer.stop();
    }
}

fn new_icon() -> Arc<dyn IconHandler> {
    Arc::new(GifIcon {
        surface: Surface::Key,
        producer: Producer::default(),
    })
}

fn new_lcd() -> Arc<dyn IconHandler> {
    Arc::new(GifIcon {
        surface: Surface::Lcd,
        producer: Producer::default(),
    })
}

fn fields() -> Vec<Field> {
    vec![
        Field::new("icon", "Icon", FieldType::File).with_file_types(&[".gif"]),
        Field::new("text", "Text", FieldType::Text),
        Field::new("text_size", "Text Size", FieldType::Number),
        Field::new("text_alignment", "Text Alignment", FieldType::TextAlignment),
    ]
}

pub fn module() -> Module {
    Module {
        new_icon: Some(new_icon),
        new_lcd: Some(new_lcd),
        icon_fields: fields(),
        lcd_fields: fields(),
        ..Module::new("Gif")
    }
}
