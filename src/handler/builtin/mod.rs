//! Built-in handler modules

pub mod counter;
pub mod gif;
pub mod time;

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use image::RgbaImage;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{DeckInfo, Field, FieldType, FrameSink, HandlerConfig};
use crate::render::{self, Overlay, LCD_CANVAS};

#[derive(Default)]
struct ProducerState {
    running: AtomicBool,
    generation: AtomicU64,
    /// Token of the live task, tagged with the generation that spawned it
    token: Mutex<Option<(u64, CancellationToken)>>,
}

impl ProducerState {
    /// Task of `generation` returned; clear the flag unless a newer one took over
    fn finish(&self, generation: u64) {
        let mut token = self.token.lock();
        if matches!(*token, Some((g, _)) if g == generation) {
            *token = None;
            self.running.store(false, Ordering::SeqCst);
        }
    }
}

/// Running flag plus the cancellation token of the current producer task
#[derive(Default)]
pub struct Producer {
    state: Arc<ProducerState>,
}

impl Producer {
    /// Spawn `task` as the new producer, cancelling any previous one
    ///
    /// The running flag drops back to false when the task returns on its own.
    pub fn spawn<F, Fut>(&self, name: &str, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(handler = name, "No async runtime, not starting");
            return;
        };
        let generation = self.state.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let token = CancellationToken::new();
        {
            let mut current = self.state.token.lock();
            if let Some((_, previous)) = current.replace((generation, token.clone())) {
                previous.cancel();
            }
            self.state.running.store(true, Ordering::SeqCst);
        }
        let state = Arc::clone(&self.state);
        let fut = task(token);
        handle.spawn(async move {
            fut.await;
            state.finish(generation);
        });
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.state.running.store(running, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        let token = {
            let mut current = self.state.token.lock();
            self.state.running.store(false, Ordering::SeqCst);
            current.take()
        };
        if let Some((_, token)) = token {
            token.cancel();
        }
    }
}

/// Where a handler draws
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    Key,
    Lcd,
}

impl Surface {
    pub fn size(self, info: &DeckInfo) -> (u32, u32) {
        match self {
            Surface::Key if info.icon_size > 0 => (info.icon_size, info.icon_size),
            Surface::Lcd if info.lcd_width > 0 && info.lcd_height > 0 => {
                (info.lcd_width, info.lcd_height)
            }
            Surface::Key => (72, 72),
            Surface::Lcd => LCD_CANVAS,
        }
    }
}

/// Hand a frame to the sink unless the producer was cancelled
fn emit(token: &CancellationToken, sink: &FrameSink, img: RgbaImage) -> bool {
    if token.is_cancelled() {
        return false;
    }
    sink(img);
    true
}

/// Black panel with `text` drawn using the handler's text fields
fn text_frame(config: &HandlerConfig, size: (u32, u32), text: &str) -> RgbaImage {
    let mut img = render::black(size.0, size.1);
    let overlay = Overlay::new(
        text,
        config.u32_field("text_size"),
        config.str_field("text_alignment").unwrap_or_default(),
    );
    render::draw_text(&mut img, &overlay);
    img
}

fn text_fields() -> Vec<Field> {
    vec![
        Field::new("text_size", "Text Size", FieldType::Number),
        Field::new("text_alignment", "Text Alignment", FieldType::TextAlignment),
    ]
}
