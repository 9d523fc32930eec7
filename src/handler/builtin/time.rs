//! Clock showing the local time, redrawn every second

use std::sync::Arc;
use std::time::Duration;

use super::{emit, text_fields, text_frame, Producer, Surface};
use crate::handler::{DeckInfo, FrameSink, HandlerConfig, IconHandler, Module};

const TICK: Duration = Duration::from_secs(1);

pub struct TimeIcon {
    surface: Surface,
    producer: Producer,
}

impl TimeIcon {
    pub fn new(surface: Surface) -> Self {
        Self {
            surface,
            producer: Producer::default(),
        }
    }
}

impl IconHandler for TimeIcon {
    fn start(&self, config: HandlerConfig, info: DeckInfo, sink: FrameSink) {
        let size = self.surface.size(&info);
        self.producer.spawn("Time", move |token| async move {
            loop {
                let now = chrono::Local::now().format("%H:%M:%S").to_string();
                if !emit(&token, &sink, text_frame(&config, size, &now)) {
                    break;
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(TICK) => {}
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
    Arc::new(TimeIcon::new(Surface::Key))
}

fn new_lcd() -> Arc<dyn IconHandler> {
    Arc::new(TimeIcon::new(Surface::Lcd))
}

pub fn module() -> Module {
    Module {
        new_icon: Some(new_icon),
        new_lcd: Some(new_lcd),
        icon_fields: text_fields(),
        lcd_fields: text_fields(),
        ..Module::new("Time")
    }
}
