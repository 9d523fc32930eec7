//! Press counter
//!
//! The key/knob half bumps `count` in the shared state; the icon/LCD half
//! waits for the change notification and redraws. Both halves only meet when
//! the position names `Counter` for icon and input handler alike.

use std::sync::Arc;

use deckd_transport::InputEvent;
use serde_json::Value;

use super::{emit, text_fields, text_frame, Producer, Surface};
use crate::handler::{
    DeckInfo, FrameSink, HandlerConfig, IconHandler, KeyHandler, KnobHandler, Module,
};

const COUNT: &str = "count";

fn count(config: &HandlerConfig) -> i64 {
    config
        .shared
        .get(COUNT)
        .and_then(|v| v.as_i64())
        .unwrap_or(0)
}

fn add(config: &HandlerConfig, delta: i64) {
    config.shared.update(|state| {
        let current = state.get(COUNT).and_then(Value::as_i64).unwrap_or(0);
        state.insert(COUNT.to_string(), Value::from(current + delta));
    });
}

pub struct CounterIcon {
    surface: Surface,
    producer: Producer,
}

impl IconHandler for CounterIcon {
    fn start(&self, config: HandlerConfig, info: DeckInfo, sink: FrameSink) {
        let size = self.surface.size(&info);
        self.producer.spawn("Counter", move |token| async move {
            loop {
                let frame = text_frame(&config, size, &count(&config).to_string());
                if !emit(&token, &sink, frame) {
                    break;
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = config.shared.changed() => {}
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

pub struct CounterKey;

impl KeyHandler for CounterKey {
    fn handle(&self, config: &HandlerConfig, _info: &DeckInfo, event: &InputEvent) {
        if let InputEvent::KeyPress { .. } = event {
            add(config, 1);
        }
    }
}

/// Turning counts up and down, pressing resets
pub struct CounterKnob;

impl KnobHandler for CounterKnob {
    fn handle(&self, config: &HandlerConfig, _info: &DeckInfo, event: &InputEvent) {
        match *event {
            InputEvent::KnobCw { notches, .. } => add(config, notches as i64),
            InputEvent::KnobCcw { notches, .. } => add(config, -(notches as i64)),
            InputEvent::KnobPress { .. } | InputEvent::ShortTap { .. } => {
                config.shared.set(COUNT, Value::from(0));
            }
            _ => {}
        }
    }
}

fn new_icon() -> Arc<dyn IconHandler> {
    Arc::new(CounterIcon {
        surface: Surface::Key,
        producer: Producer::default(),
    })
}

fn new_lcd() -> Arc<dyn IconHandler> {
    Arc::new(CounterIcon {
        surface: Surface::Lcd,
        producer: Producer::default(),
    })
}

fn new_key() -> Arc<dyn KeyHandler> {
    Arc::new(CounterKey)
}

fn new_knob() -> Arc<dyn KnobHandler> {
    Arc::new(CounterKnob)
}

pub fn module() -> Module {
    Module {
        new_icon: Some(new_icon),
        new_key: Some(new_key),
        new_lcd: Some(new_lcd),
        new_knob: Some(new_knob),
        icon_fields: text_fields(),
        lcd_fields: text_fields(),
        ..Module::new("Counter")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::SharedState;

    #[tokio::test]
    async fn test_press_redraws_icon() {
        let shared = SharedState::new();
        let config = HandlerConfig {
            shared: shared.clone(),
            ..Default::default()
        };
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let icon = new_icon();
        icon.start(
            config.clone(),
            DeckInfo {
                icon_size: 72,
                ..Default::default()
            },
            Arc::new(move |img| {
                let _ = tx.send(img);
            }),
        );
        let first = rx.recv().await.unwrap();

        new_key().handle(&config, &DeckInfo::default(), &InputEvent::KeyPress { index: 0 });
        let second = rx.recv().await.unwrap();
        assert_eq!(shared.get(COUNT), Some(Value::from(1)));
        assert_ne!(first, second);

        // releases are not counted
        new_key().handle(&config, &DeckInfo::default(), &InputEvent::KeyRelease { index: 0 });
        assert_eq!(shared.get(COUNT), Some(Value::from(1)));
        icon.stop();
    }

    #[test]
    fn test_knob_turns_and_resets() {
        let config = HandlerConfig::default();
        let knob = new_knob();
        let info = DeckInfo::default();
        knob.handle(&config, &info, &InputEvent::KnobCw { index: 0, notches: 3 });
        knob.handle(&config, &info, &InputEvent::KnobCcw { index: 0, notches: 1 });
        assert_eq!(count(&config), 2);
        knob.handle(&config, &info, &InputEvent::KnobPress { index: 0 });
        assert_eq!(count(&config), 0);
    }
}
