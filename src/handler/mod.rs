//! Handler plugin contract
//!
//! Icon handlers produce bitmaps for one key or LCD segment until stopped.
//! Key and knob handlers react to input on that position. A module may supply
//! any combination of the four; when the same module renders and handles a
//! position, both halves see one [`SharedState`].

pub mod builtin;
pub mod registry;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use deckd_transport::InputEvent;
use image::RgbaImage;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Notify;

pub use registry::{Module, ModuleRegistry};

/// Callback receiving rendered frames
pub type FrameSink = Arc<dyn Fn(RgbaImage) + Send + Sync>;

/// Device snapshot handed to handlers and returned over RPC
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeckInfo {
    pub cols: u32,
    pub rows: u32,
    pub icon_size: u32,
    pub page: usize,
    pub serial: String,
    pub name: String,
    pub connected: bool,
    pub last_connected: Option<DateTime<Utc>>,
    pub last_disconnected: Option<DateTime<Utc>>,
    pub lcd_width: u32,
    pub lcd_height: u32,
    pub lcd_cols: u32,
    pub knob_cols: u32,
}

#[derive(Default)]
struct SharedInner {
    values: Mutex<Map<String, Value>>,
    changed: Notify,
}

/// State bag shared between linked icon and input handlers
#[derive(Clone, Default)]
pub struct SharedState {
    inner: Arc<SharedInner>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.values.lock().get(key).cloned()
    }

    /// Set a value and wake whoever waits on [`SharedState::changed`]
    pub fn set(&self, key: &str, value: Value) {
        self.inner.values.lock().insert(key.to_string(), value);
        self.inner.changed.notify_one();
    }

    /// Mutate the bag in place, then notify
    pub fn update<R>(&self, f: impl FnOnce(&mut Map<String, Value>) -> R) -> R {
        let result = f(&mut self.inner.values.lock());
        self.inner.changed.notify_one();
        result
    }

    /// Resolves after the next `set`/`update` (or immediately if one is pending)
    pub async fn changed(&self) {
        self.inner.changed.notified().await;
    }

    /// Whether both handles point at the same bag
    pub fn same_as(&self, other: &SharedState) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for SharedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SharedState")
            .field(&*self.inner.values.lock())
            .finish()
    }
}

/// Resolved configuration passed to a handler
#[derive(Debug, Clone, Default)]
pub struct HandlerConfig {
    pub fields: Map<String, Value>,
    pub shared: SharedState,
}

impl HandlerConfig {
    /// `shared` first, then `own` on top
    pub fn merged(
        shared_fields: &Map<String, Value>,
        own: &Map<String, Value>,
        shared: SharedState,
    ) -> Self {
        let mut fields = shared_fields.clone();
        fields.extend(own.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self { fields, shared }
    }

    pub fn isolated(own: &Map<String, Value>) -> Self {
        Self {
            fields: own.clone(),
            shared: SharedState::new(),
        }
    }

    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str).filter(|s| !s.is_empty())
    }

    /// Numeric field given either as a JSON number or a numeric string
    pub fn u32_field(&self, name: &str) -> Option<u32> {
        match self.fields.get(name)? {
            Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Kind of value a declared field holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Text,
    Number,
    File,
    List,
    Checkbox,
    TextAlignment,
}

/// User-configurable field a module declares
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub title: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub list_items: Vec<String>,
}

impl Field {
    pub fn new(name: &str, title: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            title: title.to_string(),
            field_type,
            file_types: Vec::new(),
            list_items: Vec::new(),
        }
    }

    pub fn with_file_types(mut self, types: &[&str]) -> Self {
        self.file_types = types.iter().map(|s| s.to_string()).collect();
        self
    }
}

/// Renders a key or LCD segment
///
/// `start` must return promptly and do its work on a spawned task.
/// `stop` must be safe to call before `start` and more than once, and no
/// frame may reach the sink after the producer has observed it. An instance
/// that has been stopped is never started again; `stop` may run on another
/// thread well after `set_running(false)`.
pub trait IconHandler: Send + Sync {
    fn start(&self, config: HandlerConfig, info: DeckInfo, sink: FrameSink);
    fn is_running(&self) -> bool;
    fn set_running(&self, running: bool);
    fn stop(&self);
}

/// Reacts to key presses
pub trait KeyHandler: Send + Sync {
    fn handle(&self, config: &HandlerConfig, info: &DeckInfo, event: &InputEvent);
}

/// Reacts to knob presses, rotation and touch strip taps
pub trait KnobHandler: Send + Sync {
    fn handle(&self, config: &HandlerConfig, info: &DeckInfo, event: &InputEvent);
}
