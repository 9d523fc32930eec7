//! Persistent daemon configuration
//!
//! A single JSON document holds every deck's pages. Each key and knob maps an
//! application id to its configuration; the empty id is the default variant
//! used when the focused application has no entry of its own.
//!
//! Only declarative data lives here. Active variants, cached bitmaps and
//! handler instances belong to the runtime and never reach the file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info};

use crate::error::DaemonError;

/// Application id of the default variant
pub const DEFAULT_APP: &str = "";

const CONFIG_FILE: &str = ".streamdeck-config.json";

fn is_zero(v: &Option<u32>) -> bool {
    v.map_or(true, |v| v == 0)
}

/// Action set shared by key presses and knob events
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnobAction {
    /// 1-indexed target page
    #[serde(default, skip_serializing_if = "is_zero")]
    pub switch_page: Option<u32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub keybind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub brightness: Option<u32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub obs_command: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub obs_command_params: BTreeMap<String, String>,
}

impl KnobAction {
    pub fn is_empty(&self) -> bool {
        self == &KnobAction::default()
    }
}

/// One key's configuration for one application variant
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub icon: String,
    /// 1-indexed target page
    #[serde(default, skip_serializing_if = "is_zero")]
    pub switch_page: Option<u32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub text_size: Option<u32>,
    /// "TOP", "BOTTOM" or anything else for centered
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text_alignment: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub keybind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub brightness: Option<u32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    /// Linux input keycode held while the key is down
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_hold: Option<u16>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub obs_command: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub obs_command_params: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub icon_handler: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key_handler: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub icon_handler_fields: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub key_handler_fields: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub shared_handler_fields: Map<String, Value>,
}

impl KeyConfig {
    /// Static actions run on press
    pub fn press_action(&self) -> KnobAction {
        KnobAction {
            switch_page: self.switch_page,
            keybind: self.keybind.clone(),
            command: self.command.clone(),
            brightness: self.brightness,
            url: self.url.clone(),
            obs_command: self.obs_command.clone(),
            obs_command_params: self.obs_command_params.clone(),
        }
    }

    /// Icon and key handler are the same module and share state
    pub fn is_linked(&self) -> bool {
        !self.icon_handler.is_empty() && self.icon_handler == self.key_handler
    }
}

/// One knob / LCD segment's configuration for one application variant
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnobConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub icon: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub text_size: Option<u32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text_alignment: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub lcd_handler: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub knob_or_touch_handler: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub lcd_handler_fields: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub knob_or_touch_handler_fields: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub shared_handler_fields: Map<String, Value>,
    #[serde(default, skip_serializing_if = "KnobAction::is_empty")]
    pub knob_press_action: KnobAction,
    #[serde(default, skip_serializing_if = "KnobAction::is_empty")]
    pub knob_turn_up_action: KnobAction,
    #[serde(default, skip_serializing_if = "KnobAction::is_empty")]
    pub knob_turn_down_action: KnobAction,
}

impl KnobConfig {
    pub fn is_linked(&self) -> bool {
        !self.lcd_handler.is_empty() && self.lcd_handler == self.knob_or_touch_handler
    }
}

/// Per-application variants of one position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variants<T> {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub application: BTreeMap<String, T>,
}

impl<T: Default> Default for Variants<T> {
    fn default() -> Self {
        Self {
            application: BTreeMap::from([(DEFAULT_APP.to_string(), T::default())]),
        }
    }
}

impl<T> Variants<T> {
    pub fn single(config: T) -> Self {
        Self {
            application: BTreeMap::from([(DEFAULT_APP.to_string(), config)]),
        }
    }

    /// Variant id to use while `app` has focus
    pub fn resolve(&self, app: &str) -> &str {
        match self.application.get_key_value(app) {
            Some((id, _)) => id,
            None => DEFAULT_APP,
        }
    }

    pub fn get(&self, app: &str) -> Option<&T> {
        self.application.get(app)
    }
}

pub type KeyEntry = Variants<KeyConfig>;
pub type KnobEntry = Variants<KnobConfig>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageConfig {
    #[serde(default)]
    pub keys: Vec<KeyEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub knobs: Vec<KnobEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeckConfig {
    pub serial: String,
    #[serde(default)]
    pub pages: Vec<PageConfig>,
}

impl DeckConfig {
    /// One page of `key_count` keys, each with only the default variant
    pub fn empty(serial: &str, key_count: usize) -> Self {
        Self {
            serial: serial.to_string(),
            pages: vec![PageConfig {
                keys: (0..key_count).map(|_| KeyEntry::default()).collect(),
                knobs: Vec::new(),
            }],
        }
    }
}

/// The whole configuration document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Shared libraries registering extra handler modules
    #[serde(default)]
    pub modules: Vec<String>,
    /// Fade decks out after this many idle seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sleep_timeout_secs: Option<u64>,
    #[serde(default)]
    pub decks: Vec<DeckConfig>,
}

impl Config {
    /// `$XDG_CONFIG_HOME/.streamdeck-config.json`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(CONFIG_FILE)
    }

    /// Load config from a file, writing a default document if it is missing
    pub fn load(path: &Path) -> Result<Self, DaemonError> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Self::from_json(&content)
        } else {
            let config = Self::default();
            config.save(path)?;
            info!("Created default config at {}", path.display());
            Ok(config)
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), DaemonError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self, DaemonError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, DaemonError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn deck(&self, serial: &str) -> Option<&DeckConfig> {
        self.decks.iter().find(|d| d.serial == serial)
    }
}

/// Config document plus the file it came from
pub struct ConfigStore {
    path: PathBuf,
    config: Mutex<Config>,
}

impl ConfigStore {
    pub fn open(path: PathBuf) -> Result<Self, DaemonError> {
        let config = Config::load(&path)?;
        Ok(Self {
            path,
            config: Mutex::new(config),
        })
    }

    /// Store that is never read from disk (previews, tests)
    pub fn in_memory(path: PathBuf, config: Config) -> Self {
        Self {
            path,
            config: Mutex::new(config),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Config {
        self.config.lock().clone()
    }

    pub fn modules(&self) -> Vec<String> {
        self.config.lock().modules.clone()
    }

    pub fn sleep_timeout_secs(&self) -> Option<u64> {
        self.config.lock().sleep_timeout_secs
    }

    pub fn save(&self) -> Result<(), DaemonError> {
        self.config.lock().save(&self.path)
    }

    /// Re-read the file, replacing the in-memory document
    pub fn reload(&self) -> Result<(), DaemonError> {
        let config = Config::load(&self.path)?;
        *self.config.lock() = config;
        Ok(())
    }

    /// Replace the in-memory document from JSON without saving
    pub fn replace_json(&self, json: &str) -> Result<(), DaemonError> {
        let config = Config::from_json(json)?;
        *self.config.lock() = config;
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, DaemonError> {
        self.config.lock().to_json()
    }

    /// Pages bound to `serial`, creating and saving an empty deck if unseen
    pub fn pages_for(&self, serial: &str, key_count: usize) -> Vec<PageConfig> {
        let mut config = self.config.lock();
        if let Some(deck) = config.deck(serial) {
            return deck.pages.clone();
        }
        info!(serial, "No config for deck, creating one page of {} keys", key_count);
        let deck = DeckConfig::empty(serial, key_count);
        let pages = deck.pages.clone();
        config.decks.push(deck);
        if let Err(e) = config.save(&self.path) {
            error!("Failed to save config: {}", e);
        }
        pages
    }

    /// Pages currently stored for `serial`, if any
    pub fn stored_pages(&self, serial: &str) -> Option<Vec<PageConfig>> {
        self.config.lock().deck(serial).map(|d| d.pages.clone())
    }
}
