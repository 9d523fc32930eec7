//! Per-deck runtime
//!
//! A [`VirtualDevice`] lives as long as the daemon knows a serial. It owns the
//! deck's pages, the page on screen, the focused application and every handler
//! instance created for the deck. The physical [`Deck`] comes and goes with
//! the USB connection; configuration and handler state survive a replug.
//!
//! Handler instances are bound to one (page, position, variant). A position
//! only ever shows its active variant; handlers of other variants are stopped
//! as soon as the variant changes.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use deckd_transport::{Deck, InputEvent, TransportError};
use image::RgbaImage;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::actions::Launcher;
use crate::config::{KeyConfig, KnobAction, KnobConfig, PageConfig};
use crate::error::DaemonError;
use crate::handler::{
    DeckInfo, FrameSink, HandlerConfig, IconHandler, KeyHandler, KnobHandler, ModuleRegistry,
    SharedState,
};
use crate::keyboard::KeyHolder;
use crate::render::{self, Overlay, LCD_CANVAS};

/// Attempts at a render or handler call that panics
const MAX_ATTEMPTS: usize = 3;

/// Fallback key size before a deck has been attached
const DEFAULT_ICON_SIZE: u32 = 72;

/// Emitted whenever a deck shows a (possibly unchanged) page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageChanged {
    pub serial: String,
    pub page: usize,
}

/// Process-wide collaborators every deck uses
pub struct Services {
    pub registry: Arc<ModuleRegistry>,
    pub launcher: Arc<dyn Launcher>,
    /// Virtual keyboard for `key_hold`, absent without uinput access
    pub keys: Option<Arc<dyn KeyHolder>>,
    pub pages: broadcast::Sender<PageChanged>,
}

impl Services {
    pub fn new(
        registry: Arc<ModuleRegistry>,
        launcher: Arc<dyn Launcher>,
        keys: Option<Arc<dyn KeyHolder>>,
    ) -> Self {
        let (pages, _) = broadcast::channel(16);
        Self {
            registry,
            launcher,
            keys,
            pages,
        }
    }
}

/// A key or a knob (with its LCD segment)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Position {
    Key(usize),
    Knob(usize),
}

/// Handler instances and cached bitmap of one variant at one position
#[derive(Default)]
struct Handlers {
    icon: Option<Arc<dyn IconHandler>>,
    key: Option<Arc<dyn KeyHandler>>,
    knob: Option<Arc<dyn KnobHandler>>,
    /// Bag shared by linked handlers, or the icon handler's own
    shared: SharedState,
    /// Input handler's bag when it is not linked to the icon handler
    input_state: SharedState,
    frame: Option<RgbaImage>,
}

#[derive(Default)]
struct Slot {
    active: Option<String>,
    variants: HashMap<String, Handlers>,
}

/// Position configuration flattened over keys and knobs
struct Resolved {
    variant: String,
    icon: String,
    text: String,
    text_size: Option<u32>,
    text_alignment: String,
    icon_handler: String,
    input_handler: String,
    linked: bool,
    icon_fields: Map<String, Value>,
    input_fields: Map<String, Value>,
    shared_fields: Map<String, Value>,
}

impl Resolved {
    fn from_key(variant: String, key: &KeyConfig) -> Self {
        Self {
            variant,
            icon: key.icon.clone(),
            text: key.text.clone(),
            text_size: key.text_size,
            text_alignment: key.text_alignment.clone(),
            icon_handler: key.icon_handler.clone(),
            input_handler: key.key_handler.clone(),
            linked: key.is_linked(),
            icon_fields: key.icon_handler_fields.clone(),
            input_fields: key.key_handler_fields.clone(),
            shared_fields: key.shared_handler_fields.clone(),
        }
    }

    fn from_knob(variant: String, knob: &KnobConfig) -> Self {
        Self {
            variant,
            icon: knob.icon.clone(),
            text: knob.text.clone(),
            text_size: knob.text_size,
            text_alignment: knob.text_alignment.clone(),
            icon_handler: knob.lcd_handler.clone(),
            input_handler: knob.knob_or_touch_handler.clone(),
            linked: knob.is_linked(),
            icon_fields: knob.lcd_handler_fields.clone(),
            input_fields: knob.knob_or_touch_handler_fields.clone(),
            shared_fields: knob.shared_handler_fields.clone(),
        }
    }

    fn icon_config(&self, handlers: &Handlers) -> HandlerConfig {
        if self.linked {
            HandlerConfig::merged(
                &self.shared_fields,
                &self.icon_fields,
                handlers.shared.clone(),
            )
        } else {
            HandlerConfig {
                fields: self.icon_fields.clone(),
                shared: handlers.shared.clone(),
            }
        }
    }

    fn input_config(&self, handlers: &Handlers) -> HandlerConfig {
        if self.linked {
            HandlerConfig::merged(
                &self.shared_fields,
                &self.input_fields,
                handlers.shared.clone(),
            )
        } else {
            HandlerConfig {
                fields: self.input_fields.clone(),
                shared: handlers.input_state.clone(),
            }
        }
    }
}

enum InputHandler {
    Key(Arc<dyn KeyHandler>),
    Knob(Arc<dyn KnobHandler>),
}

impl InputHandler {
    fn handle(&self, config: &HandlerConfig, info: &DeckInfo, event: &InputEvent) {
        match self {
            InputHandler::Key(h) => h.handle(config, info, event),
            InputHandler::Knob(h) => h.handle(config, info, event),
        }
    }
}

struct State {
    page: usize,
    pages: Vec<PageConfig>,
    app: String,
    locked: bool,
    info: DeckInfo,
}

/// Live state of one deck, keyed by serial
pub struct VirtualDevice {
    serial: String,
    services: Arc<Services>,
    deck: Mutex<Option<Arc<Deck>>>,
    /// Stop flag of the input reader bound to the current deck
    reader: Mutex<Option<Arc<AtomicBool>>>,
    state: Mutex<State>,
    slots: Mutex<HashMap<(usize, Position), Slot>>,
    held: Mutex<Vec<u16>>,
    shutting_down: AtomicBool,
    disconnecting: Mutex<()>,
}

impl VirtualDevice {
    pub fn new(serial: &str, pages: Vec<PageConfig>, services: Arc<Services>) -> Arc<Self> {
        Arc::new(Self {
            serial: serial.to_string(),
            services,
            deck: Mutex::new(None),
            reader: Mutex::new(None),
            state: Mutex::new(State {
                page: 0,
                pages,
                app: String::new(),
                locked: false,
                info: DeckInfo {
                    serial: serial.to_string(),
                    ..Default::default()
                },
            }),
            slots: Mutex::new(HashMap::new()),
            held: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
            disconnecting: Mutex::new(()),
        })
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Bind a freshly opened deck
    pub fn attach(&self, deck: Arc<Deck>, reader: Option<Arc<AtomicBool>>) {
        let descriptor = deck.descriptor();
        let lcd = descriptor.lcd;
        {
            let mut state = self.state.lock();
            let info = &mut state.info;
            info.cols = descriptor.columns as u32;
            info.rows = descriptor.rows as u32;
            info.icon_size = descriptor.pixels();
            let name = deck.info().display_name();
            info.name = if name.is_empty() {
                descriptor.name.to_string()
            } else {
                name
            };
            info.connected = true;
            info.last_connected = Some(Utc::now());
            info.lcd_width = lcd.map_or(0, |l| l.width);
            info.lcd_height = lcd.map_or(0, |l| l.height);
            info.lcd_cols = lcd.map_or(0, |l| l.segments as u32);
            info.knob_cols = descriptor.knobs as u32;
        }
        if let Some(old) = self.reader.lock().replace(reader.unwrap_or_default()) {
            old.store(true, Ordering::Relaxed);
        }
        *self.deck.lock() = Some(deck);
        info!(serial = %self.serial, "Deck attached");
    }

    /// Take over daemon-wide focus and lock state without rendering
    pub fn adopt(&self, app: &str, locked: bool) {
        let mut state = self.state.lock();
        state.app = app.to_string();
        state.locked = locked;
    }

    pub fn deck(&self) -> Option<Arc<Deck>> {
        self.deck.lock().clone()
    }

    pub fn is_open(&self) -> bool {
        self.deck.lock().as_ref().is_some_and(|d| d.is_open())
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    pub fn page(&self) -> usize {
        self.state.lock().page
    }

    pub fn page_count(&self) -> usize {
        self.state.lock().pages.len()
    }

    /// Snapshot handed to handlers and returned over RPC
    pub fn info(&self) -> DeckInfo {
        let state = self.state.lock();
        DeckInfo {
            page: state.page,
            ..state.info.clone()
        }
    }

    /// Show `page`, stopping every handler of the page being left
    pub async fn set_page(self: &Arc<Self>, page: usize) -> Result<(), DaemonError> {
        let previous = {
            let mut state = self.state.lock();
            let pages = state.pages.len();
            if page >= pages {
                warn!(serial = %self.serial, "Page {} does not exist ({} pages)", page + 1, pages);
                return Err(DaemonError::InvalidPage { page, pages });
            }
            std::mem::replace(&mut state.page, page)
        };
        if previous != page {
            debug!(serial = %self.serial, "Switching from page {} to {}", previous, page);
            halt(self.handlers_on(|p| p == previous));
        }

        self.render_page(page).await;
        let _ = self.services.pages.send(PageChanged {
            serial: self.serial.clone(),
            page,
        });
        Ok(())
    }

    /// Render every position of `page`, each on its own blocking task
    async fn render_page(self: &Arc<Self>, page: usize) {
        let positions = {
            let state = self.state.lock();
            let Some(config) = state.pages.get(page) else {
                return;
            };
            (0..config.keys.len())
                .map(Position::Key)
                .chain((0..config.knobs.len()).map(Position::Knob))
                .collect::<Vec<_>>()
        };
        self.render_positions(page, positions).await;
    }

    async fn render_positions(self: &Arc<Self>, page: usize, positions: Vec<Position>) {
        let tasks = positions.into_iter().map(|pos| {
            let device = Arc::clone(self);
            tokio::task::spawn_blocking(move || device.render(page, pos))
        });
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!(serial = %self.serial, "Render task failed: {}", e);
            }
        }
    }

    /// Render one position, retrying when it panics
    pub fn render(self: &Arc<Self>, page: usize, pos: Position) {
        guarded(&self.serial, pos, "render", || self.render_once(page, pos));
    }

    fn render_once(self: &Arc<Self>, page: usize, pos: Position) {
        if self.shutting_down.load(Ordering::SeqCst) || self.is_locked() || self.page() != page {
            return;
        }
        let Some(resolved) = self.resolve(page, pos) else {
            debug!(serial = %self.serial, ?pos, "No configuration for position");
            return;
        };
        halt(self.activate(page, pos, &resolved.variant));

        if resolved.icon_handler.is_empty() {
            self.render_static(page, pos, &resolved);
        } else {
            self.start_icon_handler(page, pos, resolved);
        }
    }

    fn render_static(&self, page: usize, pos: Position, resolved: &Resolved) {
        let (width, height) = self.surface_size(pos);
        let cached = self.with_handlers(page, pos, &resolved.variant, |h| h.frame.clone());
        let img = match cached {
            Some(img) if img.dimensions() == (width, height) => img,
            _ => {
                let overlay = Overlay::new(
                    &resolved.text,
                    resolved.text_size,
                    &resolved.text_alignment,
                );
                let img = render::compose(&resolved.icon, &overlay, width, height)
                    .unwrap_or_else(|e| {
                        warn!(serial = %self.serial, ?pos, icon = %resolved.icon, "Failed to load icon: {}", e);
                        let mut img = render::black(width, height);
                        render::draw_text(&mut img, &overlay);
                        img
                    });
                self.with_handlers(page, pos, &resolved.variant, |h| {
                    h.frame = Some(img.clone())
                });
                img
            }
        };
        self.write(page, pos, &img);
    }

    fn start_icon_handler(self: &Arc<Self>, page: usize, pos: Position, resolved: Resolved) {
        let name = resolved.icon_handler.clone();
        let registry = Arc::clone(&self.services.registry);
        let started = self.with_handlers(page, pos, &resolved.variant, |h| {
            if h.icon.is_none() {
                h.icon = match pos {
                    Position::Key(_) => registry.new_icon(&name),
                    Position::Knob(_) => registry.new_lcd(&name),
                };
            }
            h.icon
                .clone()
                .map(|icon| (icon, resolved.icon_config(h), h.frame.clone()))
        });
        let Some((icon, config, cached)) = started else {
            warn!(serial = %self.serial, ?pos, app = %resolved.variant, "{}", DaemonError::UnknownHandler(name));
            return;
        };

        if icon.is_running() {
            if let Some(frame) = cached {
                self.write(page, pos, &frame);
            }
            return;
        }
        info!(serial = %self.serial, ?pos, handler = %name, app = %resolved.variant, "Starting icon handler");
        let sink = self.sink(page, pos, resolved.variant);
        icon.start(config, self.info(), sink);
    }

    fn sink(self: &Arc<Self>, page: usize, pos: Position, variant: String) -> FrameSink {
        let device = Arc::downgrade(self);
        Arc::new(move |img| {
            if let Some(device) = device.upgrade() {
                guarded(&device.serial, pos, "frame", || {
                    device.on_frame(page, pos, &variant, &img)
                });
            }
        })
    }

    fn on_frame(&self, page: usize, pos: Position, variant: &str, img: &RgbaImage) {
        if img.width() == 0 || img.height() == 0 {
            warn!(serial = %self.serial, ?pos, app = %variant, "Empty image received");
            return;
        }
        let (width, height) = self.surface_size(pos);
        let img = render::fit(img.clone(), width, height);
        let active = {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(&(page, pos)) else {
                return;
            };
            if let Some(handlers) = slot.variants.get_mut(variant) {
                handlers.frame = Some(img.clone());
            }
            slot.active.as_deref() == Some(variant)
        };
        if active {
            self.write(page, pos, &img);
        }
    }

    /// Push a bitmap if `page` is on screen and the deck can take it
    fn write(&self, page: usize, pos: Position, img: &RgbaImage) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        {
            let state = self.state.lock();
            if state.locked || state.page != page {
                return;
            }
        }
        let Some(deck) = self.deck() else {
            return;
        };
        if !deck.is_open() {
            return;
        }
        let result = match pos {
            Position::Key(i) => deck.write_key_image(index_u8(i), img),
            Position::Knob(i) => deck.write_lcd_image(index_u8(i), img),
        };
        if let Err(e) = result {
            match e {
                TransportError::WrongDimensions { .. } => warn!(
                    serial = %self.serial, ?pos,
                    "{} provided: {} x {}", e, img.width(), img.height()
                ),
                e => self.on_device_error(&deck, e),
            }
        }
    }

    /// React to an error from `deck`, which may have been replaced since
    fn on_device_error(&self, deck: &Arc<Deck>, e: TransportError) {
        if e.is_device_gone() {
            warn!(serial = %self.serial, "Device gone: {}", e);
            self.release_deck(Some(deck));
        } else {
            warn!(serial = %self.serial, "Device error: {}", e);
        }
    }

    fn surface_size(&self, pos: Position) -> (u32, u32) {
        let state = self.state.lock();
        let info = &state.info;
        match pos {
            Position::Key(_) if info.icon_size > 0 => (info.icon_size, info.icon_size),
            Position::Key(_) => (DEFAULT_ICON_SIZE, DEFAULT_ICON_SIZE),
            Position::Knob(_) if info.lcd_width > 0 && info.lcd_height > 0 => {
                (info.lcd_width, info.lcd_height)
            }
            Position::Knob(_) => LCD_CANVAS,
        }
    }

    fn key_config(&self, page: usize, index: usize) -> Option<(String, KeyConfig)> {
        let state = self.state.lock();
        let entry = state.pages.get(page)?.keys.get(index)?;
        let variant = entry.resolve(&state.app);
        Some((variant.to_string(), entry.get(variant)?.clone()))
    }

    fn knob_config(&self, page: usize, index: usize) -> Option<(String, KnobConfig)> {
        let state = self.state.lock();
        let entry = state.pages.get(page)?.knobs.get(index)?;
        let variant = entry.resolve(&state.app);
        Some((variant.to_string(), entry.get(variant)?.clone()))
    }

    fn resolve(&self, page: usize, pos: Position) -> Option<Resolved> {
        match pos {
            Position::Key(i) => self
                .key_config(page, i)
                .map(|(variant, key)| Resolved::from_key(variant, &key)),
            Position::Knob(i) => self
                .knob_config(page, i)
                .map(|(variant, knob)| Resolved::from_knob(variant, &knob)),
        }
    }

    fn with_handlers<R>(
        &self,
        page: usize,
        pos: Position,
        variant: &str,
        f: impl FnOnce(&mut Handlers) -> R,
    ) -> R {
        let mut slots = self.slots.lock();
        let handlers = slots
            .entry((page, pos))
            .or_default()
            .variants
            .entry(variant.to_string())
            .or_default();
        f(handlers)
    }

    /// Mark `variant` active, detaching running icon handlers of the others
    fn activate(&self, page: usize, pos: Position, variant: &str) -> Vec<Arc<dyn IconHandler>> {
        let mut slots = self.slots.lock();
        let slot = slots.entry((page, pos)).or_default();
        slot.active = Some(variant.to_string());
        slot.variants
            .iter_mut()
            .filter(|(v, _)| v.as_str() != variant)
            .filter_map(|(_, h)| detach_running(h))
            .collect()
    }

    /// Detach running icon handlers on pages matching `filter`
    ///
    /// A detached instance is never started again; the next render of its
    /// position builds a fresh one, so a late `stop` only reaches the old one.
    fn handlers_on(&self, filter: impl Fn(usize) -> bool) -> Vec<Arc<dyn IconHandler>> {
        self.slots
            .lock()
            .iter_mut()
            .filter(|((page, _), _)| filter(*page))
            .flat_map(|(_, slot)| slot.variants.values_mut())
            .filter_map(detach_running)
            .collect()
    }

    fn stop_all(&self) {
        let handlers = self.handlers_on(|_| true);
        if !handlers.is_empty() {
            debug!(serial = %self.serial, "Stopping {} handlers", handlers.len());
        }
        halt(handlers);
    }

    /// Positions with a running icon handler
    pub fn running_handlers(&self) -> Vec<(usize, Position)> {
        let mut running: Vec<_> = self
            .slots
            .lock()
            .iter()
            .filter(|(_, slot)| {
                slot.variants
                    .values()
                    .any(|h| h.icon.as_ref().is_some_and(|i| i.is_running()))
            })
            .map(|(key, _)| *key)
            .collect();
        running.sort_by_key(|(page, pos)| match *pos {
            Position::Key(i) => (*page, 0, i),
            Position::Knob(i) => (*page, 1, i),
        });
        running
    }

    /// Last bitmap produced for the active variant at a position
    pub fn cached_image(&self, page: usize, pos: Position) -> Option<RgbaImage> {
        let slots = self.slots.lock();
        let slot = slots.get(&(page, pos))?;
        let variant = slot.active.as_ref()?;
        slot.variants.get(variant)?.frame.clone()
    }

    /// Route one decoded input event
    pub async fn handle_input(self: &Arc<Self>, event: InputEvent) {
        if self.shutting_down.load(Ordering::SeqCst) || self.is_locked() {
            debug!(serial = %self.serial, ?event, "Ignoring input");
            return;
        }
        let page = self.page();
        match event {
            InputEvent::KeyPress { index } => self.key_pressed(page, index as usize, event).await,
            InputEvent::KeyRelease { index } => self.key_released(page, index as usize, event),
            InputEvent::KnobPress { index }
            | InputEvent::KnobCw { index, .. }
            | InputEvent::KnobCcw { index, .. } => {
                self.knob_event(page, index as usize, event).await
            }
            InputEvent::ShortTap { segment } | InputEvent::LongTap { segment } => {
                self.knob_event(page, segment as usize, event).await
            }
            InputEvent::Swipe { x, end_x, .. } => self.swipe(x, end_x).await,
        }
    }

    async fn key_pressed(self: &Arc<Self>, page: usize, index: usize, event: InputEvent) {
        let Some((variant, key)) = self.key_config(page, index) else {
            return;
        };
        self.run_action(&key.press_action()).await;
        if let Some(code) = key.key_hold {
            self.hold(code);
        }
        if !key.key_handler.is_empty() {
            let resolved = Resolved::from_key(variant, &key);
            self.call_input_handler(page, Position::Key(index), &resolved, &event);
        }
    }

    fn key_released(&self, page: usize, index: usize, event: InputEvent) {
        let Some((variant, key)) = self.key_config(page, index) else {
            return;
        };
        if let Some(code) = key.key_hold {
            self.release(code);
        }
        if !key.key_handler.is_empty() {
            let resolved = Resolved::from_key(variant, &key);
            self.call_input_handler(page, Position::Key(index), &resolved, &event);
        }
    }

    async fn knob_event(self: &Arc<Self>, page: usize, index: usize, event: InputEvent) {
        let Some((variant, knob)) = self.knob_config(page, index) else {
            return;
        };
        if !knob.knob_or_touch_handler.is_empty() {
            let resolved = Resolved::from_knob(variant, &knob);
            self.call_input_handler(page, Position::Knob(index), &resolved, &event);
            return;
        }
        let action = match event {
            InputEvent::KnobCw { .. } => &knob.knob_turn_up_action,
            InputEvent::KnobCcw { .. } => &knob.knob_turn_down_action,
            InputEvent::KnobPress { .. } => &knob.knob_press_action,
            // taps only reach a touch handler
            _ => return,
        };
        self.run_action(action).await;
    }

    /// Leftward swipe shows the next page, rightward the previous one
    async fn swipe(self: &Arc<Self>, x: u16, end_x: u16) {
        let (page, pages) = {
            let state = self.state.lock();
            (state.page, state.pages.len())
        };
        let target = if end_x < x {
            (page + 1 < pages).then_some(page + 1)
        } else {
            page.checked_sub(1)
        };
        if let Some(target) = target {
            let _ = self.set_page(target).await;
        }
    }

    fn call_input_handler(
        &self,
        page: usize,
        pos: Position,
        resolved: &Resolved,
        event: &InputEvent,
    ) {
        let name = &resolved.input_handler;
        let registry = &self.services.registry;
        let handler = self.with_handlers(page, pos, &resolved.variant, |h| {
            let handler = match pos {
                Position::Key(_) => {
                    if h.key.is_none() {
                        h.key = registry.new_key(name);
                    }
                    h.key.clone().map(InputHandler::Key)
                }
                Position::Knob(_) => {
                    if h.knob.is_none() {
                        h.knob = registry.new_knob(name);
                    }
                    h.knob.clone().map(InputHandler::Knob)
                }
            };
            handler.map(|handler| (handler, resolved.input_config(h)))
        });
        let Some((handler, config)) = handler else {
            warn!(serial = %self.serial, ?pos, app = %resolved.variant, "Invalid input handler: {}", name);
            return;
        };
        let info = self.info();
        guarded(&self.serial, pos, name, || handler.handle(&config, &info, event));
    }

    async fn run_action(self: &Arc<Self>, action: &KnobAction) {
        let launcher = &self.services.launcher;
        if !action.command.is_empty() {
            launcher.run(&action.command);
        }
        if !action.keybind.is_empty() {
            launcher.keybind(&action.keybind);
        }
        if let Some(page) = action.switch_page.filter(|p| *p > 0) {
            let _ = self.set_page(page as usize - 1).await;
        }
        if let Some(brightness) = action.brightness.filter(|b| *b > 0) {
            self.set_brightness(brightness.min(100) as u8);
        }
        if !action.url.is_empty() {
            launcher.open_url(&action.url);
        }
        if !action.obs_command.is_empty() {
            launcher.integration(&action.obs_command, &action.obs_command_params);
        }
    }

    pub fn set_brightness(&self, percent: u8) {
        if let Some(deck) = self.deck() {
            if let Err(e) = deck.set_brightness(percent) {
                self.on_device_error(&deck, e);
            }
        }
    }

    fn hold(&self, code: u16) {
        let Some(keys) = &self.services.keys else {
            warn!(serial = %self.serial, "No virtual keyboard, cannot hold key {}", code);
            return;
        };
        match keys.key_down(code) {
            Ok(()) => self.held.lock().push(code),
            Err(e) => warn!(serial = %self.serial, "Failed to hold key {}: {}", code, e),
        }
    }

    fn release(&self, code: u16) {
        let was_held = {
            let mut held = self.held.lock();
            let before = held.len();
            held.retain(|c| *c != code);
            held.len() != before
        };
        if !was_held {
            return;
        }
        if let Some(keys) = &self.services.keys {
            if let Err(e) = keys.key_up(code) {
                warn!(serial = %self.serial, "Failed to release key {}: {}", code, e);
            }
        }
    }

    fn release_held(&self) {
        let held = std::mem::take(&mut *self.held.lock());
        let Some(keys) = &self.services.keys else {
            return;
        };
        for code in held {
            if let Err(e) = keys.key_up(code) {
                warn!(serial = %self.serial, "Failed to release key {}: {}", code, e);
            }
        }
    }

    /// Focused application changed: swap variants on the current page
    pub async fn application_updated(self: &Arc<Self>, app: &str) {
        self.release_held();
        let (page, wanted) = {
            let mut state = self.state.lock();
            state.app = app.to_string();
            let page = state.page;
            let Some(config) = state.pages.get(page) else {
                return;
            };
            let wanted: Vec<(Position, String)> = config
                .keys
                .iter()
                .enumerate()
                .map(|(i, e)| (Position::Key(i), e.resolve(app).to_string()))
                .chain(
                    config
                        .knobs
                        .iter()
                        .enumerate()
                        .map(|(i, e)| (Position::Knob(i), e.resolve(app).to_string())),
                )
                .collect();
            (page, wanted)
        };

        let changed: Vec<Position> = {
            let slots = self.slots.lock();
            wanted
                .into_iter()
                .filter(|(pos, variant)| {
                    slots
                        .get(&(page, *pos))
                        .and_then(|s| s.active.as_deref())
                        != Some(variant.as_str())
                })
                .map(|(pos, _)| pos)
                .collect()
        };
        if !changed.is_empty() {
            debug!(serial = %self.serial, app, "{} positions change variant", changed.len());
            self.render_positions(page, changed).await;
        }
    }

    /// Pause everything while the screen is locked
    pub async fn set_locked(self: &Arc<Self>, locked: bool) {
        let was = std::mem::replace(&mut self.state.lock().locked, locked);
        if was == locked {
            return;
        }
        if locked {
            info!(serial = %self.serial, "Screen locked");
            self.release_held();
            self.stop_all();
            if let Some(deck) = self.deck() {
                if let Err(e) = deck.reset() {
                    self.on_device_error(&deck, e);
                }
            }
        } else {
            info!(serial = %self.serial, "Screen unlocked");
            if self.is_open() {
                let _ = self.set_page(self.page()).await;
            }
        }
    }

    /// Swap in new pages, e.g. after a config reload
    pub async fn replace_pages(self: &Arc<Self>, pages: Vec<PageConfig>) {
        self.stop_all();
        self.slots.lock().clear();
        let page = {
            let mut state = self.state.lock();
            state.pages = pages;
            if state.page >= state.pages.len() {
                state.page = 0;
            }
            state.page
        };
        if self.is_open() {
            let _ = self.set_page(page).await;
        }
    }

    /// Simulate a press and release of key `index`
    pub async fn press_button(self: &Arc<Self>, index: usize) -> Result<(), DaemonError> {
        if !self.is_open() {
            return Err(DaemonError::UnknownDevice(self.serial.clone()));
        }
        let keys = {
            let info = &self.state.lock().info;
            (info.cols * info.rows) as usize
        };
        let key = u8::try_from(index)
            .ok()
            .filter(|_| index < keys)
            .ok_or(DaemonError::InvalidKey { index, keys })?;
        self.handle_input(InputEvent::KeyPress { index: key }).await;
        self.handle_input(InputEvent::KeyRelease { index: key }).await;
        Ok(())
    }

    /// Tear down the connection, keeping configuration for the next attach
    ///
    /// Safe to call from several places at once; only the first call acts.
    pub fn disconnect(&self) {
        self.release_deck(None);
    }

    /// Disconnect, but only from `expected` when given
    fn release_deck(&self, expected: Option<&Arc<Deck>>) {
        let _guard = self.disconnecting.lock();
        let deck = {
            let mut current = self.deck.lock();
            let replaced = match (expected, current.as_ref()) {
                (Some(expected), Some(deck)) => !Arc::ptr_eq(expected, deck),
                _ => false,
            };
            if replaced {
                debug!(serial = %self.serial, "Ignoring error from a replaced deck");
                return;
            }
            current.take()
        };
        let Some(deck) = deck else {
            return;
        };
        deck.close();
        if let Some(reader) = self.reader.lock().take() {
            reader.store(true, Ordering::Relaxed);
        }
        {
            let mut state = self.state.lock();
            state.info.connected = false;
            state.info.last_disconnected = Some(Utc::now());
        }
        self.release_held();
        self.stop_all();
        info!(serial = %self.serial, "Deck disconnected");
    }

    /// Reset and close the deck for good
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.release_held();
        self.stop_all();
        if let Some(reader) = self.reader.lock().take() {
            reader.store(true, Ordering::Relaxed);
        }
        if let Some(deck) = self.deck.lock().take() {
            if let Err(e) = deck.reset() {
                warn!(serial = %self.serial, "Failed to reset deck: {}", e);
            }
            deck.close();
        }
        info!(serial = %self.serial, "Deck shut down");
    }
}

fn index_u8(index: usize) -> u8 {
    u8::try_from(index).unwrap_or(u8::MAX)
}

fn detach_running(handlers: &mut Handlers) -> Option<Arc<dyn IconHandler>> {
    if handlers.icon.as_ref().is_some_and(|icon| icon.is_running()) {
        handlers.icon.take()
    } else {
        None
    }
}

/// Flag handlers stopped now and stop each on its own blocking task
fn halt(handlers: Vec<Arc<dyn IconHandler>>) {
    for handler in handlers {
        handler.set_running(false);
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn_blocking(move || handler.stop());
            }
            Err(_) => handler.stop(),
        }
    }
}

/// Run `f`, catching panics and retrying a bounded number of times
fn guarded<T>(serial: &str, pos: Position, what: &str, mut f: impl FnMut() -> T) -> Option<T> {
    for attempt in 1..=MAX_ATTEMPTS {
        match std::panic::catch_unwind(AssertUnwindSafe(&mut f)) {
            Ok(value) => return Some(value),
            Err(payload) => {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                warn!(serial, ?pos, attempt, "{} panicked: {}", what, msg);
            }
        }
    }
    error!(serial, ?pos, "{} failed {} times, giving up", what, MAX_ATTEMPTS);
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::testing::RecordingLauncher;
    use crate::config::{KeyEntry, Variants};
    use crate::keyboard::KeyboardError;
    use deckd_transport::device_registry::pid;
    use deckd_transport::{find_descriptor, ReportWire, TransportDeviceInfo, VENDOR_ID};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Wire {
        reports: Arc<Mutex<Vec<Vec<u8>>>>,
        features: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl ReportWire for Wire {
        fn write_report(&mut self, data: &[u8]) -> Result<usize, TransportError> {
            self.reports.lock().push(data.to_vec());
            Ok(data.len())
        }

        fn send_feature_report(&mut self, data: &[u8]) -> Result<(), TransportError> {
            self.features.lock().push(data.to_vec());
            Ok(())
        }

        fn get_feature_report(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
            Ok(buf.len())
        }
    }

    #[derive(Default)]
    struct Keys {
        events: Mutex<Vec<(u16, bool)>>,
    }

    impl KeyHolder for Keys {
        fn key_down(&self, code: u16) -> Result<(), KeyboardError> {
            self.events.lock().push((code, true));
            Ok(())
        }

        fn key_up(&self, code: u16) -> Result<(), KeyboardError> {
            self.events.lock().push((code, false));
            Ok(())
        }
    }

    struct Fixture {
        device: Arc<VirtualDevice>,
        launcher: Arc<RecordingLauncher>,
        keys: Arc<Keys>,
        features: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    fn key(config: KeyConfig) -> KeyEntry {
        Variants::single(config)
    }

    fn fixture(pages: Vec<PageConfig>) -> Fixture {
        let launcher = Arc::new(RecordingLauncher::default());
        let keys = Arc::new(Keys::default());
        let services = Arc::new(Services::new(
            Arc::new(ModuleRegistry::with_builtins()),
            launcher.clone(),
            Some(keys.clone()),
        ));
        let device = VirtualDevice::new("AL12K1A00000", pages, services);
        let wire = Wire::default();
        let features = wire.features.clone();
        let descriptor = find_descriptor(VENDOR_ID, pid::MK2).unwrap();
        let info = TransportDeviceInfo::new(VENDOR_ID, pid::MK2, "/dev/hidraw0", Some("AL12K1A00000"));
        device.attach(Arc::new(Deck::new(descriptor, info, Box::new(wire))), None);
        Fixture {
            device,
            launcher,
            keys,
            features,
        }
    }

    #[tokio::test]
    async fn test_press_runs_actions_in_order() {
        let f = fixture(vec![PageConfig {
            keys: vec![key(KeyConfig {
                command: "notify-send hi".into(),
                keybind: "ctrl+c".into(),
                url: "https://example.org".into(),
                obs_command: "SetScene".into(),
                ..Default::default()
            })],
            knobs: vec![],
        }]);
        f.device.handle_input(InputEvent::KeyPress { index: 0 }).await;
        assert_eq!(
            *f.launcher.commands.lock(),
            vec![
                "notify-send hi",
                "xdotool key ctrl+c",
                "xdg-open https://example.org"
            ]
        );
        assert_eq!(*f.launcher.integrations.lock(), vec!["SetScene"]);

        // releases run nothing
        f.device.handle_input(InputEvent::KeyRelease { index: 0 }).await;
        assert_eq!(f.launcher.commands.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_key_hold_released_on_app_switch() {
        let f = fixture(vec![PageConfig {
            keys: vec![key(KeyConfig {
                key_hold: Some(30),
                ..Default::default()
            })],
            knobs: vec![],
        }]);
        f.device.handle_input(InputEvent::KeyPress { index: 0 }).await;
        f.device.application_updated("firefox").await;
        // the release after the switch finds nothing held
        f.device.handle_input(InputEvent::KeyRelease { index: 0 }).await;
        assert_eq!(*f.keys.events.lock(), vec![(30, true), (30, false)]);
    }

    #[tokio::test]
    async fn test_brightness_action() {
        let f = fixture(vec![PageConfig {
            keys: vec![key(KeyConfig {
                brightness: Some(140),
                ..Default::default()
            })],
            knobs: vec![],
        }]);
        f.device.handle_input(InputEvent::KeyPress { index: 0 }).await;
        assert_eq!(f.features.lock().last().unwrap()[..3], [0x03, 0x08, 100]);
    }

    #[tokio::test]
    async fn test_swipe_is_bounded() {
        let f = fixture(vec![PageConfig::default(), PageConfig::default()]);
        let swipe_left = InputEvent::Swipe {
            x: 600,
            y: 50,
            end_x: 100,
            end_y: 50,
        };
        let swipe_right = InputEvent::Swipe {
            x: 100,
            y: 50,
            end_x: 600,
            end_y: 50,
        };
        f.device.handle_input(swipe_left).await;
        assert_eq!(f.device.page(), 1);
        f.device.handle_input(swipe_left).await;
        assert_eq!(f.device.page(), 1);
        f.device.handle_input(swipe_right).await;
        f.device.handle_input(swipe_right).await;
        assert_eq!(f.device.page(), 0);
    }

    #[tokio::test]
    async fn test_knob_actions_without_handler() {
        let knob = KnobConfig {
            knob_press_action: KnobAction {
                command: "press".into(),
                ..Default::default()
            },
            knob_turn_up_action: KnobAction {
                command: "up".into(),
                ..Default::default()
            },
            knob_turn_down_action: KnobAction {
                command: "down".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        let f = fixture(vec![PageConfig {
            keys: vec![],
            knobs: vec![Variants::single(knob)],
        }]);
        for event in [
            InputEvent::KnobCw { index: 0, notches: 2 },
            InputEvent::KnobCcw { index: 0, notches: 1 },
            InputEvent::KnobPress { index: 0 },
            InputEvent::ShortTap { segment: 0 },
            InputEvent::LongTap { segment: 0 },
        ] {
            f.device.handle_input(event).await;
        }
        assert_eq!(*f.launcher.commands.lock(), vec!["up", "down", "press"]);
    }

    #[tokio::test]
    async fn test_invalid_page_rejected() {
        let f = fixture(vec![PageConfig::default()]);
        assert!(matches!(
            f.device.set_page(3).await,
            Err(DaemonError::InvalidPage { page: 3, pages: 1 })
        ));
        assert_eq!(f.device.page(), 0);
    }

    #[tokio::test]
    async fn test_locked_ignores_input() {
        let f = fixture(vec![PageConfig {
            keys: vec![key(KeyConfig {
                command: "x".into(),
                ..Default::default()
            })],
            knobs: vec![],
        }]);
        f.device.set_locked(true).await;
        f.device.handle_input(InputEvent::KeyPress { index: 0 }).await;
        assert!(f.launcher.commands.lock().is_empty());
        f.device.set_locked(false).await;
        f.device.handle_input(InputEvent::KeyPress { index: 0 }).await;
        assert_eq!(f.launcher.commands.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_variant_switch_rerenders() {
        let entry = KeyEntry {
            application: [
                (String::new(), KeyConfig::default()),
                (
                    "firefox".to_string(),
                    KeyConfig {
                        text: "FF".into(),
                        ..Default::default()
                    },
                ),
            ]
            .into(),
        };
        let f = fixture(vec![PageConfig {
            keys: vec![entry],
            knobs: vec![],
        }]);
        f.device.set_page(0).await.unwrap();
        let plain = f.device.cached_image(0, Position::Key(0)).unwrap();
        f.device.application_updated("firefox").await;
        let text = f.device.cached_image(0, Position::Key(0)).unwrap();
        assert_ne!(plain, text);
        f.device.application_updated("kitty").await;
        assert_eq!(f.device.cached_image(0, Position::Key(0)).unwrap(), plain);
    }

    #[test]
    fn test_guarded_retries_then_gives_up() {
        let calls = AtomicUsize::new(0);
        let result: Option<()> = guarded("S", Position::Key(0), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            panic!("boom");
        });
        assert!(result.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), MAX_ATTEMPTS);

        let calls = AtomicUsize::new(0);
        let result = guarded("S", Position::Key(0), "test", || {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first time");
            }
            7
        });
        assert_eq!(result, Some(7));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let f = fixture(vec![PageConfig::default()]);
        assert!(f.device.is_open());
        f.device.disconnect();
        f.device.disconnect();
        let info = f.device.info();
        assert!(!info.connected);
        assert!(info.last_disconnected.is_some());
        assert!(!f.device.is_open());
        assert!(matches!(
            f.device.press_button(0).await,
            Err(DaemonError::UnknownDevice(_))
        ));
    }
}
