//! Integration tests for the deck runtime.
//!
//! A `VirtualDevice` drives an in-memory wire standing in for the HID handle,
//! exercising the boundary between `runtime`, `handler`, `render` and the
//! transport crate's codec.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use deckd::actions::Launcher;
use deckd::config::{KeyConfig, KeyEntry, PageConfig, Variants};
use deckd::handler::builtin::time::TimeIcon;
use deckd::handler::builtin::Surface;
use deckd::handler::{
    DeckInfo, FrameSink, HandlerConfig, IconHandler, KeyHandler, Module, ModuleRegistry,
};
use deckd::{Position, Services, VirtualDevice};
use deckd_transport::device_registry::pid;
use deckd_transport::{
    find_descriptor, Deck, InputEvent, ReportWire, TransportDeviceInfo, TransportError, VENDOR_ID,
};
use image::{Rgba, RgbaImage};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};

const SERIAL: &str = "AL12K1A00000";

#[derive(Clone, Default)]
struct MemoryWire {
    reports: Arc<Mutex<Vec<Vec<u8>>>>,
    unplugged: Arc<AtomicBool>,
}

impl ReportWire for MemoryWire {
    fn write_report(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        if self.unplugged.load(Ordering::SeqCst) {
            return Err(TransportError::HidError("hidapi error: No such device".into()));
        }
        self.reports.lock().push(data.to_vec());
        Ok(data.len())
    }

    fn send_feature_report(&mut self, _data: &[u8]) -> Result<(), TransportError> {
        Ok(())
    }

    fn get_feature_report(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        Ok(buf.len())
    }
}

#[derive(Default)]
struct Recorder {
    commands: Mutex<Vec<String>>,
}

impl Launcher for Recorder {
    fn run(&self, command: &str) {
        self.commands.lock().push(command.to_string());
    }
}

struct Rig {
    device: Arc<VirtualDevice>,
    wire: MemoryWire,
    launcher: Arc<Recorder>,
}

fn rig_with(pages: Vec<PageConfig>, registry: ModuleRegistry) -> Rig {
    let launcher = Arc::new(Recorder::default());
    let services = Arc::new(Services::new(
        Arc::new(registry),
        launcher.clone(),
        None,
    ));
    let device = VirtualDevice::new(SERIAL, pages, services);
    let wire = MemoryWire::default();
    device.attach(deck_on(wire.clone()), None);
    Rig {
        device,
        wire,
        launcher,
    }
}

fn deck_on(wire: impl ReportWire + 'static) -> Arc<Deck> {
    let descriptor = find_descriptor(VENDOR_ID, pid::MK2).unwrap();
    let info = TransportDeviceInfo::new(VENDOR_ID, pid::MK2, "/dev/hidraw0", Some(SERIAL));
    Arc::new(Deck::new(descriptor, info, Box::new(wire)))
}

fn rig(pages: Vec<PageConfig>) -> Rig {
    rig_with(pages, ModuleRegistry::with_builtins())
}

/// One page of 15 keys, with `keys` placed at the front
fn page(keys: Vec<KeyConfig>) -> PageConfig {
    let mut entries: Vec<KeyEntry> = keys.into_iter().map(Variants::single).collect();
    entries.resize_with(15, KeyEntry::default);
    PageConfig {
        keys: entries,
        knobs: Vec::new(),
    }
}

fn time_key() -> KeyConfig {
    KeyConfig {
        icon_handler: "Time".into(),
        ..Default::default()
    }
}

async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..150 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Transfers completed on the wire (reports carrying the last-page flag)
fn transfers(wire: &MemoryWire) -> usize {
    wire.reports.lock().iter().filter(|r| r[3] == 1).count()
}

// ── Rendering ──

#[tokio::test(flavor = "multi_thread")]
async fn empty_key_renders_black() {
    let rig = rig(vec![page(vec![KeyConfig::default()])]);
    rig.device.set_page(0).await.unwrap();

    let img = rig.device.cached_image(0, Position::Key(0)).unwrap();
    assert_eq!(img.dimensions(), (72, 72));
    assert!(img.pixels().all(|p| *p == Rgba([0, 0, 0, 255])));
    // every key of the page went out
    assert_eq!(transfers(&rig.wire), 15);
}

#[tokio::test(flavor = "multi_thread")]
async fn time_handler_renders_until_stopped() {
    let rig = rig(vec![page(vec![KeyConfig::default(), time_key()]), page(vec![])]);
    rig.device.set_page(0).await.unwrap();

    wait_for("clock frame", || {
        rig.device.cached_image(0, Position::Key(1)).is_some()
    })
    .await;
    let frame = rig.device.cached_image(0, Position::Key(1)).unwrap();
    assert_eq!(frame.dimensions(), (72, 72));
    assert!(frame.pixels().any(|p| p.0[0] > 0));
    assert_eq!(rig.device.running_handlers(), vec![(0, Position::Key(1))]);

    rig.device.set_page(1).await.unwrap();
    assert!(rig.device.running_handlers().is_empty());
    let written = rig.wire.reports.lock().len();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(rig.wire.reports.lock().len(), written);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_renders_never_interleave() {
    let keys = (0..15)
        .map(|i| KeyConfig {
            text: format!("key {i}"),
            ..Default::default()
        })
        .collect();
    let rig = rig(vec![page(keys)]);
    rig.device.set_page(0).await.unwrap();

    let reports = rig.wire.reports.lock().clone();
    assert_eq!(transfers(&rig.wire), 15);
    let mut previous: Option<&Vec<u8>> = None;
    for report in &reports {
        assert_eq!(report.len(), 1024);
        assert_eq!(report[..2], [0x02, 0x07]);
        let page = u16::from_le_bytes([report[6], report[7]]);
        match previous {
            // a transfer in progress continues with the next page of the same key
            Some(prev) if prev[3] == 0 => {
                assert_eq!(report[2], prev[2]);
                assert_eq!(page, u16::from_le_bytes([prev[6], prev[7]]) + 1);
            }
            _ => assert_eq!(page, 0),
        }
        previous = Some(report);
    }
}

// ── Input ──

#[tokio::test(flavor = "multi_thread")]
async fn switch_page_is_one_indexed() {
    let rig = rig(vec![
        page(vec![KeyConfig {
            switch_page: Some(2),
            ..Default::default()
        }]),
        page(vec![KeyConfig {
            text: "second".into(),
            ..Default::default()
        }]),
    ]);
    rig.device.set_page(0).await.unwrap();
    rig.device
        .handle_input(InputEvent::KeyPress { index: 0 })
        .await;

    assert_eq!(rig.device.page(), 1);
    assert_eq!(rig.device.info().page, 1);
    assert!(rig.device.cached_image(1, Position::Key(0)).is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn press_button_runs_command() {
    let rig = rig(vec![page(vec![KeyConfig {
        command: "playerctl play-pause".into(),
        ..Default::default()
    }])]);
    rig.device.set_page(0).await.unwrap();
    rig.device.press_button(0).await.unwrap();
    assert_eq!(*rig.launcher.commands.lock(), vec!["playerctl play-pause"]);
    assert!(rig.device.press_button(15).await.is_err());
}

// ── Pages and lifecycle ──

#[tokio::test(flavor = "multi_thread")]
async fn page_switch_stops_old_handlers() {
    let rig = rig(vec![
        page(vec![time_key(), time_key()]),
        page(vec![time_key()]),
    ]);
    rig.device.set_page(0).await.unwrap();
    assert_eq!(rig.device.running_handlers().len(), 2);

    rig.device.set_page(1).await.unwrap();
    assert_eq!(rig.device.running_handlers(), vec![(1, Position::Key(0))]);

    rig.device.set_page(0).await.unwrap();
    assert_eq!(
        rig.device.running_handlers(),
        vec![(0, Position::Key(0)), (0, Position::Key(1))]
    );
}

/// Clock whose `stop` takes a while to come back
struct SlowStopClock(TimeIcon);

impl IconHandler for SlowStopClock {
    fn start(&self, config: HandlerConfig, info: DeckInfo, sink: FrameSink) {
        self.0.start(config, info, sink);
    }

    fn is_running(&self) -> bool {
        self.0.is_running()
    }

    fn set_running(&self, running: bool) {
        self.0.set_running(running);
    }

    fn stop(&self) {
        std::thread::sleep(Duration::from_millis(150));
        self.0.stop();
    }
}

fn slow_clock() -> Arc<dyn IconHandler> {
    Arc::new(SlowStopClock(TimeIcon::new(Surface::Key)))
}

#[tokio::test(flavor = "multi_thread")]
async fn flipping_back_keeps_visible_handler_running() {
    let registry = ModuleRegistry::with_builtins();
    registry.register(Module {
        new_icon: Some(slow_clock),
        ..Module::new("SlowClock")
    });
    let clock = KeyConfig {
        icon_handler: "SlowClock".into(),
        ..Default::default()
    };
    let rig = rig_with(vec![page(vec![clock]), page(vec![])], registry);
    rig.device.set_page(0).await.unwrap();
    rig.device.set_page(1).await.unwrap();
    rig.device.set_page(0).await.unwrap();

    // the stop issued when leaving page 0 has finished by now
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(rig.device.running_handlers(), vec![(0, Position::Key(0))]);
    let before = transfers(&rig.wire);
    tokio::time::sleep(Duration::from_millis(1300)).await;
    assert!(transfers(&rig.wire) > before);
}

/// Emits an empty frame, then an odd-sized red one
struct EmptyThenRed {
    running: AtomicBool,
}

impl IconHandler for EmptyThenRed {
    fn start(&self, _config: HandlerConfig, _info: DeckInfo, sink: FrameSink) {
        self.running.store(true, Ordering::SeqCst);
        sink(RgbaImage::new(0, 0));
        sink(RgbaImage::from_pixel(30, 20, Rgba([255, 0, 0, 255])));
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn empty_then_red() -> Arc<dyn IconHandler> {
    Arc::new(EmptyThenRed {
        running: AtomicBool::new(false),
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_frames_are_dropped() {
    let registry = ModuleRegistry::with_builtins();
    registry.register(Module {
        new_icon: Some(empty_then_red),
        ..Module::new("EmptyThenRed")
    });
    let key = KeyConfig {
        icon_handler: "EmptyThenRed".into(),
        ..Default::default()
    };
    let rig = rig_with(vec![page(vec![key])], registry);
    rig.device.set_page(0).await.unwrap();

    // 14 black keys plus the one red frame
    assert_eq!(transfers(&rig.wire), 15);
    let img = rig.device.cached_image(0, Position::Key(0)).unwrap();
    assert_eq!(img.dimensions(), (72, 72));
    assert!(img.pixels().all(|p| p.0[0] > 200 && p.0[1] < 50));
    assert!(rig.device.is_open());
}

/// Holds the first write until released, then fails every write
#[derive(Clone, Default)]
struct StallingWire {
    entered: Arc<AtomicBool>,
    release: Arc<AtomicBool>,
}

impl ReportWire for StallingWire {
    fn write_report(&mut self, _data: &[u8]) -> Result<usize, TransportError> {
        self.entered.store(true, Ordering::SeqCst);
        while !self.release.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(5));
        }
        Err(TransportError::HidError("hidapi error: No such device".into()))
    }

    fn send_feature_report(&mut self, _data: &[u8]) -> Result<(), TransportError> {
        Ok(())
    }

    fn get_feature_report(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        Ok(buf.len())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn error_from_replaced_deck_keeps_new_one() {
    let services = Arc::new(Services::new(
        Arc::new(ModuleRegistry::with_builtins()),
        Arc::new(Recorder::default()),
        None,
    ));
    let device = VirtualDevice::new(SERIAL, vec![page(vec![])], services);
    let old = StallingWire::default();
    device.attach(deck_on(old.clone()), None);

    let rendering = {
        let device = Arc::clone(&device);
        tokio::spawn(async move { device.set_page(0).await })
    };
    wait_for("write on the old deck", || old.entered.load(Ordering::SeqCst)).await;

    // replug while the old handle is still mid-write
    let wire = MemoryWire::default();
    let fresh = deck_on(wire.clone());
    device.attach(Arc::clone(&fresh), None);
    old.release.store(true, Ordering::SeqCst);
    rendering.await.unwrap().unwrap();

    assert!(device.is_open());
    assert!(device.info().connected);
    assert!(Arc::ptr_eq(&device.deck().unwrap(), &fresh));

    let before = transfers(&wire);
    device.set_page(0).await.unwrap();
    assert_eq!(transfers(&wire), before + 15);
}

#[tokio::test(flavor = "multi_thread")]
async fn device_gone_disconnects_and_stops_handlers() {
    let rig = rig(vec![page(vec![time_key()])]);
    rig.device.set_page(0).await.unwrap();
    assert!(rig.device.is_open());
    assert_eq!(rig.device.running_handlers().len(), 1);

    rig.wire.unplugged.store(true, Ordering::SeqCst);
    // the clock's next tick hits the dead wire
    wait_for("disconnect", || !rig.device.is_open()).await;
    assert!(rig.device.running_handlers().is_empty());
    let info = rig.device.info();
    assert!(!info.connected);
    assert!(info.last_disconnected.is_some());

    // idempotent
    rig.device.disconnect();
    rig.device.shutdown();
    rig.device.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn unlock_rerenders_current_page() {
    let rig = rig(vec![page(vec![])]);
    rig.device.set_page(0).await.unwrap();
    let before = transfers(&rig.wire);

    rig.device.set_locked(true).await;
    rig.device.set_page(0).await.unwrap();
    assert_eq!(transfers(&rig.wire), before);

    rig.device.set_locked(false).await;
    assert_eq!(transfers(&rig.wire), before + 15);
}

// ── Handler state sharing ──

static SEEN_CONFIGS: Mutex<Vec<(&'static str, HandlerConfig)>> = parking_lot::const_mutex(Vec::new());

struct SpyIcon {
    running: AtomicBool,
}

impl IconHandler for SpyIcon {
    fn start(&self, config: HandlerConfig, info: DeckInfo, sink: FrameSink) {
        SEEN_CONFIGS.lock().push(("icon", config));
        self.running.store(true, Ordering::SeqCst);
        sink(RgbaImage::new(info.icon_size, info.icon_size));
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

struct SpyKey;

impl KeyHandler for SpyKey {
    fn handle(&self, config: &HandlerConfig, _info: &DeckInfo, event: &InputEvent) {
        if let InputEvent::KeyPress { .. } = event {
            SEEN_CONFIGS.lock().push(("key", config.clone()));
        }
    }
}

fn spy_icon() -> Arc<dyn IconHandler> {
    Arc::new(SpyIcon {
        running: AtomicBool::new(false),
    })
}

fn spy_key() -> Arc<dyn KeyHandler> {
    Arc::new(SpyKey)
}

fn fields(v: Value) -> Map<String, Value> {
    v.as_object().unwrap().clone()
}

#[tokio::test(flavor = "multi_thread")]
async fn linked_handlers_share_state_and_merge_fields() {
    let registry = ModuleRegistry::new();
    registry.register(Module {
        new_icon: Some(spy_icon),
        new_key: Some(spy_key),
        ..Module::new("Spy")
    });
    let linked = KeyConfig {
        icon_handler: "Spy".into(),
        key_handler: "Spy".into(),
        shared_handler_fields: fields(json!({"a": "shared", "b": "shared"})),
        icon_handler_fields: fields(json!({"b": "icon"})),
        key_handler_fields: fields(json!({"b": "key"})),
        ..Default::default()
    };
    let unlinked = KeyConfig {
        icon_handler: "Spy".into(),
        icon_handler_fields: fields(json!({"b": "icon"})),
        shared_handler_fields: fields(json!({"a": "shared"})),
        ..Default::default()
    };
    let rig = rig_with(vec![page(vec![linked, unlinked])], registry);
    rig.device.set_page(0).await.unwrap();
    rig.device
        .handle_input(InputEvent::KeyPress { index: 0 })
        .await;

    let seen = SEEN_CONFIGS.lock().clone();
    let icons: Vec<&HandlerConfig> = seen
        .iter()
        .filter(|(kind, _)| *kind == "icon")
        .map(|(_, config)| config)
        .collect();
    assert_eq!(icons.len(), 2);
    let key = &seen.iter().find(|(kind, _)| *kind == "key").unwrap().1;

    // render order across positions is not fixed
    let (linked_icon, unlinked_icon) = if icons[0].str_field("a").is_some() {
        (icons[0], icons[1])
    } else {
        (icons[1], icons[0])
    };
    assert_eq!(linked_icon.str_field("a"), Some("shared"));
    assert_eq!(linked_icon.str_field("b"), Some("icon"));
    assert_eq!(key.str_field("a"), Some("shared"));
    assert_eq!(key.str_field("b"), Some("key"));
    assert!(linked_icon.shared.same_as(&key.shared));

    // shared fields only reach linked handlers
    assert_eq!(unlinked_icon.str_field("a"), None);
    assert_eq!(unlinked_icon.str_field("b"), Some("icon"));
    assert!(!unlinked_icon.shared.same_as(&key.shared));
}

// ── Panics ──

static FLAKY_CALLS: AtomicUsize = AtomicUsize::new(0);

struct FlakyKey;

impl KeyHandler for FlakyKey {
    fn handle(&self, _config: &HandlerConfig, _info: &DeckInfo, _event: &InputEvent) {
        FLAKY_CALLS.fetch_add(1, Ordering::SeqCst);
        panic!("handler bug");
    }
}

fn flaky_key() -> Arc<dyn KeyHandler> {
    Arc::new(FlakyKey)
}

#[tokio::test(flavor = "multi_thread")]
async fn panicking_handler_is_retried_then_dropped() {
    let registry = ModuleRegistry::with_builtins();
    registry.register(Module {
        new_key: Some(flaky_key),
        ..Module::new("Flaky")
    });
    let rig = rig_with(
        vec![page(vec![
            KeyConfig {
                key_handler: "Flaky".into(),
                ..Default::default()
            },
            KeyConfig {
                command: "still alive".into(),
                ..Default::default()
            },
        ])],
        registry,
    );
    rig.device.set_page(0).await.unwrap();
    rig.device
        .handle_input(InputEvent::KeyPress { index: 0 })
        .await;
    assert_eq!(FLAKY_CALLS.load(Ordering::SeqCst), 3);

    rig.device
        .handle_input(InputEvent::KeyPress { index: 1 })
        .await;
    assert_eq!(*rig.launcher.commands.lock(), vec!["still alive"]);
}
