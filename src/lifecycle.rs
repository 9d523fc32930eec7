//! Deck lifecycle
//!
//! Polls HID enumeration, binds every deck to its [`VirtualDevice`] by serial
//! and feeds the deck's input into that runtime. A deck that goes away is torn
//! down and picked up again by a later poll, keeping its configuration and
//! handler state.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use deckd_transport::protocol::timing;
use deckd_transport::{
    spawn_input_reader, Deck, DeviceDescriptor, DiscoveredDeck, HidDiscovery, InputDecoder,
    InputEvent, ReportReader, TransportError,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app_context::ApplicationContext;
use crate::config::{ConfigStore, KeyConfig};
use crate::error::DaemonError;
use crate::handler::{DeckInfo, HandlerConfig, SharedState};
use crate::render;
use crate::runtime::{Services, VirtualDevice};

pub const POLL_INTERVAL: Duration = Duration::from_millis(timing::POLL_INTERVAL_MS);

/// Backlight fade when going to sleep or waking up
const SLEEP_FADE: Duration = Duration::from_millis(200);

/// Deadline for a handler preview's first frame
const PREVIEW_TIMEOUT: Duration = Duration::from_secs(5);

/// Where decks come from
pub trait DeckSource: Send + Sync {
    fn list(&self) -> Result<Vec<DiscoveredDeck>, TransportError>;

    /// Open the write side and a reader on the same device
    fn open(&self, deck: &DiscoveredDeck)
        -> Result<(Deck, Box<dyn ReportReader>), TransportError>;
}

impl DeckSource for HidDiscovery {
    fn list(&self) -> Result<Vec<DiscoveredDeck>, TransportError> {
        self.list_devices()
    }

    fn open(
        &self,
        deck: &DiscoveredDeck,
    ) -> Result<(Deck, Box<dyn ReportReader>), TransportError> {
        HidDiscovery::open(self, deck)
    }
}

enum DeckEvent {
    Input(InputEvent),
    /// Reader ended, with the error that ended it
    Exit(Option<TransportError>),
}

/// Owns every known deck
pub struct DeckManager {
    config: Arc<ConfigStore>,
    services: Arc<Services>,
    source: Arc<dyn DeckSource>,
    context: Arc<ApplicationContext>,
    devices: Mutex<BTreeMap<String, Arc<VirtualDevice>>>,
    locked: AtomicBool,
}

impl DeckManager {
    pub fn new(
        config: Arc<ConfigStore>,
        services: Arc<Services>,
        source: Arc<dyn DeckSource>,
        context: Arc<ApplicationContext>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            services,
            source,
            context,
            devices: Mutex::new(BTreeMap::new()),
            locked: AtomicBool::new(false),
        })
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    /// Poll for decks until cancelled, then shut every deck down
    pub async fn run(self: &Arc<Self>, token: CancellationToken) {
        self.follow_applications(token.clone());

        let mut interval = tokio::time::interval(POLL_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    self.scan().await;
                    self.sleep_idle().await;
                }
            }
        }
        self.shutdown();
    }

    fn follow_applications(self: &Arc<Self>, token: CancellationToken) {
        let mut rx = self.context.subscribe();
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let app = rx.borrow_and_update().clone();
                        manager.application_updated(&app).await;
                    }
                }
            }
        });
    }

    /// One enumeration pass: open new decks, reattach returning ones
    pub async fn scan(self: &Arc<Self>) {
        let source = Arc::clone(&self.source);
        let found = match tokio::task::spawn_blocking(move || source.list()).await {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                debug!("Enumeration failed: {}", e);
                return;
            }
            Err(e) => {
                warn!("Enumeration task failed: {}", e);
                return;
            }
        };

        for candidate in found {
            let serial = candidate.info.identity().to_string();
            let existing = self.devices.lock().get(&serial).cloned();
            if existing.as_ref().is_some_and(|d| d.is_open()) {
                continue;
            }
            if let Err(e) = self.open(candidate, existing).await {
                warn!(serial, "Failed to open deck: {}", e);
            }
        }
    }

    async fn open(
        self: &Arc<Self>,
        candidate: DiscoveredDeck,
        existing: Option<Arc<VirtualDevice>>,
    ) -> Result<(), DaemonError> {
        let source = Arc::clone(&self.source);
        let target = candidate.clone();
        let (deck, reader) = tokio::task::spawn_blocking(move || source.open(&target))
            .await
            .map_err(|e| TransportError::Internal(e.to_string()))??;
        let deck = Arc::new(deck);
        let serial = deck.serial().to_string();

        let device = match existing {
            Some(device) => {
                info!(serial, "Reattaching deck");
                device
            }
            None => {
                let pages = self
                    .config
                    .pages_for(&serial, candidate.descriptor.key_count());
                let device = VirtualDevice::new(&serial, pages, Arc::clone(&self.services));
                self.devices.lock().insert(serial.clone(), Arc::clone(&device));
                info!(serial, model = ?candidate.descriptor.model, "Found new deck");
                device
            }
        };

        match deck.firmware_version() {
            Ok(version) => debug!(serial, "Firmware {}", version),
            Err(e) => debug!(serial, "Failed to read firmware version: {}", e),
        }
        deck.reset()?;

        let stop = Arc::new(AtomicBool::new(false));
        device.attach(Arc::clone(&deck), Some(Arc::clone(&stop)));
        self.spawn_reader(&device, candidate.descriptor, reader, stop)?;

        device.adopt(&self.context.current(), self.locked.load(Ordering::SeqCst));
        let page = device.page();
        // an invalid page is logged by the runtime; the deck stays attached
        let _ = device.set_page(page).await;
        Ok(())
    }

    fn spawn_reader(
        &self,
        device: &Arc<VirtualDevice>,
        descriptor: &'static DeviceDescriptor,
        reader: Box<dyn ReportReader>,
        stop: Arc<AtomicBool>,
    ) -> Result<(), DaemonError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let exit_tx = tx.clone();
        spawn_input_reader(
            reader,
            InputDecoder::for_descriptor(descriptor),
            Arc::clone(&stop),
            device.serial().to_string(),
            move |event| {
                let _ = tx.send(DeckEvent::Input(event));
            },
            move |err| {
                let _ = exit_tx.send(DeckEvent::Exit(err));
            },
        )?;

        let device = Arc::clone(device);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    DeckEvent::Input(event) => {
                        if wake(&device).await {
                            debug!(serial = device.serial(), "Woke up, input consumed");
                            continue;
                        }
                        device.handle_input(event).await;
                    }
                    DeckEvent::Exit(err) => {
                        // a raised stop flag means we asked the reader to go
                        if !stop.load(Ordering::Relaxed) {
                            if let Some(e) = err {
                                warn!(serial = device.serial(), "Input reader stopped: {}", e);
                            }
                            device.disconnect();
                        }
                        break;
                    }
                }
            }
        });
        Ok(())
    }

    /// Fade out decks idle for longer than the configured timeout
    async fn sleep_idle(&self) {
        let Some(secs) = self.config.sleep_timeout_secs().filter(|s| *s > 0) else {
            return;
        };
        let timeout = Duration::from_secs(secs);
        for device in self.devices() {
            let Some(deck) = device.deck() else {
                continue;
            };
            if !deck.is_open() || deck.is_asleep() || deck.idle_for() < timeout {
                continue;
            }
            info!(serial = device.serial(), "Idle for {}s, going to sleep", secs);
            match tokio::task::spawn_blocking(move || deck.sleep(SLEEP_FADE)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(serial = device.serial(), "Failed to sleep: {}", e),
                Err(e) => warn!(serial = device.serial(), "Sleep task failed: {}", e),
            }
        }
    }

    pub fn devices(&self) -> Vec<Arc<VirtualDevice>> {
        self.devices.lock().values().cloned().collect()
    }

    pub fn device(&self, serial: &str) -> Result<Arc<VirtualDevice>, DaemonError> {
        self.devices
            .lock()
            .get(serial)
            .cloned()
            .ok_or_else(|| DaemonError::UnknownDevice(serial.to_string()))
    }

    pub fn deck_infos(&self) -> Vec<DeckInfo> {
        self.devices().iter().map(|d| d.info()).collect()
    }

    pub async fn set_page(&self, serial: &str, page: usize) -> Result<(), DaemonError> {
        self.device(serial)?.set_page(page).await
    }

    pub async fn press_button(&self, serial: &str, index: usize) -> Result<(), DaemonError> {
        self.device(serial)?.press_button(index).await
    }

    pub async fn application_updated(&self, app: &str) {
        debug!(app, "Application updated");
        for device in self.devices() {
            device.application_updated(app).await;
        }
    }

    pub async fn set_locked(&self, locked: bool) {
        self.locked.store(locked, Ordering::SeqCst);
        for device in self.devices() {
            device.set_locked(locked).await;
        }
    }

    /// Re-read the config file and apply it to every deck
    pub async fn reload_config(&self) -> Result<(), DaemonError> {
        self.config.reload()?;
        self.apply_config().await;
        Ok(())
    }

    /// Replace the config from JSON (not saved until committed)
    pub async fn set_config(&self, json: &str) -> Result<(), DaemonError> {
        self.config.replace_json(json)?;
        self.apply_config().await;
        Ok(())
    }

    pub fn commit_config(&self) -> Result<(), DaemonError> {
        self.config.save()?;
        info!("Saved config to {}", self.config.path().display());
        Ok(())
    }

    async fn apply_config(&self) {
        for device in self.devices() {
            match self.config.stored_pages(device.serial()) {
                Some(pages) => device.replace_pages(pages).await,
                None => debug!(serial = device.serial(), "No config for deck, keeping pages"),
            }
        }
    }

    /// Render one frame of an icon handler as a PNG data URL
    pub async fn preview(&self, serial: &str, key_json: &str) -> Result<String, DaemonError> {
        let key: KeyConfig = serde_json::from_str(key_json)?;
        let name = key.icon_handler;
        if name.is_empty() || name == "Default" {
            return Err(DaemonError::UnknownHandler(name));
        }
        let info = self.device(serial)?.info();
        let handler = self
            .services
            .registry
            .new_icon(&name)
            .ok_or_else(|| DaemonError::UnknownHandler(name.clone()))?;
        let size = if info.icon_size > 0 { info.icon_size } else { 72 };

        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let config = HandlerConfig::merged(
            &key.shared_handler_fields,
            &key.icon_handler_fields,
            SharedState::new(),
        );
        handler.start(
            config,
            info,
            Arc::new(move |img| {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(img);
                }
            }),
        );
        let frame = tokio::time::timeout(PREVIEW_TIMEOUT, rx).await;
        handler.stop();

        match frame {
            Ok(Ok(img)) => render::png_data_url(&render::fit(img, size, size)),
            _ => Err(DaemonError::PreviewTimeout(name)),
        }
    }

    /// Reset and close every deck
    pub fn shutdown(&self) {
        info!("Shutting down {} decks", self.devices.lock().len());
        for device in self.devices() {
            device.shutdown();
        }
    }
}

/// Wake a sleeping deck, returning whether it was asleep
async fn wake(device: &VirtualDevice) -> bool {
    let Some(deck) = device.deck() else {
        return false;
    };
    deck.touch();
    if !deck.is_asleep() {
        return false;
    }
    match tokio::task::spawn_blocking(move || deck.wake(SLEEP_FADE)).await {
        Ok(Ok(woke)) => woke,
        Ok(Err(e)) => {
            warn!(serial = device.serial(), "Failed to wake deck: {}", e);
            false
        }
        Err(e) => {
            warn!(serial = device.serial(), "Wake task failed: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::testing::RecordingLauncher;
    use crate::config::Config;
    use crate::handler::ModuleRegistry;
    use deckd_transport::device_registry::pid;
    use deckd_transport::{find_descriptor, ReportWire, TransportDeviceInfo, VENDOR_ID};
    use std::sync::mpsc as std_mpsc;

    struct NullWire;

    impl ReportWire for NullWire {
        fn write_report(&mut self, data: &[u8]) -> Result<usize, TransportError> {
            Ok(data.len())
        }

        fn send_feature_report(&mut self, _data: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }

        fn get_feature_report(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
            Ok(buf.len())
        }
    }

    /// Reads scripted reports; dropping the sender unplugs the deck
    struct ScriptedReader(std_mpsc::Receiver<Vec<u8>>);

    impl ReportReader for ScriptedReader {
        fn read_report(&mut self, buf: &mut [u8], timeout_ms: i32) -> Result<usize, TransportError> {
            match self.0.recv_timeout(Duration::from_millis(timeout_ms as u64)) {
                Ok(report) => {
                    let len = report.len().min(buf.len());
                    buf[..len].copy_from_slice(&report[..len]);
                    Ok(len)
                }
                Err(std_mpsc::RecvTimeoutError::Timeout) => Ok(0),
                Err(std_mpsc::RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected),
            }
        }
    }

    #[derive(Default)]
    struct FakeSource {
        present: Mutex<Vec<DiscoveredDeck>>,
        inputs: Mutex<Vec<std_mpsc::Sender<Vec<u8>>>>,
    }

    impl FakeSource {
        fn plug(&self, serial: &str) {
            let descriptor = find_descriptor(VENDOR_ID, pid::MK2).unwrap();
            let info = TransportDeviceInfo::new(VENDOR_ID, pid::MK2, "/dev/hidraw7", Some(serial));
            self.present.lock().push(DiscoveredDeck { info, descriptor });
        }

        fn unplug(&self) {
            self.present.lock().clear();
            self.inputs.lock().clear();
        }
    }

    impl DeckSource for FakeSource {
        fn list(&self) -> Result<Vec<DiscoveredDeck>, TransportError> {
            Ok(self.present.lock().clone())
        }

        fn open(
            &self,
            deck: &DiscoveredDeck,
        ) -> Result<(Deck, Box<dyn ReportReader>), TransportError> {
            let (tx, rx) = std_mpsc::channel();
            self.inputs.lock().push(tx);
            Ok((
                Deck::new(deck.descriptor, deck.info.clone(), Box::new(NullWire)),
                Box::new(ScriptedReader(rx)),
            ))
        }
    }

    fn manager(source: Arc<FakeSource>) -> (Arc<DeckManager>, Arc<ConfigStore>) {
        let path = std::env::temp_dir()
            .join(format!("deckd-lifecycle-{}-{:?}", std::process::id(), std::thread::current().id()))
            .join("config.json");
        let config = Arc::new(ConfigStore::in_memory(path, Config::default()));
        let services = Arc::new(Services::new(
            Arc::new(ModuleRegistry::with_builtins()),
            Arc::new(RecordingLauncher::default()),
            None,
        ));
        let manager = DeckManager::new(
            Arc::clone(&config),
            services,
            source,
            Arc::new(ApplicationContext::new()),
        );
        (manager, config)
    }

    async fn wait_until(mut f: impl FnMut() -> bool) {
        for _ in 0..100 {
            if f() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_attach_unplug_reattach() {
        let source = Arc::new(FakeSource::default());
        source.plug("CL12K1A00042");
        let (manager, config) = manager(Arc::clone(&source));

        manager.scan().await;
        let device = manager.device("CL12K1A00042").unwrap();
        assert!(device.is_open());
        // unseen deck gets one default page of 15 keys
        let pages = config.stored_pages("CL12K1A00042").unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].keys.len(), 15);

        source.unplug();
        wait_until(|| !device.is_open()).await;
        assert!(!manager.deck_infos()[0].connected);

        source.plug("CL12K1A00042");
        manager.scan().await;
        let again = manager.device("CL12K1A00042").unwrap();
        assert!(Arc::ptr_eq(&device, &again));
        assert!(again.is_open());
        assert_eq!(manager.devices().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_preview_time_handler() {
        let source = Arc::new(FakeSource::default());
        source.plug("CL12K1A00042");
        let (manager, _) = manager(source);
        manager.scan().await;

        let url = manager
            .preview("CL12K1A00042", r#"{"icon_handler": "Time"}"#)
            .await
            .unwrap();
        assert!(url.starts_with("data:image/png;base64,"));

        assert!(matches!(
            manager.preview("CL12K1A00042", r#"{"icon_handler": "Default"}"#).await,
            Err(DaemonError::UnknownHandler(_))
        ));
        assert!(matches!(
            manager.preview("CL12K1A00042", r#"{"icon_handler": "Nope"}"#).await,
            Err(DaemonError::UnknownHandler(_))
        ));
        assert!(matches!(
            manager.preview("XX", r#"{"icon_handler": "Time"}"#).await,
            Err(DaemonError::UnknownDevice(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_set_config_replaces_pages() {
        let source = Arc::new(FakeSource::default());
        source.plug("CL12K1A00042");
        let (manager, _) = manager(source);
        manager.scan().await;
        let device = manager.device("CL12K1A00042").unwrap();
        assert_eq!(device.page_count(), 1);

        let json = r#"{"decks": [{"serial": "CL12K1A00042", "pages": [{"keys": []}, {"keys": []}]}]}"#;
        manager.set_config(json).await.unwrap();
        assert_eq!(device.page_count(), 2);
        manager.set_page("CL12K1A00042", 1).await.unwrap();
        assert_eq!(device.page(), 1);
        assert!(manager.set_config("{").await.is_err());
    }
}
