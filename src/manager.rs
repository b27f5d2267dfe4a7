//! Device lifecycle controller.
//!
//! Central orchestrator: every device-mutating operation funnels
//! through here so the per-address invariants hold: one live state
//! per address, one reconnect task, one keep-alive, one pending idle
//! timer per mode, and a connection-in-progress flag that keeps user
//! connects, device-initiated reconnects, and background recovery from
//! racing each other.

use crate::audio::keepalive::KeepAlive;
use crate::audio::mpd::MpdBridge;
use crate::audio::pulse::{
    self, BtSink, PulseFacade, SinkEvent, address_from_sink_name,
};
use crate::bluez::constants::{
    A2DP_SINK_UUID, AUDIO_UUIDS, AVRCP_CONTROLLER_UUID, AVRCP_TARGET_UUID, DEVICE_INTERFACE,
    HFP_UUID, MEDIA_TRANSPORT_INTERFACE,
};
use crate::bluez::device::DeviceHandle;
use crate::bluez::media_player::AvrcpMediaPlayer;
use crate::bluez::profile::NullHfpHandler;
use crate::bluez::watcher::{
    BluezWatcher, DeviceInfo, WatcherEvent, get_bool, get_string, get_uuid_list, iface_props,
};
use crate::config::{AppConfig, RuntimeSettings};
use crate::errors::{Error, Result};
use crate::events::{AvrcpEntry, EventBus, LogRing, MprisEntry, Ring, epoch_secs};
use crate::idle::IdleEngine;
use crate::reconnect::ReconnectScheduler;
use crate::store::{AudioProfile, DeviceRecord, DeviceSettings, DeviceStore, IdleMode, SettingsUpdate};
use log::{debug, info, warn};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

const SERVICES_RESOLVED_TIMEOUT: Duration = Duration::from_secs(10);
const SINK_WAIT_TIMEOUT: Duration = Duration::from_secs(15);
/// Callers waiting on another in-flight connect poll for up to 60 × 500 ms.
const PENDING_CONNECT_POLLS: u32 = 60;
const SCAN_DEBOUNCE: Duration = Duration::from_secs(1);
const SINK_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// MPRIS commands are routed to the device whose AVRCP Status changed
/// within this window.
const AVRCP_DISPATCH_WINDOW: Duration = Duration::from_secs(2);
const MAX_A2DP_ATTEMPTS: u32 = 3;
const FORCE_RECONNECT_RESET: Duration = Duration::from_secs(10);

struct RuntimeState {
    devices: HashMap<String, DeviceHandle>,
    connecting: HashSet<String>,
    suppress_reconnect: HashSet<String>,
    connect_time: HashMap<String, Instant>,
    last_signaled_volume: HashMap<String, u16>,
    a2dp_attempts: HashMap<String, u32>,
    keepalives: HashMap<String, KeepAlive>,
    suspended_sinks: HashSet<String>,
    scanning: bool,
    scan_task: Option<tokio::task::JoinHandle<()>>,
    scan_debounce: Option<tokio::task::JoinHandle<()>>,
    recent_mpris: Ring<MprisEntry>,
    recent_avrcp: Ring<AvrcpEntry>,
    last_sink_snapshot: String,
    last_avrcp_status: Option<(String, Instant)>,
    pending_toasts: Vec<Value>,
    sink_poll_task: Option<tokio::task::JoinHandle<()>>,
    consumer_tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl RuntimeState {
    fn new() -> Self {
        Self {
            devices: HashMap::new(),
            connecting: HashSet::new(),
            suppress_reconnect: HashSet::new(),
            connect_time: HashMap::new(),
            last_signaled_volume: HashMap::new(),
            a2dp_attempts: HashMap::new(),
            keepalives: HashMap::new(),
            suspended_sinks: HashSet::new(),
            scanning: false,
            scan_task: None,
            scan_debounce: None,
            recent_mpris: Ring::new(crate::events::EVENT_RING_CAPACITY),
            recent_avrcp: Ring::new(crate::events::EVENT_RING_CAPACITY),
            last_sink_snapshot: String::new(),
            last_avrcp_status: None,
            pending_toasts: Vec::new(),
            sink_poll_task: None,
            consumer_tasks: Vec::new(),
        }
    }
}

struct Inner {
    config: StdMutex<AppConfig>,
    store: StdMutex<DeviceStore>,
    events: EventBus,
    log_ring: LogRing,
    watcher: BluezWatcher,
    session: bluer::Session,
    adapter_path: String,
    adapter_name: String,
    adapter_address: String,
    pulse: RwLock<Option<PulseFacade>>,
    media_player: AsyncMutex<Option<AvrcpMediaPlayer>>,
    mpris_tx: UnboundedSender<(String, String)>,
    agent: StdMutex<Option<bluer::agent::AgentHandle>>,
    null_hfp: AsyncMutex<Option<NullHfpHandler>>,
    reconnect: ReconnectScheduler,
    idle: IdleEngine,
    mpd: AsyncMutex<HashMap<String, MpdBridge>>,
    state: StdMutex<RuntimeState>,
}

#[derive(Clone)]
pub struct Manager {
    inner: Arc<Inner>,
}

impl Manager {
    /// Full startup sequence: bus, adapter resolution, agent, MPRIS
    /// player, store, null HFP, PulseAudio, reconciliation, reconnect
    /// scheduler, migrations, background loops.
    pub async fn start(mut config: AppConfig, events: EventBus, log_ring: LogRing) -> Result<Self> {
        let conn = zbus::Connection::system().await?;
        info!("Connected to system D-Bus");
        let session = bluer::Session::new().await?;
        let watcher = BluezWatcher::new(conn.clone());

        // One-time migration: legacy hciN adapter spec becomes a MAC.
        if config.bt_adapter_is_legacy_hci() {
            if let Ok(resolved) = watcher.resolve_adapter(&config.bt_adapter).await {
                if resolved.notice.is_none() {
                    info!(
                        "Migrating adapter setting {} -> {}",
                        config.bt_adapter, resolved.address
                    );
                    config.bt_adapter = resolved.address.clone();
                    let _ = config.save_settings();
                }
            }
        }

        let resolved = watcher.resolve_adapter(&config.bt_adapter).await?;
        if !resolved.powered {
            return Err(Error::AdapterNotPowered(resolved.name));
        }
        info!("Using Bluetooth adapter: {} ({})", resolved.path, resolved.address);

        let mut store = DeviceStore::new(config.device_store_path());
        store.load()?;

        let (mpris_tx, mpris_rx) = unbounded_channel();

        let manager = Manager {
            inner: Arc::new(Inner {
                config: StdMutex::new(config),
                store: StdMutex::new(store),
                events,
                log_ring,
                watcher: watcher.clone(),
                session,
                adapter_path: resolved.path.clone(),
                adapter_name: resolved.name.clone(),
                adapter_address: resolved.address.clone(),
                pulse: RwLock::new(None),
                media_player: AsyncMutex::new(None),
                mpris_tx,
                agent: StdMutex::new(None),
                null_hfp: AsyncMutex::new(None),
                reconnect: ReconnectScheduler::new(),
                idle: IdleEngine::new(),
                mpd: AsyncMutex::new(HashMap::new()),
                state: StdMutex::new(RuntimeState::new()),
            }),
        };

        if let Some(notice) = resolved.notice {
            manager.push_toast(&notice, "warning");
        }

        // Pairing agent (Just Works). Failure is not fatal.
        match crate::bluez::agent::register(&manager.inner.session).await {
            Ok(handle) => *manager.inner.agent.lock().unwrap() = Some(handle),
            Err(e) => warn!("Pairing agent registration failed: {e}"),
        }

        // MPRIS player registered against the adapter's Media1.
        {
            let mut player = AvrcpMediaPlayer::new(conn.clone(), &resolved.path);
            match player.register(manager.inner.mpris_tx.clone()).await {
                Ok(()) => *manager.inner.media_player.lock().await = Some(player),
                Err(e) => warn!("AVRCP media player registration failed: {e}"),
            }
        }

        // Null HFP handler, unless a stored device wants HFP audio.
        let any_hfp = {
            let store = manager.inner.store.lock().unwrap();
            store.devices().iter().any(|d| d.settings.audio_profile == AudioProfile::Hfp)
        };
        if any_hfp {
            info!("Skipping null HFP handler — a stored device uses the HFP profile");
        } else {
            match NullHfpHandler::register(&manager.inner.session).await {
                Ok(handler) => *manager.inner.null_hfp.lock().await = Some(handler),
                Err(e) => warn!("Failed to register null HFP handler: {e} (HFP may still work)"),
            }
        }

        // PulseAudio. The daemon keeps running with a null sink view
        // when the audio server is away.
        let pulse_server = manager.inner.config.lock().unwrap().pulse_server.clone();
        match PulseFacade::connect(pulse_server).await {
            Ok((facade, sink_events)) => {
                *manager.inner.pulse.write().unwrap() = Some(facade);
                let m = manager.clone();
                manager.track_task(tokio::spawn(async move {
                    m.consume_sink_events(sink_events).await;
                }));
            }
            Err(e) => warn!("PulseAudio connection failed (will retry): {e}"),
        }

        // Signal stream + consumers.
        let (watch_tx, watch_rx) = unbounded_channel();
        manager.track_task(watcher.spawn_stream(watch_tx));
        {
            let m = manager.clone();
            manager.track_task(tokio::spawn(async move {
                m.consume_watcher_events(watch_rx).await;
            }));
        }
        {
            let m = manager.clone();
            manager.track_task(tokio::spawn(async move {
                m.consume_mpris_commands(mpris_rx).await;
            }));
        }

        let connected_at_startup = manager.reconcile().await;

        manager.inner.reconnect.start();
        let auto_connect: Vec<String> = {
            let store = manager.inner.store.lock().unwrap();
            store.auto_connect_devices().iter().map(|d| d.address.clone()).collect()
        };
        manager.inner.reconnect.reconnect_all(&manager, auto_connect);

        manager.migrate_global_keepalive();

        // Kick idle handling and bridges for devices that arrived
        // connected, and opportunistically rebind their AVRCP sessions
        // (they still reference the previous daemon's bus name).
        for address in connected_at_startup {
            manager.start_keepalive_if_enabled(&address).await;
            manager.start_mpd_if_enabled(&address).await;
            let settings = manager.device_settings(&address);
            if settings.avrcp_enabled {
                let m = manager.clone();
                tokio::spawn(async move {
                    m.refresh_avrcp_session(&address).await;
                });
            }
        }

        // Periodic sink polling (PA state transitions that produce no
        // D-Bus traffic).
        {
            let m = manager.clone();
            let task = tokio::spawn(async move { m.sink_poll_loop().await });
            manager.inner.state.lock().unwrap().sink_poll_task = Some(task);
        }

        info!("Bluetooth audio manager started successfully");
        Ok(manager)
    }

    fn track_task(&self, task: tokio::task::JoinHandle<()>) {
        self.inner.state.lock().unwrap().consumer_tasks.push(task);
    }

    /// Startup reconciliation. Returns addresses found connected.
    async fn reconcile(&self) -> Vec<String> {
        let mut connected_at_startup = Vec::new();

        // Stored devices: create live state, re-apply profile policy if
        // the link survived a daemon restart.
        let records: Vec<DeviceRecord> =
            self.inner.store.lock().unwrap().devices().to_vec();
        for record in &records {
            let address = record.address.clone();
            match self.get_or_create_device(&address).await {
                Ok(device) => {
                    if device.is_connected().await {
                        info!("Device {address} already connected at startup");
                        {
                            let mut state = self.inner.state.lock().unwrap();
                            state.last_signaled_volume.remove(&address);
                            state.connect_time.insert(address.clone(), Instant::now());
                        }
                        self.apply_profile_policy(&address, &device).await;
                        connected_at_startup.push(address);
                    }
                }
                Err(e) => debug!("Could not initialize stored device {address}: {e}"),
            }
        }

        // Stale BlueZ device cache: unpaired, disconnected audio
        // devices we never stored are leftovers of old scans.
        if let Ok(objects) = self.inner.watcher.get_managed_objects().await {
            let stored: HashSet<String> =
                records.iter().map(|r| r.address.clone()).collect();
            for (path, interfaces) in &objects {
                let Some(props) = iface_props(interfaces, DEVICE_INTERFACE) else { continue };
                let Some(address) = get_string(props, "Address") else { continue };
                let paired = get_bool(props, "Paired").unwrap_or(false);
                let connected = get_bool(props, "Connected").unwrap_or(false);
                if stored.contains(&address) || paired || connected {
                    continue;
                }
                let uuids = get_uuid_list(props, "UUIDs");
                if !uuids.iter().any(|u| AUDIO_UUIDS.contains(u)) {
                    continue;
                }
                debug!("Removing stale cached device {address} ({path})");
                let _ = self.inner.watcher.remove_device_any_adapter(&address).await;
            }

            // Devices connected at the bus level but untracked (store
            // wiped, or paired outside the daemon): adopt them.
            for (path, interfaces) in &objects {
                let Some(props) = iface_props(interfaces, DEVICE_INTERFACE) else { continue };
                if !path.as_str().starts_with(&format!("{}/", self.inner.adapter_path)) {
                    continue;
                }
                let Some(address) = get_string(props, "Address") else { continue };
                if !get_bool(props, "Connected").unwrap_or(false) {
                    continue;
                }
                let already_tracked =
                    self.inner.state.lock().unwrap().devices.contains_key(&address);
                if already_tracked {
                    continue;
                }
                info!("Found connected device {address} not yet tracked — initializing");
                match self.get_or_create_device(&address).await {
                    Ok(device) => {
                        self.inner
                            .state
                            .lock()
                            .unwrap()
                            .connect_time
                            .insert(address.clone(), Instant::now());
                        self.apply_profile_policy(&address, &device).await;
                        connected_at_startup.push(address);
                    }
                    Err(e) => debug!("Could not initialize unmanaged device {address}: {e}"),
                }
            }

            // A transport already active at startup produces no State
            // signal; claim "Playing" so the speaker re-enables its
            // AVRCP volume buttons.
            for (path, interfaces) in &objects {
                let Some(props) = iface_props(interfaces, MEDIA_TRANSPORT_INTERFACE) else {
                    continue;
                };
                if get_string(props, "State").as_deref() != Some("active") {
                    continue;
                }
                let owner = crate::bluez::constants::path_to_address(path.as_str());
                let avrcp_enabled =
                    owner.map(|a| self.device_settings(&a).avrcp_enabled).unwrap_or(false);
                if avrcp_enabled {
                    info!(
                        "Active A2DP transport found at startup ({path}) — setting PlaybackStatus=Playing"
                    );
                    self.set_playback_status("Playing").await;
                    break;
                }
            }
        }

        connected_at_startup.sort();
        connected_at_startup.dedup();
        connected_at_startup
    }

    /// One-time migration of the historical global keep-alive flag onto
    /// every stored device, gated by a marker file.
    fn migrate_global_keepalive(&self) {
        let (marker, options_path) = {
            let config = self.inner.config.lock().unwrap();
            (config.keepalive_migration_marker(), config.options_path())
        };
        if marker.exists() {
            return;
        }
        let options: Value = std::fs::read_to_string(&options_path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();
        if options.get("keep_alive_enabled").and_then(Value::as_bool).unwrap_or(false) {
            let method = match options.get("keep_alive_method").and_then(Value::as_str) {
                Some("silence") => crate::store::KeepAliveMethod::Silence,
                _ => crate::store::KeepAliveMethod::Infrasound,
            };
            info!("Migrating global keep-alive (method={method:?}) to per-device settings");
            let mut store = self.inner.store.lock().unwrap();
            let addresses: Vec<String> =
                store.devices().iter().map(|d| d.address.clone()).collect();
            for address in addresses {
                store.update_settings(
                    &address,
                    &SettingsUpdate {
                        idle_mode: Some(IdleMode::KeepAlive),
                        keep_alive_method: Some(method),
                        ..Default::default()
                    },
                );
            }
        }
        if let Err(e) = std::fs::write(&marker, "migrated") {
            warn!("Keep-alive migration marker write failed (non-fatal): {e}");
        }
    }

    // ── Accessors ──

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn reconnect_scheduler(&self) -> &ReconnectScheduler {
        &self.inner.reconnect
    }

    pub fn runtime_settings(&self) -> RuntimeSettings {
        self.inner.config.lock().unwrap().runtime.clone()
    }

    pub fn adapter_info(&self) -> (String, String, String) {
        (
            self.inner.adapter_name.clone(),
            self.inner.adapter_path.clone(),
            self.inner.adapter_address.clone(),
        )
    }

    pub fn configured_adapter(&self) -> String {
        self.inner.config.lock().unwrap().bt_adapter.clone()
    }

    fn pulse(&self) -> Option<PulseFacade> {
        self.inner.pulse.read().unwrap().clone()
    }

    fn device_settings(&self, address: &str) -> DeviceSettings {
        self.inner.store.lock().unwrap().settings(address)
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.state.lock().unwrap().scanning
    }

    fn is_connecting(&self, address: &str) -> bool {
        self.inner.state.lock().unwrap().connecting.contains(address)
    }

    pub async fn is_device_connected(&self, address: &str) -> bool {
        match self.get_or_create_device(address).await {
            Ok(device) => device.is_connected().await,
            Err(_) => false,
        }
    }

    pub fn broadcast_status(&self, message: &str) {
        self.inner.events.emit_status(message);
    }

    fn push_toast(&self, message: &str, level: &str) {
        self.inner
            .state
            .lock()
            .unwrap()
            .pending_toasts
            .push(json!({"message": message, "level": level}));
    }

    async fn set_playback_status(&self, status: &str) {
        let player = self.inner.media_player.lock().await;
        if let Some(player) = player.as_ref() {
            if let Err(e) = player.set_playback_status(status).await {
                debug!("set_playback_status failed: {e}");
            }
        }
    }

    /// Get the live handle for an address, creating it (and resolving
    /// the owning adapter through the object tree) if needed.
    async fn get_or_create_device(&self, address: &str) -> Result<DeviceHandle> {
        if let Some(device) = self.inner.state.lock().unwrap().devices.get(address) {
            return Ok(device.clone());
        }
        let adapters =
            self.inner.watcher.find_device_adapters(address, &self.inner.adapter_path).await;
        let adapter_path =
            adapters.first().cloned().unwrap_or_else(|| self.inner.adapter_path.clone());
        if adapter_path != self.inner.adapter_path {
            info!(
                "Device {address} is on {adapter_path} (configured: {})",
                self.inner.adapter_path
            );
        }
        let adapter_name =
            adapter_path.rsplit('/').next().unwrap_or(self.inner.adapter_name.as_str());
        let adapter = self.inner.session.adapter(adapter_name)?;
        let addr: bluer::Address = address
            .parse()
            .map_err(|_| Error::InvalidRequest(format!("invalid Bluetooth address {address}")))?;
        let device = adapter.device(addr)?;
        let handle =
            DeviceHandle::new(address, &adapter_path, device, self.inner.watcher.clone());
        self.inner
            .state
            .lock()
            .unwrap()
            .devices
            .entry(address.to_string())
            .or_insert_with(|| handle.clone());
        Ok(handle)
    }

    // ── Scan ──

    /// Start (or restart) a discovery session; returns immediately.
    pub async fn start_scan(&self, duration: Option<u64>) {
        let duration = duration.unwrap_or_else(|| self.runtime_settings().scan_duration_seconds);

        // A second scan call cancels the prior session cleanly.
        let prior = {
            let mut state = self.inner.state.lock().unwrap();
            let prior = state.scan_task.take();
            if let Some(debounce) = state.scan_debounce.take() {
                debounce.abort();
            }
            state.scanning = false;
            prior
        };
        if let Some(task) = prior {
            if !task.is_finished() {
                info!("Scan already running — restarting");
                task.abort();
                let _ = task.await;
                let _ = self.inner.watcher.stop_discovery(&self.inner.adapter_path).await;
            }
        }

        self.inner.state.lock().unwrap().scanning = true;
        self.inner.events.emit("scan_started", json!({"duration": duration}));
        let m = self.clone();
        let task = tokio::spawn(async move { m.run_scan(duration).await });
        self.inner.state.lock().unwrap().scan_task = Some(task);
    }

    async fn run_scan(&self, duration: u64) {
        if let Err(e) = self.inner.watcher.start_discovery(&self.inner.adapter_path).await {
            warn!("Scan failed: {e}");
            let mut state = self.inner.state.lock().unwrap();
            state.scanning = false;
            drop(state);
            self.inner
                .events
                .emit("scan_finished", json!({"error": e.friendly_message()}));
            return;
        }
        tokio::time::sleep(Duration::from_secs(duration)).await;

        {
            let mut state = self.inner.state.lock().unwrap();
            state.scanning = false;
            if let Some(debounce) = state.scan_debounce.take() {
                debounce.abort();
            }
        }
        let _ = self.inner.watcher.stop_discovery(&self.inner.adapter_path).await;
        self.broadcast_devices().await;
        self.inner.events.emit("scan_finished", json!({}));
    }

    /// Debounced device broadcast while scanning, so a burst of D-Bus
    /// signals becomes one ObjectManager query.
    fn schedule_scan_broadcast(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if !state.scanning {
            return;
        }
        if state.scan_debounce.as_ref().is_some_and(|t| !t.is_finished()) {
            return; // already scheduled
        }
        let m = self.clone();
        state.scan_debounce = Some(tokio::spawn(async move {
            tokio::time::sleep(SCAN_DEBOUNCE).await;
            if m.is_scanning() {
                m.broadcast_devices().await;
            }
        }));
    }

    // ── Lifecycle operations ──

    /// Pair, trust, persist, then connect. Idempotent over re-pairs.
    pub async fn pair_device(&self, address: &str) -> Result<Value> {
        self.broadcast_status(&format!("Pairing with {address}..."));
        // connection_in_progress goes up before the BlueZ pair call:
        // the Connected signal fired mid-pair must not race the
        // follow-on connect.
        {
            let mut state = self.inner.state.lock().unwrap();
            state.a2dp_attempts.remove(address);
            state.connecting.insert(address.to_string());
        }

        let result: Result<Value> = async {
            let device = self.get_or_create_device(address).await?;
            device.pair().await?;
            device.set_trusted(true).await?;
            let name = device.name().await;
            self.inner.store.lock().unwrap().add_device(address, &name, true);
            info!("Device {address} ({name}) paired and stored");
            self.broadcast_all().await;

            let connected = self.connect_inner(address, true).await?;
            Ok(json!({"address": address, "name": name, "connected": connected}))
        }
        .await;

        if result.is_err() {
            self.inner.state.lock().unwrap().connecting.remove(address);
            self.broadcast_status("");
        }
        result
    }

    pub async fn connect_device(&self, address: &str) -> Result<bool> {
        self.connect_inner(address, false).await
    }

    async fn connect_inner(&self, address: &str, from_pair: bool) -> Result<bool> {
        // Another connect in flight: wait for it instead of racing.
        if !from_pair && self.is_connecting(address) {
            info!("Connection already in progress for {address}, waiting...");
            self.broadcast_status(&format!("Waiting for connection to {address}..."));
            for _ in 0..PENDING_CONNECT_POLLS {
                tokio::time::sleep(Duration::from_millis(500)).await;
                if !self.is_connecting(address) {
                    break;
                }
            }
            let connected = self.is_device_connected(address).await;
            let has_sink = match self.pulse() {
                Some(pulse) => pulse.get_sink_for_address(address).await.is_some(),
                None => connected,
            };
            self.broadcast_all().await;
            return Ok(connected && has_sink);
        }

        self.inner.reconnect.cancel(address);
        {
            let mut state = self.inner.state.lock().unwrap();
            state.suppress_reconnect.remove(address);
            state.connecting.insert(address.to_string());
        }
        self.broadcast_status(&format!("Connecting to {address}..."));

        let result = self.do_connect(address).await;

        self.inner.state.lock().unwrap().connecting.remove(address);
        self.broadcast_status("");
        result
    }

    async fn do_connect(&self, address: &str) -> Result<bool> {
        let device = self.get_or_create_device(address).await?;

        // Always issue Connect: pair's auto-connect only brings up the
        // link layer, the audio profiles need the explicit call.
        match device.connect().await {
            Ok(()) => {}
            Err(Error::Bluetooth(ref e)) if e.kind == bluer::ErrorKind::AlreadyConnected => {
                info!("Device {address} already connected, continuing with profile setup");
            }
            Err(e) => return Err(e),
        }

        self.broadcast_status(&format!("Waiting for services on {address}..."));
        device.wait_for_services(SERVICES_RESOLVED_TIMEOUT).await;

        let settings = self.device_settings(address);
        if settings.avrcp_enabled {
            if let Some(events) = device.watch_media_player().await {
                self.emit_avrcp_snapshot(address, events);
            }
        }

        let Some(pulse) = self.pulse() else {
            // PulseAudio away: the link may still be fine at BlueZ level.
            self.broadcast_all().await;
            return Ok(device.is_connected().await);
        };

        self.apply_audio_profile(address, &device, &settings, &pulse).await;

        self.broadcast_status(&format!("Waiting for audio sink for {address}..."));
        let probe = device.clone();
        let sink = pulse
            .wait_for_bt_sink(address, SINK_WAIT_TIMEOUT, move || {
                let probe = probe.clone();
                async move { probe.is_connected().await }
            })
            .await;
        let Some(sink) = sink else {
            warn!("Audio sink for {address} did not appear in PulseAudio");
            self.broadcast_all().await;
            return Ok(false);
        };

        // HFP teardown only after A2DP is up; some speakers drop the
        // whole connection when HFP is the only live profile.
        if settings.audio_profile == AudioProfile::A2dp {
            self.disconnect_hfp(address).await;
        }

        // Route host audio at the freshly connected speaker.
        pulse.set_default_sink(&sink).await;

        self.start_keepalive_if_enabled(address).await;
        self.start_mpd_if_enabled(address).await;
        self.broadcast_all().await;
        Ok(true)
    }

    async fn apply_audio_profile(
        &self,
        address: &str,
        device: &DeviceHandle,
        settings: &DeviceSettings,
        pulse: &PulseFacade,
    ) {
        match settings.audio_profile {
            AudioProfile::A2dp => {
                if !pulse.activate_bt_card_profile(address, AudioProfile::A2dp).await {
                    debug!("A2DP card profile not yet activatable for {address}");
                }
            }
            AudioProfile::Hfp => self.activate_hfp_with_escalation(address, device, pulse).await,
        }
    }

    /// HFP activation escalation: PA set → explicit ConnectProfile →
    /// PA retry → bluez module reload → full reconnect → PA retry.
    async fn activate_hfp_with_escalation(
        &self,
        address: &str,
        device: &DeviceHandle,
        pulse: &PulseFacade,
    ) {
        if pulse.activate_bt_card_profile(address, AudioProfile::Hfp).await {
            return;
        }
        info!("HFP activation for {address}: escalating with ConnectProfile");
        let _ = device.connect_profile(HFP_UUID).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        if pulse.activate_bt_card_profile(address, AudioProfile::Hfp).await {
            return;
        }
        info!("HFP activation for {address}: reloading PulseAudio bluez module");
        if pulse::reload_bluez_module().await {
            // The reload can drop bluez clients; refresh our connection
            // before retrying.
            pulse.reconnect().await;
            tokio::time::sleep(Duration::from_secs(2)).await;
            if pulse.activate_bt_card_profile(address, AudioProfile::Hfp).await {
                return;
            }
        }
        info!("HFP activation for {address}: full reconnect cycle");
        let _ = device.disconnect().await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        if device.connect().await.is_ok() {
            device.wait_for_services(SERVICES_RESOLVED_TIMEOUT).await;
            tokio::time::sleep(Duration::from_secs(1)).await;
            if !pulse.activate_bt_card_profile(address, AudioProfile::Hfp).await {
                warn!("HFP profile activation failed for {address} after escalation");
            }
        }
    }

    pub async fn disconnect_device(&self, address: &str) -> Result<()> {
        self.broadcast_status(&format!("Disconnecting {address}..."));
        self.inner.reconnect.cancel(address);
        self.inner.state.lock().unwrap().suppress_reconnect.insert(address.to_string());

        match self.get_or_create_device(address).await {
            Ok(device) => {
                let _ = device.disconnect().await;
            }
            Err(e) => warn!("Disconnect failed for {address}: {e}"),
        }
        self.inner.idle.cancel_pending(address);
        self.stop_keepalive(address).await;
        self.stop_mpd(address).await;
        self.broadcast_status("");
        self.broadcast_all().await;
        Ok(())
    }

    /// Disconnect, give the radio a reset window, reconnect. Recovery
    /// for zombie connections.
    pub async fn force_reconnect_device(&self, address: &str) -> Result<bool> {
        self.broadcast_status(&format!("Force reconnecting {address}..."));
        if let Err(e) = self.disconnect_device(address).await {
            warn!("Force reconnect: disconnect failed for {address}: {e} (continuing)");
        }
        self.broadcast_status(&format!("Waiting for {address} to reset..."));
        tokio::time::sleep(FORCE_RECONNECT_RESET).await;
        self.broadcast_status(&format!("Reconnecting to {address}..."));
        self.connect_device(address).await
    }

    pub async fn forget_device(&self, address: &str) -> Result<()> {
        self.broadcast_status(&format!("Forgetting {address}..."));
        self.inner.reconnect.cancel(address);
        self.inner.idle.cancel_pending(address);
        self.stop_keepalive(address).await;
        self.stop_mpd(address).await;

        let device = {
            let mut state = self.inner.state.lock().unwrap();
            state.a2dp_attempts.remove(address);
            state.connect_time.remove(address);
            state.last_signaled_volume.remove(address);
            state.suppress_reconnect.remove(address);
            state.devices.remove(address)
        };
        match device {
            Some(device) => {
                let _ = device.disconnect().await;
            }
            None => {
                if let Ok(device) = self.get_or_create_device(address).await {
                    let _ = device.disconnect().await;
                    self.inner.state.lock().unwrap().devices.remove(address);
                }
            }
        }

        let _ = self.inner.watcher.remove_device_any_adapter(address).await;
        {
            let mut store = self.inner.store.lock().unwrap();
            store.release_mpd_port(address);
            store.remove_device(address);
        }
        info!("Device {address} forgotten");
        self.broadcast_status("");
        self.broadcast_all().await;
        Ok(())
    }

    /// Disconnect and remove everything; used before switching
    /// adapters so the next session starts fresh.
    pub async fn clear_all(&self) -> Result<()> {
        self.broadcast_status("Clearing all devices...");
        self.inner.reconnect.stop().await;
        self.inner.idle.shutdown().await;

        let addresses: Vec<String> = {
            let store = self.inner.store.lock().unwrap();
            let state = self.inner.state.lock().unwrap();
            store
                .devices()
                .iter()
                .map(|d| d.address.clone())
                .chain(state.devices.keys().cloned())
                .collect::<HashSet<_>>()
                .into_iter()
                .collect()
        };

        for address in &addresses {
            self.broadcast_status(&format!("Disconnecting {address}..."));
            self.stop_keepalive(address).await;
            self.stop_mpd(address).await;
            if let Ok(device) = self.get_or_create_device(address).await {
                let _ = device.disconnect().await;
            }
            self.broadcast_status(&format!("Removing {address}..."));
            let _ = self.inner.watcher.remove_device_any_adapter(address).await;
        }

        self.inner.store.lock().unwrap().clear();
        {
            let mut state = self.inner.state.lock().unwrap();
            state.devices.clear();
            state.connecting.clear();
            state.suppress_reconnect.clear();
            state.connect_time.clear();
            state.last_signaled_volume.clear();
            state.a2dp_attempts.clear();
            state.suspended_sinks.clear();
        }
        self.inner.reconnect.start();
        self.broadcast_status("All devices cleared");
        self.broadcast_all().await;
        Ok(())
    }

    /// Persist a new adapter selection (`clean` wipes devices first).
    /// Takes effect on restart.
    pub async fn set_adapter(&self, adapter: &str, clean: bool) -> Result<()> {
        if clean {
            self.clear_all().await?;
        }
        let mut config = self.inner.config.lock().unwrap();
        config.bt_adapter = adapter.to_string();
        config.save_settings()?;
        info!("Adapter selection changed to {adapter} (restart required, clean={clean})");
        Ok(())
    }

    // ── Profile policy ──

    async fn apply_profile_policy(&self, address: &str, device: &DeviceHandle) {
        let settings = self.device_settings(address);
        if let Some(pulse) = self.pulse() {
            self.apply_audio_profile(address, device, &settings, &pulse).await;
        }
        if settings.audio_profile == AudioProfile::A2dp {
            self.disconnect_hfp(address).await;
        }
    }

    /// Drop HFP so the speaker falls back to AVRCP absolute volume
    /// (BlueZ does not map HFP AT+VGS onto the media transport).
    async fn disconnect_hfp(&self, address: &str) -> bool {
        match self.get_or_create_device(address).await {
            Ok(device) => match device.disconnect_profile(HFP_UUID).await {
                Ok(ok) => {
                    if ok {
                        info!("HFP disconnected for {address} — speaker should use AVRCP volume");
                    }
                    ok
                }
                Err(e) => {
                    warn!("HFP disconnect failed for {address}: {e}");
                    false
                }
            },
            Err(e) => {
                warn!("HFP disconnect: cannot access device {address}: {e}");
                false
            }
        }
    }

    /// Transport presence check with a few retries (BlueZ may still be
    /// setting the transport up when Connected fires).
    async fn find_transport(&self, address: &str) -> bool {
        let fragment = format!("dev_{}", address.replace(':', "_").to_uppercase());
        for attempt in 0..3 {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
            if let Ok(objects) = self.inner.watcher.get_managed_objects().await {
                for (path, interfaces) in &objects {
                    if path.as_str().to_uppercase().contains(&fragment)
                        && iface_props(interfaces, MEDIA_TRANSPORT_INTERFACE).is_some()
                    {
                        debug!("MediaTransport1 for {address}: {path}");
                        return true;
                    }
                }
            }
        }
        info!("No MediaTransport1 found for {address} after 3 attempts");
        false
    }

    /// Make sure a connected A2DP device actually has an audio
    /// transport; devices reconnecting on their own sometimes come up
    /// LE-only. Tracks consecutive failures so a stubborn device cannot
    /// loop the recovery cycle forever.
    async fn ensure_a2dp_transport(&self, address: &str) -> bool {
        if self.find_transport(address).await {
            self.inner.state.lock().unwrap().a2dp_attempts.remove(address);
            return true;
        }

        let attempts = {
            let state = self.inner.state.lock().unwrap();
            *state.a2dp_attempts.get(address).unwrap_or(&0)
        };
        if attempts >= MAX_A2DP_ATTEMPTS {
            warn!(
                "A2DP transport activation for {address} failed after {attempts} attempts — giving up"
            );
            return false;
        }
        self.inner
            .state
            .lock()
            .unwrap()
            .a2dp_attempts
            .insert(address.to_string(), attempts + 1);

        let Ok(device) = self.get_or_create_device(address).await else {
            return false;
        };
        let uuids = device.uuids().await;
        if !uuids.contains(&A2DP_SINK_UUID) {
            warn!("Device {address} does not advertise A2DP Sink UUID — cannot activate audio");
            return false;
        }

        info!("No A2DP transport for {address}, trying ConnectProfile(A2DP_SINK)...");
        if device.connect_profile(A2DP_SINK_UUID).await.is_ok() {
            tokio::time::sleep(Duration::from_secs(3)).await;
            if self.find_transport(address).await {
                self.inner.state.lock().unwrap().a2dp_attempts.remove(address);
                return true;
            }
        }

        // Likely stuck in LE-only mode; a full disconnect/connect cycle
        // re-establishes both bearers.
        info!("A2DP still missing for {address}, trying full disconnect/reconnect cycle...");
        self.inner.state.lock().unwrap().connecting.insert(address.to_string());
        let found = async {
            let _ = device.disconnect().await;
            tokio::time::sleep(Duration::from_secs(2)).await;
            if let Err(e) = device.connect().await {
                warn!("Disconnect/reconnect cycle failed for {address}: {e}");
                return false;
            }
            device.wait_for_services(SERVICES_RESOLVED_TIMEOUT).await;
            tokio::time::sleep(Duration::from_secs(3)).await;
            self.find_transport(address).await
        }
        .await;
        self.inner.state.lock().unwrap().connecting.remove(address);
        if found {
            self.inner.state.lock().unwrap().a2dp_attempts.remove(address);
        }
        found
    }

    /// After a daemon restart the speaker's AVRCP session still points
    /// at the old bus name. Cycle the AVRCP profiles, bounce the ACL,
    /// and re-register the MPRIS player to rebind it.
    async fn refresh_avrcp_session(&self, address: &str) {
        let Ok(device) = self.get_or_create_device(address).await else {
            warn!("AVRCP refresh: cannot access device {address}");
            return;
        };
        info!("AVRCP refresh: cycling AVRCP profiles for {address}...");
        {
            let mut state = self.inner.state.lock().unwrap();
            state.connecting.insert(address.to_string());
            state.suppress_reconnect.insert(address.to_string());
        }

        for uuid in [AVRCP_TARGET_UUID, AVRCP_CONTROLLER_UUID] {
            let _ = device.disconnect_profile(uuid).await;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        for uuid in [AVRCP_TARGET_UUID, AVRCP_CONTROLLER_UUID] {
            let _ = device.connect_profile(uuid).await;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;

        let _ = device.disconnect().await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        if let Err(e) = device.connect().await {
            warn!("AVRCP refresh: reconnect failed for {address}: {e}");
        } else {
            device.wait_for_services(SERVICES_RESOLVED_TIMEOUT).await;
        }

        {
            let mut player = self.inner.media_player.lock().await;
            if let Some(player) = player.as_mut() {
                let _ = player.unregister().await;
                tokio::time::sleep(Duration::from_millis(500)).await;
                if let Err(e) = player.register(self.inner.mpris_tx.clone()).await {
                    warn!("AVRCP refresh: MPRIS re-register failed: {e}");
                }
            }
        }

        device.reset_avrcp_watch();
        if let Some(events) = device.watch_media_player().await {
            self.emit_avrcp_snapshot(address, events);
        }
        {
            let mut state = self.inner.state.lock().unwrap();
            state.connecting.remove(address);
            state.suppress_reconnect.remove(address);
        }
        info!("AVRCP refresh for {address} done");
    }

    // ── Event handling ──

    async fn consume_watcher_events(&self, mut rx: UnboundedReceiver<WatcherEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                WatcherEvent::InterfacesAdded { path, has_device } => {
                    if has_device && self.is_scanning() {
                        info!("New device discovered during scan: {path}");
                        self.schedule_scan_broadcast();
                    }
                }
                WatcherEvent::DeviceRefreshed { .. } => {
                    if self.is_scanning() {
                        self.schedule_scan_broadcast();
                    }
                }
                WatcherEvent::DeviceConnected { address } => {
                    self.on_device_connected(&address).await;
                }
                WatcherEvent::DeviceDisconnected { address } => {
                    self.on_device_disconnected(&address).await;
                }
                WatcherEvent::TransportVolume { address, volume } => {
                    self.on_transport_volume(&address, volume);
                }
                WatcherEvent::TransportState { address, state } => {
                    if state == "active" {
                        let avrcp_enabled = self.device_settings(&address).avrcp_enabled;
                        if avrcp_enabled {
                            self.set_playback_status("Playing").await;
                        }
                    }
                }
                WatcherEvent::MediaPlayerChanged { path, changed } => {
                    self.on_media_player_changed(&path, changed);
                }
                WatcherEvent::InterfacesRemoved { .. } => {}
                WatcherEvent::Resynced => {
                    warn!("BlueZ event stream resynced — refreshing state");
                    self.broadcast_all().await;
                }
            }
        }
    }

    async fn on_device_connected(&self, address: &str) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.connect_time.insert(address.to_string(), Instant::now());
            state.last_signaled_volume.remove(address);
        }
        self.broadcast_all().await;

        // A connect or recovery cycle is driving this device already.
        if self.is_connecting(address) {
            debug!("Skipping auto setup for {address} (connect/cycle in progress)");
            return;
        }

        // Device-side reconnect clears a standing user-disconnect
        // suppression: the user's intent was overridden by the device.
        self.inner.state.lock().unwrap().suppress_reconnect.remove(address);

        let m = self.clone();
        let address = address.to_string();
        tokio::spawn(async move {
            let settings = m.device_settings(&address);
            if let Ok(device) = m.get_or_create_device(&address).await {
                if settings.avrcp_enabled {
                    if let Some(events) = device.watch_media_player().await {
                        m.emit_avrcp_snapshot(&address, events);
                    }
                }
            }
            if settings.audio_profile == AudioProfile::A2dp {
                m.disconnect_hfp(&address).await;
                m.ensure_a2dp_transport(&address).await;
            }
            m.start_keepalive_if_enabled(&address).await;
            m.start_mpd_if_enabled(&address).await;
        });
    }

    async fn on_device_disconnected(&self, address: &str) {
        let suppressed = {
            let mut state = self.inner.state.lock().unwrap();
            state.connect_time.remove(address);
            state.last_signaled_volume.remove(address);
            state.suspended_sinks.remove(address);
            state.suppress_reconnect.take(address).is_some()
        };
        self.inner.idle.cancel_pending(address);
        self.stop_keepalive(address).await;
        self.stop_mpd(address).await;

        if suppressed {
            info!("Skipping auto-reconnect for {address} (user-initiated disconnect)");
        } else if self.reconnect_eligible(address) {
            self.inner.reconnect.schedule(self, address);
        }
        self.broadcast_all().await;
    }

    /// Suppression rules for the reconnect scheduler (the
    /// user-initiated case is handled by the caller).
    fn reconnect_eligible(&self, address: &str) -> bool {
        if !self.runtime_settings().auto_reconnect {
            return false;
        }
        let auto_connect = {
            let store = self.inner.store.lock().unwrap();
            store.get_device(address).map(|d| d.auto_connect)
        };
        match auto_connect {
            None | Some(false) => {
                debug!("Skipping reconnect for {address} (not auto-connect)");
                false
            }
            Some(true) => {
                !self.is_connecting(address) && !self.inner.reconnect.is_scheduled(address)
            }
        }
    }

    fn on_transport_volume(&self, address: &str, volume: u16) {
        let pct = (volume as f64 / 127.0 * 100.0).round() as u32;
        info!("AVRCP transport volume for {address}: {pct}% (raw {volume})");
        let entry = AvrcpEntry {
            address: address.to_string(),
            property: "Volume".to_string(),
            value: json!(format!("{pct}%")),
            ts: epoch_secs(),
        };
        {
            let mut state = self.inner.state.lock().unwrap();
            state.last_signaled_volume.insert(address.to_string(), volume);
            state.recent_avrcp.push(entry.clone());
        }
        self.inner.events.emit("avrcp_event", serde_json::to_value(&entry).unwrap_or_default());
    }

    fn on_media_player_changed(&self, path: &str, changed: Vec<(String, Value)>) {
        let Some(address) = crate::bluez::constants::path_to_address(path) else { return };
        for (property, value) in changed {
            info!("AVRCP {address}: {property} = {value}");
            if property == "Status" {
                self.inner.state.lock().unwrap().last_avrcp_status =
                    Some((address.clone(), Instant::now()));
            }
            let entry = AvrcpEntry {
                address: address.clone(),
                property,
                value,
                ts: epoch_secs(),
            };
            self.inner.state.lock().unwrap().recent_avrcp.push(entry.clone());
            self.inner
                .events
                .emit("avrcp_event", serde_json::to_value(&entry).unwrap_or_default());
        }
    }

    fn emit_avrcp_snapshot(&self, address: &str, events: Vec<(String, Value)>) {
        for (property, value) in events {
            let entry = AvrcpEntry {
                address: address.to_string(),
                property,
                value,
                ts: epoch_secs(),
            };
            self.inner.state.lock().unwrap().recent_avrcp.push(entry.clone());
            self.inner
                .events
                .emit("avrcp_event", serde_json::to_value(&entry).unwrap_or_default());
        }
    }

    /// Speaker button press routed from the registered MPRIS player.
    async fn consume_mpris_commands(&self, mut rx: UnboundedReceiver<(String, String)>) {
        while let Some((command, detail)) = rx.recv().await {
            let entry = MprisEntry { command: command.clone(), detail: detail.clone(), ts: epoch_secs() };
            self.inner.state.lock().unwrap().recent_mpris.push(entry.clone());
            self.inner
                .events
                .emit("mpris_command", serde_json::to_value(&entry).unwrap_or_default());

            // Route to the right MPD instance: the device whose AVRCP
            // Status changed just now, else a sole running instance.
            let recent = {
                let state = self.inner.state.lock().unwrap();
                state
                    .last_avrcp_status
                    .as_ref()
                    .filter(|(_, at)| at.elapsed() < AVRCP_DISPATCH_WINDOW)
                    .map(|(address, _)| address.clone())
            };
            let mut bridges = self.inner.mpd.lock().await;
            let target = pick_dispatch_target(
                recent.as_deref(),
                &bridges.keys().cloned().collect::<Vec<_>>(),
            );
            if let Some(target) = target {
                if let Some(bridge) = bridges.get_mut(&target) {
                    bridge.handle_command(&command, &detail).await;
                }
            }
        }
    }

    async fn consume_sink_events(&self, mut rx: UnboundedReceiver<SinkEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                SinkEvent::VolumeChange { sink, volume, mute } => {
                    let Some(address) = address_from_sink_name(&sink) else { continue };
                    let value = if mute {
                        format!("{volume}% (muted)")
                    } else {
                        format!("{volume}%")
                    };
                    let entry = AvrcpEntry {
                        address,
                        property: "Volume".to_string(),
                        value: json!(value),
                        ts: epoch_secs(),
                    };
                    self.inner.state.lock().unwrap().recent_avrcp.push(entry.clone());
                    self.inner
                        .events
                        .emit("avrcp_event", serde_json::to_value(&entry).unwrap_or_default());
                }
                SinkEvent::Running { sink } => {
                    let Some(address) = address_from_sink_name(&sink) else { continue };
                    self.inner.idle.on_sink_running(self, &address);
                    // The sink may have appeared after the connect path
                    // gave up on it.
                    self.start_keepalive_if_enabled(&address).await;
                }
                SinkEvent::Idle { sink } => {
                    let Some(address) = address_from_sink_name(&sink) else { continue };
                    let settings = self.device_settings(&address);
                    self.inner.idle.on_sink_idle(self, &address, &settings);
                }
            }
        }
    }

    // ── Idle-mode support ──

    /// Delayed power-save suspend firing: suspend the sink and remember
    /// it so a later running transition clears the mark.
    pub async fn power_save_suspend(&self, address: &str) {
        let Some(pulse) = self.pulse() else { return };
        let Some(sink) = pulse.get_sink_for_address(address).await else {
            debug!("Power-save suspend for {address}: no sink");
            return;
        };
        if pulse.suspend_sink(&sink).await {
            self.inner.state.lock().unwrap().suspended_sinks.insert(address.to_string());
            info!("Power-save: suspended sink for {address}");
        }
    }

    /// PulseAudio resumes the sink on its own when playback restarts;
    /// only the bookkeeping needs clearing.
    pub fn clear_suspended_mark(&self, address: &str) {
        self.inner.state.lock().unwrap().suspended_sinks.remove(address);
    }

    async fn start_keepalive_if_enabled(&self, address: &str) {
        let settings = self.device_settings(address);
        if settings.idle_mode != IdleMode::KeepAlive {
            return;
        }
        if self.inner.state.lock().unwrap().keepalives.contains_key(address) {
            return;
        }
        let Some(pulse) = self.pulse() else { return };
        let Some(sink) = pulse.get_sink_for_address(address).await else {
            debug!("Cannot start keep-alive for {address}: no PA sink yet");
            return;
        };
        let keepalive = KeepAlive::start(sink, settings.keep_alive_method);
        let replaced = {
            let mut state = self.inner.state.lock().unwrap();
            state.keepalives.insert(address.to_string(), keepalive)
        };
        if let Some(old) = replaced {
            old.stop().await;
        }
        info!("Keep-alive started for {address} (method={:?})", settings.keep_alive_method);
        self.inner.events.emit(
            "keepalive_changed",
            json!({"address": address, "enabled": true, "method": settings.keep_alive_method}),
        );
    }

    async fn stop_keepalive(&self, address: &str) {
        let keepalive = self.inner.state.lock().unwrap().keepalives.remove(address);
        if let Some(keepalive) = keepalive {
            keepalive.stop().await;
            info!("Keep-alive stopped for {address}");
            self.inner
                .events
                .emit("keepalive_changed", json!({"address": address, "enabled": false}));
        }
    }

    async fn start_mpd_if_enabled(&self, address: &str) {
        let settings = self.device_settings(address);
        if !settings.mpd_enabled {
            return;
        }
        if self.inner.mpd.lock().await.contains_key(address) {
            return;
        }
        let Some(pulse) = self.pulse() else { return };
        let Some(sink) = pulse.get_sink_for_address(address).await else {
            debug!("Cannot start MPD for {address}: no PA sink yet");
            return;
        };
        let (port, name) = {
            let mut store = self.inner.store.lock().unwrap();
            let Some(port) = store.allocate_mpd_port(address) else {
                warn!("No free MPD port for {address}");
                return;
            };
            let name = store
                .get_device(address)
                .map(|d| d.name.clone())
                .unwrap_or_else(|| address.to_string());
            (port, name)
        };
        let verbose = self.inner.config.lock().unwrap().log_level == "debug";
        let mut bridge = MpdBridge::new(address, port, &name, settings.mpd_hw_volume, verbose);
        match bridge.start(&sink).await {
            Ok(()) => {
                self.inner.mpd.lock().await.insert(address.to_string(), bridge);
                // Bring the speaker's hardware level (AVRCP absolute
                // volume) to the configured value; MPD's own setvol is
                // software-side.
                let current = pulse.get_sink_volume(&sink).await.map(|(volume, _)| volume);
                if current != Some(settings.mpd_hw_volume) {
                    pulse.set_sink_volume(&sink, settings.mpd_hw_volume).await;
                }
            }
            Err(e) => warn!("MPD bridge start failed for {address}: {e}"),
        }
    }

    async fn stop_mpd(&self, address: &str) {
        let bridge = self.inner.mpd.lock().await.remove(address);
        if let Some(mut bridge) = bridge {
            bridge.stop().await;
        }
    }

    // ── Settings ──

    /// Apply a per-device settings update and react immediately when
    /// the device is connected.
    pub async fn update_device_settings(
        &self,
        address: &str,
        update: SettingsUpdate,
        mpd_port: Option<u16>,
    ) -> Result<DeviceSettings> {
        // A paired device that predates the store gets stored first.
        let stored = self.inner.store.lock().unwrap().contains(address);
        if !stored {
            let device = self
                .get_or_create_device(address)
                .await
                .map_err(|_| Error::DeviceNotFound(address.to_string()))?;
            if !device.is_paired().await && !device.is_connected().await {
                return Err(Error::DeviceNotFound(address.to_string()));
            }
            let name = device.name().await;
            self.inner.store.lock().unwrap().add_device(address, &name, true);
            info!("Auto-stored device {address} ({name})");
        }

        let previous = self.device_settings(address);
        if let Some(port) = mpd_port {
            self.inner
                .store
                .lock()
                .unwrap()
                .set_mpd_port(address, port)
                .map_err(Error::InvalidRequest)?;
        }
        let record = self
            .inner
            .store
            .lock()
            .unwrap()
            .update_settings(address, &update)
            .ok_or_else(|| Error::DeviceNotFound(address.to_string()))?;
        let current = record.settings.clone();

        let connected = self.inner.state.lock().unwrap().connect_time.contains_key(address);
        if connected {
            if previous.idle_mode != current.idle_mode
                || previous.keep_alive_method != current.keep_alive_method
            {
                // Mode change: drop pending timers, restart keep-alive
                // under the new mode. Staying in power_save leaves a
                // suspended sink alone (resume/re-suspend race);
                // leaving power_save resumes it.
                self.inner.idle.cancel_pending(address);
                if previous.idle_mode == IdleMode::PowerSave
                    && current.idle_mode != IdleMode::PowerSave
                {
                    let suspended =
                        self.inner.state.lock().unwrap().suspended_sinks.contains(address);
                    if suspended {
                        if let Some(pulse) = self.pulse() {
                            if let Some(sink) = pulse.get_sink_for_address(address).await {
                                pulse.resume_sink(&sink).await;
                            }
                        }
                        self.clear_suspended_mark(address);
                    }
                }
                self.stop_keepalive(address).await;
                self.start_keepalive_if_enabled(address).await;
            }
            if previous.mpd_enabled != current.mpd_enabled {
                if current.mpd_enabled {
                    self.start_mpd_if_enabled(address).await;
                } else {
                    self.stop_mpd(address).await;
                }
            } else if current.mpd_enabled && previous.mpd_hw_volume != current.mpd_hw_volume {
                let mut bridges = self.inner.mpd.lock().await;
                if let Some(bridge) = bridges.get_mut(address) {
                    bridge.set_volume(current.mpd_hw_volume).await;
                }
            }
        }

        self.broadcast_devices().await;
        Ok(current)
    }

    /// Hot-reload runtime settings; persists and broadcasts.
    pub fn update_runtime_settings(&self, body: &Value) -> std::result::Result<RuntimeSettings, Vec<String>> {
        let mut config = self.inner.config.lock().unwrap();
        let mut runtime = config.runtime.clone();
        crate::config::apply_runtime_update(&mut runtime, body)?;
        config.runtime = runtime.clone();
        if let Err(e) = config.save_settings() {
            warn!("Could not persist runtime settings: {e}");
        }
        drop(config);
        self.inner
            .events
            .emit("settings_changed", serde_json::to_value(&runtime).unwrap_or_default());
        info!("Runtime settings updated: {runtime:?}");
        Ok(runtime)
    }

    // ── Views ──

    /// Discovered + stored devices, merged. Rejected devices never
    /// appear here; stored-but-offline devices always do.
    pub async fn get_all_devices(&self) -> Vec<Value> {
        let discovered =
            self.inner.watcher.enumerate_audio_devices(None).await.unwrap_or_default();
        let records: Vec<DeviceRecord> = self.inner.store.lock().unwrap().devices().to_vec();
        let keepalive_active: HashSet<String> = {
            let state = self.inner.state.lock().unwrap();
            state.keepalives.keys().cloned().collect()
        };
        let mpd_running: HashSet<String> =
            self.inner.mpd.lock().await.keys().cloned().collect();
        merge_device_lists(&discovered, &records, &keepalive_active, &mpd_running)
    }

    pub async fn get_audio_sinks(&self) -> Vec<BtSink> {
        match self.pulse() {
            Some(pulse) => pulse.list_bt_sinks().await,
            None => Vec::new(),
        }
    }

    pub async fn list_adapters(&self) -> Result<Vec<Value>> {
        let adapters = self.inner.watcher.list_adapters().await?;
        Ok(adapters
            .into_iter()
            .map(|adapter| {
                let selected = adapter.path == self.inner.adapter_path;
                let mut value = serde_json::to_value(&adapter).unwrap_or_default();
                if let Some(obj) = value.as_object_mut() {
                    obj.insert("selected".into(), json!(selected));
                    obj.insert("ble_scanning".into(), json!(adapter.discovering && !selected));
                }
                value
            })
            .collect())
    }

    /// Combined snapshot for `GET /api/state`.
    pub async fn state_snapshot(&self, mpris_after: f64, avrcp_after: f64) -> Value {
        let devices = self.get_all_devices().await;
        let sinks = self.get_audio_sinks().await;
        let (mpris, avrcp) = {
            let state = self.inner.state.lock().unwrap();
            let mpris: Vec<MprisEntry> = state
                .recent_mpris
                .snapshot()
                .into_iter()
                .filter(|e| e.ts > mpris_after)
                .collect();
            let avrcp: Vec<AvrcpEntry> = state
                .recent_avrcp
                .snapshot()
                .into_iter()
                .filter(|e| e.ts > avrcp_after)
                .collect();
            (mpris, avrcp)
        };
        json!({
            "devices": devices,
            "sinks": sinks,
            "mpris_events": mpris,
            "avrcp_events": avrcp,
        })
    }

    pub fn recent_logs(&self) -> Vec<Value> {
        self.inner
            .log_ring
            .lock()
            .map(|ring| {
                ring.snapshot()
                    .iter()
                    .map(|e| serde_json::to_value(e).unwrap_or_default())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Subscribe a client: returns the live queue plus the replay
    /// frames (current state, then ring history, then queued toasts) to
    /// deliver before going live.
    pub async fn subscribe_with_replay(&self) -> (crate::events::Subscription, Vec<Value>) {
        let mut frames = Vec::new();
        let devices = self.get_all_devices().await;
        let sinks = self.get_audio_sinks().await;
        frames.push(json!({"type": "devices_changed", "devices": devices}));
        frames.push(json!({"type": "sinks_changed", "sinks": sinks}));
        frames.push(json!({"type": "scan_state", "scanning": self.is_scanning()}));
        {
            let mut state = self.inner.state.lock().unwrap();
            for entry in state.recent_mpris.snapshot() {
                let mut frame = serde_json::to_value(&entry).unwrap_or_default();
                if let Some(obj) = frame.as_object_mut() {
                    obj.insert("type".into(), json!("mpris_command"));
                }
                frames.push(frame);
            }
            for entry in state.recent_avrcp.snapshot() {
                let mut frame = serde_json::to_value(&entry).unwrap_or_default();
                if let Some(obj) = frame.as_object_mut() {
                    obj.insert("type".into(), json!("avrcp_event"));
                }
                frames.push(frame);
            }
            for toast in state.pending_toasts.drain(..) {
                let mut frame = toast;
                if let Some(obj) = frame.as_object_mut() {
                    obj.insert("type".into(), json!("toast"));
                }
                frames.push(frame);
            }
        }
        for entry in self.recent_logs() {
            let mut frame = entry;
            if let Some(obj) = frame.as_object_mut() {
                obj.insert("type".into(), json!("log_entry"));
            }
            frames.push(frame);
        }
        // Subscribe only after the snapshot so replayed history cannot
        // race ahead of itself on the client.
        (self.inner.events.subscribe(), frames)
    }

    // ── Broadcast helpers ──

    pub async fn broadcast_devices(&self) {
        let devices = self.get_all_devices().await;
        self.inner.events.emit("devices_changed", json!({"devices": devices}));
    }

    pub async fn broadcast_sinks(&self) {
        let sinks = self.get_audio_sinks().await;
        let snapshot = serde_json::to_string(&sinks).unwrap_or_default();
        self.inner.state.lock().unwrap().last_sink_snapshot = snapshot;
        self.inner.events.emit("sinks_changed", json!({"sinks": sinks}));
    }

    pub async fn broadcast_all(&self) {
        self.broadcast_devices().await;
        self.broadcast_sinks().await;
    }

    /// Poll sink state every few seconds: PA transitions (idle/running,
    /// volume sync) do not always produce subscription events we see in
    /// time, and the snapshot comparison suppresses no-op broadcasts.
    async fn sink_poll_loop(&self) {
        let mut previous_count: Option<usize> = None;
        loop {
            tokio::time::sleep(SINK_POLL_INTERVAL).await;
            let Some(pulse) = self.pulse() else { continue };
            let sinks = pulse.list_bt_sinks().await;
            if previous_count != Some(sinks.len()) {
                let names: Vec<&str> = sinks.iter().map(|s| s.name.as_str()).collect();
                info!("BT sinks: {} (was {:?}) {names:?}", sinks.len(), previous_count);
                previous_count = Some(sinks.len());
            }
            let snapshot = serde_json::to_string(&sinks).unwrap_or_default();
            let changed = {
                let mut state = self.inner.state.lock().unwrap();
                if state.last_sink_snapshot != snapshot {
                    state.last_sink_snapshot = snapshot;
                    true
                } else {
                    false
                }
            };
            if changed {
                self.inner.events.emit("sinks_changed", json!({"sinks": sinks}));
            }
        }
    }

    // ── Shutdown ──

    /// Graceful teardown, reverse of startup. Bluetooth devices stay
    /// connected; audio should survive a daemon restart.
    pub async fn shutdown(&self) {
        info!("Shutting down Bluetooth audio manager...");

        let (sink_poll, scan_task, consumers) = {
            let mut state = self.inner.state.lock().unwrap();
            (
                state.sink_poll_task.take(),
                state.scan_task.take(),
                std::mem::take(&mut state.consumer_tasks),
            )
        };
        if let Some(task) = sink_poll {
            task.abort();
            let _ = task.await;
        }
        if let Some(task) = scan_task {
            task.abort();
            let _ = task.await;
        }

        let bridges: Vec<MpdBridge> = {
            let mut map = self.inner.mpd.lock().await;
            map.drain().map(|(_, bridge)| bridge).collect()
        };
        for mut bridge in bridges {
            bridge.stop().await;
        }

        let keepalives: Vec<KeepAlive> = {
            let mut state = self.inner.state.lock().unwrap();
            state.keepalives.drain().map(|(_, ka)| ka).collect()
        };
        for keepalive in keepalives {
            keepalive.stop().await;
        }
        self.inner.idle.shutdown().await;

        self.inner.reconnect.stop().await;

        {
            let mut player = self.inner.media_player.lock().await;
            if let Some(player) = player.as_mut() {
                let _ = player.unregister().await;
            }
            *player = None;
        }
        if let Some(handle) = self.inner.agent.lock().unwrap().take() {
            crate::bluez::agent::unregister(handle);
        }
        {
            let mut null_hfp = self.inner.null_hfp.lock().await;
            if let Some(handler) = null_hfp.take() {
                handler.unregister().await;
            }
        }

        let _ = self.inner.watcher.stop_discovery(&self.inner.adapter_path).await;

        *self.inner.pulse.write().unwrap() = None;

        for task in consumers {
            task.abort();
            let _ = task.await;
        }

        info!("Bluetooth audio manager shut down");
    }
}

/// MPRIS command routing: prefer the device whose AVRCP `Status`
/// changed inside the dispatch window; otherwise a sole running bridge
/// gets everything.
fn pick_dispatch_target(recent_status: Option<&str>, bridges: &[String]) -> Option<String> {
    if let Some(address) = recent_status {
        if bridges.iter().any(|b| b == address) {
            return Some(address.to_string());
        }
    }
    if bridges.len() == 1 {
        return bridges.first().cloned();
    }
    None
}

/// Merge live BlueZ enumeration with the persistent store: discovered
/// entries are tagged `stored` (with settings attached); stored devices
/// not currently visible are appended as offline records.
fn merge_device_lists(
    discovered: &[DeviceInfo],
    records: &[DeviceRecord],
    keepalive_active: &HashSet<String>,
    mpd_running: &HashSet<String>,
) -> Vec<Value> {
    let mut result = Vec::new();
    let mut seen = HashSet::new();
    for info in discovered {
        seen.insert(info.address.clone());
        let mut value = serde_json::to_value(info).unwrap_or_default();
        let record = records.iter().find(|r| r.address == info.address);
        if let Some(obj) = value.as_object_mut() {
            obj.insert("stored".into(), json!(record.is_some()));
            if let Some(record) = record {
                obj.insert(
                    "settings".into(),
                    serde_json::to_value(&record.settings).unwrap_or_default(),
                );
                obj.insert(
                    "keep_alive_active".into(),
                    json!(keepalive_active.contains(&info.address)),
                );
                obj.insert("mpd_running".into(), json!(mpd_running.contains(&info.address)));
            }
        }
        result.push(value);
    }
    for record in records {
        if seen.contains(&record.address) {
            continue;
        }
        result.push(json!({
            "path": "",
            "adapter": "",
            "address": record.address,
            "name": record.name,
            "paired": true,
            "connected": false,
            "rssi": null,
            "uuids": [],
            "bearers": [],
            "has_transport": false,
            "best_effort": false,
            "stored": true,
            "settings": record.settings,
            "keep_alive_active": keepalive_active.contains(&record.address),
            "mpd_running": mpd_running.contains(&record.address),
        }));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(address: &str) -> DeviceRecord {
        DeviceRecord {
            address: address.to_string(),
            name: "Speaker".to_string(),
            auto_connect: true,
            paired_at: String::new(),
            settings: DeviceSettings::default(),
        }
    }

    fn info(address: &str, connected: bool) -> DeviceInfo {
        DeviceInfo {
            path: format!("/org/bluez/hci0/dev_{}", address.replace(':', "_")),
            adapter: "hci0".to_string(),
            address: address.to_string(),
            name: "Speaker".to_string(),
            paired: true,
            connected,
            rssi: None,
            uuids: Vec::new(),
            bearers: Vec::new(),
            has_transport: connected,
            best_effort: false,
        }
    }

    #[test]
    fn dispatch_prefers_recent_avrcp_device() {
        let bridges = vec!["AA:BB:CC:DD:EE:01".to_string(), "AA:BB:CC:DD:EE:02".to_string()];
        assert_eq!(
            pick_dispatch_target(Some("AA:BB:CC:DD:EE:02"), &bridges).as_deref(),
            Some("AA:BB:CC:DD:EE:02")
        );
        // No recent status and several bridges: nowhere to route.
        assert_eq!(pick_dispatch_target(None, &bridges), None);
    }

    #[test]
    fn dispatch_falls_through_to_sole_bridge() {
        let bridges = vec!["AA:BB:CC:DD:EE:01".to_string()];
        assert_eq!(
            pick_dispatch_target(None, &bridges).as_deref(),
            Some("AA:BB:CC:DD:EE:01")
        );
        // Recent status for an unbridged device still falls through.
        assert_eq!(
            pick_dispatch_target(Some("AA:BB:CC:DD:EE:09"), &bridges).as_deref(),
            Some("AA:BB:CC:DD:EE:01")
        );
    }

    #[test]
    fn merge_appends_offline_stored_devices() {
        let discovered = vec![info("AA:BB:CC:DD:EE:01", true)];
        let records = vec![record("AA:BB:CC:DD:EE:01"), record("AA:BB:CC:DD:EE:02")];
        let merged =
            merge_device_lists(&discovered, &records, &HashSet::new(), &HashSet::new());
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0]["stored"], json!(true));
        assert_eq!(merged[0]["connected"], json!(true));
        // The offline record shows up as paired-but-disconnected.
        assert_eq!(merged[1]["address"], json!("AA:BB:CC:DD:EE:02"));
        assert_eq!(merged[1]["connected"], json!(false));
        assert_eq!(merged[1]["paired"], json!(true));
    }

    #[test]
    fn merge_keeps_unstored_discoveries_unsettled() {
        let discovered = vec![info("AA:BB:CC:DD:EE:03", false)];
        let merged = merge_device_lists(&discovered, &[], &HashSet::new(), &HashSet::new());
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0]["stored"], json!(false));
        assert!(merged[0].get("settings").is_none());
    }
}
