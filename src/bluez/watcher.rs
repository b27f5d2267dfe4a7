//! BlueZ object-tree watcher.
//!
//! One broad match rule (`sender='org.bluez'`) feeds a raw message
//! stream that is normalized into typed [`WatcherEvent`]s for the
//! orchestrator, in bus arrival order. RSSI/advertisement churn on
//! Device1 is demoted to debug and never leaves this module.
//!
//! The watcher also answers object-tree queries: audio-device
//! enumeration with the sink-UUID filter, adapter listing and
//! resolution, discovery control, and device removal across every
//! adapter that holds the object.

use crate::bluez::constants::{
    ADAPTER_INTERFACE, BLUEZ_SERVICE, DEVICE_INTERFACE, MEDIA_TRANSPORT_INTERFACE, SINK_UUIDS,
    classify_rejection, cod_major_label, is_cod_audio_sink, path_to_address,
};
use crate::errors::{Error, Result};
use futures::StreamExt;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;
use zbus::zvariant::{OwnedValue, Value};

/// Typed, ordered events derived from the BlueZ signal stream.
#[derive(Debug, Clone)]
pub enum WatcherEvent {
    /// A new object appeared; `has_device` marks Device1 among its
    /// interfaces (a discovery hit).
    InterfacesAdded { path: String, has_device: bool },
    InterfacesRemoved { path: String },
    DeviceConnected { address: String },
    DeviceDisconnected { address: String },
    /// Device1 UUIDs/Name changed. Interesting while scanning since
    /// UUIDs often arrive after InterfacesAdded.
    DeviceRefreshed { path: String },
    /// MediaTransport1 Volume change (raw AVRCP absolute volume 0..127).
    TransportVolume { address: String, volume: u16 },
    /// MediaTransport1 State change ("active", "idle", "pending").
    TransportState { address: String, state: String },
    /// Remote MediaPlayer1 property change.
    MediaPlayerChanged { path: String, changed: Vec<(String, serde_json::Value)> },
    /// The signal stream was re-established after a bus failure;
    /// consumers must re-sync since events may have been lost.
    Resynced,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub path: String,
    pub adapter: String,
    pub address: String,
    pub name: String,
    pub paired: bool,
    pub connected: bool,
    pub rssi: Option<i16>,
    pub uuids: Vec<String>,
    pub bearers: Vec<String>,
    pub has_transport: bool,
    /// Surfaced on Class-of-Device evidence alone (no UUIDs).
    pub best_effort: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdapterInfo {
    pub path: String,
    pub name: String,
    pub address: String,
    pub alias: String,
    pub hw_model: String,
    pub modalias: String,
    pub usb_id: String,
    pub powered: bool,
    pub discovering: bool,
}

#[derive(Debug, Clone)]
pub struct ResolvedAdapter {
    pub path: String,
    pub name: String,
    pub address: String,
    pub powered: bool,
    /// Session-only fallback notice (configured adapter absent).
    pub notice: Option<String>,
}

#[derive(Clone)]
pub struct BluezWatcher {
    conn: zbus::Connection,
    /// Addresses already logged this scan session, so every accept and
    /// reject is visible exactly once per scan.
    logged_cache: Arc<Mutex<HashSet<String>>>,
}

impl BluezWatcher {
    pub fn new(conn: zbus::Connection) -> Self {
        Self { conn, logged_cache: Arc::new(Mutex::new(HashSet::new())) }
    }

    pub fn connection(&self) -> &zbus::Connection {
        &self.conn
    }

    /// Spawn the signal-stream task. On bus failure it reconnects with
    /// exponential backoff, re-subscribes, and emits
    /// [`WatcherEvent::Resynced`] so consumers re-enumerate.
    pub fn spawn_stream(&self, tx: UnboundedSender<WatcherEvent>) -> tokio::task::JoinHandle<()> {
        let mut conn = self.conn.clone();
        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            loop {
                match run_stream(&conn, &tx).await {
                    Ok(()) => {}
                    Err(e) => warn!("BlueZ signal stream error: {e}"),
                }
                if tx.is_closed() {
                    return;
                }
                warn!(
                    "BlueZ signal stream ended — reconnecting in {}s",
                    backoff.as_secs()
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(30));
                match zbus::Connection::system().await {
                    Ok(new_conn) => {
                        conn = new_conn;
                        backoff = Duration::from_secs(1);
                        if tx.send(WatcherEvent::Resynced).is_err() {
                            return;
                        }
                    }
                    Err(e) => debug!("System bus still unavailable: {e}"),
                }
            }
        })
    }

    pub async fn get_managed_objects(&self) -> Result<zbus::fdo::ManagedObjects> {
        let proxy = zbus::fdo::ObjectManagerProxy::builder(&self.conn)
            .destination(BLUEZ_SERVICE)?
            .path("/")?
            .build()
            .await?;
        Ok(proxy.get_managed_objects().await?)
    }

    pub async fn get_all_properties(
        &self,
        path: &str,
        interface: &str,
    ) -> Option<HashMap<String, OwnedValue>> {
        let proxy = zbus::fdo::PropertiesProxy::builder(&self.conn)
            .destination(BLUEZ_SERVICE)
            .ok()?
            .path(path.to_string())
            .ok()?
            .build()
            .await
            .ok()?;
        let interface = zbus::names::InterfaceName::try_from(interface.to_string()).ok()?;
        proxy.get_all(interface).await.ok()
    }

    /// Find the first `player*` child node of a device object: a typed
    /// query over the object tree rather than XML introspection.
    pub async fn find_player_node(&self, device_path: &str) -> Result<Option<String>> {
        let objects = self.get_managed_objects().await?;
        let prefix = format!("{device_path}/player");
        let mut players: Vec<String> = objects
            .keys()
            .map(|p| p.to_string())
            .filter(|p| p.starts_with(&prefix))
            .collect();
        players.sort();
        Ok(players.into_iter().next())
    }

    /// Reset the once-per-scan-session log cache (new scan starting).
    pub fn clear_scan_log_cache(&self) {
        self.logged_cache.lock().unwrap().clear();
    }

    /// Devices whose UUID set intersects the sink UUIDs, plus
    /// best-effort CoD candidates. Rejections are logged once per scan
    /// session per address with a classification.
    pub async fn enumerate_audio_devices(&self, adapter_path: Option<&str>) -> Result<Vec<DeviceInfo>> {
        let objects = self.get_managed_objects().await?;
        let mut devices = Vec::new();
        let mut skipped = 0usize;

        for (path, interfaces) in &objects {
            let Some(props) = iface_props(interfaces, DEVICE_INTERFACE) else { continue };
            let path = path.to_string();
            if let Some(adapter) = adapter_path {
                if !path.starts_with(&format!("{adapter}/")) {
                    continue;
                }
            }

            let address = get_string(props, "Address").unwrap_or_else(|| "??:??".into());
            let name = get_string(props, "Name").unwrap_or_else(|| "Unknown Device".into());
            let uuids = get_uuid_list(props, "UUIDs");
            let cod = get_u32(props, "Class").unwrap_or(0);
            let paired = get_bool(props, "Paired").unwrap_or(false);
            let connected = get_bool(props, "Connected").unwrap_or(false);

            let has_sink = uuids.iter().any(|u| SINK_UUIDS.contains(u));
            let best_effort = uuids.is_empty() && is_cod_audio_sink(cod);
            if !has_sink && !best_effort {
                skipped += 1;
                if self.log_once(&address) {
                    let cod_str = if cod != 0 {
                        format!("0x{cod:06X}({})", cod_major_label(cod))
                    } else {
                        "(none)".to_string()
                    };
                    info!(
                        "Skipping device {name} ({address}) — {}. UUIDs: {uuids:?} CoD: {cod_str}",
                        classify_rejection(&uuids)
                    );
                }
                continue;
            }

            if self.log_once(&address) {
                let state = if connected {
                    "connected"
                } else if paired {
                    "paired (offline)"
                } else {
                    "unpaired"
                };
                if best_effort {
                    info!(
                        "Accepted device {name} ({address}) [{state}] — audio Class-of-Device, no UUIDs (best effort)"
                    );
                } else {
                    let matched: Vec<&Uuid> =
                        uuids.iter().filter(|u| SINK_UUIDS.contains(u)).collect();
                    info!("Accepted device {name} ({address}) [{state}] — matched {matched:?}");
                }
            }

            // Active bearers from org.bluez.Bearer.* sub-interfaces.
            let mut bearers = Vec::new();
            for (iface_name, bearer_props) in interfaces {
                let iface_name = iface_name.as_str();
                let Some(short) = iface_name.strip_prefix("org.bluez.Bearer.") else { continue };
                let bearer_connected = get_bool(bearer_props, "Connected").unwrap_or(false);
                if bearer_connected {
                    if short.contains("BREDR") {
                        bearers.push("BR/EDR".to_string());
                    } else if short.contains("LE") {
                        bearers.push("LE".to_string());
                    } else {
                        bearers.push(short.to_string());
                    }
                }
            }
            bearers.sort();

            // An audio transport lives at a sub-path (e.g. .../fd0).
            let sub_prefix = format!("{path}/");
            let has_transport = objects.iter().any(|(p, ifs)| {
                p.as_str().starts_with(&sub_prefix)
                    && iface_props(ifs, MEDIA_TRANSPORT_INTERFACE).is_some()
            });

            let adapter = path.split('/').nth(3).unwrap_or("unknown").to_string();

            devices.push(DeviceInfo {
                path,
                adapter,
                address,
                name,
                paired,
                connected,
                rssi: get_i16(props, "RSSI"),
                uuids: uuids.iter().map(|u| u.to_string()).collect(),
                bearers,
                has_transport,
                best_effort,
            });
        }

        debug!(
            "enumerate_audio_devices: {} objects scanned, {skipped} unsupported skipped, {} matched",
            objects.len(),
            devices.len()
        );
        devices.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(devices)
    }

    fn log_once(&self, address: &str) -> bool {
        self.logged_cache.lock().unwrap().insert(address.to_string())
    }

    /// All adapters on the system, enriched with sysfs hardware info.
    pub async fn list_adapters(&self) -> Result<Vec<AdapterInfo>> {
        let objects = self.get_managed_objects().await?;
        let mut adapters = Vec::new();
        for (path, interfaces) in &objects {
            let Some(props) = iface_props(interfaces, ADAPTER_INTERFACE) else { continue };
            let path = path.to_string();
            let name = path.rsplit('/').next().unwrap_or("").to_string();
            let modalias = get_string(props, "Modalias").unwrap_or_default();
            let hw_model = read_sysfs_hw_info(&name)
                .or_else(|| (!modalias.is_empty()).then(|| modalias.clone()))
                .unwrap_or_default();
            adapters.push(AdapterInfo {
                name: name.clone(),
                address: get_string(props, "Address").unwrap_or_else(|| "unknown".into()),
                alias: get_string(props, "Alias").unwrap_or_default(),
                hw_model,
                usb_id: read_sysfs_usb_id(&name).unwrap_or_default(),
                modalias,
                powered: get_bool(props, "Powered").unwrap_or(false),
                discovering: get_bool(props, "Discovering").unwrap_or(false),
                path,
            });
        }
        adapters.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(adapters)
    }

    /// Translate an adapter spec (`"auto"` | MAC | legacy `hciN`) into a
    /// concrete adapter. A configured adapter that is absent falls back
    /// to auto for this session and carries a notice; persisted settings
    /// are never touched here.
    pub async fn resolve_adapter(&self, spec: &str) -> Result<ResolvedAdapter> {
        let adapters = self.list_adapters().await?;
        if adapters.is_empty() {
            return Err(Error::AdapterNotFound(spec.to_string()));
        }
        let auto_pick =
            || adapters.iter().find(|a| a.powered).or_else(|| adapters.first()).cloned();

        let (chosen, notice) = if spec == "auto" {
            (auto_pick(), None)
        } else {
            let found = if spec.contains(':') {
                adapters.iter().find(|a| a.address.eq_ignore_ascii_case(spec)).cloned()
            } else {
                adapters.iter().find(|a| a.name == spec).cloned()
            };
            match found {
                Some(adapter) => (Some(adapter), None),
                None => {
                    let notice = format!(
                        "Configured adapter {spec} not found — using auto selection for this session"
                    );
                    warn!("{notice}");
                    (auto_pick(), Some(notice))
                }
            }
        };

        let adapter = chosen.ok_or_else(|| Error::AdapterNotFound(spec.to_string()))?;
        Ok(ResolvedAdapter {
            path: adapter.path,
            name: adapter.name,
            address: adapter.address,
            powered: adapter.powered,
            notice,
        })
    }

    async fn adapter_proxy(&self, adapter_path: &str) -> Result<zbus::Proxy<'_>> {
        Ok(zbus::Proxy::new(
            &self.conn,
            BLUEZ_SERVICE,
            adapter_path.to_string(),
            ADAPTER_INTERFACE,
        )
        .await?)
    }

    /// Unfiltered discovery, all transports. BlueZ reference-counts
    /// discovery per client, so this never disturbs the host's passive
    /// BLE scanning.
    pub async fn start_discovery(&self, adapter_path: &str) -> Result<()> {
        let proxy = self.adapter_proxy(adapter_path).await?;
        let mut filter: HashMap<&str, Value> = HashMap::new();
        filter.insert("Transport", Value::from("auto"));
        proxy.call::<_, _, ()>("SetDiscoveryFilter", &(filter,)).await?;
        self.clear_scan_log_cache();
        proxy.call::<_, _, ()>("StartDiscovery", &()).await?;
        info!("Device discovery started (all transports, no UUID filter)");
        Ok(())
    }

    /// Idempotent stop: "No discovery started" is swallowed.
    pub async fn stop_discovery(&self, adapter_path: &str) -> Result<()> {
        let proxy = self.adapter_proxy(adapter_path).await?;
        match proxy.call::<_, _, ()>("StopDiscovery", &()).await {
            Ok(()) => {
                info!("Device discovery stopped");
                Ok(())
            }
            Err(e) if e.to_string().contains("No discovery started") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Adapter paths currently holding an object for this address,
    /// configured adapter first.
    pub async fn find_device_adapters(&self, address: &str, configured: &str) -> Vec<String> {
        let suffix = format!("/dev_{}", address.replace(':', "_"));
        let Ok(objects) = self.get_managed_objects().await else { return Vec::new() };
        let mut found: Vec<String> = objects
            .keys()
            .filter(|p| p.as_str().ends_with(&suffix))
            .filter_map(|p| p.as_str().rfind('/').map(|i| p.as_str()[..i].to_string()))
            .collect();
        found.sort();
        found.dedup();
        if let Some(pos) = found.iter().position(|p| p == configured) {
            found.swap(0, pos);
        }
        found
    }

    /// Remove the device object from every adapter that has it.
    pub async fn remove_device_any_adapter(&self, address: &str) -> Result<bool> {
        let suffix = format!("/dev_{}", address.replace(':', "_"));
        let objects = self.get_managed_objects().await?;
        let mut removed_any = false;
        for path in objects.keys() {
            let path = path.to_string();
            if !path.ends_with(&suffix) {
                continue;
            }
            let Some(split) = path.rfind('/') else { continue };
            let adapter_path = &path[..split];
            match self.adapter_proxy(adapter_path).await {
                Ok(proxy) => {
                    let object = zbus::zvariant::ObjectPath::try_from(path.as_str())
                        .map_err(zbus::Error::from)?;
                    match proxy.call::<_, _, ()>("RemoveDevice", &(object,)).await {
                        Ok(()) => {
                            info!("Removed device {path} from adapter {adapter_path}");
                            removed_any = true;
                        }
                        Err(e) => warn!("Failed to remove {path} from {adapter_path}: {e}"),
                    }
                }
                Err(e) => warn!("No adapter proxy for {adapter_path}: {e}"),
            }
        }
        if !removed_any {
            warn!("Device {address} not found on any adapter");
        }
        Ok(removed_any)
    }
}

async fn run_stream(conn: &zbus::Connection, tx: &UnboundedSender<WatcherEvent>) -> Result<()> {
    let dbus = zbus::fdo::DBusProxy::new(conn).await?;
    let rule = "type='signal',sender='org.bluez'"
        .try_into()
        .map_err(zbus::Error::from)?;
    dbus.add_match_rule(rule).await.map_err(zbus::Error::from)?;

    let mut stream = zbus::MessageStream::from(conn);
    while let Some(msg) = stream.next().await {
        let Ok(msg) = msg else { continue };
        let header = msg.header();
        if header.message_type() != zbus::message::Type::Signal {
            continue;
        }
        let Some(member) = header.member() else { continue };
        let path = header.path().map(|p| p.to_string()).unwrap_or_default();

        let event = match member.as_str() {
            "InterfacesAdded" => {
                let Ok((object_path, interfaces)) = msg
                    .body()
                    .deserialize::<(
                        zbus::zvariant::OwnedObjectPath,
                        HashMap<String, HashMap<String, OwnedValue>>,
                    )>()
                else {
                    continue;
                };
                let object_path = object_path.to_string();
                if !object_path.starts_with("/org/bluez/") {
                    continue;
                }
                let has_device = interfaces.contains_key(DEVICE_INTERFACE);
                debug!("BlueZ InterfacesAdded: {object_path} ({:?})", interfaces.keys());
                Some(WatcherEvent::InterfacesAdded { path: object_path, has_device })
            }
            "InterfacesRemoved" => {
                let Ok((object_path, _interfaces)) = msg
                    .body()
                    .deserialize::<(zbus::zvariant::OwnedObjectPath, Vec<String>)>()
                else {
                    continue;
                };
                Some(WatcherEvent::InterfacesRemoved { path: object_path.to_string() })
            }
            "PropertiesChanged" if path.starts_with("/org/bluez/") => {
                let Ok((iface, changed, _invalidated)) = msg
                    .body()
                    .deserialize::<(String, HashMap<String, OwnedValue>, Vec<String>)>()
                else {
                    continue;
                };
                match iface.as_str() {
                    DEVICE_INTERFACE => device_event(&path, &changed, tx),
                    MEDIA_TRANSPORT_INTERFACE => transport_event(&path, &changed, tx),
                    crate::bluez::constants::MEDIA_PLAYER_INTERFACE => {
                        let changed_json: Vec<(String, serde_json::Value)> = changed
                            .iter()
                            .map(|(name, value)| (name.clone(), value_to_json(value)))
                            .collect();
                        Some(WatcherEvent::MediaPlayerChanged { path: path.clone(), changed: changed_json })
                    }
                    _ => {
                        debug!("BlueZ PropertiesChanged: iface={iface} path={path}");
                        None
                    }
                }
            }
            _ => None,
        };

        if let Some(event) = event {
            if tx.send(event).is_err() {
                return Ok(());
            }
        }
    }
    Ok(())
}

/// Properties whose churn would flood the log and the event stream.
const NOISY_DEVICE_PROPS: [&str; 4] = ["RSSI", "ManufacturerData", "TxPower", "ServiceData"];

fn device_event(
    path: &str,
    changed: &HashMap<String, OwnedValue>,
    tx: &UnboundedSender<WatcherEvent>,
) -> Option<WatcherEvent> {
    let prop_names: Vec<&str> = changed.keys().map(String::as_str).collect();
    if prop_names.iter().all(|p| NOISY_DEVICE_PROPS.contains(p)) {
        debug!("BlueZ Device1 noise: props={prop_names:?} path={path}");
        return None;
    }
    info!("BlueZ PropertiesChanged: iface={DEVICE_INTERFACE} props={prop_names:?} path={path}");

    if changed.contains_key("UUIDs") || changed.contains_key("Name") {
        let _ = tx.send(WatcherEvent::DeviceRefreshed { path: path.to_string() });
    }

    let connected = changed.get("Connected").and_then(|v| bool::try_from(v).ok())?;
    let address = path_to_address(path)?;
    if connected {
        info!("Device {address} connected");
        Some(WatcherEvent::DeviceConnected { address })
    } else {
        info!("Device {address} disconnected");
        Some(WatcherEvent::DeviceDisconnected { address })
    }
}

fn transport_event(
    path: &str,
    changed: &HashMap<String, OwnedValue>,
    tx: &UnboundedSender<WatcherEvent>,
) -> Option<WatcherEvent> {
    let address = path_to_address(path)?;
    if let Some(raw) = changed.get("Volume") {
        // 0..127 uint16 on the wire, but be lenient about the width.
        let volume = u16::try_from(raw)
            .ok()
            .or_else(|| u32::try_from(raw).ok().and_then(|v| u16::try_from(v).ok()))
            .or_else(|| u8::try_from(raw).ok().map(u16::from));
        if let Some(volume) = volume {
            let _ = tx.send(WatcherEvent::TransportVolume { address: address.clone(), volume });
        }
    }
    if let Some(state) = changed.get("State").and_then(|v| String::try_from(v.clone()).ok()) {
        return Some(WatcherEvent::TransportState { address, state });
    }
    None
}

// ── Property extraction ──

/// Interface lookup in a ManagedObjects entry by plain name.
pub fn iface_props<'a>(
    interfaces: &'a HashMap<zbus::names::OwnedInterfaceName, HashMap<String, OwnedValue>>,
    name: &str,
) -> Option<&'a HashMap<String, OwnedValue>> {
    interfaces.iter().find(|(iface, _)| iface.as_str() == name).map(|(_, props)| props)
}

pub fn get_string(props: &HashMap<String, OwnedValue>, key: &str) -> Option<String> {
    props.get(key).and_then(|v| String::try_from(v.clone()).ok())
}

pub fn get_bool(props: &HashMap<String, OwnedValue>, key: &str) -> Option<bool> {
    props.get(key).and_then(|v| bool::try_from(v).ok())
}

pub fn get_u32(props: &HashMap<String, OwnedValue>, key: &str) -> Option<u32> {
    props.get(key).and_then(|v| u32::try_from(v).ok())
}

pub fn get_i16(props: &HashMap<String, OwnedValue>, key: &str) -> Option<i16> {
    props.get(key).and_then(|v| i16::try_from(v).ok())
}

pub fn get_uuid_list(props: &HashMap<String, OwnedValue>, key: &str) -> Vec<Uuid> {
    props
        .get(key)
        .and_then(|v| Vec::<String>::try_from(v.clone()).ok())
        .map(|list| list.iter().filter_map(|s| Uuid::parse_str(s).ok()).collect())
        .unwrap_or_default()
}

/// JSON-safe rendering of a D-Bus variant (zvariant values serialize
/// structurally).
pub fn value_to_json(value: &Value) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

// ── sysfs enrichment ──

/// Manufacturer + product strings for a `hciN` adapter, walking up from
/// `/sys/class/bluetooth/hciN/device` (USB adapters keep them one level
/// up from the BT device).
fn read_sysfs_hw_info(hci_name: &str) -> Option<String> {
    let base = format!("/sys/class/bluetooth/{hci_name}/device");
    let device_path = std::fs::canonicalize(&base).ok()?;
    for dir in [device_path.clone(), device_path.parent()?.to_path_buf()] {
        let product = std::fs::read_to_string(dir.join("product"))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let Some(product) = product else { continue };
        let manufacturer = std::fs::read_to_string(dir.join("manufacturer"))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        return Some(match manufacturer {
            Some(manufacturer) => format!("{manufacturer} {product}"),
            None => product,
        });
    }
    None
}

/// `idVendor:idProduct` (lowercase) for a USB adapter, or None.
fn read_sysfs_usb_id(hci_name: &str) -> Option<String> {
    let base = format!("/sys/class/bluetooth/{hci_name}/device");
    let device_path = std::fs::canonicalize(&base).ok()?;
    for dir in [device_path.clone(), device_path.parent()?.to_path_buf()] {
        let vid = std::fs::read_to_string(dir.join("idVendor"))
            .ok()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty());
        let pid = std::fs::read_to_string(dir.join("idProduct"))
            .ok()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty());
        if let (Some(vid), Some(pid)) = (vid, pid) {
            return Some(format!("{vid}:{pid}"));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noisy_props_never_become_events() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut changed = HashMap::new();
        changed.insert(
            "RSSI".to_string(),
            OwnedValue::try_from(Value::from(-60i16)).unwrap(),
        );
        let event = device_event("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_01", &changed, &tx);
        assert!(event.is_none());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn connected_change_yields_device_event() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let mut changed = HashMap::new();
        changed.insert(
            "Connected".to_string(),
            OwnedValue::try_from(Value::from(true)).unwrap(),
        );
        match device_event("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_01", &changed, &tx) {
            Some(WatcherEvent::DeviceConnected { address }) => {
                assert_eq!(address, "AA:BB:CC:DD:EE:01");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn uuid_or_name_change_triggers_refresh() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut changed = HashMap::new();
        changed.insert(
            "Name".to_string(),
            OwnedValue::try_from(Value::from("Soundbar")).unwrap(),
        );
        let event = device_event("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_01", &changed, &tx);
        assert!(event.is_none()); // Connected not in the change set
        assert!(matches!(rx.try_recv(), Ok(WatcherEvent::DeviceRefreshed { .. })));
    }

    #[test]
    fn transport_volume_widths() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut changed = HashMap::new();
        changed.insert(
            "Volume".to_string(),
            OwnedValue::try_from(Value::from(90u16)).unwrap(),
        );
        transport_event("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_01/fd0", &changed, &tx);
        match rx.try_recv() {
            Ok(WatcherEvent::TransportVolume { address, volume }) => {
                assert_eq!(address, "AA:BB:CC:DD:EE:01");
                assert_eq!(volume, 90);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn value_to_json_covers_common_shapes() {
        assert_eq!(value_to_json(&Value::from("playing")), serde_json::json!("playing"));
        assert_eq!(value_to_json(&Value::from(7u32)), serde_json::json!(7));
        assert_eq!(value_to_json(&Value::from(true)), serde_json::json!(true));
    }
}
