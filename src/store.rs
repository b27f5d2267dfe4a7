//! JSON-backed persistent store for paired device records.
//!
//! The store is a single document rewritten atomically on every
//! mutation. Records carry a settings bag; missing keys fall back to
//! defaults and unknown keys are ignored on load, so documents written
//! by other versions load cleanly.

use chrono::Utc;
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const MPD_PORT_MIN: u16 = 6600;
pub const MPD_PORT_MAX: u16 = 6609;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IdleMode {
    #[default]
    Default,
    PowerSave,
    KeepAlive,
    AutoDisconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum KeepAliveMethod {
    Silence,
    #[default]
    Infrasound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AudioProfile {
    #[default]
    A2dp,
    Hfp,
}

fn default_true() -> bool {
    true
}

fn default_auto_disconnect_minutes() -> u32 {
    15
}

fn default_mpd_hw_volume() -> u32 {
    50
}

/// Per-device settings. Every field has a default so records written
/// before a setting existed keep loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    pub idle_mode: IdleMode,
    pub keep_alive_method: KeepAliveMethod,
    /// Seconds between the idle transition and the sink suspend (0 = immediate).
    pub power_save_delay: u32,
    pub auto_disconnect_minutes: u32,
    pub mpd_enabled: bool,
    pub mpd_port: Option<u16>,
    pub mpd_hw_volume: u32,
    pub avrcp_enabled: bool,
    pub audio_profile: AudioProfile,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            idle_mode: IdleMode::Default,
            keep_alive_method: KeepAliveMethod::Infrasound,
            power_save_delay: 0,
            auto_disconnect_minutes: default_auto_disconnect_minutes(),
            mpd_enabled: false,
            mpd_port: None,
            mpd_hw_volume: default_mpd_hw_volume(),
            avrcp_enabled: true,
            audio_profile: AudioProfile::A2dp,
        }
    }
}

/// Partial settings update; `None` leaves the field untouched.
#[derive(Debug, Clone, Default)]
pub struct SettingsUpdate {
    pub idle_mode: Option<IdleMode>,
    pub keep_alive_method: Option<KeepAliveMethod>,
    pub power_save_delay: Option<u32>,
    pub auto_disconnect_minutes: Option<u32>,
    pub mpd_enabled: Option<bool>,
    pub mpd_hw_volume: Option<u32>,
    pub avrcp_enabled: Option<bool>,
    pub audio_profile: Option<AudioProfile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub address: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub auto_connect: bool,
    /// RFC3339 UTC timestamp of the successful pair.
    #[serde(default)]
    pub paired_at: String,
    #[serde(flatten)]
    pub settings: DeviceSettings,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    devices: Vec<DeviceRecord>,
}

pub struct DeviceStore {
    path: PathBuf,
    devices: Vec<DeviceRecord>,
}

impl DeviceStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path, devices: Vec::new() }
    }

    pub fn load(&mut self) -> crate::errors::Result<()> {
        if !self.path.exists() {
            self.devices.clear();
            info!("No existing paired devices store found");
            return Ok(());
        }
        let raw = std::fs::read_to_string(&self.path)?;
        match serde_json::from_str::<StoreDocument>(&raw) {
            Ok(doc) => {
                self.devices = doc.devices;
                info!("Loaded {} paired device(s) from store", self.devices.len());
            }
            Err(e) => {
                error!("Failed to parse paired devices store: {e}");
                self.devices.clear();
            }
        }
        Ok(())
    }

    fn save(&self) {
        let doc = StoreDocument { devices: self.devices.clone() };
        if let Err(e) = write_json_atomic(&self.path, &doc) {
            // In-memory state stays authoritative when the disk is unhappy.
            error!("Failed to save device store: {e}");
        } else {
            debug!("Saved {} device(s) to store", self.devices.len());
        }
    }

    /// Add a device, or refresh the name and auto-connect flag of an
    /// existing record (settings survive a re-pair).
    pub fn add_device(&mut self, address: &str, name: &str, auto_connect: bool) {
        if let Some(existing) = self.devices.iter_mut().find(|d| d.address == address) {
            existing.name = name.to_string();
            existing.auto_connect = auto_connect;
        } else {
            self.devices.push(DeviceRecord {
                address: address.to_string(),
                name: name.to_string(),
                auto_connect,
                paired_at: Utc::now().to_rfc3339(),
                settings: DeviceSettings::default(),
            });
        }
        self.save();
        info!("Stored device {address} ({name})");
    }

    pub fn remove_device(&mut self, address: &str) {
        self.devices.retain(|d| d.address != address);
        self.save();
        info!("Removed device {address} from store");
    }

    /// Wipe the store with a single write (adapter switch with clean=true).
    pub fn clear(&mut self) {
        self.devices.clear();
        self.save();
        info!("Device store cleared");
    }

    pub fn get_device(&self, address: &str) -> Option<&DeviceRecord> {
        self.devices.iter().find(|d| d.address == address)
    }

    pub fn contains(&self, address: &str) -> bool {
        self.get_device(address).is_some()
    }

    pub fn devices(&self) -> &[DeviceRecord] {
        &self.devices
    }

    pub fn auto_connect_devices(&self) -> Vec<DeviceRecord> {
        self.devices.iter().filter(|d| d.auto_connect).cloned().collect()
    }

    /// Settings for a device, defaults when it is not stored.
    pub fn settings(&self, address: &str) -> DeviceSettings {
        self.get_device(address).map(|d| d.settings.clone()).unwrap_or_default()
    }

    pub fn update_settings(
        &mut self,
        address: &str,
        update: &SettingsUpdate,
    ) -> Option<DeviceRecord> {
        let device = self.devices.iter_mut().find(|d| d.address == address)?;
        let s = &mut device.settings;
        if let Some(v) = update.idle_mode {
            s.idle_mode = v;
        }
        if let Some(v) = update.keep_alive_method {
            s.keep_alive_method = v;
        }
        if let Some(v) = update.power_save_delay {
            s.power_save_delay = v;
        }
        if let Some(v) = update.auto_disconnect_minutes {
            s.auto_disconnect_minutes = v;
        }
        if let Some(v) = update.mpd_enabled {
            s.mpd_enabled = v;
        }
        if let Some(v) = update.mpd_hw_volume {
            s.mpd_hw_volume = v;
        }
        if let Some(v) = update.avrcp_enabled {
            s.avrcp_enabled = v;
        }
        if let Some(v) = update.audio_profile {
            s.audio_profile = v;
        }
        let snapshot = device.clone();
        self.save();
        info!("Updated settings for {address}");
        Some(snapshot)
    }

    // ── MPD port pool ──

    pub fn used_mpd_ports(&self) -> HashMap<u16, String> {
        self.devices
            .iter()
            .filter_map(|d| d.settings.mpd_port.map(|p| (p, d.address.clone())))
            .collect()
    }

    /// Allocate the lowest free port in the pool for a device. Returns
    /// the existing assignment when the device already holds one.
    pub fn allocate_mpd_port(&mut self, address: &str) -> Option<u16> {
        if let Some(port) = self.get_device(address).and_then(|d| d.settings.mpd_port) {
            return Some(port);
        }
        let used = self.used_mpd_ports();
        let port = (MPD_PORT_MIN..=MPD_PORT_MAX).find(|p| !used.contains_key(p))?;
        let device = self.devices.iter_mut().find(|d| d.address == address)?;
        device.settings.mpd_port = Some(port);
        self.save();
        info!("Allocated MPD port {port} to {address}");
        Some(port)
    }

    /// Move a device to an explicit port. Fails when another device
    /// holds it.
    pub fn set_mpd_port(&mut self, address: &str, port: u16) -> Result<(), String> {
        if !(MPD_PORT_MIN..=MPD_PORT_MAX).contains(&port) {
            return Err(format!("mpd_port must be an integer {MPD_PORT_MIN}-{MPD_PORT_MAX}"));
        }
        if let Some(owner) = self.used_mpd_ports().get(&port) {
            if owner != address {
                return Err(format!("Port {port} is already in use by another device"));
            }
        }
        let device = self
            .devices
            .iter_mut()
            .find(|d| d.address == address)
            .ok_or_else(|| format!("Device {address} not found"))?;
        device.settings.mpd_port = Some(port);
        self.save();
        Ok(())
    }

    pub fn release_mpd_port(&mut self, address: &str) {
        if let Some(device) = self.devices.iter_mut().find(|d| d.address == address) {
            if device.settings.mpd_port.take().is_some() {
                self.save();
                debug!("Released MPD port for {address}");
            }
        }
    }
}

/// Write a JSON document with a write-then-rename so readers never see
/// a torn file.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let data = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, DeviceStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DeviceStore::new(dir.path().join("paired_devices.json"));
        (dir, store)
    }

    #[test]
    fn add_refresh_remove() {
        let (_dir, mut store) = store();
        store.add_device("AA:BB:CC:DD:EE:01", "Speaker", true);
        assert!(store.contains("AA:BB:CC:DD:EE:01"));
        let paired_at = store.get_device("AA:BB:CC:DD:EE:01").unwrap().paired_at.clone();
        assert!(!paired_at.is_empty());

        // Re-pair refreshes the name but keeps one record.
        store.add_device("AA:BB:CC:DD:EE:01", "Speaker v2", true);
        assert_eq!(store.devices().len(), 1);
        assert_eq!(store.get_device("AA:BB:CC:DD:EE:01").unwrap().name, "Speaker v2");

        store.remove_device("AA:BB:CC:DD:EE:01");
        assert!(!store.contains("AA:BB:CC:DD:EE:01"));
    }

    #[test]
    fn reload_round_trips_settings_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paired_devices.json");
        {
            let mut store = DeviceStore::new(path.clone());
            store.add_device("AA:BB:CC:DD:EE:01", "Speaker", true);
            store.update_settings(
                "AA:BB:CC:DD:EE:01",
                &SettingsUpdate {
                    idle_mode: Some(IdleMode::PowerSave),
                    power_save_delay: Some(5),
                    ..Default::default()
                },
            );
        }
        let mut store = DeviceStore::new(path);
        store.load().unwrap();
        let s = store.settings("AA:BB:CC:DD:EE:01");
        assert_eq!(s.idle_mode, IdleMode::PowerSave);
        assert_eq!(s.power_save_delay, 5);
        // Untouched fields keep their defaults after the round trip.
        assert_eq!(s.keep_alive_method, KeepAliveMethod::Infrasound);
        assert_eq!(s.audio_profile, AudioProfile::A2dp);
    }

    #[test]
    fn unknown_keys_are_ignored_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paired_devices.json");
        std::fs::write(
            &path,
            r#"{"devices":[{"address":"AA:BB:CC:DD:EE:01","name":"Speaker",
                "idle_mode":"keep_alive","future_knob":42}]}"#,
        )
        .unwrap();
        let mut store = DeviceStore::new(path);
        store.load().unwrap();
        let s = store.settings("AA:BB:CC:DD:EE:01");
        assert_eq!(s.idle_mode, IdleMode::KeepAlive);
        assert!(store.get_device("AA:BB:CC:DD:EE:01").unwrap().auto_connect);
    }

    #[test]
    fn mpd_port_allocation_is_lowest_free_and_unique() {
        let (_dir, mut store) = store();
        for i in 1..=3 {
            store.add_device(&format!("AA:BB:CC:DD:EE:0{i}"), "S", true);
        }
        assert_eq!(store.allocate_mpd_port("AA:BB:CC:DD:EE:01"), Some(6600));
        assert_eq!(store.allocate_mpd_port("AA:BB:CC:DD:EE:02"), Some(6601));
        // Re-allocating returns the existing assignment.
        assert_eq!(store.allocate_mpd_port("AA:BB:CC:DD:EE:01"), Some(6600));

        // Release then allocate yields the freed slot back.
        store.release_mpd_port("AA:BB:CC:DD:EE:01");
        assert_eq!(store.allocate_mpd_port("AA:BB:CC:DD:EE:03"), Some(6600));

        // Explicit assignment refuses an occupied port.
        assert!(store.set_mpd_port("AA:BB:CC:DD:EE:01", 6601).is_err());
        assert!(store.set_mpd_port("AA:BB:CC:DD:EE:01", 6605).is_ok());
        assert!(store.set_mpd_port("AA:BB:CC:DD:EE:01", 6610).is_err());
    }

    #[test]
    fn pool_exhaustion_returns_none() {
        let (_dir, mut store) = store();
        for i in 0..=10u32 {
            store.add_device(&format!("AA:BB:CC:DD:{:02X}:{:02X}", i, i), "S", true);
        }
        let mut allocated = 0;
        for i in 0..=10u32 {
            if store.allocate_mpd_port(&format!("AA:BB:CC:DD:{:02X}:{:02X}", i, i)).is_some() {
                allocated += 1;
            }
        }
        assert_eq!(allocated, 10);
    }

    #[test]
    fn clear_empties_the_document() {
        let (_dir, mut store) = store();
        store.add_device("AA:BB:CC:DD:EE:01", "Speaker", true);
        store.add_device("AA:BB:CC:DD:EE:02", "Speaker 2", false);
        store.clear();
        assert!(store.devices().is_empty());
        assert_eq!(store.auto_connect_devices().len(), 0);
    }
}
