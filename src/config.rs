//! Daemon configuration: static options plus runtime settings.
//!
//! Static options (log level) live in `<data>/options.json`. Runtime
//! knobs managed through the UI (adapter selection, reconnect tuning,
//! scan duration) live in `<config>/settings.json` and survive
//! reinstalls. Two one-time migrations run on load: settings moving
//! from the data dir to the config dir, and legacy runtime keys left
//! behind in options.json.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_RECONNECT_INTERVAL: u64 = 30;
pub const DEFAULT_RECONNECT_MAX_BACKOFF: u64 = 300;
pub const DEFAULT_SCAN_DURATION: u64 = 30;

/// Runtime settings persisted to settings.json and hot-reloadable
/// through the control plane.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeSettings {
    pub auto_reconnect: bool,
    pub reconnect_interval_seconds: u64,
    pub reconnect_max_backoff_seconds: u64,
    pub scan_duration_seconds: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_interval_seconds: DEFAULT_RECONNECT_INTERVAL,
            reconnect_max_backoff_seconds: DEFAULT_RECONNECT_MAX_BACKOFF,
            scan_duration_seconds: DEFAULT_SCAN_DURATION,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct SettingsFile {
    bt_adapter: String,
    #[serde(flatten)]
    runtime: RuntimeSettings,
}

impl Default for SettingsFile {
    fn default() -> Self {
        Self { bt_adapter: "auto".into(), runtime: RuntimeSettings::default() }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub log_level: String,
    /// `"auto"`, an adapter MAC, or a legacy `hciN` interface name.
    pub bt_adapter: String,
    pub runtime: RuntimeSettings,
    /// Explicit PulseAudio server address, if injected.
    pub pulse_server: Option<String>,
    data_dir: PathBuf,
    config_dir: PathBuf,
}

impl AppConfig {
    pub fn load(data_dir: &Path, config_dir: &Path, pulse_server: Option<String>) -> Self {
        let mut config = Self {
            log_level: "info".into(),
            bt_adapter: "auto".into(),
            runtime: RuntimeSettings::default(),
            pulse_server,
            data_dir: data_dir.to_path_buf(),
            config_dir: config_dir.to_path_buf(),
        };

        let options_path = data_dir.join("options.json");
        let options: serde_json::Value = std::fs::read_to_string(&options_path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();
        if let Some(level) = options.get("log_level").and_then(|v| v.as_str()) {
            config.log_level = level.to_string();
        }

        // One-time move of settings.json from the data dir to the config dir.
        let settings_path = config.settings_path();
        let legacy_path = data_dir.join("settings.json");
        if !settings_path.exists() && legacy_path.exists() {
            info!(
                "Migrating settings from {} to {}",
                legacy_path.display(),
                settings_path.display()
            );
            if let Some(parent) = settings_path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            if let Err(e) = std::fs::copy(&legacy_path, &settings_path) {
                warn!("Settings migration failed: {e}");
            }
        }

        if settings_path.exists() {
            match std::fs::read_to_string(&settings_path)
                .map_err(|e| e.to_string())
                .and_then(|s| serde_json::from_str::<SettingsFile>(&s).map_err(|e| e.to_string()))
            {
                Ok(file) => {
                    config.bt_adapter = file.bt_adapter;
                    config.runtime = file.runtime;
                    info!("Loaded settings from {}", settings_path.display());
                    return config;
                }
                Err(e) => {
                    warn!("Failed to parse {}: {e}, trying migration", settings_path.display())
                }
            }
        }

        // Legacy runtime keys in options.json (user upgrading from an
        // older version where everything lived on the options page).
        let mut migrated = false;
        if let Some(obj) = options.as_object() {
            if let Some(v) = obj.get("bt_adapter").and_then(|v| v.as_str()) {
                config.bt_adapter = v.to_string();
                migrated = true;
            }
            if let Some(v) = obj.get("auto_reconnect").and_then(|v| v.as_bool()) {
                config.runtime.auto_reconnect = v;
                migrated = true;
            }
            if let Some(v) = obj.get("reconnect_interval_seconds").and_then(|v| v.as_u64()) {
                config.runtime.reconnect_interval_seconds = v;
                migrated = true;
            }
            if let Some(v) = obj.get("reconnect_max_backoff_seconds").and_then(|v| v.as_u64()) {
                config.runtime.reconnect_max_backoff_seconds = v;
                migrated = true;
            }
            if let Some(v) = obj.get("scan_duration_seconds").and_then(|v| v.as_u64()) {
                config.runtime.scan_duration_seconds = v;
                migrated = true;
            }
        }
        if migrated {
            info!("Migrated runtime settings out of options.json");
        }

        // Save so the file exists either way.
        if let Err(e) = config.save_settings() {
            warn!("Could not write initial settings: {e}");
        }
        config
    }

    pub fn settings_path(&self) -> PathBuf {
        self.config_dir.join("settings.json")
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn device_store_path(&self) -> PathBuf {
        self.data_dir.join("paired_devices.json")
    }

    pub fn keepalive_migration_marker(&self) -> PathBuf {
        self.data_dir.join(".keepalive_migrated")
    }

    pub fn options_path(&self) -> PathBuf {
        self.data_dir.join("options.json")
    }

    /// True when `bt_adapter` holds a MAC address (current format).
    pub fn bt_adapter_is_mac(&self) -> bool {
        self.bt_adapter.contains(':')
    }

    /// True when `bt_adapter` holds a legacy interface name like `hci1`.
    pub fn bt_adapter_is_legacy_hci(&self) -> bool {
        self.bt_adapter != "auto" && !self.bt_adapter.contains(':')
    }

    pub fn save_settings(&self) -> std::io::Result<()> {
        let file =
            SettingsFile { bt_adapter: self.bt_adapter.clone(), runtime: self.runtime.clone() };
        if let Some(parent) = self.settings_path().parent() {
            std::fs::create_dir_all(parent)?;
        }
        crate::store::write_json_atomic(&self.settings_path(), &file)?;
        info!("Settings saved to {}", self.settings_path().display());
        Ok(())
    }
}

/// Validate and apply a partial runtime-settings update. Nothing is
/// applied unless every provided field passes validation.
pub fn apply_runtime_update(
    runtime: &mut RuntimeSettings,
    body: &serde_json::Value,
) -> std::result::Result<(), Vec<String>> {
    let mut errors = Vec::new();
    let mut staged = runtime.clone();

    if let Some(v) = body.get("auto_reconnect") {
        match v.as_bool() {
            Some(b) => staged.auto_reconnect = b,
            None => errors.push("auto_reconnect must be a boolean".into()),
        }
    }
    if let Some(v) = body.get("reconnect_interval_seconds") {
        match v.as_u64() {
            Some(n) if (5..=600).contains(&n) => staged.reconnect_interval_seconds = n,
            _ => {
                errors.push("reconnect_interval_seconds must be an integer between 5 and 600".into())
            }
        }
    }
    if let Some(v) = body.get("reconnect_max_backoff_seconds") {
        match v.as_u64() {
            Some(n) if (60..=3600).contains(&n) => staged.reconnect_max_backoff_seconds = n,
            _ => errors
                .push("reconnect_max_backoff_seconds must be an integer between 60 and 3600".into()),
        }
    }
    if let Some(v) = body.get("scan_duration_seconds") {
        match v.as_u64() {
            Some(n) if (5..=120).contains(&n) => staged.scan_duration_seconds = n,
            _ => errors.push("scan_duration_seconds must be an integer between 5 and 120".into()),
        }
    }

    if errors.is_empty() {
        *runtime = staged;
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_when_nothing_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(dir.path(), dir.path(), None);
        assert_eq!(config.bt_adapter, "auto");
        assert!(config.runtime.auto_reconnect);
        assert_eq!(config.runtime.reconnect_interval_seconds, 30);
        // Defaults were persisted so the file exists for the UI.
        assert!(config.settings_path().exists());
    }

    #[test]
    fn adapter_spec_forms() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::load(dir.path(), dir.path(), None);
        assert!(!config.bt_adapter_is_mac());
        assert!(!config.bt_adapter_is_legacy_hci());
        config.bt_adapter = "00:1A:7D:DA:71:13".into();
        assert!(config.bt_adapter_is_mac());
        config.bt_adapter = "hci1".into();
        assert!(config.bt_adapter_is_legacy_hci());
    }

    #[test]
    fn settings_round_trip_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::load(dir.path(), dir.path(), None);
        config.bt_adapter = "00:1A:7D:DA:71:13".into();
        config.runtime.reconnect_interval_seconds = 60;
        config.save_settings().unwrap();

        let reloaded = AppConfig::load(dir.path(), dir.path(), None);
        assert_eq!(reloaded.bt_adapter, "00:1A:7D:DA:71:13");
        assert_eq!(reloaded.runtime.reconnect_interval_seconds, 60);
    }

    #[test]
    fn migrates_settings_from_data_dir() {
        let data = tempfile::tempdir().unwrap();
        let cfg = tempfile::tempdir().unwrap();
        std::fs::write(
            data.path().join("settings.json"),
            json!({"bt_adapter": "hci1", "scan_duration_seconds": 45}).to_string(),
        )
        .unwrap();
        let config = AppConfig::load(data.path(), cfg.path(), None);
        assert_eq!(config.bt_adapter, "hci1");
        assert_eq!(config.runtime.scan_duration_seconds, 45);
        assert!(cfg.path().join("settings.json").exists());
    }

    #[test]
    fn migrates_legacy_options_keys() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("options.json"),
            json!({"log_level": "debug", "auto_reconnect": false, "scan_duration_seconds": 20})
                .to_string(),
        )
        .unwrap();
        let config = AppConfig::load(dir.path(), dir.path(), None);
        assert_eq!(config.log_level, "debug");
        assert!(!config.runtime.auto_reconnect);
        assert_eq!(config.runtime.scan_duration_seconds, 20);
    }

    #[test]
    fn runtime_update_validates_ranges() {
        let mut runtime = RuntimeSettings::default();
        let errors = apply_runtime_update(
            &mut runtime,
            &json!({"reconnect_interval_seconds": 4, "scan_duration_seconds": 121}),
        )
        .unwrap_err();
        assert_eq!(errors.len(), 2);
        // Nothing applied when any field is invalid.
        assert_eq!(runtime.reconnect_interval_seconds, 30);

        apply_runtime_update(
            &mut runtime,
            &json!({"reconnect_interval_seconds": 5, "reconnect_max_backoff_seconds": 3600}),
        )
        .unwrap();
        assert_eq!(runtime.reconnect_interval_seconds, 5);
        assert_eq!(runtime.reconnect_max_backoff_seconds, 3600);
    }
}
