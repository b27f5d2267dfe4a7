//! Control-plane handlers.
//!
//! The HTTP/WebSocket transport is a separate component; these
//! functions are the surface it serves. Each handler validates its
//! input, drives the controller, and returns a JSON body or an
//! [`ApiError`] carrying the status code and a user-safe message (raw
//! D-Bus errors never reach clients).

use crate::bluez::constants::HFP_SWITCHING_ENABLED;
use crate::errors::Error;
use crate::manager::Manager;
use crate::store::{AudioProfile, IdleMode, KeepAliveMethod, SettingsUpdate};
use serde_json::{Value, json};

#[derive(Debug)]
pub struct ApiError {
    pub status: u16,
    pub message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self { status: 400, message: message.into() }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::DeviceNotFound(_) => 404,
            Error::InvalidRequest(_) => 400,
            _ => 500,
        };
        Self { status, message: err.friendly_message() }
    }
}

pub type ApiResult = std::result::Result<Value, ApiError>;

/// Strict `XX:XX:XX:XX:XX:XX` check on every address input.
pub fn validate_address(address: &str) -> std::result::Result<String, ApiError> {
    if address.len() == 17 && address.parse::<bluer::Address>().is_ok() {
        Ok(address.to_uppercase())
    } else {
        Err(ApiError::bad_request(
            "Invalid Bluetooth address format (expected XX:XX:XX:XX:XX:XX)",
        ))
    }
}

fn address_from_body(body: &Value) -> std::result::Result<String, ApiError> {
    match body.get("address").and_then(Value::as_str) {
        Some(address) => validate_address(address),
        None => Err(ApiError::bad_request("address is required")),
    }
}

pub fn health() -> ApiResult {
    Ok(json!({"status": "ok"}))
}

pub fn info(manager: &Manager) -> ApiResult {
    let (adapter, adapter_path, _mac) = manager.adapter_info();
    let configured = manager.configured_adapter();
    Ok(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "adapter": adapter,
        "adapter_path": adapter_path,
        "adapter_mac": if configured.contains(':') { json!(configured) } else { Value::Null },
        "hfp_switching_enabled": HFP_SWITCHING_ENABLED,
    }))
}

pub async fn adapters(manager: &Manager) -> ApiResult {
    let adapters = manager.list_adapters().await?;
    Ok(json!({"adapters": adapters}))
}

pub async fn set_adapter(manager: &Manager, body: &Value) -> ApiResult {
    let Some(adapter) = body.get("adapter").and_then(Value::as_str) else {
        return Err(ApiError::bad_request("adapter is required and must be a string"));
    };
    let is_hci_name = adapter.starts_with("hci")
        && adapter.len() > 3
        && adapter[3..].chars().all(|c| c.is_ascii_digit());
    let valid = adapter == "auto" || validate_address(adapter).is_ok() || is_hci_name;
    if !valid {
        return Err(ApiError::bad_request(
            "adapter must be 'auto', a MAC address, or an hciN name",
        ));
    }
    let clean = body.get("clean").and_then(Value::as_bool).unwrap_or(false);
    manager.set_adapter(adapter, clean).await?;
    Ok(json!({"adapter": adapter, "restart_required": true, "cleaned": clean}))
}

/// The transport forwards this to the host orchestrator after
/// responding; the core only acknowledges.
pub fn restart() -> ApiResult {
    Ok(json!({"restarting": true}))
}

pub async fn devices(manager: &Manager) -> ApiResult {
    Ok(json!({"devices": manager.get_all_devices().await}))
}

pub async fn scan(manager: &Manager, body: &Value) -> ApiResult {
    let duration = body.get("duration").and_then(Value::as_u64);
    if let Some(duration) = duration {
        if !(5..=120).contains(&duration) {
            return Err(ApiError::bad_request("duration must be between 5 and 120 seconds"));
        }
    }
    let effective = duration.unwrap_or(manager.runtime_settings().scan_duration_seconds);
    manager.start_scan(duration).await;
    Ok(json!({"scanning": true, "duration": effective}))
}

pub fn scan_status(manager: &Manager) -> ApiResult {
    Ok(json!({"scanning": manager.is_scanning()}))
}

pub async fn pair(manager: &Manager, body: &Value) -> ApiResult {
    let address = address_from_body(body)?;
    Ok(manager.pair_device(&address).await?)
}

pub async fn connect(manager: &Manager, body: &Value) -> ApiResult {
    let address = address_from_body(body)?;
    let connected = manager.connect_device(&address).await?;
    Ok(json!({"connected": connected, "address": address}))
}

pub async fn disconnect(manager: &Manager, body: &Value) -> ApiResult {
    let address = address_from_body(body)?;
    manager.disconnect_device(&address).await?;
    Ok(json!({"disconnected": true, "address": address}))
}

pub async fn force_reconnect(manager: &Manager, body: &Value) -> ApiResult {
    let address = address_from_body(body)?;
    let reconnected = manager.force_reconnect_device(&address).await?;
    Ok(json!({"reconnected": reconnected, "address": address}))
}

pub async fn forget(manager: &Manager, body: &Value) -> ApiResult {
    let address = address_from_body(body)?;
    manager.forget_device(&address).await?;
    Ok(json!({"forgotten": true, "address": address}))
}

pub async fn update_device_settings(manager: &Manager, address: &str, body: &Value) -> ApiResult {
    let address = validate_address(address)?;
    let (update, mpd_port) = parse_settings_update(body)?;
    let settings = manager.update_device_settings(&address, update, mpd_port).await?;
    Ok(json!({"address": address, "settings": settings}))
}

pub fn get_settings(manager: &Manager) -> ApiResult {
    Ok(serde_json::to_value(manager.runtime_settings()).unwrap_or_default())
}

pub fn update_settings(manager: &Manager, body: &Value) -> ApiResult {
    match manager.update_runtime_settings(body) {
        Ok(runtime) => Ok(serde_json::to_value(runtime).unwrap_or_default()),
        Err(errors) => Err(ApiError::bad_request(errors.join("; "))),
    }
}

pub async fn audio_sinks(manager: &Manager) -> ApiResult {
    Ok(json!({"sinks": manager.get_audio_sinks().await}))
}

pub async fn state(manager: &Manager, mpris_after: f64, avrcp_after: f64) -> ApiResult {
    Ok(manager.state_snapshot(mpris_after, avrcp_after).await)
}

pub fn logs(manager: &Manager) -> ApiResult {
    Ok(json!({"logs": manager.recent_logs()}))
}

/// Parse and validate the allowed per-device settings keys. Returns
/// the typed partial update plus an explicit MPD port request.
fn parse_settings_update(
    body: &Value,
) -> std::result::Result<(SettingsUpdate, Option<u16>), ApiError> {
    let Some(obj) = body.as_object() else {
        return Err(ApiError::bad_request("Invalid JSON"));
    };
    let mut update = SettingsUpdate::default();
    let mut mpd_port = None;
    let mut any = false;

    if let Some(v) = obj.get("idle_mode") {
        update.idle_mode = Some(match v.as_str() {
            Some("default") => IdleMode::Default,
            Some("power_save") => IdleMode::PowerSave,
            Some("keep_alive") => IdleMode::KeepAlive,
            Some("auto_disconnect") => IdleMode::AutoDisconnect,
            _ => {
                return Err(ApiError::bad_request(
                    "idle_mode must be one of default, power_save, keep_alive, auto_disconnect",
                ));
            }
        });
        any = true;
    }
    if let Some(v) = obj.get("keep_alive_method") {
        update.keep_alive_method = Some(match v.as_str() {
            Some("silence") => KeepAliveMethod::Silence,
            Some("infrasound") => KeepAliveMethod::Infrasound,
            _ => {
                return Err(ApiError::bad_request(
                    "keep_alive_method must be 'silence' or 'infrasound'",
                ));
            }
        });
        any = true;
    }
    if let Some(v) = obj.get("power_save_delay") {
        match v.as_u64() {
            Some(delay) if delay <= 300 => update.power_save_delay = Some(delay as u32),
            _ => return Err(ApiError::bad_request("power_save_delay must be 0-300 seconds")),
        }
        any = true;
    }
    if let Some(v) = obj.get("auto_disconnect_minutes") {
        match v.as_u64() {
            Some(minutes) if (5..=60).contains(&minutes) => {
                update.auto_disconnect_minutes = Some(minutes as u32)
            }
            _ => return Err(ApiError::bad_request("auto_disconnect_minutes must be 5-60")),
        }
        any = true;
    }
    if let Some(v) = obj.get("mpd_enabled") {
        match v.as_bool() {
            Some(enabled) => update.mpd_enabled = Some(enabled),
            None => return Err(ApiError::bad_request("mpd_enabled must be a boolean")),
        }
        any = true;
    }
    if let Some(v) = obj.get("mpd_port") {
        match v.as_u64() {
            Some(port) if (6600..=6609).contains(&port) => mpd_port = Some(port as u16),
            _ => return Err(ApiError::bad_request("mpd_port must be an integer 6600-6609")),
        }
        any = true;
    }
    if let Some(v) = obj.get("mpd_hw_volume") {
        match v.as_u64() {
            Some(volume) if (1..=100).contains(&volume) => {
                update.mpd_hw_volume = Some(volume as u32)
            }
            _ => return Err(ApiError::bad_request("mpd_hw_volume must be an integer 1-100")),
        }
        any = true;
    }
    if let Some(v) = obj.get("avrcp_enabled") {
        match v.as_bool() {
            Some(enabled) => update.avrcp_enabled = Some(enabled),
            None => return Err(ApiError::bad_request("avrcp_enabled must be a boolean")),
        }
        any = true;
    }
    if let Some(v) = obj.get("audio_profile") {
        // Gated until the audio container supports SCO sockets; the
        // key is accepted and dropped so older UIs keep working.
        if HFP_SWITCHING_ENABLED {
            update.audio_profile = Some(match v.as_str() {
                Some("a2dp") => AudioProfile::A2dp,
                Some("hfp") => AudioProfile::Hfp,
                _ => return Err(ApiError::bad_request("audio_profile must be 'a2dp' or 'hfp'")),
            });
        }
        any = true;
    }

    if !any {
        return Err(ApiError::bad_request("No valid settings provided"));
    }
    Ok((update, mpd_port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_validation() {
        assert_eq!(validate_address("aa:bb:cc:dd:ee:01").unwrap(), "AA:BB:CC:DD:EE:01");
        assert!(validate_address("AA:BB:CC:DD:EE").is_err());
        assert!(validate_address("AA:BB:CC:DD:EE:GG").is_err());
        assert!(validate_address("AABBCCDDEE01").is_err());
        assert!(validate_address("AA:BB:CC:DD:EE:01:22").is_err());
    }

    #[test]
    fn missing_address_is_rejected() {
        let err = address_from_body(&json!({})).unwrap_err();
        assert_eq!(err.status, 400);
        assert_eq!(err.message, "address is required");
    }

    #[test]
    fn settings_bounds() {
        // 60 minutes is the inclusive maximum; 61 is rejected.
        assert!(parse_settings_update(&json!({"auto_disconnect_minutes": 60})).is_ok());
        assert!(parse_settings_update(&json!({"auto_disconnect_minutes": 61})).is_err());
        assert!(parse_settings_update(&json!({"auto_disconnect_minutes": 4})).is_err());

        assert!(parse_settings_update(&json!({"power_save_delay": 0})).is_ok());
        assert!(parse_settings_update(&json!({"power_save_delay": 300})).is_ok());
        assert!(parse_settings_update(&json!({"power_save_delay": 301})).is_err());

        assert!(parse_settings_update(&json!({"mpd_port": 6600})).is_ok());
        assert!(parse_settings_update(&json!({"mpd_port": 6610})).is_err());
        assert!(parse_settings_update(&json!({"mpd_hw_volume": 0})).is_err());
        assert!(parse_settings_update(&json!({"mpd_hw_volume": 100})).is_ok());
    }

    #[test]
    fn idle_mode_values() {
        let (update, _) =
            parse_settings_update(&json!({"idle_mode": "power_save"})).unwrap();
        assert_eq!(update.idle_mode, Some(IdleMode::PowerSave));
        assert!(parse_settings_update(&json!({"idle_mode": "sleepy"})).is_err());
    }

    #[test]
    fn audio_profile_is_gated() {
        // Accepted but dropped while HFP switching is disabled.
        let (update, _) = parse_settings_update(&json!({"audio_profile": "hfp"})).unwrap();
        assert_eq!(update.audio_profile, None);
    }

    #[test]
    fn empty_update_is_rejected() {
        assert!(parse_settings_update(&json!({})).is_err());
        assert!(parse_settings_update(&json!({"unknown_key": 1})).is_err());
    }
}
