//! Error taxonomy for the orchestrator core.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Transient bus failure; the caller may retry with backoff.
    #[error("D-Bus failure: {0}")]
    Bus(#[from] zbus::Error),

    #[error("D-Bus failure: {0}")]
    BusFdo(#[from] zbus::fdo::Error),

    #[error("BlueZ: {0}")]
    Bluetooth(#[from] bluer::Error),

    /// Fatal at startup; advisory when switching adapters.
    #[error("Bluetooth adapter {0} is not powered")]
    AdapterNotPowered(String),

    #[error("no Bluetooth adapter matching '{0}' found")]
    AdapterNotFound(String),

    #[error("device {0} not found")]
    DeviceNotFound(String),

    #[error("operation already in progress for {0}")]
    InProgress(String),

    #[error("could not activate {profile} profile for {address}")]
    ProfileActivation { address: String, profile: String },

    /// The core keeps running with a null sink view when PA is away.
    #[error("PulseAudio unavailable: {0}")]
    PulseUnavailable(String),

    #[error("subprocess failed: {0}")]
    Subprocess(String),

    #[error("persistence: {0}")]
    Persistence(#[from] std::io::Error),

    #[error("{0}")]
    InvalidRequest(String),
}

/// Substring → user-facing message for the BlueZ errors clients commonly
/// hit. Anything unmatched gets a generic message so raw D-Bus internals
/// never leak to the UI.
const BLUEZ_ERROR_MAP: [(&str, &str); 11] = [
    (
        "Page Timeout",
        "Device not responding. Make sure it is in pairing mode and nearby.",
    ),
    (
        "In Progress",
        "A pairing or connection attempt is already in progress. Please wait.",
    ),
    ("Already Exists", "Device is already paired."),
    ("Does Not Exist", "Device not found. Try scanning again."),
    (
        "Not Ready",
        "Bluetooth adapter is not ready. Try again in a moment.",
    ),
    (
        "Connection refused",
        "Device refused the connection. Is it in pairing mode?",
    ),
    (
        "br-connection-canceled",
        "Connection was canceled (device may have been busy).",
    ),
    (
        "br-connection-busy",
        "A connection attempt is already in progress. Please wait.",
    ),
    ("le-connection-abort-by-local", "Connection aborted locally."),
    (
        "Software caused connection abort",
        "Connection dropped unexpectedly. Try again.",
    ),
    (
        "Host is down",
        "Device is not reachable. Make sure it is powered on and nearby.",
    ),
];

const GENERIC_ERROR: &str = "Operation failed. Check logs for details.";

impl Error {
    /// Message suitable for returning to control-plane clients.
    pub fn friendly_message(&self) -> String {
        match self {
            Error::Bluetooth(e) => friendly_bluez_message(&e.to_string()),
            Error::Bus(e) => friendly_bluez_message(&e.to_string()),
            Error::DeviceNotFound(addr) => format!("Device {addr} not found"),
            Error::InvalidRequest(msg) => msg.clone(),
            Error::InProgress(_) => {
                "A pairing or connection attempt is already in progress. Please wait.".into()
            }
            Error::AdapterNotPowered(_) | Error::AdapterNotFound(_) => self.to_string(),
            _ => GENERIC_ERROR.into(),
        }
    }

    /// True for errors where a retry with backoff can help.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Bus(_) | Error::PulseUnavailable(_))
    }
}

fn friendly_bluez_message(raw: &str) -> String {
    for (pattern, friendly) in BLUEZ_ERROR_MAP {
        if raw.contains(pattern) {
            return friendly.to_string();
        }
    }
    log::debug!("Unmapped error returned to client: {raw}");
    GENERIC_ERROR.to_string()
}

/// "Already paired"-style outcomes are success for idempotent operations.
pub fn is_already_exists(err: &bluer::Error) -> bool {
    err.kind == bluer::ErrorKind::AlreadyExists || err.message.contains("Already Exists")
}

/// Profile teardown against a profile that is not up is success.
pub fn is_not_connected(err: &bluer::Error) -> bool {
    err.kind == bluer::ErrorKind::DoesNotExist
        || err.message.contains("Does Not Exist")
        || err.message.contains("Not Connected")
        || err.message.contains("NotConnected")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_bluez_strings() {
        assert_eq!(
            friendly_bluez_message("org.bluez.Error.Failed: Page Timeout"),
            "Device not responding. Make sure it is in pairing mode and nearby."
        );
        assert_eq!(
            friendly_bluez_message("br-connection-busy"),
            "A connection attempt is already in progress. Please wait."
        );
    }

    #[test]
    fn unmapped_errors_stay_generic() {
        assert_eq!(
            friendly_bluez_message("org.freedesktop.DBus.Error.AccessDenied"),
            GENERIC_ERROR
        );
    }

    #[test]
    fn invalid_request_passes_through() {
        let e = Error::InvalidRequest("power_save_delay must be 0-300 seconds".into());
        assert_eq!(e.friendly_message(), "power_save_delay must be 0-300 seconds");
    }
}
