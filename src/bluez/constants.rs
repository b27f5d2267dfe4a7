//! Bluetooth profile UUIDs, BlueZ names, and Class-of-Device helpers.

use uuid::Uuid;

// Advanced Audio Distribution Profile (A2DP)
pub const A2DP_SINK_UUID: Uuid = Uuid::from_u128(0x0000110b_0000_1000_8000_00805f9b34fb);
pub const A2DP_SOURCE_UUID: Uuid = Uuid::from_u128(0x0000110a_0000_1000_8000_00805f9b34fb);

// Audio/Video Remote Control Profile (AVRCP)
pub const AVRCP_TARGET_UUID: Uuid = Uuid::from_u128(0x0000110c_0000_1000_8000_00805f9b34fb);
pub const AVRCP_CONTROLLER_UUID: Uuid = Uuid::from_u128(0x0000110e_0000_1000_8000_00805f9b34fb);

// Hands-Free Profile; Headset Profile (BlueZ treats HSP like HFP)
pub const HFP_UUID: Uuid = Uuid::from_u128(0x0000111e_0000_1000_8000_00805f9b34fb);
pub const HSP_UUID: Uuid = Uuid::from_u128(0x00001108_0000_1000_8000_00805f9b34fb);

// LE Audio (Bluetooth 5.2+), not supported
pub const PACS_UUID: Uuid = Uuid::from_u128(0x00001850_0000_1000_8000_00805f9b34fb);
pub const ASCS_UUID: Uuid = Uuid::from_u128(0x0000184e_0000_1000_8000_00805f9b34fb);

/// UUIDs indicating the device can receive and play audio.
/// Excludes A2DP Source (phones), AVRCP-only remotes, and LE Audio.
pub const SINK_UUIDS: [Uuid; 3] = [A2DP_SINK_UUID, HFP_UUID, HSP_UUID];

pub const LE_AUDIO_UUIDS: [Uuid; 2] = [PACS_UUID, ASCS_UUID];

/// Any of these mark a device as audio-capable (used by stale cleanup).
pub const AUDIO_UUIDS: [Uuid; 8] = [
    A2DP_SINK_UUID,
    A2DP_SOURCE_UUID,
    AVRCP_TARGET_UUID,
    AVRCP_CONTROLLER_UUID,
    HFP_UUID,
    HSP_UUID,
    PACS_UUID,
    ASCS_UUID,
];

pub const BLUEZ_SERVICE: &str = "org.bluez";
pub const ADAPTER_INTERFACE: &str = "org.bluez.Adapter1";
pub const DEVICE_INTERFACE: &str = "org.bluez.Device1";
pub const MEDIA_TRANSPORT_INTERFACE: &str = "org.bluez.MediaTransport1";
pub const MEDIA_CONTROL_INTERFACE: &str = "org.bluez.MediaControl1";
pub const MEDIA_PLAYER_INTERFACE: &str = "org.bluez.MediaPlayer1";
pub const MEDIA_INTERFACE: &str = "org.bluez.Media1";

/// Object path our MPRIS player is exported at (registered with Media1).
pub const PLAYER_PATH: &str = "/org/bt_audio_manager/player";

/// HFP profile switching stays off until the audio container supports
/// SCO sockets; `audio_profile` updates are ignored while this is false.
pub const HFP_SWITCHING_ENABLED: bool = false;

/// Why a discovered device was not surfaced as an audio sink.
pub fn classify_rejection(uuids: &[Uuid]) -> &'static str {
    if uuids.iter().any(|u| LE_AUDIO_UUIDS.contains(u)) {
        return "LE Audio device, not yet supported";
    }
    let has_sink = uuids.iter().any(|u| SINK_UUIDS.contains(u));
    if uuids.contains(&A2DP_SOURCE_UUID) && !has_sink {
        return "audio source only (e.g. phone), not a speaker";
    }
    if !uuids.is_empty()
        && uuids
            .iter()
            .all(|u| *u == AVRCP_TARGET_UUID || *u == AVRCP_CONTROLLER_UUID)
    {
        return "AVRCP remote control only, no audio playback";
    }
    if uuids.is_empty() {
        return "no UUIDs advertised (incomplete SDP)";
    }
    "no audio sink profile"
}

// ── Class of Device (CoD) ──
// The 24-bit CoD encodes the Major Device Class in bits 12-8 and the
// Minor Device Class in bits 7-2 (Bluetooth Assigned Numbers § 2.8).

pub const COD_MAJOR_AUDIO: u32 = 0x04;

pub fn cod_major_class(cod: u32) -> u32 {
    (cod >> 8) & 0x1f
}

pub fn cod_minor_class(cod: u32) -> u32 {
    (cod >> 2) & 0x3f
}

pub fn cod_major_label(cod: u32) -> &'static str {
    match cod_major_class(cod) {
        0x00 => "Misc",
        0x01 => "Computer",
        0x02 => "Phone",
        0x03 => "LAN/AP",
        COD_MAJOR_AUDIO => "Audio/Video",
        0x05 => "Peripheral",
        0x06 => "Imaging",
        0x07 => "Wearable",
        0x08 => "Toy",
        0x09 => "Health",
        _ => "Unknown",
    }
}

/// Audio/Video minor classes that can play audio. Excludes microphones,
/// set-top boxes, cameras, video monitors, and gaming toys.
const COD_AUDIO_SINK_MINORS: [u32; 9] = [
    1,  // Wearable Headset
    2,  // Hands-free Device
    5,  // Loudspeaker
    6,  // Headphones
    7,  // Portable Audio
    8,  // Car Audio
    10, // HiFi Audio Device
    15, // Video Display and Loudspeaker
    16, // Video Conferencing
];

/// Fallback for devices that advertise no UUIDs at all.
pub fn is_cod_audio_sink(cod: u32) -> bool {
    cod_major_class(cod) == COD_MAJOR_AUDIO && COD_AUDIO_SINK_MINORS.contains(&cod_minor_class(cod))
}

/// `AA:BB:CC:DD:EE:FF` on `/org/bluez/hci0` → `/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF`.
pub fn address_to_path(address: &str, adapter_path: &str) -> String {
    format!("{adapter_path}/dev_{}", address.replace(':', "_"))
}

/// Extract the device address from a BlueZ object path, if it has a
/// `dev_XX_XX_XX_XX_XX_XX` component.
pub fn path_to_address(path: &str) -> Option<String> {
    path.split('/')
        .find(|part| part.starts_with("dev_"))
        .map(|part| part[4..].replace('_', ":"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_le_audio_first() {
        assert_eq!(
            classify_rejection(&[PACS_UUID, A2DP_SOURCE_UUID]),
            "LE Audio device, not yet supported"
        );
    }

    #[test]
    fn rejects_source_only_and_avrcp_only() {
        assert_eq!(
            classify_rejection(&[A2DP_SOURCE_UUID]),
            "audio source only (e.g. phone), not a speaker"
        );
        assert_eq!(
            classify_rejection(&[AVRCP_TARGET_UUID, AVRCP_CONTROLLER_UUID]),
            "AVRCP remote control only, no audio playback"
        );
        assert_eq!(
            classify_rejection(&[]),
            "no UUIDs advertised (incomplete SDP)"
        );
    }

    #[test]
    fn cod_classification() {
        // Bose-style loudspeaker: major 0x04, minor 5
        let cod = (COD_MAJOR_AUDIO << 8) | (5 << 2);
        assert!(is_cod_audio_sink(cod));
        assert_eq!(cod_major_label(cod), "Audio/Video");
        // Phone: major 0x02
        assert!(!is_cod_audio_sink(0x02 << 8));
        // Audio/Video but microphone minor (4)
        assert!(!is_cod_audio_sink((COD_MAJOR_AUDIO << 8) | (4 << 2)));
    }

    #[test]
    fn path_round_trip() {
        let path = address_to_path("AA:BB:CC:DD:EE:01", "/org/bluez/hci0");
        assert_eq!(path, "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_01");
        assert_eq!(path_to_address(&path).as_deref(), Some("AA:BB:CC:DD:EE:01"));
        assert_eq!(path_to_address(&format!("{path}/fd0")).as_deref(), Some("AA:BB:CC:DD:EE:01"));
        assert_eq!(path_to_address("/org/bluez/hci0"), None);
    }
}
