//! MPRIS MediaPlayer2.Player exported on the system bus.
//!
//! BlueZ binds per-device AVRCP controller sessions to a player
//! registered through `org.bluez.Media1`, so speaker button presses
//! arrive here as plain D-Bus method calls. Each handled call is
//! forwarded as a `(command, detail)` pair to the orchestrator.
//!
//! `set_playback_status` exists so the orchestrator can claim "Playing"
//! when an A2DP transport goes active; several speakers only enable
//! their AVRCP absolute-volume reporting while the player looks busy.

use crate::bluez::constants::{BLUEZ_SERVICE, MEDIA_INTERFACE, PLAYER_PATH};
use log::{debug, info};
use std::collections::HashMap;
use tokio::sync::mpsc::UnboundedSender;
use zbus::object_server::SignalEmitter;
use zbus::zvariant::{ObjectPath, Value};

pub type CommandSender = UnboundedSender<(String, String)>;

pub struct MprisPlayer {
    playback_status: String,
    volume: f64,
    commands: CommandSender,
}

impl MprisPlayer {
    fn new(commands: CommandSender) -> Self {
        Self { playback_status: "Stopped".into(), volume: 1.0, commands }
    }

    fn send(&self, command: &str, detail: impl Into<String>) {
        let _ = self.commands.send((command.to_string(), detail.into()));
    }
}

#[zbus::interface(name = "org.mpris.MediaPlayer2.Player")]
impl MprisPlayer {
    async fn play(&mut self, #[zbus(signal_emitter)] emitter: SignalEmitter<'_>) {
        info!("AVRCP command: Play");
        self.playback_status = "Playing".into();
        let _ = self.playback_status_changed(&emitter).await;
        self.send("Play", "");
    }

    async fn pause(&mut self, #[zbus(signal_emitter)] emitter: SignalEmitter<'_>) {
        info!("AVRCP command: Pause");
        self.playback_status = "Paused".into();
        let _ = self.playback_status_changed(&emitter).await;
        self.send("Pause", "");
    }

    async fn play_pause(&mut self, #[zbus(signal_emitter)] emitter: SignalEmitter<'_>) {
        info!("AVRCP command: PlayPause");
        self.playback_status =
            if self.playback_status == "Playing" { "Paused".into() } else { "Playing".into() };
        let _ = self.playback_status_changed(&emitter).await;
        self.send("PlayPause", self.playback_status.clone());
    }

    async fn stop(&mut self, #[zbus(signal_emitter)] emitter: SignalEmitter<'_>) {
        info!("AVRCP command: Stop");
        self.playback_status = "Stopped".into();
        let _ = self.playback_status_changed(&emitter).await;
        self.send("Stop", "");
    }

    fn next(&self) {
        info!("AVRCP command: Next");
        self.send("Next", "");
    }

    fn previous(&self) {
        info!("AVRCP command: Previous");
        self.send("Previous", "");
    }

    fn seek(&self, offset: i64) {
        debug!("AVRCP command: Seek offset={offset}");
        self.send("Seek", offset.to_string());
    }

    fn set_position(&self, track_id: ObjectPath<'_>, position: i64) {
        debug!("AVRCP command: SetPosition track={track_id} pos={position}");
        self.send("SetPosition", position.to_string());
    }

    fn open_uri(&self, uri: String) {
        debug!("AVRCP command: OpenUri uri={uri}");
        self.send("OpenUri", uri);
    }

    #[zbus(property)]
    fn playback_status(&self) -> String {
        self.playback_status.clone()
    }

    #[zbus(property)]
    fn loop_status(&self) -> String {
        "None".into()
    }

    #[zbus(property)]
    fn set_loop_status(&mut self, _status: String) {}

    #[zbus(property)]
    fn rate(&self) -> f64 {
        1.0
    }

    #[zbus(property)]
    fn set_rate(&mut self, _rate: f64) {}

    #[zbus(property)]
    fn shuffle(&self) -> bool {
        false
    }

    #[zbus(property)]
    fn set_shuffle(&mut self, _shuffle: bool) {}

    #[zbus(property)]
    fn metadata(&self) -> HashMap<String, Value<'static>> {
        default_metadata()
    }

    /// AVRCP absolute volume arrives as a write to this property.
    #[zbus(property)]
    fn volume(&self) -> f64 {
        self.volume
    }

    #[zbus(property)]
    fn set_volume(&mut self, volume: f64) {
        let old = self.volume;
        self.volume = volume.clamp(0.0, 1.0);
        if (old - self.volume).abs() > 0.01 {
            info!("AVRCP volume: {:.0}%", self.volume * 100.0);
            self.send("Volume", format!("{:.0}", self.volume * 100.0));
        }
    }

    #[zbus(property)]
    fn position(&self) -> i64 {
        0
    }

    #[zbus(property)]
    fn minimum_rate(&self) -> f64 {
        1.0
    }

    #[zbus(property)]
    fn maximum_rate(&self) -> f64 {
        1.0
    }

    #[zbus(property)]
    fn can_go_next(&self) -> bool {
        true
    }

    #[zbus(property)]
    fn can_go_previous(&self) -> bool {
        true
    }

    #[zbus(property)]
    fn can_play(&self) -> bool {
        true
    }

    #[zbus(property)]
    fn can_pause(&self) -> bool {
        true
    }

    #[zbus(property)]
    fn can_seek(&self) -> bool {
        false
    }

    #[zbus(property)]
    fn can_control(&self) -> bool {
        true
    }
}

fn default_metadata() -> HashMap<String, Value<'static>> {
    let mut metadata = HashMap::new();
    metadata.insert("xesam:title".to_string(), Value::from("Bluetooth Audio"));
    metadata.insert("xesam:artist".to_string(), Value::from(vec![String::new()]));
    metadata.insert("mpris:length".to_string(), Value::from(0i64));
    metadata
}

/// Lifecycle wrapper: export the interface, register with Media1.
pub struct AvrcpMediaPlayer {
    conn: zbus::Connection,
    adapter_path: String,
    registered: bool,
}

impl AvrcpMediaPlayer {
    pub fn new(conn: zbus::Connection, adapter_path: &str) -> Self {
        Self { conn, adapter_path: adapter_path.to_string(), registered: false }
    }

    async fn media_proxy(&self) -> zbus::Result<zbus::Proxy<'_>> {
        zbus::Proxy::new(&self.conn, BLUEZ_SERVICE, self.adapter_path.as_str(), MEDIA_INTERFACE)
            .await
    }

    pub async fn register(&mut self, commands: CommandSender) -> zbus::Result<()> {
        self.conn.object_server().at(PLAYER_PATH, MprisPlayer::new(commands)).await?;

        let mut properties: HashMap<&str, Value> = HashMap::new();
        properties.insert("PlaybackStatus", Value::from("Stopped"));
        properties.insert("LoopStatus", Value::from("None"));
        properties.insert("Rate", Value::from(1.0f64));
        properties.insert("Shuffle", Value::from(false));
        properties.insert("Volume", Value::from(1.0f64));
        properties.insert("Position", Value::from(0i64));
        properties.insert("MinimumRate", Value::from(1.0f64));
        properties.insert("MaximumRate", Value::from(1.0f64));
        properties.insert("CanGoNext", Value::from(true));
        properties.insert("CanGoPrevious", Value::from(true));
        properties.insert("CanPlay", Value::from(true));
        properties.insert("CanPause", Value::from(true));
        properties.insert("CanSeek", Value::from(false));
        properties.insert("CanControl", Value::from(true));

        let path = ObjectPath::try_from(PLAYER_PATH)?;
        self.media_proxy().await?.call::<_, _, ()>("RegisterPlayer", &(path, properties)).await?;
        self.registered = true;
        info!("AVRCP media player registered at {PLAYER_PATH} (receives speaker button events)");
        Ok(())
    }

    pub async fn unregister(&mut self) -> zbus::Result<()> {
        if self.registered {
            let path = ObjectPath::try_from(PLAYER_PATH)?;
            if let Err(e) =
                self.media_proxy().await?.call::<_, _, ()>("UnregisterPlayer", &(path,)).await
            {
                debug!("Player unregister failed (may already be gone): {e}");
            }
            self.registered = false;
        }
        self.conn.object_server().remove::<MprisPlayer, _>(PLAYER_PATH).await?;
        info!("AVRCP media player unregistered");
        Ok(())
    }

    /// Force the advertised playback state, e.g. "Playing" when an A2DP
    /// transport goes active.
    pub async fn set_playback_status(&self, status: &str) -> zbus::Result<()> {
        let iface = self
            .conn
            .object_server()
            .interface::<_, MprisPlayer>(PLAYER_PATH)
            .await?;
        let mut player = iface.get_mut().await;
        if player.playback_status != status {
            player.playback_status = status.to_string();
            player.playback_status_changed(iface.signal_emitter()).await?;
            debug!("MPRIS PlaybackStatus forced to {status}");
        }
        Ok(())
    }
}
