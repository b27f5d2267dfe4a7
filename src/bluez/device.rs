//! Per-device handle: BlueZ operations plus the AVRCP player watch.

use crate::bluez::constants::{MEDIA_PLAYER_INTERFACE, address_to_path};
use crate::bluez::watcher::{BluezWatcher, value_to_json};
use crate::errors::{Result, is_already_exists, is_not_connected};
use log::{debug, info, warn};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

const AVRCP_WATCH_RETRIES: u32 = 3;
const AVRCP_WATCH_DELAY: Duration = Duration::from_secs(2);
/// Devices without a remote-side player are not re-searched until this
/// has elapsed.
const AVRCP_SEARCH_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Default)]
struct WatchState {
    player_path: Option<String>,
    avrcp_last_search: Option<Instant>,
}

/// Wraps one `org.bluez.Device1` object. Exactly one handle exists per
/// tracked address (clones share state); the adapter owning the device
/// is resolved when the handle is created, never cached elsewhere.
#[derive(Clone)]
pub struct DeviceHandle {
    address: String,
    path: String,
    device: bluer::Device,
    watcher: BluezWatcher,
    watch: Arc<Mutex<WatchState>>,
}

impl DeviceHandle {
    pub fn new(
        address: &str,
        adapter_path: &str,
        device: bluer::Device,
        watcher: BluezWatcher,
    ) -> Self {
        Self {
            address: address.to_string(),
            path: address_to_path(address, adapter_path),
            device,
            watcher,
            watch: Arc::new(Mutex::new(WatchState::default())),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Idempotent pair: skips the BlueZ call when already paired and
    /// treats an AlreadyExists race as success.
    pub async fn pair(&self) -> Result<()> {
        if self.device.is_paired().await? {
            debug!("Device {} already paired", self.address);
            return Ok(());
        }
        info!("Pairing with {}...", self.address);
        match self.device.pair().await {
            Ok(()) => {
                info!("Paired with {}", self.address);
                Ok(())
            }
            Err(e) if is_already_exists(&e) => {
                debug!("Device {} already paired (race)", self.address);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Trusted devices may initiate BlueZ-level auto-reconnect.
    pub async fn set_trusted(&self, trusted: bool) -> Result<()> {
        self.device.set_trusted(trusted).await?;
        info!("Device {} trusted={trusted}", self.address);
        Ok(())
    }

    pub async fn connect(&self) -> Result<()> {
        info!("Connecting to {}...", self.address);
        self.device.connect().await?;
        info!("Connected to {}", self.address);
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<()> {
        info!("Disconnecting from {}...", self.address);
        if let Err(e) = self.device.disconnect().await {
            debug!("Disconnect from {} failed: {e}", self.address);
        }
        Ok(())
    }

    /// Explicitly bring up one profile (e.g. A2DP when the device
    /// reconnected with only the link layer).
    pub async fn connect_profile(&self, uuid: Uuid) -> Result<()> {
        info!("ConnectProfile {uuid} on {}...", self.address);
        self.device.connect_profile(&uuid).await?;
        Ok(())
    }

    /// Tear down one profile without dropping the device connection.
    /// Success when the profile was not up.
    pub async fn disconnect_profile(&self, uuid: Uuid) -> Result<bool> {
        info!("DisconnectProfile {uuid} on {}...", self.address);
        match self.device.disconnect_profile(&uuid).await {
            Ok(()) => Ok(true),
            Err(e) if is_not_connected(&e) => {
                debug!("Profile {uuid} not connected on {} (OK)", self.address);
                Ok(true)
            }
            Err(e) => {
                warn!("DisconnectProfile {uuid} failed for {}: {e}", self.address);
                Ok(false)
            }
        }
    }

    pub async fn is_paired(&self) -> bool {
        self.device.is_paired().await.unwrap_or(false)
    }

    pub async fn is_connected(&self) -> bool {
        self.device.is_connected().await.unwrap_or(false)
    }

    pub async fn name(&self) -> String {
        self.device
            .name()
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| "Unknown Device".to_string())
    }

    pub async fn uuids(&self) -> Vec<Uuid> {
        self.device
            .uuids()
            .await
            .ok()
            .flatten()
            .map(|set| set.into_iter().collect())
            .unwrap_or_default()
    }

    /// Wait for ServicesResolved after a connect.
    pub async fn wait_for_services(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.device.is_services_resolved().await.unwrap_or(false) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        warn!(
            "Services not resolved for {} within {}s",
            self.address,
            timeout.as_secs()
        );
        false
    }

    /// Forget any known player so the next watch searches again.
    pub fn reset_avrcp_watch(&self) {
        let mut watch = self.watch.lock().unwrap();
        watch.player_path = None;
        watch.avrcp_last_search = None;
    }

    /// Look for a `player*` node under the device and read its initial
    /// MediaPlayer1 state. Change signals flow through the central
    /// watcher; this only locates the node and snapshots it.
    ///
    /// Returns the initial properties as synthetic events, or None when
    /// no player exists (most speakers; their buttons arrive through
    /// the registered MPRIS player instead).
    pub async fn watch_media_player(&self) -> Option<Vec<(String, serde_json::Value)>> {
        {
            let watch = self.watch.lock().unwrap();
            if let Some(path) = &watch.player_path {
                debug!("AVRCP already watching {path}");
                return None;
            }
            if let Some(last) = watch.avrcp_last_search {
                let elapsed = last.elapsed();
                if elapsed < AVRCP_SEARCH_COOLDOWN {
                    debug!(
                        "AVRCP search for {} on cooldown ({}s remaining)",
                        self.address,
                        (AVRCP_SEARCH_COOLDOWN - elapsed).as_secs()
                    );
                    return None;
                }
            }
        }

        for attempt in 1..=AVRCP_WATCH_RETRIES {
            match self.watcher.find_player_node(&self.path).await {
                Ok(Some(player_path)) => {
                    info!("AVRCP player found for {}: {player_path}", self.address);
                    let initial =
                        self.watcher.get_all_properties(&player_path, MEDIA_PLAYER_INTERFACE).await;
                    self.watch.lock().unwrap().player_path = Some(player_path);
                    let events: Vec<(String, serde_json::Value)> = initial
                        .map(|props| {
                            props
                                .iter()
                                .map(|(name, value)| (name.clone(), value_to_json(value)))
                                .collect()
                        })
                        .unwrap_or_default();
                    for (name, value) in &events {
                        info!("AVRCP {} initial: {name} = {value}", self.address);
                    }
                    return Some(events);
                }
                Ok(None) if attempt < AVRCP_WATCH_RETRIES => {
                    debug!(
                        "No AVRCP player for {} yet (attempt {attempt}/{AVRCP_WATCH_RETRIES}), retrying...",
                        self.address
                    );
                    tokio::time::sleep(AVRCP_WATCH_DELAY).await;
                }
                Ok(None) => {
                    debug!(
                        "No AVRCP player on {} after {AVRCP_WATCH_RETRIES} attempts \
                         (normal for speakers; buttons use the registered MPRIS player)",
                        self.address
                    );
                }
                Err(e) => {
                    debug!("AVRCP search failed for {}: {e}", self.address);
                    if attempt < AVRCP_WATCH_RETRIES {
                        tokio::time::sleep(AVRCP_WATCH_DELAY).await;
                        continue;
                    }
                }
            }
        }
        self.watch.lock().unwrap().avrcp_last_search = Some(Instant::now());
        None
    }
}
