//! Idle-mode engine.
//!
//! Reacts to sink running/idle transitions reported by the PulseAudio
//! facade. `power_save` suspends the sink after a configurable delay;
//! `auto_disconnect` drops the device after a quiet period; a running
//! transition cancels whatever is pending. At most one pending timer
//! exists per device per mode.

use crate::manager::Manager;
use crate::store::{DeviceSettings, IdleMode};
use log::{debug, info};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
pub struct IdleEngine {
    suspend_timers: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
    disconnect_timers: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
}

impl IdleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink left `running`: arm the timer the device's mode calls for.
    pub fn on_sink_idle(&self, manager: &Manager, address: &str, settings: &DeviceSettings) {
        match settings.idle_mode {
            IdleMode::PowerSave => {
                let delay = Duration::from_secs(settings.power_save_delay as u64);
                info!(
                    "Sink idle for {address}: power-save suspend in {}s",
                    delay.as_secs()
                );
                let manager = manager.clone();
                let addr = address.to_string();
                self.replace_timer(
                    &self.suspend_timers,
                    address,
                    tokio::spawn(async move {
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        manager.power_save_suspend(&addr).await;
                    }),
                );
            }
            IdleMode::AutoDisconnect => {
                let delay = Duration::from_secs(settings.auto_disconnect_minutes as u64 * 60);
                info!(
                    "Sink idle for {address}: auto-disconnect in {} min",
                    settings.auto_disconnect_minutes
                );
                let manager = manager.clone();
                let addr = address.to_string();
                self.replace_timer(
                    &self.disconnect_timers,
                    address,
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        info!("Idle auto-disconnect firing for {addr}");
                        let _ = manager.disconnect_device(&addr).await;
                    }),
                );
            }
            IdleMode::Default | IdleMode::KeepAlive => {}
        }
    }

    /// Sink entered `running`: cancel pending timers. A previously
    /// suspended sink resumes on the PulseAudio side automatically.
    pub fn on_sink_running(&self, manager: &Manager, address: &str) {
        self.cancel_pending(address);
        manager.clear_suspended_mark(address);
    }

    /// Cancel pending timers without touching suspended-sink state
    /// (used when the mode changes; resuming here would race the next
    /// suspend).
    pub fn cancel_pending(&self, address: &str) {
        for timers in [&self.suspend_timers, &self.disconnect_timers] {
            if let Some(task) = timers.lock().unwrap().remove(address) {
                task.abort();
                debug!("Cancelled pending idle timer for {address}");
            }
        }
    }

    pub async fn shutdown(&self) {
        for timers in [&self.suspend_timers, &self.disconnect_timers] {
            let drained: Vec<_> = timers.lock().unwrap().drain().collect();
            for (_, task) in drained {
                task.abort();
                let _ = task.await;
            }
        }
    }

    pub fn has_pending_suspend(&self, address: &str) -> bool {
        self.suspend_timers.lock().unwrap().get(address).is_some_and(|t| !t.is_finished())
    }

    pub fn has_pending_disconnect(&self, address: &str) -> bool {
        self.disconnect_timers.lock().unwrap().get(address).is_some_and(|t| !t.is_finished())
    }

    fn replace_timer(
        &self,
        timers: &Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
        address: &str,
        task: tokio::task::JoinHandle<()>,
    ) {
        let mut map = timers.lock().unwrap();
        if let Some(old) = map.insert(address.to_string(), task) {
            old.abort();
        }
    }
}
