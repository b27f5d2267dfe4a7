//! Auto-reconnect scheduler.
//!
//! One cancellable task per address: a quick retry ~10 s after the
//! disconnect (transient glitches, AVRCP hiccups), then exponential
//! backoff with additive jitter, capped by the configured maximum.
//! Eligibility (auto-reconnect enabled, device stored and auto-connect,
//! not user-disconnected, no connect in flight) is decided by the
//! controller before anything is scheduled here.

use crate::manager::Manager;
use log::{debug, info};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub const QUICK_RETRY_DELAY: Duration = Duration::from_secs(10);

/// `min(interval * 2^attempt, max_backoff)`, the deterministic part
/// of the wait; jitter is added separately.
pub fn backoff_seconds(attempt: u32, interval: u64, max_backoff: u64) -> u64 {
    let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
    interval.saturating_mul(factor).min(max_backoff)
}

#[derive(Default)]
pub struct ReconnectScheduler {
    tasks: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
    running: AtomicBool,
}

impl ReconnectScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        info!("Reconnect service started");
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let tasks: Vec<_> = {
            let mut map = self.tasks.lock().unwrap();
            map.drain().collect()
        };
        for (_, task) in tasks {
            task.abort();
            let _ = task.await;
        }
        info!("Reconnect service stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_scheduled(&self, address: &str) -> bool {
        self.tasks.lock().unwrap().get(address).is_some_and(|t| !t.is_finished())
    }

    pub fn cancel(&self, address: &str) {
        if let Some(task) = self.tasks.lock().unwrap().remove(address) {
            task.abort();
            debug!("Cancelled reconnect task for {address}");
        }
    }

    /// Schedule a reconnect loop for one address. No-op while stopped or
    /// when a live task already exists.
    pub fn schedule(&self, manager: &Manager, address: &str) {
        if !self.is_running() {
            return;
        }
        let mut tasks = self.tasks.lock().unwrap();
        if tasks.get(address).is_some_and(|t| !t.is_finished()) {
            debug!("Already reconnecting to {address}");
            return;
        }
        let manager = manager.clone();
        let address = address.to_string();
        let key = address.clone();
        let task = tokio::spawn(async move {
            reconnect_loop(manager, address).await;
        });
        tasks.insert(key, task);
    }

    /// Startup pass: one task per stored auto-connect device.
    pub fn reconnect_all(&self, manager: &Manager, addresses: Vec<String>) {
        if addresses.is_empty() {
            return;
        }
        info!("Attempting to reconnect {} stored device(s)...", addresses.len());
        for address in addresses {
            self.schedule(manager, &address);
        }
    }

    /// Drop a finished task's bookkeeping (called from inside the task).
    pub fn forget_task(&self, address: &str) {
        self.tasks.lock().unwrap().remove(address);
    }
}

async fn reconnect_loop(manager: Manager, address: String) {
    // The device may have stayed connected across a daemon restart.
    if manager.is_device_connected(&address).await {
        info!("Device {address} already connected, skipping reconnect");
        manager.reconnect_scheduler().forget_task(&address);
        return;
    }

    info!("Quick reconnect to {address} in {}s...", QUICK_RETRY_DELAY.as_secs());
    manager.broadcast_status(&format!(
        "Quick reconnect to {address} in {}s...",
        QUICK_RETRY_DELAY.as_secs()
    ));
    tokio::time::sleep(QUICK_RETRY_DELAY).await;
    if !manager.reconnect_scheduler().is_running() {
        return;
    }

    match manager.connect_device(&address).await {
        Ok(true) => {
            info!("Quick reconnect to {address} succeeded");
            manager.broadcast_status(&format!("Reconnected to {address}"));
            manager.reconnect_scheduler().forget_task(&address);
            return;
        }
        Ok(false) => debug!("Quick reconnect to {address}: no sink yet"),
        Err(e) => {
            info!("Quick reconnect to {address} failed: {e} — falling back to backoff")
        }
    }

    let mut attempt: u32 = 0;
    while manager.reconnect_scheduler().is_running() {
        let runtime = manager.runtime_settings();
        let wait = backoff_seconds(
            attempt,
            runtime.reconnect_interval_seconds,
            runtime.reconnect_max_backoff_seconds,
        );
        let jitter = rand::thread_rng().gen_range(0.0..0.1) * wait as f64;
        let total_wait = Duration::from_secs_f64(wait as f64 + jitter);

        debug!("Reconnect to {address}: attempt {} in {:.1}s", attempt + 1, total_wait.as_secs_f64());
        manager.broadcast_status(&format!(
            "Reconnecting to {address} in {}s (attempt {})...",
            total_wait.as_secs(),
            attempt + 1
        ));
        tokio::time::sleep(total_wait).await;
        if !manager.reconnect_scheduler().is_running() {
            return;
        }

        match manager.connect_device(&address).await {
            Ok(true) => {
                info!("Reconnected to {address} after {} attempt(s)", attempt + 1);
                manager.broadcast_status(&format!("Reconnected to {address}"));
                manager.reconnect_scheduler().forget_task(&address);
                return;
            }
            Ok(false) => {
                debug!("Reconnect attempt {} for {address}: sink did not appear", attempt + 1)
            }
            Err(e) => {
                log::warn!("Reconnect attempt {} for {address} failed: {e}", attempt + 1);
                manager.broadcast_status(&format!(
                    "Reconnect attempt {} for {address} failed",
                    attempt + 1
                ));
            }
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_clamps() {
        assert_eq!(backoff_seconds(0, 30, 300), 30);
        assert_eq!(backoff_seconds(1, 30, 300), 60);
        assert_eq!(backoff_seconds(2, 30, 300), 120);
        assert_eq!(backoff_seconds(3, 30, 300), 240);
        // The exponential term clamps to the configured maximum.
        assert_eq!(backoff_seconds(4, 30, 300), 300);
        assert_eq!(backoff_seconds(63, 30, 300), 300);
    }

    #[test]
    fn backoff_survives_extreme_attempts() {
        assert_eq!(backoff_seconds(u32::MAX, 600, 3600), 3600);
    }
}
