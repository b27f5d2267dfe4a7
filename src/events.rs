//! Event fan-out and ring-buffered history.
//!
//! Every component reports observations through the [`EventBus`]; the
//! external transport subscribes one bounded queue per client. A slow
//! consumer loses events instead of stalling the producers. Ring
//! buffers keep recent MPRIS/AVRCP entries and log records so a newly
//! connected client can replay history before going live.

use log::{Level, warn};
use serde::Serialize;
use serde_json::{Value, json};
use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 64;
pub const EVENT_RING_CAPACITY: usize = 50;
pub const LOG_RING_CAPACITY: usize = 500;

/// Seconds since the Unix epoch, fractional.
pub fn epoch_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0)
}

pub struct Subscription {
    pub id: u64,
    pub receiver: mpsc::Receiver<Value>,
}

#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<(u64, mpsc::Sender<Value>)>>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let total = {
            let mut clients = self.inner.lock().unwrap();
            clients.push((id, tx));
            clients.len()
        };
        log::info!("EventBus client subscribed ({total} total)");
        Subscription { id, receiver: rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        let remaining = {
            let mut clients = self.inner.lock().unwrap();
            clients.retain(|(cid, _)| *cid != id);
            clients.len()
        };
        log::info!("EventBus client unsubscribed ({remaining} remaining)");
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Push `{"type": <event>, ...data}` to every subscriber without
    /// blocking. Full queues drop the event for that subscriber only.
    pub fn emit(&self, event: &str, data: Value) {
        let mut frame = json!({"type": event});
        if let (Some(obj), Some(extra)) = (frame.as_object_mut(), data.as_object()) {
            for (k, v) in extra {
                obj.insert(k.clone(), v.clone());
            }
        }
        // Snapshot the senders first: the queue-full warning below goes
        // through the log tee, which emits on this same bus.
        let senders: Vec<(u64, mpsc::Sender<Value>)> =
            self.inner.lock().unwrap().clone();
        for (_, tx) in &senders {
            if tx.try_send(frame.clone()).is_err() {
                warn!("Dropping event '{event}' for slow client (queue full)");
            }
        }
    }

    pub fn emit_status(&self, message: &str) {
        self.emit("status", json!({"message": message}));
    }
}

/// Bounded FIFO that discards the oldest entry on overflow.
#[derive(Debug, Clone)]
pub struct Ring<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T: Clone> Ring<T> {
    pub fn new(capacity: usize) -> Self {
        Self { entries: VecDeque::with_capacity(capacity), capacity }
    }

    pub fn push(&mut self, entry: T) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Entry in the MPRIS command ring (speaker button presses).
#[derive(Debug, Clone, Serialize)]
pub struct MprisEntry {
    pub command: String,
    pub detail: String,
    pub ts: f64,
}

/// Entry in the AVRCP ring (remote player property changes, transport
/// volume).
#[derive(Debug, Clone, Serialize)]
pub struct AvrcpEntry {
    pub address: String,
    pub property: String,
    pub value: Value,
    pub ts: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub ts: f64,
    pub level: String,
    pub target: String,
    pub message: String,
}

pub type LogRing = Arc<Mutex<Ring<LogEntry>>>;

thread_local! {
    static FORWARDING: Cell<bool> = const { Cell::new(false) };
}

/// `log::Log` tee: records go to env_logger as usual and, at info and
/// above, into the UI log ring and out on the event bus.
pub struct RingLogger {
    inner: env_logger::Logger,
    ring: LogRing,
    bus: EventBus,
}

impl RingLogger {
    pub fn install(inner: env_logger::Logger, bus: EventBus) -> LogRing {
        let ring: LogRing = Arc::new(Mutex::new(Ring::new(LOG_RING_CAPACITY)));
        let max_level = inner.filter();
        let logger = RingLogger { inner, ring: ring.clone(), bus };
        if log::set_boxed_logger(Box::new(logger)).is_ok() {
            log::set_max_level(max_level);
        }
        ring
    }
}

impl log::Log for RingLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &log::Record) {
        self.inner.log(record);
        if record.level() > Level::Info || !self.inner.enabled(record.metadata()) {
            return;
        }
        let entry = LogEntry {
            ts: epoch_secs(),
            level: record.level().to_string(),
            target: record.target().to_string(),
            message: record.args().to_string(),
        };
        if let Ok(mut ring) = self.ring.lock() {
            ring.push(entry.clone());
        }
        // Events emitted here can log (queue-full warnings); the guard
        // stops that from re-entering the bus forever.
        FORWARDING.with(|flag| {
            if !flag.get() {
                flag.set(true);
                self.bus.emit(
                    "log_entry",
                    serde_json::to_value(&entry).unwrap_or(Value::Null),
                );
                flag.set(false);
            }
        });
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_discards_oldest_on_overflow() {
        let mut ring = Ring::new(3);
        for i in 0..5 {
            ring.push(i);
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.snapshot(), vec![2, 3, 4]);
    }

    #[test]
    fn event_ring_capacity_holds() {
        let mut ring: Ring<MprisEntry> = Ring::new(EVENT_RING_CAPACITY);
        for i in 0..200 {
            ring.push(MprisEntry { command: format!("Play{i}"), detail: String::new(), ts: 0.0 });
        }
        assert_eq!(ring.len(), EVENT_RING_CAPACITY);
        assert_eq!(ring.snapshot().first().unwrap().command, "Play150");
    }

    #[tokio::test]
    async fn emit_reaches_subscribers_in_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        bus.emit("status", json!({"message": "one"}));
        bus.emit("status", json!({"message": "two"}));
        let first = sub.receiver.recv().await.unwrap();
        assert_eq!(first["type"], "status");
        assert_eq!(first["message"], "one");
        assert_eq!(sub.receiver.recv().await.unwrap()["message"], "two");
    }

    #[tokio::test]
    async fn slow_subscriber_drops_instead_of_blocking() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        for i in 0..(SUBSCRIBER_QUEUE_CAPACITY + 10) {
            bus.emit("status", json!({"message": i}));
        }
        // Producer never blocked; the queue holds exactly its capacity.
        let mut received = 0;
        while sub.receiver.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_QUEUE_CAPACITY);
    }

    #[tokio::test]
    async fn unsubscribe_removes_client() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        bus.unsubscribe(sub.id);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
