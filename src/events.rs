//! Named-event bus.
//!
//! Listeners register under a string name; emissions are dispatched on a
//! dedicated task per event name, so handlers preserve per-event ordering
//! without blocking the connection task or each other across names.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Session lifecycle event fired once per successful connection.
pub const CONNECTED: &str = "connected";
/// Fired when the transport drops (not on explicit `stop`).
pub const DISCONNECTED: &str = "disconnected";
/// Fired after the role/secret handshake succeeds, before `connected`.
pub const AUTHENTICATED: &str = "authenticated";
/// Recoverable session fault (dial/auth/protocol).
pub const ERROR: &str = "error";
/// Final event after `stop`; nothing fires after it.
pub const STOP: &str = "stop";
/// Fired whenever the client leaves the connected state.
pub const LEAVE_CONNECTED: &str = "leaveConnected";

type Handler = Arc<dyn Fn(Value) + Send + Sync>;

/// Opaque registration handle, used to unsubscribe a handler.
#[derive(Debug, Clone)]
pub struct HandlerId {
    name: String,
    seq: u64,
}

#[derive(Clone)]
struct Entry {
    seq: u64,
    once: bool,
    handler: Handler,
}

struct Channel {
    tx: mpsc::UnboundedSender<Value>,
    worker: JoinHandle<()>,
}

pub(crate) struct EventBus {
    handlers: Mutex<HashMap<String, Arc<Mutex<Vec<Entry>>>>>,
    channels: Mutex<HashMap<String, Channel>>,
    next_seq: AtomicU64,
    closed: AtomicBool,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Register a handler; it stays until [`off`](Self::off).
    pub fn on(&self, name: &str, handler: impl Fn(Value) + Send + Sync + 'static) -> HandlerId {
        self.register(name, false, Arc::new(handler))
    }

    /// Register a handler invoked at most once.
    pub fn once(&self, name: &str, handler: impl Fn(Value) + Send + Sync + 'static) -> HandlerId {
        self.register(name, true, Arc::new(handler))
    }

    /// Remove a previously registered handler.
    pub fn off(&self, id: &HandlerId) {
        let handlers = self.handlers.lock().unwrap();
        if let Some(list) = handlers.get(&id.name) {
            list.lock().unwrap().retain(|e| e.seq != id.seq);
        }
    }

    fn register(&self, name: &str, once: bool, handler: Handler) -> HandlerId {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let list = self
            .handlers
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .clone();
        list.lock().unwrap().push(Entry { seq, once, handler });
        HandlerId {
            name: name.to_string(),
            seq,
        }
    }

    /// Queue `payload` for the `name` dispatch task.
    ///
    /// Must be called from within a tokio runtime; the dispatch task is
    /// spawned lazily on the first emission of each name.
    pub fn emit(&self, name: &str, payload: Value) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let mut channels = self.channels.lock().unwrap();
        let channel = channels.entry(name.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let list = self
                .handlers
                .lock()
                .unwrap()
                .entry(name.to_string())
                .or_default()
                .clone();
            Channel {
                tx,
                worker: tokio::spawn(dispatch_loop(rx, list)),
            }
        });
        let _ = channel.tx.send(payload);
    }

    /// Emit `final_name` one last time, then silence the bus.
    ///
    /// The final event's queue drains normally; every other dispatch task
    /// is aborted so no stale callback fires after shutdown. Abort only
    /// lands at an await point, so a handler already running completes.
    pub fn shutdown(&self, final_name: &str, payload: Value) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut channels = self.channels.lock().unwrap();
        for (name, channel) in channels.iter() {
            if name != final_name {
                channel.worker.abort();
            }
        }

        match channels.remove(final_name) {
            Some(channel) => {
                let _ = channel.tx.send(payload);
                // tx drops here; the worker drains the queue and exits
            },
            None => {
                // No channel yet means listeners never saw an emission;
                // dispatch the final event to any late registrations.
                let list = self
                    .handlers
                    .lock()
                    .unwrap()
                    .entry(final_name.to_string())
                    .or_default()
                    .clone();
                let (tx, rx) = mpsc::unbounded_channel();
                let _ = tx.send(payload);
                drop(tx);
                tokio::spawn(dispatch_loop(rx, list));
            },
        }
        channels.clear();
    }
}

async fn dispatch_loop(
    mut rx: mpsc::UnboundedReceiver<Value>,
    handlers: Arc<Mutex<Vec<Entry>>>,
) {
    while let Some(payload) = rx.recv().await {
        let batch: Vec<Entry> = {
            let mut list = handlers.lock().unwrap();
            let batch = list.clone();
            list.retain(|e| !e.once);
            batch
        };
        for entry in batch {
            (entry.handler)(payload.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn test_emission_order_is_preserved() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.on("tick", move |v| {
            let _ = tx.send(v.as_u64().unwrap());
        });

        for i in 0..20u64 {
            bus.emit("tick", json!(i));
        }

        for expected in 0..20u64 {
            let got = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            assert_eq!(got, expected);
        }
    }

    #[tokio::test]
    async fn test_once_fires_once() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.once("ev", move |_| {
            let _ = tx.send(());
        });

        bus.emit("ev", Value::Null);
        bus.emit("ev", Value::Null);

        timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        // the sender lives only inside the once-handler entry; after the
        // entry is dropped the channel closes without a second message
        assert!(timeout(WAIT, rx.recv()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_off_removes_handler() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = bus.on("ev", move |_| {
            let _ = tx.send(());
        });
        bus.off(&id);

        bus.emit("ev", Value::Null);
        assert!(timeout(WAIT, rx.recv()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_fires_final_event_only() {
        let bus = EventBus::new();
        let (stop_tx, mut stop_rx) = mpsc::unbounded_channel();
        let (other_tx, mut other_rx) = mpsc::unbounded_channel();
        bus.on(STOP, move |_| {
            let _ = stop_tx.send(());
        });
        bus.on("other", move |_| {
            let _ = other_tx.send(());
        });

        bus.shutdown(STOP, Value::Null);
        bus.emit("other", Value::Null);

        timeout(WAIT, stop_rx.recv()).await.unwrap().unwrap();
        // the "other" handler is still registered but must never run
        assert!(timeout(Duration::from_millis(200), other_rx.recv())
            .await
            .is_err());
    }
}
