//! Request/response correlation.
//!
//! Each awaited request gets a monotonically increasing 64-bit id, unique
//! per client instance (not per connection). The waiter table maps ids to
//! single-shot reply channels; `rtm/search` uses a streamed waiter that
//! stays registered until the terminal `/ok` or `/error` frame.

use crate::error::{Result, RtmError};
use crate::pdu::Pdu;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot};

pub(crate) enum Waiter {
    /// One response completes the request.
    Single(oneshot::Sender<Result<Pdu>>),
    /// Responses stream until a terminal `/ok` or `/error`.
    Stream(mpsc::UnboundedSender<Result<Pdu>>),
}

pub(crate) struct RequestTracker {
    next_id: AtomicU64,
    waiters: Mutex<HashMap<u64, Waiter>>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Draw the next request id. Ids start at 1 and never repeat.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register a single-shot waiter for `id`.
    pub fn register(&self, id: u64) -> oneshot::Receiver<Result<Pdu>> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().unwrap().insert(id, Waiter::Single(tx));
        rx
    }

    /// Register a streamed waiter for `id`.
    pub fn register_stream(&self, id: u64) -> mpsc::UnboundedReceiver<Result<Pdu>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.waiters.lock().unwrap().insert(id, Waiter::Stream(tx));
        rx
    }

    /// Whether `id` still has a waiter.
    pub fn contains(&self, id: u64) -> bool {
        self.waiters.lock().unwrap().contains_key(&id)
    }

    /// Route a response to its waiter. Returns false for unknown ids.
    pub fn complete(&self, pdu: Pdu) -> bool {
        let id = match pdu.id {
            Some(id) => id,
            None => return false,
        };
        let terminal = pdu.is_ok() || pdu.is_error();

        let mut waiters = self.waiters.lock().unwrap();
        match waiters.remove(&id) {
            Some(Waiter::Single(tx)) => {
                let _ = tx.send(Ok(pdu));
                true
            },
            Some(Waiter::Stream(tx)) => {
                let _ = tx.send(Ok(pdu));
                if !terminal {
                    waiters.insert(id, Waiter::Stream(tx));
                }
                true
            },
            None => false,
        }
    }

    /// Drop the waiter for `id` without delivering anything.
    pub fn cancel(&self, id: u64) {
        self.waiters.lock().unwrap().remove(&id);
    }

    /// Fail a single waiter with `err`.
    pub fn fail(&self, id: u64, err: RtmError) {
        if let Some(waiter) = self.waiters.lock().unwrap().remove(&id) {
            match waiter {
                Waiter::Single(tx) => {
                    let _ = tx.send(Err(err));
                },
                Waiter::Stream(tx) => {
                    let _ = tx.send(Err(err));
                },
            }
        }
    }

    /// Fail every outstanding waiter with `err`.
    pub fn fail_all(&self, err: RtmError) {
        let mut waiters = self.waiters.lock().unwrap();
        for (_, waiter) in waiters.drain() {
            match waiter {
                Waiter::Single(tx) => {
                    let _ = tx.send(Err(err.clone()));
                },
                Waiter::Stream(tx) => {
                    let _ = tx.send(Err(err.clone()));
                },
            }
        }
    }

    #[cfg(test)]
    pub fn outstanding(&self) -> usize {
        self.waiters.lock().unwrap().len()
    }
}
