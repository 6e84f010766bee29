//! Per-channel subscriptions: modes, state machines, position tracking,
//! and the registry that survives reconnects.
//!
//! The registry is authoritative and transport-independent: entries stay
//! registered across connection drops so the client can replay them, and
//! each entry owns a dispatch task so listener callbacks never block the
//! connection task.

use crate::pdu::{
    actions, Pdu, SubscribeBody, SubscribeHistory, SubscribeOk, SubscriptionData,
    SubscriptionError, SubscriptionInfo, UnsubscribeBody, OUT_OF_SYNC,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Delivery mode, a `(track_position, fast_forward)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionMode {
    /// No position tracking; the broker may fast-forward. After a
    /// reconnect the stream restarts at the server's current tail.
    Simple,
    /// Position tracked and restored on reconnect; fast-forward permitted
    /// when the server deems it necessary.
    Reliable,
    /// Position tracked; fast-forward disallowed, so a lost position
    /// surfaces as an `out_of_sync` subscription error.
    Advanced,
}

impl SubscriptionMode {
    pub fn track_position(self) -> bool {
        matches!(self, Self::Reliable | Self::Advanced)
    }

    pub fn fast_forward(self) -> bool {
        matches!(self, Self::Simple | Self::Reliable)
    }
}

/// Lifecycle of a single subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Subscribed,
    Unsubscribing,
}

/// Options applied when a subscription is registered.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOpts {
    /// Streaming filter (fSQL view) evaluated by the broker.
    pub filter: Option<String>,
    /// Historical messages to deliver on subscribe.
    pub history: Option<SubscribeHistory>,
    /// Initial stream position; consumed by the first successful subscribe.
    pub position: Option<String>,
}

/// Why an `unsubscribed` notification fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeReason {
    /// The application called unsubscribe and the broker confirmed.
    Requested,
    /// The transport dropped; the subscription stays registered for replay.
    Disconnect,
}

/// Callbacks for one subscription. All fields are optional; absent fields
/// are no-ops. Handlers run on the subscription's dispatch task, so they
/// may block without stalling frame handling.
#[derive(Clone, Default)]
pub struct Listener {
    pub(crate) on_data: Option<Arc<dyn Fn(SubscriptionData) + Send + Sync>>,
    pub(crate) on_message: Option<Arc<dyn Fn(Value) + Send + Sync>>,
    pub(crate) on_subscribed: Option<Arc<dyn Fn(SubscribeOk) + Send + Sync>>,
    pub(crate) on_unsubscribed: Option<Arc<dyn Fn(UnsubscribeReason) + Send + Sync>>,
    pub(crate) on_subscription_info: Option<Arc<dyn Fn(SubscriptionInfo) + Send + Sync>>,
    pub(crate) on_subscription_error: Option<Arc<dyn Fn(SubscriptionError) + Send + Sync>>,
}

impl Listener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once per `subscription/data` batch.
    pub fn on_data(mut self, f: impl Fn(SubscriptionData) + Send + Sync + 'static) -> Self {
        self.on_data = Some(Arc::new(f));
        self
    }

    /// Called once per message inside each batch, in stream order.
    pub fn on_message(mut self, f: impl Fn(Value) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Arc::new(f));
        self
    }

    /// Called when the broker confirms the subscription.
    pub fn on_subscribed(mut self, f: impl Fn(SubscribeOk) + Send + Sync + 'static) -> Self {
        self.on_subscribed = Some(Arc::new(f));
        self
    }

    /// Called when the subscription ends, with the reason.
    pub fn on_unsubscribed(
        mut self,
        f: impl Fn(UnsubscribeReason) + Send + Sync + 'static,
    ) -> Self {
        self.on_unsubscribed = Some(Arc::new(f));
        self
    }

    /// Called on `subscription/info` notices (e.g. fast-forward).
    pub fn on_subscription_info(
        mut self,
        f: impl Fn(SubscriptionInfo) + Send + Sync + 'static,
    ) -> Self {
        self.on_subscription_info = Some(Arc::new(f));
        self
    }

    /// Called when subscribing fails or an established subscription errors.
    pub fn on_subscription_error(
        mut self,
        f: impl Fn(SubscriptionError) + Send + Sync + 'static,
    ) -> Self {
        self.on_subscription_error = Some(Arc::new(f));
        self
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("on_data", &self.on_data.is_some())
            .field("on_message", &self.on_message.is_some())
            .field("on_subscribed", &self.on_subscribed.is_some())
            .field("on_unsubscribed", &self.on_unsubscribed.is_some())
            .field("on_subscription_info", &self.on_subscription_info.is_some())
            .field("on_subscription_error", &self.on_subscription_error.is_some())
            .finish()
    }
}

// ── Per-subscription state machine ──────────────────────────────────────────

/// State for one logical channel-or-filter subscription.
///
/// Methods are synchronous and only mutate local state; the connection
/// task drives them and performs the actual sends.
#[derive(Debug)]
pub(crate) struct Subscription {
    id: String,
    mode: SubscriptionMode,
    opts: SubscribeOpts,
    state: SubscriptionState,
    position: Option<String>,
}

impl Subscription {
    pub fn new(id: impl Into<String>, mode: SubscriptionMode, opts: SubscribeOpts) -> Self {
        Self {
            id: id.into(),
            mode,
            opts,
            state: SubscriptionState::Unsubscribed,
            position: None,
        }
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    #[cfg(test)]
    pub fn position(&self) -> Option<&str> {
        self.position.as_deref()
    }

    /// Build the subscribe PDU from current state (not registration state).
    pub fn subscribe_pdu(&self) -> Pdu {
        let position = if self.mode.track_position() && self.position.is_some() {
            self.position.clone()
        } else {
            self.opts.position.clone()
        };
        let body = SubscribeBody {
            subscription_id: self.id.clone(),
            force: true,
            fast_forward: self.mode.fast_forward(),
            filter: self.opts.filter.clone(),
            history: self.opts.history,
            position,
        };
        Pdu::new(
            actions::SUBSCRIBE,
            serde_json::to_value(body).unwrap_or(Value::Null),
        )
    }

    pub fn unsubscribe_pdu(&self) -> Pdu {
        let body = UnsubscribeBody {
            subscription_id: self.id.clone(),
        };
        Pdu::new(
            actions::UNSUBSCRIBE,
            serde_json::to_value(body).unwrap_or(Value::Null),
        )
    }

    pub fn mark_subscribing(&mut self) {
        self.state = SubscriptionState::Subscribing;
    }

    pub fn mark_unsubscribing(&mut self) {
        self.state = SubscriptionState::Unsubscribing;
    }

    pub fn on_subscribe_ok(&mut self, ok: &SubscribeOk) {
        self.state = SubscriptionState::Subscribed;
        if self.mode.track_position() {
            self.position = Some(ok.position.clone());
        }
        // the registration-time position is good for one subscribe only;
        // afterwards the resume point is the tracked position (or nothing)
        self.opts.position = None;
    }

    pub fn on_subscribe_error(&mut self) {
        self.state = SubscriptionState::Unsubscribed;
    }

    pub fn on_data(&mut self, data: &SubscriptionData) {
        if self.mode.track_position() {
            self.position = Some(data.position.clone());
        }
    }

    pub fn on_info(&mut self, info: &SubscriptionInfo) {
        if self.mode.track_position() {
            self.position = Some(info.position.clone());
        }
    }

    pub fn on_subscription_error(&mut self, err: &SubscriptionError) {
        self.state = SubscriptionState::Unsubscribed;
        if err.error == OUT_OF_SYNC {
            self.position = None;
        }
    }

    pub fn on_unsubscribe_ok(&mut self) {
        self.state = SubscriptionState::Unsubscribed;
        self.position = None;
    }

    /// Transport closed. Returns true if the subscription was active and a
    /// `disconnect` notification should fire.
    pub fn on_disconnect(&mut self) -> bool {
        let was_active = self.state != SubscriptionState::Unsubscribed;
        self.state = SubscriptionState::Unsubscribed;
        was_active
    }
}

// ── Registry ────────────────────────────────────────────────────────────────

/// Event delivered to a subscription's dispatch task.
pub(crate) enum SubEvent {
    Subscribed(SubscribeOk),
    Data(SubscriptionData),
    Info(SubscriptionInfo),
    SubscribeError(SubscriptionError),
    Unsubscribed(UnsubscribeReason),
}

struct SubEntry {
    sub: Subscription,
    events_tx: mpsc::UnboundedSender<SubEvent>,
    dispatch: JoinHandle<()>,
}

impl SubEntry {
    fn emit(&self, event: SubEvent) {
        let _ = self.events_tx.send(event);
    }
}

/// Mutex-guarded map of subscriptions, shared between the public API and
/// the connection task. Positions are mutated only by the connection task.
pub(crate) struct Registry {
    subs: Mutex<HashMap<String, SubEntry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            subs: Mutex::new(HashMap::new()),
        }
    }

    /// Register a subscription, replacing any existing entry with the same
    /// id. Must run inside the tokio runtime (spawns the dispatch task).
    pub fn insert(
        &self,
        id: &str,
        mode: SubscriptionMode,
        opts: SubscribeOpts,
        listener: Listener,
    ) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let entry = SubEntry {
            sub: Subscription::new(id, mode, opts),
            events_tx,
            dispatch: tokio::spawn(dispatch_loop(events_rx, listener)),
        };
        if let Some(old) = self.subs.lock().unwrap().insert(id.to_string(), entry) {
            log::debug!("[rtm-link] replacing subscription '{}'", id);
            old.dispatch.abort();
        }
    }

    /// Remove an entry outright (deferred subscription withdrawn).
    pub fn remove(&self, id: &str) {
        self.subs.lock().unwrap().remove(id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.subs.lock().unwrap().contains_key(id)
    }

    pub fn state_of(&self, id: &str) -> Option<SubscriptionState> {
        self.subs.lock().unwrap().get(id).map(|e| e.sub.state())
    }

    /// Start subscribing if the entry is idle; returns the PDU to send.
    pub fn begin_subscribe(&self, id: &str) -> Option<Pdu> {
        let mut subs = self.subs.lock().unwrap();
        let entry = subs.get_mut(id)?;
        if entry.sub.state() != SubscriptionState::Unsubscribed {
            return None;
        }
        entry.sub.mark_subscribing();
        Some(entry.sub.subscribe_pdu())
    }

    /// Start unsubscribing if subscribed; otherwise drop the entry.
    /// Returns the PDU to send when one is needed.
    pub fn begin_unsubscribe(&self, id: &str) -> Option<Pdu> {
        let mut subs = self.subs.lock().unwrap();
        match subs.get_mut(id) {
            Some(entry) if entry.sub.state() == SubscriptionState::Subscribed => {
                entry.sub.mark_unsubscribing();
                Some(entry.sub.unsubscribe_pdu())
            },
            Some(_) => {
                subs.remove(id);
                None
            },
            None => None,
        }
    }

    /// Subscribe PDUs for every idle entry; used on (re)connect.
    pub fn replay_pdus(&self) -> Vec<(String, Pdu)> {
        let mut subs = self.subs.lock().unwrap();
        let mut pdus = Vec::new();
        for (id, entry) in subs.iter_mut() {
            if entry.sub.state() == SubscriptionState::Unsubscribed {
                entry.sub.mark_subscribing();
                pdus.push((id.clone(), entry.sub.subscribe_pdu()));
            }
        }
        pdus
    }

    pub fn finish_subscribe(&self, id: &str, ok: SubscribeOk) {
        let mut subs = self.subs.lock().unwrap();
        if let Some(entry) = subs.get_mut(id) {
            entry.sub.on_subscribe_ok(&ok);
            entry.emit(SubEvent::Subscribed(ok));
        }
    }

    pub fn fail_subscribe(&self, id: &str, err: SubscriptionError) {
        let mut subs = self.subs.lock().unwrap();
        if let Some(mut entry) = subs.remove(id) {
            entry.sub.on_subscribe_error();
            entry.emit(SubEvent::SubscribeError(err));
        }
    }

    pub fn on_data(&self, data: SubscriptionData) {
        let mut subs = self.subs.lock().unwrap();
        match subs.get_mut(&data.subscription_id) {
            Some(entry) if entry.sub.state() == SubscriptionState::Subscribed => {
                entry.sub.on_data(&data);
                entry.emit(SubEvent::Data(data));
            },
            _ => log::debug!(
                "[rtm-link] data for inactive subscription '{}'",
                data.subscription_id
            ),
        }
    }

    pub fn on_info(&self, info: SubscriptionInfo) {
        let mut subs = self.subs.lock().unwrap();
        match subs.get_mut(&info.subscription_id) {
            Some(entry) if entry.sub.state() == SubscriptionState::Subscribed => {
                entry.sub.on_info(&info);
                entry.emit(SubEvent::Info(info));
            },
            _ => log::debug!(
                "[rtm-link] info for inactive subscription '{}'",
                info.subscription_id
            ),
        }
    }

    /// `subscription/error` ends the subscription; the entry leaves the
    /// registry and an explicit resubscribe is required.
    pub fn on_subscription_error(&self, err: SubscriptionError) {
        let mut subs = self.subs.lock().unwrap();
        if let Some(mut entry) = subs.remove(&err.subscription_id) {
            entry.sub.on_subscription_error(&err);
            entry.emit(SubEvent::SubscribeError(err));
        }
    }

    pub fn finish_unsubscribe(&self, id: &str) {
        let mut subs = self.subs.lock().unwrap();
        if let Some(mut entry) = subs.remove(id) {
            entry.sub.on_unsubscribe_ok();
            entry.emit(SubEvent::Unsubscribed(UnsubscribeReason::Requested));
        }
    }

    /// Transport closed: every active subscription goes idle but stays
    /// registered so the next connection can replay it.
    pub fn on_disconnect(&self) {
        let mut subs = self.subs.lock().unwrap();
        for entry in subs.values_mut() {
            if entry.sub.on_disconnect() {
                entry.emit(SubEvent::Unsubscribed(UnsubscribeReason::Disconnect));
            }
        }
    }

    /// Stop: silence every dispatch task immediately.
    pub fn shutdown(&self) {
        let mut subs = self.subs.lock().unwrap();
        for (_, entry) in subs.drain() {
            entry.dispatch.abort();
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.subs.lock().unwrap().len()
    }
}

async fn dispatch_loop(mut rx: mpsc::UnboundedReceiver<SubEvent>, listener: Listener) {
    while let Some(event) = rx.recv().await {
        match event {
            SubEvent::Subscribed(ok) => {
                if let Some(f) = &listener.on_subscribed {
                    f(ok);
                }
            },
            SubEvent::Data(data) => {
                if let Some(f) = &listener.on_data {
                    f(data.clone());
                }
                if let Some(f) = &listener.on_message {
                    for message in data.messages {
                        f(message);
                    }
                }
            },
            SubEvent::Info(info) => {
                if let Some(f) = &listener.on_subscription_info {
                    f(info);
                }
            },
            SubEvent::SubscribeError(err) => {
                if let Some(f) = &listener.on_subscription_error {
                    f(err);
                }
            },
            SubEvent::Unsubscribed(reason) => {
                if let Some(f) = &listener.on_unsubscribed {
                    f(reason);
                }
            },
        }
    }
}
