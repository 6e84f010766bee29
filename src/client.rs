//! The RTM client: connection lifecycle, request API, subscription replay.
//!
//! A background connection task owns the WebSocket and drives the state
//! machine (connect, authenticate, connected loop, backoff). Public API
//! calls reach it through a bounded command channel — the single consumer
//! preserves outbound frame order — and responses come back through the
//! shared waiter table.

use crate::auth::{self, AuthProvider};
use crate::error::{Result, RtmError};
use crate::events::{self, EventBus, HandlerId};
use crate::pdu::{
    self, actions, ChannelMessage, DeleteBody, ErrorBody, Incoming, Pdu, PositionResponse,
    ReadBody, ReadOk, SearchBody, SearchData, SubscribeOk, SubscriptionData, SubscriptionError,
    SubscriptionInfo,
};
use crate::proxy::ProxySelector;
use crate::requests::RequestTracker;
use crate::subscription::{Listener, Registry, SubscribeOpts, SubscriptionMode, SubscriptionState};
use crate::transport::Transport;
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;

const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_MAX_RECONNECT_INTERVAL: Duration = Duration::from_secs(120);

const BACKOFF_BASE: Duration = Duration::from_secs(1);
/// A connection that lived this long counts as a success and resets the
/// reconnect attempt counter.
const ATTEMPT_RESET_AFTER: Duration = Duration::from_secs(60);

const CMD_CHANNEL_CAPACITY: usize = 256;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Stopped,
    Connecting,
    Authenticating,
    Connected,
    AwaitingReconnect,
}

/// Commands sent from the public API to the connection task.
enum Cmd {
    /// Fire-and-forget frame (publish without ack).
    Send { frame: Pdu },
    /// Frame with a registered waiter.
    Request { id: u64, frame: Pdu },
    /// Subscription already registered; send its subscribe PDU.
    Subscribe { id: String },
    /// Unsubscribe or withdraw a deferred subscription.
    Unsubscribe { id: String },
}

struct Inner {
    endpoint: String,
    auth: AuthProvider,
    proxy: ProxySelector,
    ping_interval: Duration,
    connection_timeout: Duration,
    max_reconnect_interval: Duration,

    state: Mutex<ClientState>,
    tracker: RequestTracker,
    registry: Registry,
    bus: EventBus,

    cmd: Mutex<Option<mpsc::Sender<Cmd>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    stop: Notify,
    stopped: AtomicBool,
}

impl Inner {
    fn state(&self) -> ClientState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: ClientState) {
        *self.state.lock().unwrap() = state;
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// Client for the RTM service. Cheap to clone; all clones share the same
/// session.
#[derive(Clone)]
pub struct RtmClient {
    inner: Arc<Inner>,
}

impl RtmClient {
    /// Create a client with default options.
    pub fn new(endpoint: &str, app_key: &str) -> Result<Self> {
        Self::builder(endpoint, app_key).build()
    }

    /// Create a builder for custom configuration.
    pub fn builder(endpoint: &str, app_key: &str) -> RtmClientBuilder {
        RtmClientBuilder::new(endpoint, app_key)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClientState {
        self.inner.state()
    }

    /// Whether the session is connected (and authenticated, if configured).
    pub fn is_connected(&self) -> bool {
        self.inner.state() == ClientState::Connected
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Spawn the connection task and begin connecting.
    ///
    /// Idempotent while running. Must be called from within a tokio
    /// runtime. A stopped client stays stopped; create a new one instead.
    pub fn start(&self) -> Result<()> {
        if self.inner.is_stopped() {
            return Err(RtmError::Stopped);
        }
        let mut cmd = self.inner.cmd.lock().unwrap();
        if cmd.is_some() {
            return Ok(());
        }
        let (tx, rx) = mpsc::channel(CMD_CHANNEL_CAPACITY);
        *cmd = Some(tx);
        let task = tokio::spawn(connection_task(self.inner.clone(), rx));
        *self.inner.task.lock().unwrap() = Some(task);
        Ok(())
    }

    /// Stop the session for good: close the transport, fail every
    /// outstanding request, fire a final `stop` event. Idempotent.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.stop.notify_one();

        let task = self.inner.task.lock().unwrap().take();
        match task {
            Some(task) => {
                let _ = task.await;
            },
            None => {
                // never started; finalize here so `stop` still fires
                finalize(&self.inner);
            },
        }
        self.inner.cmd.lock().unwrap().take();
    }

    // ── Events ──────────────────────────────────────────────────────────

    /// Register a handler for a named session event (see [`crate::events`]).
    pub fn on(&self, event: &str, handler: impl Fn(Value) + Send + Sync + 'static) -> HandlerId {
        self.inner.bus.on(event, handler)
    }

    /// Register a handler invoked at most once.
    pub fn once(&self, event: &str, handler: impl Fn(Value) + Send + Sync + 'static) -> HandlerId {
        self.inner.bus.once(event, handler)
    }

    /// Remove a previously registered handler.
    pub fn off(&self, id: &HandlerId) {
        self.inner.bus.off(id);
    }

    // ── Requests ────────────────────────────────────────────────────────

    /// Publish without acknowledgement. No id is assigned and no response
    /// is tracked.
    pub async fn publish(&self, channel: &str, message: impl Serialize) -> Result<()> {
        let body = serde_json::to_value(ChannelMessage {
            channel: channel.to_string(),
            message: serde_json::to_value(message)?,
        })?;
        self.ensure_connected()?;
        let tx = self.cmd_sender()?;
        tx.send(Cmd::Send {
            frame: Pdu::new(actions::PUBLISH, body),
        })
        .await
        .map_err(|_| RtmError::Stopped)
    }

    /// Publish and await the broker's acknowledgement.
    pub async fn publish_ack(
        &self,
        channel: &str,
        message: impl Serialize,
    ) -> Result<PositionResponse> {
        let body = serde_json::to_value(ChannelMessage {
            channel: channel.to_string(),
            message: serde_json::to_value(message)?,
        })?;
        let pdu = self.request(actions::PUBLISH, body).await?;
        Ok(serde_json::from_value(pdu.body).unwrap_or_default())
    }

    /// Overwrite the channel's latest value.
    pub async fn write(&self, channel: &str, message: impl Serialize) -> Result<PositionResponse> {
        let body = serde_json::to_value(ChannelMessage {
            channel: channel.to_string(),
            message: serde_json::to_value(message)?,
        })?;
        let pdu = self.request(actions::WRITE, body).await?;
        Ok(serde_json::from_value(pdu.body).unwrap_or_default())
    }

    /// Read the channel's latest message.
    pub async fn read(&self, channel: &str) -> Result<ReadOk> {
        self.read_from(channel, None).await
    }

    /// Read the message at an explicit position.
    pub async fn read_with_position(&self, channel: &str, position: &str) -> Result<ReadOk> {
        self.read_from(channel, Some(position.to_string())).await
    }

    async fn read_from(&self, channel: &str, position: Option<String>) -> Result<ReadOk> {
        let body = serde_json::to_value(ReadBody {
            channel: channel.to_string(),
            position,
        })?;
        let pdu = self.request(actions::READ, body).await?;
        Ok(serde_json::from_value(pdu.body).unwrap_or_default())
    }

    /// Delete the channel's contents.
    pub async fn delete(&self, channel: &str) -> Result<PositionResponse> {
        let body = serde_json::to_value(DeleteBody {
            channel: channel.to_string(),
        })?;
        let pdu = self.request(actions::DELETE, body).await?;
        Ok(serde_json::from_value(pdu.body).unwrap_or_default())
    }

    /// Find channels by name prefix. Matches stream in batches; the
    /// result closes after the terminal frame.
    pub async fn search(&self, prefix: &str) -> Result<Search> {
        self.ensure_connected()?;
        let tx = self.cmd_sender()?;
        let id = self.inner.tracker.next_id();
        let mut rx = self.inner.tracker.register_stream(id);
        let body = serde_json::to_value(SearchBody {
            prefix: prefix.to_string(),
        })?;
        if tx
            .send(Cmd::Request {
                id,
                frame: Pdu::with_id(actions::SEARCH, id, body),
            })
            .await
            .is_err()
        {
            self.inner.tracker.cancel(id);
            return Err(RtmError::Stopped);
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(result) = rx.recv().await {
                let pdu = match result {
                    Ok(pdu) => pdu,
                    Err(_) => return,
                };
                let terminal = pdu.is_ok() || pdu.is_error();
                if !pdu.is_error() {
                    if let Ok(data) = serde_json::from_value::<SearchData>(pdu.body) {
                        for channel in data.channels {
                            if out_tx.send(channel).is_err() {
                                return;
                            }
                        }
                    }
                }
                if terminal {
                    return;
                }
            }
        });
        Ok(Search { channels: out_rx })
    }

    async fn request(&self, action: &str, body: Value) -> Result<Pdu> {
        self.ensure_connected()?;
        let tx = self.cmd_sender()?;
        let id = self.inner.tracker.next_id();
        let rx = self.inner.tracker.register(id);
        if tx
            .send(Cmd::Request {
                id,
                frame: Pdu::with_id(action, id, body),
            })
            .await
            .is_err()
        {
            self.inner.tracker.cancel(id);
            return Err(RtmError::Stopped);
        }

        let deadline = self.inner.connection_timeout;
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => {
                let pdu = result?;
                if pdu.is_ok() {
                    Ok(pdu)
                } else {
                    let err = ErrorBody::from_value(&pdu.body);
                    Err(RtmError::Server {
                        code: err.error,
                        reason: err.reason,
                    })
                }
            },
            Ok(Err(_)) => Err(RtmError::Disconnected),
            Err(_) => {
                self.inner.tracker.cancel(id);
                Err(RtmError::Timeout(format!(
                    "no response to {} within {:?}",
                    action, deadline
                )))
            },
        }
    }

    // ── Subscriptions ───────────────────────────────────────────────────

    /// Register a subscription. If connected, the subscribe PDU goes out
    /// immediately; otherwise it is deferred until the session connects.
    /// Re-using an id replaces the previous registration.
    pub async fn subscribe(
        &self,
        subscription_id: &str,
        mode: SubscriptionMode,
        opts: SubscribeOpts,
        listener: Listener,
    ) -> Result<()> {
        if self.inner.is_stopped() {
            return Err(RtmError::Stopped);
        }
        self.inner
            .registry
            .insert(subscription_id, mode, opts, listener);
        if self.is_connected() {
            if let Ok(tx) = self.cmd_sender() {
                let _ = tx
                    .send(Cmd::Subscribe {
                        id: subscription_id.to_string(),
                    })
                    .await;
            }
        }
        Ok(())
    }

    /// End a subscription: sends the unsubscribe PDU when the subscription
    /// is established, otherwise just withdraws the deferred registration.
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        if !self.inner.registry.contains(subscription_id) {
            return Ok(());
        }
        if self.is_connected() {
            if let Ok(tx) = self.cmd_sender() {
                let _ = tx
                    .send(Cmd::Unsubscribe {
                        id: subscription_id.to_string(),
                    })
                    .await;
                return Ok(());
            }
        }
        self.inner.registry.remove(subscription_id);
        Ok(())
    }

    /// Current state of a subscription, if registered.
    pub fn subscription_state(&self, subscription_id: &str) -> Option<SubscriptionState> {
        self.inner.registry.state_of(subscription_id)
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn ensure_connected(&self) -> Result<()> {
        if self.inner.is_stopped() {
            return Err(RtmError::Stopped);
        }
        if self.inner.state() == ClientState::Connected {
            Ok(())
        } else {
            Err(RtmError::NotConnected)
        }
    }

    fn cmd_sender(&self) -> Result<mpsc::Sender<Cmd>> {
        if self.inner.is_stopped() {
            return Err(RtmError::Stopped);
        }
        self.inner
            .cmd
            .lock()
            .unwrap()
            .clone()
            .ok_or(RtmError::NotConnected)
    }
}

/// Streamed result of [`RtmClient::search`].
pub struct Search {
    channels: mpsc::UnboundedReceiver<String>,
}

impl Search {
    /// Next matching channel name; `None` once the search completes.
    pub async fn next(&mut self) -> Option<String> {
        self.channels.recv().await
    }
}

/// Builder for [`RtmClient`].
pub struct RtmClientBuilder {
    endpoint: String,
    app_key: String,
    auth: AuthProvider,
    proxy: ProxySelector,
    ping_interval: Duration,
    connection_timeout: Duration,
    max_reconnect_interval: Duration,
}

impl RtmClientBuilder {
    fn new(endpoint: &str, app_key: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            app_key: app_key.to_string(),
            auth: AuthProvider::None,
            proxy: ProxySelector::Direct,
            ping_interval: DEFAULT_PING_INTERVAL,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            max_reconnect_interval: DEFAULT_MAX_RECONNECT_INTERVAL,
        }
    }

    /// Authenticate the session after each connect.
    pub fn auth(mut self, auth: AuthProvider) -> Self {
        self.auth = auth;
        self
    }

    /// Dial through a proxy (fixed URL or environment-derived).
    pub fn proxy(mut self, proxy: ProxySelector) -> Self {
        self.proxy = proxy;
        self
    }

    /// WebSocket keepalive ping interval. Default: 60 s.
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Deadline for dialing, authenticating, and awaiting each response.
    /// Default: 60 s.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Cap for the reconnect backoff delay. Default: 120 s.
    pub fn max_reconnect_interval(mut self, interval: Duration) -> Self {
        self.max_reconnect_interval = interval;
        self
    }

    /// Validate the endpoint and build the client.
    pub fn build(self) -> Result<RtmClient> {
        let endpoint = build_endpoint(&self.endpoint, &self.app_key)?;
        Ok(RtmClient {
            inner: Arc::new(Inner {
                endpoint,
                auth: self.auth,
                proxy: self.proxy,
                ping_interval: self.ping_interval,
                connection_timeout: self.connection_timeout,
                max_reconnect_interval: self.max_reconnect_interval,
                state: Mutex::new(ClientState::Stopped),
                tracker: RequestTracker::new(),
                registry: Registry::new(),
                bus: EventBus::new(),
                cmd: Mutex::new(None),
                task: Mutex::new(None),
                stop: Notify::new(),
                stopped: AtomicBool::new(false),
            }),
        })
    }
}

/// `wss://{host}/v2?appkey={key}`: append `/v2` only if absent, the app
/// key always.
fn build_endpoint(endpoint: &str, app_key: &str) -> Result<String> {
    if !(endpoint.starts_with("ws://") || endpoint.starts_with("wss://")) {
        return Err(RtmError::Configuration(format!(
            "endpoint must start with ws:// or wss://: '{}'",
            endpoint
        )));
    }
    if app_key.is_empty() {
        return Err(RtmError::Configuration("app key is required".to_string()));
    }

    let (base, query) = match endpoint.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (endpoint, None),
    };
    let mut url = base.trim_end_matches('/').to_string();
    if !url.ends_with("/v2") {
        url.push_str("/v2");
    }
    match query {
        Some(query) if !query.is_empty() => Ok(format!("{}?{}&appkey={}", url, query, app_key)),
        _ => Ok(format!("{}?appkey={}", url, app_key)),
    }
}

// ── Connection task ─────────────────────────────────────────────────────────

enum Exit {
    Stopped,
    Dropped(String),
}

/// Dial and, when configured, authenticate.
async fn establish(inner: &Inner) -> Result<Transport> {
    let mut transport =
        Transport::dial(&inner.endpoint, &inner.proxy, inner.connection_timeout).await?;
    if inner.auth.is_configured() {
        inner.set_state(ClientState::Authenticating);
        if let Err(e) = auth::authenticate(
            &mut transport,
            &inner.auth,
            || inner.tracker.next_id(),
            inner.connection_timeout,
        )
        .await
        {
            transport.close().await;
            return Err(e);
        }
    }
    Ok(transport)
}

/// The background task owning the WebSocket and the state machine.
async fn connection_task(inner: Arc<Inner>, mut cmd_rx: mpsc::Receiver<Cmd>) {
    let mut attempt: u32 = 0;
    loop {
        if inner.is_stopped() {
            break;
        }
        inner.set_state(ClientState::Connecting);

        let established = tokio::select! {
            biased;
            _ = inner.stop.notified() => break,
            result = establish(&inner) => result,
        };

        match established {
            Ok(transport) => {
                inner.set_state(ClientState::Connected);
                if inner.auth.is_configured() {
                    inner.bus.emit(events::AUTHENTICATED, Value::Null);
                }
                inner.bus.emit(events::CONNECTED, Value::Null);
                log::info!("[rtm-link] connected to {}", inner.endpoint);

                let connected_at = Instant::now();
                match connected_loop(&inner, &mut cmd_rx, transport).await {
                    Exit::Stopped => break,
                    Exit::Dropped(reason) => {
                        log::warn!("[rtm-link] connection dropped: {}", reason);
                        inner.tracker.fail_all(RtmError::Disconnected);
                        inner.registry.on_disconnect();
                        inner.bus.emit(events::LEAVE_CONNECTED, Value::Null);
                        inner
                            .bus
                            .emit(events::DISCONNECTED, json!({ "reason": reason }));
                        if connected_at.elapsed() >= ATTEMPT_RESET_AFTER {
                            attempt = 0;
                        }
                    },
                }
            },
            Err(e) => {
                log::warn!("[rtm-link] connect failed: {}", e);
                inner
                    .bus
                    .emit(events::ERROR, json!({ "reason": e.to_string() }));
            },
        }

        inner.set_state(ClientState::AwaitingReconnect);
        if !backoff_wait(&inner, &mut cmd_rx, attempt).await {
            break;
        }
        attempt = attempt.saturating_add(1);
    }
    finalize(&inner);
}

/// Fail waiters, silence subscriptions, fire the final `stop` event.
fn finalize(inner: &Inner) {
    inner.set_state(ClientState::Stopped);
    inner.stopped.store(true, Ordering::Release);
    inner.tracker.fail_all(RtmError::Stopped);
    inner.registry.shutdown();
    inner.bus.shutdown(events::STOP, Value::Null);
    log::info!("[rtm-link] stopped");
}

/// Multiplex commands, inbound frames, and the keepalive timer while the
/// session is up.
async fn connected_loop(
    inner: &Inner,
    cmd_rx: &mut mpsc::Receiver<Cmd>,
    mut transport: Transport,
) -> Exit {
    // request ids of subscribe/unsubscribe PDUs awaiting their ack
    let mut pending_subs: HashMap<u64, String> = HashMap::new();
    let mut pending_unsubs: HashMap<u64, String> = HashMap::new();

    // replay every registered subscription with its stored position
    for (sub_id, mut frame) in inner.registry.replay_pdus() {
        let id = inner.tracker.next_id();
        frame.id = Some(id);
        log::debug!("[rtm-link] replaying subscription '{}'", sub_id);
        pending_subs.insert(id, sub_id);
        match pdu::encode(&frame) {
            Ok(text) => {
                if let Err(e) = transport.send(text).await {
                    transport.close().await;
                    return Exit::Dropped(e.to_string());
                }
            },
            Err(e) => log::warn!("[rtm-link] failed to encode subscribe: {}", e),
        }
    }

    let mut ping_deadline = tokio::time::Instant::now() + inner.ping_interval;
    loop {
        tokio::select! {
            biased;

            _ = inner.stop.notified() => {
                transport.close().await;
                return Exit::Stopped;
            }

            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => {
                    if let Err(reason) = handle_cmd(
                        inner,
                        cmd,
                        &mut transport,
                        &mut pending_subs,
                        &mut pending_unsubs,
                    )
                    .await
                    {
                        transport.close().await;
                        return Exit::Dropped(reason);
                    }
                },
                None => {
                    // every client handle dropped
                    transport.close().await;
                    return Exit::Stopped;
                },
            },

            _ = tokio::time::sleep_until(ping_deadline) => {
                if let Err(e) = transport.ping().await {
                    transport.close().await;
                    return Exit::Dropped(format!("keepalive ping failed: {}", e));
                }
                ping_deadline = tokio::time::Instant::now() + inner.ping_interval;
            }

            frame = transport.recv() => {
                // any frame proves liveness
                ping_deadline = tokio::time::Instant::now() + inner.ping_interval;
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(inner, text.as_str(), &mut pending_subs, &mut pending_unsubs);
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = transport.pong(payload).await;
                    },
                    Some(Ok(Message::Close(_))) => {
                        return Exit::Dropped("server closed the connection".to_string());
                    },
                    Some(Ok(_)) => {},
                    Some(Err(e)) => {
                        return Exit::Dropped(e.to_string());
                    },
                    None => {
                        return Exit::Dropped("stream ended".to_string());
                    },
                }
            }
        }
    }
}

/// Apply one command; `Err` carries the disconnect reason.
async fn handle_cmd(
    inner: &Inner,
    cmd: Cmd,
    transport: &mut Transport,
    pending_subs: &mut HashMap<u64, String>,
    pending_unsubs: &mut HashMap<u64, String>,
) -> std::result::Result<(), String> {
    match cmd {
        Cmd::Send { frame } => send_frame(transport, &frame).await,
        Cmd::Request { id, frame } => {
            // the waiter may have timed out while the command was queued
            if !inner.tracker.contains(id) {
                return Ok(());
            }
            send_frame(transport, &frame).await
        },
        Cmd::Subscribe { id: sub_id } => {
            if let Some(mut frame) = inner.registry.begin_subscribe(&sub_id) {
                let id = inner.tracker.next_id();
                frame.id = Some(id);
                pending_subs.insert(id, sub_id);
                send_frame(transport, &frame).await?;
            }
            Ok(())
        },
        Cmd::Unsubscribe { id: sub_id } => {
            if let Some(mut frame) = inner.registry.begin_unsubscribe(&sub_id) {
                let id = inner.tracker.next_id();
                frame.id = Some(id);
                pending_unsubs.insert(id, sub_id);
                send_frame(transport, &frame).await?;
            }
            Ok(())
        },
    }
}

async fn send_frame(transport: &mut Transport, frame: &Pdu) -> std::result::Result<(), String> {
    match pdu::encode(frame) {
        Ok(text) => transport.send(text).await.map_err(|e| e.to_string()),
        Err(e) => {
            log::warn!("[rtm-link] failed to encode {}: {}", frame.action, e);
            Ok(())
        },
    }
}

/// Dispatch one inbound text frame. A malformed frame surfaces a protocol
/// error event; the connection stays up.
fn handle_frame(
    inner: &Inner,
    text: &str,
    pending_subs: &mut HashMap<u64, String>,
    pending_unsubs: &mut HashMap<u64, String>,
) {
    match pdu::decode(text) {
        Ok(Incoming::Response(pdu)) => {
            let id = match pdu.id {
                Some(id) => id,
                None => return,
            };
            if let Some(sub_id) = pending_subs.remove(&id) {
                if pdu.is_ok() {
                    let ok: SubscribeOk = serde_json::from_value(pdu.body).unwrap_or_default();
                    inner.registry.finish_subscribe(&sub_id, ok);
                } else {
                    let err = ErrorBody::from_value(&pdu.body);
                    log::warn!(
                        "[rtm-link] subscribe '{}' rejected: {} ({})",
                        sub_id,
                        err.error,
                        err.reason
                    );
                    inner.registry.fail_subscribe(
                        &sub_id,
                        SubscriptionError {
                            error: err.error,
                            reason: err.reason,
                            subscription_id: sub_id.clone(),
                            position: None,
                        },
                    );
                }
            } else if let Some(sub_id) = pending_unsubs.remove(&id) {
                if !pdu.is_ok() {
                    let err = ErrorBody::from_value(&pdu.body);
                    log::warn!(
                        "[rtm-link] unsubscribe '{}' rejected: {} ({})",
                        sub_id,
                        err.error,
                        err.reason
                    );
                }
                inner.registry.finish_unsubscribe(&sub_id);
            } else if !inner.tracker.complete(pdu) {
                log::debug!("[rtm-link] response for unknown id {}", id);
            }
        },
        Ok(Incoming::Unsolicited(pdu)) => match pdu.action.as_str() {
            actions::SUBSCRIPTION_DATA => {
                match serde_json::from_value::<SubscriptionData>(pdu.body) {
                    Ok(data) => inner.registry.on_data(data),
                    Err(e) => protocol_error(inner, &e.to_string()),
                }
            },
            actions::SUBSCRIPTION_INFO => {
                match serde_json::from_value::<SubscriptionInfo>(pdu.body) {
                    Ok(info) => inner.registry.on_info(info),
                    Err(e) => protocol_error(inner, &e.to_string()),
                }
            },
            actions::SUBSCRIPTION_ERROR => {
                match serde_json::from_value::<SubscriptionError>(pdu.body) {
                    Ok(err) => inner.registry.on_subscription_error(err),
                    Err(e) => protocol_error(inner, &e.to_string()),
                }
            },
            other => protocol_error(inner, &format!("unknown action '{}'", other)),
        },
        Err(e) => protocol_error(inner, &e.to_string()),
    }
}

fn protocol_error(inner: &Inner, reason: &str) {
    log::warn!("[rtm-link] protocol error: {}", reason);
    inner
        .bus
        .emit(events::ERROR, json!({ "reason": format!("Protocol error: {}", reason) }));
}

/// Sleep the jittered backoff delay, draining commands meanwhile.
/// Returns false when the client stopped.
async fn backoff_wait(inner: &Inner, cmd_rx: &mut mpsc::Receiver<Cmd>, attempt: u32) -> bool {
    let delay = backoff_delay(attempt, inner.max_reconnect_interval);
    log::info!(
        "[rtm-link] reconnecting in {:?} (attempt {})",
        delay,
        attempt + 1
    );

    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            biased;
            _ = inner.stop.notified() => return false,
            _ = &mut sleep => return true,
            cmd = cmd_rx.recv() => match cmd {
                Some(Cmd::Request { id, .. }) => {
                    // the request raced the disconnect
                    inner.tracker.fail(id, RtmError::Disconnected);
                },
                Some(Cmd::Send { .. }) => {},
                Some(Cmd::Subscribe { .. }) => {
                    // already registered; replay covers it after reconnect
                },
                Some(Cmd::Unsubscribe { id }) => inner.registry.remove(&id),
                None => return false,
            },
        }
    }
}

/// `random(0.5·d, 1.5·d)` where `d = min(cap, base · 2^attempt)`.
fn backoff_delay(attempt: u32, cap: Duration) -> Duration {
    let exp = BACKOFF_BASE.as_secs_f64() * 2f64.powi(attempt.min(31) as i32);
    let capped = exp.min(cap.as_secs_f64());
    let jittered = capped * rand::thread_rng().gen_range(0.5..=1.5);
    Duration::from_secs_f64(jittered)
}
