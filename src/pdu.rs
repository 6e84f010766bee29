//! Protocol data units: one JSON object per WebSocket text frame.
//!
//! Every frame is `{"action": string, "id"?: u64, "body": object}`. An
//! inbound action ending in `/ok` or `/error` is a response to a request;
//! `rtm/subscription/*` frames are unsolicited; anything else carrying an
//! `id` is treated as a response.

use crate::error::{Result, RtmError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request and notification action names.
pub mod actions {
    pub const AUTH_HANDSHAKE: &str = "auth/handshake";
    pub const AUTH_AUTHENTICATE: &str = "auth/authenticate";
    pub const PUBLISH: &str = "rtm/publish";
    pub const SUBSCRIBE: &str = "rtm/subscribe";
    pub const UNSUBSCRIBE: &str = "rtm/unsubscribe";
    pub const READ: &str = "rtm/read";
    pub const WRITE: &str = "rtm/write";
    pub const DELETE: &str = "rtm/delete";
    pub const SEARCH: &str = "rtm/search";
    pub const SEARCH_DATA: &str = "rtm/search/data";
    pub const SUBSCRIPTION_DATA: &str = "rtm/subscription/data";
    pub const SUBSCRIPTION_INFO: &str = "rtm/subscription/info";
    pub const SUBSCRIPTION_ERROR: &str = "rtm/subscription/error";

    pub const OK_SUFFIX: &str = "/ok";
    pub const ERROR_SUFFIX: &str = "/error";
}

/// A single protocol data unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pdu {
    /// Verb, e.g. `rtm/publish` or `rtm/subscribe/ok`
    pub action: String,

    /// Correlation id; present iff the sender wants (or echoes) a reply
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,

    /// Opaque JSON payload
    #[serde(default)]
    pub body: Value,
}

impl Pdu {
    /// Create a PDU without a correlation id (fire-and-forget).
    pub fn new(action: impl Into<String>, body: Value) -> Self {
        Self {
            action: action.into(),
            id: None,
            body,
        }
    }

    /// Create a PDU carrying a correlation id.
    pub fn with_id(action: impl Into<String>, id: u64, body: Value) -> Self {
        Self {
            action: action.into(),
            id: Some(id),
            body,
        }
    }

    /// Whether this PDU is a positive acknowledgement.
    pub fn is_ok(&self) -> bool {
        self.action.ends_with(actions::OK_SUFFIX)
    }

    /// Whether this PDU is a negative acknowledgement.
    pub fn is_error(&self) -> bool {
        self.action.ends_with(actions::ERROR_SUFFIX)
    }
}

/// An inbound frame after classification.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Reply to an outstanding request; `id` echoes the request id.
    Response(Pdu),

    /// Broker-initiated frame (subscription data/info/error).
    Unsolicited(Pdu),
}

/// Encode a PDU as one text frame.
pub fn encode(pdu: &Pdu) -> Result<String> {
    serde_json::to_string(pdu).map_err(RtmError::from)
}

/// Decode one text frame and classify it.
///
/// Invalid JSON and frames without an `action` fail with
/// [`RtmError::Protocol`]; the caller decides whether the connection
/// survives (it does, outside the authentication phase).
pub fn decode(text: &str) -> Result<Incoming> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| RtmError::Protocol(format!("invalid frame: {}", e)))?;

    if value.get("action").and_then(Value::as_str).is_none() {
        return Err(RtmError::Protocol("frame has no action".to_string()));
    }

    let pdu: Pdu = serde_json::from_value(value)
        .map_err(|e| RtmError::Protocol(format!("malformed frame: {}", e)))?;

    if pdu.action.starts_with("rtm/subscription/") {
        return Ok(Incoming::Unsolicited(pdu));
    }

    if pdu.is_ok() || pdu.is_error() {
        if pdu.id.is_none() {
            return Err(RtmError::Protocol(format!(
                "response '{}' carries no id",
                pdu.action
            )));
        }
        return Ok(Incoming::Response(pdu));
    }

    if pdu.id.is_some() {
        Ok(Incoming::Response(pdu))
    } else {
        Ok(Incoming::Unsolicited(pdu))
    }
}

// ── Typed request/response bodies ───────────────────────────────────────────

/// Body of `rtm/publish` and `rtm/write`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub channel: String,
    pub message: Value,
}

/// Body of `rtm/publish/ok` and `rtm/write/ok`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionResponse {
    #[serde(default)]
    pub position: String,
}

/// Body of `rtm/read`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadBody {
    pub channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
}

/// Body of `rtm/read/ok`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadOk {
    #[serde(default)]
    pub position: String,
    /// Latest message on the channel; `null` if the channel is empty.
    #[serde(default)]
    pub message: Value,
}

/// Body of `rtm/delete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteBody {
    pub channel: String,
}

/// Body of `rtm/search`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchBody {
    pub prefix: String,
}

/// Body of `rtm/search/data` and the terminal `rtm/search/ok`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchData {
    #[serde(default)]
    pub channels: Vec<String>,
}

/// Body of any `/error` response.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ErrorBody {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub reason: String,
}

impl ErrorBody {
    /// Extract an error body, tolerating absent fields.
    pub fn from_value(body: &Value) -> Self {
        serde_json::from_value(body.clone()).unwrap_or_default()
    }
}

// ── Subscription bodies ─────────────────────────────────────────────────────

/// History options for `rtm/subscribe`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscribeHistory {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age: Option<u64>,
}

/// Body of `rtm/subscribe`, built from subscription state at send time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscribeBody {
    pub subscription_id: String,
    pub force: bool,
    pub fast_forward: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<SubscribeHistory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
}

/// Body of `rtm/subscribe/ok`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscribeOk {
    #[serde(default)]
    pub position: String,
    #[serde(default)]
    pub subscription_id: String,
}

/// Body of `rtm/unsubscribe`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsubscribeBody {
    pub subscription_id: String,
}

/// Body of `rtm/subscription/data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionData {
    #[serde(default)]
    pub position: String,
    #[serde(default)]
    pub subscription_id: String,
    #[serde(default)]
    pub messages: Vec<Value>,
}

/// Body of `rtm/subscription/info` (e.g. a fast-forward notice).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    #[serde(default)]
    pub info: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub position: String,
    #[serde(default)]
    pub subscription_id: String,
}

/// Body of `rtm/subscription/error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionError {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub subscription_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
}

/// The `subscription/error` code signalling the stream position is gone.
pub const OUT_OF_SYNC: &str = "out_of_sync";

// ── Auth bodies ─────────────────────────────────────────────────────────────

/// Body of `auth/handshake`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthHandshakeBody {
    pub method: String,
    pub data: AuthHandshakeData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthHandshakeData {
    pub role: String,
}

/// Body of `auth/handshake/ok`; carries the server nonce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthHandshakeOk {
    pub data: AuthNonce,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthNonce {
    #[serde(default)]
    pub nonce: String,
}

/// Body of `auth/authenticate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticateBody {
    pub method: String,
    pub credentials: AuthCredentials,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthCredentials {
    pub hash: String,
}

/// Auth method used by the role/secret handshake.
pub const ROLE_SECRET: &str = "role_secret";
