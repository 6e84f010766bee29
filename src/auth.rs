//! Session authentication.
//!
//! The broker uses a two-step role/secret handshake: the client requests a
//! nonce with `auth/handshake`, then replies with
//! `auth/authenticate` carrying `base64(HMAC-SHA256(secret, nonce))`.
//! Any failure is an [`RtmError::Auth`], which the client treats as fatal
//! for the current connection but retryable via reconnect.

use crate::error::{Result, RtmError};
use crate::pdu::{
    self, actions, AuthCredentials, AuthHandshakeBody, AuthHandshakeData, AuthHandshakeOk,
    AuthenticateBody, ErrorBody, Incoming, Pdu, ROLE_SECRET,
};
use crate::transport::Transport;
use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use tokio_tungstenite::tungstenite::protocol::Message;

type HmacSha256 = Hmac<Sha256>;

/// Credentials attached to a client.
#[derive(Debug, Clone, Default)]
pub enum AuthProvider {
    /// No authentication; the session is usable right after the upgrade.
    #[default]
    None,

    /// Role/secret challenge-response.
    RoleSecret { role: String, secret: String },
}

impl AuthProvider {
    /// Create role/secret credentials.
    pub fn role_secret(role: impl Into<String>, secret: impl Into<String>) -> Self {
        Self::RoleSecret {
            role: role.into(),
            secret: secret.into(),
        }
    }

    /// Whether an authentication phase is required after dialing.
    pub fn is_configured(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Run the handshake on a fresh connection.
///
/// `next_id` draws correlation ids from the client-wide counter so auth
/// requests share the monotonic id space with user requests.
pub(crate) async fn authenticate(
    transport: &mut Transport,
    provider: &AuthProvider,
    mut next_id: impl FnMut() -> u64,
    deadline: Duration,
) -> Result<()> {
    let (role, secret) = match provider {
        AuthProvider::None => return Ok(()),
        AuthProvider::RoleSecret { role, secret } => (role.clone(), secret.clone()),
    };

    let flow = async {
        let handshake_id = next_id();
        let body = serde_json::to_value(AuthHandshakeBody {
            method: ROLE_SECRET.to_string(),
            data: AuthHandshakeData { role },
        })?;
        transport
            .send(pdu::encode(&Pdu::with_id(actions::AUTH_HANDSHAKE, handshake_id, body))?)
            .await?;

        let response = await_response(transport, handshake_id).await?;
        if !response.is_ok() {
            let err = ErrorBody::from_value(&response.body);
            return Err(RtmError::Auth(format!(
                "handshake rejected: {} ({})",
                err.error, err.reason
            )));
        }
        let ok: AuthHandshakeOk = serde_json::from_value(response.body)
            .map_err(|_| RtmError::Auth("handshake response carries no nonce".to_string()))?;

        let authenticate_id = next_id();
        let body = serde_json::to_value(AuthenticateBody {
            method: ROLE_SECRET.to_string(),
            credentials: AuthCredentials {
                hash: hash_nonce(&secret, &ok.data.nonce),
            },
        })?;
        transport
            .send(pdu::encode(&Pdu::with_id(
                actions::AUTH_AUTHENTICATE,
                authenticate_id,
                body,
            ))?)
            .await?;

        let response = await_response(transport, authenticate_id).await?;
        if !response.is_ok() {
            let err = ErrorBody::from_value(&response.body);
            return Err(RtmError::Auth(format!(
                "credentials rejected: {} ({})",
                err.error, err.reason
            )));
        }
        Ok(())
    };

    match tokio::time::timeout(deadline, flow).await {
        Ok(result) => result,
        Err(_) => Err(RtmError::Auth(format!(
            "authentication timeout ({:?})",
            deadline
        ))),
    }
}

/// Read frames until the response with `id` arrives.
///
/// The authentication phase is strict: a malformed frame here fails the
/// handshake (and with it the connection), unlike the lenient handling
/// after the session is up.
async fn await_response(transport: &mut Transport, id: u64) -> Result<Pdu> {
    loop {
        match transport.recv().await {
            Some(Ok(Message::Text(text))) => match pdu::decode(text.as_str()) {
                Ok(Incoming::Response(pdu)) if pdu.id == Some(id) => return Ok(pdu),
                Ok(_) => continue,
                Err(e) => {
                    return Err(RtmError::Auth(format!(
                        "malformed frame during authentication: {}",
                        e
                    )))
                },
            },
            Some(Ok(Message::Ping(payload))) => transport.pong(payload).await?,
            Some(Ok(Message::Close(_))) | None => {
                return Err(RtmError::Auth(
                    "connection closed during authentication".to_string(),
                ))
            },
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(RtmError::Auth(format!(
                    "transport fault during authentication: {}",
                    e
                )))
            },
        }
    }
}

/// `base64(HMAC-SHA256(secret, nonce))`.
pub(crate) fn hash_nonce(secret: &str, nonce: &str) -> String {
    general_purpose::STANDARD.encode(hmac_sha256(secret.as_bytes(), nonce.as_bytes()))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}
