//! WebSocket transport: upgrade, frame I/O, graceful close.
//!
//! No business-level logic lives here. The transport dials directly or
//! through an HTTP CONNECT proxy chosen by a [`ProxySelector`], then moves
//! single text frames in each direction.

use crate::error::{Result, RtmError};
use crate::proxy::ProxySelector;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{client_async_tls, connect_async, MaybeTlsStream, WebSocketStream};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound on the proxy's CONNECT response head.
const MAX_CONNECT_RESPONSE_BYTES: usize = 8 * 1024;

/// One live WebSocket connection.
pub(crate) struct Transport {
    stream: WsStream,
}

impl Transport {
    /// Perform the WebSocket upgrade, honoring the proxy selector.
    pub async fn dial(
        url: &str,
        proxy: &ProxySelector,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let attempt = async {
            match proxy.select(url) {
                None => {
                    let (stream, _response) = connect_async(url)
                        .await
                        .map_err(|e| RtmError::Dial(e.to_string()))?;
                    Ok(Self { stream })
                },
                Some(proxy_url) => Self::dial_via_proxy(url, &proxy_url).await,
            }
        };

        match tokio::time::timeout(connect_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(RtmError::Timeout(format!(
                "connect timeout ({:?})",
                connect_timeout
            ))),
        }
    }

    /// Open a TCP tunnel through `proxy_url` with CONNECT, then upgrade.
    async fn dial_via_proxy(url: &str, proxy_url: &str) -> Result<Self> {
        let (proxy_host, proxy_port) = host_port(proxy_url, 80)?;
        let default_port = if url.starts_with("wss://") { 443 } else { 80 };
        let (target_host, target_port) = host_port(url, default_port)?;

        let mut tcp = TcpStream::connect((proxy_host.as_str(), proxy_port))
            .await
            .map_err(|e| RtmError::Dial(format!("proxy {} unreachable: {}", proxy_url, e)))?;

        let connect = format!(
            "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\nProxy-Connection: Keep-Alive\r\n\r\n",
            host = target_host,
            port = target_port,
        );
        tcp.write_all(connect.as_bytes())
            .await
            .map_err(|e| RtmError::Dial(format!("proxy CONNECT failed: {}", e)))?;

        read_connect_response(&mut tcp).await?;

        let (stream, _response) = client_async_tls(url, tcp)
            .await
            .map_err(|e| RtmError::Dial(e.to_string()))?;
        Ok(Self { stream })
    }

    /// Send one text frame atomically.
    pub async fn send(&mut self, text: String) -> Result<()> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(write_error)
    }

    /// Next inbound frame; `None` when the stream ended.
    pub async fn recv(&mut self) -> Option<Result<Message>> {
        self.stream
            .next()
            .await
            .map(|result| result.map_err(read_error))
    }

    /// Send a keepalive ping.
    pub async fn ping(&mut self) -> Result<()> {
        self.stream
            .send(Message::Ping(Bytes::new()))
            .await
            .map_err(write_error)
    }

    /// Answer a server ping.
    pub async fn pong(&mut self, payload: Bytes) -> Result<()> {
        self.stream
            .send(Message::Pong(payload))
            .await
            .map_err(write_error)
    }

    /// Initiate graceful close; idempotent.
    pub async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

fn write_error(e: WsError) -> RtmError {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => RtmError::Closed,
        other => RtmError::Write(other.to_string()),
    }
}

fn read_error(e: WsError) -> RtmError {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => RtmError::Closed,
        other => RtmError::Read(other.to_string()),
    }
}

/// Wait for the proxy's `200` answer to CONNECT.
async fn read_connect_response(tcp: &mut TcpStream) -> Result<()> {
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_CONNECT_RESPONSE_BYTES {
            return Err(RtmError::Dial("proxy response too large".to_string()));
        }
        let n = tcp
            .read(&mut byte)
            .await
            .map_err(|e| RtmError::Dial(format!("proxy read failed: {}", e)))?;
        if n == 0 {
            return Err(RtmError::Dial(
                "proxy closed during CONNECT".to_string(),
            ));
        }
        head.push(byte[0]);
    }

    let status_line = String::from_utf8_lossy(&head);
    let status_line = status_line.lines().next().unwrap_or("");
    if status_line.split_whitespace().nth(1) == Some("200") {
        Ok(())
    } else {
        Err(RtmError::Dial(format!(
            "proxy refused CONNECT: {}",
            status_line
        )))
    }
}

/// Split a URL into host and port, applying `default_port` when absent.
fn host_port(url: &str, default_port: u16) -> Result<(String, u16)> {
    let rest = url
        .split("://")
        .nth(1)
        .ok_or_else(|| RtmError::Configuration(format!("invalid URL: {}", url)))?;
    let authority = rest
        .split(['/', '?'])
        .next()
        .unwrap_or_default();
    if authority.is_empty() {
        return Err(RtmError::Configuration(format!("invalid URL: {}", url)));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| RtmError::Configuration(format!("invalid port in {}", url)))?;
            Ok((host.to_string(), port))
        },
        None => Ok((authority.to_string(), default_port)),
    }
}
