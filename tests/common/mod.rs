//! In-process mock broker for integration tests.
//!
//! Binds a WebSocket listener on a loopback port and hands each accepted
//! connection (with its 0-based index) to the test's handler, so tests can
//! script broker behavior per connection — including dropping it to force
//! a reconnect.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::future::Future;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

pub type ServerWs = WebSocketStream<TcpStream>;

/// Start a broker; returns the `ws://` endpoint to hand to the client.
pub async fn start_broker<F, Fut>(handler: F) -> String
where
    F: Fn(ServerWs, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut index = 0;
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            match accept_async(stream).await {
                Ok(ws) => {
                    tokio::spawn(handler(ws, index));
                    index += 1;
                },
                Err(_) => continue,
            }
        }
    });
    format!("ws://{}", addr)
}

/// Next JSON frame from the client; answers pings, `None` on close.
pub async fn recv_json(ws: &mut ServerWs) -> Option<Value> {
    while let Some(msg) = ws.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                return Some(serde_json::from_str(text.as_str()).unwrap());
            },
            Ok(Message::Ping(payload)) => {
                let _ = ws.send(Message::Pong(payload)).await;
            },
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
    None
}

/// Send one JSON frame to the client.
pub async fn send_json(ws: &mut ServerWs, value: &Value) {
    let _ = ws.send(Message::Text(value.to_string().into())).await;
}
