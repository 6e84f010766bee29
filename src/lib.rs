//! Client library for the RTM real-time messaging service.
//!
//! Maintains one persistent WebSocket session to the broker,
//! authenticates it with a role/secret challenge, multiplexes
//! request/response and subscription traffic over the single connection,
//! and restores subscriptions transparently across reconnects.
//!
//! # Example
//!
//! ```rust,no_run
//! use rtm_link::{Listener, RtmClient, SubscribeOpts, SubscriptionMode};
//!
//! # async fn example() -> rtm_link::Result<()> {
//! let client = RtmClient::new("wss://broker.example.com", "my-appkey")?;
//!
//! client.on(rtm_link::events::CONNECTED, |_| {
//!     println!("connected");
//! });
//!
//! let listener = Listener::new().on_message(|message| {
//!     println!("got: {}", message);
//! });
//! client
//!     .subscribe("animals", SubscriptionMode::Reliable, SubscribeOpts::default(), listener)
//!     .await?;
//!
//! client.start()?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod error;
pub mod events;
pub mod pdu;
pub mod proxy;
mod requests;
pub mod subscription;
mod transport;

pub use auth::AuthProvider;
pub use client::{ClientState, RtmClient, RtmClientBuilder, Search};
pub use error::{Result, RtmError};
pub use events::HandlerId;
pub use pdu::{
    Pdu, PositionResponse, ReadOk, SubscribeHistory, SubscribeOk, SubscriptionData,
    SubscriptionError, SubscriptionInfo,
};
pub use proxy::ProxySelector;
pub use subscription::{
    Listener, SubscribeOpts, SubscriptionMode, SubscriptionState, UnsubscribeReason,
};
