//! Action Cable client.
//!
//! Multiplexes channel subscriptions over a single WebSocket connection
//! speaking the `actioncable-v1-json` protocol.
//!
//! # Features
//! - Subscriptions keyed by canonical channel identifiers, with per-channel
//!   lifecycle callbacks
//! - `subscribe` retried until the server confirms or rejects it
//! - Staleness detection from server pings, with exponential backoff and
//!   jitter on reconnect
//! - Pluggable transports: tokio-tungstenite by default, an in-memory
//!   transport for tests
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), cable_client::Error> {
//! use cable_client::{Callbacks, create_consumer};
//! use serde_json::{Map, json};
//!
//! let consumer = create_consumer(Some("https://example.com/cable"))?;
//! let chat = consumer.subscriptions().create(
//!     json!({"channel": "ChatChannel", "room": "lobby"}),
//!     Callbacks::new()
//!         .on_connected(|_, _| println!("subscribed"))
//!         .on_received(|_, data| println!("got: {data}")),
//! )?;
//!
//! let mut data = Map::new();
//! data.insert("body".into(), json!("hello"));
//! chat.perform("speak", data)?;
//! # Ok(())
//! # }
//! ```

mod connection;
mod consumer;
pub mod guarantor;
pub mod memory;
pub mod monitor;
pub mod protocol;
mod subscription;
pub mod subscriptions;
pub mod transport;
mod types;
mod websocket;

pub use consumer::{Consumer, SubscriptionsHandle, create_consumer};
pub use memory::{MemoryConnector, MemorySocket};
pub use subscription::{
    Callbacks, ConnectedHook, DisconnectedHook, LifecycleHook, Notification, ReceivedHook,
    Subscription, SubscriptionId,
};
pub use transport::{Connector, ReadyStateMap, Transport, TransportEvent, TransportEvents};
pub use types::{
    CableUrl, Connected, ConnectionEvent, ConnectionState, ConsumerConfig, DEFAULT_URL,
    DisconnectReason, Disconnected, Error, PerformEncoder, TimingConfig, URL_ENV_VAR,
    merge_action, websocket_url,
};
pub use websocket::WebSocketConnector;
