//! Public entry point: [`Consumer`], [`create_consumer`] and
//! [`SubscriptionsHandle`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::connection::{Command, Connection, EventLoopState, run_event_loop};
use crate::protocol::{OutboundEnvelope, channel_params};
use crate::subscription::{Callbacks, Subscription, SubscriptionId};
use crate::subscriptions::Subscriptions;
use crate::types::{
    CableUrl, ConnectionEvent, ConnectionState, ConsumerConfig, DEFAULT_URL, Error,
    PerformEncoder, URL_ENV_VAR, websocket_url,
};

/// One connection to a cable server and the subscriptions multiplexed over it.
///
/// The connection is driven by a background task. It opens lazily, when the
/// first subscription is created or [`connect`](Consumer::connect) is called,
/// and is closed for good when the consumer is dropped.
pub struct Consumer {
    url: CableUrl,
    commands: mpsc::UnboundedSender<Command>,
    subscriptions: SubscriptionsHandle,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Consumer {
    /// Spawn the consumer's event loop. Must be called within a tokio
    /// runtime.
    pub fn new(config: ConsumerConfig) -> Result<Self, Error> {
        if let CableUrl::Fixed(url) = &config.url {
            websocket_url(url)?;
        }
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(config.event_channel_capacity.max(1));

        let connection = Connection::new(&config, transport_tx, events_tx.clone());
        let subscriptions = Subscriptions::new(config.timing.guarantor_retry_interval);

        tokio::spawn(run_event_loop(EventLoopState {
            connection,
            subscriptions,
            commands: commands_rx,
            transport_rx,
        }));

        Ok(Self {
            url: config.url,
            subscriptions: SubscriptionsHandle {
                commands: commands_tx.clone(),
                next_id: Arc::new(AtomicU64::new(1)),
                encoder: config.perform_encoder,
            },
            commands: commands_tx,
            events: events_tx,
        })
    }

    pub fn url(&self) -> &CableUrl {
        &self.url
    }

    pub fn subscriptions(&self) -> &SubscriptionsHandle {
        &self.subscriptions
    }

    /// Connection-level events. Slow receivers lag rather than stall the
    /// connection.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Open the connection. Returns `false` if it was already open or
    /// connecting.
    pub async fn connect(&self) -> Result<bool, Error> {
        let (tx, rx) = oneshot::channel();
        self.post(Command::Connect(tx))?;
        rx.await.map_err(|_| Error::ConsumerClosed)
    }

    /// Close the connection and stop reconnecting. Subscriptions stay
    /// registered and are resubscribed on the next [`connect`](Self::connect).
    pub async fn disconnect(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.post(Command::Disconnect(tx))?;
        rx.await.map_err(|_| Error::ConsumerClosed)
    }

    /// Current connection state; `None` before the first open.
    pub async fn state(&self) -> Result<Option<ConnectionState>, Error> {
        let (tx, rx) = oneshot::channel();
        self.post(Command::State(tx))?;
        rx.await.map_err(|_| Error::ConsumerClosed)
    }

    /// Write a raw envelope. Dropped if the connection is not open.
    pub fn send(&self, envelope: OutboundEnvelope) -> Result<(), Error> {
        self.post(Command::Send(envelope))
    }

    /// Offer `protocol` on subsequent opens, after the built-in ones.
    pub fn add_sub_protocol(&self, protocol: impl Into<String>) -> Result<(), Error> {
        self.post(Command::AddSubProtocol(protocol.into()))
    }

    fn post(&self, command: Command) -> Result<(), Error> {
        self.commands
            .send(command)
            .map_err(|_| Error::ConsumerClosed)
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

/// Create a consumer with the default WebSocket transport.
///
/// Without an explicit `url`, `ACTION_CABLE_URL` is used, falling back to
/// [`DEFAULT_URL`]. `http(s)` URLs are rewritten to `ws(s)`.
pub fn create_consumer(url: Option<&str>) -> Result<Consumer, Error> {
    let url = match url {
        Some(url) => url.to_string(),
        None => std::env::var(URL_ENV_VAR)
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_URL.to_string()),
    };
    Consumer::new(ConsumerConfig::new(url))
}

/// Creates and removes subscriptions on a [`Consumer`].
#[derive(Clone)]
pub struct SubscriptionsHandle {
    commands: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
    encoder: PerformEncoder,
}

impl SubscriptionsHandle {
    /// Subscribe to a channel. `channel` is a channel name or a params
    /// object with a `"channel"` key.
    ///
    /// The connection is opened if needed, `initialized` fires, and
    /// `subscribe` is retried until the server confirms or rejects it.
    pub fn create(&self, channel: impl Into<Value>, callbacks: Callbacks) -> Result<Subscription, Error> {
        let params = channel_params(channel.into())?;
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let subscription = Subscription::new(id, params, self.commands.clone(), self.encoder.clone());
        self.commands
            .send(Command::Create {
                subscription: subscription.clone(),
                callbacks,
            })
            .map_err(|_| Error::ConsumerClosed)?;
        Ok(subscription)
    }

    pub fn remove(&self, subscription: &Subscription) -> Result<(), Error> {
        self.commands
            .send(Command::Remove(subscription.id()))
            .map_err(|_| Error::ConsumerClosed)
    }
}

impl std::fmt::Debug for SubscriptionsHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionsHandle").finish_non_exhaustive()
    }
}
