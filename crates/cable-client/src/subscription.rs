//! A single channel binding: the application's handle plus its callbacks.

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::Error;
use crate::connection::Command;
use crate::protocol::{OutboundEnvelope, identifier_for};
use crate::types::{Connected, Disconnected, PerformEncoder};

/// Identity of one subscription instance. Distinct instances may share an
/// identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub(crate) u64);

/// Handle to one subscription. Cheap to clone; all clones are the same
/// instance.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<Inner>,
}

struct Inner {
    id: SubscriptionId,
    identifier: String,
    params: Map<String, Value>,
    commands: mpsc::UnboundedSender<Command>,
    encoder: PerformEncoder,
}

impl Subscription {
    pub(crate) fn new(
        id: SubscriptionId,
        params: Map<String, Value>,
        commands: mpsc::UnboundedSender<Command>,
        encoder: PerformEncoder,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                identifier: identifier_for(&params),
                params,
                commands,
                encoder,
            }),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.inner.id
    }

    pub fn identifier(&self) -> &str {
        &self.inner.identifier
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.inner.params
    }

    /// Send a channel action. The inner `data` object is built by the
    /// consumer's [`PerformEncoder`]; by default `data` plus `"action"`.
    ///
    /// Delivery is best effort: when the connection is not open the command
    /// is dropped, as it would be by the server.
    pub fn perform(&self, action: impl Into<Value>, data: Map<String, Value>) -> Result<(), Error> {
        let data = (self.inner.encoder)(action.into(), data);
        self.send(&data)
    }

    /// Send a raw `message` command with `data` as its payload.
    pub fn send(&self, data: &Map<String, Value>) -> Result<(), Error> {
        let envelope = OutboundEnvelope::message(self.identifier(), data)?;
        self.inner
            .commands
            .send(Command::Send(envelope))
            .map_err(|_| Error::ConsumerClosed)
    }

    /// Remove this subscription from its consumer.
    pub fn unsubscribe(&self) -> Result<(), Error> {
        self.inner
            .commands
            .send(Command::Remove(self.id()))
            .map_err(|_| Error::ConsumerClosed)
    }
}

impl PartialEq for Subscription {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Subscription {}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.inner.id)
            .field("identifier", &self.inner.identifier)
            .finish()
    }
}

/// A lifecycle event delivered to a subscription's callbacks.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Initialized,
    Connected(Connected),
    Disconnected(Disconnected),
    Rejected,
    Received(Value),
}

impl Notification {
    pub fn name(&self) -> &'static str {
        match self {
            Notification::Initialized => "initialized",
            Notification::Connected(_) => "connected",
            Notification::Disconnected(_) => "disconnected",
            Notification::Rejected => "rejected",
            Notification::Received(_) => "received",
        }
    }
}

pub type LifecycleHook = Box<dyn FnMut(&Subscription) + Send>;
pub type ConnectedHook = Box<dyn FnMut(&Subscription, Connected) + Send>;
pub type DisconnectedHook = Box<dyn FnMut(&Subscription, Disconnected) + Send>;
pub type ReceivedHook = Box<dyn FnMut(&Subscription, Value) + Send>;

/// Application callbacks. Unset slots are no-ops.
///
/// Callbacks run on the consumer's event loop; they must not block. Calling
/// [`Subscription::perform`] from a callback is fine.
#[derive(Default)]
pub struct Callbacks {
    pub initialized: Option<LifecycleHook>,
    pub connected: Option<ConnectedHook>,
    pub disconnected: Option<DisconnectedHook>,
    pub rejected: Option<LifecycleHook>,
    pub received: Option<ReceivedHook>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_initialized(mut self, f: impl FnMut(&Subscription) + Send + 'static) -> Self {
        self.initialized = Some(Box::new(f));
        self
    }

    pub fn on_connected(mut self, f: impl FnMut(&Subscription, Connected) + Send + 'static) -> Self {
        self.connected = Some(Box::new(f));
        self
    }

    pub fn on_disconnected(
        mut self,
        f: impl FnMut(&Subscription, Disconnected) + Send + 'static,
    ) -> Self {
        self.disconnected = Some(Box::new(f));
        self
    }

    pub fn on_rejected(mut self, f: impl FnMut(&Subscription) + Send + 'static) -> Self {
        self.rejected = Some(Box::new(f));
        self
    }

    pub fn on_received(mut self, f: impl FnMut(&Subscription, Value) + Send + 'static) -> Self {
        self.received = Some(Box::new(f));
        self
    }

    pub(crate) fn invoke(&mut self, subscription: &Subscription, notification: Notification) {
        match notification {
            Notification::Initialized => {
                if let Some(f) = self.initialized.as_mut() {
                    f(subscription);
                }
            }
            Notification::Connected(info) => {
                if let Some(f) = self.connected.as_mut() {
                    f(subscription, info);
                }
            }
            Notification::Disconnected(info) => {
                if let Some(f) = self.disconnected.as_mut() {
                    f(subscription, info);
                }
            }
            Notification::Rejected => {
                if let Some(f) = self.rejected.as_mut() {
                    f(subscription);
                }
            }
            Notification::Received(data) => {
                if let Some(f) = self.received.as_mut() {
                    f(subscription, data);
                }
            }
        }
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("initialized", &self.initialized.is_some())
            .field("connected", &self.connected.is_some())
            .field("disconnected", &self.disconnected.is_some())
            .field("rejected", &self.rejected.is_some())
            .field("received", &self.received.is_some())
            .finish()
    }
}
