//! Registry of live subscriptions and callback fan-out.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use tokio::time::Instant;

use crate::guarantor::SubscriptionGuarantor;
use crate::protocol::OutboundEnvelope;
use crate::subscription::{Callbacks, Notification, Subscription, SubscriptionId};
use crate::types::Connected;

/// Where the registry writes `subscribe`/`unsubscribe` commands.
pub trait CommandSink {
    /// Write `envelope` if the transport is open. Returns whether a write was
    /// attempted.
    fn send_envelope(&mut self, envelope: &OutboundEnvelope) -> bool;
}

struct Entry {
    subscription: Subscription,
    callbacks: Callbacks,
    /// Set by the first confirmation of the current subscribe cycle.
    confirmed: bool,
}

/// Ordered collection of subscriptions, keyed by instance identity.
///
/// Several instances may share an identifier; lookups by identifier return
/// every match and fan-out reaches each of them.
pub struct Subscriptions {
    entries: Vec<Entry>,
    guarantor: SubscriptionGuarantor,
}

impl Subscriptions {
    pub fn new(guarantor_retry_interval: Duration) -> Self {
        Self {
            entries: Vec::new(),
            guarantor: SubscriptionGuarantor::new(guarantor_retry_interval),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn guarantor(&self) -> &SubscriptionGuarantor {
        &self.guarantor
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Subscription> {
        self.entries.iter().map(|e| &e.subscription)
    }

    pub fn get(&self, id: SubscriptionId) -> Option<&Subscription> {
        self.iter().find(|s| s.id() == id)
    }

    pub fn find_all(&self, identifier: &str) -> Vec<&Subscription> {
        self.iter().filter(|s| s.identifier() == identifier).collect()
    }

    /// The most recently added instance with `identifier`.
    pub fn find(&self, identifier: &str) -> Option<&Subscription> {
        self.iter().rev().find(|s| s.identifier() == identifier)
    }

    /// Track a new subscription, fire `initialized`, then subscribe.
    pub fn add(
        &mut self,
        subscription: Subscription,
        callbacks: Callbacks,
        sink: &mut impl CommandSink,
        now: Instant,
    ) {
        tracing::debug!(identifier = subscription.identifier(), "Adding subscription");
        self.entries.push(Entry {
            subscription: subscription.clone(),
            callbacks,
            confirmed: false,
        });
        self.notify_one(subscription.id(), Notification::Initialized);
        self.subscribe(&subscription, sink, now);
    }

    /// Drop a subscription. `unsubscribe` is only sent once no other
    /// instance shares its identifier.
    pub fn remove(&mut self, id: SubscriptionId, sink: &mut impl CommandSink) -> Option<Subscription> {
        let entry = self.take(id)?;
        let identifier = entry.subscription.identifier();
        if self.find(identifier).is_none() {
            sink.send_envelope(&OutboundEnvelope::unsubscribe(identifier));
        } else {
            tracing::debug!(identifier, "Keeping server subscription for remaining instances");
        }
        tracing::debug!(identifier, "Removed subscription");
        Some(entry.subscription)
    }

    /// Terminal rejection: every instance with `identifier` is dropped and
    /// notified. Returns how many were rejected.
    pub fn reject(&mut self, identifier: &str) -> usize {
        let ids: Vec<SubscriptionId> = self.find_all(identifier).iter().map(|s| s.id()).collect();
        for id in &ids {
            if let Some(mut entry) = self.take(*id) {
                dispatch(&mut entry, Notification::Rejected);
            }
        }
        ids.len()
    }

    fn take(&mut self, id: SubscriptionId) -> Option<Entry> {
        self.guarantor.forget(id);
        let index = self.entries.iter().position(|e| e.subscription.id() == id)?;
        Some(self.entries.remove(index))
    }

    /// Send `subscribe` and keep retrying it until the server answers.
    pub fn subscribe(&mut self, subscription: &Subscription, sink: &mut impl CommandSink, now: Instant) {
        sink.send_envelope(&OutboundEnvelope::subscribe(subscription.identifier()));
        self.guarantor.guarantee(subscription, now);
    }

    /// Resubscribe every tracked instance. Returns how many were resent.
    pub fn reload(&mut self, sink: &mut impl CommandSink, now: Instant) -> usize {
        let subscriptions: Vec<Subscription> = self
            .entries
            .iter_mut()
            .map(|e| {
                e.confirmed = false;
                e.subscription.clone()
            })
            .collect();
        for subscription in &subscriptions {
            self.subscribe(subscription, sink, now);
        }
        subscriptions.len()
    }

    /// Resend `subscribe` for pending instances if a retry is due. The
    /// retry timer stays parked while nothing could be written; the next
    /// `welcome` reload restarts it.
    pub fn retry_pending(&mut self, sink: &mut impl CommandSink, now: Instant) -> usize {
        let due = self.guarantor.due(now);
        let mut written = 0;
        for subscription in &due {
            tracing::debug!(
                identifier = subscription.identifier(),
                "Retrying unconfirmed subscription"
            );
            if sink.send_envelope(&OutboundEnvelope::subscribe(subscription.identifier())) {
                written += 1;
            }
        }
        if written > 0 {
            self.guarantor.rearm(now);
        } else if !due.is_empty() {
            tracing::debug!(pending = due.len(), "Connection closed, parking subscription retries");
        }
        written
    }

    pub fn next_retry_at(&self) -> Option<Instant> {
        self.guarantor.next_retry_at()
    }

    /// Mark instances with `identifier` as confirmed. `connected` fires once
    /// per subscribe cycle. Returns how many instances matched.
    pub fn confirm(&mut self, identifier: &str, reconnected: bool) -> usize {
        let mut matched = 0;
        for entry in self
            .entries
            .iter_mut()
            .filter(|e| e.subscription.identifier() == identifier)
        {
            matched += 1;
            self.guarantor.forget(entry.subscription.id());
            if entry.confirmed {
                tracing::debug!(identifier, "Ignoring repeated confirmation");
                continue;
            }
            entry.confirmed = true;
            dispatch(entry, Notification::Connected(Connected { reconnected }));
        }
        matched
    }

    /// Fan `notification` out to every instance with `identifier`.
    pub fn notify(&mut self, identifier: &str, notification: Notification) -> usize {
        let mut matched = 0;
        for entry in self
            .entries
            .iter_mut()
            .filter(|e| e.subscription.identifier() == identifier)
        {
            matched += 1;
            dispatch(entry, notification.clone());
        }
        matched
    }

    pub fn notify_all(&mut self, notification: Notification) {
        for entry in &mut self.entries {
            dispatch(entry, notification.clone());
        }
    }

    fn notify_one(&mut self, id: SubscriptionId, notification: Notification) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.subscription.id() == id) {
            dispatch(entry, notification);
        }
    }
}

/// Run one callback. A panic is logged and contained to this subscription.
fn dispatch(entry: &mut Entry, notification: Notification) {
    let callback = notification.name();
    let Entry {
        subscription,
        callbacks,
        ..
    } = entry;
    let result = catch_unwind(AssertUnwindSafe(|| {
        callbacks.invoke(subscription, notification);
    }));
    if result.is_err() {
        tracing::error!(
            identifier = subscription.identifier(),
            callback,
            "Subscription callback panicked"
        );
    }
}
