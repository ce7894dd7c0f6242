//! Resends `subscribe` until the server answers it.

use std::time::Duration;

use tokio::time::Instant;

use crate::subscription::{Subscription, SubscriptionId};

/// Subscriptions awaiting confirmation or rejection, retried on a fixed
/// interval while any remain and the connection can carry the resend.
#[derive(Debug)]
pub struct SubscriptionGuarantor {
    retry_interval: Duration,
    pending: Vec<Subscription>,
    next_retry_at: Option<Instant>,
}

impl SubscriptionGuarantor {
    pub fn new(retry_interval: Duration) -> Self {
        Self {
            retry_interval,
            pending: Vec::new(),
            next_retry_at: None,
        }
    }

    /// Track `subscription` until [`forget`](Self::forget) is called. Adding
    /// an instance already pending is a no-op.
    pub fn guarantee(&mut self, subscription: &Subscription, now: Instant) {
        if !self.is_pending(subscription.id()) {
            self.pending.push(subscription.clone());
        }
        if self.next_retry_at.is_none() {
            self.next_retry_at = Some(now + self.retry_interval);
        }
    }

    pub fn forget(&mut self, id: SubscriptionId) {
        self.pending.retain(|s| s.id() != id);
        if self.pending.is_empty() {
            self.next_retry_at = None;
        }
    }

    pub fn is_pending(&self, id: SubscriptionId) -> bool {
        self.pending.iter().any(|s| s.id() == id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending(&self) -> &[Subscription] {
        &self.pending
    }

    pub fn next_retry_at(&self) -> Option<Instant> {
        self.next_retry_at
    }

    /// Subscriptions to resend if a retry is due at `now`. The timer is
    /// disarmed; call [`rearm`](Self::rearm) once the resend went out.
    pub fn due(&mut self, now: Instant) -> Vec<Subscription> {
        match self.next_retry_at {
            Some(at) if at <= now => {}
            _ => return Vec::new(),
        }
        self.next_retry_at = None;
        self.pending.clone()
    }

    /// Schedule the next retry while anything is pending.
    pub fn rearm(&mut self, now: Instant) {
        if !self.pending.is_empty() {
            self.next_retry_at = Some(now + self.retry_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{Map, json};
    use tokio::sync::mpsc;

    use super::*;
    use crate::types::merge_action;

    fn sub(id: u64) -> Subscription {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut params = Map::new();
        params.insert("channel".into(), json!("chat"));
        Subscription::new(SubscriptionId(id), params, tx, Arc::new(merge_action))
    }

    #[test]
    fn guarantee_is_idempotent() {
        let now = Instant::now();
        let mut g = SubscriptionGuarantor::new(Duration::from_millis(500));
        let s = sub(1);
        g.guarantee(&s, now);
        g.guarantee(&s, now);
        assert_eq!(g.len(), 1);
        g.forget(s.id());
        assert!(g.is_empty());
        assert!(g.next_retry_at().is_none());
    }

    #[test]
    fn same_identifier_different_instances_both_pend() {
        let now = Instant::now();
        let mut g = SubscriptionGuarantor::new(Duration::from_millis(500));
        g.guarantee(&sub(1), now);
        g.guarantee(&sub(2), now);
        assert_eq!(g.len(), 2);
        g.forget(SubscriptionId(1));
        assert!(!g.is_pending(SubscriptionId(1)));
        assert!(g.is_pending(SubscriptionId(2)));
    }

    #[test]
    fn due_respects_retry_interval() {
        let now = Instant::now();
        let interval = Duration::from_millis(500);
        let mut g = SubscriptionGuarantor::new(interval);
        g.guarantee(&sub(1), now);
        assert_eq!(g.next_retry_at(), Some(now + interval));

        assert!(g.due(now + Duration::from_millis(499)).is_empty());
        let due = g.due(now + interval);
        assert_eq!(due.len(), 1);
        assert!(g.next_retry_at().is_none());
        assert!(g.due(now + interval * 3).is_empty());

        g.rearm(now + interval);
        assert_eq!(g.next_retry_at(), Some(now + interval * 2));
    }

    #[test]
    fn guarantee_rearms_a_parked_timer() {
        let now = Instant::now();
        let interval = Duration::from_millis(500);
        let mut g = SubscriptionGuarantor::new(interval);
        let s = sub(1);
        g.guarantee(&s, now);
        assert_eq!(g.due(now + interval).len(), 1);
        assert!(g.next_retry_at().is_none());

        let later = now + Duration::from_secs(30);
        g.guarantee(&s, later);
        assert_eq!(g.len(), 1);
        assert_eq!(g.next_retry_at(), Some(later + interval));
    }

    #[test]
    fn rearm_is_a_no_op_when_nothing_pends() {
        let now = Instant::now();
        let mut g = SubscriptionGuarantor::new(Duration::from_millis(500));
        g.rearm(now);
        assert!(g.next_retry_at().is_none());
    }

    #[test]
    fn nothing_due_when_idle() {
        let mut g = SubscriptionGuarantor::new(Duration::from_millis(500));
        assert!(g.due(Instant::now()).is_empty());
        assert!(g.next_retry_at().is_none());
    }
}
