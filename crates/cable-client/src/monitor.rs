//! Connection health monitoring and reconnection backoff.
//!
//! The monitor is a timestamp state machine polled by the event loop. Each
//! poll checks for staleness (no inbound traffic within the stale threshold)
//! and schedules the next poll with exponential backoff plus jitter. It never
//! gives up; only [`ConnectionMonitor::stop`] ends polling.

use std::time::Duration;

use tokio::time::Instant;

use crate::types::TimingConfig;

/// Source of uniformly distributed values in `[0, 1)`.
pub type RandomSource = fn() -> f64;

fn thread_random() -> f64 {
    rand::random::<f64>()
}

/// What a poll decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Traffic is recent enough.
    Fresh,
    /// Stale, but the transport disconnected recently; wait another round.
    SkippedRecentDisconnect,
    /// Stale; the connection should be reopened.
    Reopen,
}

#[derive(Debug, Clone)]
pub struct ConnectionMonitor {
    stale_threshold: Duration,
    backoff_rate: f64,
    max_backoff_attempts: u32,
    random: RandomSource,
    started_at: Option<Instant>,
    stopped_at: Option<Instant>,
    pinged_at: Option<Instant>,
    disconnected_at: Option<Instant>,
    reconnect_attempts: u32,
    next_poll_at: Option<Instant>,
}

impl ConnectionMonitor {
    pub fn new(timing: &TimingConfig) -> Self {
        Self {
            stale_threshold: timing.stale_threshold,
            backoff_rate: timing.reconnection_backoff_rate,
            max_backoff_attempts: timing.max_backoff_attempts,
            random: thread_random,
            started_at: None,
            stopped_at: None,
            pinged_at: None,
            disconnected_at: None,
            reconnect_attempts: 0,
            next_poll_at: None,
        }
    }

    /// Replace the jitter source (deterministic tests).
    pub fn with_random(mut self, random: RandomSource) -> Self {
        self.random = random;
        self
    }

    pub fn start(&mut self, now: Instant) {
        if self.is_running() {
            return;
        }
        self.started_at = Some(now);
        self.stopped_at = None;
        self.schedule_poll(now);
        tracing::debug!(
            stale_threshold = ?self.stale_threshold,
            "ConnectionMonitor started"
        );
    }

    pub fn stop(&mut self, now: Instant) {
        if !self.is_running() {
            return;
        }
        self.stopped_at = Some(now);
        self.next_poll_at = None;
        tracing::debug!("ConnectionMonitor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.started_at.is_some() && self.stopped_at.is_none()
    }

    /// Any inbound traffic proves liveness.
    pub fn record_message(&mut self, now: Instant) {
        self.pinged_at = Some(now);
    }

    pub fn record_connect(&mut self) {
        self.reconnect_attempts = 0;
        self.disconnected_at = None;
        tracing::debug!("ConnectionMonitor recorded connect");
    }

    pub fn record_disconnect(&mut self, now: Instant) {
        self.disconnected_at = Some(now);
        tracing::debug!("ConnectionMonitor recorded disconnect");
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn next_poll_at(&self) -> Option<Instant> {
        self.next_poll_at
    }

    /// Delay until the next poll for the current attempt count and a jitter
    /// sample `random` in `[0, 1)`.
    ///
    /// The first attempt jitters across the full base interval; later
    /// attempts only across `backoff_rate` of it.
    pub fn poll_interval(&self, random: f64) -> Duration {
        let exponent = self.reconnect_attempts.min(self.max_backoff_attempts);
        let backoff = (1.0 + self.backoff_rate).powi(i32::try_from(exponent).unwrap_or(i32::MAX));
        let jitter_max = if self.reconnect_attempts == 0 {
            1.0
        } else {
            self.backoff_rate
        };
        let jitter = jitter_max * random;
        let millis = self.stale_threshold.as_secs_f64() * 1000.0 * backoff * (1.0 + jitter);
        Duration::try_from_secs_f64(millis / 1000.0).unwrap_or(self.stale_threshold)
    }

    fn refreshed_at(&self) -> Option<Instant> {
        self.pinged_at.or(self.started_at)
    }

    pub fn connection_is_stale(&self, now: Instant) -> bool {
        self.refreshed_at()
            .is_some_and(|at| now.saturating_duration_since(at) > self.stale_threshold)
    }

    pub fn disconnected_recently(&self, now: Instant) -> bool {
        self.disconnected_at
            .is_some_and(|at| now.saturating_duration_since(at) < self.stale_threshold)
    }

    /// Run one poll and schedule the next one.
    pub fn poll(&mut self, now: Instant) -> PollOutcome {
        if !self.is_running() {
            return PollOutcome::Fresh;
        }
        let outcome = self.reconnect_if_stale(now);
        self.schedule_poll(now);
        outcome
    }

    fn reconnect_if_stale(&mut self, now: Instant) -> PollOutcome {
        if !self.connection_is_stale(now) {
            return PollOutcome::Fresh;
        }
        tracing::info!(
            attempts = self.reconnect_attempts,
            stale_for = ?self.refreshed_at().map(|at| now.saturating_duration_since(at)),
            "ConnectionMonitor detected stale connection"
        );
        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
        if self.disconnected_recently(now) {
            tracing::debug!("ConnectionMonitor skipping reopen of recent disconnect");
            PollOutcome::SkippedRecentDisconnect
        } else {
            PollOutcome::Reopen
        }
    }

    fn schedule_poll(&mut self, now: Instant) {
        let interval = self.poll_interval((self.random)());
        self.next_poll_at = Some(now + interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zero() -> f64 {
        0.0
    }

    fn monitor() -> ConnectionMonitor {
        ConnectionMonitor::new(&TimingConfig::default()).with_random(zero)
    }

    fn ms(d: Duration) -> f64 {
        d.as_secs_f64() * 1000.0
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-3
    }

    #[test]
    fn backoff_grows_then_plateaus() {
        let mut m = monitor();
        let mut previous = 0.0;
        for n in 0..=10u32 {
            m.reconnect_attempts = n;
            let expected = 6.0 * 1.15f64.powi(n as i32) * 1000.0;
            let actual = ms(m.poll_interval(0.0));
            assert!(approx(actual, expected), "attempt {n}: {actual} != {expected}");
            assert!(actual > previous);
            previous = actual;
        }
        for n in 11..15u32 {
            m.reconnect_attempts = n;
            assert!(approx(ms(m.poll_interval(0.0)), previous));
        }
    }

    #[test]
    fn first_attempt_jitter_is_full_range() {
        let m = monitor();
        assert!(approx(ms(m.poll_interval(0.0)), 6000.0));
        assert!(approx(ms(m.poll_interval(0.5)), 9000.0));
    }

    #[test]
    fn later_attempt_jitter_is_scaled_by_backoff_rate() {
        let mut m = monitor();
        m.reconnect_attempts = 1;
        let base = 6000.0 * 1.15;
        assert!(approx(ms(m.poll_interval(0.0)), base));
        assert!(approx(ms(m.poll_interval(0.5)), base * (1.0 + 0.15 * 0.5)));
    }

    #[test]
    fn start_and_stop() {
        let now = Instant::now();
        let mut m = monitor();
        assert!(!m.is_running());
        assert!(m.next_poll_at().is_none());

        m.start(now);
        assert!(m.is_running());
        assert_eq!(m.next_poll_at(), Some(now + Duration::from_secs(6)));

        m.stop(now);
        assert!(!m.is_running());
        assert!(m.next_poll_at().is_none());
        assert_eq!(m.poll(now + Duration::from_secs(60)), PollOutcome::Fresh);
    }

    #[test]
    fn staleness_uses_last_message() {
        let now = Instant::now();
        let mut m = monitor();
        m.start(now);
        assert!(!m.connection_is_stale(now + Duration::from_secs(6)));
        assert!(m.connection_is_stale(now + Duration::from_secs(7)));

        m.record_message(now + Duration::from_secs(5));
        assert!(!m.connection_is_stale(now + Duration::from_secs(10)));
        assert!(m.connection_is_stale(now + Duration::from_secs(12)));
    }

    #[test]
    fn poll_requests_reopen_when_stale() {
        let now = Instant::now();
        let mut m = monitor();
        m.start(now);

        let t = now + Duration::from_secs(3);
        assert_eq!(m.poll(t), PollOutcome::Fresh);
        assert_eq!(m.reconnect_attempts(), 0);

        let t = now + Duration::from_secs(7);
        assert_eq!(m.poll(t), PollOutcome::Reopen);
        assert_eq!(m.reconnect_attempts(), 1);
        // Next poll is spaced by the backoff for one attempt.
        let next = m.next_poll_at().unwrap();
        assert!(approx(ms(next - t), 6900.0));
    }

    #[test]
    fn poll_skips_reopen_after_recent_disconnect() {
        let now = Instant::now();
        let mut m = monitor();
        m.start(now);
        m.record_disconnect(now + Duration::from_secs(5));

        assert_eq!(
            m.poll(now + Duration::from_secs(7)),
            PollOutcome::SkippedRecentDisconnect
        );
        assert_eq!(m.reconnect_attempts(), 1);
        assert_eq!(m.poll(now + Duration::from_secs(12)), PollOutcome::Reopen);
        assert_eq!(m.reconnect_attempts(), 2);
    }

    #[test]
    fn record_connect_resets_attempts() {
        let now = Instant::now();
        let mut m = monitor();
        m.start(now);
        m.record_disconnect(now);
        m.poll(now + Duration::from_secs(20));
        assert!(m.reconnect_attempts() > 0);

        m.record_connect();
        assert_eq!(m.reconnect_attempts(), 0);
        assert!(!m.disconnected_recently(now));
    }
}
