//! Connection management: transport ownership, inbound routing, reconnection,
//! and the background event loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::Instant;

use crate::monitor::{ConnectionMonitor, PollOutcome};
use crate::protocol::{InboundEnvelope, OutboundEnvelope, PROTOCOLS, decode, encode, is_supported_protocol};
use crate::subscription::{Callbacks, Notification, Subscription, SubscriptionId};
use crate::subscriptions::{CommandSink, Subscriptions};
use crate::transport::{Connector, ReadyStateMap, TaggedEvent, Transport, TransportEvent, TransportEvents};
use crate::types::{CableUrl, ConnectionEvent, ConnectionState, ConsumerConfig, Disconnected};

// ---------------------------------------------------------------------------
// Commands from application handles
// ---------------------------------------------------------------------------

pub(crate) enum Command {
    Connect(oneshot::Sender<bool>),
    Disconnect(oneshot::Sender<()>),
    Create {
        subscription: Subscription,
        callbacks: Callbacks,
    },
    Remove(SubscriptionId),
    Send(OutboundEnvelope),
    AddSubProtocol(String),
    State(oneshot::Sender<Option<ConnectionState>>),
    Shutdown,
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Owns at most one transport at a time plus the monitor that watches it.
pub(crate) struct Connection {
    url: CableUrl,
    extra_protocols: Vec<String>,
    connector: Arc<dyn Connector>,
    ready_states: ReadyStateMap,
    reopen_delay: Duration,
    monitor: ConnectionMonitor,
    transport: Option<Box<dyn Transport>>,
    /// Bumped on every open; events tagged with an older value are stale.
    generation: u64,
    transport_tx: mpsc::UnboundedSender<TaggedEvent>,
    disconnected: bool,
    reconnect_attempted: bool,
    /// Deadline for the open half of a reopen.
    pending_open: Option<Instant>,
    /// Reopen requested while connecting; forced once this passes.
    reopen_when_settled: Option<Instant>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Connection {
    pub(crate) fn new(
        config: &ConsumerConfig,
        transport_tx: mpsc::UnboundedSender<TaggedEvent>,
        events: broadcast::Sender<ConnectionEvent>,
    ) -> Self {
        Self {
            url: config.url.clone(),
            extra_protocols: config.subprotocols.clone(),
            connector: config.connector.clone(),
            ready_states: config.ready_states.clone(),
            reopen_delay: config.timing.reopen_delay,
            monitor: ConnectionMonitor::new(&config.timing),
            transport: None,
            generation: 0,
            transport_tx,
            disconnected: true,
            reconnect_attempted: false,
            pending_open: None,
            reopen_when_settled: None,
            events,
        }
    }

    /// Subprotocols offered on the next open.
    pub(crate) fn protocols(&self) -> Vec<String> {
        PROTOCOLS
            .iter()
            .map(|p| (*p).to_string())
            .chain(self.extra_protocols.iter().cloned())
            .collect()
    }

    pub(crate) fn add_sub_protocol(&mut self, protocol: String) {
        if !self.extra_protocols.contains(&protocol) {
            self.extra_protocols.push(protocol);
        }
    }

    pub(crate) fn state(&self) -> Option<ConnectionState> {
        let transport = self.transport.as_ref()?;
        let raw = transport.ready_state();
        let state = self.ready_states.lookup(raw);
        if state.is_none() {
            tracing::warn!(raw, "Transport reported an unmapped ready state");
        }
        state
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state() == Some(ConnectionState::Open)
    }

    pub(crate) fn is_active(&self) -> bool {
        matches!(
            self.state(),
            Some(ConnectionState::Open | ConnectionState::Connecting)
        )
    }

    fn is_protocol_supported(&self) -> bool {
        let protocol = self.transport.as_ref().and_then(|t| t.protocol());
        is_supported_protocol(protocol.as_deref())
    }

    /// Construct a new transport and start the monitor. Returns `false` when
    /// a transport is already open or connecting.
    pub(crate) fn open(&mut self, now: Instant) -> bool {
        if self.is_active() {
            tracing::debug!(
                state = ?self.state(),
                "Attempted to open WebSocket, but existing socket is active"
            );
            return false;
        }
        self.pending_open = None;
        self.monitor.start(now);

        let url = match self.url.resolve() {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!("Cannot open WebSocket: {e}");
                return false;
            }
        };
        let protocols = self.protocols();
        self.generation += 1;
        tracing::info!(%url, ?protocols, generation = self.generation, "Opening WebSocket");
        let events = TransportEvents::new(self.generation, self.transport_tx.clone());
        self.transport = Some(self.connector.connect(&url, &protocols, events));
        true
    }

    /// Open unless a transport is already open or connecting.
    pub(crate) fn ensure_active(&mut self, now: Instant) {
        if !self.is_active() {
            self.open(now);
        }
    }

    /// Encode and write `envelope` if open. Returns whether a write was
    /// attempted.
    pub(crate) fn send(&mut self, envelope: &OutboundEnvelope) -> bool {
        if !self.is_open() {
            return false;
        }
        let wire = match encode(envelope) {
            Ok(wire) => wire,
            Err(e) => {
                tracing::warn!("Failed to encode envelope: {e}");
                return false;
            }
        };
        if let Some(transport) = self.transport.as_mut() {
            tracing::trace!(frame = %wire, "Sending frame");
            if let Err(e) = transport.send(wire) {
                tracing::warn!(identifier = %envelope.identifier, "Transport write failed: {e}");
            }
        }
        true
    }

    /// Close the transport. Without `allow_reconnect` the monitor stops and
    /// any scheduled reopen is cancelled.
    pub(crate) fn close(&mut self, allow_reconnect: bool, now: Instant) {
        if !allow_reconnect {
            self.monitor.stop(now);
            self.pending_open = None;
            self.reopen_when_settled = None;
        }
        if self.is_active()
            && let Some(transport) = self.transport.as_mut()
        {
            tracing::debug!(allow_reconnect, "Closing WebSocket");
            transport.close();
        }
    }

    /// Replace the transport. An open transport is closed and a new one
    /// opened after the reopen delay; a connecting one is first given until
    /// the delay to settle.
    pub(crate) fn reopen(&mut self, now: Instant) {
        let state = self.state();
        tracing::info!(?state, "Reopening WebSocket");
        match state {
            Some(ConnectionState::Connecting) => {
                if self.reopen_when_settled.is_none() {
                    self.reopen_when_settled = Some(now + self.reopen_delay);
                }
            }
            Some(ConnectionState::Open) => {
                self.close(true, now);
                self.pending_open = Some(now + self.reopen_delay);
            }
            _ => {
                self.open(now);
            }
        }
    }

    fn settle_reopen(&mut self, now: Instant) {
        if self.reopen_when_settled.take().is_some() {
            self.close(true, now);
            self.pending_open = Some(now + self.reopen_delay);
        }
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        [
            self.monitor.next_poll_at(),
            self.pending_open,
            self.reopen_when_settled,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Fire whatever timers are due at `now`.
    pub(crate) fn on_timer(&mut self, subscriptions: &mut Subscriptions, now: Instant) {
        if self.reopen_when_settled.is_some_and(|at| at <= now) {
            tracing::debug!("Transport still connecting after reopen delay");
            self.settle_reopen(now);
        }
        if self.pending_open.is_some_and(|at| at <= now) {
            self.pending_open = None;
            self.open(now);
        }
        if self.monitor.next_poll_at().is_some_and(|at| at <= now)
            && self.monitor.poll(now) == PollOutcome::Reopen
        {
            self.reopen(now);
        }
        subscriptions.retry_pending(self, now);
    }

    #[cfg(test)]
    pub(crate) fn monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }

    fn publish(&self, event: ConnectionEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    // -----------------------------------------------------------------------
    // Transport events
    // -----------------------------------------------------------------------

    pub(crate) fn handle_event(
        &mut self,
        generation: u64,
        event: TransportEvent,
        subscriptions: &mut Subscriptions,
        now: Instant,
    ) {
        if generation != self.generation {
            tracing::trace!(generation, current = self.generation, "Dropping event from replaced transport");
            return;
        }
        let settles = !matches!(event, TransportEvent::Message(_));
        match event {
            TransportEvent::Open => self.on_open(now),
            TransportEvent::Message(text) => self.on_message(&text, subscriptions, now),
            TransportEvent::Close => self.on_close(subscriptions, now),
            TransportEvent::Error(reason) => {
                tracing::warn!(%reason, "WebSocket error");
                self.on_close(subscriptions, now);
            }
        }
        if settles {
            self.settle_reopen(now);
        }
    }

    fn on_open(&mut self, now: Instant) {
        let protocol = self.transport.as_ref().and_then(|t| t.protocol());
        tracing::info!(?protocol, "WebSocket opened");
        self.disconnected = false;
        if !self.is_protocol_supported() {
            tracing::warn!(?protocol, "Protocol is unsupported. Stopping monitor and disconnecting");
            self.close(false, now);
        }
    }

    fn on_close(&mut self, subscriptions: &mut Subscriptions, now: Instant) {
        if self.disconnected {
            return;
        }
        self.disconnected = true;
        self.monitor.record_disconnect(now);
        let will_attempt_reconnect = self.monitor.is_running();
        tracing::info!(will_attempt_reconnect, "WebSocket closed");
        subscriptions.notify_all(Notification::Disconnected(Disconnected {
            will_attempt_reconnect,
        }));
        self.publish(ConnectionEvent::Disconnected {
            will_attempt_reconnect,
        });
    }

    fn on_message(&mut self, text: &str, subscriptions: &mut Subscriptions, now: Instant) {
        if !self.is_protocol_supported() {
            return;
        }
        let envelope = match decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Failed to decode message: {e}");
                return;
            }
        };
        self.monitor.record_message(now);

        match envelope {
            InboundEnvelope::Welcome => {
                if self.monitor.reconnect_attempts() > 0 {
                    self.reconnect_attempted = true;
                }
                self.monitor.record_connect();
                let reloaded = subscriptions.reload(self, now);
                tracing::info!(subscriptions = reloaded, "Received welcome");
                self.publish(ConnectionEvent::Connected {
                    reconnected: self.reconnect_attempted,
                });
            }
            InboundEnvelope::Ping { timestamp } => {
                tracing::trace!(?timestamp, "Ping received");
                self.publish(ConnectionEvent::Ping { timestamp });
            }
            InboundEnvelope::Disconnect { reason, reconnect } => {
                let reconnect = reconnect.unwrap_or(true);
                tracing::info!(?reason, reconnect, "Server requested disconnect");
                self.publish(ConnectionEvent::ServerDisconnect { reason, reconnect });
                self.close(reconnect, now);
            }
            InboundEnvelope::Confirmation { identifier } => {
                let reconnected = std::mem::take(&mut self.reconnect_attempted);
                if subscriptions.confirm(&identifier, reconnected) == 0 {
                    tracing::debug!(%identifier, "Confirmation for unknown subscription");
                }
            }
            InboundEnvelope::Rejection { identifier } => {
                let rejected = subscriptions.reject(&identifier);
                tracing::info!(%identifier, rejected, "Subscription rejected");
            }
            InboundEnvelope::Broadcast {
                identifier,
                message,
            } => {
                if subscriptions.notify(&identifier, Notification::Received(message)) == 0 {
                    tracing::debug!(%identifier, "Dropping broadcast for unknown subscription");
                }
            }
            InboundEnvelope::Unknown { kind } => {
                tracing::debug!(%kind, "Ignoring unknown message type");
            }
        }
    }
}

impl CommandSink for Connection {
    fn send_envelope(&mut self, envelope: &OutboundEnvelope) -> bool {
        self.send(envelope)
    }
}

// ---------------------------------------------------------------------------
// Background event loop
// ---------------------------------------------------------------------------

pub(crate) struct EventLoopState {
    pub connection: Connection,
    pub subscriptions: Subscriptions,
    pub commands: mpsc::UnboundedReceiver<Command>,
    pub transport_rx: mpsc::UnboundedReceiver<TaggedEvent>,
}

impl EventLoopState {
    fn next_deadline(&self) -> Option<Instant> {
        [
            self.connection.next_deadline(),
            self.subscriptions.next_retry_at(),
        ]
        .into_iter()
        .flatten()
        .min()
    }
}

enum LoopAction {
    Continue,
    Stop,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Transport events handled back to back before queued commands and due
/// timers get a turn.
const MAX_INBOUND_BURST: usize = 64;

pub(crate) async fn run_event_loop(mut p: EventLoopState) {
    let mut inbound_burst = 0;
    loop {
        let deadline = p.next_deadline();

        // Inbound traffic first, so commands observe every event delivered
        // before them.
        tokio::select! {
            biased;

            Some(tagged) = p.transport_rx.recv() => {
                p.connection.handle_event(
                    tagged.generation,
                    tagged.event,
                    &mut p.subscriptions,
                    Instant::now(),
                );
                inbound_burst += 1;
                if inbound_burst >= MAX_INBOUND_BURST {
                    inbound_burst = 0;
                    if let LoopAction::Stop = serve_backlog(&mut p) {
                        break;
                    }
                }
            }

            command = p.commands.recv() => {
                inbound_burst = 0;
                match command {
                    Some(command) => {
                        if let LoopAction::Stop = handle_command(&mut p, command) {
                            break;
                        }
                    }
                    None => break,
                }
            }

            _ = sleep_until_opt(deadline) => {
                inbound_burst = 0;
                p.connection.on_timer(&mut p.subscriptions, Instant::now());
            }
        }
    }

    tracing::info!("Consumer shut down");
    p.connection.close(false, Instant::now());
}

/// Give commands already queued, and any timer already due, a turn in the
/// middle of a long inbound stream.
fn serve_backlog(p: &mut EventLoopState) -> LoopAction {
    for _ in 0..MAX_INBOUND_BURST {
        match p.commands.try_recv() {
            Ok(command) => {
                if let LoopAction::Stop = handle_command(p, command) {
                    return LoopAction::Stop;
                }
            }
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => return LoopAction::Stop,
        }
    }
    let now = Instant::now();
    if p.next_deadline().is_some_and(|at| at <= now) {
        p.connection.on_timer(&mut p.subscriptions, now);
    }
    LoopAction::Continue
}

fn handle_command(p: &mut EventLoopState, command: Command) -> LoopAction {
    let now = Instant::now();
    match command {
        Command::Connect(reply) => {
            let opened = p.connection.open(now);
            let _ = reply.send(opened);
        }
        Command::Disconnect(reply) => {
            p.connection.close(false, now);
            let _ = reply.send(());
        }
        Command::Create {
            subscription,
            callbacks,
        } => {
            p.connection.ensure_active(now);
            p.subscriptions
                .add(subscription, callbacks, &mut p.connection, now);
        }
        Command::Remove(id) => {
            if p.subscriptions.remove(id, &mut p.connection).is_none() {
                tracing::debug!(?id, "Subscription already removed");
            }
        }
        Command::Send(envelope) => {
            if !p.connection.send(&envelope) {
                tracing::debug!(
                    identifier = %envelope.identifier,
                    "Dropping message, connection is not open"
                );
            }
        }
        Command::AddSubProtocol(protocol) => p.connection.add_sub_protocol(protocol),
        Command::State(reply) => {
            let _ = reply.send(p.connection.state());
        }
        Command::Shutdown => return LoopAction::Stop,
    }
    LoopAction::Continue
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
