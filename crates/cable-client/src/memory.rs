//! In-process transport with a scriptable server end.
//!
//! Uses its own readiness vocabulary (see [`memory_state`]) so it must be
//! paired with [`MemoryConnector::ready_states`].

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use crate::Error;
use crate::protocol::{OutboundEnvelope, PROTOCOL_V1_JSON, decode_outbound};
use crate::transport::{Connector, ReadyStateMap, Transport, TransportEvent, TransportEvents};
use crate::types::ConnectionState;

pub mod memory_state {
    pub const CONNECTING: u16 = 10;
    pub const OPEN: u16 = 20;
    pub const CLOSING: u16 = 30;
    pub const CLOSED: u16 = 40;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Connector that records every transport it creates.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    sockets: Arc<Mutex<Vec<MemorySocket>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ready_states() -> ReadyStateMap {
        ReadyStateMap::new([
            (memory_state::CONNECTING, ConnectionState::Connecting),
            (memory_state::OPEN, ConnectionState::Open),
            (memory_state::CLOSING, ConnectionState::Closing),
            (memory_state::CLOSED, ConnectionState::Closed),
        ])
    }

    /// Server ends of all transports created so far, oldest first.
    pub fn sockets(&self) -> Vec<MemorySocket> {
        lock(&self.sockets).clone()
    }

    pub fn connect_count(&self) -> usize {
        lock(&self.sockets).len()
    }

    pub fn latest(&self) -> Option<MemorySocket> {
        lock(&self.sockets).last().cloned()
    }
}

impl Connector for MemoryConnector {
    fn connect(
        &self,
        url: &str,
        protocols: &[String],
        events: TransportEvents,
    ) -> Box<dyn Transport> {
        let socket = MemorySocket {
            inner: Arc::new(SocketShared {
                url: url.to_string(),
                protocols: protocols.to_vec(),
                state: AtomicU16::new(memory_state::CONNECTING),
                protocol: Mutex::new(None),
                sent: Mutex::new(Vec::new()),
                events,
            }),
        };
        lock(&self.sockets).push(socket.clone());
        Box::new(MemoryTransport { socket })
    }
}

struct SocketShared {
    url: String,
    protocols: Vec<String>,
    state: AtomicU16,
    protocol: Mutex<Option<String>>,
    sent: Mutex<Vec<String>>,
    events: TransportEvents,
}

/// Server end of one in-memory transport.
#[derive(Clone)]
pub struct MemorySocket {
    inner: Arc<SocketShared>,
}

impl MemorySocket {
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Subprotocols the client offered.
    pub fn protocols(&self) -> &[String] {
        &self.inner.protocols
    }

    pub fn state(&self) -> u16 {
        self.inner.state.load(Ordering::Acquire)
    }

    /// Complete the handshake selecting `actioncable-v1-json`.
    pub fn accept(&self) {
        self.accept_with(Some(PROTOCOL_V1_JSON));
    }

    pub fn accept_with(&self, protocol: Option<&str>) {
        *lock(&self.inner.protocol) = protocol.map(str::to_string);
        self.inner.state.store(memory_state::OPEN, Ordering::Release);
        self.inner.events.emit(TransportEvent::Open);
    }

    pub fn deliver(&self, text: impl Into<String>) -> bool {
        self.inner.events.emit(TransportEvent::Message(text.into()))
    }

    pub fn deliver_json(&self, value: &Value) -> bool {
        self.deliver(value.to_string())
    }

    /// Server-initiated close.
    pub fn close(&self) {
        let previous = self.inner.state.swap(memory_state::CLOSED, Ordering::AcqRel);
        if previous != memory_state::CLOSED {
            self.inner.events.emit(TransportEvent::Close);
        }
    }

    /// Transport failure: an `Error` event followed by `Close`.
    pub fn fail(&self, reason: &str) {
        self.inner
            .events
            .emit(TransportEvent::Error(reason.to_string()));
        self.close();
    }

    /// Raw frames written by the client.
    pub fn sent(&self) -> Vec<String> {
        lock(&self.inner.sent).clone()
    }

    /// Frames written by the client, decoded. Undecodable frames are skipped.
    pub fn sent_envelopes(&self) -> Vec<OutboundEnvelope> {
        self.sent()
            .iter()
            .filter_map(|s| decode_outbound(s).ok())
            .collect()
    }

    /// Drain the frames written so far.
    pub fn take_sent(&self) -> Vec<String> {
        std::mem::take(&mut *lock(&self.inner.sent))
    }
}

struct MemoryTransport {
    socket: MemorySocket,
}

impl Transport for MemoryTransport {
    fn send(&mut self, text: String) -> Result<(), Error> {
        if self.socket.state() != memory_state::OPEN {
            return Err(Error::NotOpen);
        }
        lock(&self.socket.inner.sent).push(text);
        Ok(())
    }

    fn close(&mut self) {
        self.socket.close();
    }

    fn ready_state(&self) -> u16 {
        self.socket.state()
    }

    fn protocol(&self) -> Option<String> {
        lock(&self.socket.inner.protocol).clone()
    }
}
