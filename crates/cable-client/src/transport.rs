//! Transport adapter contract.
//!
//! A [`Connector`] constructs one [`Transport`] per open attempt. Construction
//! is synchronous; the transport connects in the background and reports
//! progress through the [`TransportEvents`] sink it was given.

use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::Error;
use crate::types::ConnectionState;

/// Events a transport reports to its connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Message(String),
    Close,
    Error(String),
}

/// An event tagged with the generation of the transport that produced it.
#[derive(Debug)]
pub(crate) struct TaggedEvent {
    pub generation: u64,
    pub event: TransportEvent,
}

/// Event sink handed to a transport at construction.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    generation: u64,
    tx: mpsc::UnboundedSender<TaggedEvent>,
}

impl TransportEvents {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<TaggedEvent>) -> Self {
        Self { generation, tx }
    }

    /// Report an event. Returns `false` once the owning connection is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(TaggedEvent {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// One physical, ordered, message-oriented duplex stream.
pub trait Transport: Send {
    /// Write one text frame.
    fn send(&mut self, text: String) -> Result<(), Error>;

    /// Begin closing. A `Close` event follows.
    fn close(&mut self);

    /// Raw readiness value, interpreted through a [`ReadyStateMap`].
    fn ready_state(&self) -> u16;

    /// Subprotocol selected by the server, once open.
    fn protocol(&self) -> Option<String>;
}

/// Transport factory.
pub trait Connector: Send + Sync {
    fn connect(&self, url: &str, protocols: &[String], events: TransportEvents)
    -> Box<dyn Transport>;
}

/// Browser-compatible WebSocket readiness values.
pub mod ready_state {
    pub const CONNECTING: u16 = 0;
    pub const OPEN: u16 = 1;
    pub const CLOSING: u16 = 2;
    pub const CLOSED: u16 = 3;
}

/// Lookup table from a transport's raw readiness values to [`ConnectionState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyStateMap(HashMap<u16, ConnectionState>);

impl ReadyStateMap {
    pub fn new(entries: impl IntoIterator<Item = (u16, ConnectionState)>) -> Self {
        Self(entries.into_iter().collect())
    }

    /// The standard WebSocket table (0 connecting, 1 open, 2 closing, 3 closed).
    pub fn websocket() -> Self {
        Self::new([
            (ready_state::CONNECTING, ConnectionState::Connecting),
            (ready_state::OPEN, ConnectionState::Open),
            (ready_state::CLOSING, ConnectionState::Closing),
            (ready_state::CLOSED, ConnectionState::Closed),
        ])
    }

    pub fn lookup(&self, raw: u16) -> Option<ConnectionState> {
        self.0.get(&raw).copied()
    }
}

impl Default for ReadyStateMap {
    fn default() -> Self {
        Self::websocket()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_table() {
        let map = ReadyStateMap::websocket();
        assert_eq!(map.lookup(0), Some(ConnectionState::Connecting));
        assert_eq!(map.lookup(1), Some(ConnectionState::Open));
        assert_eq!(map.lookup(2), Some(ConnectionState::Closing));
        assert_eq!(map.lookup(3), Some(ConnectionState::Closed));
        assert_eq!(map.lookup(4), None);
    }

    #[test]
    fn custom_vocabulary() {
        let map = ReadyStateMap::new([(7, ConnectionState::Open)]);
        assert_eq!(map.lookup(7), Some(ConnectionState::Open));
        assert_eq!(map.lookup(1), None);
    }

    #[test]
    fn events_are_tagged_with_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = TransportEvents::new(3, tx);
        assert!(events.emit(TransportEvent::Open));
        let tagged = rx.try_recv().unwrap();
        assert_eq!(tagged.generation, 3);
        assert_eq!(tagged.event, TransportEvent::Open);

        drop(rx);
        assert!(!events.emit(TransportEvent::Close));
    }
}
