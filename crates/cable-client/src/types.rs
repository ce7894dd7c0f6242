//! Public types for the cable-client crate.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_tungstenite::tungstenite;

use crate::memory::MemoryConnector;
use crate::transport::{Connector, ReadyStateMap};
use crate::websocket::WebSocketConnector;

/// URL used when neither an explicit URL nor `ACTION_CABLE_URL` is set.
pub const DEFAULT_URL: &str = "ws://127.0.0.1:3000/cable";

/// Environment variable consulted by [`create_consumer`](crate::create_consumer).
pub const URL_ENV_VAR: &str = "ACTION_CABLE_URL";

pub(crate) const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 64;

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid subscription params: {0}")]
    InvalidParams(String),

    #[error("invalid cable URL: {0}")]
    InvalidUrl(String),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("transport is not open")]
    NotOpen,

    #[error("consumer event loop has shut down")]
    ConsumerClosed,
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(e))
    }
}

/// Connection state as seen through the injected [`ReadyStateMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Reasons a server gives in a `disconnect` envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    Unauthorized,
    InvalidRequest,
    ServerRestart,
    Remote,
    Other(String),
}

impl DisconnectReason {
    pub fn from_wire(reason: &str) -> Self {
        match reason {
            "unauthorized" => DisconnectReason::Unauthorized,
            "invalid_request" => DisconnectReason::InvalidRequest,
            "server_restart" => DisconnectReason::ServerRestart,
            "remote" => DisconnectReason::Remote,
            other => DisconnectReason::Other(other.to_string()),
        }
    }
}

/// Argument passed to `connected` callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connected {
    /// `true` for the first confirmation after a reconnect.
    pub reconnected: bool,
}

/// Argument passed to `disconnected` callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnected {
    /// Whether the connection monitor is still running and will reopen.
    pub will_attempt_reconnect: bool,
}

/// Connection-level events published by a [`Consumer`](crate::Consumer).
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The server sent `welcome`.
    Connected { reconnected: bool },
    /// The transport closed or failed.
    Disconnected { will_attempt_reconnect: bool },
    /// The server sent `ping`; `timestamp` is the server's unix time.
    Ping { timestamp: Option<i64> },
    /// The server asked the client to disconnect.
    ServerDisconnect {
        reason: Option<DisconnectReason>,
        reconnect: bool,
    },
}

/// Maps `(action, data)` to the JSON object carried in a `message` command's
/// `data` field.
pub type PerformEncoder =
    Arc<dyn Fn(Value, Map<String, Value>) -> Map<String, Value> + Send + Sync>;

/// Default [`PerformEncoder`]: stores `action` under the `"action"` key.
pub fn merge_action(action: Value, mut data: Map<String, Value>) -> Map<String, Value> {
    data.insert("action".to_string(), action);
    data
}

/// Where the consumer connects to. Dynamic sources are resolved on every open.
#[derive(Clone)]
pub enum CableUrl {
    Fixed(String),
    Dynamic(Arc<dyn Fn() -> String + Send + Sync>),
}

impl CableUrl {
    /// Resolve and normalise to a `ws://` or `wss://` URL.
    pub fn resolve(&self) -> Result<String, Error> {
        match self {
            CableUrl::Fixed(url) => websocket_url(url),
            CableUrl::Dynamic(f) => websocket_url(&f()),
        }
    }
}

impl fmt::Debug for CableUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CableUrl::Fixed(url) => f.debug_tuple("Fixed").field(url).finish(),
            CableUrl::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

impl From<&str> for CableUrl {
    fn from(url: &str) -> Self {
        CableUrl::Fixed(url.to_string())
    }
}

impl From<String> for CableUrl {
    fn from(url: String) -> Self {
        CableUrl::Fixed(url)
    }
}

/// Convert an `http(s)` URL into its `ws(s)` counterpart.
pub fn websocket_url(raw: &str) -> Result<String, Error> {
    let mut url = match url::Url::parse(raw) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            return Err(Error::InvalidUrl(format!(
                "{raw}: relative URLs need an absolute http(s) or ws(s) base"
            )));
        }
        Err(e) => return Err(e.into()),
    };
    let scheme = match url.scheme() {
        "ws" | "wss" => return Ok(url.to_string()),
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(Error::InvalidUrl(format!("unsupported scheme {other:?}")));
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| Error::InvalidUrl(format!("cannot switch {raw} to {scheme}")))?;
    Ok(url.to_string())
}

/// Timers and backoff parameters. Durations are (de)serialized as milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// A connection with no inbound traffic for this long is stale.
    #[serde(rename = "stale_threshold_ms", with = "millis")]
    pub stale_threshold: Duration,
    /// Backoff factor is `1 + reconnection_backoff_rate`.
    pub reconnection_backoff_rate: f64,
    /// Attempt count after which the poll interval stops growing.
    pub max_backoff_attempts: u32,
    #[serde(rename = "reopen_delay_ms", with = "millis")]
    pub reopen_delay: Duration,
    #[serde(rename = "guarantor_retry_interval_ms", with = "millis")]
    pub guarantor_retry_interval: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            stale_threshold: Duration::from_secs(6),
            reconnection_backoff_rate: 0.15,
            max_backoff_attempts: 10,
            reopen_delay: Duration::from_millis(500),
            guarantor_retry_interval: Duration::from_millis(500),
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Configuration for [`Consumer::new`](crate::Consumer::new).
#[derive(Clone)]
pub struct ConsumerConfig {
    /// Cable endpoint.
    pub url: CableUrl,
    /// Extra subprotocols offered after the built-in ones.
    pub subprotocols: Vec<String>,
    /// Transport factory. Defaults to [`WebSocketConnector`].
    pub connector: Arc<dyn Connector>,
    /// Raw readiness value table for `connector`'s transports.
    pub ready_states: ReadyStateMap,
    pub timing: TimingConfig,
    pub perform_encoder: PerformEncoder,
    /// Capacity of the [`ConnectionEvent`] broadcast channel.
    pub event_channel_capacity: usize,
}

impl ConsumerConfig {
    pub fn new(url: impl Into<CableUrl>) -> Self {
        Self {
            url: url.into(),
            subprotocols: Vec::new(),
            connector: Arc::new(WebSocketConnector),
            ready_states: ReadyStateMap::websocket(),
            timing: TimingConfig::default(),
            perform_encoder: Arc::new(merge_action),
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }

    /// Use an in-process transport together with its readiness table.
    pub fn with_memory(mut self, connector: MemoryConnector) -> Self {
        self.ready_states = MemoryConnector::ready_states();
        self.connector = Arc::new(connector);
        self
    }
}

impl fmt::Debug for ConsumerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerConfig")
            .field("url", &self.url)
            .field("subprotocols", &self.subprotocols)
            .field("ready_states", &self.ready_states)
            .field("timing", &self.timing)
            .field("event_channel_capacity", &self.event_channel_capacity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_url_rewrites_http_schemes() {
        assert_eq!(
            websocket_url("http://example.com/cable").unwrap(),
            "ws://example.com/cable"
        );
        assert_eq!(
            websocket_url("https://example.com/cable?token=abc").unwrap(),
            "wss://example.com/cable?token=abc"
        );
        assert_eq!(
            websocket_url("wss://example.com/cable").unwrap(),
            "wss://example.com/cable"
        );
    }

    #[test]
    fn websocket_url_rejects_relative_and_foreign() {
        assert!(matches!(
            websocket_url("/cable"),
            Err(Error::InvalidUrl(_))
        ));
        assert!(matches!(
            websocket_url("ftp://example.com/cable"),
            Err(Error::InvalidUrl(_))
        ));
    }

    #[test]
    fn dynamic_url_is_resolved_each_time() {
        let counter = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let c = counter.clone();
        let url = CableUrl::Dynamic(Arc::new(move || {
            let n = c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            format!("http://example.com/cable?n={n}")
        }));
        assert_eq!(url.resolve().unwrap(), "ws://example.com/cable?n=0");
        assert_eq!(url.resolve().unwrap(), "ws://example.com/cable?n=1");
    }

    #[test]
    fn timing_config_defaults() {
        let t = TimingConfig::default();
        assert_eq!(t.stale_threshold, Duration::from_secs(6));
        assert_eq!(t.reconnection_backoff_rate, 0.15);
        assert_eq!(t.max_backoff_attempts, 10);
        assert_eq!(t.reopen_delay, Duration::from_millis(500));
        assert_eq!(t.guarantor_retry_interval, Duration::from_millis(500));
    }

    #[test]
    fn timing_config_partial_json() {
        let t: TimingConfig =
            serde_json::from_str(r#"{"stale_threshold_ms": 3000, "max_backoff_attempts": 4}"#)
                .unwrap();
        assert_eq!(t.stale_threshold, Duration::from_secs(3));
        assert_eq!(t.max_backoff_attempts, 4);
        assert_eq!(t.reconnection_backoff_rate, 0.15);

        let json = serde_json::to_value(&t).unwrap();
        assert_eq!(json["stale_threshold_ms"], 3000);
        assert_eq!(json["reopen_delay_ms"], 500);
    }

    #[test]
    fn disconnect_reason_from_wire() {
        assert_eq!(
            DisconnectReason::from_wire("unauthorized"),
            DisconnectReason::Unauthorized
        );
        assert_eq!(
            DisconnectReason::from_wire("server_restart"),
            DisconnectReason::ServerRestart
        );
        assert_eq!(
            DisconnectReason::from_wire("maintenance"),
            DisconnectReason::Other("maintenance".to_string())
        );
    }

    #[test]
    fn merge_action_inserts_action_key() {
        let mut data = Map::new();
        data.insert("message".into(), Value::from("hi"));
        let out = merge_action(Value::from("speak"), data);
        assert_eq!(out["action"], "speak");
        assert_eq!(out["message"], "hi");
    }
}
