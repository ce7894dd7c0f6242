//! Cable wire protocol: envelopes, identifiers, and JSON encode/decode.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Error;
use crate::types::DisconnectReason;

// ---------------------------------------------------------------------------
// Subprotocols
// ---------------------------------------------------------------------------

pub const PROTOCOL_V1_JSON: &str = "actioncable-v1-json";
pub const PROTOCOL_UNSUPPORTED: &str = "actioncable-unsupported";

/// Offered on every open, in this order, before any configured extras.
pub const PROTOCOLS: &[&str] = &[PROTOCOL_V1_JSON, PROTOCOL_UNSUPPORTED];

pub fn is_supported_protocol(protocol: Option<&str>) -> bool {
    protocol == Some(PROTOCOL_V1_JSON)
}

// ---------------------------------------------------------------------------
// Message type constants
// ---------------------------------------------------------------------------

pub mod message_type {
    pub const WELCOME: &str = "welcome";
    pub const DISCONNECT: &str = "disconnect";
    pub const PING: &str = "ping";
    pub const CONFIRMATION: &str = "confirm_subscription";
    pub const REJECTION: &str = "reject_subscription";
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Subscribe,
    Unsubscribe,
    Message,
}

/// An envelope sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundEnvelope {
    pub command: Command,
    pub identifier: String,
    /// JSON-encoded `{action, ...params}`; only present on `message`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl OutboundEnvelope {
    pub fn subscribe(identifier: &str) -> Self {
        Self {
            command: Command::Subscribe,
            identifier: identifier.to_string(),
            data: None,
        }
    }

    pub fn unsubscribe(identifier: &str) -> Self {
        Self {
            command: Command::Unsubscribe,
            identifier: identifier.to_string(),
            data: None,
        }
    }

    /// `data` is encoded to a string here, so it travels opaquely in the outer envelope.
    pub fn message(identifier: &str, data: &Map<String, Value>) -> Result<Self, Error> {
        Ok(Self {
            command: Command::Message,
            identifier: identifier.to_string(),
            data: Some(serde_json::to_string(data)?),
        })
    }
}

pub fn encode(envelope: &OutboundEnvelope) -> Result<String, Error> {
    Ok(serde_json::to_string(envelope)?)
}

/// Decode an envelope written by a client. `identifier` is required.
pub fn decode_outbound(wire: &str) -> Result<OutboundEnvelope, Error> {
    serde_json::from_str(wire).map_err(|e| Error::MalformedMessage(e.to_string()))
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// An envelope sent from server to client.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEnvelope {
    Welcome,
    Ping {
        timestamp: Option<i64>,
    },
    Disconnect {
        reason: Option<DisconnectReason>,
        reconnect: Option<bool>,
    },
    Confirmation {
        identifier: String,
    },
    Rejection {
        identifier: String,
    },
    /// No `type`: a broadcast payload for `identifier`.
    Broadcast {
        identifier: String,
        message: Value,
    },
    /// A `type` this client does not know.
    Unknown {
        kind: String,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawInbound {
    #[serde(rename = "type")]
    kind: Option<String>,
    identifier: Option<String>,
    message: Option<Value>,
    reason: Option<String>,
    reconnect: Option<bool>,
}

/// Decode a server envelope. The wire string must be a JSON object; no field
/// is strictly required. A missing identifier routes to nothing.
pub fn decode(wire: &str) -> Result<InboundEnvelope, Error> {
    let value: Value =
        serde_json::from_str(wire).map_err(|e| Error::MalformedMessage(e.to_string()))?;
    if !value.is_object() {
        return Err(Error::MalformedMessage(format!(
            "expected a JSON object, got {}",
            json_kind(&value)
        )));
    }
    let raw: RawInbound =
        serde_json::from_value(value).map_err(|e| Error::MalformedMessage(e.to_string()))?;
    let identifier = raw.identifier.unwrap_or_default();

    let envelope = match raw.kind.as_deref() {
        None => InboundEnvelope::Broadcast {
            identifier,
            message: raw.message.unwrap_or(Value::Null),
        },
        Some(message_type::WELCOME) => InboundEnvelope::Welcome,
        Some(message_type::PING) => InboundEnvelope::Ping {
            timestamp: raw.message.as_ref().and_then(Value::as_i64),
        },
        Some(message_type::DISCONNECT) => InboundEnvelope::Disconnect {
            reason: raw.reason.as_deref().map(DisconnectReason::from_wire),
            reconnect: raw.reconnect,
        },
        Some(message_type::CONFIRMATION) => InboundEnvelope::Confirmation { identifier },
        Some(message_type::REJECTION) => InboundEnvelope::Rejection { identifier },
        Some(other) => InboundEnvelope::Unknown {
            kind: other.to_string(),
        },
    };
    Ok(envelope)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Canonical identifier for a set of channel params: JSON with object keys
/// sorted at every depth, so equal param sets give byte-identical strings.
pub fn identifier_for(params: &Map<String, Value>) -> String {
    let canonical = canonicalize(&Value::Object(params.clone()));
    canonical.to_string()
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Normalise `create` input: a bare string names the channel, an object must
/// carry a `channel` key.
pub fn channel_params(input: Value) -> Result<Map<String, Value>, Error> {
    match input {
        Value::String(channel) => {
            let mut params = Map::new();
            params.insert("channel".to_string(), Value::String(channel));
            Ok(params)
        }
        Value::Object(params) => {
            match params.get("channel") {
                None | Some(Value::Null) => Err(Error::InvalidParams(
                    "params object has no \"channel\" key".to_string(),
                )),
                Some(_) => Ok(params),
            }
        }
        other => Err(Error::InvalidParams(format!(
            "expected a channel name or params object, got {}",
            json_kind(&other)
        ))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
