use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::hex::{decode_hex, HexDisplayExt};

/// A random 128-bit identifier. Request events and channels are both keyed
/// by one, rendered as 32 lowercase hex characters on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId([u8; 16]);

/// Channels are identified the same way requests are.
pub type ChannelId = EventId;

impl EventId {
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hex())
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({})", self.0.hex())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEventIdError;

impl fmt::Display for ParseEventIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("expected 32 hex characters")
    }
}

impl std::error::Error for ParseEventIdError {}

impl FromStr for EventId {
    type Err = ParseEventIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_hex(s).map(Self).ok_or(ParseEventIdError)
    }
}

impl Serialize for EventId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EventId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// The operation a request event asks the remote peer to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    /// Handshake telling a freshly connected peer its channel ID. Never
    /// answered.
    InitConnect,
    /// Asks whether the peer can serve a resource. Answered with a JSON
    /// boolean.
    HasResource,
    /// Asks for the raw bytes of a resource. Answered with the bytes
    /// verbatim.
    GetResource,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::InitConnect => "InitConnect",
            Method::HasResource => "HasResource",
            Method::GetResource => "GetResource",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event pushed to a remote peer over its channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestEvent {
    #[serde(rename = "ID")]
    pub id: EventId,
    pub method: Method,
    pub payload: Vec<u8>,
    pub create_time: DateTime<Utc>,
}

impl RequestEvent {
    pub fn new(method: Method, payload: Vec<u8>) -> Self {
        Self {
            id: EventId::random(),
            method,
            payload,
            create_time: Utc::now(),
        }
    }
}

/// A remote peer's answer to a request event, correlated by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResponseEvent {
    #[serde(rename = "ID")]
    pub id: EventId,
    #[serde(default)]
    pub payload: Vec<u8>,
    /// Set when the peer could not serve the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseEvent {
    pub fn ok(id: EventId, payload: Vec<u8>) -> Self {
        Self {
            id,
            payload,
            error: None,
        }
    }

    pub fn err(id: EventId, error: impl Into<String>) -> Self {
        Self {
            id,
            payload: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// Argument of both resource methods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    #[serde(rename = "ResourceID")]
    pub resource_id: String,
}

/// Payload of the `InitConnect` handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedCompleted {
    #[serde(rename = "ChannelId")]
    pub channel_id: ChannelId,
}
