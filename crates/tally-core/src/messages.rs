//! Wire-format messages exchanged with WebSocket clients.
//!
//! Inbound: `{"type": "subscribe" | "unsubscribe" | "fetch-once", "ownerKey": "..."}`.
//!
//! Outbound: `{"type": ..., "ownerKey"?, "payload"?, "message"?, "timestamp"}`
//! where `timestamp` is ISO-8601 UTC with millisecond precision.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::ids::{ConnectionId, OwnerKey};

/// Message parsed from a client frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundMessage {
    /// Start receiving `data_update` pushes for an owner.
    Subscribe {
        /// Owner to watch.
        owner_key: OwnerKey,
    },
    /// Stop receiving pushes for an owner.
    Unsubscribe {
        /// Owner to stop watching.
        owner_key: OwnerKey,
    },
    /// One-shot read of the owner's current snapshot.
    FetchOnce {
        /// Owner to read.
        owner_key: OwnerKey,
    },
}

/// Why a client frame could not be turned into an [`InboundMessage`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// Not JSON, not an object, or missing/invalid fields.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
    /// Well-formed, but the `type` is not one we handle.
    #[error("unknown message type: {0}")]
    UnknownType(String),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInbound {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    owner_key: Option<String>,
}

impl InboundMessage {
    /// Parse a raw client frame.
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let parsed: RawInbound =
            serde_json::from_str(raw).map_err(|e| ParseError::InvalidFormat(e.to_string()))?;

        let build: fn(OwnerKey) -> Self = match parsed.kind.as_str() {
            "subscribe" => |owner_key| Self::Subscribe { owner_key },
            "unsubscribe" => |owner_key| Self::Unsubscribe { owner_key },
            "fetch-once" => |owner_key| Self::FetchOnce { owner_key },
            other => return Err(ParseError::UnknownType(other.to_owned())),
        };

        let raw_key = parsed
            .owner_key
            .ok_or_else(|| ParseError::InvalidFormat("missing field `ownerKey`".into()))?;
        let owner_key = OwnerKey::parse(&raw_key).ok_or_else(|| {
            ParseError::InvalidFormat("`ownerKey` must be a non-empty string".into())
        })?;
        Ok(build(owner_key))
    }

    /// Owner the message refers to.
    pub fn owner_key(&self) -> &OwnerKey {
        match self {
            Self::Subscribe { owner_key }
            | Self::Unsubscribe { owner_key }
            | Self::FetchOnce { owner_key } => owner_key,
        }
    }

    /// Wire name of the message type (used as a metrics label).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::FetchOnce { .. } => "fetch-once",
        }
    }
}

/// Outbound message type tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundKind {
    /// First message on every connection.
    ConnectionEstablished,
    /// Acknowledges a subscribe.
    Subscribed,
    /// Acknowledges an unsubscribe.
    Unsubscribed,
    /// A change pushed from an owner's change feed.
    DataUpdate,
    /// Reply to a fetch-once.
    Snapshot,
    /// Something went wrong; see `message`.
    Error,
}

/// Server-pushed message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    /// Message type.
    #[serde(rename = "type")]
    pub kind: OutboundKind,
    /// Owner the message concerns, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_key: Option<OwnerKey>,
    /// Message body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Human-readable text (errors).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// ISO-8601 timestamp.
    pub timestamp: String,
}

/// Current time as ISO-8601 UTC with millisecond precision.
pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

impl OutboundMessage {
    fn new(kind: OutboundKind) -> Self {
        Self {
            kind,
            owner_key: None,
            payload: None,
            message: None,
            timestamp: now_timestamp(),
        }
    }

    fn for_owner(kind: OutboundKind, owner_key: &OwnerKey) -> Self {
        Self {
            owner_key: Some(owner_key.clone()),
            ..Self::new(kind)
        }
    }

    /// Greeting sent on accept.
    pub fn connection_established(connection_id: &ConnectionId) -> Self {
        Self {
            payload: Some(serde_json::json!({ "connectionId": connection_id })),
            ..Self::new(OutboundKind::ConnectionEstablished)
        }
    }

    /// Subscribe acknowledgement.
    pub fn subscribed(owner_key: &OwnerKey) -> Self {
        Self::for_owner(OutboundKind::Subscribed, owner_key)
    }

    /// Unsubscribe acknowledgement.
    pub fn unsubscribed(owner_key: &OwnerKey) -> Self {
        Self::for_owner(OutboundKind::Unsubscribed, owner_key)
    }

    /// Change pushed from a watch.
    pub fn data_update(owner_key: &OwnerKey, payload: Value) -> Self {
        Self {
            payload: Some(payload),
            ..Self::for_owner(OutboundKind::DataUpdate, owner_key)
        }
    }

    /// Fetch-once reply.
    pub fn snapshot(owner_key: &OwnerKey, payload: Value) -> Self {
        Self {
            payload: Some(payload),
            ..Self::for_owner(OutboundKind::Snapshot, owner_key)
        }
    }

    /// Error not tied to an owner (e.g. a malformed frame).
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::new(OutboundKind::Error)
        }
    }

    /// Error concerning a specific owner.
    pub fn owner_error(owner_key: &OwnerKey, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::for_owner(OutboundKind::Error, owner_key)
        }
    }

    /// Serialize to a JSON string.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
