//! Errors surfaced to clients as `error` messages.

use tally_core::{OutboundMessage, OwnerKey, ParseError};
use tally_store::StoreError;
use thiserror::Error;

/// Why a client request could not be served.
///
/// Every variant is scoped to the requesting connection; none of them is
/// fatal to the broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The frame was not a well-formed request.
    #[error("invalid message format: {0}")]
    InvalidMessage(String),

    /// The request `type` is not recognised.
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// The owner has no data in the store.
    #[error("owner not found: {0}")]
    NotFound(OwnerKey),

    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Any other store failure.
    #[error("store error: {0}")]
    Store(String),

    /// The connection was removed while the request was in flight.
    #[error("connection closed")]
    ConnectionClosed,
}

impl BrokerError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidMessage(_) => "invalid_message",
            Self::UnknownType(_) => "unknown_type",
            Self::NotFound(_) => "not_found",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::Store(_) => "store",
            Self::ConnectionClosed => "connection_closed",
        }
    }

    /// Render as a wire `error` message, tagged with `owner` when known.
    pub fn to_message(&self, owner: Option<&OwnerKey>) -> OutboundMessage {
        match owner {
            Some(owner) => OutboundMessage::owner_error(owner, self.to_string()),
            None => OutboundMessage::error(self.to_string()),
        }
    }
}

impl From<ParseError> for BrokerError {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::InvalidFormat(detail) => Self::InvalidMessage(detail),
            ParseError::UnknownType(kind) => Self::UnknownType(kind),
        }
    }
}

impl From<StoreError> for BrokerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(owner) => Self::NotFound(owner),
            e if e.is_unavailable() => Self::StoreUnavailable(e.to_string()),
            e => Self::Store(e.to_string()),
        }
    }
}
