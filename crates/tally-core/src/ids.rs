//! Branded ID newtypes for type safety.
//!
//! Connections and owners are both identified by strings on the wire. Wrapping
//! them in distinct newtypes keeps the subscription index honest: it maps
//! [`OwnerKey`] to sets of [`ConnectionId`] and never the other way around by
//! accident.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Longest owner key accepted from a client.
pub const MAX_OWNER_KEY_LEN: usize = 256;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from an existing string value.
            #[must_use]
            pub fn from_string(s: String) -> Self {
                Self(s)
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Identifier of a live client connection, generated at accept time.
    ConnectionId
}

branded_id! {
    /// Identifier of the data owner whose change stream is watched
    /// (an account or tenant). Supplied by clients.
    OwnerKey
}

impl ConnectionId {
    /// Generate a fresh connection id (`conn_` + UUID v7).
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("conn_{}", Uuid::now_v7()))
    }
}

impl OwnerKey {
    /// Validate a client-supplied owner key.
    ///
    /// Surrounding whitespace is trimmed. Returns `None` for empty keys and
    /// keys longer than [`MAX_OWNER_KEY_LEN`] bytes.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.len() > MAX_OWNER_KEY_LEN {
            return None;
        }
        Some(Self(trimmed.to_owned()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
