//! # tally-core
//!
//! Shared vocabulary for the Tally change-propagation broker.
//!
//! - **Branded IDs**: [`ConnectionId`] and [`OwnerKey`] newtypes so a
//!   connection id is never passed where an owner key is expected
//! - **Wire messages**: [`InboundMessage`] parsed from clients and
//!   [`OutboundMessage`] pushed back to them
//! - **Logging**: [`logging::init_subscriber`] for the `tracing` stack

#![deny(unsafe_code)]

pub mod ids;
pub mod logging;
pub mod messages;

pub use ids::{ConnectionId, OwnerKey};
pub use messages::{InboundMessage, OutboundKind, OutboundMessage, ParseError};
