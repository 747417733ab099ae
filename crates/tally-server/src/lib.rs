//! # tally-server
//!
//! Real-time change propagation for billing data.
//!
//! Clients connect over WebSocket and subscribe to owner keys. The broker
//! keeps exactly one change feed open per owner that has subscribers and
//! fans every change out to all of them.
//!
//! - [`broker`]: registry, subscription index, watch lifecycle, dispatch
//!   and routing
//! - [`websocket`]: per-connection sessions and heartbeat
//! - [`server`]: Axum router with `/ws`, `/health`, `/stats` and `/metrics`
//! - [`shutdown`]: cancellation-token based graceful shutdown

#![deny(unsafe_code)]

pub mod broker;
pub mod config;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use broker::{Broker, BrokerConfig, BrokerStats};
pub use config::ServerConfig;
pub use errors::BrokerError;
pub use server::BrokerServer;
pub use shutdown::ShutdownCoordinator;
