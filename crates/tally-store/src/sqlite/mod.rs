//! `SQLite` backend: connection pool, migrations and the polling store.

pub mod connection;
pub mod migrations;
pub mod store;

pub use connection::{ConnectionConfig, ConnectionPool};
pub use store::{DEFAULT_POLL_INTERVAL, SqliteStore};
