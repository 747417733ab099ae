//! WebSocket transport: per-client state, heartbeat and the session loop.

pub mod connection;
pub mod heartbeat;
pub mod session;

pub use connection::ClientConnection;
pub use session::run_ws_session;
