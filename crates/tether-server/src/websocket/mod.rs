//! `WebSocket` status stream.
//!
//! A client opens `/v1/session/ws` for one identity, receives a
//! `status.snapshot` frame, then every published update as
//! `{kind, payload, timestamp}`. The same socket accepts RPC frames for
//! `session.start`, `session.stop`, and `session.status`.

pub mod connection;
pub mod frames;
pub mod rpc;
pub mod session;

pub use connection::{ClientConnection, ConnectionTracker};
pub use session::run_ws_session;
