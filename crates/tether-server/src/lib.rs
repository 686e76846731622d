//! # tether-server
//!
//! Axum HTTP + `WebSocket` surface over the command gateway.
//!
//! - Session endpoints: start, stop, and status under `/v1/session`
//! - `WebSocket` stream: a status snapshot, live updates, and RPC frames
//! - Gateway webhooks feeding the HTTP gateway transport
//! - `/health` and Prometheus `/metrics`
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod auth;
pub mod config;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod routes;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use auth::{Claims, JwtVerifier};
pub use config::ServerConfig;
pub use errors::ApiError;
pub use server::{AppState, TetherServer};
pub use shutdown::ShutdownCoordinator;
