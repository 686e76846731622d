//! # tether-session
//!
//! The connection session manager:
//!
//! - **[`transport`]**: the capability interface a worker drives, plus the
//!   scripted and HTTP-gateway implementations
//! - **[`worker`]**: one task per identity running the connection state machine
//! - **[`registry`]**: identity → live worker map, at most one worker per identity
//! - **[`publisher`]**: status projection upkeep and live fan-out
//! - **[`gateway`]**: authorized start/stop/status/subscribe entry point

#![deny(unsafe_code)]

pub mod auth;
pub mod gateway;
pub mod metrics;
pub mod pairing;
pub mod publisher;
pub mod registry;
mod retry;
pub mod transport;
pub mod worker;

pub use auth::{Authorizer, Caller, GrantAuthorizer, Resolution};
pub use gateway::{CommandGateway, GatewayConfig, GatewayError, StatusResponse, StopResponse};
pub use publisher::{StatusPublisher, StatusSink, Subscriber};
pub use registry::{SessionRegistry, WorkerDeps};
pub use retry::PersistenceRetry;
pub use transport::{
    DisconnectReason, EndReason, Transport, TransportCommand, TransportError, TransportEvent,
    TransportFactory,
};
pub use worker::{ConnectionSession, StopOutcome, WorkerHandle, WorkerPolicy};
