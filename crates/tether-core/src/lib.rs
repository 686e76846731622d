//! # tether-core
//!
//! Foundation types shared by every Tether crate:
//!
//! - **Branded IDs**: [`Identity`], [`SubscriberId`], [`WorkerId`] as newtypes
//! - **Connection states**: [`ConnectionState`] and its transition table
//! - **Status events**: what a connection worker emits and what subscribers receive
//! - **Errors**: [`ErrorCause`] taxonomy and [`PersistenceError`]
//! - **Backoff**: [`BackoffPolicy`] for reconnect scheduling
//! - **Stores**: persistence traits for credentials, projections, and grants

#![deny(unsafe_code)]

pub mod backoff;
pub mod errors;
pub mod events;
pub mod ids;
pub mod logging;
pub mod state;
pub mod store;

pub use backoff::BackoffPolicy;
pub use errors::{ErrorCause, PersistenceError, PersistenceOperation};
pub use events::{
    PairingKind, PairingMaterial, PairingMethod, PairingPayload, StatusEvent, StatusEventKind,
    StatusPayload, StatusProjection, StatusUpdate, UpdatePayload,
};
pub use ids::{ConnectionId, Identity, SubscriberId, WorkerId};
pub use state::{ConnectionState, StopMode};
pub use store::{
    CredentialBlob, CredentialRecord, CredentialStore, GrantStore, MemoryCredentialStore,
    MemoryGrantStore, MemoryProjectionStore, ProjectionStore,
};
