//! # tether-store
//!
//! SQLite persistence for the session manager.
//!
//! - **[`sqlite::connection`]**: `r2d2` pool with WAL mode and busy timeout
//! - **[`sqlite::migrations`]**: embedded, versioned schema migrations
//! - **[`sqlite::repositories`]**: stateless repositories over `&Connection`
//! - **[`TetherStore`]**: pool-owning facade implementing the
//!   [`tether_core::store`] traits

#![deny(unsafe_code)]

pub mod errors;
pub mod sqlite;
mod store;

pub use errors::{Result, StoreError};
pub use sqlite::connection::{ConnectionConfig, ConnectionPool, new_file, new_in_memory};
pub use store::TetherStore;
