//! Persistence traits and in-memory implementations.
//!
//! The SQLite implementations live in `tether-store`. The in-memory ones
//! back tests and short-lived local runs.

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::errors::PersistenceError;
use crate::events::StatusProjection;
use crate::ids::Identity;

// ─────────────────────────────────────────────────────────────────────────────
// Credentials
// ─────────────────────────────────────────────────────────────────────────────

/// Opaque authentication material. Never interpreted, never logged.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialBlob(Vec<u8>);

impl CredentialBlob {
    /// Wrap raw bytes.
    #[must_use]
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the blob is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for CredentialBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CredentialBlob(<{} bytes>)", self.0.len())
    }
}

/// Persisted credentials for one identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CredentialRecord {
    /// Owning identity.
    pub identity: Identity,
    /// Opaque material.
    pub blob: CredentialBlob,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
}

/// Durable per-identity credential storage.
pub trait CredentialStore: Send + Sync {
    /// Load the record for `identity`.
    fn get(&self, identity: &Identity) -> Result<Option<CredentialRecord>, PersistenceError>;

    /// Insert or replace the record for `identity`.
    fn put(
        &self,
        identity: &Identity,
        blob: &CredentialBlob,
    ) -> Result<CredentialRecord, PersistenceError>;

    /// Delete the record. Returns whether one existed.
    fn delete(&self, identity: &Identity) -> Result<bool, PersistenceError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Projections
// ─────────────────────────────────────────────────────────────────────────────

/// Durable status projection storage.
pub trait ProjectionStore: Send + Sync {
    /// Load the projection for `identity`.
    fn load(&self, identity: &Identity) -> Result<Option<StatusProjection>, PersistenceError>;

    /// Store `projection`. `updated_at` never regresses: the stored value is
    /// the later of the existing and the new one. Returns what was stored.
    fn save(&self, projection: &StatusProjection) -> Result<StatusProjection, PersistenceError>;

    /// Every stored projection, sorted by identity.
    fn list(&self) -> Result<Vec<StatusProjection>, PersistenceError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Grants
// ─────────────────────────────────────────────────────────────────────────────

/// Which identities an authenticated user may drive.
pub trait GrantStore: Send + Sync {
    /// Whether `user_id` may act on `identity`.
    fn is_granted(&self, user_id: &str, identity: &Identity) -> Result<bool, PersistenceError>;

    /// All identities `user_id` may act on, sorted.
    fn identities_for(&self, user_id: &str) -> Result<Vec<Identity>, PersistenceError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory implementations
// ─────────────────────────────────────────────────────────────────────────────

/// In-memory [`CredentialStore`].
#[derive(Default)]
pub struct MemoryCredentialStore {
    records: Mutex<HashMap<Identity, CredentialRecord>>,
}

impl MemoryCredentialStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, identity: &Identity) -> Result<Option<CredentialRecord>, PersistenceError> {
        Ok(self.records.lock().get(identity).cloned())
    }

    fn put(
        &self,
        identity: &Identity,
        blob: &CredentialBlob,
    ) -> Result<CredentialRecord, PersistenceError> {
        let record = CredentialRecord {
            identity: identity.clone(),
            blob: blob.clone(),
            updated_at: Utc::now(),
        };
        let _ = self
            .records
            .lock()
            .insert(identity.clone(), record.clone());
        Ok(record)
    }

    fn delete(&self, identity: &Identity) -> Result<bool, PersistenceError> {
        Ok(self.records.lock().remove(identity).is_some())
    }
}

/// In-memory [`ProjectionStore`].
#[derive(Default)]
pub struct MemoryProjectionStore {
    rows: Mutex<HashMap<Identity, StatusProjection>>,
}

impl MemoryProjectionStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProjectionStore for MemoryProjectionStore {
    fn load(&self, identity: &Identity) -> Result<Option<StatusProjection>, PersistenceError> {
        Ok(self.rows.lock().get(identity).cloned())
    }

    fn save(&self, projection: &StatusProjection) -> Result<StatusProjection, PersistenceError> {
        let mut rows = self.rows.lock();
        let mut stored = projection.clone();
        if let Some(existing) = rows.get(&projection.identity) {
            stored.updated_at = existing.updated_at.max(projection.updated_at);
        }
        let _ = rows.insert(projection.identity.clone(), stored.clone());
        Ok(stored)
    }

    fn list(&self) -> Result<Vec<StatusProjection>, PersistenceError> {
        let mut all: Vec<_> = self.rows.lock().values().cloned().collect();
        all.sort_by(|a, b| a.identity.as_str().cmp(b.identity.as_str()));
        Ok(all)
    }
}

/// In-memory [`GrantStore`].
#[derive(Default)]
pub struct MemoryGrantStore {
    grants: Mutex<HashSet<(String, Identity)>>,
}

impl MemoryGrantStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `user_id` to act on `identity`.
    pub fn grant(&self, user_id: &str, identity: &Identity) {
        let _ = self
            .grants
            .lock()
            .insert((user_id.to_owned(), identity.clone()));
    }
}

impl GrantStore for MemoryGrantStore {
    fn is_granted(&self, user_id: &str, identity: &Identity) -> Result<bool, PersistenceError> {
        Ok(self
            .grants
            .lock()
            .contains(&(user_id.to_owned(), identity.clone())))
    }

    fn identities_for(&self, user_id: &str) -> Result<Vec<Identity>, PersistenceError> {
        let mut identities: Vec<Identity> = self
            .grants
            .lock()
            .iter()
            .filter(|(user, _)| user == user_id)
            .map(|(_, identity)| identity.clone())
            .collect();
        identities.sort();
        Ok(identities)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
