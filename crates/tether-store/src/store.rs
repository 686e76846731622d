//! Pool-owning facade over the repositories.

use tether_core::{
    CredentialBlob, CredentialRecord, CredentialStore, GrantStore, Identity, PersistenceError,
    PersistenceOperation, ProjectionStore, StatusProjection,
};
use tracing::debug;

use crate::errors::Result;
use crate::sqlite::connection::{ConnectionPool, PooledConnection};
use crate::sqlite::migrations::run_migrations;
use crate::sqlite::repositories::{CredentialRepo, GrantRepo, ProjectionRepo};

/// SQLite-backed credential, projection, and grant storage.
pub struct TetherStore {
    pool: ConnectionPool,
}

impl TetherStore {
    /// Wrap a pool and bring its schema up to date.
    pub fn open(pool: ConnectionPool) -> Result<Self> {
        let applied = run_migrations(&*pool.get()?)?;
        debug!(applied, "store schema ready");
        Ok(Self { pool })
    }

    fn conn(&self) -> Result<PooledConnection> {
        Ok(self.pool.get()?)
    }

    /// Allow `user_id` to drive `identity`.
    pub fn grant(&self, user_id: &str, identity: &Identity) -> Result<bool> {
        GrantRepo::grant(&*self.conn()?, user_id, identity)
    }

    /// Withdraw a grant.
    pub fn revoke(&self, user_id: &str, identity: &Identity) -> Result<bool> {
        GrantRepo::revoke(&*self.conn()?, user_id, identity)
    }
}

impl CredentialStore for TetherStore {
    fn get(&self, identity: &Identity) -> std::result::Result<Option<CredentialRecord>, PersistenceError> {
        self.conn()
            .and_then(|conn| CredentialRepo::get(&conn, identity))
            .map_err(|e| e.into_persistence("credentials", PersistenceOperation::Read))
    }

    fn put(
        &self,
        identity: &Identity,
        blob: &CredentialBlob,
    ) -> std::result::Result<CredentialRecord, PersistenceError> {
        self.conn()
            .and_then(|conn| CredentialRepo::upsert(&conn, identity, blob))
            .map_err(|e| e.into_persistence("credentials", PersistenceOperation::Write))
    }

    fn delete(&self, identity: &Identity) -> std::result::Result<bool, PersistenceError> {
        self.conn()
            .and_then(|conn| CredentialRepo::delete(&conn, identity))
            .map_err(|e| e.into_persistence("credentials", PersistenceOperation::Delete))
    }
}

impl ProjectionStore for TetherStore {
    fn load(&self, identity: &Identity) -> std::result::Result<Option<StatusProjection>, PersistenceError> {
        self.conn()
            .and_then(|conn| ProjectionRepo::get(&conn, identity))
            .map_err(|e| e.into_persistence("status_projection", PersistenceOperation::Read))
    }

    fn save(&self, projection: &StatusProjection) -> std::result::Result<StatusProjection, PersistenceError> {
        self.conn()
            .and_then(|conn| ProjectionRepo::save(&conn, projection))
            .map_err(|e| e.into_persistence("status_projection", PersistenceOperation::Write))
    }

    fn list(&self) -> std::result::Result<Vec<StatusProjection>, PersistenceError> {
        self.conn()
            .and_then(|conn| ProjectionRepo::list(&conn))
            .map_err(|e| e.into_persistence("status_projection", PersistenceOperation::Read))
    }
}

impl GrantStore for TetherStore {
    fn is_granted(&self, user_id: &str, identity: &Identity) -> std::result::Result<bool, PersistenceError> {
        self.conn()
            .and_then(|conn| GrantRepo::exists(&conn, user_id, identity))
            .map_err(|e| e.into_persistence("operator_grants", PersistenceOperation::Read))
    }

    fn identities_for(&self, user_id: &str) -> std::result::Result<Vec<Identity>, PersistenceError> {
        self.conn()
            .and_then(|conn| GrantRepo::identities_for(&conn, user_id))
            .map_err(|e| e.into_persistence("operator_grants", PersistenceOperation::Read))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tether_core::ConnectionState;

    use super::*;
    use crate::sqlite::connection::{ConnectionConfig, new_file, new_in_memory};

    fn store() -> TetherStore {
        TetherStore::open(new_in_memory(&ConnectionConfig::default()).unwrap()).unwrap()
    }

    #[test]
    fn credential_trait_roundtrip() {
        let store = store();
        let id = Identity::from("u1");
        let _ = CredentialStore::put(&store, &id, &CredentialBlob::new(b"creds".to_vec())).unwrap();
        assert!(CredentialStore::get(&store, &id).unwrap().is_some());
        assert!(CredentialStore::delete(&store, &id).unwrap());
        assert!(CredentialStore::get(&store, &id).unwrap().is_none());
    }

    #[test]
    fn projection_trait_roundtrip() {
        let store = store();
        let mut p = StatusProjection::initial(Identity::from("u1"));
        p.state = ConnectionState::Connected;
        p.updated_at = Some(chrono::Utc::now());
        let _ = store.save(&p).unwrap();
        assert_eq!(store.load(&p.identity).unwrap().unwrap().state, ConnectionState::Connected);
    }

    #[test]
    fn grants_through_trait() {
        let store = store();
        let id = Identity::from("op-1");
        assert!(store.grant("alice", &id).unwrap());
        assert!(store.is_granted("alice", &id).unwrap());
        assert_eq!(store.identities_for("alice").unwrap(), vec![id.clone()]);
        assert!(store.revoke("alice", &id).unwrap());
        assert!(!store.is_granted("alice", &id).unwrap());
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tether.db");
        let path = path.to_str().unwrap();
        {
            let store = TetherStore::open(new_file(path, &ConnectionConfig::default()).unwrap()).unwrap();
            let _ = CredentialStore::put(&store, &Identity::from("u1"), &CredentialBlob::new(b"k".to_vec()))
                .unwrap();
        }
        let store = TetherStore::open(new_file(path, &ConnectionConfig::default()).unwrap()).unwrap();
        let record = CredentialStore::get(&store, &Identity::from("u1")).unwrap().unwrap();
        assert_eq!(record.blob.as_bytes(), b"k");
    }

    #[test]
    fn concurrent_writers_on_file_pool() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tether.db");
        let store = Arc::new(
            TetherStore::open(new_file(path.to_str().unwrap(), &ConnectionConfig::default()).unwrap())
                .unwrap(),
        );
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let id = Identity::from(format!("u{i}"));
                    for _ in 0..10 {
                        let _ = CredentialStore::put(&*store, &id, &CredentialBlob::new(vec![i])).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        for i in 0..8u8 {
            let record = CredentialStore::get(&*store, &Identity::from(format!("u{i}"))).unwrap().unwrap();
            assert_eq!(record.blob.as_bytes(), &[i]);
        }
    }
}
