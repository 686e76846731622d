//! Operator grant repository: the `operator_grants` table.

use chrono::Utc;
use rusqlite::{Connection, params};
use tether_core::Identity;
use uuid::Uuid;

use crate::errors::Result;
use crate::sqlite::format_ts;

/// Operator grant repository.
pub struct GrantRepo;

impl GrantRepo {
    /// Allow `user_id` to drive `identity`. Returns whether a new grant was
    /// created.
    pub fn grant(conn: &Connection, user_id: &str, identity: &Identity) -> Result<bool> {
        let changed = conn.execute(
            "INSERT OR IGNORE INTO operator_grants (id, user_id, identity, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                Uuid::now_v7().to_string(),
                user_id,
                identity.as_str(),
                format_ts(Utc::now())
            ],
        )?;
        Ok(changed > 0)
    }

    /// Remove a grant. Returns whether one existed.
    pub fn revoke(conn: &Connection, user_id: &str, identity: &Identity) -> Result<bool> {
        let changed = conn.execute(
            "DELETE FROM operator_grants WHERE user_id = ?1 AND identity = ?2",
            params![user_id, identity.as_str()],
        )?;
        Ok(changed > 0)
    }

    /// Whether the grant exists.
    pub fn exists(conn: &Connection, user_id: &str, identity: &Identity) -> Result<bool> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM operator_grants WHERE user_id = ?1 AND identity = ?2",
            params![user_id, identity.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Identities granted to `user_id`, sorted.
    pub fn identities_for(conn: &Connection, user_id: &str) -> Result<Vec<Identity>> {
        let mut stmt = conn.prepare(
            "SELECT identity FROM operator_grants WHERE user_id = ?1 ORDER BY identity",
        )?;
        let rows = stmt
            .query_map(params![user_id], |row| row.get::<_, String>(0))?
            .map(|r| r.map(Identity::from))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::migrations::run_migrations;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        let _ = run_migrations(&conn).unwrap();
        conn
    }

    #[test]
    fn grant_is_idempotent() {
        let conn = setup();
        let id = Identity::from("op-1");
        assert!(GrantRepo::grant(&conn, "alice", &id).unwrap());
        assert!(!GrantRepo::grant(&conn, "alice", &id).unwrap());
        assert!(GrantRepo::exists(&conn, "alice", &id).unwrap());
    }

    #[test]
    fn revoke_removes_only_that_pair() {
        let conn = setup();
        let a = Identity::from("op-a");
        let b = Identity::from("op-b");
        let _ = GrantRepo::grant(&conn, "alice", &a).unwrap();
        let _ = GrantRepo::grant(&conn, "alice", &b).unwrap();
        let _ = GrantRepo::grant(&conn, "bob", &a).unwrap();

        assert!(GrantRepo::revoke(&conn, "alice", &a).unwrap());
        assert!(!GrantRepo::revoke(&conn, "alice", &a).unwrap());
        assert_eq!(GrantRepo::identities_for(&conn, "alice").unwrap(), vec![b]);
        assert!(GrantRepo::exists(&conn, "bob", &a).unwrap());
    }

    #[test]
    fn identities_sorted() {
        let conn = setup();
        for id in ["z", "m", "a"] {
            let _ = GrantRepo::grant(&conn, "carol", &Identity::from(id)).unwrap();
        }
        let ids: Vec<String> = GrantRepo::identities_for(&conn, "carol")
            .unwrap()
            .into_iter()
            .map(Identity::into_inner)
            .collect();
        assert_eq!(ids, vec!["a", "m", "z"]);
    }
}
