//! Credential repository: the `credentials` table.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use tether_core::{CredentialBlob, CredentialRecord, Identity};

use crate::errors::Result;
use crate::sqlite::{format_ts, parse_ts};

/// Credential repository.
pub struct CredentialRepo;

impl CredentialRepo {
    /// Fetch the record for `identity`.
    pub fn get(conn: &Connection, identity: &Identity) -> Result<Option<CredentialRecord>> {
        let row = conn
            .query_row(
                "SELECT identity, blob, updated_at FROM credentials WHERE identity = ?1",
                params![identity.as_str()],
                Self::map_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Atomic insert-or-replace.
    pub fn upsert(
        conn: &Connection,
        identity: &Identity,
        blob: &CredentialBlob,
    ) -> Result<CredentialRecord> {
        let now = Utc::now();
        let _ = conn.execute(
            "INSERT INTO credentials (identity, blob, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(identity) DO UPDATE SET blob = excluded.blob, updated_at = excluded.updated_at",
            params![identity.as_str(), blob.as_bytes(), format_ts(now)],
        )?;
        Ok(CredentialRecord {
            identity: identity.clone(),
            blob: blob.clone(),
            updated_at: now,
        })
    }

    /// Delete the record. Returns whether a row existed.
    pub fn delete(conn: &Connection, identity: &Identity) -> Result<bool> {
        let changed = conn.execute(
            "DELETE FROM credentials WHERE identity = ?1",
            params![identity.as_str()],
        )?;
        Ok(changed > 0)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CredentialRecord> {
        let identity: String = row.get(0)?;
        let blob: Vec<u8> = row.get(1)?;
        let updated_at: String = row.get(2)?;
        Ok(CredentialRecord {
            identity: Identity::from(identity),
            blob: CredentialBlob::new(blob),
            updated_at: parse_ts(&updated_at)?,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
