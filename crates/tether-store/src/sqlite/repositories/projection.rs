//! Status projection repository: the `status_projection` table.
//!
//! `save` is an upsert whose `updated_at` only ever moves forward.

use rusqlite::{Connection, OptionalExtension, params};
use tether_core::{ConnectionState, Identity, PairingPayload, StatusProjection};

use crate::errors::{Result, StoreError};
use crate::sqlite::{format_ts, parse_ts};

/// Status projection repository.
pub struct ProjectionRepo;

impl ProjectionRepo {
    /// Fetch the projection for `identity`.
    pub fn get(conn: &Connection, identity: &Identity) -> Result<Option<StatusProjection>> {
        let raw = conn
            .query_row(
                "SELECT identity, state, pairing_payload, error, updated_at
                 FROM status_projection WHERE identity = ?1",
                params![identity.as_str()],
                Self::map_row,
            )
            .optional()?;
        raw.map(RawProjection::decode).transpose()
    }

    /// Upsert `projection`, keeping the later `updated_at`, and return the
    /// stored row.
    pub fn save(conn: &Connection, projection: &StatusProjection) -> Result<StatusProjection> {
        let pairing = projection
            .pairing_payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let updated_at = projection.updated_at.map(format_ts);
        let _ = conn.execute(
            "INSERT INTO status_projection (identity, state, pairing_payload, error, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(identity) DO UPDATE SET
               state = excluded.state,
               pairing_payload = excluded.pairing_payload,
               error = excluded.error,
               updated_at = CASE
                 WHEN status_projection.updated_at IS NULL THEN excluded.updated_at
                 WHEN excluded.updated_at IS NULL THEN status_projection.updated_at
                 WHEN excluded.updated_at > status_projection.updated_at THEN excluded.updated_at
                 ELSE status_projection.updated_at
               END",
            params![
                projection.identity.as_str(),
                projection.state.as_str(),
                pairing,
                projection.error,
                updated_at
            ],
        )?;
        Self::get(conn, &projection.identity)?
            .ok_or_else(|| StoreError::InvalidData(format!("projection for {} vanished", projection.identity)))
    }

    /// Every projection, sorted by identity.
    pub fn list(conn: &Connection) -> Result<Vec<StatusProjection>> {
        let mut stmt = conn.prepare(
            "SELECT identity, state, pairing_payload, error, updated_at
             FROM status_projection ORDER BY identity",
        )?;
        let raws = stmt
            .query_map([], Self::map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        raws.into_iter().map(RawProjection::decode).collect()
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawProjection> {
        Ok(RawProjection {
            identity: row.get(0)?,
            state: row.get(1)?,
            pairing_payload: row.get(2)?,
            error: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }
}

struct RawProjection {
    identity: String,
    state: String,
    pairing_payload: Option<String>,
    error: Option<String>,
    updated_at: Option<String>,
}

impl RawProjection {
    fn decode(self) -> Result<StatusProjection> {
        let state: ConnectionState = self
            .state
            .parse()
            .map_err(|e: tether_core::state::UnknownState| StoreError::InvalidData(e.to_string()))?;
        let pairing_payload = self
            .pairing_payload
            .as_deref()
            .map(serde_json::from_str::<PairingPayload>)
            .transpose()?;
        let updated_at = self.updated_at.as_deref().map(parse_ts).transpose()?;
        Ok(StatusProjection {
            identity: Identity::from(self.identity),
            state,
            pairing_payload,
            error: self.error,
            updated_at,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::{Duration, Utc};
    use tether_core::PairingKind;

    use super::*;
    use crate::sqlite::migrations::run_migrations;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        let _ = run_migrations(&conn).unwrap();
        conn
    }

    fn projection(state: ConnectionState) -> StatusProjection {
        StatusProjection {
            state,
            ..StatusProjection::initial(Identity::from("u1"))
        }
    }

    #[test]
    fn save_and_get_with_pairing() {
        let conn = setup();
        let mut p = projection(ConnectionState::AwaitingPairing);
        p.pairing_payload = Some(PairingPayload {
            kind: PairingKind::Qr,
            value: "data:image/svg+xml;base64,AAAA".into(),
        });
        p.updated_at = Some(Utc::now());
        let stored = ProjectionRepo::save(&conn, &p).unwrap();
        assert_eq!(stored.state, ConnectionState::AwaitingPairing);
        assert_eq!(stored.pairing_payload, p.pairing_payload);
        assert_eq!(ProjectionRepo::get(&conn, &p.identity).unwrap().unwrap(), stored);
    }

    #[test]
    fn updated_at_is_monotonic() {
        let conn = setup();
        let now = Utc::now();
        let mut p = projection(ConnectionState::Connecting);
        p.updated_at = Some(now);
        let _ = ProjectionRepo::save(&conn, &p).unwrap();

        p.state = ConnectionState::Connected;
        p.updated_at = Some(now - Duration::seconds(30));
        let stored = ProjectionRepo::save(&conn, &p).unwrap();
        assert_eq!(stored.state, ConnectionState::Connected);
        assert_eq!(
            stored.updated_at.map(format_ts),
            Some(format_ts(now))
        );

        p.updated_at = Some(now + Duration::seconds(1));
        let stored = ProjectionRepo::save(&conn, &p).unwrap();
        assert!(stored.updated_at.unwrap() > now);
    }

    #[test]
    fn null_timestamp_does_not_erase_existing() {
        let conn = setup();
        let now = Utc::now();
        let mut p = projection(ConnectionState::Connected);
        p.updated_at = Some(now);
        let _ = ProjectionRepo::save(&conn, &p).unwrap();
        p.updated_at = None;
        let stored = ProjectionRepo::save(&conn, &p).unwrap();
        assert!(stored.updated_at.is_some());
    }

    #[test]
    fn list_returns_every_row() {
        let conn = setup();
        let _ = ProjectionRepo::save(&conn, &projection(ConnectionState::Connected)).unwrap();
        let other = StatusProjection {
            state: ConnectionState::Error,
            error: Some("logged out".into()),
            ..StatusProjection::initial(Identity::from("u0"))
        };
        let _ = ProjectionRepo::save(&conn, &other).unwrap();

        let all = ProjectionRepo::list(&conn).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], other);
        assert_eq!(all[1].state, ConnectionState::Connected);
    }

    #[test]
    fn unknown_state_is_invalid_data() {
        let conn = setup();
        let _ = conn
            .execute(
                "INSERT INTO status_projection (identity, state) VALUES ('u9', 'paired')",
                [],
            )
            .unwrap();
        assert_matches!(
            ProjectionRepo::get(&conn, &Identity::from("u9")),
            Err(StoreError::InvalidData(_))
        );
    }
}
