//! SQLite backend: connection pool, migrations, and repositories.

pub mod connection;
pub mod migrations;
pub mod repositories;

/// Timestamp format used in every `TEXT` time column.
///
/// Fixed-width UTC with microseconds, so lexical order equals time order
/// and `MAX()`/`>` comparisons in SQL are correct.
pub(crate) fn format_ts(ts: chrono::DateTime<chrono::Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> rusqlite::Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&chrono::Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}
