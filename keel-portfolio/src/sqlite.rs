//! Helpers shared by the SQLite-backed stores across the workspace.
//!
//! Every store opens its own connection to the same database file. WAL mode
//! plus a busy timeout lets the fill stream and the order manager write
//! concurrently without external locking.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use rust_decimal::Decimal;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open (creating if needed) a database file in WAL mode.
pub fn open_connection(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open database {}", path.display()))?;
    configure(&conn)?;
    Ok(conn)
}

/// Private in-memory database, used by tests.
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    configure(&conn)?;
    Ok(conn)
}

fn configure(conn: &Connection) -> Result<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    let _mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(())
}

/// Fixed-width RFC 3339 so text ordering matches time ordering.
pub fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn ts_from_sql(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("invalid timestamp '{value}'"))?
        .with_timezone(&Utc))
}

pub fn decimal_from_sql(value: &str) -> Result<Decimal> {
    Decimal::from_str(value).with_context(|| format!("invalid decimal '{value}'"))
}

pub fn opt_decimal_from_sql(value: Option<String>) -> Result<Option<Decimal>> {
    value.as_deref().map(decimal_from_sql).transpose()
}

/// Parse an enum column stored through its `as_str` form.
pub fn enum_from_sql<T: FromStr<Err = String>>(value: &str) -> Result<T> {
    T::from_str(value).map_err(anyhow::Error::msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamps_sort_lexicographically() {
        let early = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let late = early + chrono::Duration::milliseconds(1);
        assert!(ts_to_sql(early) < ts_to_sql(late));
        assert_eq!(ts_from_sql(&ts_to_sql(late)).unwrap(), late);
    }

    #[test]
    fn file_databases_use_wal() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let conn = open_connection(&dir.path().join("nested/keel.db"))?;
        let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        assert_eq!(mode.to_lowercase(), "wal");
        Ok(())
    }
}
