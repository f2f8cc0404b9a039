//! Boot audit trail and the agent-state key/value store.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use keel_core::TradingMode;
use keel_portfolio::sqlite::{open_connection, open_in_memory, ts_to_sql};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::reconciler::BootAuditRecord;

/// Agent-state key under which the circuit breaker snapshot lives.
pub const BREAKER_STATE_KEY: &str = "circuit_breaker";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS boot_audit (
    run_id TEXT PRIMARY KEY,
    mode TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT NOT NULL,
    decision TEXT NOT NULL,
    record TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_boot_audit_mode_time ON boot_audit(mode, started_at);

CREATE TABLE IF NOT EXISTS agent_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// Append-only record of boot reconciliations.
pub trait BootAuditStore: Send + Sync {
    /// Fails if a record with the same run id already exists.
    fn append_audit(&self, record: &BootAuditRecord) -> Result<()>;
    fn latest_audit(&self, mode: TradingMode) -> Result<Option<BootAuditRecord>>;
    /// Newest first.
    fn recent_audits(&self, limit: usize) -> Result<Vec<BootAuditRecord>>;
}

/// Opaque JSON blobs keyed by name, used for state that must survive restarts.
pub trait AgentStateStore: Send + Sync {
    fn put_state(&self, key: &str, value: &Value) -> Result<()>;
    fn get_state(&self, key: &str) -> Result<Option<Value>>;
    fn delete_state(&self, key: &str) -> Result<bool>;
}

pub fn save_json<T: Serialize>(store: &dyn AgentStateStore, key: &str, value: &T) -> Result<()> {
    let value = serde_json::to_value(value).with_context(|| format!("failed to encode {key}"))?;
    store.put_state(key, &value)
}

pub fn load_json<T: DeserializeOwned>(store: &dyn AgentStateStore, key: &str) -> Result<Option<T>> {
    store
        .get_state(key)?
        .map(|value| serde_json::from_value(value).with_context(|| format!("failed to decode {key}")))
        .transpose()
}

pub struct SqliteReconcileStore {
    conn: Mutex<Connection>,
}

impl SqliteReconcileStore {
    pub fn new(path: &Path) -> Result<Self> {
        let conn = open_connection(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn new_in_memory() -> Result<Self> {
        let conn = open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn decode_record(raw: String) -> Result<BootAuditRecord> {
    serde_json::from_str(&raw).context("failed to decode boot audit record")
}

impl BootAuditStore for SqliteReconcileStore {
    fn append_audit(&self, record: &BootAuditRecord) -> Result<()> {
        let payload = serde_json::to_string(record)?;
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO boot_audit (run_id, mode, started_at, finished_at, decision, record)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                record.run_id,
                record.mode.as_str(),
                ts_to_sql(record.started_at),
                ts_to_sql(record.finished_at),
                record.decision.label(),
                payload,
            ],
        )
        .with_context(|| format!("failed to append boot audit {}", record.run_id))?;
        Ok(())
    }

    fn latest_audit(&self, mode: TradingMode) -> Result<Option<BootAuditRecord>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT record FROM boot_audit WHERE mode = ?1 ORDER BY started_at DESC LIMIT 1",
                params![mode.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(decode_record).transpose()
    }

    fn recent_audits(&self, limit: usize) -> Result<Vec<BootAuditRecord>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT record FROM boot_audit ORDER BY started_at DESC LIMIT ?1")?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit], |row| row.get::<_, String>(0))?;
        rows.map(|raw| decode_record(raw?)).collect()
    }
}

impl AgentStateStore for SqliteReconcileStore {
    fn put_state(&self, key: &str, value: &Value) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO agent_state (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![key, value.to_string(), ts_to_sql(Utc::now())],
        )?;
        Ok(())
    }

    fn get_state(&self, key: &str) -> Result<Option<Value>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM agent_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|raw| serde_json::from_str(&raw).with_context(|| format!("corrupt agent state {key}")))
            .transpose()
    }

    fn delete_state(&self, key: &str) -> Result<bool> {
        let conn = self.conn.lock();
        Ok(conn.execute("DELETE FROM agent_state WHERE key = ?1", params![key])? > 0)
    }
}
