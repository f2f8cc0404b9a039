//! SQLite persistence for the portfolio ledgers and balance snapshots.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use keel_core::{Price, Quantity, Symbol, TradingMode};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cash::{CashEvent, CashStore};
use crate::fees::{FeeRecord, FeeStore};
use crate::pnl::{DailyPnlSnapshot, PnlStore};
use crate::sqlite::{
    decimal_from_sql, enum_from_sql, open_connection, open_in_memory, ts_from_sql, ts_to_sql,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS fee_ledger (
    fill_id TEXT NOT NULL,
    mode TEXT NOT NULL,
    order_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    amount TEXT NOT NULL,
    currency TEXT NOT NULL,
    fee_type TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    PRIMARY KEY (fill_id, mode)
);
CREATE INDEX IF NOT EXISTS idx_fee_ledger_mode_time ON fee_ledger(mode, recorded_at);

CREATE TABLE IF NOT EXISTS cash_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    amount TEXT NOT NULL,
    currency TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    external_ref TEXT,
    mode TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_cash_events_ref ON cash_events(mode, external_ref);

CREATE TABLE IF NOT EXISTS cash_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    mode TEXT NOT NULL,
    currency TEXT NOT NULL,
    balance TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cash_snapshots_mode_time ON cash_snapshots(mode, recorded_at);

CREATE TABLE IF NOT EXISTS holdings_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    mode TEXT NOT NULL,
    holdings TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_holdings_snapshots_mode_time ON holdings_snapshots(mode, recorded_at);

CREATE TABLE IF NOT EXISTS daily_pnl (
    date TEXT NOT NULL,
    instance_id TEXT NOT NULL,
    mode TEXT NOT NULL,
    equity TEXT NOT NULL,
    cash TEXT NOT NULL,
    realized_pnl TEXT NOT NULL,
    unrealized_pnl TEXT NOT NULL,
    cumulative_fees TEXT NOT NULL,
    position_count INTEGER NOT NULL,
    net_deposits TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    PRIMARY KEY (date, instance_id, mode)
);
"#;

/// Quote-currency balance observed at a point in time.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct CashSnapshot {
    pub mode: TradingMode,
    pub currency: String,
    pub balance: Price,
    pub recorded_at: DateTime<Utc>,
}

/// Quantities held per symbol at a point in time.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct HoldingsSnapshot {
    pub mode: TradingMode,
    pub holdings: BTreeMap<Symbol, Quantity>,
    pub recorded_at: DateTime<Utc>,
}

/// Timestamped cash and holdings history. Only the latest row per mode matters
/// to readers; writes older than the latest are refused.
pub trait BalanceSnapshotStore: Send + Sync {
    fn record_cash_snapshot(&self, snapshot: &CashSnapshot) -> Result<bool>;
    fn latest_cash_snapshot(&self, mode: TradingMode) -> Result<Option<CashSnapshot>>;
    fn record_holdings_snapshot(&self, snapshot: &HoldingsSnapshot) -> Result<bool>;
    fn latest_holdings_snapshot(&self, mode: TradingMode) -> Result<Option<HoldingsSnapshot>>;
}

pub struct SqlitePortfolioStore {
    conn: Mutex<Connection>,
}

impl SqlitePortfolioStore {
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

    fn latest_timestamp(&self, table: &str, mode: TradingMode) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT MAX(recorded_at) FROM {table} WHERE mode = ?1");
        let latest: Option<String> = conn.query_row(&sql, params![mode.as_str()], |row| row.get(0))?;
        latest.as_deref().map(ts_from_sql).transpose()
    }
}

impl FeeStore for SqlitePortfolioStore {
    fn insert_fee(&self, record: &FeeRecord) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            r#"
            INSERT INTO fee_ledger (fill_id, mode, order_id, symbol, amount, currency, fee_type, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(fill_id, mode) DO NOTHING
            "#,
            params![
                record.fill_id,
                record.mode.as_str(),
                record.order_id,
                record.symbol,
                record.amount.to_string(),
                record.currency,
                record.fee_type.as_str(),
                ts_to_sql(record.recorded_at),
            ],
        )?;
        Ok(changed == 1)
    }

    fn sum_fees(
        &self,
        mode: TradingMode,
        symbol: Option<&str>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Price> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT amount FROM fee_ledger
            WHERE mode = ?1
              AND (?2 IS NULL OR symbol = ?2)
              AND (?3 IS NULL OR recorded_at >= ?3)
            "#,
        )?;
        let rows = stmt.query_map(
            params![mode.as_str(), symbol, since.map(ts_to_sql)],
            |row| row.get::<_, String>(0),
        )?;
        let mut total = Decimal::ZERO;
        for row in rows {
            total += decimal_from_sql(&row?)?;
        }
        Ok(total)
    }
}

impl CashStore for SqlitePortfolioStore {
    fn append_cash_event(&self, event: &CashEvent) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            r#"
            INSERT OR IGNORE INTO cash_events
                (event_type, amount, currency, description, external_ref, mode, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                event.event_type.as_str(),
                event.amount.to_string(),
                event.currency,
                event.description,
                event.external_ref,
                event.mode.as_str(),
                ts_to_sql(event.recorded_at),
            ],
        )?;
        Ok((changed == 1).then(|| conn.last_insert_rowid()))
    }

    fn cash_events(&self, mode: TradingMode) -> Result<Vec<CashEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, event_type, amount, currency, description, external_ref, recorded_at
            FROM cash_events WHERE mode = ?1 ORDER BY id
            "#,
        )?;
        let rows = stmt.query_map(params![mode.as_str()], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;
        let mut events = Vec::new();
        for row in rows {
            let (id, kind, amount, currency, description, external_ref, recorded_at) = row?;
            events.push(CashEvent {
                id: Some(id),
                event_type: enum_from_sql(&kind)?,
                amount: decimal_from_sql(&amount)?,
                currency,
                description,
                external_ref,
                mode,
                recorded_at: ts_from_sql(&recorded_at)?,
            });
        }
        Ok(events)
    }
}

impl PnlStore for SqlitePortfolioStore {
    fn upsert_daily_pnl(&self, snapshot: &DailyPnlSnapshot) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO daily_pnl (date, instance_id, mode, equity, cash, realized_pnl,
                unrealized_pnl, cumulative_fees, position_count, net_deposits, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(date, instance_id, mode) DO UPDATE SET
                equity = excluded.equity,
                cash = excluded.cash,
                realized_pnl = excluded.realized_pnl,
                unrealized_pnl = excluded.unrealized_pnl,
                cumulative_fees = excluded.cumulative_fees,
                position_count = excluded.position_count,
                net_deposits = excluded.net_deposits,
                recorded_at = excluded.recorded_at
            "#,
            params![
                snapshot.date.to_string(),
                snapshot.instance_id,
                snapshot.mode.as_str(),
                snapshot.equity.to_string(),
                snapshot.cash.to_string(),
                snapshot.realized_pnl.to_string(),
                snapshot.unrealized_pnl.to_string(),
                snapshot.cumulative_fees.to_string(),
                snapshot.position_count,
                snapshot.net_deposits.to_string(),
                ts_to_sql(snapshot.recorded_at),
            ],
        )?;
        Ok(())
    }

    fn daily_pnl(&self, mode: TradingMode, limit: usize) -> Result<Vec<DailyPnlSnapshot>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT date, instance_id, equity, cash, realized_pnl, unrealized_pnl,
                   cumulative_fees, position_count, net_deposits, recorded_at
            FROM daily_pnl WHERE mode = ?1
            ORDER BY date DESC, instance_id LIMIT ?2
            "#,
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![mode.as_str(), limit], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                [
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(8)?,
                ],
                row.get::<_, u32>(7)?,
                row.get::<_, String>(9)?,
            ))
        })?;
        let mut snapshots = Vec::new();
        for row in rows {
            let (date, instance_id, values, position_count, recorded_at) = row?;
            let [equity, cash, realized, unrealized, fees, net_deposits] = values;
            snapshots.push(DailyPnlSnapshot {
                date: NaiveDate::parse_from_str(&date, "%Y-%m-%d")?,
                instance_id,
                mode,
                equity: decimal_from_sql(&equity)?,
                cash: decimal_from_sql(&cash)?,
                realized_pnl: decimal_from_sql(&realized)?,
                unrealized_pnl: decimal_from_sql(&unrealized)?,
                cumulative_fees: decimal_from_sql(&fees)?,
                position_count,
                net_deposits: decimal_from_sql(&net_deposits)?,
                recorded_at: ts_from_sql(&recorded_at)?,
            });
        }
        Ok(snapshots)
    }
}

impl BalanceSnapshotStore for SqlitePortfolioStore {
    fn record_cash_snapshot(&self, snapshot: &CashSnapshot) -> Result<bool> {
        if let Some(latest) = self.latest_timestamp("cash_snapshots", snapshot.mode)? {
            if snapshot.recorded_at < latest {
                warn!(mode = %snapshot.mode, %latest, at = %snapshot.recorded_at, "dropping out-of-order cash snapshot");
                return Ok(false);
            }
        }
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO cash_snapshots (mode, currency, balance, recorded_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                snapshot.mode.as_str(),
                snapshot.currency,
                snapshot.balance.to_string(),
                ts_to_sql(snapshot.recorded_at),
            ],
        )?;
        Ok(true)
    }

    fn latest_cash_snapshot(&self, mode: TradingMode) -> Result<Option<CashSnapshot>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                r#"
                SELECT currency, balance, recorded_at FROM cash_snapshots
                WHERE mode = ?1 ORDER BY recorded_at DESC, id DESC LIMIT 1
                "#,
                params![mode.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(currency, balance, recorded_at)| {
            Ok(CashSnapshot {
                mode,
                currency,
                balance: decimal_from_sql(&balance)?,
                recorded_at: ts_from_sql(&recorded_at)?,
            })
        })
        .transpose()
    }

    fn record_holdings_snapshot(&self, snapshot: &HoldingsSnapshot) -> Result<bool> {
        if let Some(latest) = self.latest_timestamp("holdings_snapshots", snapshot.mode)? {
            if snapshot.recorded_at < latest {
                warn!(mode = %snapshot.mode, %latest, at = %snapshot.recorded_at, "dropping out-of-order holdings snapshot");
                return Ok(false);
            }
        }
        let payload = serde_json::to_string(&snapshot.holdings)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO holdings_snapshots (mode, holdings, recorded_at) VALUES (?1, ?2, ?3)",
            params![
                snapshot.mode.as_str(),
                payload,
                ts_to_sql(snapshot.recorded_at)
            ],
        )?;
        Ok(true)
    }

    fn latest_holdings_snapshot(&self, mode: TradingMode) -> Result<Option<HoldingsSnapshot>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                r#"
                SELECT holdings, recorded_at FROM holdings_snapshots
                WHERE mode = ?1 ORDER BY recorded_at DESC, id DESC LIMIT 1
                "#,
                params![mode.as_str()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        row.map(|(payload, recorded_at)| {
            Ok(HoldingsSnapshot {
                mode,
                holdings: serde_json::from_str(&payload)?,
                recorded_at: ts_from_sql(&recorded_at)?,
            })
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    #[test]
    fn latest_cash_snapshot_wins_and_stale_writes_are_refused() -> Result<()> {
        let store = SqlitePortfolioStore::new_in_memory()?;
        let now = Utc::now();
        let snapshot = |balance, at| CashSnapshot {
            mode: TradingMode::Live,
            currency: "USD".into(),
            balance,
            recorded_at: at,
        };
        assert!(store.record_cash_snapshot(&snapshot(dec!(100), now))?);
        assert!(store.record_cash_snapshot(&snapshot(dec!(120), now + Duration::seconds(5)))?);
        assert!(!store.record_cash_snapshot(&snapshot(dec!(90), now - Duration::seconds(5)))?);

        let latest = store.latest_cash_snapshot(TradingMode::Live)?.unwrap();
        assert_eq!(latest.balance, dec!(120));
        assert!(store.latest_cash_snapshot(TradingMode::Paper)?.is_none());
        Ok(())
    }

    #[test]
    fn holdings_snapshot_round_trips_through_json() -> Result<()> {
        let store = SqlitePortfolioStore::new_in_memory()?;
        let mut holdings = BTreeMap::new();
        holdings.insert("BTC".to_string(), dec!(0.12345678));
        store.record_holdings_snapshot(&HoldingsSnapshot {
            mode: TradingMode::Paper,
            holdings: holdings.clone(),
            recorded_at: Utc::now(),
        })?;
        let latest = store.latest_holdings_snapshot(TradingMode::Paper)?.unwrap();
        assert_eq!(latest.holdings, holdings);
        Ok(())
    }

    #[test]
    fn stores_share_a_database_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("keel.db");
        let writer = SqlitePortfolioStore::new(&path)?;
        let reader = SqlitePortfolioStore::new(&path)?;
        writer.record_cash_snapshot(&CashSnapshot {
            mode: TradingMode::Paper,
            currency: "USD".into(),
            balance: dec!(42),
            recorded_at: Utc::now(),
        })?;
        assert_eq!(
            reader.latest_cash_snapshot(TradingMode::Paper)?.map(|s| s.balance),
            Some(dec!(42))
        );
        Ok(())
    }
}
