use std::path::Path;

use anyhow::Result;
use keel_core::{MarketSnapshot, MarketTier};
use keel_portfolio::sqlite::{
    decimal_from_sql, enum_from_sql, open_connection, open_in_memory, opt_decimal_from_sql,
    ts_from_sql, ts_to_sql,
};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::catalog::Market;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS market_snapshots (
    symbol TEXT NOT NULL,
    tier TEXT NOT NULL,
    bid TEXT,
    ask TEXT,
    last TEXT,
    volume_24h TEXT,
    observed_at TEXT NOT NULL,
    tick_count INTEGER NOT NULL,
    PRIMARY KEY (symbol, tier)
);
CREATE TABLE IF NOT EXISTS market_catalog (
    symbol TEXT PRIMARY KEY,
    base TEXT NOT NULL,
    quote TEXT NOT NULL,
    tick_size TEXT,
    lot_size TEXT,
    min_notional TEXT,
    tradable INTEGER NOT NULL
);
"#;

/// Persistence for coalesced snapshots and the market catalog.
pub trait SnapshotStore: Send + Sync {
    fn upsert_snapshots(&self, snapshots: &[MarketSnapshot]) -> Result<usize>;
    fn snapshot(&self, symbol: &str, tier: MarketTier) -> Result<Option<MarketSnapshot>>;
    fn snapshots(&self, tier: MarketTier) -> Result<Vec<MarketSnapshot>>;
    fn save_catalog(&self, markets: &[Market]) -> Result<()>;
    fn catalog(&self) -> Result<Vec<Market>>;
}

pub struct SqliteMarketStore {
    conn: Mutex<Connection>,
}

impl SqliteMarketStore {
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

struct SnapshotRow {
    symbol: String,
    tier: String,
    bid: Option<String>,
    ask: Option<String>,
    last: Option<String>,
    volume_24h: Option<String>,
    observed_at: String,
    tick_count: i64,
}

impl SnapshotRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            symbol: row.get(0)?,
            tier: row.get(1)?,
            bid: row.get(2)?,
            ask: row.get(3)?,
            last: row.get(4)?,
            volume_24h: row.get(5)?,
            observed_at: row.get(6)?,
            tick_count: row.get(7)?,
        })
    }

    fn into_snapshot(self) -> Result<MarketSnapshot> {
        Ok(MarketSnapshot {
            symbol: self.symbol,
            tier: enum_from_sql(&self.tier)?,
            bid: opt_decimal_from_sql(self.bid)?,
            ask: opt_decimal_from_sql(self.ask)?,
            last: opt_decimal_from_sql(self.last)?,
            volume_24h: opt_decimal_from_sql(self.volume_24h)?,
            observed_at: ts_from_sql(&self.observed_at)?,
            tick_count: u64::try_from(self.tick_count).unwrap_or_default(),
        })
    }
}

const SNAPSHOT_COLUMNS: &str =
    "symbol, tier, bid, ask, last, volume_24h, observed_at, tick_count";

impl SnapshotStore for SqliteMarketStore {
    fn upsert_snapshots(&self, snapshots: &[MarketSnapshot]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO market_snapshots (symbol, tier, bid, ask, last, volume_24h, observed_at, tick_count)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(symbol, tier) DO UPDATE SET
                    bid = excluded.bid,
                    ask = excluded.ask,
                    last = excluded.last,
                    volume_24h = excluded.volume_24h,
                    observed_at = excluded.observed_at,
                    tick_count = excluded.tick_count
                "#,
            )?;
            for snapshot in snapshots {
                stmt.execute(params![
                    snapshot.symbol,
                    snapshot.tier.as_str(),
                    snapshot.bid.map(|v| v.to_string()),
                    snapshot.ask.map(|v| v.to_string()),
                    snapshot.last.map(|v| v.to_string()),
                    snapshot.volume_24h.map(|v| v.to_string()),
                    ts_to_sql(snapshot.observed_at),
                    i64::try_from(snapshot.tick_count).unwrap_or(i64::MAX),
                ])?;
            }
        }
        tx.commit()?;
        Ok(snapshots.len())
    }

    fn snapshot(&self, symbol: &str, tier: MarketTier) -> Result<Option<MarketSnapshot>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM market_snapshots WHERE symbol = ?1 AND tier = ?2"
        );
        let row = conn
            .query_row(&sql, params![symbol, tier.as_str()], SnapshotRow::read)
            .optional()?;
        row.map(SnapshotRow::into_snapshot).transpose()
    }

    fn snapshots(&self, tier: MarketTier) -> Result<Vec<MarketSnapshot>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM market_snapshots WHERE tier = ?1 ORDER BY symbol"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![tier.as_str()], SnapshotRow::read)?;
        rows.map(|row| row?.into_snapshot()).collect()
    }

    fn save_catalog(&self, markets: &[Market]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO market_catalog (symbol, base, quote, tick_size, lot_size, min_notional, tradable)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(symbol) DO UPDATE SET
                    base = excluded.base,
                    quote = excluded.quote,
                    tick_size = excluded.tick_size,
                    lot_size = excluded.lot_size,
                    min_notional = excluded.min_notional,
                    tradable = excluded.tradable
                "#,
            )?;
            for market in markets {
                stmt.execute(params![
                    market.symbol,
                    market.base,
                    market.quote,
                    market.tick_size.map(|v| v.to_string()),
                    market.lot_size.map(|v| v.to_string()),
                    market.min_notional.map(|v| v.to_string()),
                    market.tradable,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn catalog(&self) -> Result<Vec<Market>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT symbol, base, quote, tick_size, lot_size, min_notional, tradable
             FROM market_catalog ORDER BY symbol",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, bool>(6)?,
            ))
        })?;
        let mut markets = Vec::new();
        for row in rows {
            let (symbol, base, quote, tick, lot, min_notional, tradable) = row?;
            markets.push(Market {
                symbol,
                base,
                quote,
                tick_size: opt_decimal_from_sql(tick)?,
                lot_size: opt_decimal_from_sql(lot)?,
                min_notional: opt_decimal_from_sql(min_notional)?,
                tradable,
            });
        }
        Ok(markets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn snapshot(symbol: &str, tier: MarketTier, bid: rust_decimal::Decimal) -> MarketSnapshot {
        MarketSnapshot {
            symbol: symbol.into(),
            tier,
            bid: Some(bid),
            ask: Some(bid + dec!(1)),
            last: None,
            volume_24h: Some(dec!(1234.5)),
            observed_at: Utc::now(),
            tick_count: 7,
        }
    }

    #[test]
    fn snapshots_upsert_per_symbol_and_tier() -> Result<()> {
        let store = SqliteMarketStore::new_in_memory()?;
        store.upsert_snapshots(&[
            snapshot("XBTUSD", MarketTier::Focus, dec!(100)),
            snapshot("SOLUSD", MarketTier::Scout, dec!(20)),
        ])?;
        store.upsert_snapshots(&[snapshot("XBTUSD", MarketTier::Focus, dec!(101))])?;
        let focus = store.snapshots(MarketTier::Focus)?;
        assert_eq!(focus.len(), 1);
        assert_eq!(focus[0].bid, Some(dec!(101)));
        assert_eq!(focus[0].volume_24h, Some(dec!(1234.5)));
        assert!(store.snapshot("XBTUSD", MarketTier::Scout)?.is_none());
        assert_eq!(
            store.snapshot("SOLUSD", MarketTier::Scout)?.map(|s| s.tick_count),
            Some(7)
        );
        Ok(())
    }

    #[test]
    fn catalog_round_trips_on_disk() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("markets.db");
        let market = Market {
            symbol: "XBTUSD".into(),
            base: "XBT".into(),
            quote: "USD".into(),
            tick_size: Some(dec!(0.1)),
            lot_size: None,
            min_notional: Some(dec!(5)),
            tradable: true,
        };
        SqliteMarketStore::new(&path)?.save_catalog(&[market.clone()])?;
        let reopened = SqliteMarketStore::new(&path)?;
        assert_eq!(reopened.catalog()?, vec![market]);
        Ok(())
    }
}
