//! Persistence for orders, intents and fills.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use keel_core::{Fill, FillId, Intent, ManagedOrder, OrderPurpose, Price, Quantity, TradingMode};
use keel_portfolio::sqlite::{
    decimal_from_sql, enum_from_sql, open_connection, open_in_memory, opt_decimal_from_sql,
    ts_from_sql, ts_to_sql,
};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS orders (
    order_id TEXT PRIMARY KEY,
    client_order_id TEXT NOT NULL,
    intent_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    order_type TEXT NOT NULL,
    purpose TEXT NOT NULL,
    notional TEXT,
    quantity TEXT,
    limit_price TEXT,
    anchor_price TEXT,
    status TEXT NOT NULL,
    replace_count INTEGER NOT NULL,
    parent_order_id TEXT,
    filled_quantity TEXT NOT NULL,
    avg_fill_price TEXT,
    submitted_at TEXT NOT NULL,
    ttl_secs INTEGER NOT NULL,
    updated_at TEXT NOT NULL,
    mode TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_orders_intent ON orders(intent_id);
CREATE INDEX IF NOT EXISTS idx_orders_mode_status ON orders(mode, status);

CREATE TABLE IF NOT EXISTS intents (
    intent_id TEXT PRIMARY KEY,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    purpose TEXT NOT NULL,
    order_type TEXT NOT NULL,
    notional TEXT,
    quantity TEXT,
    limit_price TEXT,
    estimated_notional TEXT,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    completed_at TEXT,
    detail TEXT,
    mode TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_intents_mode_created ON intents(mode, created_at);

CREATE TABLE IF NOT EXISTS fills (
    fill_id TEXT NOT NULL,
    mode TEXT NOT NULL,
    order_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    quantity TEXT NOT NULL,
    price TEXT NOT NULL,
    fee TEXT NOT NULL,
    fee_currency TEXT NOT NULL,
    executed_at TEXT NOT NULL,
    PRIMARY KEY (fill_id, mode)
);
CREATE INDEX IF NOT EXISTS idx_fills_mode_time ON fills(mode, executed_at);
"#;

const ORDER_COLUMNS: &str = "order_id, client_order_id, intent_id, symbol, side, order_type, \
    purpose, notional, quantity, limit_price, anchor_price, status, replace_count, \
    parent_order_id, filled_quantity, avg_fill_price, submitted_at, ttl_secs, updated_at, mode";

const OPEN_STATUSES: &str =
    "('new', 'submitted', 'working', 'partially_filled', 'cancel_pending')";

/// Storage for managed orders and their intents.
pub trait OrderRepository: Send + Sync {
    fn upsert_order(&self, order: &ManagedOrder) -> Result<()>;
    fn order(&self, order_id: &str) -> Result<Option<ManagedOrder>>;
    /// Every order not yet in a terminal state.
    fn open_orders(&self, mode: TradingMode) -> Result<Vec<ManagedOrder>>;
    fn orders_for_intent(&self, intent_id: &str) -> Result<Vec<ManagedOrder>>;
    /// Terminal orders updated since `since` that the exchange reported as (partly) filled.
    fn settled_orders_since(&self, mode: TradingMode, since: DateTime<Utc>) -> Result<Vec<ManagedOrder>>;
    fn upsert_intent(&self, intent: &Intent) -> Result<()>;
    fn intent(&self, intent_id: &str) -> Result<Option<Intent>>;
    /// Entry notional committed by intents created since `since`, failed ones excluded.
    fn notional_submitted_since(&self, mode: TradingMode, since: DateTime<Utc>) -> Result<Price>;
}

/// Idempotent fill storage keyed by fill id.
pub trait FillRepository: Send + Sync {
    /// Returns `false` when the fill id was already stored.
    fn insert_fill(&self, fill: &Fill) -> Result<bool>;
    /// Fills of a mode in execution order.
    fn fills(&self, mode: TradingMode) -> Result<Vec<Fill>>;
    fn fill_ids(&self, mode: TradingMode) -> Result<HashSet<FillId>>;
    /// Sum of recorded fill quantity for one order.
    fn order_fill_quantity(&self, mode: TradingMode, order_id: &str) -> Result<Quantity>;
}

pub struct SqliteExecutionStore {
    conn: Mutex<Connection>,
}

impl SqliteExecutionStore {
    pub fn new(path: &Path) -> Result<Self> {
        let conn = open_connection(path)?;
        conn.execute_batch(SCHEMA)
            .context("failed to create execution tables")?;
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

    fn query_orders(&self, sql: &str, param: &str) -> Result<Vec<ManagedOrder>> {
        self.query_orders_with(sql, params![param])
    }

    fn query_orders_with(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<ManagedOrder>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, OrderRow::read)?;
        let mut orders = Vec::new();
        for row in rows {
            orders.push(row?.into_order()?);
        }
        Ok(orders)
    }
}

/// Raw text columns of an `orders` row, parsed outside the rusqlite closure.
struct OrderRow {
    order_id: String,
    client_order_id: String,
    intent_id: String,
    symbol: String,
    side: String,
    order_type: String,
    purpose: String,
    notional: Option<String>,
    quantity: Option<String>,
    limit_price: Option<String>,
    anchor_price: Option<String>,
    status: String,
    replace_count: u32,
    parent_order_id: Option<String>,
    filled_quantity: String,
    avg_fill_price: Option<String>,
    submitted_at: String,
    ttl_secs: i64,
    updated_at: String,
    mode: String,
}

impl OrderRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            order_id: row.get(0)?,
            client_order_id: row.get(1)?,
            intent_id: row.get(2)?,
            symbol: row.get(3)?,
            side: row.get(4)?,
            order_type: row.get(5)?,
            purpose: row.get(6)?,
            notional: row.get(7)?,
            quantity: row.get(8)?,
            limit_price: row.get(9)?,
            anchor_price: row.get(10)?,
            status: row.get(11)?,
            replace_count: row.get(12)?,
            parent_order_id: row.get(13)?,
            filled_quantity: row.get(14)?,
            avg_fill_price: row.get(15)?,
            submitted_at: row.get(16)?,
            ttl_secs: row.get(17)?,
            updated_at: row.get(18)?,
            mode: row.get(19)?,
        })
    }

    fn into_order(self) -> Result<ManagedOrder> {
        Ok(ManagedOrder {
            order_id: self.order_id,
            client_order_id: self.client_order_id,
            intent_id: self.intent_id,
            symbol: self.symbol,
            side: enum_from_sql(&self.side)?,
            order_type: enum_from_sql(&self.order_type)?,
            purpose: enum_from_sql(&self.purpose)?,
            notional: opt_decimal_from_sql(self.notional)?,
            quantity: opt_decimal_from_sql(self.quantity)?,
            limit_price: opt_decimal_from_sql(self.limit_price)?,
            anchor_price: opt_decimal_from_sql(self.anchor_price)?,
            status: enum_from_sql(&self.status)?,
            replace_count: self.replace_count,
            parent_order_id: self.parent_order_id,
            filled_quantity: decimal_from_sql(&self.filled_quantity)?,
            avg_fill_price: opt_decimal_from_sql(self.avg_fill_price)?,
            submitted_at: ts_from_sql(&self.submitted_at)?,
            ttl_secs: self.ttl_secs,
            updated_at: ts_from_sql(&self.updated_at)?,
            mode: enum_from_sql(&self.mode)?,
        })
    }
}

fn opt_text(value: Option<Decimal>) -> Option<String> {
    value.map(|v| v.to_string())
}

impl OrderRepository for SqliteExecutionStore {
    fn upsert_order(&self, order: &ManagedOrder) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                r#"
            INSERT INTO orders ({ORDER_COLUMNS})
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
            ON CONFLICT(order_id) DO UPDATE SET
                limit_price = excluded.limit_price,
                status = excluded.status,
                filled_quantity = excluded.filled_quantity,
                avg_fill_price = excluded.avg_fill_price,
                updated_at = excluded.updated_at
            "#
            ),
            params![
                order.order_id,
                order.client_order_id,
                order.intent_id,
                order.symbol,
                order.side.as_str(),
                order.order_type.as_str(),
                order.purpose.as_str(),
                opt_text(order.notional),
                opt_text(order.quantity),
                opt_text(order.limit_price),
                opt_text(order.anchor_price),
                order.status.as_str(),
                order.replace_count,
                order.parent_order_id,
                order.filled_quantity.to_string(),
                opt_text(order.avg_fill_price),
                ts_to_sql(order.submitted_at),
                order.ttl_secs,
                ts_to_sql(order.updated_at),
                order.mode.as_str(),
            ],
        )
        .with_context(|| format!("failed to persist order {}", order.order_id))?;
        Ok(())
    }

    fn order(&self, order_id: &str) -> Result<Option<ManagedOrder>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE order_id = ?1"),
                params![order_id],
                OrderRow::read,
            )
            .optional()?;
        row.map(OrderRow::into_order).transpose()
    }

    fn open_orders(&self, mode: TradingMode) -> Result<Vec<ManagedOrder>> {
        self.query_orders(
            &format!(
                "SELECT {ORDER_COLUMNS} FROM orders WHERE mode = ?1 AND status IN {OPEN_STATUSES} \
                 ORDER BY submitted_at"
            ),
            mode.as_str(),
        )
    }

    fn orders_for_intent(&self, intent_id: &str) -> Result<Vec<ManagedOrder>> {
        self.query_orders(
            &format!(
                "SELECT {ORDER_COLUMNS} FROM orders WHERE intent_id = ?1 \
                 ORDER BY replace_count, submitted_at"
            ),
            intent_id,
        )
    }

    fn settled_orders_since(&self, mode: TradingMode, since: DateTime<Utc>) -> Result<Vec<ManagedOrder>> {
        let orders = self.query_orders_with(
            &format!(
                "SELECT {ORDER_COLUMNS} FROM orders \
                 WHERE mode = ?1 AND status NOT IN {OPEN_STATUSES} AND updated_at >= ?2 \
                 ORDER BY updated_at"
            ),
            params![mode.as_str(), ts_to_sql(since)],
        )?;
        Ok(orders
            .into_iter()
            .filter(|order| order.filled_quantity > Decimal::ZERO)
            .collect())
    }

    fn upsert_intent(&self, intent: &Intent) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO intents (intent_id, symbol, side, purpose, order_type, notional, quantity,
                                 limit_price, estimated_notional, status, created_at,
                                 completed_at, detail, mode)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            ON CONFLICT(intent_id) DO UPDATE SET
                status = excluded.status,
                completed_at = excluded.completed_at,
                detail = excluded.detail
            "#,
            params![
                intent.intent_id,
                intent.symbol,
                intent.side.as_str(),
                intent.purpose.as_str(),
                intent.order_type.as_str(),
                opt_text(intent.notional),
                opt_text(intent.quantity),
                opt_text(intent.limit_price),
                opt_text(intent.estimated_notional),
                intent.status.as_str(),
                ts_to_sql(intent.created_at),
                intent.completed_at.map(ts_to_sql),
                intent.detail,
                intent.mode.as_str(),
            ],
        )
        .with_context(|| format!("failed to persist intent {}", intent.intent_id))?;
        Ok(())
    }

    fn intent(&self, intent_id: &str) -> Result<Option<Intent>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                r#"
                SELECT intent_id, symbol, side, purpose, order_type, notional, quantity,
                       limit_price, estimated_notional, status, created_at, completed_at,
                       detail, mode
                FROM intents WHERE intent_id = ?1
                "#,
                params![intent_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, Option<String>>(8)?,
                        row.get::<_, String>(9)?,
                        row.get::<_, String>(10)?,
                        row.get::<_, Option<String>>(11)?,
                        row.get::<_, Option<String>>(12)?,
                        row.get::<_, String>(13)?,
                    ))
                },
            )
            .optional()?;
        let Some((
            intent_id,
            symbol,
            side,
            purpose,
            order_type,
            notional,
            quantity,
            limit_price,
            estimated_notional,
            status,
            created_at,
            completed_at,
            detail,
            mode,
        )) = row
        else {
            return Ok(None);
        };
        Ok(Some(Intent {
            intent_id,
            symbol,
            side: enum_from_sql(&side)?,
            purpose: enum_from_sql(&purpose)?,
            order_type: enum_from_sql(&order_type)?,
            notional: opt_decimal_from_sql(notional)?,
            quantity: opt_decimal_from_sql(quantity)?,
            limit_price: opt_decimal_from_sql(limit_price)?,
            estimated_notional: opt_decimal_from_sql(estimated_notional)?,
            status: enum_from_sql(&status)?,
            created_at: ts_from_sql(&created_at)?,
            completed_at: completed_at.as_deref().map(ts_from_sql).transpose()?,
            detail,
            mode: enum_from_sql(&mode)?,
        }))
    }

    fn notional_submitted_since(&self, mode: TradingMode, since: DateTime<Utc>) -> Result<Price> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT estimated_notional, notional, quantity, limit_price FROM intents
            WHERE mode = ?1 AND purpose = ?2 AND created_at >= ?3 AND status != 'failed'
            "#,
        )?;
        let rows = stmt.query_map(
            params![mode.as_str(), OrderPurpose::Entry.as_str(), ts_to_sql(since)],
            |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            },
        )?;
        let mut total = Decimal::ZERO;
        for row in rows {
            let (estimated, notional, quantity, limit_price) = row?;
            let sized = opt_decimal_from_sql(quantity)?
                .zip(opt_decimal_from_sql(limit_price)?)
                .map(|(qty, price)| qty * price);
            total += opt_decimal_from_sql(estimated)?
                .or(opt_decimal_from_sql(notional)?)
                .or(sized)
                .unwrap_or_default();
        }
        Ok(total)
    }
}

impl FillRepository for SqliteExecutionStore {
    fn insert_fill(&self, fill: &Fill) -> Result<bool> {
        let conn = self.conn.lock();
        let inserted = conn
            .execute(
                r#"
            INSERT INTO fills (fill_id, mode, order_id, symbol, side, quantity, price, fee,
                               fee_currency, executed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(fill_id, mode) DO NOTHING
            "#,
                params![
                    fill.fill_id,
                    fill.mode.as_str(),
                    fill.order_id,
                    fill.symbol,
                    fill.side.as_str(),
                    fill.quantity.to_string(),
                    fill.price.to_string(),
                    fill.fee.to_string(),
                    fill.fee_currency,
                    ts_to_sql(fill.executed_at),
                ],
            )
            .with_context(|| format!("failed to persist fill {}", fill.fill_id))?;
        Ok(inserted > 0)
    }

    fn fills(&self, mode: TradingMode) -> Result<Vec<Fill>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT fill_id, order_id, symbol, side, quantity, price, fee, fee_currency, executed_at
            FROM fills WHERE mode = ?1 ORDER BY executed_at, rowid
            "#,
        )?;
        let rows = stmt.query_map(params![mode.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?;
        let mut fills = Vec::new();
        for row in rows {
            let (fill_id, order_id, symbol, side, quantity, price, fee, fee_currency, executed_at) =
                row?;
            fills.push(Fill {
                fill_id,
                order_id,
                symbol,
                side: enum_from_sql(&side)?,
                quantity: decimal_from_sql(&quantity)?,
                price: decimal_from_sql(&price)?,
                fee: decimal_from_sql(&fee)?,
                fee_currency,
                executed_at: ts_from_sql(&executed_at)?,
                mode,
            });
        }
        Ok(fills)
    }

    fn fill_ids(&self, mode: TradingMode) -> Result<HashSet<FillId>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT fill_id FROM fills WHERE mode = ?1")?;
        let ids = stmt
            .query_map(params![mode.as_str()], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<HashSet<_>>>()?;
        Ok(ids)
    }

    fn order_fill_quantity(&self, mode: TradingMode, order_id: &str) -> Result<Quantity> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT quantity FROM fills WHERE mode = ?1 AND order_id = ?2")?;
        let quantities = stmt
            .query_map(params![mode.as_str(), order_id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut total = Decimal::ZERO;
        for quantity in quantities {
            total += decimal_from_sql(&quantity)?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use keel_core::{IntentStatus, OrderStatus, OrderType, Side};
    use rust_decimal_macros::dec;

    fn order(order_id: &str, status: OrderStatus) -> ManagedOrder {
        let now = Utc::now();
        ManagedOrder {
            order_id: order_id.into(),
            client_order_id: "i-r0".into(),
            intent_id: "i".into(),
            symbol: "XBTUSD".into(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            purpose: OrderPurpose::Entry,
            notional: Some(dec!(50)),
            quantity: None,
            limit_price: Some(dec!(100.5)),
            anchor_price: Some(dec!(100.4)),
            status,
            replace_count: 0,
            parent_order_id: None,
            filled_quantity: Decimal::ZERO,
            avg_fill_price: None,
            submitted_at: now,
            ttl_secs: 60,
            updated_at: now,
            mode: TradingMode::Paper,
        }
    }

    fn intent(id: &str, notional: Option<Price>, status: IntentStatus) -> Intent {
        Intent {
            intent_id: id.into(),
            symbol: "XBTUSD".into(),
            side: Side::Buy,
            purpose: OrderPurpose::Entry,
            order_type: OrderType::Limit,
            notional,
            quantity: notional.is_none().then_some(dec!(2)),
            limit_price: Some(dec!(10)),
            estimated_notional: None,
            status,
            created_at: Utc::now(),
            completed_at: None,
            detail: None,
            mode: TradingMode::Paper,
        }
    }

    fn fill(id: &str) -> Fill {
        Fill {
            fill_id: id.into(),
            order_id: "O-1".into(),
            symbol: "XBTUSD".into(),
            side: Side::Buy,
            quantity: dec!(0.5),
            price: dec!(100),
            fee: dec!(0.1),
            fee_currency: "USD".into(),
            executed_at: Utc::now(),
            mode: TradingMode::Paper,
        }
    }

    #[test]
    fn orders_round_trip_and_filter_open() -> Result<()> {
        let store = SqliteExecutionStore::new_in_memory()?;
        store.upsert_order(&order("O-1", OrderStatus::Working))?;
        store.upsert_order(&order("O-2", OrderStatus::Filled))?;
        let open = store.open_orders(TradingMode::Paper)?;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].limit_price, Some(dec!(100.5)));
        assert!(store.open_orders(TradingMode::Live)?.is_empty());

        let mut updated = order("O-1", OrderStatus::Cancelled);
        updated.filled_quantity = dec!(0.1);
        store.upsert_order(&updated)?;
        let stored = store.order("O-1")?.unwrap();
        assert_eq!(stored.status, OrderStatus::Cancelled);
        assert_eq!(stored.filled_quantity, dec!(0.1));
        assert_eq!(store.orders_for_intent("i")?.len(), 2);
        Ok(())
    }

    #[test]
    fn daily_notional_skips_failed_intents() -> Result<()> {
        let store = SqliteExecutionStore::new_in_memory()?;
        store.upsert_intent(&intent("a", Some(dec!(40)), IntentStatus::Filled))?;
        store.upsert_intent(&intent("b", None, IntentStatus::Active))?;
        store.upsert_intent(&intent("c", Some(dec!(500)), IntentStatus::Failed))?;
        let since = Utc::now() - Duration::hours(1);
        assert_eq!(store.notional_submitted_since(TradingMode::Paper, since)?, dec!(60));
        let loaded = store.intent("b")?.unwrap();
        assert_eq!(loaded.quantity, Some(dec!(2)));
        assert_eq!(loaded.status, IntentStatus::Active);
        Ok(())
    }

    #[test]
    fn daily_notional_counts_quote_estimates_of_market_intents() -> Result<()> {
        let store = SqliteExecutionStore::new_in_memory()?;
        let mut market = intent("m", None, IntentStatus::Active);
        market.order_type = OrderType::Market;
        market.limit_price = None;
        market.estimated_notional = Some(dec!(100.1));
        store.upsert_intent(&market)?;
        let since = Utc::now() - Duration::hours(1);
        assert_eq!(store.notional_submitted_since(TradingMode::Paper, since)?, dec!(100.1));
        assert_eq!(store.intent("m")?.unwrap().estimated_notional, Some(dec!(100.1)));
        Ok(())
    }

    #[test]
    fn settled_orders_with_fills_are_listed_for_the_sweep() -> Result<()> {
        let store = SqliteExecutionStore::new_in_memory()?;
        let mut filled = order("O-1", OrderStatus::Filled);
        filled.filled_quantity = dec!(0.5);
        store.upsert_order(&filled)?;
        store.upsert_order(&order("O-2", OrderStatus::Cancelled))?;
        store.upsert_order(&order("O-3", OrderStatus::Working))?;
        let since = Utc::now() - Duration::hours(1);
        let settled = store.settled_orders_since(TradingMode::Paper, since)?;
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].order_id, "O-1");
        assert!(store
            .settled_orders_since(TradingMode::Paper, Utc::now() + Duration::hours(1))?
            .is_empty());

        store.insert_fill(&fill("T-1"))?;
        assert_eq!(store.order_fill_quantity(TradingMode::Paper, "O-1")?, dec!(0.5));
        assert_eq!(store.order_fill_quantity(TradingMode::Paper, "O-9")?, Decimal::ZERO);
        Ok(())
    }

    #[test]
    fn fills_are_unique_per_mode() -> Result<()> {
        let store = SqliteExecutionStore::new_in_memory()?;
        assert!(store.insert_fill(&fill("T-1"))?);
        assert!(!store.insert_fill(&fill("T-1"))?);
        let mut live = fill("T-1");
        live.mode = TradingMode::Live;
        assert!(store.insert_fill(&live)?);
        assert!(store.insert_fill(&fill("T-2"))?);
        let fills = store.fills(TradingMode::Paper)?;
        assert_eq!(fills.len(), 2);
        assert_eq!(fills[0].fill_id, "T-1");
        assert_eq!(store.fill_ids(TradingMode::Live)?.len(), 1);
        Ok(())
    }
}
