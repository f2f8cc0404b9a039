//! Offline reconstruction of the last known local state.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use keel_core::{utc_day_start, ManagedOrder, Price, Quantity, Symbol, TradingMode};
use keel_execution::{FillRepository, OrderRepository};
use keel_portfolio::{BalanceSnapshotStore, FifoMatcher};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// What the database says the agent owned when it last ran.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct LocalState {
    pub mode: TradingMode,
    pub open_orders: Vec<ManagedOrder>,
    pub holdings: BTreeMap<Symbol, Quantity>,
    /// Quote-currency cash from the latest snapshot, if one was ever written.
    pub cash: Option<Price>,
    pub cash_recorded_at: Option<DateTime<Utc>>,
    /// Where the holdings came from: `"snapshot"` or `"fills"`.
    pub holdings_source: String,
    pub daily_notional_used: Price,
    pub rebuilt_at: DateTime<Utc>,
}

impl LocalState {
    /// Symbols with a quantity above `tolerance`.
    pub fn position_count(&self, tolerance: Quantity) -> usize {
        self.holdings.values().filter(|qty| **qty > tolerance).count()
    }
}

/// Reads orders, fills and balance snapshots. Never touches the network.
pub struct StateRebuilder {
    mode: TradingMode,
    orders: Arc<dyn OrderRepository>,
    fills: Arc<dyn FillRepository>,
    balances: Arc<dyn BalanceSnapshotStore>,
}

impl StateRebuilder {
    pub fn new(
        mode: TradingMode,
        orders: Arc<dyn OrderRepository>,
        fills: Arc<dyn FillRepository>,
        balances: Arc<dyn BalanceSnapshotStore>,
    ) -> Self {
        Self {
            mode,
            orders,
            fills,
            balances,
        }
    }

    pub fn rebuild(&self) -> Result<LocalState> {
        self.rebuild_at(Utc::now())
    }

    pub fn rebuild_at(&self, now: DateTime<Utc>) -> Result<LocalState> {
        let open_orders = self
            .orders
            .open_orders(self.mode)
            .context("failed to load open orders")?;
        let cash = self
            .balances
            .latest_cash_snapshot(self.mode)
            .context("failed to load cash snapshot")?;
        let (holdings, holdings_source) = match self
            .balances
            .latest_holdings_snapshot(self.mode)
            .context("failed to load holdings snapshot")?
        {
            Some(snapshot) => (snapshot.holdings, "snapshot"),
            None => (self.holdings_from_fills()?, "fills"),
        };
        let daily_notional_used = self
            .orders
            .notional_submitted_since(self.mode, utc_day_start(now))
            .context("failed to sum today's notional")?;
        let state = LocalState {
            mode: self.mode,
            open_orders,
            holdings,
            cash: cash.as_ref().map(|snapshot| snapshot.balance),
            cash_recorded_at: cash.map(|snapshot| snapshot.recorded_at),
            holdings_source: holdings_source.to_string(),
            daily_notional_used,
            rebuilt_at: now,
        };
        info!(
            mode = self.mode.as_str(),
            open_orders = state.open_orders.len(),
            holdings = state.holdings.len(),
            source = holdings_source,
            cash = ?state.cash,
            daily_notional = %state.daily_notional_used,
            "local state rebuilt"
        );
        Ok(state)
    }

    fn holdings_from_fills(&self) -> Result<BTreeMap<Symbol, Quantity>> {
        let fills = self
            .fills
            .fills(self.mode)
            .context("failed to load fills")?;
        debug!(count = fills.len(), "no holdings snapshot; replaying fills");
        let matcher = FifoMatcher::from_fills(&fills);
        Ok(matcher
            .symbols()
            .into_iter()
            .map(|symbol| {
                let qty = matcher.open_quantity(&symbol);
                (symbol, qty)
            })
            .filter(|(_, qty)| *qty > Decimal::ZERO)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use keel_core::{Fill, Side};
    use keel_execution::SqliteExecutionStore;
    use keel_portfolio::{CashSnapshot, HoldingsSnapshot, SqlitePortfolioStore};
    use rust_decimal_macros::dec;

    fn fill(id: &str, side: Side, qty: Quantity, at: DateTime<Utc>) -> Fill {
        Fill {
            fill_id: id.into(),
            order_id: format!("O-{id}"),
            symbol: "XBTUSD".into(),
            side,
            quantity: qty,
            price: dec!(100),
            fee: dec!(0.1),
            fee_currency: "USD".into(),
            executed_at: at,
            mode: TradingMode::Paper,
        }
    }

    fn rebuilder() -> Result<(StateRebuilder, Arc<SqliteExecutionStore>, Arc<SqlitePortfolioStore>)> {
        let exec = Arc::new(SqliteExecutionStore::new_in_memory()?);
        let portfolio = Arc::new(SqlitePortfolioStore::new_in_memory()?);
        let rebuilder = StateRebuilder::new(
            TradingMode::Paper,
            exec.clone(),
            exec.clone(),
            portfolio.clone(),
        );
        Ok((rebuilder, exec, portfolio))
    }

    #[test]
    fn falls_back_to_fills_without_a_holdings_snapshot() -> Result<()> {
        let (rebuilder, exec, _) = rebuilder()?;
        let t0 = Utc::now() - Duration::minutes(5);
        exec.insert_fill(&fill("a", Side::Buy, dec!(2), t0))?;
        exec.insert_fill(&fill("b", Side::Sell, dec!(0.5), t0 + Duration::minutes(1)))?;
        let state = rebuilder.rebuild()?;
        assert_eq!(state.holdings_source, "fills");
        assert_eq!(state.holdings.get("XBTUSD"), Some(&dec!(1.5)));
        assert_eq!(state.cash, None);
        assert!(state.open_orders.is_empty());
        Ok(())
    }

    #[test]
    fn snapshots_win_over_fills() -> Result<()> {
        let (rebuilder, exec, portfolio) = rebuilder()?;
        let now = Utc::now();
        exec.insert_fill(&fill("a", Side::Buy, dec!(2), now))?;
        portfolio.record_cash_snapshot(&CashSnapshot {
            mode: TradingMode::Paper,
            currency: "USD".into(),
            balance: dec!(812.5),
            recorded_at: now,
        })?;
        portfolio.record_holdings_snapshot(&HoldingsSnapshot {
            mode: TradingMode::Paper,
            holdings: BTreeMap::from([("SOLUSD".to_string(), dec!(3))]),
            recorded_at: now,
        })?;
        let state = rebuilder.rebuild()?;
        assert_eq!(state.holdings_source, "snapshot");
        assert_eq!(state.cash, Some(dec!(812.5)));
        assert_eq!(state.holdings.len(), 1);
        assert_eq!(state.position_count(dec!(0.0000001)), 1);
        Ok(())
    }
}
