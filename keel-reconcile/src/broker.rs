//! Comparison of the rebuilt local state against the live exchange.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use keel_broker::{BrokerError, Exchange};
use keel_core::{OrderId, Price, Quantity, Symbol};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::rebuild::LocalState;
use crate::ReconcileTolerances;

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct QuantityDiff {
    pub symbol: Symbol,
    pub local: Quantity,
    pub broker: Quantity,
    /// `broker - local`.
    pub diff: Quantity,
}

/// Numeric differences between local state and the exchange. Signed values are
/// `broker - local`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct BrokerDiff {
    pub currency: String,
    pub local_cash: Price,
    pub broker_cash: Price,
    pub cash_diff: Price,
    /// Symbols held on both sides whose quantities differ beyond tolerance.
    pub quantity_diffs: Vec<QuantityDiff>,
    /// Held locally, absent or zero at the broker.
    pub orphaned: Vec<Symbol>,
    /// Held at the broker, absent or zero locally.
    pub missing: Vec<Symbol>,
    /// Locally open orders the broker does not recognize.
    pub unknown_orders: Vec<OrderId>,
    pub fetched_at: DateTime<Utc>,
}

impl BrokerDiff {
    /// True when any difference at all was found, including cash drift
    /// inside the tolerance.
    pub fn has_drift(&self) -> bool {
        !self.cash_diff.is_zero()
            || !self.quantity_diffs.is_empty()
            || !self.orphaned.is_empty()
            || !self.missing.is_empty()
            || !self.unknown_orders.is_empty()
    }
}

pub struct BrokerReconciler {
    exchange: Arc<dyn Exchange>,
    tolerances: ReconcileTolerances,
    quote_currency: String,
}

impl BrokerReconciler {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        tolerances: ReconcileTolerances,
        quote_currency: impl Into<String>,
    ) -> Self {
        Self {
            exchange,
            tolerances,
            quote_currency: quote_currency.into(),
        }
    }

    /// Fetch broker cash, holdings and the status of every locally open order.
    /// Returns `None` in paper mode, where the local ledger is authoritative.
    pub async fn reconcile(&self, local: &LocalState) -> Result<Option<BrokerDiff>> {
        if local.mode.is_paper() {
            info!("paper mode; broker reconciliation skipped");
            return Ok(None);
        }
        let balances = self
            .exchange
            .account_balances()
            .await
            .context("failed to fetch broker balances")?;
        let holdings = self
            .exchange
            .holdings()
            .await
            .context("failed to fetch broker holdings")?;

        let broker_cash = balances
            .iter()
            .find(|balance| balance.currency == self.quote_currency)
            .map(|balance| balance.total)
            .unwrap_or(Decimal::ZERO);
        let local_cash = local.cash.unwrap_or(Decimal::ZERO);
        let cash_diff = broker_cash - local_cash;
        if !cash_diff.is_zero() {
            warn!(
                currency = %self.quote_currency,
                local = %local_cash,
                broker = %broker_cash,
                diff = %cash_diff,
                "cash mismatch against broker"
            );
        }

        let broker_map: BTreeMap<Symbol, Quantity> = holdings
            .into_iter()
            .map(|holding| (holding.symbol, holding.quantity))
            .collect();
        let (quantity_diffs, orphaned, missing) =
            compare_holdings(&local.holdings, &broker_map, self.tolerances.quantity);
        let unknown_orders = self.unknown_orders(local).await?;

        let diff = BrokerDiff {
            currency: self.quote_currency.clone(),
            local_cash,
            broker_cash,
            cash_diff,
            quantity_diffs,
            orphaned,
            missing,
            unknown_orders,
            fetched_at: Utc::now(),
        };
        info!(
            cash_diff = %diff.cash_diff,
            quantity_diffs = diff.quantity_diffs.len(),
            orphaned = diff.orphaned.len(),
            missing = diff.missing.len(),
            unknown_orders = diff.unknown_orders.len(),
            "broker reconciliation complete"
        );
        Ok(Some(diff))
    }

    async fn unknown_orders(&self, local: &LocalState) -> Result<Vec<OrderId>> {
        let mut unknown = Vec::new();
        for order in &local.open_orders {
            match self.exchange.get_order(&order.order_id).await {
                Ok(_) => {}
                Err(BrokerError::NotFound(_)) => {
                    warn!(order_id = %order.order_id, symbol = %order.symbol, "broker does not know local order");
                    unknown.push(order.order_id.clone());
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to look up order {}", order.order_id))
                }
            }
        }
        Ok(unknown)
    }
}

type HoldingsComparison = (Vec<QuantityDiff>, Vec<Symbol>, Vec<Symbol>);

fn compare_holdings(
    local: &BTreeMap<Symbol, Quantity>,
    broker: &BTreeMap<Symbol, Quantity>,
    tolerance: Quantity,
) -> HoldingsComparison {
    let symbols: BTreeSet<&Symbol> = local.keys().chain(broker.keys()).collect();
    let mut diffs = Vec::new();
    let mut orphaned = Vec::new();
    let mut missing = Vec::new();
    for symbol in symbols {
        let local_qty = local.get(symbol).copied().unwrap_or(Decimal::ZERO);
        let broker_qty = broker.get(symbol).copied().unwrap_or(Decimal::ZERO);
        let held_locally = local_qty.abs() > tolerance;
        let held_at_broker = broker_qty.abs() > tolerance;
        match (held_locally, held_at_broker) {
            (true, false) => {
                warn!(symbol = %symbol, local = %local_qty, "orphaned local position");
                orphaned.push(symbol.clone());
            }
            (false, true) => {
                warn!(symbol = %symbol, broker = %broker_qty, "position missing locally");
                missing.push(symbol.clone());
            }
            (true, true) if (broker_qty - local_qty).abs() > tolerance => {
                warn!(
                    symbol = %symbol,
                    local = %local_qty,
                    broker = %broker_qty,
                    "position quantity mismatch"
                );
                diffs.push(QuantityDiff {
                    symbol: symbol.clone(),
                    local: local_qty,
                    broker: broker_qty,
                    diff: broker_qty - local_qty,
                });
            }
            _ => {}
        }
    }
    (diffs, orphaned, missing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn holdings_split_into_diffs_orphans_and_missing() {
        let local = BTreeMap::from([
            ("XBTUSD".to_string(), dec!(1.5)),
            ("ETHUSD".to_string(), dec!(2)),
            ("SOLUSD".to_string(), dec!(10)),
            ("ADAUSD".to_string(), dec!(0.00000001)),
        ]);
        let broker = BTreeMap::from([
            ("XBTUSD".to_string(), dec!(1.5)),
            ("ETHUSD".to_string(), dec!(1.9)),
            ("DOTUSD".to_string(), dec!(4)),
            ("ADAUSD".to_string(), dec!(0)),
        ]);
        let (diffs, orphaned, missing) = compare_holdings(&local, &broker, dec!(0.0000001));
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].symbol, "ETHUSD");
        assert_eq!(diffs[0].diff, dec!(-0.1));
        assert_eq!(orphaned, vec!["SOLUSD".to_string()]);
        assert_eq!(missing, vec!["DOTUSD".to_string()]);
    }

    #[test]
    fn quantity_noise_below_tolerance_is_ignored() {
        let local = BTreeMap::from([("XBTUSD".to_string(), dec!(1.00000000))]);
        let broker = BTreeMap::from([("XBTUSD".to_string(), dec!(1.00000005))]);
        let (diffs, orphaned, missing) = compare_holdings(&local, &broker, dec!(0.0000001));
        assert!(diffs.is_empty() && orphaned.is_empty() && missing.is_empty());
    }
}
