//! First-in-first-out cost basis ledger.
//!
//! The matcher is plain data with no internal locking. Exactly one task owns
//! it (the fill consumer) and everyone else reads through that owner.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use keel_core::{Fill, Lot, Price, Quantity, Side, Symbol};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::equity::{LedgerView, OpenPosition};

/// Portion of one lot consumed by a sell.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct LotMatch {
    pub lot_fill_id: String,
    pub quantity: Quantity,
    pub buy_price: Price,
    pub sell_price: Price,
    /// Buy-side fee attributed to the matched quantity.
    pub buy_fee: Price,
}

impl LotMatch {
    #[must_use]
    pub fn gross_pnl(&self) -> Price {
        (self.sell_price - self.buy_price) * self.quantity
    }
}

/// Outcome of matching a sell against the open lots.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct MatchResult {
    pub symbol: Symbol,
    pub sell_fill_id: String,
    pub matched_quantity: Quantity,
    /// Sell quantity with no open lot to match against.
    pub unmatched_quantity: Quantity,
    pub gross_pnl: Price,
    pub buy_fees: Price,
    pub sell_fee: Price,
    /// `gross_pnl - buy_fees - sell_fee`.
    pub realized_pnl: Price,
    pub matches: Vec<LotMatch>,
}

#[derive(Clone, Debug, Default)]
pub struct FifoMatcher {
    lots: HashMap<Symbol, VecDeque<Lot>>,
    realized: HashMap<Symbol, Price>,
    fees: HashMap<Symbol, Price>,
    unmatched: HashMap<Symbol, Quantity>,
}

impl FifoMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a ledger by replaying fills in the order given.
    pub fn from_fills<'a>(fills: impl IntoIterator<Item = &'a Fill>) -> Self {
        let mut matcher = Self::new();
        for fill in fills {
            matcher.apply(fill);
        }
        matcher
    }

    /// Convenience wrapper around [`Self::process_fill`].
    pub fn apply(&mut self, fill: &Fill) -> Option<MatchResult> {
        self.process_fill(
            &fill.symbol,
            fill.side,
            fill.quantity,
            fill.price,
            fill.fee,
            &fill.fill_id,
            fill.executed_at,
        )
    }

    /// Apply one execution. Buys open a lot and return `None`; sells consume
    /// the oldest lots first and return the realized result.
    #[allow(clippy::too_many_arguments)]
    pub fn process_fill(
        &mut self,
        symbol: &str,
        side: Side,
        quantity: Quantity,
        price: Price,
        fee: Price,
        fill_id: &str,
        executed_at: DateTime<Utc>,
    ) -> Option<MatchResult> {
        if quantity <= Decimal::ZERO {
            warn!(symbol, fill_id, %quantity, "ignoring fill with non-positive quantity");
            return None;
        }
        let fee = fee.max(Decimal::ZERO);
        *self.fees.entry(symbol.to_string()).or_default() += fee;
        match side {
            Side::Buy => {
                self.lots.entry(symbol.to_string()).or_default().push_back(Lot {
                    symbol: symbol.to_string(),
                    quantity,
                    price,
                    fee,
                    fill_id: fill_id.to_string(),
                    executed_at,
                });
                debug!(symbol, fill_id, %quantity, %price, "opened lot");
                None
            }
            Side::Sell => Some(self.match_sell(symbol, quantity, price, fee, fill_id)),
        }
    }

    fn match_sell(
        &mut self,
        symbol: &str,
        quantity: Quantity,
        price: Price,
        fee: Price,
        fill_id: &str,
    ) -> MatchResult {
        let mut remaining = quantity;
        let mut matches = Vec::new();
        if let Some(queue) = self.lots.get_mut(symbol) {
            while remaining > Decimal::ZERO {
                let Some(lot) = queue.front_mut() else {
                    break;
                };
                let take = remaining.min(lot.quantity);
                let buy_fee = if take == lot.quantity {
                    // The last slice takes whatever fee is left so prorations sum exactly.
                    lot.fee
                } else {
                    lot.fee * take / lot.quantity
                };
                matches.push(LotMatch {
                    lot_fill_id: lot.fill_id.clone(),
                    quantity: take,
                    buy_price: lot.price,
                    sell_price: price,
                    buy_fee,
                });
                lot.quantity -= take;
                lot.fee -= buy_fee;
                remaining -= take;
                if lot.quantity.is_zero() {
                    queue.pop_front();
                }
            }
            if queue.is_empty() {
                self.lots.remove(symbol);
            }
        }

        let matched_quantity = quantity - remaining;
        let gross_pnl: Price = matches.iter().map(LotMatch::gross_pnl).sum();
        let buy_fees: Price = matches.iter().map(|m| m.buy_fee).sum();
        let realized_pnl = gross_pnl - buy_fees - fee;
        *self.realized.entry(symbol.to_string()).or_default() += realized_pnl;

        if remaining > Decimal::ZERO {
            *self.unmatched.entry(symbol.to_string()).or_default() += remaining;
            warn!(
                symbol,
                fill_id,
                unmatched = %remaining,
                "sell exceeds open lots; unmatched quantity carries no cost basis"
            );
        }

        MatchResult {
            symbol: symbol.to_string(),
            sell_fill_id: fill_id.to_string(),
            matched_quantity,
            unmatched_quantity: remaining,
            gross_pnl,
            buy_fees,
            sell_fee: fee,
            realized_pnl,
            matches,
        }
    }

    pub fn open_lots(&self, symbol: &str) -> Vec<Lot> {
        self.lots
            .get(symbol)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn open_quantity(&self, symbol: &str) -> Quantity {
        self.lots
            .get(symbol)
            .map(|queue| queue.iter().map(|lot| lot.quantity).sum())
            .unwrap_or_default()
    }

    /// Fee-inclusive cost of every open lot.
    pub fn cost_value(&self, symbol: &str) -> Price {
        self.lots
            .get(symbol)
            .map(|queue| queue.iter().map(Lot::cost).sum())
            .unwrap_or_default()
    }

    /// Fee-inclusive weighted average price of the open lots, zero when flat.
    pub fn cost_basis(&self, symbol: &str) -> Price {
        let qty = self.open_quantity(symbol);
        if qty.is_zero() {
            return Decimal::ZERO;
        }
        self.cost_value(symbol) / qty
    }

    /// Realized P&L for one symbol, or across all symbols.
    pub fn realized_pnl(&self, symbol: Option<&str>) -> Price {
        match symbol {
            Some(symbol) => self.realized.get(symbol).copied().unwrap_or_default(),
            None => self.realized.values().copied().sum(),
        }
    }

    /// `Σ (mark - lot.price) * lot.qty - lot.fee` over the open lots.
    pub fn unrealized_pnl(&self, symbol: &str, mark_price: Price) -> Price {
        self.lots
            .get(symbol)
            .map(|queue| {
                queue
                    .iter()
                    .map(|lot| (mark_price - lot.price) * lot.quantity - lot.fee)
                    .sum()
            })
            .unwrap_or_default()
    }

    /// Every fee applied to the ledger (buy and sell side).
    pub fn total_fees(&self, symbol: Option<&str>) -> Price {
        match symbol {
            Some(symbol) => self.fees.get(symbol).copied().unwrap_or_default(),
            None => self.fees.values().copied().sum(),
        }
    }

    pub fn unmatched_quantity(&self, symbol: &str) -> Quantity {
        self.unmatched.get(symbol).copied().unwrap_or_default()
    }

    /// Symbols with open quantity, sorted for stable output.
    pub fn symbols(&self) -> Vec<Symbol> {
        let mut symbols: Vec<Symbol> = self.lots.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn position_count(&self) -> usize {
        self.lots.len()
    }

    /// Owned copy of the data equity computations need.
    pub fn view(&self) -> LedgerView {
        LedgerView {
            positions: self
                .symbols()
                .into_iter()
                .map(|symbol| OpenPosition {
                    quantity: self.open_quantity(&symbol),
                    cost_value: self.cost_value(&symbol),
                    symbol,
                })
                .collect(),
            realized_pnl: self.realized_pnl(None),
            total_fees: self.total_fees(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn buy(m: &mut FifoMatcher, qty: Decimal, price: Decimal, fee: Decimal, id: &str) {
        assert!(m
            .process_fill("BTC", Side::Buy, qty, price, fee, id, Utc::now())
            .is_none());
    }

    fn sell(m: &mut FifoMatcher, qty: Decimal, price: Decimal, fee: Decimal, id: &str) -> MatchResult {
        m.process_fill("BTC", Side::Sell, qty, price, fee, id, Utc::now())
            .expect("sell returns a match result")
    }

    #[test]
    fn sells_consume_oldest_lots_first() {
        let mut m = FifoMatcher::new();
        buy(&mut m, dec!(2), dec!(100), dec!(1), "b1");
        buy(&mut m, dec!(1), dec!(200), dec!(0.5), "b2");
        let result = sell(&mut m, dec!(2), dec!(150), dec!(1), "s1");

        assert_eq!(result.matches.len(), 1);
        assert_eq!(result.matches[0].lot_fill_id, "b1");
        assert_eq!(result.gross_pnl, dec!(100));
        assert_eq!(result.realized_pnl, dec!(98));
        assert_eq!(m.open_quantity("BTC"), dec!(1));
        assert_eq!(m.cost_basis("BTC"), dec!(200.5));
        let lots = m.open_lots("BTC");
        assert_eq!(lots.len(), 1);
        assert_eq!(lots[0].price, dec!(200));
    }

    #[test]
    fn partial_lot_match_prorates_fee() {
        let mut m = FifoMatcher::new();
        buy(&mut m, dec!(4), dec!(10), dec!(2), "b1");
        let result = sell(&mut m, dec!(1), dec!(12), dec!(0.1), "s1");
        assert_eq!(result.buy_fees, dec!(0.5));
        assert_eq!(result.realized_pnl, dec!(2) - dec!(0.5) - dec!(0.1));
        let lot = &m.open_lots("BTC")[0];
        assert_eq!(lot.quantity, dec!(3));
        assert_eq!(lot.fee, dec!(1.5));
    }

    #[test]
    fn fees_are_conserved_across_repeated_partial_matches() {
        let mut m = FifoMatcher::new();
        buy(&mut m, dec!(3), dec!(10), dec!(1), "b1");
        buy(&mut m, dec!(7), dec!(11), dec!(0.7), "b2");
        let mut buy_fees = Decimal::ZERO;
        let mut gross = Decimal::ZERO;
        let mut sell_fees = Decimal::ZERO;
        let mut realized = Decimal::ZERO;
        for (i, qty) in [dec!(0.7), dec!(1.1), dec!(2.9), dec!(0.3), dec!(5)].into_iter().enumerate() {
            let result = sell(&mut m, qty, dec!(13), dec!(0.01), &format!("s{i}"));
            buy_fees += result.buy_fees;
            gross += result.gross_pnl;
            sell_fees += result.sell_fee;
            realized += result.realized_pnl;
        }
        assert_eq!(buy_fees, dec!(1.7));
        assert_eq!(realized, gross - buy_fees - sell_fees);
        assert_eq!(m.realized_pnl(None), realized);
        assert_eq!(m.open_quantity("BTC"), Decimal::ZERO);
    }

    #[test]
    fn round_trip_at_same_price_without_fees_is_flat() {
        let mut m = FifoMatcher::new();
        buy(&mut m, dec!(1), dec!(250), Decimal::ZERO, "b1");
        let result = sell(&mut m, dec!(1), dec!(250), Decimal::ZERO, "s1");
        assert_eq!(result.realized_pnl, Decimal::ZERO);
        assert_eq!(m.open_quantity("BTC"), Decimal::ZERO);
        assert_eq!(m.cost_basis("BTC"), Decimal::ZERO);
        assert_eq!(m.position_count(), 0);
    }

    #[test]
    fn oversell_keeps_unmatched_remainder_out_of_pnl() {
        let mut m = FifoMatcher::new();
        buy(&mut m, dec!(1), dec!(100), Decimal::ZERO, "b1");
        let result = sell(&mut m, dec!(3), dec!(110), dec!(2), "s1");
        assert_eq!(result.matched_quantity, dec!(1));
        assert_eq!(result.unmatched_quantity, dec!(2));
        assert_eq!(result.gross_pnl, dec!(10));
        assert_eq!(result.realized_pnl, dec!(8));
        assert_eq!(m.unmatched_quantity("BTC"), dec!(2));
    }

    #[test]
    fn sell_with_no_lots_still_charges_fee() {
        let mut m = FifoMatcher::new();
        let result = sell(&mut m, dec!(1), dec!(50), dec!(0.25), "s1");
        assert!(result.matches.is_empty());
        assert_eq!(result.realized_pnl, dec!(-0.25));
    }

    #[test]
    fn unrealized_pnl_subtracts_remaining_fees() {
        let mut m = FifoMatcher::new();
        buy(&mut m, dec!(2), dec!(100), dec!(1), "b1");
        buy(&mut m, dec!(1), dec!(200), dec!(0.5), "b2");
        assert_eq!(m.unrealized_pnl("BTC", dec!(150)), dec!(100) - dec!(1) + dec!(-50) - dec!(0.5));
        assert_eq!(m.unrealized_pnl("ETH", dec!(150)), Decimal::ZERO);
    }

    #[test]
    fn non_positive_quantity_is_ignored() {
        let mut m = FifoMatcher::new();
        assert!(m
            .process_fill("BTC", Side::Buy, Decimal::ZERO, dec!(1), Decimal::ZERO, "z", Utc::now())
            .is_none());
        assert_eq!(m.position_count(), 0);
        assert_eq!(m.total_fees(None), Decimal::ZERO);
    }

    #[test]
    fn realized_and_fees_aggregate_across_symbols() {
        let mut m = FifoMatcher::new();
        let now = Utc::now();
        m.process_fill("BTC", Side::Buy, dec!(1), dec!(10), dec!(0.1), "a", now);
        m.process_fill("BTC", Side::Sell, dec!(1), dec!(12), dec!(0.1), "b", now);
        m.process_fill("ETH", Side::Buy, dec!(1), dec!(5), dec!(0.2), "c", now);
        m.process_fill("ETH", Side::Sell, dec!(1), dec!(4), Decimal::ZERO, "d", now);
        assert_eq!(m.realized_pnl(Some("BTC")), dec!(1.8));
        assert_eq!(m.realized_pnl(Some("ETH")), dec!(-1.2));
        assert_eq!(m.realized_pnl(None), dec!(0.6));
        assert_eq!(m.total_fees(Some("ETH")), dec!(0.2));
        assert_eq!(m.total_fees(None), dec!(0.4));
    }
}
