//! Reposition policy for resting limit orders whose TTL has elapsed.

use keel_core::{BidAsk, ManagedOrder, OrderType, Price, Side};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

const BPS: Decimal = Decimal::from_parts(10_000, 0, 0, false, 0);

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RepositionConfig {
    /// Price improvement per reposition, in basis points of the current limit.
    #[serde(default = "default_step_bps")]
    pub step_bps: Decimal,
    /// Furthest a limit may move from the book side it was anchored to.
    #[serde(default = "default_max_cross_bps")]
    pub max_cross_bps: Decimal,
    #[serde(default = "default_max_reprices")]
    pub max_reprices: u32,
    /// Spread (percent of mid) above which the order is abandoned.
    #[serde(default = "default_max_spread_pct")]
    pub max_spread_pct: Decimal,
}

fn default_step_bps() -> Decimal {
    Decimal::from(5)
}

fn default_max_cross_bps() -> Decimal {
    Decimal::from(25)
}

fn default_max_reprices() -> u32 {
    3
}

fn default_max_spread_pct() -> Decimal {
    Decimal::ONE
}

impl Default for RepositionConfig {
    fn default() -> Self {
        Self {
            step_bps: default_step_bps(),
            max_cross_bps: default_max_cross_bps(),
            max_reprices: default_max_reprices(),
            max_spread_pct: default_max_spread_pct(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum RepositionDecision {
    /// Nothing to do: not a limit order, or no quote to act on.
    Hold,
    /// Cancel and resubmit at `price`.
    Reposition { price: Price },
    /// Give up on the order.
    Cancel { reason: String },
    /// The book is too wide to chase.
    CancelLiquidity { spread_pct: Decimal },
}

#[derive(Clone, Debug, Default)]
pub struct RepositionPolicy {
    config: RepositionConfig,
}

impl RepositionPolicy {
    pub fn new(config: RepositionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RepositionConfig {
        &self.config
    }

    /// Highest buy (or lowest sell) price the order may ever rest at.
    #[must_use]
    pub fn price_cap(&self, side: Side, anchor: Price) -> Price {
        let offset = anchor * self.config.max_cross_bps / BPS;
        match side {
            Side::Buy => anchor + offset,
            Side::Sell => anchor - offset,
        }
    }

    /// Decide what to do with an order whose TTL has elapsed.
    pub fn should_reposition(
        &self,
        order: &ManagedOrder,
        quote: Option<&BidAsk>,
        tick_size: Option<Price>,
    ) -> RepositionDecision {
        let Some(current) = order.limit_price.filter(|_| order.order_type == OrderType::Limit)
        else {
            return RepositionDecision::Hold;
        };
        let Some(quote) = quote else {
            return RepositionDecision::Hold;
        };
        if order.replace_count >= self.config.max_reprices {
            return RepositionDecision::Cancel {
                reason: format!(
                    "reprice attempts exhausted ({}/{})",
                    order.replace_count, self.config.max_reprices
                ),
            };
        }
        match quote.spread_pct() {
            Some(spread_pct) if spread_pct > self.config.max_spread_pct => {
                return RepositionDecision::CancelLiquidity { spread_pct };
            }
            None => return RepositionDecision::Hold,
            _ => {}
        }

        let anchor = order.anchor_price.unwrap_or(current);
        let cap = self.price_cap(order.side, anchor);
        let step = current * self.config.step_bps / BPS;
        let next = match order.side {
            Side::Buy => round_to_tick((current + step).min(cap), tick_size, Side::Buy),
            Side::Sell => round_to_tick((current - step).max(cap), tick_size, Side::Sell),
        };
        let improves = match order.side {
            Side::Buy => next > current,
            Side::Sell => next < current && next > Decimal::ZERO,
        };
        if improves {
            RepositionDecision::Reposition { price: next }
        } else {
            RepositionDecision::Cancel {
                reason: format!("reprice cap {cap} reached at {current}"),
            }
        }
    }
}

/// Snap a price onto the tick grid, rounding away from the cap: buys down, sells up.
#[must_use]
pub fn round_to_tick(price: Price, tick_size: Option<Price>, side: Side) -> Price {
    match tick_size.filter(|tick| *tick > Decimal::ZERO) {
        Some(tick) => {
            let ticks = price / tick;
            let ticks = match side {
                Side::Buy => ticks.floor(),
                Side::Sell => ticks.ceil(),
            };
            (ticks * tick).normalize()
        }
        None => price,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use keel_core::{OrderPurpose, OrderStatus, TradingMode};
    use rust_decimal_macros::dec;

    fn order(side: Side, limit: Price, replace_count: u32) -> ManagedOrder {
        let now = Utc::now();
        ManagedOrder {
            order_id: "O-1".into(),
            client_order_id: "i-r0".into(),
            intent_id: "i".into(),
            symbol: "XBTUSD".into(),
            side,
            order_type: OrderType::Limit,
            purpose: OrderPurpose::Entry,
            notional: Some(dec!(100)),
            quantity: None,
            limit_price: Some(limit),
            anchor_price: Some(dec!(100)),
            status: OrderStatus::Working,
            replace_count,
            parent_order_id: None,
            filled_quantity: Decimal::ZERO,
            avg_fill_price: None,
            submitted_at: now,
            ttl_secs: 30,
            updated_at: now,
            mode: TradingMode::Paper,
        }
    }

    fn quote(bid: Price, ask: Price) -> BidAsk {
        BidAsk {
            symbol: "XBTUSD".into(),
            bid,
            ask,
            observed_at: Utc::now(),
        }
    }

    fn policy() -> RepositionPolicy {
        RepositionPolicy::new(RepositionConfig {
            step_bps: dec!(10),
            max_cross_bps: dec!(25),
            max_reprices: 5,
            max_spread_pct: dec!(1),
        })
    }

    #[test]
    fn market_orders_and_missing_quotes_hold() {
        let mut market = order(Side::Buy, dec!(100), 0);
        market.order_type = OrderType::Market;
        assert_eq!(
            policy().should_reposition(&market, Some(&quote(dec!(100), dec!(100.1))), None),
            RepositionDecision::Hold
        );
        assert_eq!(
            policy().should_reposition(&order(Side::Buy, dec!(100), 0), None, None),
            RepositionDecision::Hold
        );
    }

    #[test]
    fn buys_step_up_and_sells_step_down() {
        let book = quote(dec!(100), dec!(100.2));
        assert_eq!(
            policy().should_reposition(&order(Side::Buy, dec!(100), 0), Some(&book), None),
            RepositionDecision::Reposition { price: dec!(100.1) }
        );
        assert_eq!(
            policy().should_reposition(&order(Side::Sell, dec!(100), 0), Some(&book), None),
            RepositionDecision::Reposition { price: dec!(99.9) }
        );
    }

    #[test]
    fn exhausted_orders_cancel() {
        let decision = policy().should_reposition(
            &order(Side::Buy, dec!(100), 5),
            Some(&quote(dec!(100), dec!(100.1))),
            None,
        );
        assert!(matches!(decision, RepositionDecision::Cancel { .. }));
    }

    #[test]
    fn wide_spreads_abort() {
        let decision = policy().should_reposition(
            &order(Side::Buy, dec!(100), 0),
            Some(&quote(dec!(98), dec!(102))),
            None,
        );
        assert_eq!(
            decision,
            RepositionDecision::CancelLiquidity { spread_pct: dec!(4) }
        );
    }

    #[test]
    fn repeated_repositions_never_pass_the_cap() {
        let policy = RepositionPolicy::new(RepositionConfig {
            step_bps: dec!(7),
            max_cross_bps: dec!(25),
            max_reprices: u32::MAX,
            max_spread_pct: dec!(1),
        });
        let book = quote(dec!(100), dec!(100.3));
        for side in [Side::Buy, Side::Sell] {
            let cap = policy.price_cap(side, dec!(100));
            let mut current = order(side, dec!(100), 0);
            let mut steps = 0;
            while let RepositionDecision::Reposition { price } =
                policy.should_reposition(&current, Some(&book), Some(dec!(0.01)))
            {
                match side {
                    Side::Buy => assert!(price <= cap, "{price} above {cap}"),
                    Side::Sell => assert!(price >= cap, "{price} below {cap}"),
                }
                current.limit_price = Some(price);
                current.replace_count += 1;
                steps += 1;
                assert!(steps < 100);
            }
            assert!(steps > 0);
        }
    }

    #[test]
    fn tick_rounding_moves_away_from_the_cap() {
        assert_eq!(round_to_tick(dec!(100.137), Some(dec!(0.05)), Side::Buy), dec!(100.1));
        assert_eq!(round_to_tick(dec!(100.137), Some(dec!(0.05)), Side::Sell), dec!(100.15));
        assert_eq!(round_to_tick(dec!(1.5), None, Side::Buy), dec!(1.5));
    }
}
