//! Mark-to-market equity computation.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use keel_broker::Exchange;
use keel_core::{Price, Quantity, Symbol, TradingMode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::fifo::FifoMatcher;

/// Synchronous access to recently observed mark prices.
pub trait QuoteSource: Send + Sync {
    fn mark_price(&self, symbol: &str) -> Option<Price>;
}

impl<F> QuoteSource for F
where
    F: Fn(&str) -> Option<Price> + Send + Sync,
{
    fn mark_price(&self, symbol: &str) -> Option<Price> {
        self(symbol)
    }
}

/// Open quantity and fee-inclusive cost of one symbol.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct OpenPosition {
    pub symbol: Symbol,
    pub quantity: Quantity,
    pub cost_value: Price,
}

impl OpenPosition {
    #[must_use]
    pub fn cost_basis(&self) -> Price {
        if self.quantity.is_zero() {
            Decimal::ZERO
        } else {
            self.cost_value / self.quantity
        }
    }
}

/// Owned snapshot of a [`FifoMatcher`], so valuation can await quotes without holding the ledger.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct LedgerView {
    pub positions: Vec<OpenPosition>,
    pub realized_pnl: Price,
    pub total_fees: Price,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkSource {
    /// Latest focus-tier snapshot.
    Focus,
    /// Direct best bid/ask query.
    Exchange,
    /// No quote anywhere; valued at cost.
    CostBasis,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PositionValuation {
    pub symbol: Symbol,
    pub quantity: Quantity,
    pub cost_basis: Price,
    pub mark_price: Price,
    pub market_value: Price,
    pub unrealized_pnl: Price,
    pub source: MarkSource,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct EquityBreakdown {
    pub mode: TradingMode,
    pub cash: Price,
    pub market_value: Price,
    pub unrealized_pnl: Price,
    pub realized_pnl: Price,
    pub total_fees: Price,
    /// `cash + market_value`.
    pub equity: Price,
    pub positions: Vec<PositionValuation>,
    pub computed_at: DateTime<Utc>,
}

impl EquityBreakdown {
    #[must_use]
    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    /// Market value per symbol, as used for exposure tracking.
    #[must_use]
    pub fn exposures(&self) -> HashMap<Symbol, Price> {
        self.positions
            .iter()
            .map(|p| (p.symbol.clone(), p.market_value))
            .collect()
    }
}

/// Values open positions with focus quotes first, then the exchange, then cost.
#[derive(Clone, Default)]
pub struct EquityCalculator {
    focus: Option<Arc<dyn QuoteSource>>,
    exchange: Option<Arc<dyn Exchange>>,
}

impl EquityCalculator {
    pub fn new(focus: Option<Arc<dyn QuoteSource>>, exchange: Option<Arc<dyn Exchange>>) -> Self {
        Self { focus, exchange }
    }

    pub async fn compute(
        &self,
        cash: Price,
        matcher: &FifoMatcher,
        mode: TradingMode,
    ) -> EquityBreakdown {
        self.compute_view(cash, matcher.view(), mode).await
    }

    /// Never fails: symbols without any quote are valued at their own cost basis.
    pub async fn compute_view(
        &self,
        cash: Price,
        view: LedgerView,
        mode: TradingMode,
    ) -> EquityBreakdown {
        let mut marks: HashMap<Symbol, (Price, MarkSource)> = HashMap::new();
        if let Some(focus) = &self.focus {
            for position in &view.positions {
                if let Some(mark) = focus
                    .mark_price(&position.symbol)
                    .filter(|price| *price > Decimal::ZERO)
                {
                    marks.insert(position.symbol.clone(), (mark, MarkSource::Focus));
                }
            }
        }

        let missing: Vec<Symbol> = view
            .positions
            .iter()
            .filter(|p| !marks.contains_key(&p.symbol))
            .map(|p| p.symbol.clone())
            .collect();
        if let (Some(exchange), false) = (&self.exchange, missing.is_empty()) {
            match exchange.best_bid_ask_batch(&missing).await {
                Ok(quotes) => {
                    for quote in quotes {
                        let mid = quote.mid();
                        if mid > Decimal::ZERO {
                            marks.insert(quote.symbol.clone(), (mid, MarkSource::Exchange));
                        }
                    }
                }
                Err(err) => {
                    warn!(symbols = ?missing, error = %err, "exchange quote fallback failed");
                }
            }
        }

        let mut positions = Vec::with_capacity(view.positions.len());
        let mut market_value = Decimal::ZERO;
        let mut unrealized = Decimal::ZERO;
        for position in view.positions {
            let cost_basis = position.cost_basis();
            let valuation = match marks.get(&position.symbol) {
                Some((mark, source)) => {
                    let value = *mark * position.quantity;
                    PositionValuation {
                        symbol: position.symbol,
                        quantity: position.quantity,
                        cost_basis,
                        mark_price: *mark,
                        market_value: value,
                        unrealized_pnl: value - position.cost_value,
                        source: *source,
                    }
                }
                None => {
                    debug!(symbol = %position.symbol, "no mark price; valuing at cost basis");
                    PositionValuation {
                        symbol: position.symbol,
                        quantity: position.quantity,
                        cost_basis,
                        mark_price: cost_basis,
                        market_value: position.cost_value,
                        unrealized_pnl: Decimal::ZERO,
                        source: MarkSource::CostBasis,
                    }
                }
            };
            market_value += valuation.market_value;
            unrealized += valuation.unrealized_pnl;
            positions.push(valuation);
        }

        EquityBreakdown {
            mode,
            cash,
            market_value,
            unrealized_pnl: unrealized,
            realized_pnl: view.realized_pnl,
            total_fees: view.total_fees,
            equity: cash + market_value,
            positions,
            computed_at: Utc::now(),
        }
    }
}
