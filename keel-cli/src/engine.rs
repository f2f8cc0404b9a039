//! Strategy-facing surface of the running core.
//!
//! The engine never decides what to trade. It accepts intents, answers
//! pre-trade questions and exposes read-only equity, position and P&L views.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use keel_broker::Exchange;
use keel_core::{IntentId, OrderPurpose, Price, TradingMode};
use keel_execution::{FillStreamService, IntentRequest, OrderManager, SubmitError};
use keel_portfolio::{EquityBreakdown, EquityCalculator, LedgerView};
use keel_risk::{BreakerState, CircuitBreaker, GateState, TradingGate};

/// Quote-currency cash as the exchange reports it (the balance total).
pub async fn broker_cash(exchange: &dyn Exchange, currency: &str) -> Result<Price> {
    let balances = exchange
        .account_balances()
        .await
        .context("failed to fetch account balances")?;
    balances
        .into_iter()
        .find(|balance| balance.currency.eq_ignore_ascii_case(currency))
        .map(|balance| balance.total)
        .ok_or_else(|| anyhow!("exchange reported no {currency} balance"))
}

#[derive(Clone)]
pub struct TradingEngine {
    mode: TradingMode,
    quote_currency: String,
    exchange: Arc<dyn Exchange>,
    orders: Arc<OrderManager>,
    fills: Arc<FillStreamService>,
    breaker: Arc<CircuitBreaker>,
    gate: Arc<TradingGate>,
    equity: EquityCalculator,
}

impl TradingEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mode: TradingMode,
        quote_currency: impl Into<String>,
        exchange: Arc<dyn Exchange>,
        orders: Arc<OrderManager>,
        fills: Arc<FillStreamService>,
        breaker: Arc<CircuitBreaker>,
        gate: Arc<TradingGate>,
        equity: EquityCalculator,
    ) -> Self {
        Self {
            mode,
            quote_currency: quote_currency.into(),
            exchange,
            orders,
            fills,
            breaker,
            gate,
            equity,
        }
    }

    pub fn mode(&self) -> TradingMode {
        self.mode
    }

    pub fn order_manager(&self) -> &Arc<OrderManager> {
        &self.orders
    }

    pub async fn submit_intent(&self, request: IntentRequest) -> Result<IntentId, SubmitError> {
        self.orders.submit_intent(request).await
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<(), SubmitError> {
        self.orders.cancel_order(order_id).await
    }

    /// Returns how many live orders of the intent were cancelled.
    pub async fn cancel_intent(&self, intent_id: &str) -> Result<usize, SubmitError> {
        self.orders.cancel_intent(intent_id).await
    }

    /// Would a new entry of `notional` on `symbol` pass the gate and the breaker?
    pub fn can_trade(&self, symbol: &str, notional: Price) -> Result<(), SubmitError> {
        self.gate.permits(OrderPurpose::Entry)?;
        self.breaker.check(symbol, notional)?;
        Ok(())
    }

    pub async fn cash(&self) -> Result<Price> {
        broker_cash(self.exchange.as_ref(), &self.quote_currency).await
    }

    pub async fn equity(&self) -> Result<EquityBreakdown> {
        let cash = self.cash().await?;
        let view = self.positions().await;
        Ok(self.equity.compute_view(cash, view, self.mode).await)
    }

    /// Open lots, realized P&L and fees as the ledger currently stands.
    pub async fn positions(&self) -> LedgerView {
        self.fills.matcher().lock().await.view()
    }

    pub async fn realized_pnl(&self) -> Price {
        self.fills.matcher().lock().await.realized_pnl(None)
    }

    pub fn gate_state(&self) -> GateState {
        self.gate.state()
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }
}
