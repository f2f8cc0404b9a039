use async_trait::async_trait;
use keel_broker::{BrokerResult, Exchange, ExchangeOrder, OrderAck, PlaceOrderRequest};
use keel_core::{AccountBalance, BidAsk, Fill, Holding};
use tracing::debug;

use crate::scenario::{ScenarioAction, ScenarioTrigger};
use crate::state::{MockExchangeConfig, MockExchangeState};

/// In-memory [`Exchange`] whose behavior tests script through its state.
#[derive(Clone)]
pub struct MockExchange {
    name: String,
    state: MockExchangeState,
}

impl MockExchange {
    pub fn new(config: MockExchangeConfig) -> Self {
        let name = config.name.clone();
        Self {
            name,
            state: MockExchangeState::new(config),
        }
    }

    #[must_use]
    pub fn state(&self) -> MockExchangeState {
        self.state.clone()
    }

    async fn intercept(&self, trigger: ScenarioTrigger) -> BrokerResult<()> {
        match self.state.scenarios().take_for(trigger).await {
            Some(ScenarioAction::Delay(delay)) => {
                debug!(?trigger, ?delay, "mock exchange delaying call");
                tokio::time::sleep(delay).await;
                Ok(())
            }
            Some(ScenarioAction::Fail { status, reason }) => {
                debug!(?trigger, status, %reason, "mock exchange failing call");
                Err(ScenarioAction::error(status, &reason))
            }
            None => Ok(()),
        }
    }
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new(MockExchangeConfig::default())
    }
}

#[async_trait]
impl Exchange for MockExchange {
    fn name(&self) -> &str {
        &self.name
    }

    async fn account_balances(&self) -> BrokerResult<Vec<AccountBalance>> {
        self.state.record("account_balances", "").await;
        self.intercept(ScenarioTrigger::AccountBalances).await?;
        Ok(self.state.balances().await)
    }

    async fn holdings(&self) -> BrokerResult<Vec<Holding>> {
        self.state.record("holdings", "").await;
        self.intercept(ScenarioTrigger::Holdings).await?;
        Ok(self.state.holdings().await)
    }

    async fn place_order(&self, request: PlaceOrderRequest) -> BrokerResult<OrderAck> {
        self.state
            .record("place_order", request.client_order_id.clone())
            .await;
        self.intercept(ScenarioTrigger::PlaceOrder).await?;
        self.state.place(request).await
    }

    async fn get_order(&self, order_id: &str) -> BrokerResult<ExchangeOrder> {
        self.state.record("get_order", order_id).await;
        self.intercept(ScenarioTrigger::GetOrder).await?;
        self.state.get(order_id).await
    }

    async fn order_fills(&self, order_id: &str) -> BrokerResult<Vec<Fill>> {
        self.state.record("order_fills", order_id).await;
        self.intercept(ScenarioTrigger::OrderFills).await?;
        self.state.fills(order_id).await
    }

    async fn cancel_order(&self, order_id: &str) -> BrokerResult<()> {
        self.state.record("cancel_order", order_id).await;
        self.intercept(ScenarioTrigger::CancelOrder).await?;
        self.state.cancel(order_id).await
    }

    async fn best_bid_ask(&self, symbol: &str) -> BrokerResult<Option<BidAsk>> {
        self.state.record("best_bid_ask", symbol).await;
        self.intercept(ScenarioTrigger::Quote).await?;
        Ok(self.state.quote(symbol).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::Scenario;
    use keel_broker::BrokerError;
    use keel_core::{OrderType, Side};
    use rust_decimal_macros::dec;

    fn limit_buy(client_id: &str) -> PlaceOrderRequest {
        PlaceOrderRequest {
            symbol: "XBTUSD".into(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            client_order_id: client_id.into(),
            quantity: Some(dec!(2)),
            notional: None,
            limit_price: Some(dec!(100)),
        }
    }

    #[tokio::test]
    async fn client_order_id_is_idempotent() {
        let exchange = MockExchange::default();
        let first = exchange.place_order(limit_buy("i-r0")).await.unwrap();
        let second = exchange.place_order(limit_buy("i-r0")).await.unwrap();
        assert_eq!(first.order_id, second.order_id);
        assert_eq!(exchange.state().open_orders().await.len(), 1);
    }

    #[tokio::test]
    async fn fills_move_balances_and_close_the_order() {
        let exchange = MockExchange::default();
        let state = exchange.state();
        let ack = exchange.place_order(limit_buy("i-r0")).await.unwrap();
        state.fill_order(&ack.order_id, dec!(1), dec!(100), dec!(0.5)).await;
        assert_eq!(exchange.get_order(&ack.order_id).await.unwrap().status, "open");
        state.fill_order(&ack.order_id, dec!(1), dec!(102), dec!(0.5)).await;
        let order = exchange.get_order(&ack.order_id).await.unwrap();
        assert_eq!(order.status, "closed");
        assert_eq!(order.avg_fill_price, Some(dec!(101)));
        let usd = exchange.account_balances().await.unwrap();
        assert_eq!(usd[0].total, dec!(10000) - dec!(203));
        let held = exchange.holdings().await.unwrap();
        assert_eq!(held[0].quantity, dec!(2));
        assert_eq!(exchange.order_fills(&ack.order_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn scripted_failures_fire_once() {
        let exchange = MockExchange::default();
        exchange
            .state()
            .scenarios()
            .push(Scenario::fail("down", ScenarioTrigger::Holdings, 503, "maintenance"))
            .await;
        let err = exchange.holdings().await.unwrap_err();
        assert!(matches!(err, BrokerError::Server { status: 503, .. }));
        assert!(exchange.holdings().await.is_ok());
        assert_eq!(exchange.state().call_count("holdings").await, 2);
    }
}
