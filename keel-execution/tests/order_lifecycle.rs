use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use keel_broker::{BookSource, BrokerResult, Exchange, ExchangeOrder, OrderAck, PlaceOrderRequest};
use keel_core::{
    AccountBalance, BidAsk, Fill, Holding, IntentStatus, OrderPurpose, OrderStatus, Side,
    TradingMode,
};
use keel_execution::{
    IntentRequest, OrderManager, OrderManagerConfig, OrderRepository, RepositionConfig,
    SqliteExecutionStore, SubmitError,
};
use keel_risk::{CircuitBreaker, CircuitBreakerConfig, TradeBlock, TradingGate};
use keel_test_utils::{MockExchange, Scenario, ScenarioTrigger};
use rust_decimal_macros::dec;

struct Harness {
    exchange: MockExchange,
    store: Arc<SqliteExecutionStore>,
    breaker: Arc<CircuitBreaker>,
    gate: Arc<TradingGate>,
    manager: OrderManager,
}

fn harness(config: OrderManagerConfig) -> Result<Harness> {
    let exchange = MockExchange::default();
    harness_with(exchange.clone(), Arc::new(exchange), config)
}

fn harness_with(
    exchange: MockExchange,
    venue: Arc<dyn Exchange>,
    config: OrderManagerConfig,
) -> Result<Harness> {
    let store = Arc::new(SqliteExecutionStore::new_in_memory()?);
    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));
    let gate = Arc::new(TradingGate::new());
    let manager = OrderManager::new(
        venue,
        store.clone(),
        breaker.clone(),
        gate.clone(),
        config,
        TradingMode::Paper,
    );
    Ok(Harness {
        exchange,
        store,
        breaker,
        gate,
        manager,
    })
}

/// TTL of zero makes every order eligible for repositioning on the first poll.
fn eager_config() -> OrderManagerConfig {
    OrderManagerConfig {
        entry_ttl_secs: 0,
        exit_ttl_secs: 0,
        reposition: RepositionConfig {
            step_bps: dec!(10),
            max_cross_bps: dec!(25),
            max_reprices: 3,
            max_spread_pct: dec!(1),
        },
        ..OrderManagerConfig::default()
    }
}

fn no_books() -> impl BookSource {
    |_: &str| -> Option<BidAsk> { None }
}

fn entry(price: rust_decimal::Decimal) -> IntentRequest {
    IntentRequest::limit("XBTUSD", Side::Buy, OrderPurpose::Entry, price).with_quantity(dec!(1))
}

#[tokio::test]
async fn submitted_order_fills_and_completes_intent() -> Result<()> {
    let h = harness(OrderManagerConfig::default())?;
    h.exchange.state().set_quote("XBTUSD", dec!(100), dec!(100.1)).await;
    let intent_id = h.manager.submit_intent(entry(dec!(100))).await?;
    let orders = h.manager.active_orders();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].status, OrderStatus::Working);
    assert_eq!(orders[0].anchor_price, Some(dec!(100)));

    h.exchange
        .state()
        .fill_order(&orders[0].order_id, dec!(1), dec!(100), dec!(0.1))
        .await;
    let report = h.manager.poll_and_manage(&no_books()).await;
    assert_eq!(report.completed, 1);
    assert_eq!(h.manager.active_count(), 0);

    let stored = h.store.order(&orders[0].order_id)?.expect("persisted");
    assert_eq!(stored.status, OrderStatus::Filled);
    assert_eq!(stored.filled_quantity, dec!(1));
    let intent = h.store.intent(&intent_id)?.expect("intent");
    assert_eq!(intent.status, IntentStatus::Filled);
    Ok(())
}

#[tokio::test]
async fn expired_orders_reposition_as_a_chain() -> Result<()> {
    let h = harness(eager_config())?;
    h.exchange.state().set_quote("XBTUSD", dec!(100), dec!(100.2)).await;
    let intent_id = h.manager.submit_intent(entry(dec!(100))).await?;
    let first = h.manager.active_orders().remove(0);

    let report = h.manager.poll_and_manage(&no_books()).await;
    assert_eq!(report.repositioned, 1);
    let second = h.manager.active_orders().remove(0);
    assert_eq!(second.replace_count, 1);
    assert_eq!(second.parent_order_id.as_deref(), Some(first.order_id.as_str()));
    assert_eq!(second.limit_price, Some(dec!(100.1)));
    assert_eq!(second.client_order_id, format!("{intent_id}-r1"));
    assert_eq!(second.anchor_price, first.anchor_price);

    let parent = h.store.order(&first.order_id)?.expect("parent");
    assert_eq!(parent.status, OrderStatus::Replaced);
    assert_eq!(h.store.orders_for_intent(&intent_id)?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn reprices_stop_at_the_cap_and_exhaust_the_intent() -> Result<()> {
    let h = harness(OrderManagerConfig {
        reposition: RepositionConfig {
            step_bps: dec!(20),
            max_cross_bps: dec!(25),
            max_reprices: 10,
            max_spread_pct: dec!(1),
        },
        ..eager_config()
    })?;
    h.exchange.state().set_quote("XBTUSD", dec!(100), dec!(100.2)).await;
    let intent_id = h.manager.submit_intent(entry(dec!(100))).await?;

    for _ in 0..5 {
        h.manager.poll_and_manage(&no_books()).await;
    }
    assert_eq!(h.manager.active_count(), 0);
    let intent = h.store.intent(&intent_id)?.expect("intent");
    assert_eq!(intent.status, IntentStatus::Exhausted);
    for order in h.store.orders_for_intent(&intent_id)? {
        assert!(order.limit_price.expect("limit") <= dec!(100.25));
    }
    Ok(())
}

/// Venue where every order fills in full just as its cancel arrives.
struct FillsOnCancel(MockExchange);

#[async_trait]
impl Exchange for FillsOnCancel {
    fn name(&self) -> &str {
        "fills-on-cancel"
    }

    async fn account_balances(&self) -> BrokerResult<Vec<AccountBalance>> {
        self.0.account_balances().await
    }

    async fn holdings(&self) -> BrokerResult<Vec<Holding>> {
        self.0.holdings().await
    }

    async fn place_order(&self, request: PlaceOrderRequest) -> BrokerResult<OrderAck> {
        self.0.place_order(request).await
    }

    async fn get_order(&self, order_id: &str) -> BrokerResult<ExchangeOrder> {
        self.0.get_order(order_id).await
    }

    async fn order_fills(&self, order_id: &str) -> BrokerResult<Vec<Fill>> {
        self.0.order_fills(order_id).await
    }

    async fn cancel_order(&self, order_id: &str) -> BrokerResult<()> {
        let state = self.0.state();
        if let Some(request) = state.request(order_id).await {
            let qty = request.quantity.unwrap_or(dec!(1));
            let price = request.limit_price.unwrap_or(dec!(100));
            state.fill_order(order_id, qty, price, dec!(0)).await;
        }
        Ok(())
    }

    async fn best_bid_ask(&self, symbol: &str) -> BrokerResult<Option<BidAsk>> {
        self.0.best_bid_ask(symbol).await
    }
}

#[tokio::test]
async fn fill_racing_a_cancel_sends_no_replacement() -> Result<()> {
    let mock = MockExchange::default();
    let h = harness_with(mock.clone(), Arc::new(FillsOnCancel(mock)), eager_config())?;
    h.exchange.state().set_quote("XBTUSD", dec!(100), dec!(100.2)).await;
    let intent_id = h.manager.submit_intent(entry(dec!(100))).await?;

    let report = h.manager.poll_and_manage(&no_books()).await;
    assert_eq!(report.repositioned, 0);
    assert_eq!(report.completed, 1);

    assert_eq!(h.exchange.state().call_count("place_order").await, 1);
    let intent = h.store.intent(&intent_id)?.expect("intent");
    assert_eq!(intent.status, IntentStatus::Filled);
    Ok(())
}

#[tokio::test]
async fn failed_cancel_keeps_the_order_working() -> Result<()> {
    let h = harness(eager_config())?;
    h.exchange.state().set_quote("XBTUSD", dec!(100), dec!(100.2)).await;
    h.manager.submit_intent(entry(dec!(100))).await?;
    h.exchange
        .state()
        .scenarios()
        .push(Scenario::fail("cancel-down", ScenarioTrigger::CancelOrder, 503, "unavailable"))
        .await;

    let report = h.manager.poll_and_manage(&no_books()).await;
    assert_eq!(report.repositioned, 0);
    let order = h.manager.active_orders().remove(0);
    assert_eq!(order.status, OrderStatus::Working);
    assert_eq!(order.replace_count, 0);

    let report = h.manager.poll_and_manage(&no_books()).await;
    assert_eq!(report.repositioned, 1);
    Ok(())
}

#[tokio::test]
async fn wide_spread_cancels_with_liquidity_reason() -> Result<()> {
    let h = harness(eager_config())?;
    h.exchange.state().set_quote("XBTUSD", dec!(100), dec!(100.2)).await;
    let intent_id = h.manager.submit_intent(entry(dec!(100))).await?;
    let wide = |_: &str| -> Option<BidAsk> {
        Some(BidAsk {
            symbol: "XBTUSD".into(),
            bid: dec!(95),
            ask: dec!(105),
            observed_at: chrono::Utc::now(),
        })
    };
    let report = h.manager.poll_and_manage(&wide).await;
    assert_eq!(report.cancelled, 1);
    let intent = h.store.intent(&intent_id)?.expect("intent");
    assert_eq!(intent.status, IntentStatus::Exhausted);
    assert!(intent.detail.unwrap_or_default().contains("spread"));
    Ok(())
}

#[tokio::test]
async fn per_trade_and_daily_caps_reject_entries() -> Result<()> {
    let h = harness(OrderManagerConfig {
        max_trade_notional: Some(dec!(150)),
        max_daily_notional: Some(dec!(250)),
        ..OrderManagerConfig::default()
    })?;
    h.exchange.state().set_quote("XBTUSD", dec!(100), dec!(100.2)).await;

    let big = IntentRequest::market("XBTUSD", Side::Buy, OrderPurpose::Entry).with_notional(dec!(200));
    assert!(matches!(
        h.manager.submit_intent(big).await,
        Err(SubmitError::TradeNotional { excess, .. }) if excess == dec!(50)
    ));

    let sized = || IntentRequest::market("XBTUSD", Side::Buy, OrderPurpose::Entry).with_notional(dec!(120));
    h.manager.submit_intent(sized()).await?;
    h.manager.submit_intent(sized()).await?;
    assert!(matches!(
        h.manager.submit_intent(sized()).await,
        Err(SubmitError::DailyNotional { .. })
    ));

    // Exits ignore both caps.
    let exit = IntentRequest::market("XBTUSD", Side::Sell, OrderPurpose::Exit).with_notional(dec!(400));
    h.manager.submit_intent(exit).await?;
    Ok(())
}

#[tokio::test]
async fn daily_cap_counts_market_entries_sized_by_quantity() -> Result<()> {
    let h = harness(OrderManagerConfig {
        max_daily_notional: Some(dec!(150)),
        ..OrderManagerConfig::default()
    })?;
    h.exchange.state().set_quote("XBTUSD", dec!(100), dec!(100.2)).await;
    let buy = || IntentRequest::market("XBTUSD", Side::Buy, OrderPurpose::Entry).with_quantity(dec!(1));

    let intent_id = h.manager.submit_intent(buy()).await?;
    let intent = h.store.intent(&intent_id)?.expect("intent");
    assert_eq!(intent.estimated_notional, Some(dec!(100.1)));
    assert!(matches!(
        h.manager.submit_intent(buy()).await,
        Err(SubmitError::DailyNotional { used, .. }) if used == dec!(100.1)
    ));
    assert_eq!(h.exchange.state().call_count("place_order").await, 1);
    Ok(())
}

#[tokio::test]
async fn safe_mode_before_reposition_leaves_the_parent_cancelled() -> Result<()> {
    let h = harness(eager_config())?;
    h.exchange.state().set_quote("XBTUSD", dec!(100), dec!(100.2)).await;
    let intent_id = h.manager.submit_intent(entry(dec!(100))).await?;
    let first = h.manager.active_orders().remove(0);

    h.gate.enter_safe_mode("test", "stale feed", None);
    let report = h.manager.poll_and_manage(&no_books()).await;
    assert_eq!(report.cancelled, 1);
    assert_eq!(report.repositioned, 0);
    assert_eq!(h.manager.active_count(), 0);

    let parent = h.store.order(&first.order_id)?.expect("parent");
    assert_eq!(parent.status, OrderStatus::Cancelled);
    assert_eq!(h.store.orders_for_intent(&intent_id)?.len(), 1);
    assert_eq!(h.exchange.state().call_count("place_order").await, 1);
    let intent = h.store.intent(&intent_id)?.expect("intent");
    assert_eq!(intent.status, IntentStatus::Cancelled);
    Ok(())
}

#[tokio::test]
async fn gate_and_breaker_block_entries() -> Result<()> {
    let h = harness(OrderManagerConfig::default())?;
    h.exchange.state().set_quote("XBTUSD", dec!(100), dec!(100.2)).await;

    h.gate.enter_safe_mode("test", "stale feed", None);
    assert!(matches!(
        h.manager.submit_intent(entry(dec!(100))).await,
        Err(SubmitError::Gate(_))
    ));
    let exit = IntentRequest::market("XBTUSD", Side::Sell, OrderPurpose::Exit).with_quantity(dec!(1));
    h.manager.submit_intent(exit).await?;
    h.gate.clear_safe_mode("test");

    h.breaker.trip("manual test trip");
    assert!(matches!(
        h.manager.submit_intent(entry(dec!(100))).await,
        Err(SubmitError::Blocked(TradeBlock::BreakerOpen { .. }))
    ));
    Ok(())
}

#[tokio::test]
async fn rejected_placement_fails_the_intent() -> Result<()> {
    let h = harness(OrderManagerConfig::default())?;
    h.exchange.state().set_quote("XBTUSD", dec!(100), dec!(100.2)).await;
    h.exchange
        .state()
        .scenarios()
        .push(Scenario::fail("reject", ScenarioTrigger::PlaceOrder, 400, "bad lot size"))
        .await;
    let err = h.manager.submit_intent(entry(dec!(100))).await.unwrap_err();
    assert!(matches!(err, SubmitError::Exchange(_)));
    assert_eq!(h.manager.active_count(), 0);
    Ok(())
}

#[tokio::test]
async fn open_orders_survive_a_restart() -> Result<()> {
    let h = harness(OrderManagerConfig::default())?;
    h.exchange.state().set_quote("XBTUSD", dec!(100), dec!(100.2)).await;
    let intent_id = h.manager.submit_intent(entry(dec!(100))).await?;

    let restarted = OrderManager::new(
        Arc::new(h.exchange.clone()),
        h.store.clone(),
        h.breaker.clone(),
        h.gate.clone(),
        OrderManagerConfig::default(),
        TradingMode::Paper,
    );
    assert_eq!(restarted.recover_from_db()?, 1);
    assert_eq!(restarted.active_orders()[0].intent_id, intent_id);

    assert_eq!(restarted.cancel_intent(&intent_id).await?, 1);
    assert_eq!(restarted.active_count(), 0);
    let intent = h.store.intent(&intent_id)?.expect("intent");
    assert_eq!(intent.status, IntentStatus::Cancelled);
    assert!(matches!(
        restarted.cancel_intent("missing").await,
        Err(SubmitError::UnknownIntent(_))
    ));
    Ok(())
}
