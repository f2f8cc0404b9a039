use std::time::Duration;

use keel_broker::{BrokerError, Exchange, GuardedExchange, PlaceOrderRequest, RateLimiter, RetryPolicy};
use keel_core::{OrderType, Side};
use keel_test_utils::{MockExchange, Scenario, ScenarioTrigger};
use rust_decimal_macros::dec;

fn guarded(mock: &MockExchange) -> GuardedExchange<MockExchange> {
    let limiter = RateLimiter::new(100, Duration::from_millis(10)).unwrap();
    let retry = RetryPolicy {
        max_attempts: 3,
        base_delay_ms: 100,
        max_delay_ms: 1_000,
        call_timeout_ms: 500,
    };
    GuardedExchange::new(mock.clone(), limiter, retry)
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried() {
    let mock = MockExchange::default();
    let scenarios = mock.state().scenarios();
    scenarios
        .push(Scenario::fail("reset", ScenarioTrigger::AccountBalances, 0, "connection reset"))
        .await;
    scenarios
        .push(Scenario::fail("gateway", ScenarioTrigger::AccountBalances, 502, "bad gateway"))
        .await;
    let exchange = guarded(&mock);
    let balances = exchange.account_balances().await.unwrap();
    assert_eq!(balances[0].total, dec!(10000));
    assert_eq!(mock.state().call_count("account_balances").await, 3);
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_max_attempts() {
    let mock = MockExchange::default();
    let scenarios = mock.state().scenarios();
    for _ in 0..4 {
        scenarios
            .push(Scenario::fail("limit", ScenarioTrigger::Holdings, 429, "slow down"))
            .await;
    }
    let err = guarded(&mock).holdings().await.unwrap_err();
    assert!(matches!(err, BrokerError::RateLimited(_)));
    assert_eq!(mock.state().call_count("holdings").await, 3);
    assert_eq!(scenarios.pending().await, 1);
}

#[tokio::test(start_paused = true)]
async fn business_errors_are_not_retried() {
    let mock = MockExchange::default();
    let err = guarded(&mock).get_order("missing").await.unwrap_err();
    assert!(matches!(err, BrokerError::NotFound(_)));
    assert_eq!(mock.state().call_count("get_order").await, 1);
}

#[tokio::test(start_paused = true)]
async fn slow_calls_time_out_and_retry() {
    let mock = MockExchange::default();
    mock.state()
        .scenarios()
        .push(Scenario::delay("stall", ScenarioTrigger::Quote, Duration::from_secs(5)))
        .await;
    mock.state().set_quote("XBTUSD", dec!(99), dec!(101)).await;
    let quote = guarded(&mock).best_bid_ask("XBTUSD").await.unwrap();
    assert_eq!(quote.map(|q| q.mid()), Some(dec!(100)));
    assert_eq!(mock.state().call_count("best_bid_ask").await, 2);
}

#[tokio::test(start_paused = true)]
async fn invalid_orders_never_reach_the_exchange() {
    let mock = MockExchange::default();
    let request = PlaceOrderRequest {
        symbol: "XBTUSD".into(),
        side: Side::Buy,
        order_type: OrderType::Limit,
        client_order_id: "i-r0".into(),
        quantity: Some(dec!(1)),
        notional: None,
        limit_price: None,
    };
    let err = guarded(&mock).place_order(request).await.unwrap_err();
    assert!(matches!(err, BrokerError::InvalidRequest(_)));
    assert_eq!(mock.state().call_count("place_order").await, 0);
}
