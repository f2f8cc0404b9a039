use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use keel_core::{
    ManagedOrder, OrderPurpose, OrderStatus, OrderType, Quantity, Side, TradingMode,
};
use keel_execution::{OrderRepository, SqliteExecutionStore};
use keel_portfolio::{BalanceSnapshotStore, CashSnapshot, HoldingsSnapshot, SqlitePortfolioStore};
use keel_reconcile::{
    BootAuditStore, BootReconciler, BrokerReconciler, ReconcileConfig, ResumeDecision,
    SqliteReconcileStore, StateRebuilder,
};
use keel_risk::{GateState, TradingGate};
use keel_test_utils::{MockExchange, MockExchangeConfig, Scenario, ScenarioTrigger};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

struct Boot {
    exec: Arc<SqliteExecutionStore>,
    audit: Arc<SqliteReconcileStore>,
    reconciler: BootReconciler,
    gate: TradingGate,
}

fn boot(
    mode: TradingMode,
    exchange: MockExchange,
    cash: Decimal,
    holdings: &[(&str, Quantity)],
) -> Result<Boot> {
    let exec = Arc::new(SqliteExecutionStore::new_in_memory()?);
    let portfolio = Arc::new(SqlitePortfolioStore::new_in_memory()?);
    let audit = Arc::new(SqliteReconcileStore::new_in_memory()?);
    let now = Utc::now();
    portfolio.record_cash_snapshot(&CashSnapshot {
        mode,
        currency: "USD".into(),
        balance: cash,
        recorded_at: now,
    })?;
    portfolio.record_holdings_snapshot(&HoldingsSnapshot {
        mode,
        holdings: holdings
            .iter()
            .map(|(symbol, qty)| (symbol.to_string(), *qty))
            .collect::<BTreeMap<_, _>>(),
        recorded_at: now,
    })?;
    let config = ReconcileConfig::default();
    let reconciler = BootReconciler::new(
        config.clone(),
        StateRebuilder::new(mode, exec.clone(), exec.clone(), portfolio),
        BrokerReconciler::new(
            Arc::new(exchange),
            config.tolerances,
            config.quote_currency.clone(),
        ),
        audit.clone(),
    );
    Ok(Boot {
        exec,
        audit,
        reconciler,
        gate: TradingGate::new(),
    })
}

fn exchange(cash: Decimal, holdings: &[(&str, Quantity)]) -> MockExchange {
    MockExchange::new(MockExchangeConfig {
        balances: vec![("USD".into(), cash)],
        holdings: holdings
            .iter()
            .map(|(symbol, qty)| (symbol.to_string(), *qty))
            .collect(),
        ..MockExchangeConfig::default()
    })
}

fn working_order(order_id: &str) -> ManagedOrder {
    let now = Utc::now();
    ManagedOrder {
        order_id: order_id.into(),
        client_order_id: "boot-r0".into(),
        intent_id: "boot".into(),
        symbol: "XBTUSD".into(),
        side: Side::Buy,
        order_type: OrderType::Limit,
        purpose: OrderPurpose::Entry,
        notional: Some(dec!(50)),
        quantity: None,
        limit_price: Some(dec!(100)),
        anchor_price: Some(dec!(100)),
        status: OrderStatus::Working,
        replace_count: 0,
        parent_order_id: None,
        filled_quantity: Decimal::ZERO,
        avg_fill_price: None,
        submitted_at: now,
        ttl_secs: 60,
        updated_at: now,
        mode: TradingMode::Live,
    }
}

#[tokio::test]
async fn matching_live_state_resumes_normally() -> Result<()> {
    let holdings = [("XBTUSD", dec!(0.5))];
    let boot = boot(
        TradingMode::Live,
        exchange(dec!(1000), &holdings),
        dec!(1000),
        &holdings,
    )?;
    let record = boot.reconciler.run(&boot.gate).await?;
    assert_eq!(record.decision, ResumeDecision::Normal);
    assert!(record.failed_checks().next().is_none());
    assert_eq!(boot.gate.state(), GateState::Normal);
    assert_eq!(
        boot.audit.latest_audit(TradingMode::Live)?.map(|r| r.run_id),
        Some(record.run_id)
    );
    Ok(())
}

#[tokio::test]
async fn cash_drift_inside_tolerance_enters_safe_mode() -> Result<()> {
    let boot = boot(TradingMode::Live, exchange(dec!(1000.4), &[]), dec!(1000), &[])?;
    let record = boot.reconciler.run(&boot.gate).await?;
    assert_eq!(record.decision.label(), "SAFE_MODE");
    assert!(boot.gate.permits(OrderPurpose::Exit).is_ok());
    assert!(boot.gate.permits(OrderPurpose::Entry).is_err());
    Ok(())
}

#[tokio::test]
async fn orphaned_live_position_halts() -> Result<()> {
    let boot = boot(
        TradingMode::Live,
        exchange(dec!(1000), &[]),
        dec!(1000),
        &[("SOLUSD", dec!(12))],
    )?;
    let record = boot.reconciler.run(&boot.gate).await?;
    let diff = record.diff.clone().expect("live boot diffs the broker");
    assert_eq!(diff.orphaned, vec!["SOLUSD".to_string()]);
    assert!(matches!(record.decision, ResumeDecision::Halt { .. }));
    assert!(matches!(boot.gate.state(), GateState::Halted { .. }));
    assert!(boot.gate.permits(OrderPurpose::Exit).is_err());
    Ok(())
}

#[tokio::test]
async fn open_order_unknown_to_the_broker_halts() -> Result<()> {
    let boot = boot(TradingMode::Live, exchange(dec!(1000), &[]), dec!(1000), &[])?;
    boot.exec.upsert_order(&working_order("O-404"))?;
    let record = boot.reconciler.run(&boot.gate).await?;
    let failed: Vec<_> = record.failed_checks().map(|c| c.name.clone()).collect();
    assert_eq!(failed, vec!["no_unknown_orders".to_string()]);
    assert_eq!(record.local.open_orders.len(), 1);
    assert_eq!(record.decision.label(), "HALT");
    Ok(())
}

#[tokio::test]
async fn unreachable_broker_halts_with_an_audit_entry() -> Result<()> {
    let mock = exchange(dec!(1000), &[]);
    mock.state()
        .scenarios()
        .push(Scenario::fail(
            "balances down",
            ScenarioTrigger::AccountBalances,
            503,
            "maintenance",
        ))
        .await;
    let boot = boot(TradingMode::Live, mock, dec!(1000), &[])?;
    let record = boot.reconciler.run(&boot.gate).await?;
    assert_eq!(record.decision.label(), "HALT");
    assert!(record.error.is_some());
    assert!(record.diff.is_none());
    assert_eq!(boot.audit.recent_audits(10)?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn paper_mode_never_calls_the_broker() -> Result<()> {
    let mock = exchange(dec!(5), &[("DOTUSD", dec!(3))]);
    let state = mock.state();
    let boot = boot(TradingMode::Paper, mock, dec!(1000), &[("XBTUSD", dec!(1))])?;
    let record = boot.reconciler.run(&boot.gate).await?;
    assert_eq!(record.decision, ResumeDecision::Normal);
    assert!(record.diff.is_none());
    assert_eq!(state.call_count("account_balances").await, 0);
    assert_eq!(state.call_count("holdings").await, 0);
    Ok(())
}

#[tokio::test]
async fn dry_run_records_nothing() -> Result<()> {
    let boot = boot(TradingMode::Live, exchange(dec!(900), &[]), dec!(1000), &[])?;
    let record = boot.reconciler.evaluate().await?;
    assert_eq!(record.decision.label(), "HALT");
    assert_eq!(boot.gate.state(), GateState::Normal);
    assert!(boot.audit.recent_audits(10)?.is_empty());
    Ok(())
}
