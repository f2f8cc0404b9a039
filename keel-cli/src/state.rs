use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{SecondsFormat, Utc};
use keel_broker::EventBus;
use keel_config::AppConfig;
use keel_core::TradingMode;
use keel_portfolio::{roi, CashEventLedger, DailyPnlSnapshot, FeeTracker, PnlService};
use keel_reconcile::{
    load_json, BootAuditRecord, BootAuditStore, BootReconciler, BrokerReconciler, LocalState,
    ResumeDecision, StateRebuilder, BREAKER_STATE_KEY,
};
use keel_risk::BreakerSnapshot;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::to_string_pretty;

use crate::live::{build_exchange, Stores};

const MAX_ORDER_ROWS: usize = 5;

#[derive(Serialize)]
struct StateReport {
    local: LocalState,
    breaker: Option<BreakerSnapshot>,
    last_boot: Option<BootAuditRecord>,
}

/// Print what the database says without touching the exchange.
pub async fn inspect_state(config: &AppConfig, raw: bool) -> Result<()> {
    let path = config.database_path.clone();
    let mode = config.mode;
    let report = tokio::task::spawn_blocking(move || -> Result<StateReport> {
        let stores = Stores::open(&path)?;
        let local = StateRebuilder::new(
            mode,
            stores.execution.clone(),
            stores.execution.clone(),
            stores.portfolio.clone(),
        )
        .rebuild()?;
        let breaker = load_json(stores.reconcile.as_ref(), BREAKER_STATE_KEY)?;
        let last_boot = stores.reconcile.latest_audit(mode)?;
        Ok(StateReport {
            local,
            breaker,
            last_boot,
        })
    })
    .await
    .map_err(|err| anyhow!("state inspection task failed: {err}"))??;

    if raw {
        println!("{}", to_string_pretty(&report)?);
    } else {
        print_summary(&config.database_path, &report);
    }
    Ok(())
}

fn print_summary(path: &Path, report: &StateReport) {
    let local = &report.local;
    println!("State database: {}", path.display());
    println!("Mode: {}", local.mode);
    match (local.cash, local.cash_recorded_at) {
        (Some(cash), Some(at)) => println!(
            "Cash: {cash} (recorded {})",
            at.to_rfc3339_opts(SecondsFormat::Secs, true)
        ),
        _ => println!("Cash: <no snapshot>"),
    }
    println!(
        "Holdings ({} symbol(s), from {}):",
        local.holdings.len(),
        local.holdings_source
    );
    if local.holdings.is_empty() {
        println!("  none");
    }
    for (symbol, quantity) in &local.holdings {
        println!("  {symbol}: {quantity}");
    }
    println!("Entry notional used today: {}", local.daily_notional_used);

    println!("Open orders ({} total):", local.open_orders.len());
    if local.open_orders.is_empty() {
        println!("  none");
    }
    for order in local.open_orders.iter().take(MAX_ORDER_ROWS) {
        println!(
            "  {} {} {} {} limit={:?} status={} reprices={}",
            order.order_id,
            order.symbol,
            order.side,
            order.purpose.as_str(),
            order.limit_price,
            order.status.as_str(),
            order.replace_count
        );
    }
    if local.open_orders.len() > MAX_ORDER_ROWS {
        println!(
            "  ... {} additional order(s) omitted",
            local.open_orders.len() - MAX_ORDER_ROWS
        );
    }

    match &report.breaker {
        Some(breaker) => println!(
            "Circuit breaker: {} (losses in a row {}, daily realized {}, trips {})",
            breaker.state.label(),
            breaker.consecutive_losses,
            breaker.daily_realized_pnl,
            breaker.trip_count
        ),
        None => println!("Circuit breaker: <never persisted>"),
    }
    match &report.last_boot {
        Some(record) => println!(
            "Last boot: {} at {} ({})",
            record.decision.label(),
            record.finished_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            record.run_id
        ),
        None => println!("Last boot: <none>"),
    }
}

/// Run boot reconciliation without recording it or touching the trading gate.
pub async fn reconcile_dry_run(config: &AppConfig, json: bool) -> Result<()> {
    let stores = Stores::open(&config.database_path)?;
    let bus = Arc::new(EventBus::new());
    let bundle = build_exchange(config, &bus)?;
    let reconciler = BootReconciler::new(
        config.reconcile_config(),
        StateRebuilder::new(
            config.mode,
            stores.execution.clone(),
            stores.execution.clone(),
            stores.portfolio.clone(),
        ),
        BrokerReconciler::new(
            bundle.exchange,
            config.reconcile.tolerances,
            config.exchange.quote_currency.clone(),
        ),
        stores.reconcile.clone(),
    );
    let record = reconciler.evaluate().await?;
    if json {
        println!("{}", to_string_pretty(&record)?);
    } else {
        print_audit(&record);
    }
    Ok(())
}

fn print_audit(record: &BootAuditRecord) {
    println!("Run {} ({} mode, {} ms)", record.run_id, record.mode, record.duration_ms);
    match &record.decision {
        ResumeDecision::Normal => println!("Decision: NORMAL"),
        ResumeDecision::SafeMode { until, reason } => println!(
            "Decision: SAFE_MODE until {} ({reason})",
            until.to_rfc3339_opts(SecondsFormat::Secs, true)
        ),
        ResumeDecision::Halt { reason } => println!("Decision: HALT ({reason})"),
    }
    if let Some(err) = &record.error {
        println!("Broker error: {err}");
    }
    match &record.diff {
        Some(diff) => {
            println!(
                "Cash: local {} vs broker {} {} (diff {})",
                diff.local_cash, diff.broker_cash, diff.currency, diff.cash_diff
            );
            for quantity in &diff.quantity_diffs {
                println!(
                    "  {}: local {} vs broker {} (diff {})",
                    quantity.symbol, quantity.local, quantity.broker, quantity.diff
                );
            }
            if !diff.orphaned.is_empty() {
                println!("Orphaned locally: {}", diff.orphaned.join(", "));
            }
            if !diff.missing.is_empty() {
                println!("Missing locally: {}", diff.missing.join(", "));
            }
            if !diff.unknown_orders.is_empty() {
                println!("Unknown to broker: {}", diff.unknown_orders.join(", "));
            }
        }
        None => println!("Broker comparison: skipped"),
    }
    println!("Checks:");
    for check in &record.checks {
        let mark = if check.passed { "ok  " } else { "FAIL" };
        println!("  [{mark}] {}: {}", check.name, check.detail);
    }
}

#[derive(Serialize)]
struct PnlReport {
    mode: TradingMode,
    fees_today: Decimal,
    fees_total: Decimal,
    net_deposits: Decimal,
    roi_pct: Option<Decimal>,
    daily: Vec<DailyPnlSnapshot>,
}

/// Fees, deposits and the most recent daily P&L rows.
pub async fn pnl_report(config: &AppConfig, days: usize, json: bool) -> Result<()> {
    let path = config.database_path.clone();
    let mode = config.mode;
    let instance_id = config.live.instance_id.clone();
    let report = tokio::task::spawn_blocking(move || -> Result<PnlReport> {
        let stores = Stores::open(&path)?;
        let fees = FeeTracker::new(stores.portfolio.clone());
        let cash = CashEventLedger::new(stores.portfolio.clone());
        let daily = PnlService::new(stores.portfolio.clone(), instance_id).recent(mode, days)?;
        let net_deposits = cash.net_deposits(mode)?;
        let roi_pct = daily
            .first()
            .and_then(|latest| roi(latest.equity, net_deposits));
        Ok(PnlReport {
            mode,
            fees_today: fees.fees_today(mode, Utc::now())?,
            fees_total: fees.total_fees(mode)?,
            net_deposits,
            roi_pct,
            daily,
        })
    })
    .await
    .map_err(|err| anyhow!("pnl report task failed: {err}"))??;

    if json {
        println!("{}", to_string_pretty(&report)?);
        return Ok(());
    }
    println!("Mode: {}", report.mode);
    println!("Fees today: {}", report.fees_today);
    println!("Fees total: {}", report.fees_total);
    println!("Net deposits: {}", report.net_deposits);
    match report.roi_pct {
        Some(roi) => println!("ROI: {:.2}%", roi),
        None => println!("ROI: n/a"),
    }
    println!("Daily snapshots ({}):", report.daily.len());
    if report.daily.is_empty() {
        println!("  none");
    }
    for row in &report.daily {
        println!(
            "  {} equity={} cash={} realized={} unrealized={} fees={} positions={}",
            row.date,
            row.equity.round_dp(2),
            row.cash.round_dp(2),
            row.realized_pnl.round_dp(2),
            row.unrealized_pnl.round_dp(2),
            row.cumulative_fees.round_dp(2),
            row.position_count
        );
    }
    Ok(())
}
