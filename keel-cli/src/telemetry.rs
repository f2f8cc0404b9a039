use std::convert::Infallible;
use std::fs::{self, OpenOptions};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use hyper::body::Body;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Request, Response, StatusCode};
use keel_core::{MarketTier, Price};
use keel_execution::FillSource;
use keel_reconcile::BrokerDiff;
use keel_risk::{BreakerState, GateState};
use prometheus::core::Collector;
use prometheus::{
    Encoder, Gauge, GaugeVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use rust_decimal::prelude::ToPrimitive;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

const BREAKER_STATES: [&str; 3] = ["closed", "open", "half_open"];
const GATE_STATES: [&str; 3] = ["normal", "safe_mode", "halted"];

/// Install the global tracing subscriber, adding a JSON file layer when a path is given.
pub fn init_tracing(filter: &str, log_path: Option<&Path>) -> Result<()> {
    let stdout_layer = fmt::layer()
        .with_target(false)
        .with_filter(EnvFilter::new(filter));
    let Some(path) = log_path else {
        tracing_subscriber::registry().with(stdout_layer).try_init()?;
        return Ok(());
    };
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create log directory {dir:?}"))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(file);
    let _ = FILE_GUARD.set(guard);
    let file_layer = fmt::layer()
        .json()
        .with_ansi(false)
        .with_target(true)
        .with_writer(writer)
        .with_filter(EnvFilter::new(filter));
    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .try_init()?;
    Ok(())
}

fn to_f64(value: Price) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

/// Prometheus metrics exported by the live runtime.
pub struct LiveMetrics {
    registry: Registry,
    fills_total: IntCounterVec,
    duplicate_fills: IntGauge,
    dropped_messages: IntGauge,
    orders_submitted: IntCounter,
    repositions: IntCounter,
    order_failures: IntCounter,
    equity: Gauge,
    realized_pnl: Gauge,
    breaker_state: GaugeVec,
    gate_state: GaugeVec,
    cash_diff: GaugeVec,
    quantity_diff: GaugeVec,
    snapshot_writes: IntCounterVec,
}

impl LiveMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let fills_total = IntCounterVec::new(
            Opts::new("keel_fills_total", "Fills applied to the ledger"),
            &["source"],
        )?;
        let duplicate_fills = IntGauge::new(
            "keel_duplicate_fills_total",
            "Redelivered fills skipped by deduplication",
        )?;
        let dropped_messages = IntGauge::new(
            "keel_fill_queue_dropped_total",
            "Execution messages dropped because the fill queue was full",
        )?;
        let orders_submitted =
            IntCounter::new("keel_orders_submitted_total", "Orders sent to the exchange")?;
        let repositions =
            IntCounter::new("keel_repositions_total", "Limit orders cancelled and repriced")?;
        let order_failures = IntCounter::new(
            "keel_order_failures_total",
            "Intents that ended failed or exhausted",
        )?;
        let equity = Gauge::new("keel_equity", "Marked-to-market equity")?;
        let realized_pnl = Gauge::new("keel_realized_pnl", "Realized P&L net of fees")?;
        let breaker_state = GaugeVec::new(
            Opts::new("keel_circuit_breaker_state", "1 for the breaker's current state"),
            &["state"],
        )?;
        let gate_state = GaugeVec::new(
            Opts::new("keel_trading_gate_state", "1 for the trading gate's current state"),
            &["state"],
        )?;
        let cash_diff = GaugeVec::new(
            Opts::new(
                "keel_reconciliation_cash_diff",
                "Broker cash minus local cash at the last reconciliation",
            ),
            &["currency"],
        )?;
        let quantity_diff = GaugeVec::new(
            Opts::new(
                "keel_reconciliation_quantity_diff",
                "Broker quantity minus local quantity at the last reconciliation",
            ),
            &["symbol"],
        )?;
        let snapshot_writes = IntCounterVec::new(
            Opts::new("keel_market_snapshot_writes_total", "Coalesced snapshots persisted"),
            &["tier"],
        )?;

        let collectors: [Box<dyn Collector>; 13] = [
            Box::new(fills_total.clone()),
            Box::new(duplicate_fills.clone()),
            Box::new(dropped_messages.clone()),
            Box::new(orders_submitted.clone()),
            Box::new(repositions.clone()),
            Box::new(order_failures.clone()),
            Box::new(equity.clone()),
            Box::new(realized_pnl.clone()),
            Box::new(breaker_state.clone()),
            Box::new(gate_state.clone()),
            Box::new(cash_diff.clone()),
            Box::new(quantity_diff.clone()),
            Box::new(snapshot_writes.clone()),
        ];
        for collector in collectors {
            registry.register(collector)?;
        }

        Ok(Self {
            registry,
            fills_total,
            duplicate_fills,
            dropped_messages,
            orders_submitted,
            repositions,
            order_failures,
            equity,
            realized_pnl,
            breaker_state,
            gate_state,
            cash_diff,
            quantity_diff,
            snapshot_writes,
        })
    }

    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    /// Text exposition of every registered metric.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    pub fn inc_fill(&self, source: FillSource) {
        self.fills_total.with_label_values(&[source.as_str()]).inc();
    }

    pub fn set_fill_stream_counters(&self, duplicates: u64, dropped: u64) {
        self.duplicate_fills
            .set(i64::try_from(duplicates).unwrap_or(i64::MAX));
        self.dropped_messages
            .set(i64::try_from(dropped).unwrap_or(i64::MAX));
    }

    pub fn inc_order(&self) {
        self.orders_submitted.inc();
    }

    pub fn inc_reposition(&self) {
        self.repositions.inc();
    }

    pub fn inc_order_failure(&self) {
        self.order_failures.inc();
    }

    pub fn update_equity(&self, equity: Price, realized: Price) {
        self.equity.set(to_f64(equity));
        self.realized_pnl.set(to_f64(realized));
    }

    pub fn update_breaker(&self, state: &BreakerState) {
        for label in BREAKER_STATES {
            let value = if label == state.label() { 1.0 } else { 0.0 };
            self.breaker_state.with_label_values(&[label]).set(value);
        }
    }

    pub fn update_gate(&self, state: &GateState) {
        for label in GATE_STATES {
            let value = if label == state.label() { 1.0 } else { 0.0 };
            self.gate_state.with_label_values(&[label]).set(value);
        }
    }

    pub fn update_reconciliation(&self, diff: &BrokerDiff) {
        self.cash_diff
            .with_label_values(&[diff.currency.as_str()])
            .set(to_f64(diff.cash_diff));
        for quantity in &diff.quantity_diffs {
            self.quantity_diff
                .with_label_values(&[quantity.symbol.as_str()])
                .set(to_f64(quantity.diff));
        }
    }

    pub fn inc_snapshot_writes(&self, tier: MarketTier, count: usize) {
        self.snapshot_writes
            .with_label_values(&[tier.as_str()])
            .inc_by(u64::try_from(count).unwrap_or(u64::MAX));
    }
}

/// Serve `/metrics` until the shutdown flag flips.
pub fn spawn_metrics_server(
    registry: Registry,
    addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let make_svc = make_service_fn(move |_| {
            let registry = registry.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |_req: Request<Body>| {
                    let registry = registry.clone();
                    async move { Ok::<_, Infallible>(metrics_response(&registry)) }
                }))
            }
        });

        let server = match hyper::Server::try_bind(&addr) {
            Ok(builder) => builder.serve(make_svc),
            Err(err) => {
                error!(error = %err, %addr, "failed to bind metrics server");
                return;
            }
        };
        info!(%addr, "metrics server listening");
        let graceful = server.with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        });
        if let Err(err) = graceful.await {
            error!(error = %err, %addr, "metrics server terminated");
        } else {
            info!(%addr, "metrics server shutdown");
        }
    })
}

fn metrics_response(registry: &Registry) -> Response<Body> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&registry.gather(), &mut buffer) {
        error!(error = %err, "failed to encode Prometheus metrics");
        let mut response = Response::new(Body::from("failed to encode metrics"));
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        return response;
    }
    let mut response = Response::new(Body::from(buffer));
    if let Ok(content_type) = HeaderValue::from_str(encoder.format_type()) {
        response.headers_mut().insert(CONTENT_TYPE, content_type);
    }
    response
}
