use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use futures::future::join_all;
use keel_broker::{BookSource, EventBus, Exchange, GuardedExchange, RateLimiter};
use keel_config::AppConfig;
use keel_core::{IntentStatus, MarketSnapshot, MarketTier, Symbol, TradingMode};
use keel_execution::{FillEvent, FillStreamService, OrderEvent, OrderManager, SqliteExecutionStore};
use keel_markets::{
    Coalescer, FocusManager, Market, MarketCatalog, MoverDetector, SnapshotSink, SnapshotStore,
    SnapshotWriter, SqliteMarketStore,
};
use keel_paper::{PaperExchange, PaperTicker};
use keel_portfolio::{
    BalanceSnapshotStore, CashEventLedger, CashEventType, CashSnapshot, EquityBreakdown,
    EquityCalculator, FeeTracker, HoldingsSnapshot, PnlService, QuoteSource,
    SqlitePortfolioStore,
};
use keel_reconcile::{
    load_json, save_json, BootAuditRecord, BootReconciler, BrokerReconciler, SqliteReconcileStore,
    StateRebuilder, BREAKER_STATE_KEY,
};
use keel_risk::{
    BreakerSnapshot, ChannelKind, CircuitBreaker, HeartbeatMonitor, TradingGate,
    EXECUTION_CHANNEL, MARKET_DATA_CHANNEL,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::alerts::AlertDispatcher;
use crate::engine::TradingEngine;
use crate::telemetry::{spawn_metrics_server, LiveMetrics};

/// Cash-event reference of the simulated starting balance, so it is only deposited once.
const PAPER_SEED_REF: &str = "paper:initial_cash";

/// Cooperative shutdown flag shared by every background loop.
#[derive(Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Resolves once [`Self::trigger`] has been called.
    pub async fn wait(&self) {
        let mut rx = self.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Every SQLite store the runtime writes to, opened on the same database file.
#[derive(Clone)]
pub struct Stores {
    pub execution: Arc<SqliteExecutionStore>,
    pub portfolio: Arc<SqlitePortfolioStore>,
    pub markets: Arc<SqliteMarketStore>,
    pub reconcile: Arc<SqliteReconcileStore>,
}

impl Stores {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create database directory {dir:?}"))?;
        }
        Ok(Self {
            execution: Arc::new(SqliteExecutionStore::new(path)?),
            portfolio: Arc::new(SqlitePortfolioStore::new(path)?),
            markets: Arc::new(SqliteMarketStore::new(path)?),
            reconcile: Arc::new(SqliteReconcileStore::new(path)?),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            execution: Arc::new(SqliteExecutionStore::new_in_memory()?),
            portfolio: Arc::new(SqlitePortfolioStore::new_in_memory()?),
            markets: Arc::new(SqliteMarketStore::new_in_memory()?),
            reconcile: Arc::new(SqliteReconcileStore::new_in_memory()?),
        })
    }
}

/// Exchange handle plus the simulator behind it, when the driver is `paper`.
pub struct ExchangeBundle {
    pub exchange: Arc<dyn Exchange>,
    pub paper: Option<Arc<PaperExchange>>,
}

/// Apply the shared rate limiter and retry policy to an exchange binding.
pub fn guard_exchange<E>(inner: E, config: &AppConfig) -> Result<Arc<dyn Exchange>>
where
    E: Exchange + 'static,
{
    let limiter = RateLimiter::new(
        config.rate_limit.capacity,
        StdDuration::from_millis(config.rate_limit.refill_ms),
    )?;
    Ok(Arc::new(GuardedExchange::new(
        inner,
        limiter,
        config.retry.clone(),
    )))
}

pub fn build_exchange(config: &AppConfig, bus: &Arc<EventBus>) -> Result<ExchangeBundle> {
    match config.exchange.driver.as_str() {
        "paper" => {
            let paper =
                Arc::new(PaperExchange::new(config.exchange.paper.clone()).with_bus(bus.clone()));
            Ok(ExchangeBundle {
                exchange: guard_exchange(paper.clone(), config)?,
                paper: Some(paper),
            })
        }
        other => bail!(
            "exchange driver '{other}' is not bundled with this build; only 'paper' is available"
        ),
    }
}

/// Counts persisted snapshots per tier on their way to the writer.
struct MeteredSink {
    inner: Arc<SnapshotWriter>,
    metrics: Arc<LiveMetrics>,
}

#[async_trait]
impl SnapshotSink for MeteredSink {
    async fn write_snapshots(&self, tier: MarketTier, snapshots: Vec<MarketSnapshot>) -> Result<()> {
        let count = snapshots.len();
        self.inner.write_snapshots(tier, snapshots).await?;
        self.metrics.inc_snapshot_writes(tier, count);
        Ok(())
    }
}

/// Catalog file first (mirrored into the database), then the stored catalog,
/// then the paper simulator's symbols.
fn load_catalog(config: &AppConfig, store: &dyn SnapshotStore) -> Result<Option<MarketCatalog>> {
    if let Some(path) = config.market_data.catalog_file.as_ref() {
        if path.exists() {
            let catalog = MarketCatalog::load_from_file(path)
                .with_context(|| format!("failed to load market catalog {}", path.display()))?;
            store.save_catalog(&catalog.markets())?;
            info!(markets = catalog.len(), path = %path.display(), "market catalog loaded");
            return Ok(Some(catalog));
        }
        warn!(path = %path.display(), "market catalog file not found");
    }
    let stored = store.catalog()?;
    if !stored.is_empty() {
        return Ok(Some(MarketCatalog::from_markets(stored)?));
    }
    if config.is_paper() {
        let quote = config.exchange.quote_currency.as_str();
        let markets: Vec<Market> = config
            .exchange
            .paper
            .market
            .start_prices
            .keys()
            .map(|symbol| Market {
                symbol: symbol.clone(),
                base: symbol.strip_suffix(quote).unwrap_or(symbol).to_string(),
                quote: quote.to_string(),
                tick_size: None,
                lot_size: None,
                min_notional: None,
                tradable: true,
            })
            .collect();
        if !markets.is_empty() {
            return Ok(Some(MarketCatalog::from_markets(markets)?));
        }
    }
    Ok(None)
}

/// Periodic valuation: feeds the breaker, keeps positions in focus, records
/// balance snapshots and the daily P&L row, and rolls the trading day.
pub struct Accounting {
    mode: TradingMode,
    quote_currency: String,
    engine: TradingEngine,
    breaker: Arc<CircuitBreaker>,
    gate: Arc<TradingGate>,
    focus: Arc<FocusManager>,
    balances: Arc<dyn BalanceSnapshotStore>,
    cash: CashEventLedger,
    pnl: PnlService,
    metrics: Arc<LiveMetrics>,
    trading_day: Mutex<Option<NaiveDate>>,
}

impl Accounting {
    pub async fn refresh(&self, now: DateTime<Utc>) -> Result<EquityBreakdown> {
        let breakdown = self.engine.equity().await?;
        self.breaker.update_equity(breakdown.equity);
        self.breaker.set_exposures(breakdown.exposures());
        self.focus
            .set_positions(breakdown.positions.iter().map(|p| p.symbol.clone()));
        for symbol in self.focus.expire(now) {
            info!(symbol = %symbol, "mover promotion expired");
        }

        self.balances.record_cash_snapshot(&CashSnapshot {
            mode: self.mode,
            currency: self.quote_currency.clone(),
            balance: breakdown.cash,
            recorded_at: now,
        })?;
        let holdings: BTreeMap<Symbol, Decimal> = breakdown
            .positions
            .iter()
            .map(|p| (p.symbol.clone(), p.quantity))
            .collect();
        self.balances.record_holdings_snapshot(&HoldingsSnapshot {
            mode: self.mode,
            holdings,
            recorded_at: now,
        })?;

        let today = now.date_naive();
        let previous = self.trading_day.lock().replace(today);
        if previous.is_some_and(|day| day != today) {
            info!(%today, equity = %breakdown.equity, "new trading day");
            self.breaker.reset_daily(Some(breakdown.equity));
        }
        let net_deposits = self.cash.net_deposits(self.mode)?;
        let snapshot = self.pnl.compute_snapshot(&breakdown, net_deposits, today);
        self.pnl.write_snapshot(&snapshot)?;

        self.metrics
            .update_equity(breakdown.equity, breakdown.realized_pnl);
        self.metrics.update_breaker(&self.breaker.state());
        self.metrics.update_gate(&self.gate.state());
        Ok(breakdown)
    }

    fn spawn(self: Arc<Self>, period: StdDuration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = self.refresh(Utc::now()).await {
                            warn!(error = %format!("{err:#}"), "equity refresh failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}

fn persist_breaker(store: &SqliteReconcileStore, breaker: &CircuitBreaker) {
    if let Err(err) = save_json(store, BREAKER_STATE_KEY, &breaker.snapshot()) {
        warn!(error = %format!("{err:#}"), "failed to persist circuit breaker state");
    }
}

fn spawn_breaker_persistence(
    store: Arc<SqliteReconcileStore>,
    breaker: Arc<CircuitBreaker>,
    period: StdDuration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => persist_breaker(&store, &breaker),
                _ = shutdown.changed() => break,
            }
        }
    })
}

fn spawn_order_metrics(
    mut events: broadcast::Receiver<OrderEvent>,
    metrics: Arc<LiveMetrics>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(OrderEvent::Submitted { .. }) => metrics.inc_order(),
                    Ok(OrderEvent::Repositioned { .. }) => metrics.inc_reposition(),
                    Ok(OrderEvent::IntentCompleted {
                        status: IntentStatus::Failed | IntentStatus::Exhausted,
                        ..
                    }) => metrics.inc_order_failure(),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "order metrics lagged"),
                    Err(RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }
    })
}

fn spawn_fill_metrics(
    mut events: broadcast::Receiver<FillEvent>,
    fills: Arc<FillStreamService>,
    metrics: Arc<LiveMetrics>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        metrics.inc_fill(event.source);
                        metrics.set_fill_stream_counters(fills.duplicates(), fills.dropped());
                    }
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "fill metrics lagged"),
                    Err(RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }
    })
}

/// Fully wired trading core. Building it runs boot reconciliation; nothing
/// trades before [`LiveRuntime::start`].
pub struct LiveRuntime {
    config: AppConfig,
    shutdown: ShutdownSignal,
    bus: Arc<EventBus>,
    stores: Stores,
    paper: Option<Arc<PaperExchange>>,
    gate: Arc<TradingGate>,
    breaker: Arc<CircuitBreaker>,
    alerts: Arc<AlertDispatcher>,
    metrics: Arc<LiveMetrics>,
    orders: Arc<OrderManager>,
    fills: Arc<FillStreamService>,
    coalescer: Arc<Coalescer>,
    writer: Arc<SnapshotWriter>,
    heartbeat: Arc<HeartbeatMonitor>,
    accounting: Arc<Accounting>,
    engine: TradingEngine,
    boot: BootAuditRecord,
    tasks: Vec<JoinHandle<()>>,
}

impl LiveRuntime {
    /// Open the configured database and exchange driver, then assemble.
    pub async fn build(config: AppConfig, shutdown: ShutdownSignal) -> Result<Self> {
        config.validate()?;
        let bus = Arc::new(EventBus::new());
        let stores = Stores::open(&config.database_path)?;
        let bundle = build_exchange(&config, &bus)?;
        Self::assemble(config, stores, bus, bundle, shutdown).await
    }

    /// Assemble around an externally constructed exchange binding. The binding
    /// publishes its execution and ticker events on `bus`.
    pub async fn with_exchange(
        config: AppConfig,
        stores: Stores,
        bus: Arc<EventBus>,
        exchange: Arc<dyn Exchange>,
        shutdown: ShutdownSignal,
    ) -> Result<Self> {
        let bundle = ExchangeBundle {
            exchange: guard_exchange(exchange, &config)?,
            paper: None,
        };
        Self::assemble(config, stores, bus, bundle, shutdown).await
    }

    async fn assemble(
        config: AppConfig,
        stores: Stores,
        bus: Arc<EventBus>,
        bundle: ExchangeBundle,
        shutdown: ShutdownSignal,
    ) -> Result<Self> {
        let mode = config.mode;
        let quote = config.exchange.quote_currency.clone();
        let ExchangeBundle { exchange, paper } = bundle;
        info!(mode = %mode, exchange = exchange.name(), "assembling trading core");

        let gate = Arc::new(TradingGate::new());
        let breaker = Arc::new(CircuitBreaker::new(config.risk.breaker.clone()));
        let alerts = Arc::new(AlertDispatcher::new(&config.alerting)?);
        let metrics = Arc::new(LiveMetrics::new()?);
        {
            let alerts = alerts.clone();
            breaker.on_trip(move |event| alerts.breaker_tripped(event));
        }
        match load_json::<BreakerSnapshot>(stores.reconcile.as_ref(), BREAKER_STATE_KEY) {
            Ok(Some(snapshot)) => {
                info!(state = snapshot.state.label(), saved_at = %snapshot.saved_at, "circuit breaker state restored");
                breaker.restore(snapshot);
            }
            Ok(None) => {}
            Err(err) => warn!(error = %format!("{err:#}"), "ignoring unreadable circuit breaker state"),
        }

        let reconciler = BootReconciler::new(
            config.reconcile_config(),
            StateRebuilder::new(
                mode,
                stores.execution.clone(),
                stores.execution.clone(),
                stores.portfolio.clone(),
            ),
            BrokerReconciler::new(exchange.clone(), config.reconcile.tolerances, quote.clone()),
            stores.reconcile.clone(),
        );
        let boot = reconciler
            .run(&gate)
            .await
            .context("boot reconciliation failed")?;
        alerts.boot_decision(&boot).await;
        if let Some(diff) = &boot.diff {
            metrics.update_reconciliation(diff);
        }

        let cash_ledger = CashEventLedger::new(stores.portfolio.clone());
        if let Some(paper) = &paper {
            let starting_cash = config.exchange.paper.initial_cash;
            let cash = boot.local.cash.unwrap_or(starting_cash);
            paper.seed(cash, boot.local.holdings.clone());
            if boot.local.cash.is_none() && starting_cash > Decimal::ZERO {
                cash_ledger.record_event(
                    CashEventType::Deposit,
                    starting_cash,
                    &quote,
                    "paper starting balance",
                    Some(PAPER_SEED_REF),
                    mode,
                )?;
            }
        }

        let fills = Arc::new(FillStreamService::new(
            config.fill_stream_config(),
            mode,
            exchange.clone(),
            stores.execution.clone(),
            stores.execution.clone(),
            FeeTracker::new(stores.portfolio.clone()),
            breaker.clone(),
        ));
        let replayed = fills.replay().await?;
        fills.attach(&bus);

        let orders = Arc::new(OrderManager::new(
            exchange.clone(),
            stores.execution.clone(),
            breaker.clone(),
            gate.clone(),
            config.order_manager_config(),
            mode,
        ));
        let recovered = orders.recover_from_db()?;

        let focus = Arc::new(FocusManager::new(config.market_data.focus.clone()));
        if let Some(catalog) = load_catalog(&config, stores.markets.as_ref())? {
            orders.set_tick_sizes(catalog.tick_sizes());
            focus.set_universe(catalog.tradable_symbols());
        }
        let held: Vec<Symbol> = fills
            .matcher()
            .lock()
            .await
            .view()
            .positions
            .into_iter()
            .map(|position| position.symbol)
            .collect();
        focus.set_positions(held);

        let writer = Arc::new(SnapshotWriter::new(
            stores.markets.clone(),
            focus.clone(),
            Arc::new(MoverDetector::new(config.market_data.movers.clone())),
            config.market_data.max_quote_age_secs,
        ));
        let warmed = writer.warm_from_store()?;
        let coalescer = Arc::new(Coalescer::new(
            config.market_data.coalescer.clone(),
            focus.clone(),
            Arc::new(MeteredSink {
                inner: writer.clone(),
                metrics: metrics.clone(),
            }),
        ));
        coalescer.attach(&bus);

        let heartbeat = Arc::new(HeartbeatMonitor::new(
            config.market_data.heartbeat.clone(),
            gate.clone(),
        ));
        heartbeat.register(MARKET_DATA_CHANNEL, ChannelKind::MarketData);
        if mode == TradingMode::Live {
            heartbeat.register(EXECUTION_CHANNEL, ChannelKind::Connection);
        }
        heartbeat.attach(&bus);

        let quotes: Arc<dyn QuoteSource> = writer.clone();
        let engine = TradingEngine::new(
            mode,
            quote.clone(),
            exchange.clone(),
            orders.clone(),
            fills.clone(),
            breaker.clone(),
            gate.clone(),
            EquityCalculator::new(Some(quotes), Some(exchange.clone())),
        );
        let accounting = Arc::new(Accounting {
            mode,
            quote_currency: quote,
            engine: engine.clone(),
            breaker: breaker.clone(),
            gate: gate.clone(),
            focus,
            balances: stores.portfolio.clone(),
            cash: cash_ledger,
            pnl: PnlService::new(stores.portfolio.clone(), config.live.instance_id.clone()),
            metrics: metrics.clone(),
            trading_day: Mutex::new(None),
        });
        metrics.update_gate(&gate.state());
        metrics.update_breaker(&breaker.state());
        info!(
            decision = boot.decision.label(),
            replayed_fills = replayed,
            recovered_orders = recovered,
            warmed_quotes = warmed,
            "trading core assembled"
        );

        Ok(Self {
            config,
            shutdown,
            bus,
            stores,
            paper,
            gate,
            breaker,
            alerts,
            metrics,
            orders,
            fills,
            coalescer,
            writer,
            heartbeat,
            accounting,
            engine,
            boot,
            tasks: Vec::new(),
        })
    }

    pub fn engine(&self) -> &TradingEngine {
        &self.engine
    }

    pub fn boot_record(&self) -> &BootAuditRecord {
        &self.boot
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn gate(&self) -> &Arc<TradingGate> {
        &self.gate
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn fills(&self) -> &Arc<FillStreamService> {
        &self.fills
    }

    pub fn metrics(&self) -> &Arc<LiveMetrics> {
        &self.metrics
    }

    pub fn accounting(&self) -> &Arc<Accounting> {
        &self.accounting
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Spawn every background loop.
    pub fn start(&mut self) -> Result<()> {
        if !self.tasks.is_empty() {
            bail!("runtime already started");
        }
        let shutdown = &self.shutdown;
        let live = &self.config.live;

        self.tasks
            .push(self.fills.clone().spawn(shutdown.subscribe())?);
        let books: Arc<dyn BookSource> = self.writer.clone();
        self.tasks
            .push(self.orders.clone().spawn(books, shutdown.subscribe()));
        self.tasks
            .push(self.coalescer.clone().spawn(shutdown.subscribe()));
        let alerts = self.alerts.clone();
        self.tasks.push(self.heartbeat.clone().spawn(
            shutdown.subscribe(),
            move |transition| alerts.heartbeat_changed(transition),
        ));
        self.tasks.push(spawn_order_metrics(
            self.orders.subscribe(),
            self.metrics.clone(),
            shutdown.subscribe(),
        ));
        self.tasks.push(spawn_fill_metrics(
            self.fills.subscribe(),
            self.fills.clone(),
            self.metrics.clone(),
            shutdown.subscribe(),
        ));
        self.tasks.push(self.accounting.clone().spawn(
            StdDuration::from_secs(live.equity_snapshot_secs.max(1)),
            shutdown.subscribe(),
        ));
        self.tasks.push(spawn_breaker_persistence(
            self.stores.reconcile.clone(),
            self.breaker.clone(),
            StdDuration::from_secs(live.state_persist_secs.max(1)),
            shutdown.subscribe(),
        ));

        if let Some(paper) = &self.paper {
            let ticker = PaperTicker::new(
                paper.clone(),
                self.bus.clone(),
                self.config.exchange.paper.market.clone(),
            );
            ticker.publish(&self.config.exchange.paper.market.start_prices);
            self.tasks.push(ticker.spawn(shutdown.subscribe()));
        }

        let addr = live.metrics_addr.trim();
        if !addr.is_empty() {
            let addr: SocketAddr = addr
                .parse()
                .with_context(|| format!("invalid metrics address '{addr}'"))?;
            self.tasks.push(spawn_metrics_server(
                self.metrics.registry(),
                addr,
                shutdown.subscribe(),
            ));
        }
        info!(tasks = self.tasks.len(), "runtime started");
        Ok(())
    }

    /// Trigger shutdown, wait for every loop to drain, and persist final state.
    pub async fn stop(&mut self) {
        self.shutdown.trigger();
        for result in join_all(self.tasks.drain(..)).await {
            if let Err(err) = result {
                error!(error = %err, "background task failed");
            }
        }
        if let Err(err) = self.accounting.refresh(Utc::now()).await {
            warn!(error = %format!("{err:#}"), "final equity snapshot failed");
        }
        persist_breaker(&self.stores.reconcile, &self.breaker);
        info!("runtime stopped");
    }

    /// Start, run until ctrl-c or an external trigger, then stop.
    pub async fn run(mut self) -> Result<()> {
        self.start()?;
        let shutdown = self.shutdown.clone();
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    warn!(error = %err, "failed to listen for ctrl-c");
                }
                info!("ctrl-c received, shutting down");
            }
            _ = shutdown.wait() => {}
        }
        self.stop().await;
        Ok(())
    }
}
