//! Fill ingestion from the execution stream with a REST safety net.
//!
//! Stream handlers only enqueue. A single consumer task owns deduplication,
//! persistence and the FIFO ledger, so fills are applied strictly in arrival
//! order no matter which source delivered them.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use keel_broker::{normalize_status, EventBus, EventKind, Exchange, StreamEvent, SubscriptionId};
use keel_core::{
    ExecutionMessage, Fill, FillId, IntentId, OrderId, Price, Side, Symbol, TradingMode,
};
use keel_portfolio::{FeeTracker, FeeType, FifoMatcher};
use keel_risk::CircuitBreaker;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::repository::{FillRepository, OrderRepository};
use crate::FillEvent;

const EVENT_CAPACITY: usize = 1024;
/// How far back the sweep looks for settled orders with unrecorded fills.
const SETTLED_LOOKBACK_HOURS: i64 = 24;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FillSource {
    Stream,
    RestFallback,
}

impl FillSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::RestFallback => "rest_fallback",
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FillStreamConfig {
    /// How often open orders are swept over REST for fills the stream missed.
    #[serde(default = "default_fallback_poll_secs")]
    pub fallback_poll_secs: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_fallback_poll_secs() -> u64 {
    30
}

fn default_queue_capacity() -> usize {
    4096
}

impl Default for FillStreamConfig {
    fn default() -> Self {
        Self {
            fallback_poll_secs: default_fallback_poll_secs(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug)]
enum Inbound {
    Fill(Fill, FillSource),
    Status {
        order_id: OrderId,
        raw: String,
        at: DateTime<Utc>,
    },
}

/// Realized P&L of an exit intent whose fills are still arriving.
#[derive(Debug)]
struct ExitTally {
    symbol: Symbol,
    realized: Price,
}

pub struct FillStreamService {
    config: FillStreamConfig,
    mode: TradingMode,
    exchange: Arc<dyn Exchange>,
    fills: Arc<dyn FillRepository>,
    orders: Arc<dyn OrderRepository>,
    fees: FeeTracker,
    breaker: Arc<CircuitBreaker>,
    matcher: Arc<tokio::sync::Mutex<FifoMatcher>>,
    seen: Mutex<HashSet<FillId>>,
    exits: Mutex<HashMap<IntentId, ExitTally>>,
    tx: mpsc::Sender<Inbound>,
    rx: Mutex<Option<mpsc::Receiver<Inbound>>>,
    events: broadcast::Sender<FillEvent>,
    dropped: AtomicU64,
    duplicates: AtomicU64,
}

impl FillStreamService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: FillStreamConfig,
        mode: TradingMode,
        exchange: Arc<dyn Exchange>,
        fills: Arc<dyn FillRepository>,
        orders: Arc<dyn OrderRepository>,
        fees: FeeTracker,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            mode,
            exchange,
            fills,
            orders,
            fees,
            breaker,
            matcher: Arc::new(tokio::sync::Mutex::new(FifoMatcher::new())),
            seen: Mutex::new(HashSet::new()),
            exits: Mutex::new(HashMap::new()),
            tx,
            rx: Mutex::new(Some(rx)),
            events,
            dropped: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
        }
    }

    /// Shared handle on the ledger the service maintains.
    pub fn matcher(&self) -> Arc<tokio::sync::Mutex<FifoMatcher>> {
        self.matcher.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FillEvent> {
        self.events.subscribe()
    }

    /// Messages discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Redelivered fills skipped by the dedup index or the store.
    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    /// Rebuild the ledger and the dedup set from persisted fills.
    pub async fn replay(&self) -> Result<usize> {
        let fills = self.fills.fills(self.mode)?;
        let rebuilt = FifoMatcher::from_fills(fills.iter());
        *self.matcher.lock().await = rebuilt;
        let mut seen = self.seen.lock();
        seen.clear();
        seen.extend(fills.iter().map(|fill| fill.fill_id.clone()));
        info!(fills = fills.len(), mode = self.mode.as_str(), "fill ledger replayed");
        Ok(fills.len())
    }

    /// Route execution messages from the stream into the ingest queue.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> SubscriptionId {
        let service = Arc::clone(self);
        bus.subscribe(EventKind::Execution, move |event| {
            if let StreamEvent::Execution(message) = event {
                service.accept(message);
            }
        })
    }

    fn accept(&self, message: &ExecutionMessage) {
        let inbound = if message.is_trade() {
            match message.to_fill(self.mode) {
                Ok(fill) => Inbound::Fill(fill, FillSource::Stream),
                Err(err) => {
                    warn!(order_id = %message.order_id, error = %err, "discarding malformed trade message");
                    return;
                }
            }
        } else if let Some(raw) = &message.order_status {
            Inbound::Status {
                order_id: message.order_id.clone(),
                raw: raw.clone(),
                at: message.timestamp,
            }
        } else {
            return;
        };
        self.enqueue(inbound);
    }

    fn enqueue(&self, inbound: Inbound) -> bool {
        match self.tx.try_send(inbound) {
            Ok(()) => true,
            Err(err) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(error = %err, "fill queue rejected message; REST sweep will recover it");
                false
            }
        }
    }

    /// Queue a fill from outside the stream.
    pub fn enqueue_fill(&self, fill: Fill, source: FillSource) -> bool {
        self.enqueue(Inbound::Fill(fill, source))
    }

    /// Apply one fill. Returns `None` for duplicates.
    pub async fn ingest(&self, mut fill: Fill, source: FillSource) -> Result<Option<FillEvent>> {
        fill.validate()?;
        fill.mode = self.mode;
        if self.seen.lock().contains(&fill.fill_id) {
            debug!(fill_id = %fill.fill_id, source = source.as_str(), "duplicate fill ignored");
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }
        let inserted = self.fills.insert_fill(&fill)?;
        self.seen.lock().insert(fill.fill_id.clone());
        if !inserted {
            debug!(fill_id = %fill.fill_id, "fill already persisted");
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let (matched, open_quantity) = {
            let mut matcher = self.matcher.lock().await;
            let matched = matcher.apply(&fill);
            (matched, matcher.open_quantity(&fill.symbol))
        };
        if let Err(err) = self.fees.record_fee(
            &fill.fill_id,
            &fill.order_id,
            &fill.symbol,
            fill.fee,
            &fill.fee_currency,
            FeeType::Trading,
            self.mode,
        ) {
            error!(fill_id = %fill.fill_id, error = %err, "failed to record fee");
        }
        self.breaker
            .update_exposure(&fill.symbol, open_quantity * fill.price);
        if fill.side == Side::Sell {
            if let Some(result) = &matched {
                if let Err(err) = self.record_exit(&fill, result.realized_pnl) {
                    error!(fill_id = %fill.fill_id, error = %err, "failed to tally exit result");
                }
            }
        }

        info!(
            fill_id = %fill.fill_id,
            order_id = %fill.order_id,
            symbol = %fill.symbol,
            side = %fill.side,
            quantity = %fill.quantity,
            price = %fill.price,
            source = source.as_str(),
            realized = %matched.as_ref().map(|m| m.realized_pnl).unwrap_or_default(),
            "fill applied"
        );
        let event = FillEvent {
            fill,
            source,
            matched,
        };
        let _ = self.events.send(event.clone());
        Ok(Some(event))
    }

    /// Exit fills accumulate per intent; the breaker sees one result per trade.
    /// Fills of orders this process never placed count as trades on their own.
    fn record_exit(&self, fill: &Fill, realized: Price) -> Result<()> {
        let Some(order) = self.orders.order(&fill.order_id)? else {
            self.breaker.record_trade_result(realized, &fill.symbol);
            return Ok(());
        };
        self.exits
            .lock()
            .entry(order.intent_id.clone())
            .or_insert_with(|| ExitTally {
                symbol: fill.symbol.clone(),
                realized: Decimal::ZERO,
            })
            .realized += realized;
        if self.exit_settled(&order.intent_id)? {
            self.settle_exit(&order.intent_id);
        }
        Ok(())
    }

    /// An exit is done once its fills cover the intent quantity, or once the
    /// intent is complete and every fill the exchange reported is recorded.
    fn exit_settled(&self, intent_id: &str) -> Result<bool> {
        let Some(intent) = self.orders.intent(intent_id)? else {
            return Ok(true);
        };
        let mut reported = Decimal::ZERO;
        let mut recorded = Decimal::ZERO;
        for order in self.orders.orders_for_intent(intent_id)? {
            reported += order.filled_quantity;
            recorded += self.fills.order_fill_quantity(self.mode, &order.order_id)?;
        }
        if intent.quantity.is_some_and(|qty| recorded >= qty) {
            return Ok(true);
        }
        Ok(intent.status.is_complete() && recorded >= reported)
    }

    fn settle_exit(&self, intent_id: &str) {
        let Some(tally) = self.exits.lock().remove(intent_id) else {
            return;
        };
        info!(intent_id, symbol = %tally.symbol, realized = %tally.realized, "exit trade settled");
        self.breaker
            .record_trade_result(tally.realized, &tally.symbol);
    }

    /// Settle exits whose intents completed after their last fill. Returns how many settled.
    pub fn settle_pending_exits(&self) -> Result<usize> {
        let pending: Vec<IntentId> = self.exits.lock().keys().cloned().collect();
        let mut settled = 0;
        for intent_id in pending {
            if self.exit_settled(&intent_id)? {
                self.settle_exit(&intent_id);
                settled += 1;
            }
        }
        Ok(settled)
    }

    /// Fold a stream status update into the stored order.
    pub fn apply_status(&self, order_id: &str, raw: &str, at: DateTime<Utc>) -> Result<bool> {
        let Some(status) = normalize_status(raw) else {
            return Ok(false);
        };
        let Some(mut order) = self.orders.order(order_id)? else {
            debug!(order_id, "status update for an unknown order");
            return Ok(false);
        };
        match order.transition(status, at) {
            Ok(true) => {
                self.orders.upsert_order(&order)?;
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(err) => {
                debug!(error = %err, "ignoring streamed status");
                Ok(false)
            }
        }
    }

    /// Pull fills over REST for open orders and for recently settled orders
    /// whose recorded fills fall short of what the exchange reported. Returns
    /// how many fills were new.
    pub async fn sweep_missed_fills(&self) -> Result<usize> {
        let mut targets = self.orders.open_orders(self.mode)?;
        let since = Utc::now() - Duration::hours(SETTLED_LOOKBACK_HOURS);
        for order in self.orders.settled_orders_since(self.mode, since)? {
            let recorded = self.fills.order_fill_quantity(self.mode, &order.order_id)?;
            if recorded < order.filled_quantity {
                targets.push(order);
            }
        }
        let mut applied = 0;
        for order in targets {
            let fills = match self.exchange.order_fills(&order.order_id).await {
                Ok(fills) => fills,
                Err(err) => {
                    warn!(order_id = %order.order_id, error = %err, "fill sweep failed for order");
                    continue;
                }
            };
            for fill in fills {
                match self.ingest(fill, FillSource::RestFallback).await {
                    Ok(Some(_)) => applied += 1,
                    Ok(None) => {}
                    Err(err) => warn!(order_id = %order.order_id, error = %err, "swept fill rejected"),
                }
            }
        }
        if applied > 0 {
            info!(applied, "REST sweep recovered fills the stream missed");
        }
        self.settle_pending_exits()?;
        Ok(applied)
    }

    async fn process(&self, inbound: Inbound) {
        match inbound {
            Inbound::Fill(fill, source) => {
                let fill_id = fill.fill_id.clone();
                if let Err(err) = self.ingest(fill, source).await {
                    error!(%fill_id, error = %err, "failed to apply fill");
                }
            }
            Inbound::Status { order_id, raw, at } => {
                if let Err(err) = self.apply_status(&order_id, &raw, at) {
                    warn!(%order_id, error = %err, "failed to apply status update");
                }
            }
        }
    }

    /// Run the consumer and the REST sweep until shutdown, then drain the queue.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<JoinHandle<()>> {
        let mut rx = self
            .rx
            .lock()
            .take()
            .ok_or_else(|| anyhow::anyhow!("fill stream consumer already running"))?;
        let period = StdDuration::from_secs(self.config.fallback_poll_secs.max(1));
        Ok(tokio::spawn(async move {
            let mut sweep = interval(period);
            sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
            sweep.tick().await;
            loop {
                tokio::select! {
                    Some(inbound) = rx.recv() => self.process(inbound).await,
                    _ = sweep.tick() => {
                        if let Err(err) = self.sweep_missed_fills().await {
                            warn!(error = %err, "REST fill sweep failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            rx.close();
            let mut drained = 0usize;
            while let Some(inbound) = rx.recv().await {
                self.process(inbound).await;
                drained += 1;
            }
            info!(drained, "fill stream stopped");
        }))
    }
}
