//! Order state machine driver.
//!
//! The manager keeps every non-terminal order in memory, polls the exchange on
//! a fixed tick, and repositions limit orders whose TTL has elapsed. One
//! order failing to poll never stops the others; it is retried next tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use keel_broker::{BookSource, BrokerError, Exchange, ExchangeOrder, PlaceOrderRequest};
use keel_core::{
    client_order_id, new_intent_id, utc_day_start, BidAsk, Intent, IntentId, IntentStatus,
    ManagedOrder, OrderId, OrderPurpose, OrderStatus, Price, Side, Symbol, TradingMode,
};
use keel_risk::{CircuitBreaker, TradingGate};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::policy::{RepositionConfig, RepositionDecision, RepositionPolicy};
use crate::repository::OrderRepository;
use crate::{IntentRequest, OrderEvent, SubmitError};

const EVENT_CAPACITY: usize = 1024;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OrderManagerConfig {
    #[serde(default = "default_entry_ttl_secs")]
    pub entry_ttl_secs: i64,
    /// Exits and sells rest for less time than entries.
    #[serde(default = "default_exit_ttl_secs")]
    pub exit_ttl_secs: i64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub reposition: RepositionConfig,
    #[serde(default)]
    pub max_trade_notional: Option<Price>,
    #[serde(default)]
    pub max_daily_notional: Option<Price>,
}

fn default_entry_ttl_secs() -> i64 {
    60
}

fn default_exit_ttl_secs() -> i64 {
    20
}

fn default_poll_interval_secs() -> u64 {
    5
}

impl Default for OrderManagerConfig {
    fn default() -> Self {
        Self {
            entry_ttl_secs: default_entry_ttl_secs(),
            exit_ttl_secs: default_exit_ttl_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            reposition: RepositionConfig::default(),
            max_trade_notional: None,
            max_daily_notional: None,
        }
    }
}

/// Summary of one management pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PollReport {
    pub polled: usize,
    pub changed: usize,
    pub completed: usize,
    pub repositioned: usize,
    pub cancelled: usize,
    pub errors: usize,
}

enum Outcome {
    Unchanged,
    Changed,
    Completed,
    Repositioned,
    Cancelled,
}

pub struct OrderManager {
    exchange: Arc<dyn Exchange>,
    repo: Arc<dyn OrderRepository>,
    breaker: Arc<CircuitBreaker>,
    gate: Arc<TradingGate>,
    policy: RepositionPolicy,
    config: OrderManagerConfig,
    mode: TradingMode,
    tick_sizes: RwLock<HashMap<Symbol, Price>>,
    active: Mutex<HashMap<OrderId, ManagedOrder>>,
    /// Serializes polling with explicit cancels so a reposition is never interleaved with one.
    lifecycle: tokio::sync::Mutex<()>,
    events: broadcast::Sender<OrderEvent>,
}

impl OrderManager {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        repo: Arc<dyn OrderRepository>,
        breaker: Arc<CircuitBreaker>,
        gate: Arc<TradingGate>,
        config: OrderManagerConfig,
        mode: TradingMode,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            exchange,
            repo,
            breaker,
            gate,
            policy: RepositionPolicy::new(config.reposition.clone()),
            config,
            mode,
            tick_sizes: RwLock::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            lifecycle: tokio::sync::Mutex::new(()),
            events,
        }
    }

    pub fn mode(&self) -> TradingMode {
        self.mode
    }

    pub fn config(&self) -> &OrderManagerConfig {
        &self.config
    }

    /// Tick sizes used to round repositioned prices.
    pub fn set_tick_sizes(&self, tick_sizes: HashMap<Symbol, Price>) {
        *self.tick_sizes.write() = tick_sizes;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrderEvent> {
        self.events.subscribe()
    }

    pub fn active_orders(&self) -> Vec<ManagedOrder> {
        let mut orders: Vec<_> = self.active.lock().values().cloned().collect();
        orders.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        orders
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    fn emit(&self, event: OrderEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn ttl_secs(&self, purpose: OrderPurpose, side: Side) -> i64 {
        if purpose == OrderPurpose::Exit || side == Side::Sell {
            self.config.exit_ttl_secs
        } else {
            self.config.entry_ttl_secs
        }
    }

    fn tick_size(&self, symbol: &str) -> Option<Price> {
        self.tick_sizes.read().get(symbol).copied()
    }

    fn persist(&self, order: &ManagedOrder) {
        if let Err(err) = self.repo.upsert_order(order) {
            error!(order_id = %order.order_id, error = %err, "failed to persist order");
        }
    }

    /// Validate, risk-check and submit the first order of a new intent.
    pub async fn submit_intent(&self, request: IntentRequest) -> Result<IntentId, SubmitError> {
        request.validate()?;
        self.gate.permits(request.purpose)?;
        let now = Utc::now();

        let quote = match self.exchange.best_bid_ask(&request.symbol).await {
            Ok(quote) => quote,
            Err(err) => {
                warn!(symbol = %request.symbol, error = %err, "quote unavailable at submission");
                None
            }
        };
        let reference_price = request
            .limit_price
            .or_else(|| quote.as_ref().map(BidAsk::mid));
        let estimated = request.notional.or_else(|| {
            request
                .quantity
                .zip(reference_price)
                .map(|(qty, price)| qty * price)
        });

        if request.purpose == OrderPurpose::Entry {
            let notional =
                estimated.ok_or_else(|| SubmitError::NoPrice(request.symbol.clone()))?;
            self.check_notional_caps(notional, now)?;
            self.breaker.check(&request.symbol, notional)?;
        }

        let intent = Intent {
            intent_id: new_intent_id(),
            symbol: request.symbol.clone(),
            side: request.side,
            purpose: request.purpose,
            order_type: request.order_type,
            notional: request.notional,
            quantity: request.quantity,
            limit_price: request.limit_price,
            estimated_notional: estimated,
            status: IntentStatus::Active,
            created_at: now,
            completed_at: None,
            detail: None,
            mode: self.mode,
        };
        if let Err(err) = self.repo.upsert_intent(&intent) {
            self.release_trial(request.purpose);
            return Err(SubmitError::Storage(err));
        }

        let client_id = client_order_id(&intent.intent_id, 0);
        let order = ManagedOrder {
            order_id: client_id.clone(),
            client_order_id: client_id,
            intent_id: intent.intent_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            purpose: request.purpose,
            notional: request.notional,
            quantity: request.quantity,
            limit_price: request.limit_price,
            anchor_price: quote
                .as_ref()
                .map(|q| q.same_side(request.side))
                .or(request.limit_price),
            status: OrderStatus::New,
            replace_count: 0,
            parent_order_id: None,
            filled_quantity: Decimal::ZERO,
            avg_fill_price: None,
            submitted_at: now,
            ttl_secs: self.ttl_secs(request.purpose, request.side),
            updated_at: now,
            mode: self.mode,
        };

        match self.send(order).await {
            Ok(order) => {
                info!(
                    intent_id = %intent.intent_id,
                    order_id = %order.order_id,
                    symbol = %order.symbol,
                    side = %order.side,
                    purpose = order.purpose.as_str(),
                    "intent submitted"
                );
                Ok(intent.intent_id)
            }
            Err(err) => {
                self.complete_intent(&intent.intent_id, IntentStatus::Failed, Some(err.to_string()));
                self.release_trial(request.purpose);
                Err(SubmitError::Exchange(err))
            }
        }
    }

    fn check_notional_caps(&self, notional: Price, now: DateTime<Utc>) -> Result<(), SubmitError> {
        if let Some(limit) = self.config.max_trade_notional {
            if notional > limit {
                return Err(SubmitError::TradeNotional {
                    requested: notional,
                    limit,
                    excess: notional - limit,
                });
            }
        }
        if let Some(limit) = self.config.max_daily_notional {
            let used = self
                .repo
                .notional_submitted_since(self.mode, utc_day_start(now))?;
            if used + notional > limit {
                return Err(SubmitError::DailyNotional {
                    used,
                    requested: notional,
                    limit,
                    excess: used + notional - limit,
                });
            }
        }
        Ok(())
    }

    fn release_trial(&self, purpose: OrderPurpose) {
        if purpose == OrderPurpose::Entry {
            self.breaker.release_trial();
        }
    }

    /// Place `order` on the exchange and start tracking it.
    async fn send(&self, mut order: ManagedOrder) -> Result<ManagedOrder, BrokerError> {
        let request = PlaceOrderRequest {
            symbol: order.symbol.clone(),
            side: order.side,
            order_type: order.order_type,
            client_order_id: order.client_order_id.clone(),
            quantity: order.quantity,
            notional: if order.quantity.is_some() {
                None
            } else {
                order.notional
            },
            limit_price: order.limit_price,
        };
        let now = Utc::now();
        match self.exchange.place_order(request).await {
            Ok(ack) => {
                self.breaker.record_order();
                order.order_id = ack.order_id;
                let status = keel_broker::normalize_status(&ack.status)
                    .filter(|status| *status != OrderStatus::New)
                    .unwrap_or(OrderStatus::Submitted);
                if let Err(err) = order.transition(status, now) {
                    debug!(error = %err, "unexpected acknowledgement status");
                    order.status = OrderStatus::Submitted;
                }
                order.submitted_at = now;
                order.updated_at = now;
                self.persist(&order);
                if order.is_terminal() {
                    self.retire(order.clone());
                } else {
                    self.active
                        .lock()
                        .insert(order.order_id.clone(), order.clone());
                }
                self.emit(OrderEvent::Submitted {
                    order: order.clone(),
                });
                Ok(order)
            }
            Err(err) => {
                let status = match err {
                    BrokerError::InvalidRequest(_) | BrokerError::InsufficientFunds(_) => {
                        OrderStatus::Rejected
                    }
                    _ => OrderStatus::Failed,
                };
                warn!(
                    client_order_id = %order.client_order_id,
                    symbol = %order.symbol,
                    error = %err,
                    status = status.as_str(),
                    "order placement failed"
                );
                order.status = status;
                order.updated_at = now;
                self.persist(&order);
                Err(err)
            }
        }
    }

    /// Poll every tracked order once. Per-order failures are logged and counted.
    pub async fn poll_and_manage(&self, books: &dyn BookSource) -> PollReport {
        let _guard = self.lifecycle.lock().await;
        let orders = self.active_orders();
        let mut report = PollReport {
            polled: orders.len(),
            ..PollReport::default()
        };
        for order in orders {
            let order_id = order.order_id.clone();
            match self.manage(order, books).await {
                Ok(Outcome::Unchanged) => {}
                Ok(Outcome::Changed) => report.changed += 1,
                Ok(Outcome::Completed) => report.completed += 1,
                Ok(Outcome::Repositioned) => report.repositioned += 1,
                Ok(Outcome::Cancelled) => report.cancelled += 1,
                Err(err) => {
                    report.errors += 1;
                    warn!(%order_id, error = %err, "order poll failed; retrying next tick");
                }
            }
        }
        if report.polled > 0 {
            debug!(?report, "order management pass complete");
        }
        report
    }

    async fn manage(
        &self,
        mut order: ManagedOrder,
        books: &dyn BookSource,
    ) -> Result<Outcome, BrokerError> {
        let now = Utc::now();
        let remote = self.exchange.get_order(&order.order_id).await?;
        let changed = self.absorb(&mut order, &remote, now);
        if order.is_terminal() {
            self.retire(order);
            return Ok(Outcome::Completed);
        }
        if changed {
            self.persist(&order);
            self.track(order.clone());
        }
        if !order.ttl_expired(now) {
            return Ok(if changed {
                Outcome::Changed
            } else {
                Outcome::Unchanged
            });
        }

        let quote = match books.book(&order.symbol) {
            Some(quote) => Some(quote),
            None => self.exchange.best_bid_ask(&order.symbol).await?,
        };
        let decision =
            self.policy
                .should_reposition(&order, quote.as_ref(), self.tick_size(&order.symbol));
        match decision {
            RepositionDecision::Hold => Ok(Outcome::Unchanged),
            RepositionDecision::Cancel { reason } => {
                self.abandon(order, IntentStatus::Exhausted, reason).await;
                Ok(Outcome::Cancelled)
            }
            RepositionDecision::CancelLiquidity { spread_pct } => {
                let reason = format!(
                    "spread {}% above limit {}%",
                    spread_pct.round_dp(3),
                    self.policy.config().max_spread_pct
                );
                self.abandon(order, IntentStatus::Exhausted, reason).await;
                Ok(Outcome::Cancelled)
            }
            RepositionDecision::Reposition { price } => self.reposition(order, price).await,
        }
    }

    /// Fold the exchange view into the local order. Returns whether anything changed.
    fn absorb(&self, order: &mut ManagedOrder, remote: &ExchangeOrder, now: DateTime<Utc>) -> bool {
        let mut changed = false;
        if remote.filled_quantity != order.filled_quantity {
            order.filled_quantity = remote.filled_quantity;
            order.avg_fill_price = remote.avg_fill_price.or(order.avg_fill_price);
            changed = true;
        }
        let mut next = remote.normalized_status();
        if next == Some(OrderStatus::Working) && order.status == OrderStatus::CancelPending {
            next = None;
        }
        if let Some(next) = next {
            let from = order.status;
            match order.transition(next, now) {
                Ok(true) => {
                    changed = true;
                    debug!(order_id = %order.order_id, from = from.as_str(), to = next.as_str(), "order status changed");
                    self.emit(OrderEvent::StatusChanged {
                        order_id: order.order_id.clone(),
                        intent_id: order.intent_id.clone(),
                        from,
                        to: next,
                    });
                }
                Ok(false) => {}
                Err(err) => debug!(error = %err, "ignoring exchange status"),
            }
        }
        if changed {
            order.updated_at = now;
        }
        changed
    }

    fn track(&self, order: ManagedOrder) {
        self.active.lock().insert(order.order_id.clone(), order);
    }

    /// Stop tracking a terminal order and settle its intent.
    fn retire(&self, order: ManagedOrder) {
        self.active.lock().remove(&order.order_id);
        self.persist(&order);
        let outcome = match order.status {
            OrderStatus::Filled => Some((IntentStatus::Filled, None)),
            OrderStatus::Cancelled
                if order.remaining_quantity().is_some_and(|left| left.is_zero()) =>
            {
                Some((IntentStatus::Filled, None))
            }
            OrderStatus::Cancelled => Some((
                IntentStatus::Cancelled,
                Some("cancelled at the exchange".to_string()),
            )),
            OrderStatus::Rejected | OrderStatus::Failed => Some((
                IntentStatus::Failed,
                Some(format!("order {}", order.status)),
            )),
            _ => None,
        };
        if order.status != OrderStatus::Filled && order.filled_quantity.is_zero() {
            self.release_trial(order.purpose);
        }
        if let Some((status, detail)) = outcome {
            self.complete_intent(&order.intent_id, status, detail);
        }
    }

    fn complete_intent(&self, intent_id: &str, status: IntentStatus, detail: Option<String>) {
        let intent = match self.repo.intent(intent_id) {
            Ok(Some(intent)) => intent,
            Ok(None) => {
                warn!(intent_id, "intent missing from store");
                return;
            }
            Err(err) => {
                error!(intent_id, error = %err, "failed to load intent");
                return;
            }
        };
        let mut intent = intent;
        if !intent.complete(status, detail.clone(), Utc::now()) {
            return;
        }
        if let Err(err) = self.repo.upsert_intent(&intent) {
            error!(intent_id, error = %err, "failed to persist intent completion");
        }
        info!(intent_id, status = status.as_str(), detail = detail.as_deref().unwrap_or(""), "intent complete");
        self.emit(OrderEvent::IntentCompleted {
            intent_id: intent_id.to_string(),
            status,
            detail,
        });
    }

    /// Cancel at the exchange and stop tracking. A failed cancel still marks
    /// the order cancelled locally; boot reconciliation settles any drift.
    async fn abandon(&self, mut order: ManagedOrder, intent_status: IntentStatus, reason: String) {
        if let Err(err) = self.exchange.cancel_order(&order.order_id).await {
            warn!(
                order_id = %order.order_id,
                error = %err,
                "exchange cancel failed; marking cancelled locally"
            );
        }
        let now = Utc::now();
        if let Err(err) = order.transition(OrderStatus::Cancelled, now) {
            warn!(error = %err, "forcing local cancel");
            order.status = OrderStatus::Cancelled;
            order.updated_at = now;
        }
        self.active.lock().remove(&order.order_id);
        self.persist(&order);
        if order.filled_quantity.is_zero() {
            self.release_trial(order.purpose);
        }
        info!(order_id = %order.order_id, %reason, "order cancelled");
        self.emit(OrderEvent::Cancelled {
            order_id: order.order_id.clone(),
            intent_id: order.intent_id.clone(),
            reason: reason.clone(),
        });
        self.complete_intent(&order.intent_id, intent_status, Some(reason));
    }

    /// Cancel, confirm, then submit the replacement. The replacement is only
    /// sent once the exchange has accepted the cancel.
    async fn reposition(&self, mut order: ManagedOrder, price: Price) -> Result<Outcome, BrokerError> {
        let now = Utc::now();
        let previous = order.status;
        if let Err(err) = order.transition(OrderStatus::CancelPending, now) {
            debug!(error = %err, "order cannot be repositioned from its current state");
            return Ok(Outcome::Unchanged);
        }
        self.persist(&order);
        if let Err(err) = self.exchange.cancel_order(&order.order_id).await {
            warn!(order_id = %order.order_id, error = %err, "cancel before reposition failed; retrying next tick");
            order.status = previous;
            order.updated_at = Utc::now();
            self.persist(&order);
            self.track(order);
            return Ok(Outcome::Unchanged);
        }

        match self.exchange.get_order(&order.order_id).await {
            Ok(remote) => {
                self.absorb(&mut order, &remote, Utc::now());
            }
            Err(err) => {
                debug!(order_id = %order.order_id, error = %err, "cancel confirmation unavailable; assuming cancelled");
            }
        }
        let fully_filled = order
            .quantity
            .is_some_and(|qty| order.filled_quantity >= qty);
        if order.status == OrderStatus::Filled || fully_filled {
            if let Err(err) = order.transition(OrderStatus::Filled, Utc::now()) {
                debug!(error = %err, "fill completed after the order settled");
            }
            info!(order_id = %order.order_id, "order filled while repositioning; no replacement sent");
            self.retire(order);
            return Ok(Outcome::Completed);
        }
        if order.is_terminal() && order.status != OrderStatus::Cancelled {
            // Rejected or failed while the cancel was in flight.
            self.retire(order);
            return Ok(Outcome::Completed);
        }

        let now = Utc::now();
        if let Err(err) = order.transition(OrderStatus::Cancelled, now) {
            warn!(error = %err, "cancel not confirmed; retrying next tick");
            self.persist(&order);
            self.track(order);
            return Ok(Outcome::Unchanged);
        }
        self.active.lock().remove(&order.order_id);
        self.persist(&order);

        if order.purpose == OrderPurpose::Entry {
            if let Err(block) = self.gate.permits(OrderPurpose::Entry) {
                let reason = block.to_string();
                info!(order_id = %order.order_id, %reason, "entry not replaced");
                self.emit(OrderEvent::Cancelled {
                    order_id: order.order_id.clone(),
                    intent_id: order.intent_id.clone(),
                    reason: reason.clone(),
                });
                self.complete_intent(&order.intent_id, IntentStatus::Cancelled, Some(reason));
                self.release_trial(order.purpose);
                return Ok(Outcome::Cancelled);
            }
        }

        let Some(replacement) = self.replacement(&order, price, now) else {
            self.complete_intent(
                &order.intent_id,
                IntentStatus::Filled,
                Some("filled across replacements".into()),
            );
            return Ok(Outcome::Completed);
        };
        let replace_count = replacement.replace_count;
        match self.send(replacement).await {
            Ok(next) => {
                match order.transition(OrderStatus::Replaced, Utc::now()) {
                    Ok(_) => self.persist(&order),
                    Err(err) => warn!(error = %err, "parent order not marked replaced"),
                }
                info!(
                    intent_id = %order.intent_id,
                    old_order_id = %order.order_id,
                    new_order_id = %next.order_id,
                    %price,
                    replace_count,
                    "order repositioned"
                );
                self.emit(OrderEvent::Repositioned {
                    intent_id: order.intent_id.clone(),
                    old_order_id: order.order_id.clone(),
                    new_order_id: next.order_id,
                    price,
                    replace_count,
                });
                Ok(Outcome::Repositioned)
            }
            Err(err) => {
                self.complete_intent(
                    &order.intent_id,
                    IntentStatus::Failed,
                    Some(format!("replacement rejected: {err}")),
                );
                self.release_trial(order.purpose);
                Ok(Outcome::Cancelled)
            }
        }
    }

    /// Next order of the intent for whatever the parent left unfilled.
    fn replacement(&self, parent: &ManagedOrder, price: Price, now: DateTime<Utc>) -> Option<ManagedOrder> {
        let (quantity, notional) = match (parent.quantity, parent.notional) {
            (Some(_), _) => {
                let left = parent.remaining_quantity().filter(|q| *q > Decimal::ZERO)?;
                (Some(left), None)
            }
            (None, Some(notional)) => {
                let spent = parent.filled_quantity * parent.avg_fill_price.unwrap_or_default();
                let left = notional - spent;
                if left <= Decimal::ZERO {
                    return None;
                }
                (None, Some(left))
            }
            (None, None) => return None,
        };
        let replace_count = parent.replace_count + 1;
        let client_id = client_order_id(&parent.intent_id, replace_count);
        Some(ManagedOrder {
            order_id: client_id.clone(),
            client_order_id: client_id,
            intent_id: parent.intent_id.clone(),
            symbol: parent.symbol.clone(),
            side: parent.side,
            order_type: parent.order_type,
            purpose: parent.purpose,
            notional,
            quantity,
            limit_price: Some(price),
            anchor_price: parent.anchor_price,
            status: OrderStatus::New,
            replace_count,
            parent_order_id: Some(parent.order_id.clone()),
            filled_quantity: Decimal::ZERO,
            avg_fill_price: None,
            submitted_at: now,
            ttl_secs: parent.ttl_secs,
            updated_at: now,
            mode: parent.mode,
        })
    }

    /// Cancel one tracked order on behalf of the caller.
    pub async fn cancel_order(&self, order_id: &str) -> Result<(), SubmitError> {
        let _guard = self.lifecycle.lock().await;
        let order = self
            .active
            .lock()
            .get(order_id)
            .cloned()
            .ok_or_else(|| SubmitError::UnknownOrder(order_id.to_string()))?;
        self.abandon(order, IntentStatus::Cancelled, "cancelled by caller".into())
            .await;
        Ok(())
    }

    /// Cancel every live order of an intent. Returns how many were cancelled.
    pub async fn cancel_intent(&self, intent_id: &str) -> Result<usize, SubmitError> {
        let _guard = self.lifecycle.lock().await;
        let intent = self
            .repo
            .intent(intent_id)?
            .ok_or_else(|| SubmitError::UnknownIntent(intent_id.to_string()))?;
        let orders: Vec<ManagedOrder> = self
            .active
            .lock()
            .values()
            .filter(|order| order.intent_id == intent_id)
            .cloned()
            .collect();
        let count = orders.len();
        for order in orders {
            self.abandon(order, IntentStatus::Cancelled, "intent cancelled by caller".into())
                .await;
        }
        if count == 0 && !intent.status.is_complete() {
            self.complete_intent(
                intent_id,
                IntentStatus::Cancelled,
                Some("intent cancelled by caller".into()),
            );
        }
        Ok(count)
    }

    /// Reload every non-terminal order of this mode from storage.
    pub fn recover_from_db(&self) -> Result<usize> {
        let orders = self.repo.open_orders(self.mode)?;
        let count = orders.len();
        let mut active = self.active.lock();
        for order in orders {
            active.insert(order.order_id.clone(), order);
        }
        info!(count, mode = self.mode.as_str(), "recovered open orders");
        Ok(count)
    }

    /// Run [`Self::poll_and_manage`] on the configured interval until shutdown.
    pub fn spawn(
        self: Arc<Self>,
        books: Arc<dyn BookSource>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let period = StdDuration::from_secs(self.config.poll_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.poll_and_manage(books.as_ref()).await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
            info!(open_orders = self.active_count(), "order manager stopped");
        })
    }
}
