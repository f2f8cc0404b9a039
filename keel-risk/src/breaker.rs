//! Circuit breaker guarding order submission.
//!
//! `Closed` trades normally. A trip moves to `Open`, which blocks every symbol
//! until the cooldown elapses; nothing but the cooldown (or a manual reset)
//! leaves `Open`. After the cooldown the breaker is `HalfOpen` and lets exactly
//! one trial trade through: a profitable result closes it, anything else opens
//! it again.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use keel_core::{Price, Symbol};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CircuitBreakerConfig {
    /// Notional cap per symbol in quote currency.
    #[serde(default = "default_max_symbol_exposure")]
    pub max_symbol_exposure: Price,
    /// Notional cap across the whole book.
    #[serde(default = "default_max_total_exposure")]
    pub max_total_exposure: Price,
    #[serde(default = "default_max_positions")]
    pub max_positions: usize,
    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,
    /// Daily realized loss, percent of the day's starting equity.
    #[serde(default = "default_max_daily_loss_pct")]
    pub max_daily_loss_pct: Decimal,
    /// Peak-to-current equity drawdown, percent.
    #[serde(default = "default_max_drawdown_pct")]
    pub max_drawdown_pct: Decimal,
    #[serde(default = "default_max_orders_per_minute")]
    pub max_orders_per_minute: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: i64,
}

fn default_max_symbol_exposure() -> Price {
    Decimal::from(500)
}

fn default_max_total_exposure() -> Price {
    Decimal::from(2_000)
}

fn default_max_positions() -> usize {
    5
}

fn default_max_consecutive_losses() -> u32 {
    3
}

fn default_max_daily_loss_pct() -> Decimal {
    Decimal::from(5)
}

fn default_max_drawdown_pct() -> Decimal {
    Decimal::from(10)
}

fn default_max_orders_per_minute() -> u32 {
    20
}

fn default_cooldown_secs() -> i64 {
    900
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_symbol_exposure: default_max_symbol_exposure(),
            max_total_exposure: default_max_total_exposure(),
            max_positions: default_max_positions(),
            max_consecutive_losses: default_max_consecutive_losses(),
            max_daily_loss_pct: default_max_daily_loss_pct(),
            max_drawdown_pct: default_max_drawdown_pct(),
            max_orders_per_minute: default_max_orders_per_minute(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

/// Why the breaker opened.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TripReason {
    ConsecutiveLosses { count: u32, limit: u32 },
    DailyLoss { loss_pct: Decimal, limit_pct: Decimal },
    Drawdown { drawdown_pct: Decimal, limit_pct: Decimal },
    OrderRate { orders: u32, limit: u32 },
    TrialFailed { pnl: Price },
    Manual { note: String },
}

impl fmt::Display for TripReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConsecutiveLosses { count, limit } => {
                write!(f, "{count} consecutive losing trades (limit {limit})")
            }
            Self::DailyLoss {
                loss_pct,
                limit_pct,
            } => write!(
                f,
                "daily loss {:.2}% of starting equity (limit {limit_pct}%)",
                loss_pct
            ),
            Self::Drawdown {
                drawdown_pct,
                limit_pct,
            } => write!(
                f,
                "drawdown {:.2}% from peak equity (limit {limit_pct}%)",
                drawdown_pct
            ),
            Self::OrderRate { orders, limit } => {
                write!(f, "{orders} orders in the last minute (limit {limit})")
            }
            Self::TrialFailed { pnl } => write!(f, "half-open trial trade returned {pnl}"),
            Self::Manual { note } => write!(f, "manual trip: {note}"),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open {
        tripped_at: DateTime<Utc>,
        reason: TripReason,
    },
    HalfOpen {
        trial_in_flight: bool,
    },
}

impl BreakerState {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open { .. } => "open",
            Self::HalfOpen { .. } => "half_open",
        }
    }
}

/// Typed refusal returned to the strategy.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum TradeBlock {
    #[error("circuit breaker open: {reason}; cooldown ends {until}")]
    BreakerOpen {
        reason: TripReason,
        until: DateTime<Utc>,
    },
    #[error("circuit breaker half-open and its single trial trade is already in flight")]
    TrialInFlight,
    #[error(
        "{symbol} exposure {current} + {requested} exceeds per-symbol cap {limit} by {excess}"
    )]
    SymbolExposure {
        symbol: Symbol,
        current: Price,
        requested: Price,
        limit: Price,
        excess: Price,
    },
    #[error("total exposure {current} + {requested} exceeds portfolio cap {limit} by {excess}")]
    TotalExposure {
        current: Price,
        requested: Price,
        limit: Price,
        excess: Price,
    },
    #[error("{open} open positions at max {limit}; new symbol {symbol} refused")]
    MaxPositions {
        symbol: Symbol,
        open: usize,
        limit: usize,
    },
}

/// Delivered to trip observers.
#[derive(Clone, Debug)]
pub struct TripEvent {
    pub reason: TripReason,
    pub tripped_at: DateTime<Utc>,
    pub cooldown_until: DateTime<Utc>,
    pub trip_count: u32,
}

/// Counters persisted across restarts.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_losses: u32,
    pub daily_realized_pnl: Price,
    pub starting_equity: Price,
    pub peak_equity: Price,
    pub current_equity: Price,
    pub trip_count: u32,
    pub saved_at: DateTime<Utc>,
}

type TripObserver = Arc<dyn Fn(&TripEvent) + Send + Sync>;

struct Inner {
    state: BreakerState,
    consecutive_losses: u32,
    daily_realized: Price,
    starting_equity: Price,
    peak_equity: Price,
    current_equity: Price,
    exposures: HashMap<Symbol, Price>,
    orders: VecDeque<DateTime<Utc>>,
    trip_count: u32,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    observers: Mutex<Vec<TripObserver>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_losses: 0,
                daily_realized: Decimal::ZERO,
                starting_equity: Decimal::ZERO,
                peak_equity: Decimal::ZERO,
                current_equity: Decimal::ZERO,
                exposures: HashMap::new(),
                orders: VecDeque::new(),
                trip_count: 0,
            }),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn cooldown(&self) -> Duration {
        Duration::seconds(self.config.cooldown_secs.max(0))
    }

    /// Register a callback fired (outside the breaker lock) on every trip.
    pub fn on_trip<F>(&self, observer: F)
    where
        F: Fn(&TripEvent) + Send + Sync + 'static,
    {
        self.observers.lock().push(Arc::new(observer));
    }

    pub fn state(&self) -> BreakerState {
        self.state_at(Utc::now())
    }

    /// Current state, promoting `Open` to `HalfOpen` once the cooldown has elapsed.
    pub fn state_at(&self, now: DateTime<Utc>) -> BreakerState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);
        inner.state.clone()
    }

    fn refresh(&self, inner: &mut Inner, now: DateTime<Utc>) {
        if let BreakerState::Open { tripped_at, .. } = &inner.state {
            if now >= *tripped_at + self.cooldown() {
                info!("circuit breaker cooldown elapsed; half-open");
                inner.state = BreakerState::HalfOpen {
                    trial_in_flight: false,
                };
            }
        }
    }

    pub fn can_trade(&self, symbol: &str, notional: Price) -> bool {
        self.check(symbol, notional).is_ok()
    }

    pub fn check(&self, symbol: &str, notional: Price) -> Result<(), TradeBlock> {
        self.check_at(symbol, notional, Utc::now())
    }

    /// Pre-trade evaluation. In `HalfOpen` a successful check claims the single trial slot.
    pub fn check_at(
        &self,
        symbol: &str,
        notional: Price,
        now: DateTime<Utc>,
    ) -> Result<(), TradeBlock> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);

        if let BreakerState::Open { tripped_at, reason } = &inner.state {
            return Err(TradeBlock::BreakerOpen {
                reason: reason.clone(),
                until: *tripped_at + self.cooldown(),
            });
        }
        if matches!(
            inner.state,
            BreakerState::HalfOpen {
                trial_in_flight: true
            }
        ) {
            return Err(TradeBlock::TrialInFlight);
        }

        prune_orders(&mut inner, now);
        let recent = u32::try_from(inner.orders.len()).unwrap_or(u32::MAX);
        if self.config.max_orders_per_minute > 0 && recent >= self.config.max_orders_per_minute {
            let reason = TripReason::OrderRate {
                orders: recent,
                limit: self.config.max_orders_per_minute,
            };
            let event = self.trip_locked(&mut inner, reason.clone(), now);
            drop(inner);
            self.notify(event);
            return Err(TradeBlock::BreakerOpen {
                reason,
                until: now + self.cooldown(),
            });
        }

        let notional = notional.max(Decimal::ZERO);
        let current = inner.exposures.get(symbol).copied().unwrap_or_default();
        if notional > Decimal::ZERO {
            if current.is_zero() {
                let open = inner.exposures.len();
                if open >= self.config.max_positions {
                    return Err(TradeBlock::MaxPositions {
                        symbol: symbol.to_string(),
                        open,
                        limit: self.config.max_positions,
                    });
                }
            }
            if current + notional > self.config.max_symbol_exposure {
                return Err(TradeBlock::SymbolExposure {
                    symbol: symbol.to_string(),
                    current,
                    requested: notional,
                    limit: self.config.max_symbol_exposure,
                    excess: current + notional - self.config.max_symbol_exposure,
                });
            }
            let total: Price = inner.exposures.values().copied().sum();
            if total + notional > self.config.max_total_exposure {
                return Err(TradeBlock::TotalExposure {
                    current: total,
                    requested: notional,
                    limit: self.config.max_total_exposure,
                    excess: total + notional - self.config.max_total_exposure,
                });
            }
        }

        if let BreakerState::HalfOpen { trial_in_flight } = &mut inner.state {
            *trial_in_flight = true;
            info!(symbol, "circuit breaker half-open; trial trade admitted");
        }
        Ok(())
    }

    /// Give back a claimed trial slot whose order never reached a fill.
    pub fn release_trial(&self) {
        let mut inner = self.inner.lock();
        if let BreakerState::HalfOpen { trial_in_flight } = &mut inner.state {
            if *trial_in_flight {
                *trial_in_flight = false;
                debug!("circuit breaker trial slot released");
            }
        }
    }

    /// Count an order actually sent to the exchange toward the per-minute rate.
    pub fn record_order(&self) {
        self.record_order_at(Utc::now());
    }

    pub fn record_order_at(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        prune_orders(&mut inner, now);
        inner.orders.push_back(now);
    }

    /// Set the open notional for a symbol. Zero removes it.
    pub fn update_exposure(&self, symbol: &str, notional: Price) {
        let mut inner = self.inner.lock();
        if notional > Decimal::ZERO {
            inner.exposures.insert(symbol.to_string(), notional);
        } else {
            inner.exposures.remove(symbol);
        }
    }

    /// Replace all exposures, e.g. from a fresh equity breakdown.
    pub fn set_exposures(&self, exposures: HashMap<Symbol, Price>) {
        let mut inner = self.inner.lock();
        inner.exposures = exposures
            .into_iter()
            .filter(|(_, notional)| *notional > Decimal::ZERO)
            .collect();
    }

    pub fn record_trade_result(&self, pnl: Price, symbol: &str) {
        self.record_trade_result_at(pnl, symbol, Utc::now());
    }

    pub fn record_trade_result_at(&self, pnl: Price, symbol: &str, now: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);
        inner.daily_realized += pnl;
        if pnl < Decimal::ZERO {
            inner.consecutive_losses += 1;
        } else {
            inner.consecutive_losses = 0;
        }

        let state = inner.state.clone();
        let event = match state {
            BreakerState::Open { .. } => None,
            BreakerState::HalfOpen {
                trial_in_flight: true,
            } => {
                if pnl > Decimal::ZERO {
                    info!(symbol, %pnl, "trial trade profitable; circuit breaker closed");
                    inner.state = BreakerState::Closed;
                    inner.consecutive_losses = 0;
                    None
                } else {
                    Some(self.trip_locked(&mut inner, TripReason::TrialFailed { pnl }, now))
                }
            }
            _ => self
                .loss_trip_reason(&inner)
                .map(|reason| self.trip_locked(&mut inner, reason, now)),
        };
        drop(inner);
        if let Some(event) = event {
            self.notify(event);
        }
    }

    fn loss_trip_reason(&self, inner: &Inner) -> Option<TripReason> {
        if self.config.max_consecutive_losses > 0
            && inner.consecutive_losses >= self.config.max_consecutive_losses
        {
            return Some(TripReason::ConsecutiveLosses {
                count: inner.consecutive_losses,
                limit: self.config.max_consecutive_losses,
            });
        }
        if inner.starting_equity > Decimal::ZERO && inner.daily_realized < Decimal::ZERO {
            let loss_pct = -inner.daily_realized / inner.starting_equity * Decimal::ONE_HUNDRED;
            if loss_pct >= self.config.max_daily_loss_pct {
                return Some(TripReason::DailyLoss {
                    loss_pct,
                    limit_pct: self.config.max_daily_loss_pct,
                });
            }
        }
        None
    }

    pub fn update_equity(&self, equity: Price) {
        self.update_equity_at(equity, Utc::now());
    }

    pub fn update_equity_at(&self, equity: Price, now: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);
        inner.current_equity = equity;
        if inner.starting_equity.is_zero() {
            inner.starting_equity = equity;
        }
        if equity > inner.peak_equity {
            inner.peak_equity = equity;
        }
        if matches!(inner.state, BreakerState::Open { .. }) || inner.peak_equity <= Decimal::ZERO {
            return;
        }
        let drawdown_pct = (inner.peak_equity - equity) / inner.peak_equity * Decimal::ONE_HUNDRED;
        if drawdown_pct >= self.config.max_drawdown_pct {
            let reason = TripReason::Drawdown {
                drawdown_pct,
                limit_pct: self.config.max_drawdown_pct,
            };
            let event = self.trip_locked(&mut inner, reason, now);
            drop(inner);
            self.notify(event);
        }
    }

    /// Start a new trading day. Without an explicit value the current equity
    /// becomes the day's starting equity.
    pub fn reset_daily(&self, starting_equity: Option<Price>) {
        let mut inner = self.inner.lock();
        inner.daily_realized = Decimal::ZERO;
        inner.starting_equity = starting_equity.unwrap_or(inner.current_equity);
        info!(starting_equity = %inner.starting_equity, "circuit breaker daily counters reset");
    }

    /// Open the breaker by hand.
    pub fn trip(&self, note: impl Into<String>) {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);
        if matches!(inner.state, BreakerState::Open { .. }) {
            return;
        }
        let event = self.trip_locked(&mut inner, TripReason::Manual { note: note.into() }, now);
        drop(inner);
        self.notify(event);
    }

    /// Manual recovery: close the breaker, clear the loss streak and re-base
    /// the drawdown peak on current equity.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = BreakerState::Closed;
        inner.consecutive_losses = 0;
        inner.peak_equity = inner.current_equity;
        inner.orders.clear();
        info!("circuit breaker manually reset");
    }

    fn trip_locked(&self, inner: &mut Inner, reason: TripReason, now: DateTime<Utc>) -> TripEvent {
        inner.state = BreakerState::Open {
            tripped_at: now,
            reason: reason.clone(),
        };
        inner.trip_count += 1;
        let event = TripEvent {
            reason,
            tripped_at: now,
            cooldown_until: now + self.cooldown(),
            trip_count: inner.trip_count,
        };
        warn!(reason = %event.reason, until = %event.cooldown_until, "circuit breaker tripped");
        event
    }

    fn notify(&self, event: TripEvent) {
        let observers = self.observers.lock().clone();
        for observer in observers {
            observer(&event);
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state.clone(),
            consecutive_losses: inner.consecutive_losses,
            daily_realized_pnl: inner.daily_realized,
            starting_equity: inner.starting_equity,
            peak_equity: inner.peak_equity,
            current_equity: inner.current_equity,
            trip_count: inner.trip_count,
            saved_at: Utc::now(),
        }
    }

    /// Restore persisted counters. A trial that was in flight when the process
    /// stopped is forfeited: the breaker reopens with its original cooldown start.
    pub fn restore(&self, snapshot: BreakerSnapshot) {
        let mut inner = self.inner.lock();
        inner.state = match snapshot.state {
            BreakerState::HalfOpen {
                trial_in_flight: true,
            } => BreakerState::Open {
                tripped_at: snapshot.saved_at,
                reason: TripReason::TrialFailed {
                    pnl: Decimal::ZERO,
                },
            },
            other => other,
        };
        inner.consecutive_losses = snapshot.consecutive_losses;
        inner.daily_realized = snapshot.daily_realized_pnl;
        inner.starting_equity = snapshot.starting_equity;
        inner.peak_equity = snapshot.peak_equity;
        inner.current_equity = snapshot.current_equity;
        inner.trip_count = snapshot.trip_count;
        info!(state = inner.state.label(), "circuit breaker state restored");
    }
}

/// Drop submissions older than the one-minute rate window.
fn prune_orders(inner: &mut Inner, now: DateTime<Utc>) {
    let window_start = now - Duration::minutes(1);
    while inner.orders.front().is_some_and(|ts| *ts <= window_start) {
        inner.orders.pop_front();
    }
}
