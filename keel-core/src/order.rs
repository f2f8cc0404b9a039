use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    IntentId, OrderId, OrderPurpose, OrderType, Price, Quantity, Side, Symbol, TradingMode,
};

/// High-level lifecycle state of a managed order.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Created locally, not yet sent.
    New,
    /// Sent to the exchange, not yet acknowledged as resting.
    Submitted,
    /// Resting on the book.
    Working,
    /// Partially filled and still working.
    PartiallyFilled,
    /// Completely filled.
    Filled,
    /// Cancel requested, confirmation outstanding.
    CancelPending,
    /// Cancelled by the user or the exchange.
    Cancelled,
    /// Cancelled and superseded by a repositioned child order.
    Replaced,
    /// Rejected by the exchange.
    Rejected,
    /// Failed locally (broker error, validation).
    Failed,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 10] = [
        Self::New,
        Self::Submitted,
        Self::Working,
        Self::PartiallyFilled,
        Self::Filled,
        Self::CancelPending,
        Self::Cancelled,
        Self::Replaced,
        Self::Rejected,
        Self::Failed,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Submitted => "submitted",
            Self::Working => "working",
            Self::PartiallyFilled => "partially_filled",
            Self::Filled => "filled",
            Self::CancelPending => "cancel_pending",
            Self::Cancelled => "cancelled",
            Self::Replaced => "replaced",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Cancelled | Self::Replaced | Self::Rejected | Self::Failed
        )
    }

    /// Still resting (or about to rest) at the exchange.
    #[must_use]
    pub fn is_open(self) -> bool {
        !self.is_terminal()
    }

    /// Whether `self -> next` is a legal edge of the order lifecycle.
    ///
    /// Terminal states are final except for `Cancelled -> Replaced`. A
    /// `CancelPending` order may fall back to `Working`/`PartiallyFilled` when the
    /// exchange rejects the cancel, or complete as `Filled` when the fill won
    /// the race.
    #[must_use]
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        if self == next {
            return false;
        }
        match (self, next) {
            (Cancelled, Replaced) => true,
            (from, _) if from.is_terminal() => false,
            (_, Rejected | Failed) => true,
            (_, New) => false,
            (New, _) => true,
            (Submitted, _) => next != Replaced,
            (Working, PartiallyFilled | Filled | CancelPending | Cancelled) => true,
            (PartiallyFilled, Filled | CancelPending | Cancelled) => true,
            (CancelPending, Working | PartiallyFilled | Filled | Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == value)
            .ok_or_else(|| format!("unknown order status '{value}'"))
    }
}

/// Rejected lifecycle edge.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("order {order_id}: illegal transition {from} -> {to}")]
pub struct TransitionError {
    pub order_id: OrderId,
    pub from: OrderStatus,
    pub to: OrderStatus,
}

/// Exchange-side idempotency key for the `replace_count`-th order of an intent.
#[must_use]
pub fn client_order_id(intent_id: &str, replace_count: u32) -> String {
    format!("{intent_id}-r{replace_count}")
}

/// Inverse of [`client_order_id`].
#[must_use]
pub fn parse_client_order_id(value: &str) -> Option<(IntentId, u32)> {
    let (intent, count) = value.rsplit_once("-r")?;
    if intent.is_empty() {
        return None;
    }
    let count = count.parse().ok()?;
    Some((intent.to_string(), count))
}

/// Order tracked by the order manager through its lifecycle.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ManagedOrder {
    pub order_id: OrderId,
    pub client_order_id: String,
    pub intent_id: IntentId,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub purpose: OrderPurpose,
    pub notional: Option<Price>,
    pub quantity: Option<Quantity>,
    pub limit_price: Option<Price>,
    /// Same-side book price when the intent's first order went out; repositions are capped against it.
    pub anchor_price: Option<Price>,
    pub status: OrderStatus,
    pub replace_count: u32,
    pub parent_order_id: Option<OrderId>,
    pub filled_quantity: Quantity,
    pub avg_fill_price: Option<Price>,
    pub submitted_at: DateTime<Utc>,
    pub ttl_secs: i64,
    pub updated_at: DateTime<Utc>,
    pub mode: TradingMode,
}

impl ManagedOrder {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::seconds(self.ttl_secs)
    }

    #[must_use]
    pub fn ttl_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.submitted_at >= self.ttl()
    }

    /// Apply a lifecycle edge. Returns `Ok(false)` when already in `next`.
    pub fn transition(
        &mut self,
        next: OrderStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, TransitionError> {
        if self.status == next {
            return Ok(false);
        }
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                order_id: self.order_id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(true)
    }

    /// Quantity left to fill, when the order was sized in units.
    #[must_use]
    pub fn remaining_quantity(&self) -> Option<Quantity> {
        self.quantity
            .map(|qty| (qty - self.filled_quantity).max(Decimal::ZERO))
    }
}

/// Completion state of an intent group.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Active,
    Filled,
    /// Ran out of reprice attempts or aborted on a wide spread.
    Exhausted,
    Cancelled,
    Failed,
}

impl IntentStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Filled => "filled",
            Self::Exhausted => "exhausted",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn is_complete(self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl FromStr for IntentStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "active" => Ok(Self::Active),
            "filled" => Ok(Self::Filled),
            "exhausted" => Ok(Self::Exhausted),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown intent status '{other}'")),
        }
    }
}

/// One logical trading decision spanning an order and its replacements.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Intent {
    pub intent_id: IntentId,
    pub symbol: Symbol,
    pub side: Side,
    pub purpose: OrderPurpose,
    pub order_type: OrderType,
    pub notional: Option<Price>,
    pub quantity: Option<Quantity>,
    pub limit_price: Option<Price>,
    /// Quote-currency size at submission, from the limit price or the quote mid.
    #[serde(default)]
    pub estimated_notional: Option<Price>,
    pub status: IntentStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub detail: Option<String>,
    pub mode: TradingMode,
}

impl Intent {
    /// Mark the intent complete once. Later completions are ignored.
    pub fn complete(&mut self, status: IntentStatus, detail: Option<String>, now: DateTime<Utc>) -> bool {
        if self.status.is_complete() || !status.is_complete() {
            return false;
        }
        self.status = status;
        self.detail = detail;
        self.completed_at = Some(now);
        true
    }
}
