//! Order lifecycle: submission, TTL-driven repositioning, cancellation and
//! fill ingestion.

pub mod fill_stream;
pub mod manager;
pub mod policy;
pub mod repository;

use keel_broker::BrokerError;
use keel_core::{
    Fill, IntentId, IntentStatus, ManagedOrder, OrderId, OrderPurpose, OrderStatus, OrderType,
    Price, Quantity, Side, Symbol,
};
use keel_portfolio::MatchResult;
use keel_risk::{GateBlock, TradeBlock};
use rust_decimal::Decimal;
use thiserror::Error;

pub use fill_stream::{FillSource, FillStreamConfig, FillStreamService};
pub use manager::{OrderManager, OrderManagerConfig, PollReport};
pub use policy::{round_to_tick, RepositionConfig, RepositionDecision, RepositionPolicy};
pub use repository::{FillRepository, OrderRepository, SqliteExecutionStore};

/// Why an intent was not accepted.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("invalid order request: {0}")]
    Invalid(String),
    #[error(transparent)]
    Gate(#[from] GateBlock),
    #[error(transparent)]
    Blocked(#[from] TradeBlock),
    #[error("trade notional {requested} exceeds per-trade cap {limit} by {excess}")]
    TradeNotional {
        requested: Price,
        limit: Price,
        excess: Price,
    },
    #[error("daily notional {used} + {requested} exceeds daily cap {limit} by {excess}")]
    DailyNotional {
        used: Price,
        requested: Price,
        limit: Price,
        excess: Price,
    },
    #[error("no price available to size an order for {0}")]
    NoPrice(Symbol),
    #[error("exchange refused the order: {0}")]
    Exchange(#[from] BrokerError),
    #[error("unknown intent {0}")]
    UnknownIntent(IntentId),
    #[error("unknown order {0}")]
    UnknownOrder(OrderId),
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// A strategy's trade decision, sized by notional or by quantity.
#[derive(Clone, Debug, PartialEq)]
pub struct IntentRequest {
    pub symbol: Symbol,
    pub side: Side,
    pub purpose: OrderPurpose,
    pub order_type: OrderType,
    pub notional: Option<Price>,
    pub quantity: Option<Quantity>,
    pub limit_price: Option<Price>,
}

impl IntentRequest {
    pub fn market(symbol: impl Into<Symbol>, side: Side, purpose: OrderPurpose) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            purpose,
            order_type: OrderType::Market,
            notional: None,
            quantity: None,
            limit_price: None,
        }
    }

    pub fn limit(symbol: impl Into<Symbol>, side: Side, purpose: OrderPurpose, price: Price) -> Self {
        Self {
            order_type: OrderType::Limit,
            limit_price: Some(price),
            ..Self::market(symbol, side, purpose)
        }
    }

    #[must_use]
    pub fn with_notional(mut self, notional: Price) -> Self {
        self.notional = Some(notional);
        self.quantity = None;
        self
    }

    #[must_use]
    pub fn with_quantity(mut self, quantity: Quantity) -> Self {
        self.quantity = Some(quantity);
        self.notional = None;
        self
    }

    pub fn validate(&self) -> Result<(), SubmitError> {
        match (self.notional, self.quantity) {
            (Some(value), None) | (None, Some(value)) if value > Decimal::ZERO => {}
            (Some(_), Some(_)) => {
                return Err(SubmitError::Invalid(
                    "set either notional or quantity, not both".into(),
                ))
            }
            (None, None) => {
                return Err(SubmitError::Invalid(
                    "an intent needs a notional or a quantity".into(),
                ))
            }
            _ => return Err(SubmitError::Invalid("order size must be positive".into())),
        }
        match (self.order_type, self.limit_price) {
            (OrderType::Limit, Some(price)) if price > Decimal::ZERO => Ok(()),
            (OrderType::Limit, _) => Err(SubmitError::Invalid(
                "limit intents need a positive limit price".into(),
            )),
            (OrderType::Market, _) => Ok(()),
        }
    }
}

/// Lifecycle notifications broadcast by the [`OrderManager`].
#[derive(Clone, Debug)]
pub enum OrderEvent {
    Submitted {
        order: ManagedOrder,
    },
    StatusChanged {
        order_id: OrderId,
        intent_id: IntentId,
        from: OrderStatus,
        to: OrderStatus,
    },
    Repositioned {
        intent_id: IntentId,
        old_order_id: OrderId,
        new_order_id: OrderId,
        price: Price,
        replace_count: u32,
    },
    Cancelled {
        order_id: OrderId,
        intent_id: IntentId,
        reason: String,
    },
    IntentCompleted {
        intent_id: IntentId,
        status: IntentStatus,
        detail: Option<String>,
    },
}

/// A newly applied fill and what it did to the ledger.
#[derive(Clone, Debug)]
pub struct FillEvent {
    pub fill: Fill,
    pub source: FillSource,
    /// Present for sells that closed lots.
    pub matched: Option<MatchResult>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn intent_requests_need_exactly_one_size() {
        let base = IntentRequest::limit("XBTUSD", Side::Buy, OrderPurpose::Entry, dec!(100));
        assert!(base.clone().validate().is_err());
        assert!(base.clone().with_notional(dec!(50)).validate().is_ok());
        assert!(base.clone().with_quantity(dec!(0)).validate().is_err());
        let mut both = base.with_notional(dec!(50));
        both.quantity = Some(dec!(1));
        assert!(both.validate().is_err());
        let market = IntentRequest::market("XBTUSD", Side::Sell, OrderPurpose::Exit)
            .with_quantity(dec!(0.5));
        assert!(market.validate().is_ok());
    }

    #[test]
    fn rejections_read_as_sentences() {
        let err = SubmitError::DailyNotional {
            used: dec!(900),
            requested: dec!(150),
            limit: dec!(1000),
            excess: dec!(50),
        };
        assert_eq!(
            err.to_string(),
            "daily notional 900 + 150 exceeds daily cap 1000 by 50"
        );
    }
}
