//! Exchange-agnostic traits used by the rest of the engine.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_core::{
    AccountBalance, BidAsk, Fill, Holding, OrderId, OrderStatus, OrderType, Price, Quantity,
    Side, Symbol,
};
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

pub mod events;
pub mod guarded;
pub mod limiter;
pub mod retry;
mod status;

pub use events::{EventBus, EventHandler, EventKind, StreamEvent, SubscriptionId};
pub use governor::Quota;
pub use guarded::GuardedExchange;
pub use limiter::{RateLimiter, RateLimiterError};
pub use retry::{run_with_reconnect, RetryPolicy};
pub use status::normalize_status;

/// Convenience alias for broker results.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Common error type returned by exchange implementations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Represents transport-level failures (connection resets, DNS, TLS).
    #[error("transport error: {0}")]
    Transport(String),
    /// The call did not complete within its deadline.
    #[error("exchange call timed out after {0:?}")]
    Timeout(Duration),
    /// The exchange throttled the request.
    #[error("rate limited: {0}")]
    RateLimited(String),
    /// The exchange answered with a server-side failure.
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },
    /// Returned when authentication fails or credentials are missing.
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// Returned when the request parameters are invalid for the target exchange.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    /// The exchange does not know the referenced order.
    #[error("not found: {0}")]
    NotFound(String),
    /// Wraps serialization or parsing errors.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Exchange responded with a business error.
    #[error("exchange error: {0}")]
    Exchange(String),
    /// A catch-all branch for other issues.
    #[error("unexpected error: {0}")]
    Other(String),
}

impl BrokerError {
    /// Whether retrying the same call may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) | Self::RateLimited(_) => true,
            Self::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Helper used by connectors when mapping any error type into a broker error.
    pub fn from_display(err: impl std::fmt::Display, kind: BrokerErrorKind) -> Self {
        match kind {
            BrokerErrorKind::Transport => Self::Transport(err.to_string()),
            BrokerErrorKind::Authentication => Self::Authentication(err.to_string()),
            BrokerErrorKind::InvalidRequest => Self::InvalidRequest(err.to_string()),
            BrokerErrorKind::Serialization => Self::Serialization(err.to_string()),
            BrokerErrorKind::Exchange => Self::Exchange(err.to_string()),
            BrokerErrorKind::Other => Self::Other(err.to_string()),
        }
    }
}

/// Enumerates the broad families of broker errors.
#[derive(Debug, Clone, Copy)]
pub enum BrokerErrorKind {
    Transport,
    Authentication,
    InvalidRequest,
    Serialization,
    Exchange,
    Other,
}

/// Order placement payload. Exactly one of `quantity` or `notional` is set.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PlaceOrderRequest {
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub client_order_id: String,
    pub quantity: Option<Quantity>,
    pub notional: Option<Price>,
    pub limit_price: Option<Price>,
}

impl PlaceOrderRequest {
    /// Reject malformed requests before any network call is made.
    pub fn validate(&self) -> BrokerResult<()> {
        match (self.quantity, self.notional) {
            (Some(_), Some(_)) | (None, None) => {
                return Err(BrokerError::InvalidRequest(
                    "exactly one of quantity or notional must be set".into(),
                ))
            }
            (Some(qty), None) if qty <= Decimal::ZERO => {
                return Err(BrokerError::InvalidRequest(format!(
                    "quantity must be positive, got {qty}"
                )))
            }
            (None, Some(notional)) if notional <= Decimal::ZERO => {
                return Err(BrokerError::InvalidRequest(format!(
                    "notional must be positive, got {notional}"
                )))
            }
            _ => {}
        }
        match (self.order_type, self.limit_price) {
            (OrderType::Limit, None) => Err(BrokerError::InvalidRequest(
                "limit orders require a limit price".into(),
            )),
            (OrderType::Limit, Some(price)) if price <= Decimal::ZERO => Err(
                BrokerError::InvalidRequest(format!("limit price must be positive, got {price}")),
            ),
            _ => Ok(()),
        }
    }
}

/// Exchange acknowledgement for a placed order.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct OrderAck {
    pub order_id: OrderId,
    /// Raw exchange status string.
    pub status: String,
}

/// Exchange view of an order.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ExchangeOrder {
    pub order_id: OrderId,
    pub client_order_id: Option<String>,
    pub symbol: Symbol,
    pub side: Side,
    /// Raw exchange status string.
    pub status: String,
    pub filled_quantity: Quantity,
    pub avg_fill_price: Option<Price>,
    pub limit_price: Option<Price>,
    pub updated_at: DateTime<Utc>,
}

impl ExchangeOrder {
    /// Internal status, refined with the fill quantity the exchange reports.
    #[must_use]
    pub fn normalized_status(&self) -> Option<OrderStatus> {
        let status = normalize_status(&self.status)?;
        if status == OrderStatus::Working && self.filled_quantity > Decimal::ZERO {
            return Some(OrderStatus::PartiallyFilled);
        }
        Some(status)
    }
}

/// Capability interface every exchange binding (live, paper, test double) implements.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Human-friendly name of the binding used for logging purposes.
    fn name(&self) -> &str;

    /// Retrieve the latest known account balances.
    async fn account_balances(&self) -> BrokerResult<Vec<AccountBalance>>;

    /// Retrieve the assets currently held at the exchange.
    async fn holdings(&self) -> BrokerResult<Vec<Holding>>;

    /// Place a new order on the exchange.
    async fn place_order(&self, request: PlaceOrderRequest) -> BrokerResult<OrderAck>;

    /// Fetch the exchange view of an order.
    async fn get_order(&self, order_id: &str) -> BrokerResult<ExchangeOrder>;

    /// Executions reported for an order so far.
    async fn order_fills(&self, order_id: &str) -> BrokerResult<Vec<Fill>>;

    /// Cancel an existing order by identifier.
    async fn cancel_order(&self, order_id: &str) -> BrokerResult<()>;

    /// Top of book for one symbol, `None` when the exchange has no quote.
    async fn best_bid_ask(&self, symbol: &str) -> BrokerResult<Option<BidAsk>>;

    /// Top of book for several symbols. Symbols without a quote are omitted.
    async fn best_bid_ask_batch(&self, symbols: &[Symbol]) -> BrokerResult<Vec<BidAsk>> {
        let mut quotes = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            if let Some(quote) = self.best_bid_ask(symbol).await? {
                quotes.push(quote);
            }
        }
        Ok(quotes)
    }
}

#[async_trait]
impl<E: Exchange + ?Sized> Exchange for std::sync::Arc<E> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn account_balances(&self) -> BrokerResult<Vec<AccountBalance>> {
        (**self).account_balances().await
    }

    async fn holdings(&self) -> BrokerResult<Vec<Holding>> {
        (**self).holdings().await
    }

    async fn place_order(&self, request: PlaceOrderRequest) -> BrokerResult<OrderAck> {
        (**self).place_order(request).await
    }

    async fn get_order(&self, order_id: &str) -> BrokerResult<ExchangeOrder> {
        (**self).get_order(order_id).await
    }

    async fn order_fills(&self, order_id: &str) -> BrokerResult<Vec<Fill>> {
        (**self).order_fills(order_id).await
    }

    async fn cancel_order(&self, order_id: &str) -> BrokerResult<()> {
        (**self).cancel_order(order_id).await
    }

    async fn best_bid_ask(&self, symbol: &str) -> BrokerResult<Option<BidAsk>> {
        (**self).best_bid_ask(symbol).await
    }

    async fn best_bid_ask_batch(&self, symbols: &[Symbol]) -> BrokerResult<Vec<BidAsk>> {
        (**self).best_bid_ask_batch(symbols).await
    }
}

/// Synchronous top-of-book lookup from a local cache (focus snapshots, the paper book).
pub trait BookSource: Send + Sync {
    fn book(&self, symbol: &str) -> Option<BidAsk>;
}

impl<F> BookSource for F
where
    F: Fn(&str) -> Option<BidAsk> + Send + Sync,
{
    fn book(&self, symbol: &str) -> Option<BidAsk> {
        self(symbol)
    }
}

/// Helper trait used by bindings to (de)serialize exchange payloads.
pub trait PayloadExt: Sized {
    /// Deserialize JSON bytes into a strongly typed payload.
    fn from_json_bytes(bytes: &[u8]) -> BrokerResult<Self>
    where
        Self: DeserializeOwned,
    {
        serde_json::from_slice(bytes).map_err(|err| {
            BrokerError::Serialization(format!("failed to deserialize payload: {err}"))
        })
    }
}

impl<T> PayloadExt for T where T: DeserializeOwned {}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request() -> PlaceOrderRequest {
        PlaceOrderRequest {
            symbol: "XBTUSD".into(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            client_order_id: "i-r0".into(),
            quantity: None,
            notional: Some(dec!(50)),
            limit_price: Some(dec!(100)),
        }
    }

    #[test]
    fn transient_classification() {
        assert!(BrokerError::Transport("reset".into()).is_transient());
        assert!(BrokerError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(BrokerError::Server {
            status: 502,
            message: "bad gateway".into()
        }
        .is_transient());
        assert!(!BrokerError::Server {
            status: 400,
            message: "bad".into()
        }
        .is_transient());
        assert!(!BrokerError::InsufficientFunds("usd".into()).is_transient());
    }

    #[test]
    fn request_validation() {
        assert!(request().validate().is_ok());
        let mut both = request();
        both.quantity = Some(dec!(1));
        assert!(both.validate().is_err());
        let mut no_price = request();
        no_price.limit_price = None;
        assert!(no_price.validate().is_err());
        let mut market = request();
        market.order_type = OrderType::Market;
        market.limit_price = None;
        assert!(market.validate().is_ok());
    }

    #[test]
    fn exchange_order_with_fills_is_partial() {
        let order = ExchangeOrder {
            order_id: "O-1".into(),
            client_order_id: None,
            symbol: "XBTUSD".into(),
            side: Side::Buy,
            status: "open".into(),
            filled_quantity: dec!(0.1),
            avg_fill_price: Some(dec!(100)),
            limit_price: Some(dec!(100)),
            updated_at: Utc::now(),
        };
        assert_eq!(order.normalized_status(), Some(OrderStatus::PartiallyFilled));
    }
}
