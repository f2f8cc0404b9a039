//! Fundamental data types shared across the entire workspace.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

mod order;

pub use order::{
    client_order_id, parse_client_order_id, Intent, IntentStatus, ManagedOrder, OrderStatus,
    TransitionError,
};

/// Alias for price precision.
pub type Price = Decimal;
/// Alias for quantity precision.
pub type Quantity = Decimal;
/// Alias used for human-readable market symbols (e.g., `XBTUSD`).
pub type Symbol = String;
/// Unique identifier assigned to orders by the exchange.
pub type OrderId = String;
/// Exchange-assigned execution identifier, unique within a trading mode.
pub type FillId = String;
/// Identifier shared by an order and all of its replacements.
pub type IntentId = String;

/// Whether the engine trades against a simulated ledger or real funds.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    #[default]
    Paper,
    Live,
}

impl TradingMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Paper => "paper",
            Self::Live => "live",
        }
    }

    #[must_use]
    pub fn is_paper(self) -> bool {
        matches!(self, Self::Paper)
    }
}

impl fmt::Display for TradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradingMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "paper" => Ok(Self::Paper),
            "live" => Ok(Self::Live),
            other => Err(format!("unsupported trading mode '{other}'")),
        }
    }
}

/// The side of an order or fill.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Buy the instrument.
    Buy,
    /// Sell the instrument.
    Sell,
}

impl Side {
    /// Returns the opposite side (buy <-> sell).
    #[must_use]
    pub fn inverse(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "buy" | "b" => Ok(Self::Buy),
            "sell" | "s" => Ok(Self::Sell),
            other => Err(format!("unsupported side '{other}'")),
        }
    }
}

/// Order execution style.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    /// Execute immediately at best available price.
    Market,
    /// Execute at the provided limit price.
    Limit,
}

impl OrderType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Market => "market",
            Self::Limit => "limit",
        }
    }
}

impl FromStr for OrderType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "market" => Ok(Self::Market),
            "limit" => Ok(Self::Limit),
            other => Err(format!("unsupported order type '{other}'")),
        }
    }
}

/// Why the strategy wants the order: opening exposure or closing it.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderPurpose {
    Entry,
    Exit,
}

impl OrderPurpose {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::Exit => "exit",
        }
    }
}

impl FromStr for OrderPurpose {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "entry" => Ok(Self::Entry),
            "exit" => Ok(Self::Exit),
            other => Err(format!("unsupported order purpose '{other}'")),
        }
    }
}

/// Errors raised when a fill fails boundary validation.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FillValidationError {
    #[error("fill {fill_id} has non-positive quantity {quantity}")]
    NonPositiveQuantity { fill_id: FillId, quantity: Quantity },
    #[error("fill {fill_id} has non-positive price {price}")]
    NonPositivePrice { fill_id: FillId, price: Price },
    #[error("fill {fill_id} has negative fee {fee}")]
    NegativeFee { fill_id: FillId, fee: Price },
    #[error("fill is missing an identifier")]
    MissingFillId,
    #[error("execution message is missing field '{0}'")]
    MissingField(&'static str),
}

/// Immutable execution record reported by the exchange.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Fill {
    pub fill_id: FillId,
    pub order_id: OrderId,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Quantity,
    pub price: Price,
    pub fee: Price,
    pub fee_currency: String,
    pub executed_at: DateTime<Utc>,
    pub mode: TradingMode,
}

impl Fill {
    /// Reject fills that must never reach the ledger.
    pub fn validate(&self) -> Result<(), FillValidationError> {
        if self.fill_id.trim().is_empty() {
            return Err(FillValidationError::MissingFillId);
        }
        if self.quantity <= Decimal::ZERO {
            return Err(FillValidationError::NonPositiveQuantity {
                fill_id: self.fill_id.clone(),
                quantity: self.quantity,
            });
        }
        if self.price <= Decimal::ZERO {
            return Err(FillValidationError::NonPositivePrice {
                fill_id: self.fill_id.clone(),
                price: self.price,
            });
        }
        if self.fee < Decimal::ZERO {
            return Err(FillValidationError::NegativeFee {
                fill_id: self.fill_id.clone(),
                fee: self.fee,
            });
        }
        Ok(())
    }

    /// Traded value excluding fees.
    #[must_use]
    pub fn notional(&self) -> Price {
        self.quantity * self.price
    }
}

/// A single unmatched (or partially matched) buy execution.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Lot {
    pub symbol: Symbol,
    pub quantity: Quantity,
    pub price: Price,
    /// Buy-side fee still attributed to the remaining quantity.
    pub fee: Price,
    pub fill_id: FillId,
    pub executed_at: DateTime<Utc>,
}

impl Lot {
    /// Fee-inclusive cost of the remaining quantity.
    #[must_use]
    pub fn cost(&self) -> Price {
        self.price * self.quantity + self.fee
    }
}

/// Top of book quote.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct BidAsk {
    pub symbol: Symbol,
    pub bid: Price,
    pub ask: Price,
    pub observed_at: DateTime<Utc>,
}

impl BidAsk {
    #[must_use]
    pub fn mid(&self) -> Price {
        (self.bid + self.ask) / Decimal::TWO
    }

    #[must_use]
    pub fn spread(&self) -> Price {
        self.ask - self.bid
    }

    /// Spread as a percentage of the mid price.
    #[must_use]
    pub fn spread_pct(&self) -> Option<Decimal> {
        spread_pct(self.bid, self.ask)
    }

    /// The side of the book a resting order of `side` joins.
    #[must_use]
    pub fn same_side(&self, side: Side) -> Price {
        match side {
            Side::Buy => self.bid,
            Side::Sell => self.ask,
        }
    }
}

fn spread_pct(bid: Price, ask: Price) -> Option<Decimal> {
    let mid = (bid + ask) / Decimal::TWO;
    if bid <= Decimal::ZERO || ask <= Decimal::ZERO || mid <= Decimal::ZERO {
        return None;
    }
    Some((ask - bid) / mid * Decimal::ONE_HUNDRED)
}

/// Raw ticker update as delivered by the market data stream.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct MarketTick {
    pub symbol: Symbol,
    pub bid: Option<Price>,
    pub ask: Option<Price>,
    pub last: Option<Price>,
    #[serde(default)]
    pub volume_24h: Option<Quantity>,
    pub exchange_timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

/// Update frequency class of a symbol in the market data pipeline.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketTier {
    /// Small, fast-flushed set.
    Focus,
    /// Everything else, flushed slowly.
    Scout,
}

impl MarketTier {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Focus => "focus",
            Self::Scout => "scout",
        }
    }
}

impl FromStr for MarketTier {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "focus" => Ok(Self::Focus),
            "scout" => Ok(Self::Scout),
            other => Err(format!("unsupported market tier '{other}'")),
        }
    }
}

/// Coalesced view of the latest market state for one symbol.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct MarketSnapshot {
    pub symbol: Symbol,
    pub tier: MarketTier,
    pub bid: Option<Price>,
    pub ask: Option<Price>,
    pub last: Option<Price>,
    pub volume_24h: Option<Quantity>,
    pub observed_at: DateTime<Utc>,
    /// Number of ticks folded into this snapshot since the previous flush.
    pub tick_count: u64,
}

impl MarketSnapshot {
    /// Mid price when both sides are quoted, otherwise the last trade.
    #[must_use]
    pub fn mark(&self) -> Option<Price> {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) if bid > Decimal::ZERO && ask > Decimal::ZERO => {
                Some((bid + ask) / Decimal::TWO)
            }
            _ => self.last.filter(|price| *price > Decimal::ZERO),
        }
    }

    #[must_use]
    pub fn spread_pct(&self) -> Option<Decimal> {
        spread_pct(self.bid?, self.ask?)
    }

    #[must_use]
    pub fn bid_ask(&self) -> Option<BidAsk> {
        Some(BidAsk {
            symbol: self.symbol.clone(),
            bid: self.bid?,
            ask: self.ask?,
            observed_at: self.observed_at,
        })
    }
}

/// Simple representation of an account balance by currency.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct AccountBalance {
    pub currency: String,
    pub total: Price,
    pub available: Price,
    pub updated_at: DateTime<Utc>,
}

/// Quantity of an asset held at the exchange (spot).
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Holding {
    pub symbol: Symbol,
    pub quantity: Quantity,
    pub updated_at: DateTime<Utc>,
}

/// Message delivered by the live execution stream.
///
/// `exec_type == "trade"` marks a fill; every other message is treated as an
/// order status update.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ExecutionMessage {
    pub exec_type: String,
    pub order_id: OrderId,
    #[serde(default)]
    pub client_order_id: Option<String>,
    #[serde(default)]
    pub fill_id: Option<FillId>,
    #[serde(default)]
    pub symbol: Option<Symbol>,
    #[serde(default)]
    pub side: Option<Side>,
    #[serde(default)]
    pub quantity: Option<Quantity>,
    #[serde(default)]
    pub price: Option<Price>,
    #[serde(default)]
    pub fee: Option<Price>,
    #[serde(default)]
    pub fee_currency: Option<String>,
    #[serde(default)]
    pub order_status: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionMessage {
    pub const TRADE: &'static str = "trade";

    #[must_use]
    pub fn is_trade(&self) -> bool {
        self.exec_type.eq_ignore_ascii_case(Self::TRADE)
    }

    /// Build a trade message from an existing fill (used by REST fallbacks and simulators).
    #[must_use]
    pub fn from_fill(fill: &Fill) -> Self {
        Self {
            exec_type: Self::TRADE.to_string(),
            order_id: fill.order_id.clone(),
            client_order_id: None,
            fill_id: Some(fill.fill_id.clone()),
            symbol: Some(fill.symbol.clone()),
            side: Some(fill.side),
            quantity: Some(fill.quantity),
            price: Some(fill.price),
            fee: Some(fill.fee),
            fee_currency: Some(fill.fee_currency.clone()),
            order_status: None,
            timestamp: fill.executed_at,
        }
    }

    /// Convert a trade message into a validated [`Fill`].
    pub fn to_fill(&self, mode: TradingMode) -> Result<Fill, FillValidationError> {
        let fill = Fill {
            fill_id: self
                .fill_id
                .clone()
                .ok_or(FillValidationError::MissingFillId)?,
            order_id: self.order_id.clone(),
            symbol: self
                .symbol
                .clone()
                .ok_or(FillValidationError::MissingField("symbol"))?,
            side: self.side.ok_or(FillValidationError::MissingField("side"))?,
            quantity: self
                .quantity
                .ok_or(FillValidationError::MissingField("quantity"))?,
            price: self
                .price
                .ok_or(FillValidationError::MissingField("price"))?,
            fee: self.fee.unwrap_or(Decimal::ZERO),
            fee_currency: self
                .fee_currency
                .clone()
                .unwrap_or_else(|| "USD".to_string()),
            executed_at: self.timestamp,
            mode,
        };
        fill.validate()?;
        Ok(fill)
    }
}

/// Generate a fresh intent identifier.
#[must_use]
pub fn new_intent_id() -> IntentId {
    Uuid::new_v4().simple().to_string()
}

/// Start of the UTC day containing `ts`.
#[must_use]
pub fn utc_day_start(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .unwrap_or(ts)
}

/// Convert a whole number of seconds into a chrono duration, clamping negatives to zero.
#[must_use]
pub fn seconds(secs: i64) -> Duration {
    Duration::seconds(secs.max(0))
}
