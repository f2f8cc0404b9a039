use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use keel_core::{utc_day_start, FillId, OrderId, Price, Symbol, TradingMode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::PortfolioResult;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeType {
    Trading,
    Maker,
    Taker,
    Other,
}

impl FeeType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trading => "trading",
            Self::Maker => "maker",
            Self::Taker => "taker",
            Self::Other => "other",
        }
    }
}

impl FromStr for FeeType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "trading" => Ok(Self::Trading),
            "maker" => Ok(Self::Maker),
            "taker" => Ok(Self::Taker),
            "other" => Ok(Self::Other),
            other => Err(format!("unknown fee type '{other}'")),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct FeeRecord {
    pub fill_id: FillId,
    pub order_id: OrderId,
    pub symbol: Symbol,
    pub amount: Price,
    pub currency: String,
    pub fee_type: FeeType,
    pub mode: TradingMode,
    pub recorded_at: DateTime<Utc>,
}

/// Persistence for the fee ledger, keyed by fill id.
pub trait FeeStore: Send + Sync {
    /// Insert a fee row. Returns `false` when the fill id was already recorded.
    fn insert_fee(&self, record: &FeeRecord) -> anyhow::Result<bool>;

    /// Sum of fees for a mode, optionally narrowed by symbol and a lower time bound.
    fn sum_fees(
        &self,
        mode: TradingMode,
        symbol: Option<&str>,
        since: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Price>;
}

#[derive(Clone)]
pub struct FeeTracker {
    store: Arc<dyn FeeStore>,
}

impl FeeTracker {
    pub fn new(store: Arc<dyn FeeStore>) -> Self {
        Self { store }
    }

    /// Record the fee paid on a fill. Non-positive amounts and repeated fill ids are no-ops.
    #[allow(clippy::too_many_arguments)]
    pub fn record_fee(
        &self,
        fill_id: &str,
        order_id: &str,
        symbol: &str,
        amount: Price,
        currency: &str,
        fee_type: FeeType,
        mode: TradingMode,
    ) -> PortfolioResult<bool> {
        if amount <= Decimal::ZERO {
            return Ok(false);
        }
        let inserted = self.store.insert_fee(&FeeRecord {
            fill_id: fill_id.to_string(),
            order_id: order_id.to_string(),
            symbol: symbol.to_string(),
            amount,
            currency: currency.to_string(),
            fee_type,
            mode,
            recorded_at: Utc::now(),
        })?;
        if !inserted {
            debug!(fill_id, "fee already recorded");
        }
        Ok(inserted)
    }

    pub fn total_fees(&self, mode: TradingMode) -> PortfolioResult<Price> {
        Ok(self.store.sum_fees(mode, None, None)?)
    }

    pub fn fees_for_symbol(&self, mode: TradingMode, symbol: &str) -> PortfolioResult<Price> {
        Ok(self.store.sum_fees(mode, Some(symbol), None)?)
    }

    /// Fees recorded since UTC midnight of `now`.
    pub fn fees_today(&self, mode: TradingMode, now: DateTime<Utc>) -> PortfolioResult<Price> {
        Ok(self.store.sum_fees(mode, None, Some(utc_day_start(now)))?)
    }
}
