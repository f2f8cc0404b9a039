//! Portfolio accounting primitives.

pub mod cash;
pub mod equity;
pub mod fees;
pub mod fifo;
pub mod pnl;
pub mod sqlite;
pub mod store;

use keel_core::Price;
use thiserror::Error;

pub use cash::{roi, CashEvent, CashEventLedger, CashEventType, CashStore};
pub use equity::{
    EquityBreakdown, EquityCalculator, LedgerView, MarkSource, OpenPosition, PositionValuation,
    QuoteSource,
};
pub use fees::{FeeRecord, FeeStore, FeeTracker, FeeType};
pub use fifo::{FifoMatcher, LotMatch, MatchResult};
pub use pnl::{DailyPnlSnapshot, PnlService, PnlStore};
pub use store::{
    BalanceSnapshotStore, CashSnapshot, HoldingsSnapshot, SqlitePortfolioStore,
};

/// Result alias for portfolio operations.
pub type PortfolioResult<T> = Result<T, PortfolioError>;

/// Portfolio-specific error type.
#[derive(Debug, Error)]
pub enum PortfolioError {
    /// Raised when a ledger entry carries a non-positive amount.
    #[error("amount must be positive, got {0}")]
    NonPositiveAmount(Price),
    /// Persistence failures bubbling up from a store.
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}
