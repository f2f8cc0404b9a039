//! Non-trading cash movements. These change the balance but are never P&L.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use keel_core::{Price, TradingMode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{PortfolioError, PortfolioResult};

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CashEventType {
    Deposit,
    Withdrawal,
    TransferIn,
    TransferOut,
}

impl CashEventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deposit => "deposit",
            Self::Withdrawal => "withdrawal",
            Self::TransferIn => "transfer_in",
            Self::TransferOut => "transfer_out",
        }
    }

    /// Whether the event adds to invested capital.
    #[must_use]
    pub fn is_inflow(self) -> bool {
        matches!(self, Self::Deposit | Self::TransferIn)
    }
}

impl FromStr for CashEventType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "deposit" => Ok(Self::Deposit),
            "withdrawal" => Ok(Self::Withdrawal),
            "transfer_in" => Ok(Self::TransferIn),
            "transfer_out" => Ok(Self::TransferOut),
            other => Err(format!("unknown cash event type '{other}'")),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct CashEvent {
    pub id: Option<i64>,
    pub event_type: CashEventType,
    /// Always positive; direction comes from `event_type`.
    pub amount: Price,
    pub currency: String,
    pub description: String,
    /// Exchange reference, unique per mode when present.
    pub external_ref: Option<String>,
    pub mode: TradingMode,
    pub recorded_at: DateTime<Utc>,
}

impl CashEvent {
    #[must_use]
    pub fn signed_amount(&self) -> Price {
        if self.event_type.is_inflow() {
            self.amount
        } else {
            -self.amount
        }
    }
}

pub trait CashStore: Send + Sync {
    /// Append an event. Returns `None` when its external reference was already recorded.
    fn append_cash_event(&self, event: &CashEvent) -> anyhow::Result<Option<i64>>;

    fn cash_events(&self, mode: TradingMode) -> anyhow::Result<Vec<CashEvent>>;
}

#[derive(Clone)]
pub struct CashEventLedger {
    store: Arc<dyn CashStore>,
}

impl CashEventLedger {
    pub fn new(store: Arc<dyn CashStore>) -> Self {
        Self { store }
    }

    pub fn record_event(
        &self,
        event_type: CashEventType,
        amount: Price,
        currency: &str,
        description: &str,
        external_ref: Option<&str>,
        mode: TradingMode,
    ) -> PortfolioResult<Option<i64>> {
        if amount <= Decimal::ZERO {
            return Err(PortfolioError::NonPositiveAmount(amount));
        }
        let id = self.store.append_cash_event(&CashEvent {
            id: None,
            event_type,
            amount,
            currency: currency.to_string(),
            description: description.to_string(),
            external_ref: external_ref.map(str::to_string),
            mode,
            recorded_at: Utc::now(),
        })?;
        if let Some(id) = id {
            info!(id, kind = event_type.as_str(), %amount, currency, %mode, "cash event recorded");
        }
        Ok(id)
    }

    pub fn events(&self, mode: TradingMode) -> PortfolioResult<Vec<CashEvent>> {
        Ok(self.store.cash_events(mode)?)
    }

    /// Deposits and inbound transfers minus withdrawals and outbound transfers.
    pub fn net_deposits(&self, mode: TradingMode) -> PortfolioResult<Price> {
        Ok(self
            .store
            .cash_events(mode)?
            .iter()
            .map(CashEvent::signed_amount)
            .sum())
    }
}

/// Return on invested capital in percent, `None` without positive net deposits.
#[must_use]
pub fn roi(equity: Price, net_deposits: Price) -> Option<Decimal> {
    if net_deposits <= Decimal::ZERO {
        return None;
    }
    Some((equity - net_deposits) / net_deposits * Decimal::ONE_HUNDRED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqlitePortfolioStore;
    use rust_decimal_macros::dec;

    fn ledger() -> CashEventLedger {
        CashEventLedger::new(Arc::new(SqlitePortfolioStore::new_in_memory().unwrap()))
    }

    #[test]
    fn net_deposits_nets_inflows_and_outflows() {
        let cash = ledger();
        let mode = TradingMode::Live;
        cash.record_event(CashEventType::Deposit, dec!(1000), "USD", "initial", None, mode)
            .unwrap();
        cash.record_event(CashEventType::TransferIn, dec!(250), "USD", "", None, mode)
            .unwrap();
        cash.record_event(CashEventType::Withdrawal, dec!(100), "USD", "", None, mode)
            .unwrap();
        cash.record_event(CashEventType::Deposit, dec!(5), "USD", "", None, TradingMode::Paper)
            .unwrap();
        assert_eq!(cash.net_deposits(mode).unwrap(), dec!(1150));
        assert_eq!(cash.events(mode).unwrap().len(), 3);
    }

    #[test]
    fn external_reference_deduplicates() {
        let cash = ledger();
        let mode = TradingMode::Live;
        assert!(cash
            .record_event(CashEventType::Deposit, dec!(10), "USD", "", Some("tx-1"), mode)
            .unwrap()
            .is_some());
        assert!(cash
            .record_event(CashEventType::Deposit, dec!(10), "USD", "", Some("tx-1"), mode)
            .unwrap()
            .is_none());
        assert_eq!(cash.net_deposits(mode).unwrap(), dec!(10));
    }

    #[test]
    fn rejects_non_positive_amounts() {
        let cash = ledger();
        assert!(matches!(
            cash.record_event(CashEventType::Deposit, dec!(0), "USD", "", None, TradingMode::Paper),
            Err(PortfolioError::NonPositiveAmount(_))
        ));
    }

    #[test]
    fn roi_is_relative_to_invested_capital() {
        assert_eq!(roi(dec!(1100), dec!(1000)), Some(dec!(10)));
        assert_eq!(roi(dec!(900), dec!(1000)), Some(dec!(-10)));
        assert_eq!(roi(dec!(900), Decimal::ZERO), None);
    }
}
