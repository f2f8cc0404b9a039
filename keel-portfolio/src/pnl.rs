use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use keel_core::{Price, TradingMode};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::equity::EquityBreakdown;
use crate::PortfolioResult;

/// One row of the daily P&L history, unique per (date, instance, mode).
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DailyPnlSnapshot {
    pub date: NaiveDate,
    pub instance_id: String,
    pub mode: TradingMode,
    pub equity: Price,
    pub cash: Price,
    pub realized_pnl: Price,
    pub unrealized_pnl: Price,
    pub cumulative_fees: Price,
    pub position_count: u32,
    pub net_deposits: Price,
    pub recorded_at: DateTime<Utc>,
}

pub trait PnlStore: Send + Sync {
    fn upsert_daily_pnl(&self, snapshot: &DailyPnlSnapshot) -> anyhow::Result<()>;

    /// Most recent snapshots first.
    fn daily_pnl(&self, mode: TradingMode, limit: usize) -> anyhow::Result<Vec<DailyPnlSnapshot>>;
}

#[derive(Clone)]
pub struct PnlService {
    store: Arc<dyn PnlStore>,
    instance_id: String,
}

impl PnlService {
    pub fn new(store: Arc<dyn PnlStore>, instance_id: impl Into<String>) -> Self {
        Self {
            store,
            instance_id: instance_id.into(),
        }
    }

    pub fn compute_snapshot(
        &self,
        breakdown: &EquityBreakdown,
        net_deposits: Price,
        date: NaiveDate,
    ) -> DailyPnlSnapshot {
        DailyPnlSnapshot {
            date,
            instance_id: self.instance_id.clone(),
            mode: breakdown.mode,
            equity: breakdown.equity,
            cash: breakdown.cash,
            realized_pnl: breakdown.realized_pnl,
            unrealized_pnl: breakdown.unrealized_pnl,
            cumulative_fees: breakdown.total_fees,
            position_count: u32::try_from(breakdown.position_count()).unwrap_or(u32::MAX),
            net_deposits,
            recorded_at: Utc::now(),
        }
    }

    /// Persist the snapshot. Writing the same day twice keeps the latest values.
    pub fn write_snapshot(&self, snapshot: &DailyPnlSnapshot) -> PortfolioResult<()> {
        self.store.upsert_daily_pnl(snapshot)?;
        info!(
            date = %snapshot.date,
            mode = %snapshot.mode,
            equity = %snapshot.equity,
            realized = %snapshot.realized_pnl,
            "daily pnl snapshot written"
        );
        Ok(())
    }

    pub fn recent(&self, mode: TradingMode, limit: usize) -> PortfolioResult<Vec<DailyPnlSnapshot>> {
        Ok(self.store.daily_pnl(mode, limit)?)
    }
}
