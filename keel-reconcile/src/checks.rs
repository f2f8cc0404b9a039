//! The fixed integrity battery run on every boot.

use keel_core::Price;
use serde::{Deserialize, Serialize};

use crate::broker::BrokerDiff;
use crate::rebuild::LocalState;
use crate::ReconcileTolerances;

pub const CASH_WITHIN_TOLERANCE: &str = "cash_within_tolerance";
pub const NO_ORPHANED_POSITIONS: &str = "no_orphaned_positions";
pub const DAILY_NOTIONAL_WITHIN_LIMIT: &str = "daily_notional_within_limit";
pub const POSITION_COUNT_WITHIN_LIMIT: &str = "position_count_within_limit";
pub const NO_UNKNOWN_ORDERS: &str = "no_unknown_orders";

/// Limits the local state is held against, mirrored from the risk settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct CheckLimits {
    #[serde(default)]
    pub max_daily_notional: Option<Price>,
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: usize,
}

fn default_max_open_positions() -> usize {
    5
}

impl Default for CheckLimits {
    fn default() -> Self {
        Self {
            max_daily_notional: None,
            max_open_positions: default_max_open_positions(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

impl CheckResult {
    fn new(name: &str, passed: bool, detail: String) -> Self {
        Self {
            name: name.to_string(),
            passed,
            detail,
        }
    }
}

/// Run all five checks. Broker-dependent checks pass trivially when no diff
/// was taken (paper mode).
pub fn run_checks(
    local: &LocalState,
    diff: Option<&BrokerDiff>,
    limits: &CheckLimits,
    tolerances: &ReconcileTolerances,
) -> Vec<CheckResult> {
    let cash = match diff {
        Some(diff) => CheckResult::new(
            CASH_WITHIN_TOLERANCE,
            diff.cash_diff.abs() <= tolerances.cash,
            format!(
                "local {} vs broker {} {} (diff {}, tolerance {})",
                diff.local_cash, diff.broker_cash, diff.currency, diff.cash_diff, tolerances.cash
            ),
        ),
        None => CheckResult::new(CASH_WITHIN_TOLERANCE, true, "no broker comparison".into()),
    };

    let orphans = match diff {
        Some(diff) if !diff.orphaned.is_empty() => CheckResult::new(
            NO_ORPHANED_POSITIONS,
            false,
            format!("orphaned: {}", diff.orphaned.join(", ")),
        ),
        Some(_) => CheckResult::new(NO_ORPHANED_POSITIONS, true, "none".into()),
        None => CheckResult::new(NO_ORPHANED_POSITIONS, true, "no broker comparison".into()),
    };

    let notional = match limits.max_daily_notional {
        Some(limit) => CheckResult::new(
            DAILY_NOTIONAL_WITHIN_LIMIT,
            local.daily_notional_used <= limit,
            format!("used {} of {}", local.daily_notional_used, limit),
        ),
        None => CheckResult::new(
            DAILY_NOTIONAL_WITHIN_LIMIT,
            true,
            format!("used {}, no limit configured", local.daily_notional_used),
        ),
    };

    let count = local.position_count(tolerances.quantity);
    let positions = CheckResult::new(
        POSITION_COUNT_WITHIN_LIMIT,
        count <= limits.max_open_positions,
        format!("{count} open of {} allowed", limits.max_open_positions),
    );

    let orders = match diff {
        Some(diff) if !diff.unknown_orders.is_empty() => CheckResult::new(
            NO_UNKNOWN_ORDERS,
            false,
            format!("unknown to broker: {}", diff.unknown_orders.join(", ")),
        ),
        Some(_) => CheckResult::new(
            NO_UNKNOWN_ORDERS,
            true,
            format!("{} open orders confirmed", local.open_orders.len()),
        ),
        None => CheckResult::new(NO_UNKNOWN_ORDERS, true, "no broker comparison".into()),
    };

    vec![cash, orphans, notional, positions, orders]
}
