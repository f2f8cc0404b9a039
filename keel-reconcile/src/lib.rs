//! Boot reconciliation.
//!
//! Nothing trades until [`BootReconciler::run`] has rebuilt local state from
//! the database, compared it against the broker, run the integrity battery
//! and applied the resulting resume decision to the trading gate.

pub mod broker;
pub mod checks;
pub mod policy;
pub mod rebuild;
pub mod reconciler;
pub mod store;

use keel_core::{Price, Quantity};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub use broker::{BrokerDiff, BrokerReconciler, QuantityDiff};
pub use checks::{run_checks, CheckLimits, CheckResult};
pub use policy::{decide, ResumeDecision};
pub use rebuild::{LocalState, StateRebuilder};
pub use reconciler::{apply_decision, BootAuditRecord, BootReconciler, BOOT_SAFE_MODE_KEY};
pub use store::{
    load_json, save_json, AgentStateStore, BootAuditStore, SqliteReconcileStore,
    BREAKER_STATE_KEY,
};

/// How far local and broker numbers may drift before they count as a difference.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct ReconcileTolerances {
    #[serde(default = "default_cash_tolerance")]
    pub cash: Price,
    #[serde(default = "default_quantity_tolerance")]
    pub quantity: Quantity,
}

fn default_cash_tolerance() -> Price {
    Decimal::ONE
}

fn default_quantity_tolerance() -> Quantity {
    Decimal::new(1, 7)
}

impl Default for ReconcileTolerances {
    fn default() -> Self {
        Self {
            cash: default_cash_tolerance(),
            quantity: default_quantity_tolerance(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ReconcileConfig {
    #[serde(default)]
    pub tolerances: ReconcileTolerances,
    /// Length of the safe-mode window imposed by a non-clean boot.
    #[serde(default = "default_safe_mode_cooldown_secs")]
    pub safe_mode_cooldown_secs: i64,
    #[serde(default = "default_quote_currency")]
    pub quote_currency: String,
    #[serde(default)]
    pub limits: CheckLimits,
}

fn default_safe_mode_cooldown_secs() -> i64 {
    60
}

fn default_quote_currency() -> String {
    "USD".into()
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            tolerances: ReconcileTolerances::default(),
            safe_mode_cooldown_secs: default_safe_mode_cooldown_secs(),
            quote_currency: default_quote_currency(),
            limits: CheckLimits::default(),
        }
    }
}
