//! The four-stage boot pipeline and its audit record.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use keel_core::TradingMode;
use keel_risk::TradingGate;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerDiff, BrokerReconciler};
use crate::checks::{run_checks, CheckResult};
use crate::policy::{decide, ResumeDecision};
use crate::rebuild::{LocalState, StateRebuilder};
use crate::store::BootAuditStore;
use crate::ReconcileConfig;

/// Safe-mode key set on the trading gate by a non-clean boot.
pub const BOOT_SAFE_MODE_KEY: &str = "boot_reconcile";

/// Immutable outcome of one boot reconciliation.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct BootAuditRecord {
    pub run_id: String,
    pub mode: TradingMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub local: LocalState,
    pub diff: Option<BrokerDiff>,
    pub checks: Vec<CheckResult>,
    pub decision: ResumeDecision,
    /// Set when the broker could not be reached.
    pub error: Option<String>,
}

impl BootAuditRecord {
    pub fn failed_checks(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|check| !check.passed)
    }
}

pub struct BootReconciler {
    config: ReconcileConfig,
    rebuilder: StateRebuilder,
    broker: BrokerReconciler,
    audit: Arc<dyn BootAuditStore>,
}

impl BootReconciler {
    pub fn new(
        config: ReconcileConfig,
        rebuilder: StateRebuilder,
        broker: BrokerReconciler,
        audit: Arc<dyn BootAuditStore>,
    ) -> Self {
        Self {
            config,
            rebuilder,
            broker,
            audit,
        }
    }

    /// Run the pipeline, persist the audit record and apply the decision to `gate`.
    pub async fn run(&self, gate: &TradingGate) -> Result<BootAuditRecord> {
        let record = self.evaluate().await?;
        self.audit.append_audit(&record)?;
        apply_decision(gate, &record.decision);
        Ok(record)
    }

    /// Run the pipeline without recording or applying anything.
    pub async fn evaluate(&self) -> Result<BootAuditRecord> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let local = self.rebuilder.rebuild_at(started_at)?;
        let cooldown = Duration::seconds(self.config.safe_mode_cooldown_secs.max(0));

        let (diff, checks, decision, failure) = match self.broker.reconcile(&local).await {
            Ok(diff) => {
                let checks = run_checks(
                    &local,
                    diff.as_ref(),
                    &self.config.limits,
                    &self.config.tolerances,
                );
                let decision = decide(local.mode, &checks, diff.as_ref(), cooldown, Utc::now());
                (diff, checks, decision, None)
            }
            Err(err) => {
                // Without a broker view, live state cannot be trusted.
                error!(error = %format!("{err:#}"), "broker reconciliation failed");
                let reason = format!("broker unreachable during boot reconciliation: {err}");
                (None, Vec::new(), ResumeDecision::Halt { reason }, Some(format!("{err:#}")))
            }
        };

        let record = BootAuditRecord {
            run_id: Uuid::new_v4().to_string(),
            mode: local.mode,
            started_at,
            finished_at: Utc::now(),
            duration_ms: u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX),
            local,
            diff,
            checks,
            decision,
            error: failure,
        };
        for check in record.failed_checks() {
            warn!(check = %check.name, detail = %check.detail, "integrity check failed");
        }
        info!(
            run_id = %record.run_id,
            mode = record.mode.as_str(),
            decision = record.decision.label(),
            duration_ms = record.duration_ms,
            "boot reconciliation finished"
        );
        Ok(record)
    }
}

/// Translate a resume decision into gate state.
pub fn apply_decision(gate: &TradingGate, decision: &ResumeDecision) {
    match decision {
        ResumeDecision::Normal => {}
        ResumeDecision::SafeMode { until, reason } => {
            gate.enter_safe_mode(BOOT_SAFE_MODE_KEY, reason.clone(), Some(*until));
        }
        ResumeDecision::Halt { reason } => gate.halt(reason.clone()),
    }
}
