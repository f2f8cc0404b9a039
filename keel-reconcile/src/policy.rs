use chrono::{DateTime, Duration, Utc};
use keel_core::TradingMode;
use serde::{Deserialize, Serialize};

use crate::broker::BrokerDiff;
use crate::checks::CheckResult;

/// How trading resumes after a boot reconciliation.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ResumeDecision {
    Normal,
    /// Exits only until `until`.
    SafeMode {
        until: DateTime<Utc>,
        reason: String,
    },
    /// Nothing trades until an operator clears the halt.
    Halt { reason: String },
}

impl ResumeDecision {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::SafeMode { .. } => "SAFE_MODE",
            Self::Halt { .. } => "HALT",
        }
    }
}

/// Decision table:
///
/// | mode  | failed checks | drift | decision  |
/// |-------|---------------|-------|-----------|
/// | live  | any           | -     | HALT      |
/// | paper | any           | -     | SAFE_MODE |
/// | live  | none          | any   | SAFE_MODE |
/// | *     | none          | none  | NORMAL    |
pub fn decide(
    mode: TradingMode,
    checks: &[CheckResult],
    diff: Option<&BrokerDiff>,
    cooldown: Duration,
    now: DateTime<Utc>,
) -> ResumeDecision {
    let failed: Vec<&str> = checks
        .iter()
        .filter(|check| !check.passed)
        .map(|check| check.name.as_str())
        .collect();
    if !failed.is_empty() {
        let reason = format!("integrity checks failed: {}", failed.join(", "));
        return match mode {
            TradingMode::Live => ResumeDecision::Halt { reason },
            TradingMode::Paper => ResumeDecision::SafeMode {
                until: now + cooldown,
                reason,
            },
        };
    }
    if mode == TradingMode::Live && diff.is_some_and(BrokerDiff::has_drift) {
        return ResumeDecision::SafeMode {
            until: now + cooldown,
            reason: "broker state drifted from local state".into(),
        };
    }
    ResumeDecision::Normal
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn check(name: &str, passed: bool) -> CheckResult {
        CheckResult {
            name: name.into(),
            passed,
            detail: String::new(),
        }
    }

    fn diff(cash_diff: Decimal) -> BrokerDiff {
        BrokerDiff {
            currency: "USD".into(),
            local_cash: dec!(100),
            broker_cash: dec!(100) + cash_diff,
            cash_diff,
            quantity_diffs: Vec::new(),
            orphaned: Vec::new(),
            missing: Vec::new(),
            unknown_orders: Vec::new(),
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn decision_table() {
        let now = Utc::now();
        let cooldown = Duration::seconds(60);
        let passing = [check("a", true), check("b", true)];
        let failing = [check("a", true), check("b", false)];

        assert_eq!(
            decide(TradingMode::Live, &failing, Some(&diff(Decimal::ZERO)), cooldown, now),
            ResumeDecision::Halt {
                reason: "integrity checks failed: b".into()
            }
        );
        assert_eq!(
            decide(TradingMode::Paper, &failing, None, cooldown, now).label(),
            "SAFE_MODE"
        );
        assert_eq!(
            decide(TradingMode::Live, &passing, Some(&diff(dec!(0.3))), cooldown, now),
            ResumeDecision::SafeMode {
                until: now + cooldown,
                reason: "broker state drifted from local state".into()
            }
        );
        assert_eq!(
            decide(TradingMode::Live, &passing, Some(&diff(Decimal::ZERO)), cooldown, now),
            ResumeDecision::Normal
        );
        assert_eq!(
            decide(TradingMode::Paper, &passing, None, cooldown, now),
            ResumeDecision::Normal
        );
    }
}
