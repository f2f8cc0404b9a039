//! Process-wide trading gate: normal, safe mode (exits only) or halted.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use keel_core::OrderPurpose;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

/// One active reason for safe mode.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SafeModeEntry {
    pub detail: String,
    pub since: DateTime<Utc>,
    /// Expiry for cooldown-style entries; `None` until explicitly cleared.
    pub until: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum GateState {
    Normal,
    SafeMode {
        reasons: BTreeMap<String, SafeModeEntry>,
    },
    Halted {
        reason: String,
        since: DateTime<Utc>,
    },
}

impl GateState {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::SafeMode { .. } => "safe_mode",
            Self::Halted { .. } => "halted",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GateBlock {
    #[error("trading halted since {since}: {reason}; manual intervention required")]
    Halted { reason: String, since: DateTime<Utc> },
    #[error("safe mode active ({reasons}); only exits are accepted")]
    SafeMode { reasons: String },
}

#[derive(Default)]
struct Inner {
    halted: Option<(String, DateTime<Utc>)>,
    safe_mode: BTreeMap<String, SafeModeEntry>,
}

#[derive(Default)]
pub struct TradingGate {
    inner: RwLock<Inner>,
}

impl TradingGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Disable all trading until [`Self::clear_halt`] is called.
    pub fn halt(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut inner = self.inner.write();
        if inner.halted.is_none() {
            error!(%reason, "trading halted");
            inner.halted = Some((reason, Utc::now()));
        }
    }

    pub fn clear_halt(&self) {
        if self.inner.write().halted.take().is_some() {
            warn!("trading halt cleared by operator");
        }
    }

    /// Add (or refresh) a safe-mode reason. Returns `true` when it was not already active.
    pub fn enter_safe_mode(
        &self,
        key: impl Into<String>,
        detail: impl Into<String>,
        until: Option<DateTime<Utc>>,
    ) -> bool {
        let key = key.into();
        let detail = detail.into();
        let now = Utc::now();
        let mut inner = self.inner.write();
        let fresh = !inner.safe_mode.contains_key(&key);
        if fresh {
            warn!(%key, %detail, ?until, "entering safe mode");
        }
        let since = inner.safe_mode.get(&key).map_or(now, |entry| entry.since);
        inner.safe_mode.insert(
            key,
            SafeModeEntry {
                detail,
                since,
                until,
            },
        );
        fresh
    }

    /// Remove a safe-mode reason. Returns `true` when it was active.
    pub fn clear_safe_mode(&self, key: &str) -> bool {
        let removed = self.inner.write().safe_mode.remove(key).is_some();
        if removed {
            info!(key, "safe mode reason cleared");
        }
        removed
    }

    pub fn state(&self) -> GateState {
        self.state_at(Utc::now())
    }

    /// Current state with expired cooldown entries dropped.
    pub fn state_at(&self, now: DateTime<Utc>) -> GateState {
        let mut inner = self.inner.write();
        inner.safe_mode.retain(|key, entry| {
            let live = entry.until.map_or(true, |until| until > now);
            if !live {
                info!(key = %key, "safe mode cooldown expired");
            }
            live
        });
        if let Some((reason, since)) = &inner.halted {
            return GateState::Halted {
                reason: reason.clone(),
                since: *since,
            };
        }
        if inner.safe_mode.is_empty() {
            GateState::Normal
        } else {
            GateState::SafeMode {
                reasons: inner.safe_mode.clone(),
            }
        }
    }

    pub fn permits(&self, purpose: OrderPurpose) -> Result<(), GateBlock> {
        self.permits_at(purpose, Utc::now())
    }

    /// Exits pass in safe mode; nothing passes while halted.
    pub fn permits_at(&self, purpose: OrderPurpose, now: DateTime<Utc>) -> Result<(), GateBlock> {
        match self.state_at(now) {
            GateState::Normal => Ok(()),
            GateState::Halted { reason, since } => Err(GateBlock::Halted { reason, since }),
            GateState::SafeMode { .. } if purpose == OrderPurpose::Exit => Ok(()),
            GateState::SafeMode { reasons } => Err(GateBlock::SafeMode {
                reasons: reasons
                    .iter()
                    .map(|(key, entry)| format!("{key}: {}", entry.detail))
                    .collect::<Vec<_>>()
                    .join("; "),
            }),
        }
    }
}
