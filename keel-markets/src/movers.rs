//! Detects scout symbols worth promoting: strong 1h momentum or a 24h
//! volume breakout, both behind a spread-quality guard.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use keel_core::{MarketSnapshot, Price, Quantity, Symbol};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MoverConfig {
    #[serde(default = "default_momentum_window_secs")]
    pub momentum_window_secs: i64,
    /// How far from `now - window` a reference sample may sit.
    #[serde(default = "default_window_tolerance_secs")]
    pub window_tolerance_secs: i64,
    /// Absolute percent move over the window that flags a mover.
    #[serde(default = "default_momentum_threshold_pct")]
    pub momentum_threshold_pct: Decimal,
    /// Latest 24h volume over its trailing average.
    #[serde(default = "default_volume_breakout_ratio")]
    pub volume_breakout_ratio: Decimal,
    /// Prior samples needed before a volume breakout can fire.
    #[serde(default = "default_min_volume_samples")]
    pub min_volume_samples: usize,
    /// Wider spreads (percent of mid) are never promoted.
    #[serde(default = "default_max_spread_pct")]
    pub max_spread_pct: Decimal,
    #[serde(default = "default_history_secs")]
    pub history_secs: i64,
}

fn default_momentum_window_secs() -> i64 {
    3_600
}

fn default_window_tolerance_secs() -> i64 {
    600
}

fn default_momentum_threshold_pct() -> Decimal {
    Decimal::from(3)
}

fn default_volume_breakout_ratio() -> Decimal {
    Decimal::from(3)
}

fn default_min_volume_samples() -> usize {
    6
}

fn default_max_spread_pct() -> Decimal {
    Decimal::new(5, 1)
}

fn default_history_secs() -> i64 {
    7_200
}

impl Default for MoverConfig {
    fn default() -> Self {
        Self {
            momentum_window_secs: default_momentum_window_secs(),
            window_tolerance_secs: default_window_tolerance_secs(),
            momentum_threshold_pct: default_momentum_threshold_pct(),
            volume_breakout_ratio: default_volume_breakout_ratio(),
            min_volume_samples: default_min_volume_samples(),
            max_spread_pct: default_max_spread_pct(),
            history_secs: default_history_secs(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MoverKind {
    Momentum { change_pct: Decimal },
    VolumeBreakout { ratio: Decimal },
}

#[derive(Clone, Debug, PartialEq)]
pub struct MoverSignal {
    pub symbol: Symbol,
    pub kind: MoverKind,
    pub spread_pct: Decimal,
    pub at: DateTime<Utc>,
}

impl MoverSignal {
    pub fn reason(&self) -> String {
        match &self.kind {
            MoverKind::Momentum { change_pct } => format!("1h momentum {}%", change_pct.round_dp(2)),
            MoverKind::VolumeBreakout { ratio } => {
                format!("24h volume {}x trailing average", ratio.round_dp(2))
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Sample {
    at: DateTime<Utc>,
    price: Price,
    volume: Option<Quantity>,
}

#[derive(Default)]
pub struct MoverDetector {
    config: MoverConfig,
    history: Mutex<HashMap<Symbol, VecDeque<Sample>>>,
}

impl MoverDetector {
    pub fn new(config: MoverConfig) -> Self {
        Self {
            config,
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Record a scout snapshot and report whether the symbol qualifies as a mover.
    pub fn observe(&self, snapshot: &MarketSnapshot) -> Option<MoverSignal> {
        let price = snapshot.mark()?;
        let now = snapshot.observed_at;
        let mut history = self.history.lock();
        let samples = history.entry(snapshot.symbol.clone()).or_default();
        let horizon = now - Duration::seconds(self.config.history_secs);
        while samples.front().is_some_and(|s| s.at < horizon) {
            samples.pop_front();
        }

        let change_pct = self.momentum_from(samples, price, now);
        let ratio = self.volume_ratio(samples, snapshot.volume_24h);
        samples.push_back(Sample {
            at: now,
            price,
            volume: snapshot.volume_24h,
        });
        drop(history);

        let kind = match (change_pct, ratio) {
            (Some(change_pct), _) if change_pct.abs() >= self.config.momentum_threshold_pct => {
                MoverKind::Momentum { change_pct }
            }
            (_, Some(ratio)) if ratio >= self.config.volume_breakout_ratio => {
                MoverKind::VolumeBreakout { ratio }
            }
            _ => return None,
        };
        // Illiquid books are never promoted, however strong the move.
        let spread_pct = match snapshot.spread_pct() {
            Some(spread) if spread <= self.config.max_spread_pct => spread,
            spread => {
                debug!(symbol = %snapshot.symbol, ?spread, ?kind, "mover rejected by spread guard");
                return None;
            }
        };
        Some(MoverSignal {
            symbol: snapshot.symbol.clone(),
            kind,
            spread_pct,
            at: now,
        })
    }

    /// Percent change of `symbol` against its sample closest to one window ago.
    pub fn momentum(&self, symbol: &str, price: Price, now: DateTime<Utc>) -> Option<Decimal> {
        let history = self.history.lock();
        self.momentum_from(history.get(symbol)?, price, now)
    }

    fn momentum_from(
        &self,
        samples: &VecDeque<Sample>,
        price: Price,
        now: DateTime<Utc>,
    ) -> Option<Decimal> {
        let target = now - Duration::seconds(self.config.momentum_window_secs);
        let tolerance = Duration::seconds(self.config.window_tolerance_secs);
        let reference = samples
            .iter()
            .filter(|s| (s.at - target).abs() <= tolerance)
            .min_by_key(|s| (s.at - target).abs())?;
        if reference.price <= Decimal::ZERO {
            return None;
        }
        Some((price - reference.price) / reference.price * Decimal::ONE_HUNDRED)
    }

    fn volume_ratio(&self, samples: &VecDeque<Sample>, latest: Option<Quantity>) -> Option<Decimal> {
        let latest = latest?;
        let volumes: Vec<Quantity> = samples.iter().filter_map(|s| s.volume).collect();
        if volumes.len() < self.config.min_volume_samples.max(1) {
            return None;
        }
        let average = volumes.iter().copied().sum::<Decimal>() / Decimal::from(volumes.len());
        if average <= Decimal::ZERO {
            return None;
        }
        Some(latest / average)
    }

    pub fn forget(&self, symbol: &str) {
        self.history.lock().remove(symbol);
    }

    pub fn tracked(&self) -> usize {
        self.history.lock().len()
    }
}
