//! Focus/scout partitioning of the tradable universe.
//!
//! Focus = configured defaults + symbols with open positions + live mover
//! promotions. Everything else in the universe is scout.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use keel_core::{MarketTier, Symbol};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FocusConfig {
    #[serde(default)]
    pub default_symbols: Vec<Symbol>,
    /// Upper bound on the focus set; mover promotions beyond it are refused.
    #[serde(default = "default_max_focus")]
    pub max_focus: usize,
    /// Lifetime of a mover promotion. `None` keeps promotions until demoted explicitly.
    #[serde(default = "default_promotion_ttl_secs")]
    pub promotion_ttl_secs: Option<i64>,
}

fn default_max_focus() -> usize {
    12
}

fn default_promotion_ttl_secs() -> Option<i64> {
    Some(3_600)
}

impl Default for FocusConfig {
    fn default() -> Self {
        Self {
            default_symbols: Vec::new(),
            max_focus: default_max_focus(),
            promotion_ttl_secs: default_promotion_ttl_secs(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Promotion {
    pub reason: String,
    pub promoted_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PromotionOutcome {
    Promoted { expires_at: Option<DateTime<Utc>> },
    /// Already promoted; the TTL was pushed out.
    Extended { expires_at: Option<DateTime<Utc>> },
    /// A default or position symbol is always in focus.
    AlreadyFocus,
    FocusFull { limit: usize },
    UnknownSymbol,
}

#[derive(Default)]
struct State {
    universe: BTreeSet<Symbol>,
    positions: HashSet<Symbol>,
    promotions: HashMap<Symbol, Promotion>,
}

pub struct FocusManager {
    config: FocusConfig,
    state: RwLock<State>,
}

impl FocusManager {
    pub fn new(config: FocusConfig) -> Self {
        let universe = config.default_symbols.iter().cloned().collect();
        Self {
            config,
            state: RwLock::new(State {
                universe,
                ..State::default()
            }),
        }
    }

    pub fn config(&self) -> &FocusConfig {
        &self.config
    }

    /// Replace the tradable universe. Defaults are always part of it.
    pub fn set_universe<I>(&self, symbols: I)
    where
        I: IntoIterator<Item = Symbol>,
    {
        let mut state = self.state.write();
        state.universe = symbols.into_iter().collect();
        state
            .universe
            .extend(self.config.default_symbols.iter().cloned());
        let State {
            universe,
            promotions,
            ..
        } = &mut *state;
        promotions.retain(|symbol, _| universe.contains(symbol));
    }

    /// Symbols with open positions; they stay in focus until flat.
    pub fn set_positions<I>(&self, symbols: I)
    where
        I: IntoIterator<Item = Symbol>,
    {
        let mut state = self.state.write();
        state.positions = symbols.into_iter().collect();
        let positions = state.positions.clone();
        state.universe.extend(positions);
    }

    fn pinned(&self, state: &State, symbol: &str) -> bool {
        state.positions.contains(symbol) || self.config.default_symbols.iter().any(|s| s == symbol)
    }

    fn focus_len(&self, state: &State) -> usize {
        let mut focus: HashSet<&str> = self.config.default_symbols.iter().map(String::as_str).collect();
        focus.extend(state.positions.iter().map(String::as_str));
        focus.extend(state.promotions.keys().map(String::as_str));
        focus.len()
    }

    pub fn promote(&self, symbol: &str, reason: impl Into<String>) -> PromotionOutcome {
        self.promote_at(symbol, reason, Utc::now())
    }

    pub fn promote_at(
        &self,
        symbol: &str,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> PromotionOutcome {
        let mut state = self.state.write();
        if !state.universe.contains(symbol) {
            return PromotionOutcome::UnknownSymbol;
        }
        if self.pinned(&state, symbol) {
            return PromotionOutcome::AlreadyFocus;
        }
        let expires_at = self
            .config
            .promotion_ttl_secs
            .map(|secs| now + Duration::seconds(secs.max(0)));
        if let Some(existing) = state.promotions.get_mut(symbol) {
            existing.expires_at = expires_at;
            return PromotionOutcome::Extended { expires_at };
        }
        if self.focus_len(&state) >= self.config.max_focus {
            debug!(symbol, limit = self.config.max_focus, "focus set full; promotion refused");
            return PromotionOutcome::FocusFull {
                limit: self.config.max_focus,
            };
        }
        let reason = reason.into();
        info!(symbol, %reason, ?expires_at, "symbol promoted to focus");
        state.promotions.insert(
            symbol.to_string(),
            Promotion {
                reason,
                promoted_at: now,
                expires_at,
            },
        );
        PromotionOutcome::Promoted { expires_at }
    }

    pub fn demote(&self, symbol: &str) -> bool {
        self.state.write().promotions.remove(symbol).is_some()
    }

    /// Drop promotions whose TTL has passed. Returns the demoted symbols.
    pub fn expire(&self, now: DateTime<Utc>) -> Vec<Symbol> {
        let mut state = self.state.write();
        let mut expired: Vec<Symbol> = state
            .promotions
            .iter()
            .filter(|(_, promotion)| promotion.expires_at.is_some_and(|at| at <= now))
            .map(|(symbol, _)| symbol.clone())
            .collect();
        for symbol in &expired {
            state.promotions.remove(symbol);
            info!(symbol = %symbol, "promotion expired; back to scout");
        }
        expired.sort();
        expired
    }

    pub fn tier_of(&self, symbol: &str) -> MarketTier {
        let state = self.state.read();
        if self.pinned(&state, symbol) || state.promotions.contains_key(symbol) {
            MarketTier::Focus
        } else {
            MarketTier::Scout
        }
    }

    pub fn promotion(&self, symbol: &str) -> Option<Promotion> {
        self.state.read().promotions.get(symbol).cloned()
    }

    pub fn focus_symbols(&self) -> Vec<Symbol> {
        let state = self.state.read();
        let mut focus: BTreeSet<Symbol> = self.config.default_symbols.iter().cloned().collect();
        focus.extend(state.positions.iter().cloned());
        focus.extend(state.promotions.keys().cloned());
        focus.into_iter().collect()
    }

    pub fn scout_symbols(&self) -> Vec<Symbol> {
        let state = self.state.read();
        state
            .universe
            .iter()
            .filter(|symbol| !self.pinned(&state, symbol) && !state.promotions.contains_key(*symbol))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(max_focus: usize) -> FocusManager {
        let manager = FocusManager::new(FocusConfig {
            default_symbols: vec!["XBTUSD".into()],
            max_focus,
            promotion_ttl_secs: Some(600),
        });
        manager.set_universe(["ETHUSD", "SOLUSD", "ADAUSD"].map(String::from));
        manager
    }

    #[test]
    fn partitions_defaults_positions_and_scouts() {
        let focus = manager(5);
        focus.set_positions(["ETHUSD".to_string()]);
        assert_eq!(focus.focus_symbols(), vec!["ETHUSD", "XBTUSD"]);
        assert_eq!(focus.scout_symbols(), vec!["ADAUSD", "SOLUSD"]);
        assert_eq!(focus.tier_of("XBTUSD"), MarketTier::Focus);
        assert_eq!(focus.tier_of("SOLUSD"), MarketTier::Scout);
        assert_eq!(focus.promote("ETHUSD", "mover"), PromotionOutcome::AlreadyFocus);
    }

    #[test]
    fn promotions_expire_back_to_scout() {
        let focus = manager(5);
        let now = Utc::now();
        assert!(matches!(
            focus.promote_at("SOLUSD", "momentum 4%", now),
            PromotionOutcome::Promoted { .. }
        ));
        assert_eq!(focus.tier_of("SOLUSD"), MarketTier::Focus);
        assert!(focus.expire(now + Duration::seconds(599)).is_empty());
        assert_eq!(focus.expire(now + Duration::seconds(600)), vec!["SOLUSD"]);
        assert_eq!(focus.tier_of("SOLUSD"), MarketTier::Scout);
    }

    #[test]
    fn repeat_promotion_extends_ttl() {
        let focus = manager(5);
        let now = Utc::now();
        focus.promote_at("SOLUSD", "first", now);
        let later = now + Duration::seconds(300);
        assert_eq!(
            focus.promote_at("SOLUSD", "again", later),
            PromotionOutcome::Extended {
                expires_at: Some(later + Duration::seconds(600))
            }
        );
    }

    #[test]
    fn cap_refuses_extra_promotions_but_keeps_pins() {
        let focus = manager(2);
        assert!(matches!(focus.promote("SOLUSD", "m"), PromotionOutcome::Promoted { .. }));
        assert_eq!(focus.promote("ADAUSD", "m"), PromotionOutcome::FocusFull { limit: 2 });
        focus.set_positions(["ETHUSD".to_string()]);
        assert_eq!(focus.tier_of("ETHUSD"), MarketTier::Focus);
        assert_eq!(focus.promote("DOGEUSD", "m"), PromotionOutcome::UnknownSymbol);
    }
}
