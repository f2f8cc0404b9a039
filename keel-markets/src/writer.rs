//! Flush target of the coalescer: persists snapshots, keeps the focus cache
//! that serves marks and books, and runs mover detection on scout data.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use keel_broker::BookSource;
use keel_core::{BidAsk, MarketSnapshot, MarketTier, Price, Symbol};
use keel_portfolio::QuoteSource;
use parking_lot::{Mutex, RwLock};
use tracing::info;

use crate::coalescer::SnapshotSink;
use crate::focus::{FocusManager, PromotionOutcome};
use crate::movers::{MoverDetector, MoverSignal};
use crate::store::SnapshotStore;

const RECENT_SIGNALS: usize = 64;

pub struct SnapshotWriter {
    store: Arc<dyn SnapshotStore>,
    focus: Arc<FocusManager>,
    movers: Arc<MoverDetector>,
    /// Focus quotes older than this are not served.
    max_quote_age: Duration,
    cache: RwLock<HashMap<Symbol, MarketSnapshot>>,
    signals: Mutex<VecDeque<MoverSignal>>,
}

impl SnapshotWriter {
    pub fn new(
        store: Arc<dyn SnapshotStore>,
        focus: Arc<FocusManager>,
        movers: Arc<MoverDetector>,
        max_quote_age_secs: i64,
    ) -> Self {
        Self {
            store,
            focus,
            movers,
            max_quote_age: Duration::seconds(max_quote_age_secs.max(0)),
            cache: RwLock::new(HashMap::new()),
            signals: Mutex::new(VecDeque::with_capacity(RECENT_SIGNALS)),
        }
    }

    /// Warm the focus cache from the last persisted focus snapshots.
    pub fn warm_from_store(&self) -> Result<usize> {
        let snapshots = self.store.snapshots(MarketTier::Focus)?;
        let count = snapshots.len();
        let mut cache = self.cache.write();
        for snapshot in snapshots {
            cache.insert(snapshot.symbol.clone(), snapshot);
        }
        Ok(count)
    }

    fn fresh(&self, symbol: &str) -> Option<MarketSnapshot> {
        let snapshot = self.cache.read().get(symbol).cloned()?;
        (Utc::now() - snapshot.observed_at <= self.max_quote_age).then_some(snapshot)
    }

    pub fn focus_snapshot(&self, symbol: &str) -> Option<MarketSnapshot> {
        self.cache.read().get(symbol).cloned()
    }

    /// Most recent mover signals, newest last.
    pub fn recent_movers(&self) -> Vec<MoverSignal> {
        self.signals.lock().iter().cloned().collect()
    }

    fn detect(&self, snapshots: &[MarketSnapshot]) {
        for snapshot in snapshots {
            let Some(signal) = self.movers.observe(snapshot) else {
                continue;
            };
            let outcome = self.focus.promote(&signal.symbol, signal.reason());
            if matches!(outcome, PromotionOutcome::Promoted { .. }) {
                info!(symbol = %signal.symbol, reason = %signal.reason(), "mover promoted");
            }
            let mut signals = self.signals.lock();
            if signals.len() == RECENT_SIGNALS {
                signals.pop_front();
            }
            signals.push_back(signal);
        }
    }
}

#[async_trait]
impl SnapshotSink for SnapshotWriter {
    async fn write_snapshots(&self, tier: MarketTier, snapshots: Vec<MarketSnapshot>) -> Result<()> {
        self.store.upsert_snapshots(&snapshots)?;
        match tier {
            MarketTier::Focus => {
                let mut cache = self.cache.write();
                for snapshot in snapshots {
                    cache.insert(snapshot.symbol.clone(), snapshot);
                }
            }
            MarketTier::Scout => self.detect(&snapshots),
        }
        Ok(())
    }
}

impl QuoteSource for SnapshotWriter {
    fn mark_price(&self, symbol: &str) -> Option<Price> {
        self.fresh(symbol)?.mark()
    }
}

impl BookSource for SnapshotWriter {
    fn book(&self, symbol: &str) -> Option<BidAsk> {
        self.fresh(symbol)?.bid_ask()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::focus::FocusConfig;
    use crate::movers::MoverConfig;
    use crate::store::SqliteMarketStore;
    use rust_decimal_macros::dec;

    fn writer(max_age: i64) -> (SnapshotWriter, Arc<FocusManager>, Arc<SqliteMarketStore>) {
        let store = Arc::new(SqliteMarketStore::new_in_memory().unwrap());
        let focus = Arc::new(FocusManager::new(FocusConfig::default()));
        focus.set_universe(["SOLUSD".to_string(), "XBTUSD".to_string()]);
        let writer = SnapshotWriter::new(
            store.clone(),
            focus.clone(),
            Arc::new(MoverDetector::new(MoverConfig::default())),
            max_age,
        );
        (writer, focus, store)
    }

    fn snapshot(symbol: &str, tier: MarketTier, mid: Price, age_secs: i64) -> MarketSnapshot {
        MarketSnapshot {
            symbol: symbol.into(),
            tier,
            bid: Some(mid - dec!(0.05)),
            ask: Some(mid + dec!(0.05)),
            last: None,
            volume_24h: None,
            observed_at: Utc::now() - Duration::seconds(age_secs),
            tick_count: 1,
        }
    }

    #[tokio::test]
    async fn focus_flushes_serve_fresh_quotes_only() -> Result<()> {
        let (writer, _, store) = writer(30);
        writer
            .write_snapshots(
                MarketTier::Focus,
                vec![
                    snapshot("XBTUSD", MarketTier::Focus, dec!(100), 0),
                    snapshot("ETHUSD", MarketTier::Focus, dec!(50), 120),
                ],
            )
            .await?;
        assert_eq!(writer.mark_price("XBTUSD"), Some(dec!(100)));
        assert_eq!(writer.book("XBTUSD").map(|b| b.bid), Some(dec!(99.95)));
        assert_eq!(writer.mark_price("ETHUSD"), None);
        assert_eq!(store.snapshots(MarketTier::Focus)?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn scout_movers_get_promoted() -> Result<()> {
        let (writer, focus, _) = writer(30);
        let start = Utc::now() - Duration::minutes(60);
        let mut first = snapshot("SOLUSD", MarketTier::Scout, dec!(100), 0);
        first.observed_at = start;
        writer.write_snapshots(MarketTier::Scout, vec![first]).await?;
        assert_eq!(focus.tier_of("SOLUSD"), MarketTier::Scout);

        let mut later = snapshot("SOLUSD", MarketTier::Scout, dec!(104), 0);
        later.observed_at = start + Duration::minutes(60);
        writer.write_snapshots(MarketTier::Scout, vec![later]).await?;
        assert_eq!(focus.tier_of("SOLUSD"), MarketTier::Focus);
        assert_eq!(writer.recent_movers().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn cache_warms_from_persisted_focus() -> Result<()> {
        let (writer, _, store) = writer(3_600);
        store.upsert_snapshots(&[snapshot("XBTUSD", MarketTier::Focus, dec!(100), 10)])?;
        assert_eq!(writer.warm_from_store()?, 1);
        assert_eq!(writer.mark_price("XBTUSD"), Some(dec!(100)));
        Ok(())
    }
}
