//! Latest-wins tick buffer with tiered, timer-driven flushes.
//!
//! A symbol ticking many times per flush interval still produces one write per
//! interval. A failed flush puts its symbols back on the dirty list so nothing
//! is lost; the next tick of the timer retries them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use async_trait::async_trait;
use keel_broker::{EventBus, EventKind, StreamEvent, SubscriptionId};
use keel_core::{MarketSnapshot, MarketTick, MarketTier, Symbol};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::focus::FocusManager;

/// Destination of flushed snapshots.
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    async fn write_snapshots(&self, tier: MarketTier, snapshots: Vec<MarketSnapshot>) -> Result<()>;
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CoalescerConfig {
    #[serde(default = "default_focus_flush_ms")]
    pub focus_flush_ms: u64,
    #[serde(default = "default_scout_flush_ms")]
    pub scout_flush_ms: u64,
}

fn default_focus_flush_ms() -> u64 {
    1_000
}

fn default_scout_flush_ms() -> u64 {
    30_000
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            focus_flush_ms: default_focus_flush_ms(),
            scout_flush_ms: default_scout_flush_ms(),
        }
    }
}

#[derive(Default)]
struct Buffer {
    latest: HashMap<Symbol, MarketSnapshot>,
    dirty: HashSet<Symbol>,
}

pub struct Coalescer {
    config: CoalescerConfig,
    focus: Arc<FocusManager>,
    sink: Arc<dyn SnapshotSink>,
    buffer: Mutex<Buffer>,
}

impl Coalescer {
    pub fn new(config: CoalescerConfig, focus: Arc<FocusManager>, sink: Arc<dyn SnapshotSink>) -> Self {
        Self {
            config,
            focus,
            sink,
            buffer: Mutex::new(Buffer::default()),
        }
    }

    /// Fold a tick into the buffered snapshot and mark the symbol dirty.
    pub fn on_tick(&self, tick: &MarketTick) {
        let mut buffer = self.buffer.lock();
        let snapshot = buffer
            .latest
            .entry(tick.symbol.clone())
            .or_insert_with(|| MarketSnapshot {
                symbol: tick.symbol.clone(),
                tier: MarketTier::Scout,
                bid: None,
                ask: None,
                last: None,
                volume_24h: None,
                observed_at: tick.exchange_timestamp,
                tick_count: 0,
            });
        snapshot.bid = tick.bid.or(snapshot.bid);
        snapshot.ask = tick.ask.or(snapshot.ask);
        snapshot.last = tick.last.or(snapshot.last);
        snapshot.volume_24h = tick.volume_24h.or(snapshot.volume_24h);
        snapshot.observed_at = tick.exchange_timestamp;
        snapshot.tick_count += 1;
        buffer.dirty.insert(tick.symbol.clone());
    }

    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> SubscriptionId {
        let coalescer = Arc::clone(self);
        bus.subscribe(EventKind::Ticker, move |event| {
            if let StreamEvent::Ticker(tick) = event {
                coalescer.on_tick(tick);
            }
        })
    }

    /// Latest buffered view of a symbol, flushed or not.
    pub fn latest(&self, symbol: &str) -> Option<MarketSnapshot> {
        self.buffer.lock().latest.get(symbol).cloned()
    }

    pub fn dirty_count(&self) -> usize {
        self.buffer.lock().dirty.len()
    }

    /// Write every dirty symbol currently in `tier`. Returns the number written.
    pub async fn flush(&self, tier: MarketTier) -> Result<usize> {
        let batch: Vec<MarketSnapshot> = {
            let mut buffer = self.buffer.lock();
            let symbols: Vec<Symbol> = buffer
                .dirty
                .iter()
                .filter(|symbol| self.focus.tier_of(symbol) == tier)
                .cloned()
                .collect();
            let mut batch = Vec::with_capacity(symbols.len());
            for symbol in symbols {
                buffer.dirty.remove(&symbol);
                if let Some(snapshot) = buffer.latest.get_mut(&symbol) {
                    snapshot.tier = tier;
                    batch.push(snapshot.clone());
                    snapshot.tick_count = 0;
                }
            }
            batch
        };
        if batch.is_empty() {
            return Ok(0);
        }
        let count = batch.len();
        let symbols: Vec<Symbol> = batch.iter().map(|s| s.symbol.clone()).collect();
        if let Err(err) = self.sink.write_snapshots(tier, batch).await {
            let mut buffer = self.buffer.lock();
            buffer.dirty.extend(symbols);
            return Err(err);
        }
        debug!(tier = tier.as_str(), count, "flushed market snapshots");
        Ok(count)
    }

    /// Flush both tiers, focus first. Used at shutdown.
    pub async fn flush_all(&self) -> Result<usize> {
        let focus = self.flush(MarketTier::Focus).await?;
        let scout = self.flush(MarketTier::Scout).await?;
        Ok(focus + scout)
    }

    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut focus_timer = interval(StdDuration::from_millis(self.config.focus_flush_ms.max(1)));
            let mut scout_timer = interval(StdDuration::from_millis(self.config.scout_flush_ms.max(1)));
            focus_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            scout_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = focus_timer.tick() => {
                        if let Err(err) = self.flush(MarketTier::Focus).await {
                            warn!(error = %err, "focus flush failed; retrying next interval");
                        }
                    }
                    _ = scout_timer.tick() => {
                        if let Err(err) = self.flush(MarketTier::Scout).await {
                            warn!(error = %err, "scout flush failed; retrying next interval");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            match self.flush_all().await {
                Ok(count) => info!(count, "market data buffer flushed on shutdown"),
                Err(err) => warn!(error = %err, "final market data flush failed"),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::focus::FocusConfig;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingSink {
        writes: Mutex<Vec<(MarketTier, Vec<MarketSnapshot>)>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl SnapshotSink for RecordingSink {
        async fn write_snapshots(&self, tier: MarketTier, snapshots: Vec<MarketSnapshot>) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("disk full");
            }
            self.writes.lock().push((tier, snapshots));
            Ok(())
        }
    }

    fn tick(symbol: &str, bid: Decimal) -> MarketTick {
        MarketTick {
            symbol: symbol.into(),
            bid: Some(bid),
            ask: Some(bid + dec!(0.1)),
            last: None,
            volume_24h: None,
            exchange_timestamp: Utc::now(),
            received_at: Utc::now(),
        }
    }

    fn coalescer(sink: Arc<RecordingSink>) -> Coalescer {
        let focus = Arc::new(FocusManager::new(FocusConfig {
            default_symbols: vec!["XBTUSD".into()],
            ..FocusConfig::default()
        }));
        Coalescer::new(CoalescerConfig::default(), focus, sink)
    }

    #[tokio::test]
    async fn bursts_collapse_into_one_write_with_the_last_values() -> Result<()> {
        let sink = Arc::new(RecordingSink::default());
        let coalescer = coalescer(sink.clone());
        for i in 0..1000 {
            coalescer.on_tick(&tick("XBTUSD", Decimal::from(100 + i)));
        }
        assert_eq!(coalescer.flush(MarketTier::Focus).await?, 1);
        assert_eq!(coalescer.flush(MarketTier::Focus).await?, 0);
        let writes = sink.writes.lock();
        assert_eq!(writes.len(), 1);
        let snapshot = &writes[0].1[0];
        assert_eq!(snapshot.bid, Some(dec!(1099)));
        assert_eq!(snapshot.tick_count, 1000);
        assert_eq!(snapshot.tier, MarketTier::Focus);
        Ok(())
    }

    #[tokio::test]
    async fn tiers_flush_independently() -> Result<()> {
        let sink = Arc::new(RecordingSink::default());
        let coalescer = coalescer(sink.clone());
        coalescer.on_tick(&tick("XBTUSD", dec!(100)));
        coalescer.on_tick(&tick("SOLUSD", dec!(20)));
        assert_eq!(coalescer.flush(MarketTier::Scout).await?, 1);
        assert_eq!(coalescer.dirty_count(), 1);
        assert_eq!(coalescer.flush(MarketTier::Focus).await?, 1);
        assert_eq!(coalescer.dirty_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn failed_flush_keeps_symbols_dirty() {
        let sink = Arc::new(RecordingSink::default());
        let coalescer = coalescer(sink.clone());
        coalescer.on_tick(&tick("XBTUSD", dec!(100)));
        sink.fail.store(true, Ordering::SeqCst);
        assert!(coalescer.flush(MarketTier::Focus).await.is_err());
        assert_eq!(coalescer.dirty_count(), 1);
        sink.fail.store(false, Ordering::SeqCst);
        assert_eq!(coalescer.flush(MarketTier::Focus).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_flushes_and_shutdown_drains() -> Result<()> {
        let sink = Arc::new(RecordingSink::default());
        let coalescer = Arc::new(coalescer(sink.clone()));
        let bus = EventBus::new();
        coalescer.attach(&bus);
        let (tx, rx) = watch::channel(false);
        let handle = coalescer.clone().spawn(rx);

        bus.publish(&StreamEvent::Ticker(tick("XBTUSD", dec!(100))));
        tokio::time::sleep(StdDuration::from_millis(1_500)).await;
        assert_eq!(sink.writes.lock().len(), 1);

        bus.publish(&StreamEvent::Ticker(tick("SOLUSD", dec!(20))));
        tx.send(true)?;
        handle.await?;
        let writes = sink.writes.lock();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[1].0, MarketTier::Scout);
        Ok(())
    }
}
