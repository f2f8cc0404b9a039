//! Random-walk quote generator for running the paper exchange without a live feed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use keel_broker::{EventBus, StreamEvent};
use keel_core::{MarketTick, Price, Symbol};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::{PaperExchange, BPS};

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PaperMarketConfig {
    /// Symbols to simulate and their starting mid prices.
    #[serde(default = "default_start_prices", deserialize_with = "uppercase_symbols")]
    pub start_prices: BTreeMap<Symbol, Price>,
    /// Largest per-tick move, in basis points of the mid.
    #[serde(default = "default_volatility_bps")]
    pub volatility_bps: u32,
    #[serde(default = "default_spread_bps")]
    pub spread_bps: Decimal,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Starting 24h volume reported with each tick.
    #[serde(default = "default_volume_24h")]
    pub volume_24h: Decimal,
    /// Fixed seed for reproducible walks.
    #[serde(default)]
    pub seed: Option<u64>,
}

/// Layered config sources lowercase table keys; symbols are uppercase.
fn uppercase_symbols<'de, D>(deserializer: D) -> Result<BTreeMap<Symbol, Price>, D::Error>
where
    D: Deserializer<'de>,
{
    let prices = BTreeMap::<Symbol, Price>::deserialize(deserializer)?;
    Ok(prices
        .into_iter()
        .map(|(symbol, price)| (symbol.to_ascii_uppercase(), price))
        .collect())
}

fn default_start_prices() -> BTreeMap<Symbol, Price> {
    BTreeMap::from([
        ("XBTUSD".to_string(), Decimal::from(60_000)),
        ("ETHUSD".to_string(), Decimal::from(3_000)),
    ])
}

fn default_volatility_bps() -> u32 {
    10
}

fn default_spread_bps() -> Decimal {
    Decimal::from(4)
}

fn default_interval_ms() -> u64 {
    500
}

fn default_volume_24h() -> Decimal {
    Decimal::from(1_000)
}

impl Default for PaperMarketConfig {
    fn default() -> Self {
        Self {
            start_prices: default_start_prices(),
            volatility_bps: default_volatility_bps(),
            spread_bps: default_spread_bps(),
            interval_ms: default_interval_ms(),
            volume_24h: default_volume_24h(),
            seed: None,
        }
    }
}

struct WalkState {
    mid: f64,
    volume: Decimal,
}

/// Drives quotes for every configured symbol into the exchange and the bus.
pub struct PaperTicker {
    exchange: Arc<PaperExchange>,
    bus: Arc<EventBus>,
    config: PaperMarketConfig,
}

impl PaperTicker {
    pub fn new(exchange: Arc<PaperExchange>, bus: Arc<EventBus>, config: PaperMarketConfig) -> Self {
        Self {
            exchange,
            bus,
            config,
        }
    }

    /// Publish one round of quotes at the given mids. Used for the opening
    /// quote and by tests.
    pub fn publish(&self, mids: &BTreeMap<Symbol, Price>) {
        let half_spread = self.config.spread_bps / BPS / Decimal::TWO;
        let now = Utc::now();
        for (symbol, mid) in mids {
            let bid = (*mid * (Decimal::ONE - half_spread)).round_dp(8);
            let ask = (*mid * (Decimal::ONE + half_spread)).round_dp(8);
            self.exchange.update_quote(symbol, bid, ask);
            self.bus.publish(&StreamEvent::Ticker(MarketTick {
                symbol: symbol.clone(),
                bid: Some(bid),
                ask: Some(ask),
                last: Some(*mid),
                volume_24h: Some(self.config.volume_24h),
                exchange_timestamp: now,
                received_at: now,
            }));
        }
    }

    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut rng = match self.config.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            let mut states: BTreeMap<Symbol, WalkState> = self
                .config
                .start_prices
                .iter()
                .map(|(symbol, price)| {
                    let state = WalkState {
                        mid: price.to_f64().unwrap_or(1.0).max(0.0001),
                        volume: self.config.volume_24h,
                    };
                    (symbol.clone(), state)
                })
                .collect();
            info!(symbols = states.len(), "paper ticker started");
            let max_move = f64::from(self.config.volatility_bps.max(1)) / 10_000.0;
            let mut ticker = interval(Duration::from_millis(self.config.interval_ms.max(10)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                let now = Utc::now();
                let half_spread = self.config.spread_bps / BPS / Decimal::TWO;
                for (symbol, state) in &mut states {
                    let step: f64 = rng.gen_range(-max_move..=max_move);
                    state.mid = (state.mid * (1.0 + step)).max(0.0001);
                    let drift: f64 = rng.gen_range(-0.01..=0.01);
                    state.volume = (state.volume
                        * Decimal::from_f64(1.0 + drift).unwrap_or(Decimal::ONE))
                    .round_dp(4);
                    let Some(mid) = Decimal::from_f64(state.mid).map(|m| m.round_dp(8)) else {
                        continue;
                    };
                    let bid = (mid * (Decimal::ONE - half_spread)).round_dp(8);
                    let ask = (mid * (Decimal::ONE + half_spread)).round_dp(8);
                    let fills = self.exchange.update_quote(symbol, bid, ask);
                    if !fills.is_empty() {
                        debug!(symbol = %symbol, fills = fills.len(), "resting paper orders filled");
                    }
                    self.bus.publish(&StreamEvent::Ticker(MarketTick {
                        symbol: symbol.clone(),
                        bid: Some(bid),
                        ask: Some(ask),
                        last: Some(mid),
                        volume_24h: Some(state.volume),
                        exchange_timestamp: now,
                        received_at: now,
                    }));
                }
            }
            info!("paper ticker stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PaperConfig;
    use keel_broker::EventKind;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;

    #[tokio::test(start_paused = true)]
    async fn walk_feeds_the_exchange_and_the_bus() {
        let exchange = Arc::new(PaperExchange::new(PaperConfig::default()));
        let bus = Arc::new(EventBus::new());
        let ticks = Arc::new(Mutex::new(Vec::new()));
        let sink = ticks.clone();
        bus.subscribe(EventKind::Ticker, move |event| {
            if let StreamEvent::Ticker(tick) = event {
                sink.lock().push(tick.clone());
            }
        });
        let config = PaperMarketConfig {
            start_prices: BTreeMap::from([("XBTUSD".to_string(), dec!(100))]),
            interval_ms: 100,
            seed: Some(7),
            ..PaperMarketConfig::default()
        };
        let (tx, rx) = watch::channel(false);
        let handle = PaperTicker::new(exchange.clone(), bus, config).spawn(rx);
        tokio::time::sleep(Duration::from_millis(450)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let ticks = ticks.lock();
        assert!(ticks.len() >= 4);
        let quote = exchange.quote("XBTUSD").expect("quoted");
        assert!(quote.bid < quote.ask);
        assert!(quote.mid() > dec!(95) && quote.mid() < dec!(105));
        assert_eq!(ticks.last().and_then(|t| t.bid), Some(quote.bid));
    }

    #[test]
    fn opening_quotes_straddle_the_mid() {
        let exchange = Arc::new(PaperExchange::new(PaperConfig::default()));
        let ticker = PaperTicker::new(
            exchange.clone(),
            Arc::new(EventBus::new()),
            PaperMarketConfig {
                spread_bps: dec!(20),
                ..PaperMarketConfig::default()
            },
        );
        ticker.publish(&BTreeMap::from([("ETHUSD".to_string(), dec!(2000))]));
        let quote = exchange.quote("ETHUSD").expect("quoted");
        assert_eq!(quote.bid, dec!(1998));
        assert_eq!(quote.ask, dec!(2002));
    }

    #[test]
    fn configured_symbols_are_uppercased() {
        let config: PaperMarketConfig =
            serde_json::from_str(r#"{"start_prices":{"solusd":"150"}}"#).unwrap();
        assert_eq!(config.start_prices.get("SOLUSD"), Some(&dec!(150)));
        assert_eq!(config.interval_ms, 500);
    }
}
