use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use keel_broker::{BookSource, EventBus, StreamEvent};
use keel_core::{MarketTick, MarketTier};
use keel_markets::{
    Coalescer, CoalescerConfig, FocusConfig, FocusManager, MarketCatalog, MoverConfig,
    MoverDetector, SnapshotStore, SnapshotWriter, SqliteMarketStore,
};
use keel_portfolio::QuoteSource;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

const MARKETS: &str = r#"
[[markets]]
symbol = "XBTUSD"
base = "XBT"
quote = "USD"
tick_size = "0.1"

[[markets]]
symbol = "SOLUSD"
base = "SOL"
quote = "USD"
tick_size = "0.001"
"#;

fn tick(symbol: &str, mid: Decimal, at: chrono::DateTime<Utc>) -> StreamEvent {
    StreamEvent::Ticker(MarketTick {
        symbol: symbol.into(),
        bid: Some(mid - dec!(0.01)),
        ask: Some(mid + dec!(0.01)),
        last: Some(mid),
        volume_24h: None,
        exchange_timestamp: at,
        received_at: at,
    })
}

#[tokio::test]
async fn ticks_flow_from_bus_to_store_and_promote_movers() -> Result<()> {
    let catalog = MarketCatalog::from_toml_str(MARKETS)?;
    let focus = Arc::new(FocusManager::new(FocusConfig {
        default_symbols: vec!["XBTUSD".into()],
        ..FocusConfig::default()
    }));
    focus.set_universe(catalog.tradable_symbols());
    let store = Arc::new(SqliteMarketStore::new_in_memory()?);
    store.save_catalog(&catalog.markets())?;
    let writer = Arc::new(SnapshotWriter::new(
        store.clone(),
        focus.clone(),
        Arc::new(MoverDetector::new(MoverConfig::default())),
        // Mover samples below are backdated an hour.
        7_200,
    ));
    let coalescer = Arc::new(Coalescer::new(
        CoalescerConfig::default(),
        focus.clone(),
        writer.clone(),
    ));
    let bus = EventBus::new();
    coalescer.attach(&bus);

    let hour_ago = Utc::now() - Duration::minutes(60);
    for i in 0..50 {
        bus.publish(&tick("XBTUSD", dec!(100) + Decimal::from(i), Utc::now()));
    }
    bus.publish(&tick("SOLUSD", dec!(20), hour_ago));
    coalescer.flush_all().await?;

    assert_eq!(writer.mark_price("XBTUSD"), Some(dec!(149)));
    assert!(writer.book("SOLUSD").is_none());
    assert_eq!(store.snapshots(MarketTier::Scout)?.len(), 1);

    bus.publish(&tick("SOLUSD", dec!(21), Utc::now()));
    assert_eq!(coalescer.flush(MarketTier::Scout).await?, 1);
    assert_eq!(focus.tier_of("SOLUSD"), MarketTier::Focus);

    // Next flush of the promoted symbol lands in the focus tier.
    bus.publish(&tick("SOLUSD", dec!(21.5), Utc::now()));
    assert_eq!(coalescer.flush(MarketTier::Focus).await?, 1);
    assert_eq!(writer.mark_price("SOLUSD"), Some(dec!(21.5)));
    assert_eq!(store.catalog()?.len(), 2);
    Ok(())
}
