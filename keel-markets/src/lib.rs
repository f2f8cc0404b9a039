//! Market data pipeline: instrument catalog, focus/scout tiering, mover
//! detection, the latest-wins coalescer and the snapshot store behind it.

pub mod catalog;
pub mod coalescer;
pub mod focus;
pub mod movers;
pub mod store;
pub mod writer;

pub use catalog::{CatalogError, Market, MarketCatalog};
pub use coalescer::{Coalescer, CoalescerConfig, SnapshotSink};
pub use focus::{FocusConfig, FocusManager, Promotion, PromotionOutcome};
pub use movers::{MoverConfig, MoverDetector, MoverKind, MoverSignal};
pub use store::{SnapshotStore, SqliteMarketStore};
pub use writer::SnapshotWriter;
