//! Utilities for standing up a mock exchange that exercises keel end-to-end flows.

pub mod exchange;
pub mod scenario;
pub mod state;

pub use exchange::MockExchange;
pub use scenario::{Scenario, ScenarioAction, ScenarioManager, ScenarioTrigger};
pub use state::{MockCall, MockExchangeConfig, MockExchangeState};
