//! Pre-trade risk controls: the circuit breaker, the trading gate that
//! carries safe mode and halt, and the heartbeat monitor feeding it.

pub mod breaker;
pub mod gate;
pub mod heartbeat;

pub use breaker::{
    BreakerSnapshot, BreakerState, CircuitBreaker, CircuitBreakerConfig, TradeBlock, TripEvent,
    TripReason,
};
pub use gate::{GateBlock, GateState, SafeModeEntry, TradingGate};
pub use heartbeat::{
    ChannelKind, HeartbeatConfig, HeartbeatMonitor, HeartbeatTransition, EXECUTION_CHANNEL,
    MARKET_DATA_CHANNEL,
};
