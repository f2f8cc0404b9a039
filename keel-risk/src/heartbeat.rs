//! Dead-man's switch: channels that go silent put the gate into safe mode.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use keel_broker::{EventBus, EventKind, StreamEvent};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::gate::TradingGate;

pub const MARKET_DATA_CHANNEL: &str = "market_data";
pub const EXECUTION_CHANNEL: &str = "executions";

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct HeartbeatConfig {
    /// Market data older than this is stale.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: i64,
    /// A connection silent for this long is considered dead.
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: i64,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

fn default_stale_after_secs() -> i64 {
    30
}

fn default_heartbeat_timeout_secs() -> i64 {
    45
}

fn default_check_interval_secs() -> u64 {
    5
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChannelKind {
    MarketData,
    Connection,
}

/// A channel crossing its silence window in either direction.
#[derive(Clone, Debug, PartialEq)]
pub struct HeartbeatTransition {
    pub channel: String,
    pub stale: bool,
    pub silent_for: Duration,
}

struct Channel {
    kind: ChannelKind,
    last_seen: DateTime<Utc>,
    stale: bool,
}

pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    gate: Arc<TradingGate>,
    channels: Mutex<HashMap<String, Channel>>,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig, gate: Arc<TradingGate>) -> Self {
        Self {
            config,
            gate,
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn window(&self, kind: ChannelKind) -> Duration {
        match kind {
            ChannelKind::MarketData => Duration::seconds(self.config.stale_after_secs),
            ChannelKind::Connection => Duration::seconds(self.config.heartbeat_timeout_secs),
        }
    }

    fn gate_key(channel: &str) -> String {
        format!("heartbeat:{channel}")
    }

    /// Start watching a channel; it counts as seen at `now`.
    pub fn register(&self, channel: impl Into<String>, kind: ChannelKind) {
        self.register_at(channel, kind, Utc::now());
    }

    pub fn register_at(&self, channel: impl Into<String>, kind: ChannelKind, now: DateTime<Utc>) {
        self.channels.lock().insert(
            channel.into(),
            Channel {
                kind,
                last_seen: now,
                stale: false,
            },
        );
    }

    pub fn beat(&self, channel: &str) {
        self.beat_at(channel, Utc::now());
    }

    /// Record activity. Unknown channels are registered as connections.
    pub fn beat_at(&self, channel: &str, at: DateTime<Utc>) {
        let mut channels = self.channels.lock();
        match channels.get_mut(channel) {
            Some(entry) => {
                if at > entry.last_seen {
                    entry.last_seen = at;
                }
            }
            None => {
                channels.insert(
                    channel.to_string(),
                    Channel {
                        kind: ChannelKind::Connection,
                        last_seen: at,
                        stale: false,
                    },
                );
            }
        }
    }

    /// Feed the monitor from the stream bus. Ticks refresh the market-data
    /// channel, execution messages the execution channel, and explicit
    /// heartbeats their named channel.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) {
        let monitor = self.clone();
        bus.subscribe(EventKind::Ticker, move |_| {
            monitor.beat(MARKET_DATA_CHANNEL);
        });
        let monitor = self.clone();
        bus.subscribe(EventKind::Execution, move |_| {
            monitor.beat(EXECUTION_CHANNEL);
        });
        let monitor = self.clone();
        bus.subscribe(EventKind::Heartbeat, move |event| {
            if let StreamEvent::Heartbeat { channel, at } = event {
                monitor.beat_at(channel, *at);
            }
        });
    }

    /// Compare every channel against its window and update the gate.
    pub fn evaluate(&self, now: DateTime<Utc>) -> Vec<HeartbeatTransition> {
        let mut transitions = Vec::new();
        let mut channels = self.channels.lock();
        for (name, channel) in channels.iter_mut() {
            let silent_for = now - channel.last_seen;
            let stale = silent_for > self.window(channel.kind);
            if stale == channel.stale {
                continue;
            }
            channel.stale = stale;
            if stale {
                let detail = match channel.kind {
                    ChannelKind::MarketData => {
                        format!("market data stale for {}s", silent_for.num_seconds())
                    }
                    ChannelKind::Connection => {
                        format!("no heartbeat on {name} for {}s", silent_for.num_seconds())
                    }
                };
                self.gate.enter_safe_mode(Self::gate_key(name), detail, None);
            } else {
                self.gate.clear_safe_mode(&Self::gate_key(name));
            }
            transitions.push(HeartbeatTransition {
                channel: name.clone(),
                stale,
                silent_for,
            });
        }
        transitions
    }

    /// Spawn the periodic check. `on_transition` runs on the monitor task.
    pub fn spawn<F>(self: Arc<Self>, mut shutdown: watch::Receiver<bool>, on_transition: F) -> JoinHandle<()>
    where
        F: Fn(&HeartbeatTransition) + Send + Sync + 'static,
    {
        let period = StdDuration::from_secs(self.config.check_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                for transition in self.evaluate(Utc::now()) {
                    if transition.stale {
                        warn!(channel = %transition.channel, silent_secs = transition.silent_for.num_seconds(), "heartbeat missed");
                    } else {
                        info!(channel = %transition.channel, "heartbeat restored");
                    }
                    on_transition(&transition);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::GateState;
    use keel_core::OrderPurpose;

    fn monitor() -> (Arc<TradingGate>, HeartbeatMonitor) {
        let gate = Arc::new(TradingGate::new());
        let monitor = HeartbeatMonitor::new(
            HeartbeatConfig {
                stale_after_secs: 10,
                heartbeat_timeout_secs: 20,
                check_interval_secs: 1,
            },
            gate.clone(),
        );
        (gate, monitor)
    }

    #[test]
    fn stale_market_data_enters_and_leaves_safe_mode() {
        let (gate, monitor) = monitor();
        let t0 = Utc::now();
        monitor.register_at(MARKET_DATA_CHANNEL, ChannelKind::MarketData, t0);
        assert!(monitor.evaluate(t0 + Duration::seconds(5)).is_empty());

        let transitions = monitor.evaluate(t0 + Duration::seconds(11));
        assert_eq!(transitions.len(), 1);
        assert!(transitions[0].stale);
        assert!(gate.permits(OrderPurpose::Entry).is_err());
        assert!(gate.permits(OrderPurpose::Exit).is_ok());

        monitor.beat_at(MARKET_DATA_CHANNEL, t0 + Duration::seconds(12));
        let transitions = monitor.evaluate(t0 + Duration::seconds(13));
        assert!(!transitions[0].stale);
        assert_eq!(gate.state(), GateState::Normal);
    }

    #[test]
    fn connections_use_their_own_window() {
        let (gate, monitor) = monitor();
        let t0 = Utc::now();
        monitor.register_at(EXECUTION_CHANNEL, ChannelKind::Connection, t0);
        assert!(monitor.evaluate(t0 + Duration::seconds(15)).is_empty());
        assert_eq!(monitor.evaluate(t0 + Duration::seconds(21)).len(), 1);
        assert!(matches!(gate.state(), GateState::SafeMode { .. }));
    }

    #[test]
    fn bus_events_refresh_channels() {
        let (_gate, monitor) = monitor();
        let monitor = Arc::new(monitor);
        let bus = EventBus::new();
        monitor.attach(&bus);
        let t0 = Utc::now() - Duration::seconds(100);
        monitor.register_at("ws-private", ChannelKind::Connection, t0);
        bus.publish(&StreamEvent::Heartbeat {
            channel: "ws-private".into(),
            at: Utc::now(),
        });
        assert!(monitor.evaluate(Utc::now()).is_empty());
    }
}
