//! Observer interface over the live exchange streams.
//!
//! The task owning a connection publishes every decoded message here and the
//! bus dispatches it synchronously to the handlers registered for its kind.
//! Handlers run on the publisher's task and must not block: anything heavier
//! than a map lookup belongs behind a queue the handler feeds with `try_send`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use keel_core::{ExecutionMessage, MarketTick};
use parking_lot::RwLock;
use tracing::trace;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EventKind {
    Execution,
    Ticker,
    Heartbeat,
}

#[derive(Clone, Debug)]
pub enum StreamEvent {
    Execution(ExecutionMessage),
    Ticker(MarketTick),
    /// Liveness signal from a named connection.
    Heartbeat {
        channel: String,
        at: DateTime<Utc>,
    },
}

impl StreamEvent {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Execution(_) => EventKind::Execution,
            Self::Ticker(_) => EventKind::Ticker,
            Self::Heartbeat { .. } => EventKind::Heartbeat,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&StreamEvent) + Send + Sync>;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<EventKind, Vec<(SubscriptionId, EventHandler)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for every event of `kind`.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        let mut removed = false;
        for entries in handlers.values_mut() {
            let before = entries.len();
            entries.retain(|(entry_id, _)| *entry_id != id);
            removed |= entries.len() != before;
        }
        removed
    }

    /// Dispatch an event, returning how many handlers received it.
    pub fn publish(&self, event: &StreamEvent) -> usize {
        // Snapshot the handler list so handlers may (un)subscribe re-entrantly.
        let targets: Vec<EventHandler> = self
            .handlers
            .read()
            .get(&event.kind())
            .map(|entries| entries.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default();
        for handler in &targets {
            handler(event);
        }
        trace!(kind = ?event.kind(), handlers = targets.len(), "stream event dispatched");
        targets.len()
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn heartbeat() -> StreamEvent {
        StreamEvent::Heartbeat {
            channel: "executions".into(),
            at: Utc::now(),
        }
    }

    #[test]
    fn dispatches_only_to_matching_kind() {
        let bus = EventBus::new();
        let beats = Arc::new(AtomicUsize::new(0));
        let counter = beats.clone();
        bus.subscribe(EventKind::Heartbeat, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        bus.subscribe(EventKind::Ticker, |_| panic!("ticker handler invoked"));
        assert_eq!(bus.publish(&heartbeat()), 1);
        assert_eq!(beats.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_removes_handler() {
        let bus = EventBus::new();
        let id = bus.subscribe(EventKind::Heartbeat, |_| {});
        assert_eq!(bus.subscriber_count(EventKind::Heartbeat), 1);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.publish(&heartbeat()), 0);
    }

    #[test]
    fn handlers_may_subscribe_while_dispatching() {
        let bus = Arc::new(EventBus::new());
        let inner = bus.clone();
        bus.subscribe(EventKind::Heartbeat, move |_| {
            inner.subscribe(EventKind::Ticker, |_| {});
        });
        bus.publish(&heartbeat());
        assert_eq!(bus.subscriber_count(EventKind::Ticker), 1);
    }
}
