use std::sync::Arc;
use std::time::Duration;

use keel_broker::BrokerError;
use tokio::sync::Mutex;

/// Exchange call that can trigger a scripted behavior.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScenarioTrigger {
    AccountBalances,
    Holdings,
    PlaceOrder,
    GetOrder,
    OrderFills,
    CancelOrder,
    Quote,
}

/// Scripted behavior that mutates the mock exchange interaction.
#[derive(Clone, Debug)]
pub enum ScenarioAction {
    Delay(Duration),
    /// Fail the call with an HTTP-like status; `0` stands for a dropped connection.
    Fail { status: u16, reason: String },
}

impl ScenarioAction {
    /// Broker error a real binding would surface for this failure.
    #[must_use]
    pub fn error(status: u16, reason: &str) -> BrokerError {
        match status {
            0 => BrokerError::Transport(reason.to_string()),
            401 | 403 => BrokerError::Authentication(reason.to_string()),
            404 => BrokerError::NotFound(reason.to_string()),
            429 => BrokerError::RateLimited(reason.to_string()),
            400..=499 => BrokerError::InvalidRequest(reason.to_string()),
            _ => BrokerError::Server {
                status,
                message: reason.to_string(),
            },
        }
    }
}

/// Declarative scenario scheduled for execution.
#[derive(Clone, Debug)]
pub struct Scenario {
    pub name: String,
    pub trigger: ScenarioTrigger,
    pub action: ScenarioAction,
}

impl Scenario {
    /// Utility constructor for failure scenarios.
    pub fn fail(
        name: impl Into<String>,
        trigger: ScenarioTrigger,
        status: u16,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            trigger,
            action: ScenarioAction::Fail {
                status,
                reason: reason.into(),
            },
        }
    }

    pub fn delay(name: impl Into<String>, trigger: ScenarioTrigger, delay: Duration) -> Self {
        Self {
            name: name.into(),
            trigger,
            action: ScenarioAction::Delay(delay),
        }
    }
}

/// Thread-safe store for scripted scenarios.
#[derive(Clone, Default)]
pub struct ScenarioManager {
    inner: Arc<Mutex<Vec<Scenario>>>,
}

impl ScenarioManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a scenario to the back of the queue.
    pub async fn push(&self, scenario: Scenario) {
        self.inner.lock().await.push(scenario);
    }

    /// Drains and returns the first scenario matching the trigger.
    pub async fn take_for(&self, trigger: ScenarioTrigger) -> Option<ScenarioAction> {
        let mut guard = self.inner.lock().await;
        guard
            .iter()
            .position(|scenario| scenario.trigger == trigger)
            .map(|idx| guard.remove(idx).action)
    }

    pub async fn pending(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Clears all registered scenarios.
    pub async fn clear(&self) {
        self.inner.lock().await.clear();
    }
}
