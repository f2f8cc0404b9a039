use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use keel_config::AlertingConfig;
use keel_reconcile::{BootAuditRecord, ResumeDecision};
use keel_risk::{HeartbeatTransition, TripEvent};
use parking_lot::Mutex;
use reqwest::Client;
use serde::Serialize;
use serde_json::json;
use tracing::{error, warn};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

/// Posts operator alerts to an optional webhook, suppressing repeats of the
/// same title inside the cooldown window.
pub struct AlertDispatcher {
    client: Client,
    webhook: Option<String>,
    cooldown: Duration,
    last_sent: Mutex<HashMap<String, Instant>>,
}

impl AlertDispatcher {
    pub fn new(config: &AlertingConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms.max(1)))
            .build()?;
        Ok(Self {
            client,
            webhook: sanitize_webhook(config.webhook_url.clone()),
            cooldown: Duration::from_secs(config.cooldown_secs),
            last_sent: Mutex::new(HashMap::new()),
        })
    }

    pub fn has_webhook(&self) -> bool {
        self.webhook.is_some()
    }

    /// Records the attempt and reports whether it is outside the cooldown.
    fn admit(&self, title: &str) -> bool {
        let now = Instant::now();
        let mut last_sent = self.last_sent.lock();
        if let Some(previous) = last_sent.get(title) {
            if now.duration_since(*previous) < self.cooldown {
                return false;
            }
        }
        last_sent.insert(title.to_string(), now);
        true
    }

    pub async fn notify(&self, severity: Severity, title: &str, message: &str) {
        if !self.admit(title) {
            return;
        }
        match severity {
            Severity::Critical => error!(%title, %message, "alert raised"),
            Severity::Warning => warn!(%title, %message, "alert raised"),
        }
        let Some(url) = self.webhook.as_ref() else {
            return;
        };
        let payload = json!({ "severity": severity, "title": title, "message": message });
        match self.client.post(url).json(&payload).send().await {
            Ok(response) if !response.status().is_success() => {
                error!(status = %response.status(), "alert webhook rejected the payload");
            }
            Ok(_) => {}
            Err(err) => error!(error = %err, "failed to send alert webhook"),
        }
    }

    /// Fire-and-forget variant for synchronous observers.
    pub fn spawn_notify(self: &Arc<Self>, severity: Severity, title: String, message: String) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(%title, %message, "alert raised outside the runtime");
            return;
        };
        let dispatcher = Arc::clone(self);
        handle.spawn(async move {
            dispatcher.notify(severity, &title, &message).await;
        });
    }

    pub fn breaker_tripped(self: &Arc<Self>, event: &TripEvent) {
        self.spawn_notify(
            Severity::Critical,
            "Circuit breaker tripped".into(),
            format!(
                "{} (trip #{}); new trades blocked until {}",
                event.reason, event.trip_count, event.cooldown_until
            ),
        );
    }

    pub fn heartbeat_changed(self: &Arc<Self>, transition: &HeartbeatTransition) {
        if transition.stale {
            self.spawn_notify(
                Severity::Warning,
                format!("Stale channel: {}", transition.channel),
                format!(
                    "no data on {} for {}s; entries blocked until it recovers",
                    transition.channel,
                    transition.silent_for.num_seconds()
                ),
            );
        }
    }

    pub async fn boot_decision(&self, record: &BootAuditRecord) {
        let (severity, title) = match &record.decision {
            ResumeDecision::Normal => return,
            ResumeDecision::SafeMode { .. } => (Severity::Warning, "Boot reconciliation: SAFE_MODE"),
            ResumeDecision::Halt { .. } => (Severity::Critical, "Boot reconciliation: HALT"),
        };
        let failed: Vec<&str> = record.failed_checks().map(|c| c.name.as_str()).collect();
        let mut message = match &record.decision {
            ResumeDecision::SafeMode { reason, until } => format!("{reason}; entries blocked until {until}"),
            ResumeDecision::Halt { reason } => format!("{reason}; manual intervention required"),
            ResumeDecision::Normal => String::new(),
        };
        if !failed.is_empty() {
            message.push_str(&format!(" (failed checks: {})", failed.join(", ")));
        }
        if let Some(err) = &record.error {
            message.push_str(&format!(" (error: {err})"));
        }
        message.push_str(&format!(" [run {}]", record.run_id));
        self.notify(severity, title, &message).await;
    }
}

pub fn sanitize_webhook(input: Option<String>) -> Option<String> {
    input.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher(cooldown_secs: u64) -> AlertDispatcher {
        AlertDispatcher::new(&AlertingConfig {
            webhook_url: Some("   ".into()),
            timeout_ms: 100,
            cooldown_secs,
        })
        .unwrap()
    }

    #[test]
    fn blank_webhooks_are_disabled() {
        assert!(!dispatcher(0).has_webhook());
        assert_eq!(
            sanitize_webhook(Some(" https://hooks.example/abc ".into())),
            Some("https://hooks.example/abc".to_string())
        );
    }

    #[test]
    fn repeats_inside_the_cooldown_are_suppressed() {
        let alerts = dispatcher(60);
        assert!(alerts.admit("Circuit breaker tripped"));
        assert!(!alerts.admit("Circuit breaker tripped"));
        assert!(alerts.admit("Stale channel: market_data"));

        let chatty = dispatcher(0);
        assert!(chatty.admit("x"));
        assert!(chatty.admit("x"));
    }
}
