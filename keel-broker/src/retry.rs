use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::{BrokerError, BrokerResult};

/// Timeout and backoff settings applied to exchange calls and stream reconnects.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_call_timeout_ms() -> u64 {
    10_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms.max(1))
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// [`Self::backoff`] plus up to 50% random jitter, used for reconnect storms.
    pub fn backoff_with_jitter(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        let spread = (base.as_millis() as u64) / 2;
        if spread == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..=spread);
        base + Duration::from_millis(jitter)
    }

    /// Whether a failure on attempt `attempt` (1-based) should be retried.
    pub fn should_retry(&self, err: &BrokerError, attempt: u32) -> bool {
        err.is_transient() && attempt < self.max_attempts.max(1)
    }

    /// Run one attempt bounded by the call timeout.
    pub async fn attempt<T, Fut>(&self, call: Fut) -> BrokerResult<T>
    where
        Fut: Future<Output = BrokerResult<T>>,
    {
        let limit = self.call_timeout();
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Timeout(limit)),
        }
    }

    /// Run `call` with a timeout per attempt, retrying transient failures.
    pub async fn run<T, F, Fut>(&self, op: &str, mut call: F) -> BrokerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BrokerResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match self.attempt(call()).await {
                Ok(value) => return Ok(value),
                Err(err) if self.should_retry(&err, attempt) => {
                    let delay = self.backoff(attempt);
                    warn!(op, attempt, delay_ms = delay.as_millis() as u64, error = %err, "transient exchange error; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Keep a streaming session alive until `shutdown` flips to `true`.
///
/// `session` runs one connection until it drops (returning `Ok`) or fails; the
/// next attempt waits with jittered exponential backoff. A session that ends
/// cleanly resets the backoff.
pub async fn run_with_reconnect<F, Fut>(
    name: &str,
    policy: &RetryPolicy,
    mut shutdown: watch::Receiver<bool>,
    mut session: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = BrokerResult<()>>,
{
    let mut failures = 0u32;
    loop {
        if *shutdown.borrow() {
            break;
        }
        let result = tokio::select! {
            result = session() => result,
            _ = shutdown.changed() => break,
        };
        match result {
            Ok(()) => {
                failures = 0;
                info!(stream = name, "stream session ended; reconnecting");
            }
            Err(err) => {
                failures = failures.saturating_add(1);
                warn!(stream = name, failures, error = %err, "stream session failed");
            }
        }
        let delay = policy.backoff_with_jitter(failures.max(1));
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }
    info!(stream = name, "stream supervisor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 300,
            call_timeout_ms: 1_000,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = policy();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(300));
        assert_eq!(policy.backoff(30), Duration::from_millis(300));
    }

    #[test]
    fn jitter_stays_within_half_of_backoff() {
        let policy = policy();
        for _ in 0..50 {
            let delay = policy.backoff_with_jitter(2);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(300));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_up_to_cap() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: BrokerResult<()> = policy()
            .run("probe", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(BrokerError::Transport("reset".into()))
                }
            })
            .await;
        assert!(matches!(result, Err(BrokerError::Transport(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: BrokerResult<()> = policy()
            .run("probe", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(BrokerError::InvalidRequest("bad".into()))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_time_out() {
        let result: BrokerResult<()> = policy()
            .attempt(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(BrokerError::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_loop_stops_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        let sessions = Arc::new(AtomicU32::new(0));
        let counter = sessions.clone();
        let handle = tokio::spawn(async move {
            run_with_reconnect("test", &policy(), rx, || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(BrokerError::Transport("dropped".into()))
                }
            })
            .await;
        });
        tokio::time::sleep(Duration::from_secs(2)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(sessions.load(Ordering::SeqCst) >= 2);
    }
}
