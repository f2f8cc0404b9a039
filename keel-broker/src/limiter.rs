//! Shared token bucket guarding every outbound exchange call.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RateLimiterError {
    #[error("rate limiter capacity must be positive")]
    ZeroCapacity,
    #[error("rate limiter refill interval must be positive")]
    ZeroInterval,
}

/// Token bucket holding `capacity` tokens and regaining one every `refill`.
///
/// Cloning shares the underlying bucket, so one instance can be handed to every
/// component that talks to the exchange.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<DefaultDirectRateLimiter>,
    capacity: u32,
    refill: Duration,
}

impl RateLimiter {
    pub fn new(capacity: u32, refill: Duration) -> Result<Self, RateLimiterError> {
        let burst = NonZeroU32::new(capacity).ok_or(RateLimiterError::ZeroCapacity)?;
        let quota = Quota::with_period(refill)
            .ok_or(RateLimiterError::ZeroInterval)?
            .allow_burst(burst);
        Ok(Self {
            inner: Arc::new(DefaultDirectRateLimiter::direct(quota)),
            capacity,
            refill,
        })
    }

    /// Build a limiter from a per-minute budget with the whole budget available as burst.
    pub fn per_minute(requests: u32) -> Result<Self, RateLimiterError> {
        let rate = NonZeroU32::new(requests).ok_or(RateLimiterError::ZeroCapacity)?;
        let refill = Duration::from_secs(60) / rate.get();
        Self::new(requests, refill)
    }

    /// Wait until a token is available.
    pub async fn acquire(&self) {
        self.inner.until_ready().await;
    }

    /// Take a token without waiting.
    pub fn try_acquire(&self) -> bool {
        self.inner.check().is_ok()
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn refill_interval(&self) -> Duration {
        self.refill
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("capacity", &self.capacity)
            .field("refill", &self.refill)
            .finish()
    }
}
