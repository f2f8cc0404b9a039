//! Wrapper applying the shared rate limiter, per-call timeout and retry policy
//! to any [`Exchange`].

use std::future::Future;

use async_trait::async_trait;
use keel_core::{AccountBalance, BidAsk, Fill, Holding, Symbol};
use tracing::{debug, warn};

use crate::{
    BrokerResult, Exchange, ExchangeOrder, OrderAck, PlaceOrderRequest, RateLimiter, RetryPolicy,
};

pub struct GuardedExchange<E> {
    inner: E,
    limiter: RateLimiter,
    retry: RetryPolicy,
}

impl<E: Exchange> GuardedExchange<E> {
    pub fn new(inner: E, limiter: RateLimiter, retry: RetryPolicy) -> Self {
        Self {
            inner,
            limiter,
            retry,
        }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    async fn call<T, F, Fut>(&self, op: &'static str, mut call: F) -> BrokerResult<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = BrokerResult<T>> + Send,
        T: Send,
    {
        let mut attempt = 1;
        loop {
            self.limiter.acquire().await;
            match self.retry.attempt(call()).await {
                Ok(value) => return Ok(value),
                Err(err) if self.retry.should_retry(&err, attempt) => {
                    let delay = self.retry.backoff(attempt);
                    debug!(op, attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying exchange call");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    warn!(op, attempt, exchange = self.inner.name(), error = %err, "exchange call failed");
                    return Err(err);
                }
            }
        }
    }
}

#[async_trait]
impl<E: Exchange> Exchange for GuardedExchange<E> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn account_balances(&self) -> BrokerResult<Vec<AccountBalance>> {
        let inner = &self.inner;
        self.call("account_balances", move || inner.account_balances())
            .await
    }

    async fn holdings(&self) -> BrokerResult<Vec<Holding>> {
        let inner = &self.inner;
        self.call("holdings", move || inner.holdings()).await
    }

    async fn place_order(&self, request: PlaceOrderRequest) -> BrokerResult<OrderAck> {
        request.validate()?;
        let inner = &self.inner;
        // The client order id makes a retried placement idempotent at the exchange.
        self.call("place_order", move || inner.place_order(request.clone()))
            .await
    }

    async fn get_order(&self, order_id: &str) -> BrokerResult<ExchangeOrder> {
        let inner = &self.inner;
        self.call("get_order", move || inner.get_order(order_id))
            .await
    }

    async fn order_fills(&self, order_id: &str) -> BrokerResult<Vec<Fill>> {
        let inner = &self.inner;
        self.call("order_fills", move || inner.order_fills(order_id))
            .await
    }

    async fn cancel_order(&self, order_id: &str) -> BrokerResult<()> {
        let inner = &self.inner;
        self.call("cancel_order", move || inner.cancel_order(order_id))
            .await
    }

    async fn best_bid_ask(&self, symbol: &str) -> BrokerResult<Option<BidAsk>> {
        let inner = &self.inner;
        self.call("best_bid_ask", move || inner.best_bid_ask(symbol))
            .await
    }

    async fn best_bid_ask_batch(&self, symbols: &[Symbol]) -> BrokerResult<Vec<BidAsk>> {
        let inner = &self.inner;
        self.call("best_bid_ask_batch", move || {
            inner.best_bid_ask_batch(symbols)
        })
        .await
    }
}
