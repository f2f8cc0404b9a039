use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use keel_broker::{BrokerError, BrokerResult, ExchangeOrder, OrderAck, PlaceOrderRequest};
use keel_core::{
    AccountBalance, BidAsk, Fill, Holding, OrderId, OrderType, Price, Quantity, Side, Symbol,
    TradingMode,
};
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use crate::scenario::ScenarioManager;

/// Seed values for a fresh mock exchange.
#[derive(Clone, Debug)]
pub struct MockExchangeConfig {
    pub name: String,
    pub quote_currency: String,
    pub balances: Vec<(String, Decimal)>,
    pub holdings: Vec<(Symbol, Quantity)>,
}

impl Default for MockExchangeConfig {
    fn default() -> Self {
        Self {
            name: "mock".into(),
            quote_currency: "USD".into(),
            balances: vec![("USD".into(), Decimal::new(10_000, 0))],
            holdings: Vec::new(),
        }
    }
}

/// One recorded call against the mock.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MockCall {
    pub op: &'static str,
    pub arg: String,
}

pub(crate) struct Inner {
    pub quote_currency: String,
    pub balances: HashMap<String, Decimal>,
    pub holdings: HashMap<Symbol, Quantity>,
    pub quotes: HashMap<Symbol, BidAsk>,
    pub orders: HashMap<OrderId, ExchangeOrder>,
    pub requests: HashMap<OrderId, PlaceOrderRequest>,
    pub fills: HashMap<OrderId, Vec<Fill>>,
    pub calls: Vec<MockCall>,
    pub order_seq: u64,
    pub fill_seq: u64,
}

/// Shared state for the in-memory mock exchange.
#[derive(Clone)]
pub struct MockExchangeState {
    inner: Arc<Mutex<Inner>>,
    scenarios: ScenarioManager,
}

impl MockExchangeState {
    pub fn new(config: MockExchangeConfig) -> Self {
        let inner = Inner {
            quote_currency: config.quote_currency,
            balances: config.balances.into_iter().collect(),
            holdings: config.holdings.into_iter().collect(),
            quotes: HashMap::new(),
            orders: HashMap::new(),
            requests: HashMap::new(),
            fills: HashMap::new(),
            calls: Vec::new(),
            order_seq: 0,
            fill_seq: 0,
        };
        Self {
            inner: Arc::new(Mutex::new(inner)),
            scenarios: ScenarioManager::new(),
        }
    }

    #[must_use]
    pub fn scenarios(&self) -> ScenarioManager {
        self.scenarios.clone()
    }

    pub(crate) async fn record(&self, op: &'static str, arg: impl Into<String>) {
        self.inner.lock().await.calls.push(MockCall {
            op,
            arg: arg.into(),
        });
    }

    pub async fn calls(&self) -> Vec<MockCall> {
        self.inner.lock().await.calls.clone()
    }

    /// Number of recorded calls for one operation.
    pub async fn call_count(&self, op: &str) -> usize {
        self.inner
            .lock()
            .await
            .calls
            .iter()
            .filter(|call| call.op == op)
            .count()
    }

    pub async fn set_balance(&self, currency: &str, amount: Decimal) {
        self.inner
            .lock()
            .await
            .balances
            .insert(currency.to_string(), amount);
    }

    pub async fn set_holding(&self, symbol: &str, quantity: Quantity) {
        let mut inner = self.inner.lock().await;
        if quantity.is_zero() {
            inner.holdings.remove(symbol);
        } else {
            inner.holdings.insert(symbol.to_string(), quantity);
        }
    }

    pub async fn set_quote(&self, symbol: &str, bid: Price, ask: Price) {
        self.inner.lock().await.quotes.insert(
            symbol.to_string(),
            BidAsk {
                symbol: symbol.to_string(),
                bid,
                ask,
                observed_at: Utc::now(),
            },
        );
    }

    pub async fn clear_quote(&self, symbol: &str) {
        self.inner.lock().await.quotes.remove(symbol);
    }

    /// Overwrite the raw exchange status of an order.
    pub async fn set_order_status(&self, order_id: &str, status: &str) {
        if let Some(order) = self.inner.lock().await.orders.get_mut(order_id) {
            order.status = status.to_string();
            order.updated_at = Utc::now();
        }
    }

    /// Execute part or all of an order, moving balances and holdings like the venue would.
    pub async fn fill_order(
        &self,
        order_id: &str,
        quantity: Quantity,
        price: Price,
        fee: Price,
    ) -> Option<Fill> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        inner.fill_seq += 1;
        let fill_id = format!("T-{}", inner.fill_seq);
        let quote_currency = inner.quote_currency.clone();
        let order = inner.orders.get_mut(order_id)?;
        let previous = order.filled_quantity;
        let filled = previous + quantity;
        let avg = order
            .avg_fill_price
            .map_or(price, |avg| (avg * previous + price * quantity) / filled);
        order.filled_quantity = filled;
        order.avg_fill_price = Some(avg);
        order.updated_at = Utc::now();
        let side = order.side;
        let symbol = order.symbol.clone();
        let target = inner
            .requests
            .get(order_id)
            .and_then(|request| request.quantity);
        let complete = target.map_or(true, |target| filled >= target);
        if let Some(order) = inner.orders.get_mut(order_id) {
            order.status = if complete { "closed" } else { "open" }.to_string();
        }

        let notional = quantity * price;
        let cash = inner.balances.entry(quote_currency.clone()).or_default();
        let held = inner.holdings.entry(symbol.clone()).or_default();
        match side {
            Side::Buy => {
                *held += quantity;
                *cash -= notional + fee;
            }
            Side::Sell => {
                *held -= quantity;
                *cash += notional - fee;
            }
        }
        if inner.holdings.get(&symbol).is_some_and(|qty| qty.is_zero()) {
            inner.holdings.remove(&symbol);
        }

        let fill = Fill {
            fill_id,
            order_id: order_id.to_string(),
            symbol,
            side,
            quantity,
            price,
            fee,
            fee_currency: quote_currency,
            executed_at: Utc::now(),
            mode: TradingMode::Live,
        };
        inner
            .fills
            .entry(order_id.to_string())
            .or_default()
            .push(fill.clone());
        Some(fill)
    }

    pub async fn order(&self, order_id: &str) -> Option<ExchangeOrder> {
        self.inner.lock().await.orders.get(order_id).cloned()
    }

    pub async fn open_orders(&self) -> Vec<ExchangeOrder> {
        let mut orders: Vec<_> = self
            .inner
            .lock()
            .await
            .orders
            .values()
            .filter(|order| order.status == "open" || order.status == "pending")
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.order_id.cmp(&b.order_id));
        orders
    }

    /// Request that created an order, for asserting on sizes and prices.
    pub async fn request(&self, order_id: &str) -> Option<PlaceOrderRequest> {
        self.inner.lock().await.requests.get(order_id).cloned()
    }

    pub(crate) async fn balances(&self) -> Vec<AccountBalance> {
        let now = Utc::now();
        let mut balances: Vec<_> = self
            .inner
            .lock()
            .await
            .balances
            .iter()
            .map(|(currency, amount)| AccountBalance {
                currency: currency.clone(),
                total: *amount,
                available: *amount,
                updated_at: now,
            })
            .collect();
        balances.sort_by(|a, b| a.currency.cmp(&b.currency));
        balances
    }

    pub(crate) async fn holdings(&self) -> Vec<Holding> {
        let now = Utc::now();
        let mut holdings: Vec<_> = self
            .inner
            .lock()
            .await
            .holdings
            .iter()
            .map(|(symbol, quantity)| Holding {
                symbol: symbol.clone(),
                quantity: *quantity,
                updated_at: now,
            })
            .collect();
        holdings.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        holdings
    }

    /// Accept an order. Reusing a client order id returns the original order.
    pub(crate) async fn place(&self, request: PlaceOrderRequest) -> BrokerResult<OrderAck> {
        request.validate()?;
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner
            .orders
            .values()
            .find(|order| order.client_order_id.as_deref() == Some(request.client_order_id.as_str()))
        {
            return Ok(OrderAck {
                order_id: existing.order_id.clone(),
                status: existing.status.clone(),
            });
        }
        if request.order_type == OrderType::Market && !inner.quotes.contains_key(&request.symbol) {
            return Err(BrokerError::InvalidRequest(format!(
                "no market for {}",
                request.symbol
            )));
        }
        inner.order_seq += 1;
        let order_id = format!("O-{}", inner.order_seq);
        let order = ExchangeOrder {
            order_id: order_id.clone(),
            client_order_id: Some(request.client_order_id.clone()),
            symbol: request.symbol.clone(),
            side: request.side,
            status: "open".into(),
            filled_quantity: Decimal::ZERO,
            avg_fill_price: None,
            limit_price: request.limit_price,
            updated_at: Utc::now(),
        };
        inner.orders.insert(order_id.clone(), order);
        inner.requests.insert(order_id.clone(), request);
        Ok(OrderAck {
            order_id,
            status: "open".into(),
        })
    }

    pub(crate) async fn get(&self, order_id: &str) -> BrokerResult<ExchangeOrder> {
        self.order(order_id)
            .await
            .ok_or_else(|| BrokerError::NotFound(format!("unknown order {order_id}")))
    }

    pub(crate) async fn fills(&self, order_id: &str) -> BrokerResult<Vec<Fill>> {
        let inner = self.inner.lock().await;
        if !inner.orders.contains_key(order_id) {
            return Err(BrokerError::NotFound(format!("unknown order {order_id}")));
        }
        Ok(inner.fills.get(order_id).cloned().unwrap_or_default())
    }

    pub(crate) async fn cancel(&self, order_id: &str) -> BrokerResult<()> {
        let mut inner = self.inner.lock().await;
        let order = inner
            .orders
            .get_mut(order_id)
            .ok_or_else(|| BrokerError::NotFound(format!("unknown order {order_id}")))?;
        if order.status == "closed" {
            return Err(BrokerError::InvalidRequest(format!(
                "order {order_id} already closed"
            )));
        }
        order.status = "canceled".into();
        order.updated_at = Utc::now();
        Ok(())
    }

    pub(crate) async fn quote(&self, symbol: &str) -> Option<BidAsk> {
        self.inner.lock().await.quotes.get(symbol).cloned()
    }
}
