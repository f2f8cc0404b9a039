//! Paper-trading exchange.
//!
//! Orders fill against the latest quote fed through [`PaperExchange::update_quote`]
//! (by the random-walk ticker or by a live market-data feed). Market orders and
//! marketable limits fill immediately with fee and slippage applied; other
//! limits rest until the quote crosses them.

mod market;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_broker::{
    BrokerError, BrokerResult, EventBus, Exchange, ExchangeOrder, OrderAck, PlaceOrderRequest,
    StreamEvent,
};
use keel_core::{
    AccountBalance, BidAsk, ExecutionMessage, Fill, Holding, OrderId, OrderType, Price, Quantity,
    Side, Symbol, TradingMode,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

pub use market::{PaperMarketConfig, PaperTicker};

const BPS: Decimal = Decimal::from_parts(10_000, 0, 0, false, 0);
/// Quantity precision for notional-sized orders.
const QUANTITY_DP: u32 = 8;

const STATUS_OPEN: &str = "open";
const STATUS_CLOSED: &str = "closed";
const STATUS_CANCELED: &str = "canceled";

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PaperConfig {
    #[serde(default = "default_quote_currency")]
    pub quote_currency: String,
    #[serde(default = "default_initial_cash")]
    pub initial_cash: Price,
    /// Taker fee charged on every fill.
    #[serde(default = "default_fee_bps")]
    pub fee_bps: Decimal,
    /// Adverse price move applied to market orders.
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: Decimal,
    #[serde(default)]
    pub market: PaperMarketConfig,
}

fn default_quote_currency() -> String {
    "USD".into()
}

fn default_initial_cash() -> Price {
    Decimal::from(10_000)
}

fn default_fee_bps() -> Decimal {
    Decimal::from(26)
}

fn default_slippage_bps() -> Decimal {
    Decimal::from(5)
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            quote_currency: default_quote_currency(),
            initial_cash: default_initial_cash(),
            fee_bps: default_fee_bps(),
            slippage_bps: default_slippage_bps(),
            market: PaperMarketConfig::default(),
        }
    }
}

struct PaperOrder {
    request: PlaceOrderRequest,
    view: ExchangeOrder,
}

struct Book {
    cash: Price,
    holdings: HashMap<Symbol, Quantity>,
    quotes: HashMap<Symbol, BidAsk>,
    orders: HashMap<OrderId, PaperOrder>,
    by_client_id: HashMap<String, OrderId>,
    fills: HashMap<OrderId, Vec<Fill>>,
}

pub struct PaperExchange {
    config: PaperConfig,
    book: Mutex<Book>,
    bus: Option<Arc<EventBus>>,
}

impl PaperExchange {
    pub fn new(config: PaperConfig) -> Self {
        let book = Book {
            cash: config.initial_cash,
            holdings: HashMap::new(),
            quotes: HashMap::new(),
            orders: HashMap::new(),
            by_client_id: HashMap::new(),
            fills: HashMap::new(),
        };
        Self {
            config,
            book: Mutex::new(book),
            bus: None,
        }
    }

    /// Publish execution messages for every fill and status change on `bus`.
    #[must_use]
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn config(&self) -> &PaperConfig {
        &self.config
    }

    /// Replace cash and holdings, typically with the ledger state rebuilt at boot.
    pub fn seed(&self, cash: Price, holdings: impl IntoIterator<Item = (Symbol, Quantity)>) {
        let mut book = self.book.lock();
        book.cash = cash;
        book.holdings = holdings
            .into_iter()
            .filter(|(_, qty)| *qty > Decimal::ZERO)
            .collect();
        info!(cash = %cash, holdings = book.holdings.len(), "paper account seeded");
    }

    pub fn cash(&self) -> Price {
        self.book.lock().cash
    }

    pub fn quote(&self, symbol: &str) -> Option<BidAsk> {
        self.book.lock().quotes.get(symbol).cloned()
    }

    /// Record a new top of book and fill every resting limit it crosses.
    pub fn update_quote(&self, symbol: &str, bid: Price, ask: Price) -> Vec<Fill> {
        let now = Utc::now();
        let mut fills = Vec::new();
        let mut statuses = Vec::new();
        {
            let mut book = self.book.lock();
            book.quotes.insert(
                symbol.to_string(),
                BidAsk {
                    symbol: symbol.to_string(),
                    bid,
                    ask,
                    observed_at: now,
                },
            );
            let crossed: Vec<(OrderId, Price)> = book
                .orders
                .values()
                .filter(|order| order.view.status == STATUS_OPEN && order.request.symbol == symbol)
                .filter_map(|order| {
                    let limit = order.request.limit_price?;
                    let crosses = match order.request.side {
                        Side::Buy => ask <= limit,
                        Side::Sell => bid >= limit,
                    };
                    crosses.then(|| (order.view.order_id.clone(), limit))
                })
                .collect();
            for (order_id, limit) in crossed {
                match self.execute(&mut book, &order_id, limit, now) {
                    Ok(fill) => {
                        statuses.push(order_id);
                        fills.push(fill);
                    }
                    Err(err) => debug!(order_id = %order_id, error = %err, "resting order not fillable yet"),
                }
            }
        }
        for (fill, order_id) in fills.iter().zip(&statuses) {
            self.publish_fill(fill);
            self.publish_status(order_id, STATUS_CLOSED, now);
        }
        fills
    }

    fn quantity_for(&self, request: &PlaceOrderRequest, price: Price) -> BrokerResult<Quantity> {
        match (request.quantity, request.notional) {
            (Some(qty), _) => Ok(qty),
            (None, Some(notional)) if price > Decimal::ZERO => {
                Ok((notional / price).round_dp(QUANTITY_DP))
            }
            _ => Err(BrokerError::InvalidRequest(format!(
                "cannot size order for {}",
                request.symbol
            ))),
        }
    }

    /// Fill `order_id` completely at `price`, moving cash and holdings.
    fn execute(
        &self,
        book: &mut Book,
        order_id: &str,
        price: Price,
        now: DateTime<Utc>,
    ) -> BrokerResult<Fill> {
        let request = book
            .orders
            .get(order_id)
            .map(|order| order.request.clone())
            .ok_or_else(|| BrokerError::NotFound(format!("unknown order {order_id}")))?;
        let quantity = self.quantity_for(&request, price)?;
        if quantity <= Decimal::ZERO {
            return Err(BrokerError::InvalidRequest("order rounds to zero quantity".into()));
        }
        let notional = quantity * price;
        let fee = (notional * self.config.fee_bps / BPS).round_dp(QUANTITY_DP);
        match request.side {
            Side::Buy => {
                if notional + fee > book.cash {
                    return Err(BrokerError::InsufficientFunds(format!(
                        "need {} {}, have {}",
                        notional + fee,
                        self.config.quote_currency,
                        book.cash
                    )));
                }
                book.cash -= notional + fee;
                *book.holdings.entry(request.symbol.clone()).or_default() += quantity;
            }
            Side::Sell => {
                let held = book.holdings.get(&request.symbol).copied().unwrap_or_default();
                if quantity > held {
                    return Err(BrokerError::InsufficientFunds(format!(
                        "sell {quantity} {} exceeds holding {held}",
                        request.symbol
                    )));
                }
                book.cash += notional - fee;
                let remaining = held - quantity;
                if remaining.is_zero() {
                    book.holdings.remove(&request.symbol);
                } else {
                    book.holdings.insert(request.symbol.clone(), remaining);
                }
            }
        }
        let fill = Fill {
            fill_id: format!("PF-{}", Uuid::new_v4()),
            order_id: order_id.to_string(),
            symbol: request.symbol.clone(),
            side: request.side,
            quantity,
            price,
            fee,
            fee_currency: self.config.quote_currency.clone(),
            executed_at: now,
            mode: TradingMode::Paper,
        };
        if let Some(order) = book.orders.get_mut(order_id) {
            order.view.status = STATUS_CLOSED.into();
            order.view.filled_quantity = quantity;
            order.view.avg_fill_price = Some(price);
            order.view.updated_at = now;
        }
        book.fills
            .entry(order_id.to_string())
            .or_default()
            .push(fill.clone());
        debug!(
            order_id,
            symbol = %fill.symbol,
            side = fill.side.as_str(),
            qty = %quantity,
            price = %price,
            fee = %fee,
            "paper fill"
        );
        Ok(fill)
    }

    fn slipped(&self, side: Side, quote: &BidAsk) -> Price {
        let slip = self.config.slippage_bps / BPS;
        match side {
            Side::Buy => quote.ask * (Decimal::ONE + slip),
            Side::Sell => quote.bid * (Decimal::ONE - slip),
        }
    }

    fn publish_fill(&self, fill: &Fill) {
        if let Some(bus) = &self.bus {
            bus.publish(&StreamEvent::Execution(ExecutionMessage::from_fill(fill)));
        }
    }

    fn publish_status(&self, order_id: &str, status: &str, at: DateTime<Utc>) {
        if let Some(bus) = &self.bus {
            bus.publish(&StreamEvent::Execution(ExecutionMessage {
                exec_type: "status".into(),
                order_id: order_id.to_string(),
                client_order_id: None,
                fill_id: None,
                symbol: None,
                side: None,
                quantity: None,
                price: None,
                fee: None,
                fee_currency: None,
                order_status: Some(status.to_string()),
                timestamp: at,
            }));
        }
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    fn name(&self) -> &str {
        "paper"
    }

    async fn account_balances(&self) -> BrokerResult<Vec<AccountBalance>> {
        let cash = self.cash();
        Ok(vec![AccountBalance {
            currency: self.config.quote_currency.clone(),
            total: cash,
            available: cash,
            updated_at: Utc::now(),
        }])
    }

    async fn holdings(&self) -> BrokerResult<Vec<Holding>> {
        let now = Utc::now();
        let mut holdings: Vec<Holding> = self
            .book
            .lock()
            .holdings
            .iter()
            .map(|(symbol, quantity)| Holding {
                symbol: symbol.clone(),
                quantity: *quantity,
                updated_at: now,
            })
            .collect();
        holdings.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(holdings)
    }

    async fn place_order(&self, request: PlaceOrderRequest) -> BrokerResult<OrderAck> {
        request.validate()?;
        let now = Utc::now();
        let (ack, fill) = {
            let mut book = self.book.lock();
            if let Some(existing) = book
                .by_client_id
                .get(&request.client_order_id)
                .and_then(|order_id| book.orders.get(order_id))
            {
                return Ok(OrderAck {
                    order_id: existing.view.order_id.clone(),
                    status: existing.view.status.clone(),
                });
            }
            let quote = book.quotes.get(&request.symbol).cloned().ok_or_else(|| {
                BrokerError::InvalidRequest(format!("no paper market for {}", request.symbol))
            })?;
            let fill_price = match (request.order_type, request.limit_price) {
                (OrderType::Market, _) => Some(self.slipped(request.side, &quote)),
                (OrderType::Limit, Some(limit)) => match request.side {
                    Side::Buy if quote.ask <= limit => Some(quote.ask),
                    Side::Sell if quote.bid >= limit => Some(quote.bid),
                    _ => None,
                },
                (OrderType::Limit, None) => None,
            };
            let order_id = format!("PO-{}", Uuid::new_v4());
            book.orders.insert(
                order_id.clone(),
                PaperOrder {
                    view: ExchangeOrder {
                        order_id: order_id.clone(),
                        client_order_id: Some(request.client_order_id.clone()),
                        symbol: request.symbol.clone(),
                        side: request.side,
                        status: STATUS_OPEN.into(),
                        filled_quantity: Decimal::ZERO,
                        avg_fill_price: None,
                        limit_price: request.limit_price,
                        updated_at: now,
                    },
                    request: request.clone(),
                },
            );
            let fill = match fill_price {
                Some(price) => match self.execute(&mut book, &order_id, price, now) {
                    Ok(fill) => Some(fill),
                    Err(err) => {
                        book.orders.remove(&order_id);
                        return Err(err);
                    }
                },
                None => None,
            };
            book.by_client_id
                .insert(request.client_order_id.clone(), order_id.clone());
            let status = if fill.is_some() { STATUS_CLOSED } else { STATUS_OPEN };
            (
                OrderAck {
                    order_id,
                    status: status.into(),
                },
                fill,
            )
        };
        info!(
            order_id = %ack.order_id,
            client_order_id = %request.client_order_id,
            symbol = %request.symbol,
            status = %ack.status,
            "paper order accepted"
        );
        if let Some(fill) = &fill {
            self.publish_fill(fill);
            self.publish_status(&ack.order_id, STATUS_CLOSED, now);
        }
        Ok(ack)
    }

    async fn get_order(&self, order_id: &str) -> BrokerResult<ExchangeOrder> {
        self.book
            .lock()
            .orders
            .get(order_id)
            .map(|order| order.view.clone())
            .ok_or_else(|| BrokerError::NotFound(format!("unknown order {order_id}")))
    }

    async fn order_fills(&self, order_id: &str) -> BrokerResult<Vec<Fill>> {
        let book = self.book.lock();
        if !book.orders.contains_key(order_id) {
            return Err(BrokerError::NotFound(format!("unknown order {order_id}")));
        }
        Ok(book.fills.get(order_id).cloned().unwrap_or_default())
    }

    async fn cancel_order(&self, order_id: &str) -> BrokerResult<()> {
        let now = Utc::now();
        {
            let mut book = self.book.lock();
            let order = book
                .orders
                .get_mut(order_id)
                .ok_or_else(|| BrokerError::NotFound(format!("unknown order {order_id}")))?;
            if order.view.status != STATUS_OPEN {
                return Err(BrokerError::InvalidRequest(format!(
                    "order {order_id} is {}",
                    order.view.status
                )));
            }
            order.view.status = STATUS_CANCELED.into();
            order.view.updated_at = now;
        }
        self.publish_status(order_id, STATUS_CANCELED, now);
        Ok(())
    }

    async fn best_bid_ask(&self, symbol: &str) -> BrokerResult<Option<BidAsk>> {
        Ok(self.quote(symbol))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_broker::EventKind;
    use rust_decimal_macros::dec;

    fn exchange() -> PaperExchange {
        let exchange = PaperExchange::new(PaperConfig {
            fee_bps: dec!(10),
            slippage_bps: dec!(10),
            initial_cash: dec!(1000),
            ..PaperConfig::default()
        });
        exchange.update_quote("XBTUSD", dec!(99), dec!(100));
        exchange
    }

    fn request(side: Side, order_type: OrderType, limit: Option<Price>) -> PlaceOrderRequest {
        PlaceOrderRequest {
            symbol: "XBTUSD".into(),
            side,
            order_type,
            client_order_id: format!("i-{}-r0", side.as_str()),
            quantity: None,
            notional: Some(dec!(500)),
            limit_price: limit,
        }
    }

    #[tokio::test]
    async fn market_buy_fills_at_slipped_ask_with_fee() -> BrokerResult<()> {
        let exchange = exchange();
        let ack = exchange
            .place_order(request(Side::Buy, OrderType::Market, None))
            .await?;
        assert_eq!(ack.status, STATUS_CLOSED);
        let fills = exchange.order_fills(&ack.order_id).await?;
        assert_eq!(fills.len(), 1);
        let fill = &fills[0];
        assert_eq!(fill.price, dec!(100.1));
        assert_eq!(fill.quantity, (dec!(500) / dec!(100.1)).round_dp(8));
        assert_eq!(fill.fee, (fill.quantity * fill.price * dec!(0.001)).round_dp(8));
        assert_eq!(exchange.cash(), dec!(1000) - fill.quantity * fill.price - fill.fee);
        Ok(())
    }

    #[tokio::test]
    async fn resting_limit_fills_when_the_quote_crosses() -> BrokerResult<()> {
        let exchange = exchange();
        let ack = exchange
            .place_order(request(Side::Buy, OrderType::Limit, Some(dec!(98))))
            .await?;
        assert_eq!(ack.status, STATUS_OPEN);
        assert!(exchange.update_quote("XBTUSD", dec!(98.5), dec!(99)).is_empty());
        let fills = exchange.update_quote("XBTUSD", dec!(97), dec!(97.5));
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].price, dec!(98));
        let order = exchange.get_order(&ack.order_id).await?;
        assert_eq!(order.status, STATUS_CLOSED);
        assert!(exchange.cancel_order(&ack.order_id).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn oversized_orders_are_refused_and_leave_no_trace() {
        let exchange = exchange();
        let mut big = request(Side::Buy, OrderType::Market, None);
        big.notional = Some(dec!(5000));
        let err = exchange.place_order(big).await.unwrap_err();
        assert!(matches!(err, BrokerError::InsufficientFunds(_)));
        let sell = request(Side::Sell, OrderType::Market, None);
        assert!(exchange.place_order(sell).await.is_err());
        assert_eq!(exchange.cash(), dec!(1000));
        assert!(exchange.holdings().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn client_ids_are_idempotent_and_fills_reach_the_bus() -> BrokerResult<()> {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(EventKind::Execution, move |event| {
            if let StreamEvent::Execution(message) = event {
                sink.lock().push(message.exec_type.clone());
            }
        });
        let exchange = exchange().with_bus(bus);
        let first = exchange
            .place_order(request(Side::Buy, OrderType::Market, None))
            .await?;
        let again = exchange
            .place_order(request(Side::Buy, OrderType::Market, None))
            .await?;
        assert_eq!(first.order_id, again.order_id);
        assert_eq!(*seen.lock(), vec!["trade".to_string(), "status".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn seeded_holdings_can_be_sold() -> BrokerResult<()> {
        let exchange = exchange();
        exchange.seed(dec!(0), [("XBTUSD".to_string(), dec!(2))]);
        let mut sell = request(Side::Sell, OrderType::Limit, Some(dec!(99)));
        sell.notional = None;
        sell.quantity = Some(dec!(1.5));
        let ack = exchange.place_order(sell).await?;
        assert_eq!(ack.status, STATUS_CLOSED);
        let holdings = exchange.holdings().await?;
        assert_eq!(holdings[0].quantity, dec!(0.5));
        assert_eq!(exchange.cash(), dec!(148.5) - dec!(0.1485));
        Ok(())
    }
}
