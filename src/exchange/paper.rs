use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;

use super::{Exchange, ExchangeFactory, MarketFeed};
use crate::error::{Result, TradeError};
use crate::models::{
    base_asset, quote_asset, ApiCredentials, Balance, BookLevel, Candle, Order, OrderBook,
    OrderStatus, Side, Ticker, TradeResult, TradingSignal, UserAccount,
};

/// Market feed backed by an in-memory price table
///
/// Candles are flat at the current price and the order book is a synthetic
/// ladder, so risk checks pass on volatility and liquidity unless a test
/// overrides them.
pub struct StaticMarketFeed {
    prices: RwLock<HashMap<String, f64>>,
    candles: RwLock<HashMap<String, Vec<Candle>>>,
    books: RwLock<HashMap<String, OrderBook>>,
    reachable: AtomicBool,
    /// Notional placed on each synthetic book level
    level_notional: f64,
}

impl Default for StaticMarketFeed {
    fn default() -> Self {
        Self::new(&[])
    }
}

impl StaticMarketFeed {
    pub fn new(prices: &[(&str, f64)]) -> Self {
        Self {
            prices: RwLock::new(prices.iter().map(|(s, p)| (s.to_string(), *p)).collect()),
            candles: RwLock::new(HashMap::new()),
            books: RwLock::new(HashMap::new()),
            reachable: AtomicBool::new(true),
            level_notional: 1_000_000.0,
        }
    }

    /// Seed prices for the symbols traded by default
    pub fn with_default_prices() -> Self {
        Self::new(&[("BTC/USDT", 65_000.0), ("ETH/USDT", 3_200.0), ("SOL/USDT", 150.0)])
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        write(&self.prices).insert(symbol.to_string(), price);
    }

    pub fn set_candles(&self, symbol: &str, candles: Vec<Candle>) {
        write(&self.candles).insert(symbol.to_string(), candles);
    }

    pub fn set_orderbook(&self, symbol: &str, book: OrderBook) {
        write(&self.books).insert(symbol.to_string(), book);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    fn price(&self, symbol: &str) -> Result<f64> {
        read(&self.prices)
            .get(symbol)
            .copied()
            .ok_or_else(|| TradeError::NotFound(format!("no price for {}", symbol)))
    }

    fn check_reachable(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TradeError::Exchange("market feed unreachable".to_string()))
        }
    }
}

#[async_trait]
impl MarketFeed for StaticMarketFeed {
    async fn ping(&self) -> Result<()> {
        self.check_reachable()
    }

    async fn ticker(&self, symbol: &str) -> Result<Ticker> {
        self.check_reachable()?;
        Ok(Ticker {
            symbol: symbol.to_string(),
            price: self.price(symbol)?,
            timestamp: Utc::now(),
        })
    }

    async fn klines(&self, symbol: &str, _interval: &str, limit: usize) -> Result<Vec<Candle>> {
        self.check_reachable()?;
        if let Some(candles) = read(&self.candles).get(symbol) {
            let skip = candles.len().saturating_sub(limit);
            return Ok(candles[skip..].to_vec());
        }

        let price = self.price(symbol)?;
        let now = Utc::now();
        Ok((0..limit)
            .map(|i| Candle {
                symbol: symbol.to_string(),
                timestamp: now - ChronoDuration::hours((limit - i) as i64),
                open: price,
                high: price,
                low: price,
                close: price,
                volume: 0.0,
            })
            .collect())
    }

    async fn orderbook(&self, symbol: &str, depth: usize) -> Result<OrderBook> {
        self.check_reachable()?;
        if let Some(book) = read(&self.books).get(symbol) {
            return Ok(book.clone());
        }

        let price = self.price(symbol)?;
        let quantity = self.level_notional / price;
        let level = |i: usize, sign: f64| BookLevel {
            price: price * (1.0 + sign * 0.0005 * (i + 1) as f64),
            quantity,
        };

        Ok(OrderBook {
            symbol: symbol.to_string(),
            bids: (0..depth).map(|i| level(i, -1.0)).collect(),
            asks: (0..depth).map(|i| level(i, 1.0)).collect(),
        })
    }
}

/// Simulated venue: fills against the feed's last price with random slippage
pub struct PaperExchange {
    feed: Arc<dyn MarketFeed>,
    balances: Mutex<HashMap<String, f64>>,
    orders: Mutex<HashMap<String, Order>>,
    slippage_bps: f64,
    closed: AtomicBool,
}

impl PaperExchange {
    pub fn new(feed: Arc<dyn MarketFeed>, quote: &str, starting_balance: f64, slippage_bps: f64) -> Self {
        let mut balances = HashMap::new();
        balances.insert(quote.to_string(), starting_balance);

        Self {
            feed,
            balances: Mutex::new(balances),
            orders: Mutex::new(HashMap::new()),
            slippage_bps,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TradeError::Exchange("paper binding is closed".to_string()))
        } else {
            Ok(())
        }
    }

    fn slipped(&self, price: f64, side: Side) -> f64 {
        if self.slippage_bps <= 0.0 {
            return price;
        }
        let bps = rand::thread_rng().gen_range(0.0..=self.slippage_bps);
        match side {
            Side::Buy => price * (1.0 + bps / 10_000.0),
            Side::Sell => price * (1.0 - bps / 10_000.0),
        }
    }

    /// Move balances for a fill; buys need quote cover, sells may go short
    fn settle(&self, symbol: &str, side: Side, price: f64, quantity: f64) -> Result<()> {
        let mut balances = lock(&self.balances);
        let cost = price * quantity;
        let quote = quote_asset(symbol).to_string();
        let base = base_asset(symbol).to_string();

        match side {
            Side::Buy => {
                let free = balances.get(&quote).copied().unwrap_or(0.0);
                if free + 1e-9 < cost {
                    return Err(TradeError::Rejected(format!(
                        "insufficient {}: need {:.2}, have {:.2}",
                        quote, cost, free
                    )));
                }
                *balances.entry(quote).or_insert(0.0) -= cost;
                *balances.entry(base).or_insert(0.0) += quantity;
            }
            Side::Sell => {
                *balances.entry(quote).or_insert(0.0) += cost;
                *balances.entry(base).or_insert(0.0) -= quantity;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    fn name(&self) -> &str {
        "paper"
    }

    async fn initialize(&self) -> Result<()> {
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.feed.ping().await
    }

    async fn get_balance(&self, asset: &str) -> Result<Balance> {
        self.ensure_open()?;
        let free = lock(&self.balances).get(asset).copied().unwrap_or(0.0);
        Ok(Balance {
            asset: asset.to_string(),
            free,
            locked: 0.0,
        })
    }

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker> {
        self.feed.ticker(symbol).await
    }

    async fn get_orderbook(&self, symbol: &str, depth: usize) -> Result<OrderBook> {
        self.feed.orderbook(symbol, depth).await
    }

    async fn get_klines(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Candle>> {
        self.feed.klines(symbol, interval, limit).await
    }

    async fn execute_trade(&self, signal: &TradingSignal) -> Result<TradeResult> {
        self.ensure_open()?;

        if signal.quantity <= 0.0 {
            return Ok(TradeResult::failed(&signal.symbol, signal.side, "quantity must be positive"));
        }

        let order_id = Uuid::new_v4().to_string();

        if signal.signal_type == "limit" {
            let Some(limit) = signal.price else {
                return Ok(TradeResult::failed(&signal.symbol, signal.side, "limit order without price"));
            };
            lock(&self.orders).insert(
                order_id.clone(),
                Order {
                    order_id: order_id.clone(),
                    symbol: signal.symbol.clone(),
                    side: signal.side,
                    price: Some(limit),
                    quantity: signal.quantity,
                    status: OrderStatus::Open,
                    created_at: Utc::now(),
                },
            );
            return Ok(TradeResult {
                trade_id: order_id,
                symbol: signal.symbol.clone(),
                side: signal.side,
                price: limit,
                quantity: 0.0,
                timestamp: Utc::now(),
                success: true,
                message: Some("limit order open".to_string()),
            });
        }

        let market = self.feed.ticker(&signal.symbol).await?.price;
        let fill_price = self.slipped(market, signal.side);

        if let Err(e) = self.settle(&signal.symbol, signal.side, fill_price, signal.quantity) {
            return Ok(TradeResult::failed(&signal.symbol, signal.side, e.to_string()));
        }

        lock(&self.orders).insert(
            order_id.clone(),
            Order {
                order_id: order_id.clone(),
                symbol: signal.symbol.clone(),
                side: signal.side,
                price: Some(fill_price),
                quantity: signal.quantity,
                status: OrderStatus::Filled,
                created_at: Utc::now(),
            },
        );

        tracing::debug!(
            "paper fill {} {} {} @ {:.4}",
            signal.side,
            signal.quantity,
            signal.symbol,
            fill_price
        );

        Ok(TradeResult {
            trade_id: order_id,
            symbol: signal.symbol.clone(),
            side: signal.side,
            price: fill_price,
            quantity: signal.quantity,
            timestamp: Utc::now(),
            success: true,
            message: None,
        })
    }

    async fn cancel_order(&self, order_id: &str, _symbol: &str) -> Result<bool> {
        self.ensure_open()?;
        let mut orders = lock(&self.orders);
        match orders.get_mut(order_id) {
            Some(order) if order.status == OrderStatus::Open => {
                order.status = OrderStatus::Cancelled;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(TradeError::NotFound(format!("order {}", order_id))),
        }
    }

    async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<Order>> {
        self.ensure_open()?;
        Ok(lock(&self.orders)
            .values()
            .filter(|o| o.status == OrderStatus::Open)
            .filter(|o| symbol.map_or(true, |s| o.symbol == s))
            .cloned()
            .collect())
    }

    async fn get_order_status(&self, order_id: &str, symbol: &str) -> Result<Order> {
        self.ensure_open()?;
        let order = lock(&self.orders)
            .get(order_id)
            .cloned()
            .ok_or_else(|| TradeError::NotFound(format!("order {}", order_id)))?;

        if order.status != OrderStatus::Open {
            return Ok(order);
        }

        // Open limit orders fill once the market trades through them
        let market = self.feed.ticker(symbol).await?.price;
        let limit = order.price.unwrap_or(market);
        let crossed = match order.side {
            Side::Buy => market <= limit,
            Side::Sell => market >= limit,
        };
        if !crossed {
            return Ok(order);
        }

        let status = match self.settle(&order.symbol, order.side, limit, order.quantity) {
            Ok(()) => OrderStatus::Filled,
            Err(_) => OrderStatus::Rejected,
        };

        let mut orders = lock(&self.orders);
        let entry = orders
            .get_mut(order_id)
            .ok_or_else(|| TradeError::NotFound(format!("order {}", order_id)))?;
        entry.status = status;
        Ok(entry.clone())
    }
}

/// Creates a fresh paper binding per user, funded from the user's balance
pub struct PaperExchangeFactory {
    feed: Arc<dyn MarketFeed>,
    slippage_bps: f64,
    default_balance: f64,
}

impl PaperExchangeFactory {
    pub fn new(feed: Arc<dyn MarketFeed>, slippage_bps: f64, default_balance: f64) -> Self {
        Self {
            feed,
            slippage_bps,
            default_balance,
        }
    }
}

impl ExchangeFactory for PaperExchangeFactory {
    fn create(
        &self,
        user: &UserAccount,
        _credentials: Option<&ApiCredentials>,
    ) -> Result<Arc<dyn Exchange>> {
        let balance = if user.balance > 0.0 {
            user.balance
        } else {
            self.default_balance
        };
        Ok(Arc::new(PaperExchange::new(
            self.feed.clone(),
            "USDT",
            balance,
            self.slippage_bps,
        )))
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

fn read<T>(l: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|p| p.into_inner())
}

fn write<T>(l: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|p| p.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(balance: f64) -> PaperExchange {
        let feed = Arc::new(StaticMarketFeed::new(&[("ETH/USDT", 100.0)]));
        PaperExchange::new(feed, "USDT", balance, 0.0)
    }

    #[tokio::test]
    async fn test_market_buy_moves_balances() {
        let ex = exchange(1_000.0);
        let signal = TradingSignal::market("ETH/USDT", Side::Buy, 2.0, "test");

        let result = ex.execute_trade(&signal).await.unwrap();
        assert!(result.success);
        assert_eq!(result.price, 100.0);

        assert_eq!(ex.get_balance("USDT").await.unwrap().free, 800.0);
        assert_eq!(ex.get_balance("ETH").await.unwrap().free, 2.0);
    }

    #[tokio::test]
    async fn test_insufficient_balance_is_unsuccessful_result() {
        let ex = exchange(50.0);
        let signal = TradingSignal::market("ETH/USDT", Side::Buy, 2.0, "test");

        let result = ex.execute_trade(&signal).await.unwrap();
        assert!(!result.success);
        assert!(result.message.unwrap().contains("insufficient"));
    }

    #[tokio::test]
    async fn test_limit_order_lifecycle() {
        let feed = Arc::new(StaticMarketFeed::new(&[("ETH/USDT", 100.0)]));
        let ex = PaperExchange::new(feed.clone(), "USDT", 1_000.0, 0.0);

        let mut signal = TradingSignal::market("ETH/USDT", Side::Buy, 1.0, "test").with_price(90.0);
        signal.signal_type = "limit".to_string();
        let result = ex.execute_trade(&signal).await.unwrap();

        let open = ex.get_open_orders(Some("ETH/USDT")).await.unwrap();
        assert_eq!(open.len(), 1);
        let status = ex.get_order_status(&result.trade_id, "ETH/USDT").await.unwrap();
        assert_eq!(status.status, OrderStatus::Open);

        feed.set_price("ETH/USDT", 89.0);
        let status = ex.get_order_status(&result.trade_id, "ETH/USDT").await.unwrap();
        assert_eq!(status.status, OrderStatus::Filled);
        assert_eq!(ex.get_balance("USDT").await.unwrap().free, 910.0);
        assert!(!ex.cancel_order(&result.trade_id, "ETH/USDT").await.unwrap());
    }

    #[tokio::test]
    async fn test_closed_binding_refuses_orders() {
        let ex = exchange(1_000.0);
        ex.close().await.unwrap();
        let signal = TradingSignal::market("ETH/USDT", Side::Buy, 1.0, "test");
        assert!(ex.execute_trade(&signal).await.is_err());

        ex.initialize().await.unwrap();
        assert!(ex.execute_trade(&signal).await.is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_feed() {
        let feed = Arc::new(StaticMarketFeed::with_default_prices());
        feed.set_reachable(false);
        assert!(feed.ping().await.is_err());
        feed.set_reachable(true);
        assert!(feed.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_synthetic_book_is_deep() {
        let feed = StaticMarketFeed::with_default_prices();
        let book = feed.orderbook("BTC/USDT", 20).await.unwrap();
        assert_eq!(book.bids.len(), 20);
        assert!(book.liquidity_within(1.0) > 1_000_000.0);
    }
}
