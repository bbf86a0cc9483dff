// Exchange capability: account access, market data, order routing
pub mod paper;
pub mod public_client;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::models::{
    ApiCredentials, Balance, Candle, Order, OrderBook, Ticker, TradeResult, TradingSignal,
    UserAccount,
};

pub use paper::{PaperExchange, PaperExchangeFactory, StaticMarketFeed};
pub use public_client::PublicMarketClient;

/// A bound connection to a venue for one user
#[async_trait]
pub trait Exchange: Send + Sync {
    fn name(&self) -> &str;

    async fn initialize(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    async fn ping(&self) -> Result<()>;

    async fn get_balance(&self, asset: &str) -> Result<Balance>;

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker>;

    async fn get_orderbook(&self, symbol: &str, depth: usize) -> Result<OrderBook>;

    async fn get_klines(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Candle>>;

    /// Submit the order described by `signal`; a venue-side refusal comes back
    /// as `TradeResult { success: false, .. }`, not as `Err`
    async fn execute_trade(&self, signal: &TradingSignal) -> Result<TradeResult>;

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<bool>;

    async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<Order>>;

    async fn get_order_status(&self, order_id: &str, symbol: &str) -> Result<Order>;
}

/// Unauthenticated market data shared by all users
#[async_trait]
pub trait MarketFeed: Send + Sync {
    async fn ping(&self) -> Result<()>;

    async fn ticker(&self, symbol: &str) -> Result<Ticker>;

    async fn klines(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Candle>>;

    async fn orderbook(&self, symbol: &str, depth: usize) -> Result<OrderBook>;

    /// Drop and rebuild any cached client state
    fn reset(&self) {}
}

/// Builds per-user exchange bindings
pub trait ExchangeFactory: Send + Sync {
    fn create(
        &self,
        user: &UserAccount,
        credentials: Option<&ApiCredentials>,
    ) -> Result<Arc<dyn Exchange>>;
}
