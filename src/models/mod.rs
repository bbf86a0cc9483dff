use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::TradeError;

pub type UserId = i64;

/// User risk appetite; drives strategy allocation and every risk table lookup
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    #[default]
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = TradeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            other => Err(TradeError::InvalidInput(format!("unknown risk level: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = TradeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            other => Err(TradeError::InvalidInput(format!("unknown side: {}", other))),
        }
    }
}

/// A trading account as seen by the loop and the risk gate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: UserId,
    pub username: String,
    pub risk_level: RiskLevel,
    /// Venue the user trades on (e.g. "paper")
    pub exchange: String,
    pub active: bool,
    pub trading_paused: bool,
    /// Free quote balance used for sizing
    pub balance: f64,
    /// Total account value used for drawdown and allocation checks
    pub equity: f64,
    /// Per-user cap override; `None` falls back to the configured default
    pub max_position_size_percent: Option<f64>,
    pub risk_reduction_until: Option<DateTime<Utc>>,
}

impl UserAccount {
    pub fn new(id: UserId, username: impl Into<String>, risk_level: RiskLevel, balance: f64) -> Self {
        Self {
            id,
            username: username.into(),
            risk_level,
            exchange: "paper".to_string(),
            active: true,
            trading_paused: false,
            balance,
            equity: balance,
            max_position_size_percent: None,
            risk_reduction_until: None,
        }
    }

    pub fn apply(&mut self, update: &UserSettingsUpdate) {
        if let Some(balance) = update.balance {
            self.balance = balance;
        }
        if let Some(equity) = update.equity {
            self.equity = equity;
        }
        if let Some(pct) = update.max_position_size_percent {
            self.max_position_size_percent = Some(pct);
        }
        if let Some(until) = update.risk_reduction_until {
            self.risk_reduction_until = Some(until);
        }
        if let Some(paused) = update.trading_paused {
            self.trading_paused = paused;
        }
    }
}

/// Partial update of user settings; `None` fields are left alone
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserSettingsUpdate {
    pub balance: Option<f64>,
    pub equity: Option<f64>,
    pub max_position_size_percent: Option<f64>,
    pub risk_reduction_until: Option<DateTime<Utc>>,
    pub trading_paused: Option<bool>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ApiCredentials {
    pub api_key: String,
    pub api_secret: String,
}

impl fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_key", &"***")
            .field("api_secret", &"***")
            .finish()
    }
}

/// Order intent produced by a strategy and resized by the risk gate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradingSignal {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    /// Limit/reference price; filled from the ticker when absent
    pub price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub strategy: String,
    pub signal_type: String,
    pub timeframe: String,
}

impl TradingSignal {
    pub fn market(symbol: impl Into<String>, side: Side, quantity: f64, strategy: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            quantity,
            price: None,
            stop_loss: None,
            take_profit: None,
            strategy: strategy.into(),
            signal_type: "market".to_string(),
            timeframe: "1h".to_string(),
        }
    }

    pub fn with_price(mut self, price: f64) -> Self {
        self.price = Some(price);
        self
    }

    pub fn with_stop_loss(mut self, stop_loss: f64) -> Self {
        self.stop_loss = Some(stop_loss);
        self
    }

    pub fn with_take_profit(mut self, take_profit: f64) -> Self {
        self.take_profit = Some(take_profit);
        self
    }

    pub fn notional(&self) -> f64 {
        self.price.unwrap_or(0.0) * self.quantity
    }
}

/// Outcome of an order submission
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradeResult {
    pub trade_id: String,
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub message: Option<String>,
}

impl TradeResult {
    pub fn failed(symbol: impl Into<String>, side: Side, message: impl Into<String>) -> Self {
        Self {
            trade_id: String::new(),
            symbol: symbol.into(),
            side,
            price: 0.0,
            quantity: 0.0,
            timestamp: Utc::now(),
            success: false,
            message: Some(message.into()),
        }
    }
}

/// A recorded fill, as returned by the trade repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub user_id: UserId,
    pub trade_id: String,
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
    pub strategy: String,
    /// Realized profit for closing fills; `None` for entries
    pub profit: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// An open position held by a user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub id: Uuid,
    pub user_id: UserId,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub quantity: f64,
    pub strategy: String,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    pub fn notional(&self) -> f64 {
        self.entry_price * self.quantity
    }

    /// Unrealized loss percent at `price`; positive means losing
    pub fn loss_percent(&self, price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        let change = (price - self.entry_price) / self.entry_price * 100.0;
        match self.side {
            Side::Buy => -change,
            Side::Sell => change,
        }
    }

    pub fn pnl(&self, exit_price: f64) -> f64 {
        let diff = match self.side {
            Side::Buy => exit_price - self.entry_price,
            Side::Sell => self.entry_price - exit_price,
        };
        diff * self.quantity
    }
}

/// OHLCV candlestick data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ticker {
    pub symbol: String,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BookLevel {
    pub price: f64,
    pub quantity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OrderBook {
    pub symbol: String,
    /// Best bid first
    pub bids: Vec<BookLevel>,
    /// Best ask first
    pub asks: Vec<BookLevel>,
}

impl OrderBook {
    pub fn mid_price(&self) -> Option<f64> {
        let bid = self.bids.first()?.price;
        let ask = self.asks.first()?.price;
        Some((bid + ask) / 2.0)
    }

    /// Notional resting within `band_percent` of mid on both sides
    pub fn liquidity_within(&self, band_percent: f64) -> f64 {
        let Some(mid) = self.mid_price() else {
            return 0.0;
        };
        let lower = mid * (1.0 - band_percent / 100.0);
        let upper = mid * (1.0 + band_percent / 100.0);

        let bid_notional: f64 = self
            .bids
            .iter()
            .filter(|l| l.price >= lower)
            .map(|l| l.price * l.quantity)
            .sum();
        let ask_notional: f64 = self
            .asks
            .iter()
            .filter(|l| l.price <= upper)
            .map(|l| l.price * l.quantity)
            .sum();

        bid_notional + ask_notional
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Balance {
    pub asset: String,
    pub free: f64,
    pub locked: f64,
}

impl Balance {
    pub fn total(&self) -> f64 {
        self.free + self.locked
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Filled,
    Cancelled,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub price: Option<f64>,
    pub quantity: f64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

/// Shared market snapshot refreshed by the trading loop
#[derive(Debug, Clone, Default)]
pub struct MarketData {
    pub tickers: HashMap<String, Ticker>,
    pub candles: HashMap<String, Vec<Candle>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl MarketData {
    pub fn closes(&self, symbol: &str) -> Vec<f64> {
        self.candles
            .get(symbol)
            .map(|c| c.iter().map(|c| c.close).collect())
            .unwrap_or_default()
    }

    /// Last known price: ticker first, then the latest close
    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.tickers
            .get(symbol)
            .map(|t| t.price)
            .or_else(|| self.candles.get(symbol).and_then(|c| c.last()).map(|c| c.close))
    }
}

/// Quote asset of a `BASE/QUOTE` symbol; defaults to USDT
pub fn quote_asset(symbol: &str) -> &str {
    symbol.split('/').nth(1).unwrap_or("USDT")
}

pub fn base_asset(symbol: &str) -> &str {
    symbol.split('/').next().unwrap_or(symbol)
}
