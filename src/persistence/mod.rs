// Persistence collaborators consumed by the trading core
pub mod memory;
pub mod cache;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    ApiCredentials, Position, TradeRecord, TradeResult, TradingSignal, UserAccount, UserId,
    UserSettingsUpdate,
};

pub use memory::MemoryStore;
pub use cache::RedisMarketCache;

#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Users that are active (trading paused or not)
    async fn active_users(&self) -> Result<Vec<UserAccount>>;

    async fn get_user(&self, user_id: UserId) -> Result<Option<UserAccount>>;

    async fn update_user_settings(&self, user_id: UserId, update: &UserSettingsUpdate) -> Result<()>;
}

#[async_trait]
pub trait PositionRepository: Send + Sync {
    async fn open_positions(&self, user_id: UserId) -> Result<Vec<Position>>;

    /// Every open position across all users
    async fn active_positions(&self) -> Result<Vec<Position>>;

    /// Open positions that stand to lose more than `threshold_percent` of
    /// entry before their stop triggers; positions without a stop included
    async fn positions_at_risk(&self, threshold_percent: f64) -> Result<Vec<Position>>;

    async fn open_position(&self, position: &Position) -> Result<()>;

    /// Reduce or close a position; returns the realized profit
    async fn record_position_close(
        &self,
        position_id: Uuid,
        exit_price: f64,
        quantity: f64,
    ) -> Result<f64>;
}

#[async_trait]
pub trait TradeRepository: Send + Sync {
    async fn record_trade(
        &self,
        user_id: UserId,
        result: &TradeResult,
        signal: &TradingSignal,
        profit: Option<f64>,
    ) -> Result<()>;

    async fn trades_since(&self, since: DateTime<Utc>) -> Result<Vec<TradeRecord>>;
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn credentials(&self, user_id: UserId) -> Result<Option<ApiCredentials>>;
}

/// Connection-level health hooks used by the supervisor
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Trivial round trip
    async fn ping(&self) -> Result<()>;

    /// Drop and recreate the underlying connection pool
    async fn reconnect(&self) -> Result<()>;
}

/// The full persistence surface, implemented by `MemoryStore` and `PostgresStore`
pub trait Store:
    UserRepository + PositionRepository + TradeRepository + CredentialStore + HealthCheck
{
}

impl<T> Store for T where
    T: UserRepository + PositionRepository + TradeRepository + CredentialStore + HealthCheck
{
}

pub type SharedStore = Arc<dyn Store>;

/// Stop distance in percent of entry; `None` without a stop
pub fn stop_distance_percent(position: &Position) -> Option<f64> {
    let stop = position.stop_loss?;
    if position.entry_price <= 0.0 {
        return None;
    }
    Some((position.entry_price - stop).abs() / position.entry_price * 100.0)
}

/// Shared predicate for `positions_at_risk`
pub fn is_at_risk(position: &Position, threshold_percent: f64) -> bool {
    match stop_distance_percent(position) {
        Some(distance) => distance > threshold_percent,
        None => true,
    }
}
