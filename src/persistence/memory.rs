use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    is_at_risk, CredentialStore, HealthCheck, PositionRepository, TradeRepository, UserRepository,
};
use crate::error::{Result, TradeError};
use crate::models::{
    ApiCredentials, Position, TradeRecord, TradeResult, TradingSignal, UserAccount, UserId,
    UserSettingsUpdate,
};

/// In-process store for paper trading and tests
///
/// `set_available(false)` simulates an outage: every call fails until it is
/// flipped back.
#[derive(Default)]
pub struct MemoryStore {
    users: RwLock<HashMap<UserId, UserAccount>>,
    positions: RwLock<HashMap<Uuid, Position>>,
    trades: RwLock<Vec<TradeRecord>>,
    credentials: RwLock<HashMap<UserId, ApiCredentials>>,
    unavailable: AtomicBool,
    reconnects: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_user(&self, user: UserAccount) {
        self.users.write().await.insert(user.id, user);
    }

    pub async fn set_credentials(&self, user_id: UserId, credentials: ApiCredentials) {
        self.credentials.write().await.insert(user_id, credentials);
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn reconnect_count(&self) -> u32 {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub async fn trade_count(&self) -> usize {
        self.trades.read().await.len()
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(TradeError::Other(anyhow::anyhow!("memory store unavailable")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl UserRepository for MemoryStore {
    async fn active_users(&self) -> Result<Vec<UserAccount>> {
        self.check()?;
        let mut users: Vec<UserAccount> = self
            .users
            .read()
            .await
            .values()
            .filter(|u| u.active)
            .cloned()
            .collect();
        users.sort_by_key(|u| u.id);
        Ok(users)
    }

    async fn get_user(&self, user_id: UserId) -> Result<Option<UserAccount>> {
        self.check()?;
        Ok(self.users.read().await.get(&user_id).cloned())
    }

    async fn update_user_settings(&self, user_id: UserId, update: &UserSettingsUpdate) -> Result<()> {
        self.check()?;
        let mut users = self.users.write().await;
        let user = users
            .get_mut(&user_id)
            .ok_or_else(|| TradeError::NotFound(format!("user {}", user_id)))?;
        user.apply(update);
        Ok(())
    }
}

#[async_trait]
impl PositionRepository for MemoryStore {
    async fn open_positions(&self, user_id: UserId) -> Result<Vec<Position>> {
        self.check()?;
        let mut positions: Vec<Position> = self
            .positions
            .read()
            .await
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        positions.sort_by_key(|p| p.opened_at);
        Ok(positions)
    }

    async fn active_positions(&self) -> Result<Vec<Position>> {
        self.check()?;
        let mut positions: Vec<Position> = self.positions.read().await.values().cloned().collect();
        positions.sort_by_key(|p| (p.user_id, p.opened_at));
        Ok(positions)
    }

    async fn positions_at_risk(&self, threshold_percent: f64) -> Result<Vec<Position>> {
        Ok(self
            .active_positions()
            .await?
            .into_iter()
            .filter(|p| is_at_risk(p, threshold_percent))
            .collect())
    }

    async fn open_position(&self, position: &Position) -> Result<()> {
        self.check()?;
        let mut positions = self.positions.write().await;

        // Adding to an existing same-side position averages the entry
        let existing = positions.values_mut().find(|p| {
            p.user_id == position.user_id && p.symbol == position.symbol && p.side == position.side
        });
        match existing {
            Some(p) => {
                let quantity = p.quantity + position.quantity;
                if quantity > 0.0 {
                    p.entry_price =
                        (p.notional() + position.notional()) / quantity;
                }
                p.quantity = quantity;
                p.stop_loss = position.stop_loss.or(p.stop_loss);
                p.take_profit = position.take_profit.or(p.take_profit);
            }
            None => {
                positions.insert(position.id, position.clone());
            }
        }
        Ok(())
    }

    async fn record_position_close(
        &self,
        position_id: Uuid,
        exit_price: f64,
        quantity: f64,
    ) -> Result<f64> {
        self.check()?;
        let mut positions = self.positions.write().await;
        let position = positions
            .get_mut(&position_id)
            .ok_or_else(|| TradeError::NotFound(format!("position {}", position_id)))?;

        let closed = quantity.min(position.quantity);
        let profit = Position {
            quantity: closed,
            ..position.clone()
        }
        .pnl(exit_price);

        position.quantity -= closed;
        if position.quantity <= 1e-12 {
            positions.remove(&position_id);
        }
        Ok(profit)
    }
}

#[async_trait]
impl TradeRepository for MemoryStore {
    async fn record_trade(
        &self,
        user_id: UserId,
        result: &TradeResult,
        signal: &TradingSignal,
        profit: Option<f64>,
    ) -> Result<()> {
        self.check()?;
        self.trades.write().await.push(TradeRecord {
            user_id,
            trade_id: result.trade_id.clone(),
            symbol: result.symbol.clone(),
            side: result.side,
            price: result.price,
            quantity: result.quantity,
            strategy: signal.strategy.clone(),
            profit,
            timestamp: result.timestamp,
        });
        Ok(())
    }

    async fn trades_since(&self, since: DateTime<Utc>) -> Result<Vec<TradeRecord>> {
        self.check()?;
        Ok(self
            .trades
            .read()
            .await
            .iter()
            .filter(|t| t.timestamp >= since)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn credentials(&self, user_id: UserId) -> Result<Option<ApiCredentials>> {
        self.check()?;
        Ok(self.credentials.read().await.get(&user_id).cloned())
    }
}

#[async_trait]
impl HealthCheck for MemoryStore {
    async fn ping(&self) -> Result<()> {
        self.check()
    }

    async fn reconnect(&self) -> Result<()> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        self.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RiskLevel, Side};

    fn position(user_id: UserId, symbol: &str, qty: f64, price: f64) -> Position {
        Position {
            id: Uuid::new_v4(),
            user_id,
            symbol: symbol.to_string(),
            side: Side::Buy,
            entry_price: price,
            quantity: qty,
            strategy: "test".to_string(),
            stop_loss: None,
            take_profit: None,
            opened_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_same_side_positions_merge() {
        let store = MemoryStore::new();
        store.open_position(&position(1, "ETH/USDT", 1.0, 100.0)).await.unwrap();
        store.open_position(&position(1, "ETH/USDT", 1.0, 200.0)).await.unwrap();

        let open = store.open_positions(1).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].quantity, 2.0);
        assert_eq!(open[0].entry_price, 150.0);
    }

    #[tokio::test]
    async fn test_partial_then_full_close() {
        let store = MemoryStore::new();
        let p = position(1, "ETH/USDT", 2.0, 100.0);
        store.open_position(&p).await.unwrap();

        let profit = store.record_position_close(p.id, 110.0, 1.0).await.unwrap();
        assert!((profit - 10.0).abs() < 1e-9);
        assert_eq!(store.open_positions(1).await.unwrap()[0].quantity, 1.0);

        store.record_position_close(p.id, 90.0, 5.0).await.unwrap();
        assert!(store.open_positions(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_positions_at_risk() {
        let store = MemoryStore::new();
        let tight = Position {
            stop_loss: Some(99.0),
            ..position(1, "BTC/USDT", 1.0, 100.0)
        };
        let wide = Position {
            stop_loss: Some(90.0),
            ..position(1, "ETH/USDT", 1.0, 100.0)
        };
        let naked = position(2, "SOL/USDT", 1.0, 100.0);
        for p in [&tight, &wide, &naked] {
            store.open_position(p).await.unwrap();
        }

        let at_risk = store.positions_at_risk(3.0).await.unwrap();
        let symbols: Vec<&str> = at_risk.iter().map(|p| p.symbol.as_str()).collect();
        assert_eq!(symbols.len(), 2);
        assert!(symbols.contains(&"ETH/USDT"));
        assert!(symbols.contains(&"SOL/USDT"));
    }

    #[tokio::test]
    async fn test_outage_and_settings() {
        let store = MemoryStore::new();
        store.add_user(UserAccount::new(7, "bob", RiskLevel::Low, 500.0)).await;

        store
            .update_user_settings(
                7,
                &UserSettingsUpdate {
                    max_position_size_percent: Some(3.75),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let user = store.get_user(7).await.unwrap().unwrap();
        assert_eq!(user.max_position_size_percent, Some(3.75));

        store.set_available(false);
        assert!(store.ping().await.is_err());
        assert!(store.active_users().await.is_err());
        assert!(store.reconnect().await.is_err());
        assert_eq!(store.reconnect_count(), 1);

        store.set_available(true);
        assert!(store.ping().await.is_ok());
    }
}
