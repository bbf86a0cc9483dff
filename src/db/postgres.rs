use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Row};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Result, TradeError};
use crate::models::{
    ApiCredentials, Position, Side, TradeRecord, TradeResult, TradingSignal, UserAccount, UserId,
    UserSettingsUpdate,
};
use crate::persistence::{
    is_at_risk, CredentialStore, HealthCheck, PositionRepository, TradeRepository, UserRepository,
};

/// Postgres-backed store
///
/// The pool sits behind a lock so the supervisor can drop and recreate it
/// without restarting the process. Tables are expected to exist.
pub struct PostgresStore {
    pool: RwLock<PgPool>,
    database_url: String,
    max_connections: u32,
}

impl PostgresStore {
    /// Connect to Postgres
    ///
    /// # Arguments
    /// * `database_url` - Postgres connection URL
    /// * `max_connections` - Pool size
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = connect(database_url, max_connections).await?;

        tracing::info!("Connected to Postgres");

        Ok(Self {
            pool: RwLock::new(pool),
            database_url: database_url.to_string(),
            max_connections,
        })
    }

    async fn pool(&self) -> PgPool {
        self.pool.read().await.clone()
    }
}

async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool> {
    Ok(PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(std::time::Duration::from_secs(5))
        .connect(database_url)
        .await?)
}

fn to_decimal(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or_default()
}

fn opt_decimal(value: Option<f64>) -> Option<Decimal> {
    value.and_then(Decimal::from_f64)
}

fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

fn user_from_row(row: &PgRow) -> Result<UserAccount> {
    let risk_level: String = row.try_get("risk_level")?;
    let max_pct: Option<Decimal> = row.try_get("max_position_size_percent")?;

    Ok(UserAccount {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        risk_level: risk_level.parse()?,
        exchange: row.try_get("exchange")?,
        active: row.try_get("is_active")?,
        trading_paused: row.try_get("trading_paused")?,
        balance: to_f64(row.try_get("balance")?),
        equity: to_f64(row.try_get("equity")?),
        max_position_size_percent: max_pct.map(to_f64),
        risk_reduction_until: row.try_get("risk_reduction_until")?,
    })
}

fn position_from_row(row: &PgRow) -> Result<Position> {
    let side: String = row.try_get("side")?;
    let stop_loss: Option<Decimal> = row.try_get("stop_loss")?;
    let take_profit: Option<Decimal> = row.try_get("take_profit")?;

    Ok(Position {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        symbol: row.try_get("symbol")?,
        side: side.parse()?,
        entry_price: to_f64(row.try_get("entry_price")?),
        quantity: to_f64(row.try_get("quantity")?),
        strategy: row.try_get("strategy")?,
        stop_loss: stop_loss.map(to_f64),
        take_profit: take_profit.map(to_f64),
        opened_at: row.try_get("opened_at")?,
    })
}

const USER_COLUMNS: &str = "id, username, risk_level, exchange, is_active, trading_paused, \
     balance, equity, max_position_size_percent, risk_reduction_until";

const POSITION_COLUMNS: &str = "id, user_id, symbol, side, entry_price, quantity, strategy, \
     stop_loss, take_profit, opened_at";

#[async_trait]
impl UserRepository for PostgresStore {
    async fn active_users(&self) -> Result<Vec<UserAccount>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM users WHERE is_active = TRUE ORDER BY id",
            USER_COLUMNS
        ))
        .fetch_all(&self.pool().await)
        .await?;

        rows.iter().map(user_from_row).collect()
    }

    async fn get_user(&self, user_id: UserId) -> Result<Option<UserAccount>> {
        let row = sqlx::query(&format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS))
            .bind(user_id)
            .fetch_optional(&self.pool().await)
            .await?;

        row.as_ref().map(user_from_row).transpose()
    }

    async fn update_user_settings(&self, user_id: UserId, update: &UserSettingsUpdate) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE users SET
                balance = COALESCE($2, balance),
                equity = COALESCE($3, equity),
                max_position_size_percent = COALESCE($4, max_position_size_percent),
                risk_reduction_until = COALESCE($5, risk_reduction_until),
                trading_paused = COALESCE($6, trading_paused),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(opt_decimal(update.balance))
        .bind(opt_decimal(update.equity))
        .bind(opt_decimal(update.max_position_size_percent))
        .bind(update.risk_reduction_until)
        .bind(update.trading_paused)
        .execute(&self.pool().await)
        .await?;

        if result.rows_affected() == 0 {
            return Err(TradeError::NotFound(format!("user {}", user_id)));
        }
        Ok(())
    }
}

#[async_trait]
impl PositionRepository for PostgresStore {
    async fn open_positions(&self, user_id: UserId) -> Result<Vec<Position>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM positions WHERE user_id = $1 AND status = 'open' ORDER BY opened_at",
            POSITION_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool().await)
        .await?;

        rows.iter().map(position_from_row).collect()
    }

    async fn active_positions(&self) -> Result<Vec<Position>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM positions WHERE status = 'open' ORDER BY user_id, opened_at",
            POSITION_COLUMNS
        ))
        .fetch_all(&self.pool().await)
        .await?;

        rows.iter().map(position_from_row).collect()
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
        let pool = self.pool().await;
        let mut tx = pool.begin().await?;

        let existing = sqlx::query(&format!(
            "SELECT {} FROM positions \
             WHERE user_id = $1 AND symbol = $2 AND side = $3 AND status = 'open' \
             FOR UPDATE",
            POSITION_COLUMNS
        ))
        .bind(position.user_id)
        .bind(&position.symbol)
        .bind(position.side.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        match existing.as_ref().map(position_from_row).transpose()? {
            Some(current) => {
                let quantity = current.quantity + position.quantity;
                let entry_price = if quantity > 0.0 {
                    (current.notional() + position.notional()) / quantity
                } else {
                    current.entry_price
                };
                sqlx::query(
                    r#"
                    UPDATE positions SET
                        entry_price = $2,
                        quantity = $3,
                        stop_loss = COALESCE($4, stop_loss),
                        take_profit = COALESCE($5, take_profit),
                        updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(current.id)
                .bind(to_decimal(entry_price))
                .bind(to_decimal(quantity))
                .bind(opt_decimal(position.stop_loss))
                .bind(opt_decimal(position.take_profit))
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO positions (
                        id, user_id, symbol, side, entry_price, quantity, strategy,
                        stop_loss, take_profit, opened_at, status
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'open')
                    "#,
                )
                .bind(position.id)
                .bind(position.user_id)
                .bind(&position.symbol)
                .bind(position.side.as_str())
                .bind(to_decimal(position.entry_price))
                .bind(to_decimal(position.quantity))
                .bind(&position.strategy)
                .bind(opt_decimal(position.stop_loss))
                .bind(opt_decimal(position.take_profit))
                .bind(position.opened_at)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;

        tracing::debug!(
            "Saved position for user {} on {} to Postgres",
            position.user_id,
            position.symbol
        );
        Ok(())
    }

    async fn record_position_close(
        &self,
        position_id: Uuid,
        exit_price: f64,
        quantity: f64,
    ) -> Result<f64> {
        let pool = self.pool().await;
        let mut tx = pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM positions WHERE id = $1 AND status = 'open' FOR UPDATE",
            POSITION_COLUMNS
        ))
        .bind(position_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| TradeError::NotFound(format!("position {}", position_id)))?;
        let position = position_from_row(&row)?;

        let closed = quantity.min(position.quantity);
        let profit = Position {
            quantity: closed,
            ..position.clone()
        }
        .pnl(exit_price);
        let remaining = position.quantity - closed;

        if remaining <= 1e-12 {
            sqlx::query(
                r#"
                UPDATE positions SET
                    status = 'closed', quantity = 0, exit_price = $2,
                    realized_pnl = COALESCE(realized_pnl, 0) + $3,
                    closed_at = NOW(), updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(position_id)
            .bind(to_decimal(exit_price))
            .bind(to_decimal(profit))
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                r#"
                UPDATE positions SET
                    quantity = $2,
                    realized_pnl = COALESCE(realized_pnl, 0) + $3,
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(position_id)
            .bind(to_decimal(remaining))
            .bind(to_decimal(profit))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(profit)
    }
}

#[async_trait]
impl TradeRepository for PostgresStore {
    async fn record_trade(
        &self,
        user_id: UserId,
        result: &TradeResult,
        signal: &TradingSignal,
        profit: Option<f64>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trades (
                trade_id, user_id, symbol, side, price, quantity, strategy,
                signal_type, timeframe, profit, executed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&result.trade_id)
        .bind(user_id)
        .bind(&result.symbol)
        .bind(result.side.as_str())
        .bind(to_decimal(result.price))
        .bind(to_decimal(result.quantity))
        .bind(&signal.strategy)
        .bind(&signal.signal_type)
        .bind(&signal.timeframe)
        .bind(opt_decimal(profit))
        .bind(result.timestamp)
        .execute(&self.pool().await)
        .await?;

        Ok(())
    }

    async fn trades_since(&self, since: DateTime<Utc>) -> Result<Vec<TradeRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT trade_id, user_id, symbol, side, price, quantity, strategy, profit, executed_at
            FROM trades
            WHERE executed_at >= $1
            ORDER BY executed_at
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool().await)
        .await?;

        rows.iter()
            .map(|row| {
                let side: String = row.try_get("side")?;
                let profit: Option<Decimal> = row.try_get("profit")?;
                Ok(TradeRecord {
                    user_id: row.try_get("user_id")?,
                    trade_id: row.try_get("trade_id")?,
                    symbol: row.try_get("symbol")?,
                    side: side.parse::<Side>()?,
                    price: to_f64(row.try_get("price")?),
                    quantity: to_f64(row.try_get("quantity")?),
                    strategy: row.try_get("strategy")?,
                    profit: profit.map(to_f64),
                    timestamp: row.try_get("executed_at")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl CredentialStore for PostgresStore {
    async fn credentials(&self, user_id: UserId) -> Result<Option<ApiCredentials>> {
        let row = sqlx::query("SELECT api_key, api_secret FROM api_keys WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool().await)
            .await?;

        row.map(|row| {
            Ok(ApiCredentials {
                api_key: row.try_get("api_key")?,
                api_secret: row.try_get("api_secret")?,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl HealthCheck for PostgresStore {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool().await).await?;
        Ok(())
    }

    async fn reconnect(&self) -> Result<()> {
        let fresh = connect(&self.database_url, self.max_connections).await?;
        let old = {
            let mut guard = self.pool.write().await;
            std::mem::replace(&mut *guard, fresh)
        };
        old.close().await;

        tracing::info!("Postgres pool recreated");
        Ok(())
    }
}
