use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::time::{timeout, Duration};

use crate::error::{Result, TradeError};
use crate::models::{Candle, Ticker};

const KEY_PREFIX: &str = "tradefleet";

/// Redis cache for shared market data
///
/// Values are JSON with a TTL; the in-memory snapshot held by the trading loop
/// stays authoritative and this cache only survives restarts.
#[derive(Clone)]
pub struct RedisMarketCache {
    conn: ConnectionManager,
    ttl_secs: u64,
}

impl RedisMarketCache {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    /// * `ttl_secs` - Expiry applied to every cached value
    pub async fn new(redis_url: &str, ttl_secs: u64) -> Result<Self> {
        let client = Client::open(redis_url)?;

        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| TradeError::timeout("redis connect", Duration::from_secs(5)))??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self { conn, ttl_secs })
    }

    fn ticker_key(symbol: &str) -> String {
        format!("{}:ticker:{}", KEY_PREFIX, symbol)
    }

    fn candles_key(symbol: &str, interval: &str) -> String {
        format!("{}:candles:{}:{}", KEY_PREFIX, symbol, interval)
    }

    pub async fn put_ticker(&self, ticker: &Ticker) -> Result<()> {
        let value = serde_json::to_string(ticker)?;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(Self::ticker_key(&ticker.symbol), value, self.ttl_secs)
            .await?;
        Ok(())
    }

    pub async fn get_ticker(&self, symbol: &str) -> Result<Option<Ticker>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(Self::ticker_key(symbol)).await?;
        raw.map(|s| serde_json::from_str(&s).map_err(TradeError::from))
            .transpose()
    }

    /// Store the candle series for a symbol, replacing what was there
    pub async fn put_candles(&self, symbol: &str, interval: &str, candles: &[Candle]) -> Result<()> {
        let value = serde_json::to_string(candles)?;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(Self::candles_key(symbol, interval), value, self.ttl_secs)
            .await?;

        tracing::debug!("Cached {} candles for {} in Redis", candles.len(), symbol);
        Ok(())
    }

    pub async fn get_candles(&self, symbol: &str, interval: &str) -> Result<Vec<Candle>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(Self::candles_key(symbol, interval)).await?;
        match raw {
            Some(s) => Ok(serde_json::from_str(&s)?),
            None => Ok(Vec::new()),
        }
    }

    /// Delete every key this cache owns; returns how many were removed
    pub async fn clear(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys(format!("{}:*", KEY_PREFIX)).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let removed: usize = conn.del(&keys).await?;
        tracing::debug!("Cleared {} cached keys from Redis", removed);
        Ok(removed)
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn candle(symbol: &str, close: f64) -> Candle {
        Candle {
            symbol: symbol.to_string(),
            timestamp: Utc::now(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_connection_timeout() {
        let result = RedisMarketCache::new("redis://192.0.2.1:6379", 60).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_candles_round_trip_and_clear() {
        let cache = RedisMarketCache::new("redis://127.0.0.1:6379", 60)
            .await
            .expect("Failed to connect to Redis");

        let candles = vec![candle("TEST/USDT", 1.0), candle("TEST/USDT", 2.0)];
        cache.put_candles("TEST/USDT", "1h", &candles).await.unwrap();

        let loaded = cache.get_candles("TEST/USDT", "1h").await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].close, 2.0);

        assert!(cache.clear().await.unwrap() >= 1);
        assert!(cache.get_candles("TEST/USDT", "1h").await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_ticker_and_ping() {
        let cache = RedisMarketCache::new("redis://127.0.0.1:6379", 60)
            .await
            .expect("Failed to connect to Redis");

        cache.ping().await.unwrap();
        let ticker = Ticker {
            symbol: "TEST/USDT".to_string(),
            price: 42.0,
            timestamp: Utc::now(),
        };
        cache.put_ticker(&ticker).await.unwrap();
        assert_eq!(cache.get_ticker("TEST/USDT").await.unwrap(), Some(ticker));
        cache.clear().await.unwrap();
    }
}
