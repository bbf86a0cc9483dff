use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use governor::{Quota, RateLimiter};
use reqwest::Client;
use serde::Deserialize;
use std::num::NonZeroU32;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use super::MarketFeed;
use crate::config::ExchangeConfig;
use crate::error::{Result, TradeError};
use crate::models::{BookLevel, Candle, OrderBook, Ticker};

const MAX_RETRIES: u32 = 3;

type PublicRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Client for a Binance-compatible public REST API
///
/// Cloneable; clones share the HTTP client and the rate limiter. Used both as
/// the market feed for paper trading and as the exchange reachability probe.
#[derive(Clone)]
pub struct PublicMarketClient {
    client: Arc<RwLock<Client>>,
    base_url: String,
    http_timeout: Duration,
    rate_limiter: Arc<PublicRateLimiter>,
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    symbol: String,
    price: String,
}

#[derive(Debug, Deserialize)]
struct DepthResponse {
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

impl PublicMarketClient {
    pub fn new(config: &ExchangeConfig) -> Result<Self> {
        let http_timeout = Duration::from_secs(config.http_timeout_secs);
        let client = build_client(http_timeout)?;

        let rpm = NonZeroU32::new(config.requests_per_minute).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_minute(rpm)));

        Ok(Self {
            client: Arc::new(RwLock::new(client)),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            http_timeout,
            rate_limiter,
        })
    }

    fn http(&self) -> Client {
        match self.client.read() {
            Ok(client) => client.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Rate-limited GET with retry on 429 and 5xx
    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);

        for attempt in 1..=MAX_RETRIES {
            self.rate_limiter.until_ready().await;

            match self.http().get(&url).query(query).send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response);
                    }

                    if (status.as_u16() == 429 || status.is_server_error()) && attempt < MAX_RETRIES {
                        let backoff_secs = 2u64.pow(attempt);
                        tracing::warn!(
                            "{} from {}, retrying in {}s (attempt {}/{})",
                            status,
                            path,
                            backoff_secs,
                            attempt,
                            MAX_RETRIES
                        );
                        tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                        continue;
                    }

                    let body = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "Unknown error".to_string());
                    return Err(TradeError::Exchange(format!(
                        "{} returned {}: {}",
                        path, status, body
                    )));
                }
                Err(e) if attempt < MAX_RETRIES => {
                    let backoff_secs = 2u64.pow(attempt);
                    tracing::warn!(
                        "Network error on {}: {}, retrying in {}s (attempt {}/{})",
                        path,
                        e,
                        backoff_secs,
                        attempt,
                        MAX_RETRIES
                    );
                    tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(TradeError::Exchange(format!(
            "{} failed after {} attempts",
            path, MAX_RETRIES
        )))
    }
}

#[async_trait]
impl MarketFeed for PublicMarketClient {
    async fn ping(&self) -> Result<()> {
        self.get("/api/v3/ping", &[]).await?;
        Ok(())
    }

    async fn ticker(&self, symbol: &str) -> Result<Ticker> {
        let response = self
            .get("/api/v3/ticker/price", &[("symbol", venue_symbol(symbol))])
            .await?;
        let body: TickerPrice = response.json().await?;

        tracing::trace!("ticker {} = {}", body.symbol, body.price);

        Ok(Ticker {
            symbol: symbol.to_string(),
            price: parse_number(&body.price)?,
            timestamp: Utc::now(),
        })
    }

    async fn klines(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Candle>> {
        let response = self
            .get(
                "/api/v3/klines",
                &[
                    ("symbol", venue_symbol(symbol)),
                    ("interval", interval.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        let rows: Vec<Vec<serde_json::Value>> = response.json().await?;

        rows.iter().map(|row| parse_kline(symbol, row)).collect()
    }

    async fn orderbook(&self, symbol: &str, depth: usize) -> Result<OrderBook> {
        let response = self
            .get(
                "/api/v3/depth",
                &[("symbol", venue_symbol(symbol)), ("limit", depth.to_string())],
            )
            .await?;
        let body: DepthResponse = response.json().await?;

        Ok(OrderBook {
            symbol: symbol.to_string(),
            bids: parse_levels(&body.bids)?,
            asks: parse_levels(&body.asks)?,
        })
    }

    fn reset(&self) {
        match build_client(self.http_timeout) {
            Ok(fresh) => {
                let mut guard = match self.client.write() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                *guard = fresh;
                tracing::info!("Public market client rebuilt");
            }
            Err(e) => tracing::error!("Failed to rebuild public market client: {}", e),
        }
    }
}

fn build_client(timeout: Duration) -> Result<Client> {
    Ok(Client::builder().timeout(timeout).build()?)
}

/// "BTC/USDT" -> "BTCUSDT"
fn venue_symbol(symbol: &str) -> String {
    symbol.replace(['/', '-'], "").to_ascii_uppercase()
}

fn parse_number(raw: &str) -> Result<f64> {
    raw.parse::<f64>()
        .map_err(|_| TradeError::Exchange(format!("unparseable number: {}", raw)))
}

fn parse_levels(levels: &[[String; 2]]) -> Result<Vec<BookLevel>> {
    levels
        .iter()
        .map(|[price, qty]| {
            Ok(BookLevel {
                price: parse_number(price)?,
                quantity: parse_number(qty)?,
            })
        })
        .collect()
}

// [open_time, open, high, low, close, volume, close_time, ...]
fn parse_kline(symbol: &str, row: &[serde_json::Value]) -> Result<Candle> {
    let field = |i: usize| -> Result<f64> {
        match row.get(i) {
            Some(serde_json::Value::String(s)) => parse_number(s),
            Some(serde_json::Value::Number(n)) => n
                .as_f64()
                .ok_or_else(|| TradeError::Exchange("bad kline number".to_string())),
            _ => Err(TradeError::Exchange(format!("kline field {} missing", i))),
        }
    };

    let open_ms = row
        .first()
        .and_then(|v| v.as_i64())
        .ok_or_else(|| TradeError::Exchange("kline open time missing".to_string()))?;
    let timestamp = Utc
        .timestamp_millis_opt(open_ms)
        .single()
        .ok_or_else(|| TradeError::Exchange(format!("bad kline timestamp {}", open_ms)))?;

    Ok(Candle {
        symbol: symbol.to_string(),
        timestamp,
        open: field(1)?,
        high: field(2)?,
        low: field(3)?,
        close: field(4)?,
        volume: field(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn client_for(url: &str) -> PublicMarketClient {
        let config = ExchangeConfig {
            base_url: url.to_string(),
            http_timeout_secs: 5,
            ..ExchangeConfig::default()
        };
        PublicMarketClient::new(&config).unwrap()
    }

    #[test]
    fn test_venue_symbol() {
        assert_eq!(venue_symbol("btc/usdt"), "BTCUSDT");
        assert_eq!(venue_symbol("ETH-USDT"), "ETHUSDT");
    }

    #[tokio::test]
    async fn test_ticker() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v3/ticker/price")
            .match_query(Matcher::UrlEncoded("symbol".into(), "BTCUSDT".into()))
            .with_status(200)
            .with_body(r#"{"symbol":"BTCUSDT","price":"65000.50"}"#)
            .create_async()
            .await;

        let client = client_for(&server.url());
        let ticker = client.ticker("BTC/USDT").await.unwrap();

        assert_eq!(ticker.symbol, "BTC/USDT");
        assert_eq!(ticker.price, 65000.50);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_klines_and_depth() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v3/klines")
            .match_query(Matcher::Any)
            .with_body(
                r#"[[1700000000000,"100.0","101.0","99.0","100.5","12.5",1700003599999,"0",1,"0","0","0"],
                    [1700003600000,"100.5","102.0","100.0","101.5","8.0",1700007199999,"0",1,"0","0","0"]]"#,
            )
            .create_async()
            .await;
        server
            .mock("GET", "/api/v3/depth")
            .match_query(Matcher::Any)
            .with_body(r#"{"lastUpdateId":1,"bids":[["99.9","2.0"]],"asks":[["100.1","3.0"]]}"#)
            .create_async()
            .await;

        let client = client_for(&server.url());

        let candles = client.klines("ETH/USDT", "1h", 2).await.unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[1].close, 101.5);
        assert_eq!(candles[0].volume, 12.5);

        let book = client.orderbook("ETH/USDT", 20).await.unwrap();
        assert_eq!(book.bids[0].price, 99.9);
        assert_eq!(book.asks[0].quantity, 3.0);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v3/ping")
            .with_status(403)
            .with_body("forbidden")
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server.url());
        let err = client.ping().await.unwrap_err();

        assert!(matches!(err, TradeError::Exchange(_)));
        mock.assert_async().await;
    }
}
