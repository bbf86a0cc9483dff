use async_trait::async_trait;

use super::Strategy;
use crate::error::Result;
use crate::exchange::Exchange;
use crate::indicators::{calculate_rsi, rolling_high, rolling_low, sma_crossover, Crossover};
use crate::models::{quote_asset, MarketData, Side, TradingSignal};

/// A pure entry rule evaluated over close prices
pub trait Rule: Send + Sync {
    fn name(&self) -> &'static str;

    fn min_candles_required(&self) -> usize;

    fn decide(&self, closes: &[f64]) -> Option<Side>;
}

/// SMA fast/slow crossover
#[derive(Debug, Clone)]
pub struct TrendFollowing {
    pub fast: usize,
    pub slow: usize,
}

impl Default for TrendFollowing {
    fn default() -> Self {
        Self { fast: 10, slow: 30 }
    }
}

impl Rule for TrendFollowing {
    fn name(&self) -> &'static str {
        "trend_following"
    }

    fn min_candles_required(&self) -> usize {
        self.slow + 1
    }

    fn decide(&self, closes: &[f64]) -> Option<Side> {
        match sma_crossover(closes, self.fast, self.slow)? {
            Crossover::Bullish => Some(Side::Buy),
            Crossover::Bearish => Some(Side::Sell),
            Crossover::None => None,
        }
    }
}

/// RSI oversold/overbought fade
#[derive(Debug, Clone)]
pub struct MeanReversion {
    pub period: usize,
    pub oversold: f64,
    pub overbought: f64,
}

impl Default for MeanReversion {
    fn default() -> Self {
        Self {
            period: 14,
            oversold: 30.0,
            overbought: 70.0,
        }
    }
}

impl Rule for MeanReversion {
    fn name(&self) -> &'static str {
        "mean_reversion"
    }

    fn min_candles_required(&self) -> usize {
        self.period + 1
    }

    fn decide(&self, closes: &[f64]) -> Option<Side> {
        let rsi = calculate_rsi(closes, self.period)?;
        if rsi < self.oversold {
            Some(Side::Buy)
        } else if rsi > self.overbought {
            Some(Side::Sell)
        } else {
            None
        }
    }
}

/// Close beyond the prior N-candle range
#[derive(Debug, Clone)]
pub struct Breakout {
    pub lookback: usize,
}

impl Default for Breakout {
    fn default() -> Self {
        Self { lookback: 20 }
    }
}

impl Rule for Breakout {
    fn name(&self) -> &'static str {
        "breakout"
    }

    fn min_candles_required(&self) -> usize {
        self.lookback + 1
    }

    fn decide(&self, closes: &[f64]) -> Option<Side> {
        let last = *closes.last()?;
        if last > rolling_high(closes, self.lookback)? {
            Some(Side::Buy)
        } else if last < rolling_low(closes, self.lookback)? {
            Some(Side::Sell)
        } else {
            None
        }
    }
}

/// Adapts a `Rule` into a `Strategy` sized by its allocation
pub struct RuleStrategy<R: Rule> {
    rule: R,
    allocation_percent: f64,
}

impl<R: Rule> RuleStrategy<R> {
    pub fn new(rule: R, allocation_percent: f64) -> Self {
        Self {
            rule,
            allocation_percent,
        }
    }
}

#[async_trait]
impl<R: Rule> Strategy for RuleStrategy<R> {
    fn name(&self) -> &str {
        self.rule.name()
    }

    fn allocation_percent(&self) -> f64 {
        self.allocation_percent
    }

    async fn generate_signals(
        &self,
        exchange: &dyn Exchange,
        market: &MarketData,
    ) -> Result<Vec<TradingSignal>> {
        let mut signals = Vec::new();

        let mut symbols: Vec<&String> = market.candles.keys().collect();
        symbols.sort();

        for symbol in symbols {
            let closes = market.closes(symbol);
            if closes.len() < self.rule.min_candles_required() {
                continue;
            }
            let Some(side) = self.rule.decide(&closes) else {
                continue;
            };
            let Some(price) = market.last_price(symbol) else {
                continue;
            };
            if price <= 0.0 {
                continue;
            }

            let balance = exchange.get_balance(quote_asset(symbol)).await?;
            let quantity = balance.free * self.allocation_percent / 100.0 / price;

            tracing::debug!("{} signal {} {} @ {:.4}", self.rule.name(), side, symbol, price);

            signals.push(
                TradingSignal::market(symbol.as_str(), side, quantity, self.rule.name())
                    .with_price(price),
            );
        }

        Ok(signals)
    }
}
