use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

use super::correlation::CorrelationTable;
use crate::config::chrono_secs;
use super::drawdown::{DrawdownStage, EquityTracker};
use crate::models::{Position, Side, UserId};

/// What the gate remembers about one open position
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeldPosition {
    pub side: Side,
    pub entry_price: f64,
    pub quantity: f64,
    pub strategy: String,
}

impl HeldPosition {
    pub fn notional(&self) -> f64 {
        self.entry_price * self.quantity
    }
}

impl From<&Position> for HeldPosition {
    fn from(p: &Position) -> Self {
        Self {
            side: p.side,
            entry_price: p.entry_price,
            quantity: p.quantity,
            strategy: p.strategy.clone(),
        }
    }
}

/// Per-user risk snapshot owned by the gate
#[derive(Debug, Clone, Default)]
pub struct UserRiskState {
    pub user_id: UserId,
    pub equity: EquityTracker,
    pub stage: DrawdownStage,
    /// symbol -> position
    pub positions: HashMap<String, HeldPosition>,
    /// Coefficients between the held symbols
    pub correlations: CorrelationTable,
    pub last_updated: Option<DateTime<Utc>>,
}

impl UserRiskState {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            ..Default::default()
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>, max_age_secs: u64) -> bool {
        match (self.last_updated, chrono_secs(max_age_secs)) {
            (None, _) => true,
            (Some(at), Some(max_age)) => now - at >= max_age,
            // an age past chrono's range never elapses
            (Some(_), None) => false,
        }
    }

    /// Forget holdings and force a reload; the equity peak and stage stay
    pub fn invalidate(&mut self) {
        self.positions.clear();
        self.correlations = CorrelationTable::new();
        self.last_updated = None;
    }

    /// Replace equity and holdings from a fresh read and restage
    pub fn refresh(
        &mut self,
        equity: f64,
        positions: &[Position],
        market_correlations: &CorrelationTable,
        thresholds: &[f64; 4],
        now: DateTime<Utc>,
    ) {
        self.equity.observe(equity);
        self.stage = self.equity.stage(thresholds);

        self.positions.clear();
        for p in positions {
            // same-symbol rows collapse into one entry, as the store merges same-side fills
            self.positions
                .entry(p.symbol.clone())
                .and_modify(|held| {
                    let quantity = held.quantity + p.quantity;
                    if quantity > 0.0 {
                        held.entry_price = (held.notional() + p.notional()) / quantity;
                    }
                    held.quantity = quantity;
                })
                .or_insert_with(|| HeldPosition::from(p));
        }

        self.sync_correlations(market_correlations);
        self.last_updated = Some(now);
    }

    /// Copy the market coefficients for the symbols currently held
    pub fn sync_correlations(&mut self, market: &CorrelationTable) {
        let symbols = self.symbols();
        let mut table = CorrelationTable::new();
        for (i, a) in symbols.iter().enumerate() {
            for b in symbols.iter().skip(i + 1) {
                if let Some(c) = market.get(a, b) {
                    table.set(a, b, c);
                }
            }
        }
        self.correlations = table;
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.positions.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn total_notional(&self) -> f64 {
        self.positions.values().map(|p| p.notional()).sum()
    }

    /// Position this signal would close, if any
    pub fn closing_target(&self, symbol: &str, side: Side) -> Option<&HeldPosition> {
        self.positions.get(symbol).filter(|held| held.side == side.opposite())
    }

    /// Apply an executed fill to the holdings
    pub fn apply_fill(&mut self, symbol: &str, side: Side, price: f64, quantity: f64, strategy: &str) {
        if quantity <= 0.0 {
            return;
        }
        match self.positions.get_mut(symbol) {
            Some(held) if held.side == side => {
                let total = held.quantity + quantity;
                held.entry_price = (held.notional() + price * quantity) / total;
                held.quantity = total;
            }
            Some(held) => {
                let remaining = held.quantity - quantity;
                if remaining > 1e-12 {
                    held.quantity = remaining;
                } else {
                    self.positions.remove(symbol);
                }
            }
            None => {
                self.positions.insert(
                    symbol.to_string(),
                    HeldPosition {
                        side,
                        entry_price: price,
                        quantity,
                        strategy: strategy.to_string(),
                    },
                );
            }
        }
    }

    pub fn snapshot(&self) -> RiskSnapshot {
        RiskSnapshot {
            user_id: self.user_id,
            peak_equity: self.equity.peak,
            current_equity: self.equity.current,
            drawdown_percent: self.equity.drawdown_percent(),
            stage: self.stage,
            positions: self.positions.clone(),
            last_updated: self.last_updated,
        }
    }
}

/// Read-only copy of a user's risk state for callers outside the gate
#[derive(Debug, Clone, Serialize)]
pub struct RiskSnapshot {
    pub user_id: UserId,
    pub peak_equity: f64,
    pub current_equity: f64,
    pub drawdown_percent: f64,
    pub stage: DrawdownStage,
    pub positions: HashMap<String, HeldPosition>,
    pub last_updated: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    fn position(symbol: &str, side: Side, price: f64, qty: f64) -> Position {
        Position {
            id: Uuid::new_v4(),
            user_id: 1,
            symbol: symbol.to_string(),
            side,
            entry_price: price,
            quantity: qty,
            strategy: "trend_following".to_string(),
            stop_loss: None,
            take_profit: None,
            opened_at: Utc::now(),
        }
    }

    #[test]
    fn test_refresh_tracks_peak_and_stage() {
        let thresholds = [5.0, 10.0, 15.0, 20.0];
        let mut state = UserRiskState::new(1);
        let now = Utc::now();

        state.refresh(10_000.0, &[], &CorrelationTable::new(), &thresholds, now);
        assert_eq!(state.stage, DrawdownStage::Normal);

        state.refresh(8_800.0, &[], &CorrelationTable::new(), &thresholds, now);
        assert_eq!(state.stage, DrawdownStage::EntriesPaused);
        assert_eq!(state.equity.peak, 10_000.0);
    }

    #[test]
    fn test_staleness() {
        let mut state = UserRiskState::new(1);
        let now = Utc::now();
        assert!(state.is_stale(now, 60));

        state.last_updated = Some(now);
        assert!(!state.is_stale(now + Duration::seconds(59), 60));
        assert!(state.is_stale(now + Duration::seconds(60), 60));
        assert!(!state.is_stale(now + Duration::days(365), u64::MAX));
    }

    #[test]
    fn test_invalidate_keeps_peak_and_stage() {
        let thresholds = [5.0, 10.0, 15.0, 20.0];
        let mut state = UserRiskState::new(1);
        let now = Utc::now();
        state.refresh(10_000.0, &[position("BTC/USDT", Side::Buy, 100.0, 1.0)], &CorrelationTable::new(), &thresholds, now);
        state.refresh(7_800.0, &[position("BTC/USDT", Side::Buy, 100.0, 1.0)], &CorrelationTable::new(), &thresholds, now);

        state.invalidate();
        assert!(state.positions.is_empty());
        assert!(state.is_stale(now, 60));
        assert_eq!(state.stage, DrawdownStage::Halted);

        // a reload at the same equity restages against the old peak
        state.refresh(7_800.0, &[], &CorrelationTable::new(), &thresholds, now);
        assert_eq!(state.equity.peak, 10_000.0);
        assert_eq!(state.stage, DrawdownStage::Halted);
    }

    #[test]
    fn test_apply_fill_open_add_reduce_close() {
        let mut state = UserRiskState::new(1);
        state.apply_fill("ETH/USDT", Side::Buy, 100.0, 1.0, "trend_following");
        state.apply_fill("ETH/USDT", Side::Buy, 200.0, 1.0, "trend_following");
        assert_eq!(state.positions["ETH/USDT"].entry_price, 150.0);

        assert!(state.closing_target("ETH/USDT", Side::Sell).is_some());
        assert!(state.closing_target("ETH/USDT", Side::Buy).is_none());

        state.apply_fill("ETH/USDT", Side::Sell, 160.0, 0.5, "trend_following");
        assert_eq!(state.positions["ETH/USDT"].quantity, 1.5);

        state.apply_fill("ETH/USDT", Side::Sell, 160.0, 1.5, "trend_following");
        assert!(state.positions.is_empty());
    }

    #[test]
    fn test_sync_correlations_keeps_held_pairs_only() {
        let mut market = CorrelationTable::new();
        market.set("BTC/USDT", "ETH/USDT", 0.9);
        market.set("BTC/USDT", "SOL/USDT", 0.8);

        let mut state = UserRiskState::new(1);
        state.refresh(
            1_000.0,
            &[
                position("BTC/USDT", Side::Buy, 100.0, 1.0),
                position("ETH/USDT", Side::Buy, 10.0, 1.0),
            ],
            &market,
            &[5.0, 10.0, 15.0, 20.0],
            Utc::now(),
        );

        assert_eq!(state.correlations.len(), 1);
        assert_eq!(state.correlations.get("BTC/USDT", "ETH/USDT"), Some(0.9));
    }
}
