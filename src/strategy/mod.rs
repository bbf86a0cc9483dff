// Trading strategy module
pub mod builtin;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::exchange::Exchange;
use crate::models::{MarketData, RiskLevel, TradingSignal, UserAccount};

pub use builtin::{Breakout, MeanReversion, RuleStrategy, TrendFollowing};

/// Base trait for all trading strategies
#[async_trait]
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    /// Share of the user's balance this strategy sizes its signals against
    fn allocation_percent(&self) -> f64;

    /// Produce zero or more signals from cached market data
    async fn generate_signals(
        &self,
        exchange: &dyn Exchange,
        market: &MarketData,
    ) -> Result<Vec<TradingSignal>>;
}

/// Builds the strategy set for a user
pub trait StrategyFactory: Send + Sync {
    fn strategies_for(&self, user: &UserAccount) -> Vec<Arc<dyn Strategy>>;
}

/// Strategy weights per risk level, in percent of balance
pub fn allocation_table(level: RiskLevel) -> &'static [(&'static str, f64)] {
    match level {
        RiskLevel::Low => &[("trend_following", 60.0), ("mean_reversion", 40.0)],
        RiskLevel::Medium => &[
            ("trend_following", 40.0),
            ("mean_reversion", 30.0),
            ("breakout", 30.0),
        ],
        RiskLevel::High => &[
            ("breakout", 50.0),
            ("trend_following", 30.0),
            ("mean_reversion", 20.0),
        ],
    }
}

/// Factory over the indicator strategies shipped with the crate
#[derive(Debug, Clone, Default)]
pub struct BuiltinStrategies;

impl BuiltinStrategies {
    pub fn create(name: &str, allocation_percent: f64) -> Option<Arc<dyn Strategy>> {
        let strategy: Arc<dyn Strategy> = match name {
            "trend_following" => Arc::new(RuleStrategy::new(TrendFollowing::default(), allocation_percent)),
            "mean_reversion" => Arc::new(RuleStrategy::new(MeanReversion::default(), allocation_percent)),
            "breakout" => Arc::new(RuleStrategy::new(Breakout::default(), allocation_percent)),
            _ => return None,
        };
        Some(strategy)
    }
}

impl StrategyFactory for BuiltinStrategies {
    fn strategies_for(&self, user: &UserAccount) -> Vec<Arc<dyn Strategy>> {
        allocation_table(user.risk_level)
            .iter()
            .filter_map(|(name, allocation)| {
                let created = Self::create(name, *allocation);
                if created.is_none() {
                    tracing::warn!(user_id = user.id, "Unknown strategy {}, skipping", name);
                }
                created
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocations_sum_to_100() {
        for level in [RiskLevel::Low, RiskLevel::Medium, RiskLevel::High] {
            let total: f64 = allocation_table(level).iter().map(|(_, a)| a).sum();
            assert_eq!(total, 100.0, "{} allocations", level);
        }
    }

    #[test]
    fn test_factory_builds_user_set() {
        let user = UserAccount::new(1, "alice", RiskLevel::Medium, 1_000.0);
        let strategies = BuiltinStrategies.strategies_for(&user);

        let names: Vec<&str> = strategies.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["trend_following", "mean_reversion", "breakout"]);
        assert_eq!(strategies[0].allocation_percent(), 40.0);
    }

    #[test]
    fn test_unknown_strategy() {
        assert!(BuiltinStrategies::create("sentiment_based", 10.0).is_none());
    }
}
