use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Lifecycle and health of the trading loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Initializing,
    Starting,
    Running,
    Paused,
    Degraded,
    Stopping,
    Stopped,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Initializing => "initializing",
            HealthStatus::Starting => "starting",
            HealthStatus::Running => "running",
            HealthStatus::Paused => "paused",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Stopping => "stopping",
            HealthStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot returned by `TradingEngine::get_status`
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub paused: bool,
    pub health: HealthStatus,
    pub active_users: usize,
    pub active_exchanges: usize,
    pub active_strategies: usize,
    pub user_data_age_secs: Option<i64>,
    pub market_data_age_secs: Option<i64>,
    pub consecutive_errors: u32,
    /// Most frequently recurring error message since the last reset
    pub last_error: Option<String>,
    pub last_activity: DateTime<Utc>,
}

/// Error messages seen by the loop, counted by text
#[derive(Debug, Default)]
pub struct ErrorTracker {
    counts: HashMap<String, (u64, DateTime<Utc>)>,
}

impl ErrorTracker {
    pub fn record(&mut self, message: impl Into<String>) {
        let entry = self.counts.entry(message.into()).or_insert((0, Utc::now()));
        entry.0 += 1;
        entry.1 = Utc::now();
    }

    /// Highest count wins; ties go to the most recent
    pub fn most_common(&self) -> Option<String> {
        self.counts
            .iter()
            .max_by(|a, b| a.1 .0.cmp(&b.1 .0).then(a.1 .1.cmp(&b.1 .1)))
            .map(|(message, _)| message.clone())
    }

    pub fn clear(&mut self) {
        self.counts.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// Per-strategy results over the evaluation window
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct StrategyPerformance {
    /// Percent of closed trades with positive profit
    pub win_rate: f64,
    /// Mean profit of closed trades, percent of their notional
    pub avg_profit: f64,
    pub trade_count: usize,
}

/// Book-wide exposure figures from `check_risk_exposure`
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct RiskExposureReport {
    pub total_exposure: f64,
    pub positions_count: usize,
    pub high_risk_positions: usize,
    pub users_at_risk: usize,
    pub max_drawdown_risk: f64,
}

/// Exponential backoff after `errors` consecutive failures
pub fn backoff_delay(errors: u32, base_secs: u64, max_secs: u64) -> std::time::Duration {
    let exponent = errors.saturating_sub(1).min(32);
    let secs = base_secs.saturating_mul(1u64 << exponent).min(max_secs);
    std::time::Duration::from_secs(secs)
}
