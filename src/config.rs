// Configuration module
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, TradeError};
use crate::models::RiskLevel;
use crate::scheduler::OverlapPolicy;

/// Longest span any timer or window may be configured to (ten years)
pub const MAX_SPAN_SECS: u64 = 10 * 365 * 86_400;

/// `secs` as a chrono span; `None` when it does not fit chrono's range
pub fn chrono_secs(secs: u64) -> Option<chrono::Duration> {
    chrono::Duration::from_std(std::time::Duration::from_secs(secs)).ok()
}

/// Application configuration, built once at startup and shared by reference
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub risk: RiskConfig,
    pub engine: EngineConfig,
    pub healing: HealingConfig,
    pub scheduler: SchedulerConfig,
    pub exchange: ExchangeConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub logging: LoggingConfig,
}

/// A value per risk level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RiskTable {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
}

impl RiskTable {
    pub const fn new(low: f64, medium: f64, high: f64) -> Self {
        Self { low, medium, high }
    }

    pub fn get(&self, level: RiskLevel) -> f64 {
        match level {
            RiskLevel::Low => self.low,
            RiskLevel::Medium => self.medium,
            RiskLevel::High => self.high,
        }
    }

    fn values(&self) -> [f64; 3] {
        [self.low, self.medium, self.high]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Drawdown percent at which stages 1..=4 begin
    pub drawdown_thresholds: [f64; 4],
    pub stage1_multiplier: f64,
    pub stage2_multiplier: f64,
    pub max_open_positions: usize,
    pub max_position_size_percent: f64,
    pub max_allocation_percent: f64,
    /// Annualized volatility ceiling, percent
    pub volatility_limits: RiskTable,
    pub volatility_candles: usize,
    pub liquidity_multiplier: f64,
    pub liquidity_band_percent: f64,
    pub orderbook_depth: usize,
    pub correlation_threshold: f64,
    pub max_correlated_positions: usize,
    pub default_correlation: f64,
    pub stop_loss_percent: RiskTable,
    pub take_profit_percent: RiskTable,
    pub risk_percent: RiskTable,
    pub refresh_secs: u64,
    pub protective_window_hours: u64,
    pub protective_shrink: f64,
    pub exposure_limit_percent: f64,
    pub concentration_limit_percent: f64,
    pub potential_drawdown_limit_percent: f64,
    pub overnight_limit_percent: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            drawdown_thresholds: [5.0, 10.0, 15.0, 20.0],
            stage1_multiplier: 0.75,
            stage2_multiplier: 0.5,
            max_open_positions: 10,
            max_position_size_percent: 5.0,
            max_allocation_percent: 80.0,
            volatility_limits: RiskTable::new(5.0, 10.0, 20.0),
            volatility_candles: 24,
            liquidity_multiplier: 20.0,
            liquidity_band_percent: 1.0,
            orderbook_depth: 20,
            correlation_threshold: 0.7,
            max_correlated_positions: 2,
            default_correlation: 0.3,
            stop_loss_percent: RiskTable::new(2.0, 5.0, 10.0),
            take_profit_percent: RiskTable::new(3.0, 8.0, 15.0),
            risk_percent: RiskTable::new(1.0, 2.0, 3.0),
            refresh_secs: 60,
            protective_window_hours: 24,
            protective_shrink: 0.75,
            exposure_limit_percent: 70.0,
            concentration_limit_percent: 40.0,
            potential_drawdown_limit_percent: 15.0,
            overnight_limit_percent: 50.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub user_refresh_secs: u64,
    pub market_refresh_secs: u64,
    pub iteration_interval_secs: u64,
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub degraded_after_errors: u32,
    pub exchange_call_timeout_secs: u64,
    pub stop_timeout_secs: u64,
    pub market_symbols: Vec<String>,
    pub candle_interval: String,
    pub candle_limit: usize,
    pub trade_history_days: u64,
    pub at_risk_threshold_percent: f64,
    pub user_at_risk_exposure: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            user_refresh_secs: 300,
            market_refresh_secs: 60,
            iteration_interval_secs: 10,
            base_backoff_secs: 5,
            max_backoff_secs: 60,
            degraded_after_errors: 5,
            exchange_call_timeout_secs: 15,
            stop_timeout_secs: 30,
            market_symbols: vec![
                "BTC/USDT".to_string(),
                "ETH/USDT".to_string(),
                "SOL/USDT".to_string(),
            ],
            candle_interval: "1h".to_string(),
            candle_limit: 48,
            trade_history_days: 30,
            at_risk_threshold_percent: 3.0,
            user_at_risk_exposure: 5000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealingConfig {
    pub check_interval_secs: u64,
    pub error_pause_secs: u64,
    pub resource_threshold_percent: f64,
    pub log_dir: PathBuf,
    pub log_retention_days: u64,
    pub engine_stale_secs: u64,
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 10,
            error_pause_secs: 30,
            resource_threshold_percent: 90.0,
            log_dir: PathBuf::from("logs"),
            log_retention_days: 7,
            engine_stale_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_millis: u64,
    pub stop_timeout_secs: u64,
    pub overlap: OverlapPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_millis: 1000,
            stop_timeout_secs: 5,
            overlap: OverlapPolicy::Allow,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeMode {
    /// Simulated fills priced from the public market-data API
    #[default]
    Paper,
    /// Simulated fills priced from a seeded table; no network
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub mode: ExchangeMode,
    pub base_url: String,
    pub requests_per_minute: u32,
    pub http_timeout_secs: u64,
    pub paper_slippage_bps: f64,
    pub paper_starting_balance: f64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            mode: ExchangeMode::Paper,
            base_url: "https://api.binance.com".to_string(),
            requests_per_minute: 600,
            http_timeout_secs: 30,
            paper_slippage_bps: 5.0,
            paper_starting_balance: 10_000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: Option<String>,
    pub ttl_secs: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            ttl_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: Option<PathBuf>,
}

impl AppConfig {
    /// Load configuration from `config/` and the environment
    pub fn load() -> Result<Self> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    ///
    /// Sources, later ones winning: built-in defaults, `default.toml`,
    /// `local.toml`, `TRADEFLEET__*` environment variables.
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("TRADEFLEET")
                    .separator("__")
                    .try_parsing(true),
            );

        let mut cfg: AppConfig = builder.build()?.try_deserialize()?;

        // Unprefixed connection strings, as used by docker-compose setups
        if cfg.database.url.is_none() {
            cfg.database.url = std::env::var("DATABASE_URL").ok();
        }
        if cfg.redis.url.is_none() {
            cfg.redis.url = std::env::var("REDIS_URL").ok();
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject thresholds that would make the risk gate or the loops misbehave
    pub fn validate(&self) -> Result<()> {
        let risk = &self.risk;

        let t = risk.drawdown_thresholds;
        if t.windows(2).any(|w| w[0] >= w[1]) || t[0] <= 0.0 || t[3] > 100.0 {
            return Err(invalid(format!(
                "drawdown thresholds must be strictly increasing within (0, 100]: {:?}",
                t
            )));
        }

        let percents = [
            ("max_position_size_percent", risk.max_position_size_percent),
            ("max_allocation_percent", risk.max_allocation_percent),
            ("liquidity_band_percent", risk.liquidity_band_percent),
            ("resource_threshold_percent", self.healing.resource_threshold_percent),
        ];
        for (name, value) in percents {
            if !(value > 0.0 && value <= 100.0) {
                return Err(invalid(format!("{} must be within (0, 100], got {}", name, value)));
            }
        }

        for (name, table) in [
            ("risk_percent", risk.risk_percent),
            ("stop_loss_percent", risk.stop_loss_percent),
            ("take_profit_percent", risk.take_profit_percent),
            ("volatility_limits", risk.volatility_limits),
        ] {
            if table.values().iter().any(|v| *v <= 0.0) {
                return Err(invalid(format!("{} values must be positive", name)));
            }
        }

        if !(0.0..=1.0).contains(&risk.correlation_threshold)
            || !(0.0..=1.0).contains(&risk.default_correlation)
        {
            return Err(invalid("correlation values must be within [0, 1]".to_string()));
        }

        let intervals = [
            ("engine.user_refresh_secs", self.engine.user_refresh_secs),
            ("engine.market_refresh_secs", self.engine.market_refresh_secs),
            ("engine.iteration_interval_secs", self.engine.iteration_interval_secs),
            ("engine.exchange_call_timeout_secs", self.engine.exchange_call_timeout_secs),
            ("healing.check_interval_secs", self.healing.check_interval_secs),
            ("scheduler.tick_millis", self.scheduler.tick_millis),
            ("risk.refresh_secs", risk.refresh_secs),
            ("risk.protective_window_hours", risk.protective_window_hours),
            ("engine.trade_history_days", self.engine.trade_history_days),
            ("healing.engine_stale_secs", self.healing.engine_stale_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(invalid(format!("{} must be non-zero", name)));
            }
        }

        let spans = [
            ("risk.refresh_secs", Some(risk.refresh_secs)),
            ("risk.protective_window_hours", risk.protective_window_hours.checked_mul(3_600)),
            ("engine.user_refresh_secs", Some(self.engine.user_refresh_secs)),
            ("engine.market_refresh_secs", Some(self.engine.market_refresh_secs)),
            ("engine.iteration_interval_secs", Some(self.engine.iteration_interval_secs)),
            ("engine.trade_history_days", self.engine.trade_history_days.checked_mul(86_400)),
            ("healing.engine_stale_secs", Some(self.healing.engine_stale_secs)),
            ("healing.log_retention_days", self.healing.log_retention_days.checked_mul(86_400)),
        ];
        for (name, secs) in spans {
            if !secs.is_some_and(|s| s <= MAX_SPAN_SECS) {
                return Err(invalid(format!("{} exceeds {} days", name, MAX_SPAN_SECS / 86_400)));
            }
        }

        Ok(())
    }
}

fn invalid(message: String) -> TradeError {
    TradeError::Config(config::ConfigError::Message(message))
}
