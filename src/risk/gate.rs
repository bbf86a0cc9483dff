use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use super::correlation::CorrelationTable;
use super::drawdown::DrawdownStage;
use super::portfolio::{determine_actions, risk_notification, PortfolioAssessment, PortfolioMetrics};
use super::sizing::{max_position_quantity, position_size, round_quantity, SizingInput};
use super::state::{RiskSnapshot, UserRiskState};
use crate::config::{chrono_secs, RiskConfig};
use crate::error::{Result, TradeError};
use crate::exchange::MarketFeed;
use crate::indicators::annualized_volatility;
use crate::models::{Side, TradeResult, TradingSignal, UserAccount, UserId, UserSettingsUpdate};
use crate::notify::Notifier;
use crate::persistence::SharedStore;

/// Hourly candles per year, for annualizing volatility
const HOURS_PER_YEAR: f64 = 24.0 * 365.0;

/// Why a signal was turned away
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    TradingPaused,
    MaxOpenPositions { open: usize, max: usize },
    Drawdown(DrawdownStage),
    Volatility { value: f64, limit: f64 },
    Liquidity { available: f64, required: f64 },
    SizeTooSmall,
    Allocation { percent: f64, limit: f64 },
    Correlation { correlated: usize, max: usize },
    InvalidSignal(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::TradingPaused => write!(f, "trading is paused"),
            RejectReason::MaxOpenPositions { open, max } => {
                write!(f, "maximum open positions reached ({}/{})", open, max)
            }
            RejectReason::Drawdown(stage) => write!(f, "drawdown {} forbids this trade", stage),
            RejectReason::Volatility { value, limit } => {
                write!(f, "volatility too high ({:.2}% > {:.2}%)", value, limit)
            }
            RejectReason::Liquidity { available, required } => write!(
                f,
                "insufficient liquidity ({:.2} < {:.2} required)",
                available, required
            ),
            RejectReason::SizeTooSmall => write!(f, "position size too small"),
            RejectReason::Allocation { percent, limit } => write!(
                f,
                "would exceed maximum allocation ({:.1}% > {:.1}%)",
                percent, limit
            ),
            RejectReason::Correlation { correlated, max } => write!(
                f,
                "high correlation with {} open positions (max {})",
                correlated, max
            ),
            RejectReason::InvalidSignal(msg) => write!(f, "invalid signal: {}", msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Accepted(TradingSignal),
    Rejected(RejectReason),
}

/// Staged admission control over per-user risk state
pub struct RiskGate {
    config: RiskConfig,
    store: SharedStore,
    feed: Arc<dyn MarketFeed>,
    notifier: Arc<dyn Notifier>,
    states: RwLock<HashMap<UserId, Arc<Mutex<UserRiskState>>>>,
    correlations: RwLock<CorrelationTable>,
}

impl RiskGate {
    pub fn new(
        config: RiskConfig,
        store: SharedStore,
        feed: Arc<dyn MarketFeed>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            store,
            feed,
            notifier,
            states: RwLock::new(HashMap::new()),
            correlations: RwLock::new(CorrelationTable::new()),
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    async fn entry(&self, user_id: UserId) -> Arc<Mutex<UserRiskState>> {
        if let Some(entry) = self.states.read().await.get(&user_id) {
            return entry.clone();
        }
        self.states
            .write()
            .await
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(UserRiskState::new(user_id))))
            .clone()
    }

    /// Reload equity and holdings when stale (or always, with `force`)
    ///
    /// A failed reload keeps the previous state if there is one.
    async fn refresh(&self, state: &mut UserRiskState, fallback_equity: Option<f64>, force: bool) -> Result<()> {
        let now = Utc::now();
        if !force && !state.is_stale(now, self.config.refresh_secs) {
            return Ok(());
        }

        let loaded = async {
            let equity = match self.store.get_user(state.user_id).await? {
                Some(user) => user.equity,
                None => fallback_equity
                    .ok_or_else(|| TradeError::NotFound(format!("user {}", state.user_id)))?,
            };
            let positions = self.store.open_positions(state.user_id).await?;
            Ok::<_, TradeError>((equity, positions))
        }
        .await;

        match loaded {
            Ok((equity, positions)) => {
                let market = self.correlations.read().await;
                let previous = state.stage;
                state.refresh(equity, &positions, &market, &self.config.drawdown_thresholds, now);
                if state.stage != previous {
                    tracing::warn!(
                        user_id = state.user_id,
                        "Drawdown moved from {} to {} ({:.2}% below peak)",
                        previous,
                        state.stage,
                        state.equity.drawdown_percent()
                    );
                }
                Ok(())
            }
            Err(e) if state.last_updated.is_some() => {
                tracing::warn!(user_id = state.user_id, "Risk state refresh failed, using cached state: {}", e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Reload one user's risk state now
    pub async fn refresh_user(&self, user_id: UserId) -> Result<()> {
        let entry = self.entry(user_id).await;
        let mut state = entry.lock().await;
        self.refresh(&mut state, None, true).await
    }

    async fn snapshot_state(&self, user: &UserAccount) -> Result<UserRiskState> {
        let entry = self.entry(user.id).await;
        let mut state = entry.lock().await;
        self.refresh(&mut state, Some(user.equity), false).await?;
        Ok(state.clone())
    }

    /// Admit, resize, or drop a signal; `None` means "no trade"
    pub async fn validate_signal(&self, user: &UserAccount, signal: &TradingSignal) -> Option<TradingSignal> {
        match self.evaluate_signal(user, signal).await {
            Ok(Admission::Accepted(adjusted)) => {
                tracing::info!(
                    user_id = user.id,
                    symbol = %adjusted.symbol,
                    "✅ Validated signal: {} {:.6} @ {:?}",
                    adjusted.side,
                    adjusted.quantity,
                    adjusted.price
                );
                Some(adjusted)
            }
            Ok(Admission::Rejected(reason)) => {
                tracing::info!(user_id = user.id, symbol = %signal.symbol, "Signal rejected: {}", reason);
                None
            }
            Err(e) => {
                tracing::warn!(user_id = user.id, symbol = %signal.symbol, "Error validating signal: {}", e);
                None
            }
        }
    }

    /// The admission sequence with a typed outcome
    ///
    /// `Err` is reserved for failures reading state or market data.
    pub async fn evaluate_signal(&self, user: &UserAccount, signal: &TradingSignal) -> Result<Admission> {
        if user.trading_paused {
            return Ok(Admission::Rejected(RejectReason::TradingPaused));
        }
        if !signal.quantity.is_finite() || signal.quantity < 0.0 {
            return Ok(Admission::Rejected(RejectReason::InvalidSignal(format!(
                "quantity {}",
                signal.quantity
            ))));
        }

        let state = self.snapshot_state(user).await?;
        let closing = state.closing_target(&signal.symbol, signal.side).cloned();

        if closing.is_none() && state.positions.len() >= self.config.max_open_positions {
            return Ok(Admission::Rejected(RejectReason::MaxOpenPositions {
                open: state.positions.len(),
                max: self.config.max_open_positions,
            }));
        }

        if !state.stage.allows_exits() || (closing.is_none() && !state.stage.allows_entries()) {
            return Ok(Admission::Rejected(RejectReason::Drawdown(state.stage)));
        }

        let price = match signal.price {
            Some(p) if p > 0.0 => p,
            Some(p) => {
                return Ok(Admission::Rejected(RejectReason::InvalidSignal(format!("price {}", p))))
            }
            None => self.feed.ticker(&signal.symbol).await?.price,
        };

        // Exits are never blocked by market conditions or portfolio limits
        if let Some(held) = closing {
            let requested = if signal.quantity > 0.0 { signal.quantity } else { held.quantity };
            let quantity = requested.min(held.quantity);
            if quantity <= 0.0 {
                return Ok(Admission::Rejected(RejectReason::SizeTooSmall));
            }
            let mut adjusted = signal.clone();
            adjusted.quantity = quantity;
            adjusted.price = Some(price);
            return Ok(Admission::Accepted(adjusted));
        }

        let volatility = self.current_volatility(&signal.symbol).await?;
        let limit = self.config.volatility_limits.get(user.risk_level);
        if volatility > limit {
            return Ok(Admission::Rejected(RejectReason::Volatility { value: volatility, limit }));
        }

        let book = self
            .feed
            .orderbook(&signal.symbol, self.config.orderbook_depth)
            .await?;
        let available = book.liquidity_within(self.config.liquidity_band_percent);
        let required = self.config.liquidity_multiplier * signal.quantity * price;
        if available < required {
            return Ok(Admission::Rejected(RejectReason::Liquidity { available, required }));
        }

        let balance = if user.balance > 0.0 { user.balance } else { state.equity.current };
        let risk_percent = self.config.risk_percent.get(user.risk_level)
            * state
                .stage
                .sizing_multiplier(self.config.stage1_multiplier, self.config.stage2_multiplier);
        let quantity = position_size(
            &SizingInput {
                balance,
                risk_percent,
                price,
                stop_loss: signal.stop_loss,
                max_position_percent: self.max_position_percent(user),
            },
            &signal.symbol,
        );
        if quantity <= 0.0 {
            return Ok(Admission::Rejected(RejectReason::SizeTooSmall));
        }

        let mut adjusted = signal.clone();
        adjusted.quantity = quantity;
        adjusted.price = Some(price);
        let (stop_loss, take_profit) = self.default_exits(user, signal.side, price);
        adjusted.stop_loss = adjusted.stop_loss.or(Some(stop_loss));
        adjusted.take_profit = adjusted.take_profit.or(Some(take_profit));

        let equity = if state.equity.current > 0.0 { state.equity.current } else { user.equity };
        let allocation = if equity > 0.0 {
            (state.total_notional() + adjusted.notional()) / equity * 100.0
        } else {
            f64::INFINITY
        };
        if allocation > self.config.max_allocation_percent {
            return Ok(Admission::Rejected(RejectReason::Allocation {
                percent: allocation,
                limit: self.config.max_allocation_percent,
            }));
        }

        let correlated = self.correlated_positions(&state, &adjusted).await;
        if correlated > self.config.max_correlated_positions {
            return Ok(Admission::Rejected(RejectReason::Correlation {
                correlated,
                max: self.config.max_correlated_positions,
            }));
        }

        Ok(Admission::Accepted(adjusted))
    }

    async fn current_volatility(&self, symbol: &str) -> Result<f64> {
        let candles = self
            .feed
            .klines(symbol, "1h", self.config.volatility_candles)
            .await?;
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        Ok(annualized_volatility(&closes, HOURS_PER_YEAR))
    }

    fn max_position_percent(&self, user: &UserAccount) -> f64 {
        user.max_position_size_percent
            .unwrap_or(self.config.max_position_size_percent)
    }

    fn default_exits(&self, user: &UserAccount, side: Side, price: f64) -> (f64, f64) {
        let sl = self.config.stop_loss_percent.get(user.risk_level) / 100.0;
        let tp = self.config.take_profit_percent.get(user.risk_level) / 100.0;
        match side {
            Side::Buy => (price * (1.0 - sl), price * (1.0 + tp)),
            Side::Sell => (price * (1.0 + sl), price * (1.0 - tp)),
        }
    }

    /// Open positions in other symbols whose correlation with the signal's
    /// symbol exceeds the threshold
    async fn correlated_positions(&self, state: &UserRiskState, signal: &TradingSignal) -> usize {
        let market = self.correlations.read().await;
        state
            .positions
            .keys()
            .filter(|symbol| **symbol != signal.symbol)
            .filter(|symbol| {
                let coefficient = state
                    .correlations
                    .get(&signal.symbol, symbol)
                    .or_else(|| market.get(&signal.symbol, symbol))
                    .unwrap_or(self.config.default_correlation);
                coefficient > self.config.correlation_threshold
            })
            .count()
    }

    pub async fn get_drawdown_stage(&self, user_id: UserId) -> DrawdownStage {
        let entry = self.entry(user_id).await;
        let mut state = entry.lock().await;
        if let Err(e) = self.refresh(&mut state, None, false).await {
            tracing::warn!(user_id, "Could not refresh risk state: {}", e);
        }
        state.stage
    }

    /// Largest quantity of `symbol` the user may hold right now
    pub async fn get_max_position_size(&self, user_id: UserId, symbol: &str) -> Result<f64> {
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| TradeError::NotFound(format!("user {}", user_id)))?;
        let price = self.feed.ticker(symbol).await?.price;
        let quantity = max_position_quantity(user.balance, self.max_position_percent(&user), price);
        Ok(round_quantity(quantity, symbol))
    }

    /// Fold an executed trade into the user's holdings
    pub async fn record_fill(&self, user_id: UserId, signal: &TradingSignal, result: &TradeResult) {
        if !result.success {
            return;
        }
        let entry = self.entry(user_id).await;
        let mut state = entry.lock().await;
        state.apply_fill(&result.symbol, result.side, result.price, result.quantity, &signal.strategy);
    }

    /// Replace the market-wide correlation table
    pub async fn update_correlations(&self, table: CorrelationTable) {
        tracing::debug!("Correlation table updated with {} pairs", table.len());
        *self.correlations.write().await = table;
    }

    pub async fn correlation(&self, a: &str, b: &str) -> f64 {
        self.correlations
            .read()
            .await
            .get_or(a, b, self.config.default_correlation)
    }

    pub async fn portfolio_snapshot(&self, user_id: UserId) -> Option<RiskSnapshot> {
        let entry = self.states.read().await.get(&user_id).cloned()?;
        let state = entry.lock().await;
        Some(state.snapshot())
    }

    /// Invalidate every cached risk state so the next access reloads
    /// holdings; equity peaks survive so a drawdown stage cannot reset
    pub async fn clear_state(&self) -> usize {
        let entries: Vec<Arc<Mutex<UserRiskState>>> = self.states.read().await.values().cloned().collect();
        for entry in &entries {
            entry.lock().await.invalidate();
        }
        entries.len()
    }

    /// Users with cached risk state, ascending
    pub async fn tracked_user_ids(&self) -> Vec<UserId> {
        let mut ids: Vec<UserId> = self.states.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Sweep every user with open positions: metrics, actions, protective
    /// shrink on high severity, one notification per user
    pub async fn assess_portfolio_risk(&self) -> Result<Vec<PortfolioAssessment>> {
        let positions = self.store.active_positions().await?;
        let users: BTreeSet<UserId> = positions.iter().map(|p| p.user_id).collect();

        let mut results = Vec::with_capacity(users.len());
        for user_id in users {
            match self.assess_user(user_id).await {
                Ok(Some(assessment)) => results.push(assessment),
                Ok(None) => {}
                Err(e) => tracing::error!(user_id, "Error assessing portfolio risk: {}", e),
            }
        }

        let high_risk = results.iter().filter(|r| r.has_high_severity()).count();
        tracing::info!(
            "Risk Assessment Summary: {} users evaluated, {} high-risk",
            results.len(),
            high_risk
        );
        Ok(results)
    }

    async fn assess_user(&self, user_id: UserId) -> Result<Option<PortfolioAssessment>> {
        let Some(user) = self.store.get_user(user_id).await? else {
            tracing::warn!(user_id, "User not found during risk assessment");
            return Ok(None);
        };

        let (metrics, actions) = {
            let entry = self.entry(user_id).await;
            let mut state = entry.lock().await;
            self.refresh(&mut state, Some(user.equity), true).await?;
            let metrics = PortfolioMetrics::from_state(&state, self.config.default_correlation);
            let actions = determine_actions(&metrics, state.equity.current, &self.config);
            (metrics, actions)
        };

        let mut assessment = PortfolioAssessment {
            user_id,
            timestamp: Utc::now(),
            metrics,
            actions,
            protective_applied: false,
        };

        if assessment.has_high_severity() {
            assessment.protective_applied = self.apply_protective_window(&user).await?;
        }

        if let Some(message) = risk_notification(&assessment.actions) {
            self.notifier.send_notification(user_id, &message, "risk_management");
            tracing::info!(user_id, "Implemented {} risk management actions", assessment.actions.len());
        }

        Ok(Some(assessment))
    }

    /// Shrink the user's max position size unless a window is already open
    async fn apply_protective_window(&self, user: &UserAccount) -> Result<bool> {
        let now = Utc::now();
        if user.risk_reduction_until.is_some_and(|until| until > now) {
            tracing::debug!(user_id = user.id, "Protective window already active");
            return Ok(false);
        }

        let hours = self.config.protective_window_hours;
        let until = chrono_secs(hours.saturating_mul(3_600))
            .and_then(|window| now.checked_add_signed(window))
            .ok_or_else(|| TradeError::InvalidInput(format!("protective window of {} hours is out of range", hours)))?;

        let reduced = self.max_position_percent(user) * self.config.protective_shrink;
        let update = UserSettingsUpdate {
            max_position_size_percent: Some(reduced),
            risk_reduction_until: Some(until),
            ..Default::default()
        };
        self.store.update_user_settings(user.id, &update).await?;

        tracing::warn!(
            user_id = user.id,
            "🛡️ Protective window opened: max position size now {:.2}%",
            reduced
        );
        Ok(true)
    }
}
