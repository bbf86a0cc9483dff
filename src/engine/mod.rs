// Trading orchestration loop: users -> strategies -> risk gate -> execution
pub mod handle;
pub mod status;

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use uuid::Uuid;

use crate::config::{chrono_secs, EngineConfig};
use crate::error::{with_deadline, ErrorKind, Result, TradeError};
use crate::exchange::{Exchange, ExchangeFactory, MarketFeed};
use crate::models::{
    MarketData, Position, Side, TradeResult, TradingSignal, UserAccount, UserId,
};
use crate::notify::Notifier;
use crate::persistence::{RedisMarketCache, SharedStore};
use crate::risk::{Admission, CorrelationTable, RiskGate};
use crate::strategy::{Strategy, StrategyFactory};

pub use handle::EngineHandle;
pub use status::{
    backoff_delay, EngineStatus, ErrorTracker, HealthStatus, RiskExposureReport,
    StrategyPerformance,
};

/// Collaborators the loop drives
#[derive(Clone)]
pub struct EngineDeps {
    pub store: SharedStore,
    pub exchanges: Arc<dyn ExchangeFactory>,
    pub strategies: Arc<dyn StrategyFactory>,
    pub market: Arc<dyn MarketFeed>,
    pub risk: Arc<RiskGate>,
    pub notifier: Arc<dyn Notifier>,
    pub cache: Option<RedisMarketCache>,
}

/// Caches and counters behind the loop's single lock
#[derive(Default)]
struct EngineState {
    users: Vec<UserAccount>,
    users_refreshed_at: Option<DateTime<Utc>>,
    exchanges: HashMap<UserId, Arc<dyn Exchange>>,
    strategies: HashMap<UserId, Vec<Arc<dyn Strategy>>>,
    errors: ErrorTracker,
}

pub struct TradingEngine {
    config: EngineConfig,
    deps: EngineDeps,
    state: Mutex<EngineState>,
    market_data: RwLock<Arc<MarketData>>,
    running: AtomicBool,
    paused: AtomicBool,
    health: StdRwLock<HealthStatus>,
    consecutive_errors: AtomicU32,
    /// Unix millis of the last loop iteration
    last_activity: AtomicI64,
    shutdown: Notify,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TradingEngine {
    pub fn new(config: EngineConfig, deps: EngineDeps) -> Self {
        Self {
            config,
            deps,
            state: Mutex::new(EngineState::default()),
            market_data: RwLock::new(Arc::new(MarketData::default())),
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            health: StdRwLock::new(HealthStatus::Initializing),
            consecutive_errors: AtomicU32::new(0),
            last_activity: AtomicI64::new(Utc::now().timestamp_millis()),
            shutdown: Notify::new(),
            handle: Mutex::new(None),
        }
    }

    fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.config.exchange_call_timeout_secs)
    }

    pub fn health(&self) -> HealthStatus {
        *self.health.read().unwrap_or_else(|p| p.into_inner())
    }

    fn set_health(&self, status: HealthStatus) {
        *self.health.write().unwrap_or_else(|p| p.into_inner()) = status;
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_activity.load(Ordering::SeqCst))
            .unwrap_or_else(Utc::now)
    }

    fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Spawn the loop; a second call while running is a no-op
    pub async fn start(self: &Arc<Self>) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("Trading engine is already running");
            return false;
        }
        self.set_health(HealthStatus::Starting);
        self.touch();

        let engine = self.clone();
        let handle = tokio::spawn(async move { engine.run_loop().await });
        *self.handle.lock().await = Some(handle);

        tracing::info!("🚀 Trading engine started");
        true
    }

    /// Signal the loop, wait for it (bounded), then close every exchange binding
    pub async fn stop(&self) -> bool {
        if !self.running.swap(false, Ordering::SeqCst) {
            tracing::warn!("Trading engine is not running");
            return false;
        }
        self.set_health(HealthStatus::Stopping);
        self.shutdown.notify_one();

        if let Some(handle) = self.handle.lock().await.take() {
            let limit = Duration::from_secs(self.config.stop_timeout_secs);
            let abort = handle.abort_handle();
            if timeout(limit, handle).await.is_err() {
                tracing::warn!("Trading loop did not exit within {:?}, aborting", limit);
                abort.abort();
            }
        }

        self.close_exchanges().await;
        self.set_health(HealthStatus::Stopped);
        tracing::info!("🛑 Trading engine stopped");
        true
    }

    pub fn pause(&self) -> bool {
        if !self.is_running() || self.paused.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.set_health(HealthStatus::Paused);
        tracing::info!("⏸️  Trading engine paused");
        true
    }

    pub fn resume(&self) -> bool {
        if !self.is_running() || !self.paused.swap(false, Ordering::SeqCst) {
            return false;
        }
        self.set_health(HealthStatus::Running);
        tracing::info!("▶️  Trading engine resumed");
        true
    }

    async fn close_exchanges(&self) {
        let bindings: Vec<(UserId, Arc<dyn Exchange>)> = {
            let mut state = self.state.lock().await;
            state.strategies.clear();
            state.exchanges.drain().collect()
        };
        for (user_id, exchange) in bindings {
            if let Err(e) = exchange.close().await {
                tracing::warn!(user_id, "Error closing exchange binding: {}", e);
            }
        }
    }

    /// Sleep unless a stop arrives first; returns false when stopping
    async fn pause_for(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = sleep(duration) => self.is_running(),
            _ = self.shutdown.notified() => false,
        }
    }

    async fn run_loop(self: Arc<Self>) {
        self.set_health(HealthStatus::Running);
        let interval = Duration::from_secs(self.config.iteration_interval_secs);

        while self.is_running() {
            self.touch();

            if self.is_paused() {
                if !self.pause_for(interval).await {
                    break;
                }
                continue;
            }

            let delay = match self.run_iteration().await {
                Ok(()) => {
                    self.consecutive_errors.store(0, Ordering::SeqCst);
                    if self.health() == HealthStatus::Degraded {
                        tracing::info!("Trading engine recovered");
                        self.set_health(HealthStatus::Running);
                    }
                    interval
                }
                Err(e) => self.on_iteration_error(&e).await,
            };

            if !self.pause_for(delay).await {
                break;
            }
        }
        tracing::info!("Trading loop exited");
    }

    async fn on_iteration_error(&self, error: &TradeError) -> Duration {
        let errors = self.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.lock().await.errors.record(error.to_string());

        match error.kind() {
            ErrorKind::Fatal => tracing::error!("Fatal error in trading loop: {}", error),
            _ => tracing::error!("Error in trading loop ({} consecutive): {}", errors, error),
        }

        if errors >= self.config.degraded_after_errors && self.health() != HealthStatus::Degraded {
            self.set_health(HealthStatus::Degraded);
            tracing::error!("Trading engine health degraded after {} consecutive errors", errors);
        }

        backoff_delay(errors, self.config.base_backoff_secs, self.config.max_backoff_secs)
    }

    // ========================================================================
    // Iteration
    // ========================================================================

    /// One pass over every active user; the first failure is returned after
    /// all users have been visited
    pub async fn run_iteration(&self) -> Result<()> {
        self.refresh_users_if_due().await;
        self.refresh_market_if_due().await;

        let users: Vec<UserAccount> = self.state.lock().await.users.clone();
        let mut first_error = None;

        for user in users.iter().filter(|u| u.active) {
            if user.trading_paused {
                tracing::debug!(user_id = user.id, "Trading paused, skipping user");
                continue;
            }
            if let Err(e) = self.process_user(user).await {
                tracing::warn!(user_id = user.id, "Error processing user: {}", e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn refresh_users_if_due(&self) {
        let due = {
            let state = self.state.lock().await;
            is_due(state.users_refreshed_at, self.config.user_refresh_secs)
        };
        if !due {
            return;
        }

        match self.deps.store.active_users().await {
            Ok(users) => {
                let mut state = self.state.lock().await;
                let active: Vec<UserId> = users.iter().map(|u| u.id).collect();
                state.strategies.retain(|id, _| active.contains(id));
                tracing::debug!("Loaded {} active users", users.len());
                state.users = users;
                state.users_refreshed_at = Some(Utc::now());
            }
            Err(e) => {
                let mut state = self.state.lock().await;
                tracing::warn!(
                    "User refresh failed, reusing {} cached users: {}",
                    state.users.len(),
                    e
                );
                state.errors.record(format!("user refresh: {}", e));
            }
        }
    }

    async fn refresh_market_if_due(&self) {
        let due = is_due(self.market_data.read().await.updated_at, self.config.market_refresh_secs);
        if due {
            if let Err(e) = self.refresh_market_data().await {
                tracing::warn!("Market data refresh failed, keeping cached data: {}", e);
            }
        }
    }

    /// Pull tickers and candles for the configured symbols and push a fresh
    /// correlation table into the risk gate
    pub async fn refresh_market_data(&self) -> Result<()> {
        let previous = self.market_data.read().await.clone();
        let mut next = MarketData::default();
        let mut refreshed = 0;
        let mut last_error = None;

        for symbol in &self.config.market_symbols {
            let fetched = async {
                let ticker = with_deadline("ticker", self.call_timeout(), self.deps.market.ticker(symbol)).await?;
                let candles = with_deadline(
                    "klines",
                    self.call_timeout(),
                    self.deps
                        .market
                        .klines(symbol, &self.config.candle_interval, self.config.candle_limit),
                )
                .await?;
                Ok::<_, TradeError>((ticker, candles))
            }
            .await;

            match fetched {
                Ok((ticker, candles)) => {
                    if let Some(cache) = &self.deps.cache {
                        let cached = async {
                            cache.put_ticker(&ticker).await?;
                            cache.put_candles(symbol, &self.config.candle_interval, &candles).await
                        };
                        if let Err(e) = cached.await {
                            tracing::debug!(symbol = %symbol, "Redis cache write failed: {}", e);
                        }
                    }
                    next.tickers.insert(symbol.clone(), ticker);
                    next.candles.insert(symbol.clone(), candles);
                    refreshed += 1;
                }
                Err(e) => {
                    tracing::warn!(symbol = %symbol, "Market data fetch failed: {}", e);
                    if let Some(t) = previous.tickers.get(symbol) {
                        next.tickers.insert(symbol.clone(), t.clone());
                    }
                    if let Some(c) = previous.candles.get(symbol) {
                        next.candles.insert(symbol.clone(), c.clone());
                    }
                    last_error = Some(e);
                }
            }
        }

        if refreshed == 0 {
            if let Some(e) = last_error {
                return Err(e);
            }
        }

        let closes: HashMap<String, Vec<f64>> = next
            .candles
            .keys()
            .map(|symbol| (symbol.clone(), next.closes(symbol)))
            .collect();
        self.deps
            .risk
            .update_correlations(CorrelationTable::from_closes(&closes))
            .await;

        next.updated_at = Some(Utc::now());
        *self.market_data.write().await = Arc::new(next);
        tracing::debug!("Market data refreshed for {} symbols", refreshed);
        Ok(())
    }

    pub async fn market_data(&self) -> Arc<MarketData> {
        self.market_data.read().await.clone()
    }

    /// Cached binding for a user, created and initialized on first use
    async fn exchange_for(&self, user: &UserAccount) -> Result<Arc<dyn Exchange>> {
        if let Some(exchange) = self.state.lock().await.exchanges.get(&user.id) {
            return Ok(exchange.clone());
        }

        let credentials = self.deps.store.credentials(user.id).await?;
        let exchange = self.deps.exchanges.create(user, credentials.as_ref())?;
        with_deadline("initialize", self.call_timeout(), exchange.initialize()).await?;
        tracing::info!(user_id = user.id, "Exchange binding created ({})", exchange.name());

        Ok(self
            .state
            .lock()
            .await
            .exchanges
            .entry(user.id)
            .or_insert(exchange)
            .clone())
    }

    async fn strategies_for(&self, user: &UserAccount) -> Vec<Arc<dyn Strategy>> {
        let mut state = self.state.lock().await;
        state
            .strategies
            .entry(user.id)
            .or_insert_with(|| {
                let set = self.deps.strategies.strategies_for(user);
                tracing::debug!(user_id = user.id, "Loaded {} strategies", set.len());
                set
            })
            .clone()
    }

    async fn process_user(&self, user: &UserAccount) -> Result<()> {
        let exchange = self.exchange_for(user).await?;
        let strategies = self.strategies_for(user).await;
        let market = self.market_data().await;
        let mut first_error = None;

        for strategy in strategies {
            let generated = with_deadline(
                "generate_signals",
                self.call_timeout(),
                strategy.generate_signals(exchange.as_ref(), &market),
            )
            .await;

            let signals = match generated {
                Ok(signals) => signals,
                Err(e) => {
                    tracing::warn!(user_id = user.id, strategy = strategy.name(), "Signal generation failed: {}", e);
                    first_error.get_or_insert(e);
                    continue;
                }
            };

            for signal in signals {
                if let Err(e) = self.process_signal(user, exchange.as_ref(), signal).await {
                    if e.kind() == ErrorKind::Rejection {
                        tracing::debug!(user_id = user.id, "{}", e);
                    } else {
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Gate, execute, record, notify
    async fn process_signal(&self, user: &UserAccount, exchange: &dyn Exchange, signal: TradingSignal) -> Result<()> {
        let validated = match self.deps.risk.evaluate_signal(user, &signal).await? {
            Admission::Accepted(validated) => validated,
            Admission::Rejected(reason) => {
                tracing::info!(user_id = user.id, symbol = %signal.symbol, "Signal rejected: {}", reason);
                return Ok(());
            }
        };

        let result = with_deadline("execute_trade", self.call_timeout(), exchange.execute_trade(&validated)).await?;
        if !result.success {
            tracing::warn!(
                user_id = user.id,
                symbol = %validated.symbol,
                "Trade execution failed: {}",
                result.message.as_deref().unwrap_or("unknown")
            );
            return Ok(());
        }

        self.deps.risk.record_fill(user.id, &validated, &result).await;
        let profit = self.apply_to_positions(user.id, &validated, &result).await?;
        self.deps
            .store
            .record_trade(user.id, &result, &validated, profit)
            .await?;

        self.deps.notifier.send_notification(
            user.id,
            &format!(
                "{} {} {:.6} @ {:.4} ({})",
                result.side, result.symbol, result.quantity, result.price, validated.strategy
            ),
            "trade_executed",
        );
        tracing::info!(
            user_id = user.id,
            symbol = %result.symbol,
            "💹 Executed {} {:.6} @ {:.4}",
            result.side,
            result.quantity,
            result.price
        );
        Ok(())
    }

    /// Open or reduce positions for a fill; returns realized profit for closes
    async fn apply_to_positions(&self, user_id: UserId, signal: &TradingSignal, result: &TradeResult) -> Result<Option<f64>> {
        let open = self.deps.store.open_positions(user_id).await?;
        let closing = open
            .iter()
            .find(|p| p.symbol == result.symbol && p.side == result.side.opposite());

        match closing {
            Some(position) => {
                let profit = self
                    .deps
                    .store
                    .record_position_close(position.id, result.price, result.quantity)
                    .await?;
                Ok(Some(profit))
            }
            None => {
                let position = Position {
                    id: Uuid::new_v4(),
                    user_id,
                    symbol: result.symbol.clone(),
                    side: result.side,
                    entry_price: result.price,
                    quantity: result.quantity,
                    strategy: signal.strategy.clone(),
                    stop_loss: signal.stop_loss,
                    take_profit: signal.take_profit,
                    opened_at: result.timestamp,
                };
                self.deps.store.open_position(&position).await?;
                Ok(None)
            }
        }
    }

    // ========================================================================
    // Operations driven by the scheduler and the supervisor
    // ========================================================================

    pub async fn get_status(&self) -> EngineStatus {
        let state = self.state.lock().await;
        let now = Utc::now();
        let market_updated = self.market_data.read().await.updated_at;

        EngineStatus {
            running: self.is_running(),
            paused: self.is_paused(),
            health: self.health(),
            active_users: state.users.len(),
            active_exchanges: state.exchanges.len(),
            active_strategies: state.strategies.values().map(Vec::len).sum(),
            user_data_age_secs: state.users_refreshed_at.map(|t| (now - t).num_seconds()),
            market_data_age_secs: market_updated.map(|t| (now - t).num_seconds()),
            consecutive_errors: self.consecutive_errors(),
            last_error: state.errors.most_common(),
            last_activity: self.last_activity(),
        }
    }

    /// Drop cached market data and risk state and force a user reload on the
    /// next iteration; the user list itself stays as a fallback
    pub async fn clear_caches(&self) {
        *self.market_data.write().await = Arc::new(MarketData::default());
        self.state.lock().await.users_refreshed_at = None;
        let states = self.deps.risk.clear_state().await;
        tracing::info!("Engine caches cleared ({} risk states dropped)", states);
    }

    /// Close and recreate every cached binding with the same credentials
    pub async fn reconnect_exchanges(&self) -> usize {
        let bindings: Vec<(UserId, Arc<dyn Exchange>)> = {
            let state = self.state.lock().await;
            state
                .exchanges
                .iter()
                .map(|(id, ex)| (*id, ex.clone()))
                .collect()
        };

        let mut reconnected = 0;
        for (user_id, old) in bindings {
            let rebuilt = async {
                let user = self
                    .deps
                    .store
                    .get_user(user_id)
                    .await?
                    .ok_or_else(|| TradeError::NotFound(format!("user {}", user_id)))?;
                let credentials = self.deps.store.credentials(user_id).await?;
                if let Err(e) = old.close().await {
                    tracing::debug!(user_id, "Closing stale binding failed: {}", e);
                }
                let fresh = self.deps.exchanges.create(&user, credentials.as_ref())?;
                with_deadline("initialize", self.call_timeout(), fresh.initialize()).await?;
                Ok::<_, TradeError>(fresh)
            }
            .await;

            match rebuilt {
                Ok(fresh) => {
                    self.state.lock().await.exchanges.insert(user_id, fresh);
                    reconnected += 1;
                    tracing::info!(user_id, "Reestablished exchange connection");
                }
                Err(e) => {
                    self.state.lock().await.exchanges.remove(&user_id);
                    tracing::error!(user_id, "Exchange reconnection error: {}", e);
                }
            }
        }
        reconnected
    }

    /// Soft reset without a stop/start cycle
    pub async fn reset_engine(&self) -> bool {
        tracing::info!("Initiating trading engine reset");
        self.clear_caches().await;
        self.state.lock().await.errors.clear();
        self.consecutive_errors.store(0, Ordering::SeqCst);

        if let Err(e) = self.deps.store.ping().await {
            tracing::error!("Engine reset failed, store unreachable: {}", e);
            self.set_health(HealthStatus::Degraded);
            return false;
        }

        let reconnected = self.reconnect_exchanges().await;
        if self.is_running() {
            let next = if self.is_paused() { HealthStatus::Paused } else { HealthStatus::Running };
            self.set_health(next);
        }
        tracing::info!("Trading engine reset completed ({} bindings reconnected)", reconnected);
        true
    }

    /// Per-strategy win rate and average profit over the configured window
    pub async fn evaluate_strategies(&self) -> Result<BTreeMap<String, StrategyPerformance>> {
        let days = self.config.trade_history_days;
        let since = chrono_secs(days.saturating_mul(86_400))
            .and_then(|window| Utc::now().checked_sub_signed(window))
            .ok_or_else(|| TradeError::InvalidInput(format!("trade history window of {} days is out of range", days)))?;
        let trades = self.deps.store.trades_since(since).await?;

        let mut grouped: BTreeMap<String, Vec<_>> = BTreeMap::new();
        for trade in trades {
            grouped.entry(trade.strategy.clone()).or_default().push(trade);
        }

        let mut metrics = BTreeMap::new();
        for (strategy, trades) in grouped {
            let profits: Vec<f64> = trades
                .iter()
                .filter_map(|t| {
                    let notional = t.price * t.quantity;
                    t.profit.filter(|_| notional > 0.0).map(|p| p / notional * 100.0)
                })
                .collect();
            let wins = profits.iter().filter(|p| **p > 0.0).count();

            let performance = StrategyPerformance {
                win_rate: if profits.is_empty() { 0.0 } else { wins as f64 / profits.len() as f64 * 100.0 },
                avg_profit: if profits.is_empty() { 0.0 } else { profits.iter().sum::<f64>() / profits.len() as f64 },
                trade_count: trades.len(),
            };
            tracing::info!(
                "Strategy evaluation - {}: win_rate={:.2}%, avg_profit={:.2}%, trades={}",
                strategy,
                performance.win_rate,
                performance.avg_profit,
                performance.trade_count
            );
            metrics.insert(strategy, performance);
        }
        Ok(metrics)
    }

    /// Book-wide exposure across all users
    pub async fn check_risk_exposure(&self) -> Result<RiskExposureReport> {
        let positions = self.deps.store.active_positions().await?;
        if positions.is_empty() {
            tracing::info!("No active positions for risk assessment");
            return Ok(RiskExposureReport::default());
        }

        let high_risk = self
            .deps
            .store
            .positions_at_risk(self.config.at_risk_threshold_percent)
            .await?;

        let mut per_user: HashMap<UserId, f64> = HashMap::new();
        for p in &positions {
            *per_user.entry(p.user_id).or_default() += p.notional();
        }

        let report = RiskExposureReport {
            total_exposure: positions.iter().map(Position::notional).sum(),
            positions_count: positions.len(),
            high_risk_positions: high_risk.len(),
            users_at_risk: per_user
                .values()
                .filter(|exposure| **exposure > self.config.user_at_risk_exposure)
                .count(),
            max_drawdown_risk: max_drawdown_risk(&positions),
        };
        tracing::info!("Risk exposure: {:?}", report);
        Ok(report)
    }

    /// Close positions whose stop-loss or take-profit has been crossed;
    /// returns how many were closed
    pub async fn monitor_positions(&self) -> Result<usize> {
        let positions = self.deps.store.active_positions().await?;
        if positions.is_empty() {
            tracing::debug!("No active positions to monitor");
            return Ok(0);
        }

        let market = self.market_data().await;
        let mut closed = 0;
        for position in &positions {
            match self.monitor_position(position, &market).await {
                Ok(true) => closed += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(
                    user_id = position.user_id,
                    symbol = %position.symbol,
                    "Position monitoring failed: {}",
                    e
                ),
            }
        }

        tracing::info!("Completed monitoring {} active positions ({} closed)", positions.len(), closed);
        Ok(closed)
    }

    async fn monitor_position(&self, position: &Position, market: &MarketData) -> Result<bool> {
        let price = match market.tickers.get(&position.symbol) {
            Some(t) => t.price,
            None => with_deadline("ticker", self.call_timeout(), self.deps.market.ticker(&position.symbol))
                .await?
                .price,
        };

        let Some(reason) = exit_trigger(position, price) else {
            return Ok(false);
        };

        let user = self
            .deps
            .store
            .get_user(position.user_id)
            .await?
            .ok_or_else(|| TradeError::NotFound(format!("user {}", position.user_id)))?;
        let exchange = self.exchange_for(&user).await?;

        let signal = TradingSignal::market(
            position.symbol.clone(),
            position.side.opposite(),
            position.quantity,
            position.strategy.clone(),
        );
        let result = with_deadline("execute_trade", self.call_timeout(), exchange.execute_trade(&signal)).await?;
        if !result.success {
            return Err(TradeError::Exchange(
                result.message.unwrap_or_else(|| "close rejected".to_string()),
            ));
        }

        let profit = self
            .deps
            .store
            .record_position_close(position.id, result.price, result.quantity)
            .await?;
        self.deps
            .store
            .record_trade(position.user_id, &result, &signal, Some(profit))
            .await?;
        self.deps.risk.record_fill(position.user_id, &signal, &result).await;

        self.deps.notifier.send_notification(
            position.user_id,
            &format!(
                "{} hit on {} {}: closed {:.6} @ {:.4}, P&L {:+.2}",
                reason, position.side, position.symbol, result.quantity, result.price, profit
            ),
            "position_closed",
        );
        tracing::info!(
            user_id = position.user_id,
            symbol = %position.symbol,
            "🔔 {} triggered at {:.4}, P&L {:+.2}",
            reason,
            price,
            profit
        );
        Ok(true)
    }
}

fn is_due(last: Option<DateTime<Utc>>, every_secs: u64) -> bool {
    match (last, chrono_secs(every_secs)) {
        (None, _) => true,
        (Some(at), Some(every)) => Utc::now() - at >= every,
        (Some(_), None) => false,
    }
}

/// Which protective level `price` has crossed, if any
pub fn exit_trigger(position: &Position, price: f64) -> Option<&'static str> {
    let stop_hit = position.stop_loss.is_some_and(|sl| match position.side {
        Side::Buy => price <= sl,
        Side::Sell => price >= sl,
    });
    if stop_hit {
        return Some("Stop loss");
    }

    let target_hit = position.take_profit.is_some_and(|tp| match position.side {
        Side::Buy => price >= tp,
        Side::Sell => price <= tp,
    });
    target_hit.then_some("Take profit")
}

/// Stop-implied loss across positions as a percent of their notional; a
/// position without a stop counts its full notional
pub fn max_drawdown_risk(positions: &[Position]) -> f64 {
    let total: f64 = positions.iter().map(Position::notional).sum();
    if total <= 0.0 {
        return 0.0;
    }
    let potential_loss: f64 = positions
        .iter()
        .map(|p| match p.stop_loss {
            Some(stop) => p.loss_percent(stop).max(0.0) / 100.0 * p.notional(),
            None => p.notional(),
        })
        .sum();
    potential_loss / total * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiskConfig;
    use crate::exchange::{PaperExchangeFactory, StaticMarketFeed};
    use crate::models::RiskLevel;
    use crate::notify::QueuedNotifier;
    use crate::persistence::{MemoryStore, PositionRepository, TradeRepository};
    use async_trait::async_trait;

    /// Emits the same signal on every call, or fails when `signal` is `None`
    struct FixedStrategy {
        signal: Option<TradingSignal>,
    }

    #[async_trait]
    impl Strategy for FixedStrategy {
        fn name(&self) -> &str {
            "fixed"
        }

        fn allocation_percent(&self) -> f64 {
            100.0
        }

        async fn generate_signals(&self, _exchange: &dyn Exchange, _market: &MarketData) -> Result<Vec<TradingSignal>> {
            match &self.signal {
                Some(signal) => Ok(vec![signal.clone()]),
                None => Err(TradeError::Exchange("boom".to_string())),
            }
        }
    }

    struct FixedFactory(Vec<Arc<dyn Strategy>>);

    impl StrategyFactory for FixedFactory {
        fn strategies_for(&self, _user: &UserAccount) -> Vec<Arc<dyn Strategy>> {
            self.0.clone()
        }
    }

    struct Harness {
        engine: Arc<TradingEngine>,
        store: Arc<MemoryStore>,
        feed: Arc<StaticMarketFeed>,
        notifier: QueuedNotifier,
    }

    async fn harness(strategies: Vec<Arc<dyn Strategy>>, config: EngineConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        store.add_user(UserAccount::new(1, "alice", RiskLevel::Medium, 10_000.0)).await;

        let feed = Arc::new(StaticMarketFeed::new(&[
            ("BTC/USDT", 100.0),
            ("ETH/USDT", 100.0),
            ("SOL/USDT", 100.0),
        ]));
        let (notifier, _) = QueuedNotifier::spawn();
        let risk = Arc::new(RiskGate::new(
            RiskConfig::default(),
            store.clone(),
            feed.clone(),
            Arc::new(notifier.clone()),
        ));

        let deps = EngineDeps {
            store: store.clone(),
            exchanges: Arc::new(PaperExchangeFactory::new(feed.clone(), 0.0, 10_000.0)),
            strategies: Arc::new(FixedFactory(strategies)),
            market: feed.clone(),
            risk,
            notifier: Arc::new(notifier.clone()),
            cache: None,
        };

        Harness {
            engine: Arc::new(TradingEngine::new(config, deps)),
            store,
            feed,
            notifier,
        }
    }

    fn buy_btc() -> Arc<dyn Strategy> {
        Arc::new(FixedStrategy {
            signal: Some(TradingSignal::market("BTC/USDT", Side::Buy, 1.0, "fixed")),
        })
    }

    fn position(user_id: UserId, symbol: &str, quantity: f64, stop_loss: Option<f64>) -> Position {
        Position {
            id: Uuid::new_v4(),
            user_id,
            symbol: symbol.to_string(),
            side: Side::Buy,
            entry_price: 100.0,
            quantity,
            strategy: "fixed".to_string(),
            stop_loss,
            take_profit: None,
            opened_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let h = harness(vec![], EngineConfig::default()).await;

        assert!(h.engine.start().await);
        assert!(!h.engine.start().await);
        assert!(h.engine.is_running());

        assert!(h.engine.stop().await);
        assert!(!h.engine.stop().await);
        assert_eq!(h.engine.health(), HealthStatus::Stopped);
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let h = harness(vec![], EngineConfig::default()).await;
        assert!(!h.engine.pause(), "cannot pause a stopped engine");

        h.engine.start().await;
        assert!(h.engine.pause());
        assert!(!h.engine.pause());
        assert_eq!(h.engine.health(), HealthStatus::Paused);

        assert!(h.engine.resume());
        assert!(!h.engine.resume());
        assert!(!h.engine.is_paused());
        h.engine.stop().await;
    }

    #[tokio::test]
    async fn test_iteration_executes_and_records_signal() {
        let h = harness(vec![buy_btc()], EngineConfig::default()).await;

        h.engine.run_iteration().await.unwrap();

        let positions = h.store.open_positions(1).await.unwrap();
        assert_eq!(positions.len(), 1);
        // 2% of 10k risked at 100 without a stop
        assert!((positions[0].quantity - 2.0).abs() < 1e-9);
        assert!(positions[0].stop_loss.is_some());
        assert_eq!(h.store.trade_count().await, 1);

        let messages = h.notifier.user_messages(1);
        assert!(messages.iter().any(|(kind, _)| kind == "trade_executed"));

        let status = h.engine.get_status().await;
        assert_eq!(status.active_users, 1);
        assert_eq!(status.active_exchanges, 1);
        assert_eq!(status.active_strategies, 1);
        assert!(status.market_data_age_secs.is_some());
    }

    #[tokio::test]
    async fn test_user_cache_survives_store_outage() {
        let config = EngineConfig {
            user_refresh_secs: 0,
            ..Default::default()
        };
        let h = harness(vec![], config).await;
        h.engine.run_iteration().await.unwrap();

        h.store.set_available(false);
        h.engine.run_iteration().await.unwrap();

        let status = h.engine.get_status().await;
        assert_eq!(status.active_users, 1);
        assert!(status.last_error.unwrap().contains("user refresh"));
    }

    #[tokio::test]
    async fn test_monitor_closes_position_on_stop() {
        let h = harness(vec![], EngineConfig::default()).await;
        h.store
            .open_position(&position(1, "BTC/USDT", 1.0, Some(95.0)))
            .await
            .unwrap();
        h.store
            .open_position(&position(1, "ETH/USDT", 1.0, Some(95.0)))
            .await
            .unwrap();
        h.feed.set_price("BTC/USDT", 90.0);

        assert_eq!(h.engine.monitor_positions().await.unwrap(), 1);

        let open = h.store.open_positions(1).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].symbol, "ETH/USDT");

        let since = Utc::now() - chrono::Duration::minutes(1);
        let trades = h.store.trades_since(since).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert!((trades[0].profit.unwrap() + 10.0).abs() < 1e-9);
        assert!(h
            .notifier
            .user_messages(1)
            .iter()
            .any(|(kind, _)| kind == "position_closed"));
    }

    #[test]
    fn test_exit_trigger_sides() {
        let long = Position {
            take_profit: Some(110.0),
            ..position(1, "BTC/USDT", 1.0, Some(95.0))
        };
        assert_eq!(exit_trigger(&long, 94.0), Some("Stop loss"));
        assert_eq!(exit_trigger(&long, 111.0), Some("Take profit"));
        assert_eq!(exit_trigger(&long, 100.0), None);

        let short = Position {
            side: Side::Sell,
            stop_loss: Some(105.0),
            take_profit: Some(90.0),
            ..long
        };
        assert_eq!(exit_trigger(&short, 106.0), Some("Stop loss"));
        assert_eq!(exit_trigger(&short, 89.0), Some("Take profit"));
    }

    #[tokio::test]
    async fn test_risk_exposure_report() {
        let h = harness(vec![], EngineConfig::default()).await;
        assert_eq!(h.engine.check_risk_exposure().await.unwrap(), RiskExposureReport::default());

        h.store.open_position(&position(1, "BTC/USDT", 60.0, Some(95.0))).await.unwrap();
        h.store.open_position(&position(1, "SOL/USDT", 10.0, Some(98.0))).await.unwrap();
        h.store.open_position(&position(2, "ETH/USDT", 10.0, None)).await.unwrap();

        let report = h.engine.check_risk_exposure().await.unwrap();
        assert_eq!(report.total_exposure, 8_000.0);
        assert_eq!(report.positions_count, 3);
        // BTC stop is 5% away and ETH has none; SOL at 2% is inside the threshold
        assert_eq!(report.high_risk_positions, 2);
        assert_eq!(report.users_at_risk, 1);
        assert!((report.max_drawdown_risk - 16.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_evaluate_strategies_groups_by_strategy() {
        let h = harness(vec![], EngineConfig::default()).await;
        let fill = |price: f64, quantity: f64| TradeResult {
            trade_id: Uuid::new_v4().to_string(),
            symbol: "BTC/USDT".to_string(),
            side: Side::Sell,
            price,
            quantity,
            timestamp: Utc::now(),
            success: true,
            message: None,
        };
        let trend = TradingSignal::market("BTC/USDT", Side::Sell, 1.0, "trend_following");
        let reversion = TradingSignal::market("BTC/USDT", Side::Sell, 1.0, "mean_reversion");

        h.store.record_trade(1, &fill(100.0, 1.0), &trend, Some(10.0)).await.unwrap();
        h.store.record_trade(1, &fill(100.0, 2.0), &trend, Some(-5.0)).await.unwrap();
        h.store.record_trade(1, &fill(100.0, 1.0), &trend, None).await.unwrap();
        h.store.record_trade(1, &fill(200.0, 1.0), &reversion, Some(4.0)).await.unwrap();

        let metrics = h.engine.evaluate_strategies().await.unwrap();
        let trend = &metrics["trend_following"];
        assert_eq!(trend.trade_count, 3);
        assert!((trend.win_rate - 50.0).abs() < 1e-9);
        assert!((trend.avg_profit - 3.75).abs() < 1e-9);

        let reversion = &metrics["mean_reversion"];
        assert_eq!(reversion.win_rate, 100.0);
        assert!((reversion.avg_profit - 2.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_errors_degrade_health() {
        let failing: Arc<dyn Strategy> = Arc::new(FixedStrategy { signal: None });
        let h = harness(vec![failing], EngineConfig::default()).await;

        h.engine.start().await;
        // failures at 0s, 5s, 15s, 35s, 75s
        sleep(Duration::from_secs(80)).await;

        let status = h.engine.get_status().await;
        assert_eq!(status.health, HealthStatus::Degraded);
        assert_eq!(status.consecutive_errors, 5);
        assert!(status.last_error.unwrap().contains("boom"));

        h.engine.stop().await;
    }

    #[tokio::test]
    async fn test_cache_clears_keep_drawdown_halt() {
        use crate::models::UserSettingsUpdate;
        use crate::persistence::UserRepository;
        use crate::risk::DrawdownStage;

        let h = harness(vec![buy_btc()], EngineConfig::default()).await;
        let risk = h.engine.deps.risk.clone();
        risk.refresh_user(1).await.unwrap();
        let update = UserSettingsUpdate {
            equity: Some(7_800.0),
            ..Default::default()
        };
        h.store.update_user_settings(1, &update).await.unwrap();
        risk.refresh_user(1).await.unwrap();
        assert_eq!(risk.get_drawdown_stage(1).await, DrawdownStage::Halted);

        h.engine.clear_caches().await;
        assert_eq!(risk.get_drawdown_stage(1).await, DrawdownStage::Halted);
        assert!(h.engine.reset_engine().await);
        assert_eq!(risk.get_drawdown_stage(1).await, DrawdownStage::Halted);

        h.engine.run_iteration().await.unwrap();
        assert!(h.store.open_positions(1).await.unwrap().is_empty());
        assert_eq!(h.store.trade_count().await, 0);
    }

    #[tokio::test]
    async fn test_reset_engine_rebuilds_bindings() {
        let h = harness(vec![buy_btc()], EngineConfig::default()).await;
        h.engine.run_iteration().await.unwrap();

        assert!(h.engine.reset_engine().await);
        let status = h.engine.get_status().await;
        assert_eq!(status.active_exchanges, 1);
        assert_eq!(status.consecutive_errors, 0);
        assert!(status.market_data_age_secs.is_none());

        h.store.set_available(false);
        assert!(!h.engine.reset_engine().await);
        assert_eq!(h.engine.health(), HealthStatus::Degraded);
    }
}
