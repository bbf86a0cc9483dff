use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use super::checks::{ApiProbe, DatabaseProbe, EngineProbe, SystemProbe};
use super::resources::{ResourceMonitor, ResourceUsage};
use super::strategy::{Alert, HealingPolicy, HealingStrategy, HealthProbe, RecoveryStep, StrategyStats};
use crate::config::HealingConfig;
use crate::engine::EngineHandle;
use crate::error::Result;
use crate::exchange::MarketFeed;
use crate::notify::Notifier;
use crate::persistence::{RedisMarketCache, SharedStore};
use crate::scheduler::Scheduler;

pub const DATABASE: &str = "database_connection";
pub const API_CONNECTIONS: &str = "api_connections";
pub const SYSTEM_HEALTH: &str = "system_health";
pub const TRADING_ENGINE: &str = "trading_engine";

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// A component handed to the supervisor; `None` withdraws it
pub enum Component {
    TradingEngine(Option<Arc<EngineHandle>>),
    Database(Option<SharedStore>),
    MarketApi(Option<Arc<dyn MarketFeed>>),
    Notifier(Option<Arc<dyn Notifier>>),
}

#[derive(Default)]
struct Components {
    engine: Option<Arc<EngineHandle>>,
    store: Option<SharedStore>,
    feed: Option<Arc<dyn MarketFeed>>,
}

type SharedNotifier = Arc<StdRwLock<Option<Arc<dyn Notifier>>>>;

struct Slot {
    strategy: Arc<Mutex<HealingStrategy>>,
    task: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentStatus {
    pub trading_engine: bool,
    pub database: bool,
    pub market_api: bool,
    pub notifier: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemDiagnostics {
    pub system_health: ResourceUsage,
    pub recovery_stats: BTreeMap<String, StrategyStats>,
    pub component_status: ComponentStatus,
}

/// Watches subsystems and runs their heal actions with backoff and escalation
///
/// Every strategy is polled by its own task, so a long backoff on one
/// subsystem never delays checks of another.
pub struct Supervisor {
    config: HealingConfig,
    api_timeout: Duration,
    monitor: Arc<ResourceMonitor>,
    scheduler: Option<Arc<Scheduler>>,
    cache: Option<RedisMarketCache>,
    components: StdRwLock<Components>,
    notifier: SharedNotifier,
    slots: Mutex<BTreeMap<String, Slot>>,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Supervisor {
    pub fn new(config: HealingConfig, api_timeout: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            api_timeout,
            monitor: Arc::new(ResourceMonitor::new()),
            scheduler: None,
            cache: None,
            components: StdRwLock::new(Components::default()),
            notifier: Arc::new(StdRwLock::new(None)),
            slots: Mutex::new(BTreeMap::new()),
            running: AtomicBool::new(false),
            shutdown,
        }
    }

    /// Scheduler whose non-critical tasks are paused under resource pressure
    pub fn with_scheduler(mut self, scheduler: Arc<Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_cache(mut self, cache: RedisMarketCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub async fn start(&self) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("Self-healing supervisor is already running");
            return false;
        }
        self.shutdown.send_replace(false);

        if !self.slots.lock().await.contains_key(SYSTEM_HEALTH) {
            let strategy = self.system_strategy();
            self.install(strategy).await;
        }

        let mut slots = self.slots.lock().await;
        for slot in slots.values_mut() {
            if slot.task.is_none() {
                slot.task = Some(self.spawn_watch(slot.strategy.clone()));
            }
        }
        tracing::info!("🩺 Self-healing supervisor started ({} strategies)", slots.len());
        true
    }

    pub async fn stop(&self) -> bool {
        if !self.running.swap(false, Ordering::SeqCst) {
            tracing::warn!("Self-healing supervisor is not running");
            return false;
        }
        self.shutdown.send_replace(true);

        let handles: Vec<JoinHandle<()>> = self
            .slots
            .lock()
            .await
            .values_mut()
            .filter_map(|slot| slot.task.take())
            .collect();

        for handle in handles {
            let abort = handle.abort_handle();
            if timeout(STOP_TIMEOUT, handle).await.is_err() {
                abort.abort();
            }
        }
        tracing::info!("Self-healing supervisor stopped");
        true
    }

    fn spawn_watch(&self, strategy: Arc<Mutex<HealingStrategy>>) -> JoinHandle<()> {
        let notifier = self.notifier.clone();
        let interval = Duration::from_secs(self.config.check_interval_secs);
        let error_pause = Duration::from_secs(self.config.error_pause_secs);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                let pause = match run_cycle(&strategy, &notifier).await {
                    Ok(()) => interval,
                    Err(e) => {
                        let name = strategy.lock().await.name.clone();
                        tracing::error!("Error processing healing strategy for {}: {}", name, e);
                        error_pause
                    }
                };

                let closed = tokio::select! {
                    _ = sleep(pause) => false,
                    changed = shutdown.changed() => changed.is_err(),
                };
                if closed || *shutdown.borrow() {
                    break;
                }
            }
        })
    }

    /// Replace (or add) a strategy, restarting its watcher if running
    async fn install(&self, strategy: HealingStrategy) {
        let name = strategy.name.clone();
        let strategy = Arc::new(Mutex::new(strategy));
        let task = self
            .is_running()
            .then(|| self.spawn_watch(strategy.clone()));

        let previous = self
            .slots
            .lock()
            .await
            .insert(name.clone(), Slot { strategy, task });
        if let Some(Slot { task: Some(old), .. }) = previous {
            old.abort();
        }
        tracing::debug!("Healing strategy {} installed", name);
    }

    async fn uninstall(&self, name: &str) {
        if let Some(slot) = self.slots.lock().await.remove(name) {
            if let Some(task) = slot.task {
                task.abort();
            }
            tracing::debug!("Healing strategy {} removed", name);
        }
    }

    fn system_strategy(&self) -> HealingStrategy {
        let mut probe = SystemProbe::new(
            self.monitor.clone(),
            self.config.resource_threshold_percent,
            self.config.log_dir.clone(),
            Duration::from_secs(self.config.log_retention_days.saturating_mul(86_400)),
        );
        if let Some(scheduler) = &self.scheduler {
            probe = probe.with_scheduler(scheduler.clone());
        }
        if let Some(cache) = &self.cache {
            probe = probe.with_cache(cache.clone());
        }
        let engine = self
            .components
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .engine
            .clone();
        if let Some(engine) = engine {
            probe = probe.with_engine(engine);
        }
        HealingStrategy::new(SYSTEM_HEALTH, HealingPolicy::system_health(), Arc::new(probe))
    }

    /// Register a custom strategy alongside the built-in ones
    pub async fn add_strategy(&self, name: &str, policy: HealingPolicy, probe: Arc<dyn HealthProbe>) {
        self.install(HealingStrategy::new(name, policy, probe)).await;
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Swap a component reference; the dependent strategy is rebuilt around
    /// the new instance or removed when the component is withdrawn
    pub async fn update_component(&self, component: Component) -> bool {
        match component {
            Component::TradingEngine(engine) => {
                self.write_components().engine = engine.clone();
                match engine {
                    Some(engine) => {
                        let probe = EngineProbe::new(engine, self.config.engine_stale_secs);
                        self.add_strategy(TRADING_ENGINE, HealingPolicy::trading_engine(), Arc::new(probe))
                            .await;
                    }
                    None => self.uninstall(TRADING_ENGINE).await,
                }
                // the load-shedding heal clears the current engine's caches
                let strategy = self.system_strategy();
                self.install(strategy).await;
                tracing::info!("Component trading_engine reference updated");
            }
            Component::Database(store) => {
                self.write_components().store = store.clone();
                match store {
                    Some(store) => {
                        self.add_strategy(DATABASE, HealingPolicy::database(), Arc::new(DatabaseProbe::new(store)))
                            .await
                    }
                    None => self.uninstall(DATABASE).await,
                }
                tracing::info!("Component database reference updated");
            }
            Component::MarketApi(feed) => {
                self.write_components().feed = feed.clone();
                match feed {
                    Some(feed) => {
                        let probe = ApiProbe::new(feed, self.api_timeout);
                        self.add_strategy(API_CONNECTIONS, HealingPolicy::api_connections(), Arc::new(probe))
                            .await
                    }
                    None => self.uninstall(API_CONNECTIONS).await,
                }
                tracing::info!("Component market_api reference updated");
            }
            Component::Notifier(notifier) => {
                *self.notifier.write().unwrap_or_else(|p| p.into_inner()) = notifier;
                tracing::info!("Component notifier reference updated");
            }
        }
        true
    }

    fn write_components(&self) -> std::sync::RwLockWriteGuard<'_, Components> {
        self.components.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Reset a strategy's attempts (lifting any suspension) and heal now
    pub async fn manual_component_recovery(&self, name: &str) -> bool {
        let strategy = match self.slots.lock().await.get(name) {
            Some(slot) => slot.strategy.clone(),
            None => {
                tracing::warn!("No recovery strategy found for component: {}", name);
                return false;
            }
        };

        let probe = {
            let mut strategy = strategy.lock().await;
            strategy.reset();
            strategy.probe()
        };

        tracing::info!("Manually initiating recovery for {}", name);
        match probe.heal().await {
            Ok(true) => {
                tracing::info!("Manual recovery of {} successful", name);
                true
            }
            Ok(false) => {
                tracing::error!("Manual recovery of {} failed", name);
                false
            }
            Err(e) => {
                tracing::error!("Manual recovery of {} failed: {}", name, e);
                false
            }
        }
    }

    pub async fn get_system_diagnostics(&self) -> SystemDiagnostics {
        let monitor = self.monitor.clone();
        let system_health = tokio::task::spawn_blocking(move || monitor.sample())
            .await
            .unwrap_or_default();

        let mut recovery_stats = BTreeMap::new();
        let strategies: Vec<(String, Arc<Mutex<HealingStrategy>>)> = self
            .slots
            .lock()
            .await
            .iter()
            .map(|(name, slot)| (name.clone(), slot.strategy.clone()))
            .collect();
        for (name, strategy) in strategies {
            recovery_stats.insert(name, strategy.lock().await.stats());
        }

        let component_status = {
            let components = self.components.read().unwrap_or_else(|p| p.into_inner());
            ComponentStatus {
                trading_engine: components.engine.is_some(),
                database: components.store.is_some(),
                market_api: components.feed.is_some(),
                notifier: self.notifier.read().unwrap_or_else(|p| p.into_inner()).is_some(),
            }
        };

        SystemDiagnostics {
            system_health,
            recovery_stats,
            component_status,
        }
    }

    pub async fn strategy_names(&self) -> Vec<String> {
        self.slots.lock().await.keys().cloned().collect()
    }
}

/// One check, and on failure one backoff-then-heal (or escalation) step
async fn run_cycle(strategy: &Mutex<HealingStrategy>, notifier: &SharedNotifier) -> Result<()> {
    let (name, probe) = {
        let s = strategy.lock().await;
        (s.name.clone(), s.probe())
    };

    let healthy = probe.check().await?;
    strategy.lock().await.record_check(healthy);
    if healthy {
        return Ok(());
    }

    let (step, delay) = strategy.lock().await.record_failure();
    match step {
        RecoveryStep::Suspended => {
            tracing::debug!("{} still failing, auto-recovery suspended", name);
        }
        RecoveryStep::Heal { attempt } => {
            tracing::warn!("{} unhealthy, healing attempt {} in {:?}", name, attempt, delay);
            sleep(delay).await;

            let healed = match probe.heal().await {
                Ok(healed) => healed,
                Err(e) => {
                    tracing::error!("Heal action for {} failed: {}", name, e);
                    false
                }
            };

            let alert = strategy.lock().await.on_heal_result(healed);
            if healed {
                tracing::info!("Successfully recovered {}", name);
            } else {
                tracing::error!("Failed to heal {}", name);
            }
            if alert == Some(Alert::Critical) {
                send_alert(notifier, &name, Alert::Critical);
            }
        }
        RecoveryStep::Escalate => {
            sleep(delay).await;
            tracing::error!("{} has failed recovery attempts, manual intervention required", name);
            send_alert(notifier, &name, Alert::ManualIntervention);
        }
    }
    Ok(())
}

fn send_alert(notifier: &SharedNotifier, component: &str, alert: Alert) {
    let notifier = notifier.read().unwrap_or_else(|p| p.into_inner()).clone();
    let Some(notifier) = notifier else {
        tracing::warn!("No notifier attached, dropping alert for {}", component);
        return;
    };

    let message = match alert {
        Alert::Critical => format!("{} has failed recovery attempts.", component),
        Alert::ManualIntervention => format!(
            "{} has exceeded recovery attempts. Immediate manual intervention required.",
            component
        ),
    };
    notifier.send_admin_alert(&format!("Critical System Failure: {}", component), &message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::QueuedNotifier;
    use crate::persistence::MemoryStore;
    use async_trait::async_trait;
    use tokio::time::Instant;

    /// Always unhealthy; records when checks and heals happen
    #[derive(Default)]
    struct FailingProbe {
        checks: std::sync::Mutex<Vec<Instant>>,
        heals: std::sync::Mutex<Vec<Instant>>,
        heal_succeeds: AtomicBool,
    }

    #[async_trait]
    impl HealthProbe for FailingProbe {
        async fn check(&self) -> Result<bool> {
            self.checks.lock().unwrap().push(Instant::now());
            Ok(false)
        }

        async fn heal(&self) -> Result<bool> {
            self.heals.lock().unwrap().push(Instant::now());
            Ok(self.heal_succeeds.load(Ordering::SeqCst))
        }
    }

    fn config() -> HealingConfig {
        HealingConfig {
            check_interval_secs: 10,
            ..Default::default()
        }
    }

    async fn supervisor_with(probe: Arc<FailingProbe>) -> (Supervisor, QueuedNotifier) {
        let (notifier, _) = QueuedNotifier::spawn();
        let supervisor = Supervisor::new(config(), Duration::from_secs(5));
        supervisor
            .update_component(Component::Notifier(Some(Arc::new(notifier.clone()))))
            .await;
        supervisor
            .add_strategy(DATABASE, HealingPolicy::database(), probe)
            .await;
        (supervisor, notifier)
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_then_alert_on_final_attempt() {
        let probe = Arc::new(FailingProbe::default());
        let (supervisor, notifier) = supervisor_with(probe.clone()).await;
        supervisor.start().await;

        // heals at 5s, 25s, 55s, 105s, 195s
        sleep(Duration::from_secs(60)).await;
        let delays: Vec<u64> = {
            let checks = probe.checks.lock().unwrap();
            let heals = probe.heals.lock().unwrap();
            heals
                .iter()
                .zip(checks.iter())
                .map(|(heal, check)| (*heal - *check).as_secs())
                .collect()
        };
        assert_eq!(delays, vec![5, 10, 20]);

        sleep(Duration::from_secs(130)).await;
        assert_eq!(probe.heals.lock().unwrap().len(), 4);
        let database_alerts = |n: &QueuedNotifier| {
            n.admin_alerts()
                .into_iter()
                .filter(|(subject, _)| subject.contains(DATABASE))
                .count()
        };
        assert_eq!(database_alerts(&notifier), 0);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(probe.heals.lock().unwrap().len(), 5);
        assert_eq!(database_alerts(&notifier), 1);

        supervisor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_strategy_escalates_once_and_suspends() {
        let probe = Arc::new(FailingProbe::default());
        let (supervisor, notifier) = supervisor_with(probe.clone()).await;
        supervisor.start().await;

        // five heals finish at 195s, escalation after a further 160s backoff
        sleep(Duration::from_secs(600)).await;
        let stats = supervisor.get_system_diagnostics().await.recovery_stats;
        assert!(stats[DATABASE].suspended);
        assert_eq!(probe.heals.lock().unwrap().len(), 5);

        let manual = notifier
            .admin_alerts()
            .into_iter()
            .filter(|(subject, message)| {
                subject.contains(DATABASE) && message.contains("manual intervention")
            })
            .count();
        assert_eq!(manual, 1);

        supervisor.stop().await;
        probe.heal_succeeds.store(true, Ordering::SeqCst);
        assert!(supervisor.manual_component_recovery(DATABASE).await);
        let stats = supervisor.get_system_diagnostics().await.recovery_stats;
        assert!(!stats[DATABASE].suspended);
        assert_eq!(stats[DATABASE].attempts, 0);
    }

    #[tokio::test]
    async fn test_update_component_adds_and_removes_strategies() {
        let supervisor = Supervisor::new(config(), Duration::from_secs(5));
        supervisor
            .update_component(Component::Database(Some(Arc::new(MemoryStore::new()))))
            .await;
        assert_eq!(supervisor.strategy_names().await, vec![DATABASE.to_string()]);

        supervisor.update_component(Component::Database(None)).await;
        assert!(supervisor.strategy_names().await.is_empty());

        let diagnostics = supervisor.get_system_diagnostics().await;
        assert!(!diagnostics.component_status.database);
        assert!(!diagnostics.component_status.notifier);
    }

    #[tokio::test]
    async fn test_manual_recovery_unknown_component() {
        let supervisor = Supervisor::new(config(), Duration::from_secs(5));
        assert!(!supervisor.manual_component_recovery("nope").await);
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let supervisor = Supervisor::new(config(), Duration::from_secs(5));
        assert!(supervisor.start().await);
        assert!(!supervisor.start().await);
        assert!(supervisor.strategy_names().await.contains(&SYSTEM_HEALTH.to_string()));
        assert!(supervisor.stop().await);
        assert!(!supervisor.stop().await);
    }
}
