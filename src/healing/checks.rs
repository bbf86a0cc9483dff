// Built-in probes: database, market API, host resources, trading loop liveness
use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::resources::{cleanup_old_logs, ResourceMonitor};
use super::strategy::HealthProbe;
use crate::config::chrono_secs;
use crate::engine::EngineHandle;
use crate::error::{with_deadline, Result};
use crate::exchange::MarketFeed;
use crate::persistence::{RedisMarketCache, SharedStore};
use crate::scheduler::Scheduler;

pub struct DatabaseProbe {
    store: SharedStore,
}

impl DatabaseProbe {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl HealthProbe for DatabaseProbe {
    async fn check(&self) -> Result<bool> {
        match self.store.ping().await {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::error!("Database connection test failed: {}", e);
                Ok(false)
            }
        }
    }

    /// Drop and recreate the pool, then confirm with a round trip
    async fn heal(&self) -> Result<bool> {
        self.store.reconnect().await?;
        self.store.ping().await?;
        Ok(true)
    }
}

/// Public, unauthenticated reachability of the market API
pub struct ApiProbe {
    feed: Arc<dyn MarketFeed>,
    timeout: Duration,
}

impl ApiProbe {
    pub fn new(feed: Arc<dyn MarketFeed>, timeout: Duration) -> Self {
        Self { feed, timeout }
    }
}

#[async_trait]
impl HealthProbe for ApiProbe {
    async fn check(&self) -> Result<bool> {
        match with_deadline("market ping", self.timeout, self.feed.ping()).await {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::error!("Market API connection test failed: {}", e);
                Ok(false)
            }
        }
    }

    async fn heal(&self) -> Result<bool> {
        self.feed.reset();
        Ok(true)
    }
}

/// Sheds load when CPU, memory, or disk usage crosses the threshold
pub struct SystemProbe {
    monitor: Arc<ResourceMonitor>,
    threshold_percent: f64,
    log_dir: PathBuf,
    log_retention: Duration,
    scheduler: Option<Arc<Scheduler>>,
    engine: Option<Arc<EngineHandle>>,
    cache: Option<RedisMarketCache>,
}

impl SystemProbe {
    pub fn new(monitor: Arc<ResourceMonitor>, threshold_percent: f64, log_dir: PathBuf, log_retention: Duration) -> Self {
        Self {
            monitor,
            threshold_percent,
            log_dir,
            log_retention,
            scheduler: None,
            engine: None,
            cache: None,
        }
    }

    pub fn with_scheduler(mut self, scheduler: Arc<Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_engine(mut self, engine: Arc<EngineHandle>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_cache(mut self, cache: RedisMarketCache) -> Self {
        self.cache = Some(cache);
        self
    }
}

#[async_trait]
impl HealthProbe for SystemProbe {
    async fn check(&self) -> Result<bool> {
        let monitor = self.monitor.clone();
        let usage = tokio::task::spawn_blocking(move || monitor.sample())
            .await
            .map_err(|e| anyhow::anyhow!("resource sampling panicked: {}", e))?;

        match usage.first_over(self.threshold_percent) {
            Some((resource, value)) => {
                tracing::warn!("High {} usage detected: {:.1}%", resource, value);
                Ok(false)
            }
            None => Ok(true),
        }
    }

    async fn heal(&self) -> Result<bool> {
        if let Some(scheduler) = &self.scheduler {
            scheduler.pause_non_critical_tasks().await;
        }
        if let Some(engine) = &self.engine {
            engine.current().await.clear_caches().await;
        }
        if let Some(cache) = &self.cache {
            match cache.clear().await {
                Ok(keys) => tracing::info!("Cleared {} cached market keys", keys),
                Err(e) => tracing::warn!("Market cache clear failed: {}", e),
            }
        }
        cleanup_old_logs(&self.log_dir, self.log_retention).await?;
        Ok(true)
    }
}

/// Flags a loop that has not recorded activity for too long
pub struct EngineProbe {
    engine: Arc<EngineHandle>,
    /// `None` when the limit is past chrono's range
    stale_after: Option<chrono::Duration>,
}

impl EngineProbe {
    pub fn new(engine: Arc<EngineHandle>, stale_after_secs: u64) -> Self {
        Self {
            engine,
            stale_after: chrono_secs(stale_after_secs),
        }
    }
}

#[async_trait]
impl HealthProbe for EngineProbe {
    async fn check(&self) -> Result<bool> {
        let engine = self.engine.current().await;
        let idle = Utc::now() - engine.last_activity();
        if self.stale_after.is_some_and(|limit| idle > limit) {
            tracing::warn!(
                "Trading engine appears unresponsive (last activity: {} seconds ago)",
                idle.num_seconds()
            );
            return Ok(false);
        }
        Ok(true)
    }

    async fn heal(&self) -> Result<bool> {
        Ok(self.engine.restart().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::StaticMarketFeed;
    use crate::persistence::MemoryStore;
    use crate::scheduler::{job, TaskKind};

    #[tokio::test]
    async fn test_database_probe_reconnects() {
        let store = Arc::new(MemoryStore::new());
        let probe = DatabaseProbe::new(store.clone());
        assert!(probe.check().await.unwrap());

        store.set_available(false);
        assert!(!probe.check().await.unwrap());
        assert!(probe.heal().await.is_err());

        store.set_available(true);
        assert!(probe.heal().await.unwrap());
        assert_eq!(store.reconnect_count(), 2);
    }

    #[tokio::test]
    async fn test_api_probe_tracks_reachability() {
        let feed = Arc::new(StaticMarketFeed::with_default_prices());
        let probe = ApiProbe::new(feed.clone(), Duration::from_secs(1));
        assert!(probe.check().await.unwrap());

        feed.set_reachable(false);
        assert!(!probe.check().await.unwrap());
        assert!(probe.heal().await.unwrap());
    }

    #[tokio::test]
    async fn test_system_probe_heal_pauses_non_critical_tasks() {
        let scheduler = Arc::new(Scheduler::new(Default::default()));
        for (id, critical) in [("sweep", true), ("report", false)] {
            scheduler
                .add_job(id, TaskKind::every(60), job(|| async { Ok(()) }), critical)
                .await
                .unwrap();
        }

        let dir = tempfile::tempdir().unwrap();
        let probe = SystemProbe::new(
            Arc::new(ResourceMonitor::new()),
            90.0,
            dir.path().to_path_buf(),
            Duration::from_secs(86_400),
        )
        .with_scheduler(scheduler.clone());

        assert!(probe.heal().await.unwrap());
        assert!(!scheduler.task_info("sweep").await.unwrap().paused);
        assert!(scheduler.task_info("report").await.unwrap().paused);
    }

    #[tokio::test]
    async fn test_system_heal_keeps_drawdown_halt() {
        use crate::config::{EngineConfig, RiskConfig};
        use crate::engine::EngineDeps;
        use crate::exchange::PaperExchangeFactory;
        use crate::models::{RiskLevel, UserAccount, UserSettingsUpdate};
        use crate::notify::QueuedNotifier;
        use crate::persistence::UserRepository;
        use crate::risk::{DrawdownStage, RiskGate};
        use crate::strategy::BuiltinStrategies;

        let store = Arc::new(MemoryStore::new());
        store.add_user(UserAccount::new(1, "alice", RiskLevel::Medium, 10_000.0)).await;
        let feed = Arc::new(StaticMarketFeed::with_default_prices());
        let (notifier, _) = QueuedNotifier::spawn();
        let risk = Arc::new(RiskGate::new(
            RiskConfig::default(),
            store.clone(),
            feed.clone(),
            Arc::new(notifier.clone()),
        ));
        let engine = Arc::new(EngineHandle::new(
            EngineConfig::default(),
            EngineDeps {
                store: store.clone(),
                exchanges: Arc::new(PaperExchangeFactory::new(feed.clone(), 0.0, 10_000.0)),
                strategies: Arc::new(BuiltinStrategies),
                market: feed,
                risk: risk.clone(),
                notifier: Arc::new(notifier),
                cache: None,
            },
        ));

        risk.refresh_user(1).await.unwrap();
        let update = UserSettingsUpdate {
            equity: Some(7_800.0),
            ..Default::default()
        };
        store.update_user_settings(1, &update).await.unwrap();
        risk.refresh_user(1).await.unwrap();
        assert_eq!(risk.get_drawdown_stage(1).await, DrawdownStage::Halted);

        let dir = tempfile::tempdir().unwrap();
        let system = SystemProbe::new(
            Arc::new(ResourceMonitor::new()),
            90.0,
            dir.path().to_path_buf(),
            Duration::from_secs(86_400),
        )
        .with_engine(engine);

        assert!(system.heal().await.unwrap());
        assert_eq!(risk.get_drawdown_stage(1).await, DrawdownStage::Halted);
        assert_eq!(risk.portfolio_snapshot(1).await.unwrap().peak_equity, 10_000.0);
    }

    #[tokio::test]
    async fn test_system_probe_over_zero_threshold_is_unhealthy() {
        let dir = tempfile::tempdir().unwrap();
        let probe = SystemProbe::new(
            Arc::new(ResourceMonitor::new()),
            -1.0,
            dir.path().to_path_buf(),
            Duration::from_secs(86_400),
        );
        assert!(!probe.check().await.unwrap());
    }
}
