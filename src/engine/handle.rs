use std::sync::Arc;
use tokio::sync::RwLock;

use super::{EngineDeps, TradingEngine};
use crate::config::EngineConfig;

/// Owns the live engine and can replace it with a fresh instance
///
/// Scheduled jobs and the supervisor go through the handle, so a rebuilt
/// engine is picked up without re-wiring anything.
pub struct EngineHandle {
    config: EngineConfig,
    deps: EngineDeps,
    current: RwLock<Arc<TradingEngine>>,
}

impl EngineHandle {
    pub fn new(config: EngineConfig, deps: EngineDeps) -> Self {
        let engine = Arc::new(TradingEngine::new(config.clone(), deps.clone()));
        Self {
            config,
            deps,
            current: RwLock::new(engine),
        }
    }

    pub async fn current(&self) -> Arc<TradingEngine> {
        self.current.read().await.clone()
    }

    /// Stop the running engine, build a new one from the same config and
    /// collaborators, and start it
    pub async fn restart(&self) -> bool {
        let mut current = self.current.write().await;
        if current.is_running() {
            current.stop().await;
        }

        let fresh = Arc::new(TradingEngine::new(self.config.clone(), self.deps.clone()));
        let started = fresh.start().await;
        *current = fresh;

        if started {
            tracing::info!("♻️  Trading engine rebuilt and restarted");
        } else {
            tracing::error!("Rebuilt trading engine failed to start");
        }
        started
    }
}
