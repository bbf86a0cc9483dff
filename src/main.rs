use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::Duration;

use tradefleet::config::{AppConfig, ExchangeMode};
use tradefleet::db::PostgresStore;
use tradefleet::engine::{EngineDeps, EngineHandle};
use tradefleet::exchange::{MarketFeed, PaperExchangeFactory, PublicMarketClient, StaticMarketFeed};
use tradefleet::healing::{Component, ResourceMonitor, Supervisor};
use tradefleet::models::{RiskLevel, UserAccount};
use tradefleet::notify::{Notifier, QueuedNotifier};
use tradefleet::persistence::{MemoryStore, RedisMarketCache, SharedStore};
use tradefleet::risk::RiskGate;
use tradefleet::scheduler::{job, Scheduler, TaskKind};
use tradefleet::strategy::BuiltinStrategies;
use tradefleet::{logging, Result};

#[derive(Parser)]
#[command(name = "tradefleet", version, about = "Multi-user risk-gated trading engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the trading loop, scheduler, and supervisor until Ctrl+C
    Run {
        #[arg(long, default_value = "config")]
        config_dir: PathBuf,
        /// Trade against the in-memory store even if a database is configured
        #[arg(long)]
        paper: bool,
        #[arg(long)]
        no_supervisor: bool,
    },
    /// Print host resource usage and the effective configuration as JSON
    Diagnostics {
        #[arg(long, default_value = "config")]
        config_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Run {
        config_dir: PathBuf::from("config"),
        paper: false,
        no_supervisor: false,
    }) {
        Command::Run {
            config_dir,
            paper,
            no_supervisor,
        } => run(&config_dir, paper, no_supervisor).await,
        Command::Diagnostics { config_dir } => diagnostics(&config_dir),
    }
}

fn diagnostics(config_dir: &Path) -> Result<()> {
    let mut config = AppConfig::load_from(config_dir)?;
    for url in [&mut config.database.url, &mut config.redis.url] {
        if url.is_some() {
            *url = Some("***".to_string());
        }
    }
    let monitor = ResourceMonitor::new();
    // cpu usage needs two samples
    std::thread::sleep(Duration::from_millis(250));
    let report = serde_json::json!({
        "resources": monitor.sample(),
        "config": config,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run(config_dir: &Path, paper: bool, no_supervisor: bool) -> Result<()> {
    let config = AppConfig::load_from(config_dir)?;
    let _log_guard = logging::init(config.logging.dir.as_deref());

    tracing::info!("🚀 TradeFleet starting");
    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Exchange mode: {:?}", config.exchange.mode);
    tracing::info!("  Symbols: {}", config.engine.market_symbols.join(", "));
    tracing::info!("  Drawdown stages at: {:?}%", config.risk.drawdown_thresholds);
    tracing::info!("  Max position size: {}%", config.risk.max_position_size_percent);

    // ========================================================================
    // Collaborators
    // ========================================================================

    let store = connect_store(&config, paper).await;
    let cache = connect_cache(&config).await;

    let market: Arc<dyn MarketFeed> = match config.exchange.mode {
        ExchangeMode::Paper => Arc::new(PublicMarketClient::new(&config.exchange)?),
        ExchangeMode::Offline => Arc::new(StaticMarketFeed::with_default_prices()),
    };
    let exchanges = Arc::new(PaperExchangeFactory::new(
        market.clone(),
        config.exchange.paper_slippage_bps,
        config.exchange.paper_starting_balance,
    ));

    let (queued, notifier_task) = QueuedNotifier::spawn();
    let notifier: Arc<dyn Notifier> = Arc::new(queued);

    let risk = Arc::new(RiskGate::new(
        config.risk.clone(),
        store.clone(),
        market.clone(),
        notifier.clone(),
    ));

    let engine = Arc::new(EngineHandle::new(
        config.engine.clone(),
        EngineDeps {
            store: store.clone(),
            exchanges,
            strategies: Arc::new(BuiltinStrategies),
            market: market.clone(),
            risk: risk.clone(),
            notifier: notifier.clone(),
            cache: cache.clone(),
        },
    ));

    // ========================================================================
    // Workers
    // ========================================================================

    engine.current().await.start().await;

    let scheduler = Arc::new(Scheduler::new(config.scheduler.clone()));
    register_jobs(&scheduler, &engine, &risk, &notifier, cache.clone()).await?;
    scheduler.start().await;

    let supervisor = if no_supervisor {
        tracing::warn!("Self-healing supervisor disabled");
        None
    } else {
        let call_timeout = Duration::from_secs(config.engine.exchange_call_timeout_secs);
        let mut supervisor = Supervisor::new(config.healing.clone(), call_timeout).with_scheduler(scheduler.clone());
        if let Some(cache) = &cache {
            supervisor = supervisor.with_cache(cache.clone());
        }
        supervisor.update_component(Component::Notifier(Some(notifier.clone()))).await;
        supervisor.update_component(Component::Database(Some(store.clone()))).await;
        supervisor.update_component(Component::MarketApi(Some(market.clone()))).await;
        supervisor.update_component(Component::TradingEngine(Some(engine.clone()))).await;
        supervisor.start().await;
        Some(supervisor)
    };

    tracing::info!("✅ All workers running. Press Ctrl+C to stop.");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
            }
            tracing::info!("\n🛑 Shutdown signal received");
        }
    }

    // Reverse start order
    if let Some(supervisor) = &supervisor {
        supervisor.stop().await;
    }
    scheduler.stop().await;
    engine.current().await.stop().await;

    drop((supervisor, scheduler, engine, risk, notifier));
    if tokio::time::timeout(Duration::from_secs(2), notifier_task).await.is_err() {
        tracing::debug!("Notification dispatcher still draining at exit");
    }

    tracing::info!("👋 TradeFleet stopped");
    Ok(())
}

/// Postgres when configured and reachable, otherwise the in-memory store
/// seeded with one paper account
async fn connect_store(config: &AppConfig, paper: bool) -> SharedStore {
    if !paper {
        if let Some(url) = &config.database.url {
            match PostgresStore::new(url, config.database.max_connections).await {
                Ok(store) => return Arc::new(store),
                Err(e) => tracing::warn!("⚠️  Failed to connect to Postgres: {}", e),
            }
        }
    }

    tracing::warn!("⚠️  Running with in-memory persistence (state is lost on exit)");
    let store = MemoryStore::new();
    store
        .add_user(UserAccount::new(
            1,
            "paper",
            RiskLevel::Medium,
            config.exchange.paper_starting_balance,
        ))
        .await;
    Arc::new(store)
}

async fn connect_cache(config: &AppConfig) -> Option<RedisMarketCache> {
    let url = config.redis.url.as_ref()?;
    match RedisMarketCache::new(url, config.redis.ttl_secs).await {
        Ok(cache) => {
            tracing::info!("✅ Connected to Redis");
            Some(cache)
        }
        Err(e) => {
            tracing::warn!("⚠️  Failed to connect to Redis: {}", e);
            None
        }
    }
}

// ============================================================================
// Scheduled jobs
// ============================================================================

async fn register_jobs(
    scheduler: &Scheduler,
    engine: &Arc<EngineHandle>,
    risk: &Arc<RiskGate>,
    notifier: &Arc<dyn Notifier>,
    cache: Option<RedisMarketCache>,
) -> Result<()> {
    let sweep = {
        let risk = risk.clone();
        job(move || {
            let risk = risk.clone();
            async move {
                let assessments = risk.assess_portfolio_risk().await?;
                let flagged = assessments.iter().filter(|a| !a.actions.is_empty()).count();
                tracing::info!("Portfolio sweep: {} users assessed, {} flagged", assessments.len(), flagged);
                Ok(())
            }
        })
    };
    scheduler.add_job("portfolio_risk_sweep", TaskKind::every(900), sweep, true).await?;

    let monitor = {
        let engine = engine.clone();
        job(move || {
            let engine = engine.clone();
            async move {
                engine.current().await.monitor_positions().await?;
                Ok(())
            }
        })
    };
    scheduler.add_job("monitor_positions", TaskKind::every(60), monitor, true).await?;

    let evaluate = {
        let engine = engine.clone();
        job(move || {
            let engine = engine.clone();
            async move {
                engine.current().await.evaluate_strategies().await?;
                Ok(())
            }
        })
    };
    scheduler.add_daily_job("evaluate_strategies", 0, 5, evaluate, false).await?;

    let exposure = {
        let engine = engine.clone();
        let notifier = notifier.clone();
        job(move || {
            let engine = engine.clone();
            let notifier = notifier.clone();
            async move {
                let report = engine.current().await.check_risk_exposure().await?;
                if report.users_at_risk > 0 {
                    notifier.send_admin_alert(
                        "Risk exposure",
                        &format!(
                            "{} users over the exposure limit, {} high-risk positions, total exposure {:.2}",
                            report.users_at_risk, report.high_risk_positions, report.total_exposure
                        ),
                    );
                }
                Ok(())
            }
        })
    };
    scheduler.add_job("risk_exposure_report", TaskKind::every(3600), exposure, false).await?;

    let summary = {
        let engine = engine.clone();
        let risk = risk.clone();
        let notifier = notifier.clone();
        job(move || {
            let engine = engine.clone();
            let risk = risk.clone();
            let notifier = notifier.clone();
            async move { weekly_summary(&engine, &risk, notifier.as_ref()).await }
        })
    };
    scheduler
        .add_weekly_job("weekly_summary", chrono::Weekday::Mon, 8, 0, summary, false)
        .await?;

    let cleanup = {
        let engine = engine.clone();
        job(move || {
            let engine = engine.clone();
            let cache = cache.clone();
            async move {
                engine.current().await.clear_caches().await;
                if let Some(cache) = cache {
                    let keys = cache.clear().await?;
                    tracing::info!("Cache cleanup removed {} keys", keys);
                }
                Ok(())
            }
        })
    };
    scheduler.add_monthly_job("cache_cleanup", 1, 3, 0, cleanup, false).await?;

    tracing::info!("📅 Registered {} scheduled jobs", scheduler.list_tasks().await.len());
    Ok(())
}

async fn weekly_summary(engine: &EngineHandle, risk: &RiskGate, notifier: &dyn Notifier) -> anyhow::Result<()> {
    let engine = engine.current().await;
    let performance = engine.evaluate_strategies().await?;

    let mut lines: Vec<String> = performance
        .iter()
        .map(|(name, p)| {
            format!(
                "- {}: {} trades, win rate {:.1}%, avg profit {:+.2}%",
                name, p.trade_count, p.win_rate, p.avg_profit
            )
        })
        .collect();
    if lines.is_empty() {
        lines.push("- no trades in the evaluation window".to_string());
    }
    let strategies = lines.join("\n");

    let status = engine.get_status().await;
    notifier.send_admin_alert(
        "Weekly summary",
        &format!(
            "Engine {} with {} active users\n{}",
            status.health, status.active_users, strategies
        ),
    );

    for user_id in risk.tracked_user_ids().await {
        if let Some(snapshot) = risk.portfolio_snapshot(user_id).await {
            notifier.send_notification(
                user_id,
                &format!(
                    "Weekly summary: equity {:.2} ({:.2}% below peak, {}), {} open positions\n{}",
                    snapshot.current_equity,
                    snapshot.drawdown_percent,
                    snapshot.stage,
                    snapshot.positions.len(),
                    strategies
                ),
                "weekly_summary",
            );
        }
    }
    Ok(())
}
