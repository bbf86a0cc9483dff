// Generic task scheduler: interval and calendar jobs on a one-second tick
pub mod task;

use chrono::{Local, NaiveDateTime, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};

use crate::config::SchedulerConfig;
use crate::error::{Result, TradeError};

pub use task::{job, parse_time_of_day, Job, ScheduledTask, TaskInfo, TaskKind};
use task::InFlightGuard;

/// Whether a task may start while its previous run is still going
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Launch every due firing, even on top of an unfinished one
    #[default]
    Allow,
    /// At most one run in flight per task; later firings are counted as skipped
    SkipIfRunning,
}

pub struct Scheduler {
    tasks: Arc<Mutex<HashMap<String, ScheduledTask>>>,
    config: SchedulerConfig,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    handle: Mutex<Option<JoinHandle<()>>>,
    generated_ids: AtomicUsize,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            config,
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
            handle: Mutex::new(None),
            generated_ids: AtomicUsize::new(0),
        }
    }

    /// Register a job; a valid `run_at_time` ("HH:MM") makes it daily,
    /// otherwise it runs every `interval_secs`
    ///
    /// Returns false when `run_at_time` cannot be parsed.
    pub async fn schedule(
        &self,
        job: Job,
        interval_secs: u64,
        id: Option<&str>,
        run_at_time: Option<&str>,
        critical: bool,
    ) -> bool {
        let id = match id {
            Some(id) => id.to_string(),
            None => {
                let n = self.generated_ids.fetch_add(1, Ordering::SeqCst) + 1;
                format!("task_{}", n)
            }
        };

        let kind = match run_at_time {
            Some(raw) => match parse_time_of_day(raw) {
                Some((hour, minute)) => TaskKind::Daily { hour, minute },
                None => {
                    tracing::error!("Invalid time format for task '{}': {}", id, raw);
                    return false;
                }
            },
            None => TaskKind::every(interval_secs),
        };

        self.add_job(&id, kind, job, critical).await.is_ok()
    }

    /// Register or overwrite a task
    pub async fn add_job(&self, id: &str, kind: TaskKind, job: Job, critical: bool) -> Result<()> {
        if !kind.validate() {
            return Err(TradeError::InvalidInput(format!(
                "task '{}' has an impossible schedule: {:?}",
                id, kind
            )));
        }
        if let TaskKind::Interval { every } = kind {
            if every.is_zero() {
                return Err(TradeError::InvalidInput(format!(
                    "task '{}' interval must be non-zero",
                    id
                )));
            }
        }

        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(id) {
            tracing::warn!("Task '{}' already exists. Overwriting.", id);
        }
        tasks.insert(id.to_string(), ScheduledTask::new(id, kind, job, critical));

        tracing::info!("Job added: {} ({}{})", id, kind, if critical { ", critical" } else { "" });
        Ok(())
    }

    pub async fn add_daily_job(&self, id: &str, hour: u32, minute: u32, job: Job, critical: bool) -> Result<()> {
        self.add_job(id, TaskKind::Daily { hour, minute }, job, critical).await
    }

    pub async fn add_weekly_job(
        &self,
        id: &str,
        weekday: Weekday,
        hour: u32,
        minute: u32,
        job: Job,
        critical: bool,
    ) -> Result<()> {
        self.add_job(id, TaskKind::Weekly { weekday, hour, minute }, job, critical)
            .await
    }

    pub async fn add_monthly_job(
        &self,
        id: &str,
        day: u32,
        hour: u32,
        minute: u32,
        job: Job,
        critical: bool,
    ) -> Result<()> {
        self.add_job(id, TaskKind::Monthly { day, hour, minute }, job, critical)
            .await
    }

    pub async fn remove_task(&self, id: &str) -> bool {
        let removed = self.tasks.lock().await.remove(id).is_some();
        if removed {
            tracing::info!("Task removed: {}", id);
        } else {
            tracing::warn!("Task '{}' not found", id);
        }
        removed
    }

    pub async fn pause_task(&self, id: &str) -> bool {
        self.set_paused(id, true).await
    }

    pub async fn resume_task(&self, id: &str) -> bool {
        self.set_paused(id, false).await
    }

    async fn set_paused(&self, id: &str, paused: bool) -> bool {
        match self.tasks.lock().await.get_mut(id) {
            Some(task) => {
                task.paused = paused;
                tracing::info!("Task {}: {}", if paused { "paused" } else { "resumed" }, id);
                true
            }
            None => {
                tracing::warn!("Task '{}' not found", id);
                false
            }
        }
    }

    /// Pause every non-critical task that is not already paused; returns how many
    pub async fn pause_non_critical_tasks(&self) -> usize {
        let mut tasks = self.tasks.lock().await;
        let mut count = 0;
        for task in tasks.values_mut().filter(|t| !t.critical && !t.paused) {
            task.paused = true;
            count += 1;
        }
        tracing::info!("Paused {} non-critical tasks", count);
        count
    }

    /// Resume every paused task; returns how many
    pub async fn resume_all_tasks(&self) -> usize {
        let mut tasks = self.tasks.lock().await;
        let mut count = 0;
        for task in tasks.values_mut().filter(|t| t.paused) {
            task.paused = false;
            count += 1;
        }
        tracing::info!("Resumed {} tasks", count);
        count
    }

    pub async fn task_info(&self, id: &str) -> Option<TaskInfo> {
        self.tasks.lock().await.get(id).map(|t| t.info())
    }

    pub async fn list_tasks(&self) -> Vec<TaskInfo> {
        let mut infos: Vec<TaskInfo> = self.tasks.lock().await.values().map(|t| t.info()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Evaluate every task against wall-clock `now` and the current
    /// monotonic time, launching the due ones
    pub async fn run_pending_at(&self, now: NaiveDateTime) -> Vec<String> {
        self.run_pending(now, Instant::now()).await
    }

    /// Launch every task due at (`now`, `mono`)
    ///
    /// Returns the ids that were launched. The task is stamped before the
    /// worker starts.
    pub async fn run_pending(&self, now: NaiveDateTime, mono: Instant) -> Vec<String> {
        let mut launched = Vec::new();
        let mut tasks = self.tasks.lock().await;

        for task in tasks.values_mut() {
            if !task.is_due(now, mono) {
                continue;
            }
            task.mark_fired(now, mono);

            if self.config.overlap == OverlapPolicy::SkipIfRunning
                && task.stats.in_flight.load(Ordering::SeqCst) > 0
            {
                task.stats.skipped_count.fetch_add(1, Ordering::SeqCst);
                tracing::warn!("Task '{}' skipped, previous run still in progress", task.id);
                continue;
            }

            spawn_worker(task);
            launched.push(task.id.clone());
        }

        launched
    }

    /// Start the tick loop; no-op (false) if already running
    pub async fn start(&self) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("Scheduler is already running");
            return false;
        }

        let tick = Duration::from_millis(self.config.tick_millis);
        let running = self.running.clone();
        let shutdown = self.shutdown.clone();
        let registry = Scheduler {
            tasks: self.tasks.clone(),
            config: self.config.clone(),
            running: self.running.clone(),
            shutdown: self.shutdown.clone(),
            handle: Mutex::new(None),
            generated_ids: AtomicUsize::new(0),
        };

        let handle = tokio::spawn(async move {
            let mut ticker = interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.notified() => break,
                }
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                registry.run_pending_at(Local::now().naive_local()).await;
            }
            tracing::info!("Scheduler loop exited");
        });

        *self.handle.lock().await = Some(handle);
        tracing::info!("⏰ Scheduler started ({}ms tick)", self.config.tick_millis);
        true
    }

    /// Signal the loop to stop and wait (bounded) for it; in-flight jobs keep running
    pub async fn stop(&self) -> bool {
        if !self.running.swap(false, Ordering::SeqCst) {
            tracing::warn!("Scheduler is not running");
            return false;
        }
        self.shutdown.notify_one();

        if let Some(handle) = self.handle.lock().await.take() {
            let limit = Duration::from_secs(self.config.stop_timeout_secs);
            let abort = handle.abort_handle();
            if tokio::time::timeout(limit, handle).await.is_err() {
                tracing::warn!("Scheduler loop did not exit within {:?}, aborting", limit);
                abort.abort();
            }
        }

        tracing::info!("Scheduler stopped");
        true
    }
}

fn spawn_worker(task: &ScheduledTask) {
    let id = task.id.clone();
    let job = task.job.clone();
    let guard = InFlightGuard::enter(task.stats.clone());

    tokio::spawn(async move {
        let stats = guard.0.clone();
        let started = Instant::now();
        // the inner task turns a panic into a JoinError we can record
        let result = tokio::spawn(job()).await;
        let elapsed = started.elapsed();

        stats.run_count.fetch_add(1, Ordering::SeqCst);
        stats.record_duration(elapsed);

        match result {
            Ok(Ok(())) => tracing::debug!("Executed task '{}' in {:.2?}", id, elapsed),
            Ok(Err(e)) => {
                stats.failure_count.fetch_add(1, Ordering::SeqCst);
                stats.record_error(e.to_string());
                tracing::error!("Error executing task '{}': {:#}", id, e);
            }
            Err(e) => {
                let reason = if e.is_panic() { "panicked" } else { "cancelled" };
                stats.failure_count.fetch_add(1, Ordering::SeqCst);
                stats.record_error(format!("task {}", reason));
                tracing::error!("Task '{}' {} after {:.2?}", id, reason, elapsed);
            }
        }
        drop(guard);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::sync::atomic::AtomicU32;

    fn at(h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 6)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    fn counting_job(counter: Arc<AtomicU32>) -> Job {
        job(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    /// Run pending tasks at a wall-clock time whose monotonic twin sits the
    /// same distance from `base` as the time from midnight
    async fn tick(scheduler: &Scheduler, base: Instant, h: u32, mi: u32, s: u32) -> Vec<String> {
        let offset = Duration::from_secs(u64::from(h * 3600 + mi * 60 + s));
        scheduler.run_pending(at(h, mi, s), base + offset).await
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_schedule_generates_ids_and_rejects_bad_time() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let noop = job(|| async { Ok(()) });

        assert!(scheduler.schedule(noop.clone(), 60, None, None, false).await);
        assert!(scheduler.task_info("task_1").await.is_some());

        assert!(!scheduler.schedule(noop.clone(), 60, Some("bad"), Some("25:99"), false).await);
        assert!(scheduler.task_info("bad").await.is_none());

        assert!(scheduler.schedule(noop, 0, Some("daily"), Some("07:15"), false).await);
        assert_eq!(scheduler.task_info("daily").await.unwrap().schedule, "daily 07:15");
    }

    #[tokio::test]
    async fn test_interval_task_runs_on_first_tick_then_waits() {
        let t0 = Instant::now();
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let counter = Arc::new(AtomicU32::new(0));
        scheduler
            .add_job("every_minute", TaskKind::every(60), counting_job(counter.clone()), false)
            .await
            .unwrap();

        assert_eq!(tick(&scheduler, t0, 10, 0, 0).await, vec!["every_minute"]);
        assert!(tick(&scheduler, t0, 10, 0, 30).await.is_empty());
        assert_eq!(tick(&scheduler, t0, 10, 1, 0).await.len(), 1);

        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.task_info("every_minute").await.unwrap().run_count, 2);
    }

    #[tokio::test]
    async fn test_backward_clock_step_does_not_stall_intervals() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let counter = Arc::new(AtomicU32::new(0));
        scheduler
            .add_job("every_minute", TaskKind::every(60), counting_job(counter.clone()), false)
            .await
            .unwrap();

        let t0 = Instant::now();
        assert_eq!(scheduler.run_pending(at(10, 0, 0), t0).await.len(), 1);
        // wall clock set back an hour; a real minute later the task still fires
        let after = t0 + Duration::from_secs(60);
        assert_eq!(scheduler.run_pending(at(9, 1, 0), after).await.len(), 1);
        assert!(scheduler
            .run_pending(at(9, 1, 30), after + Duration::from_secs(30))
            .await
            .is_empty());

        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        let info = scheduler.task_info("every_minute").await.unwrap();
        assert_eq!(info.last_run, Some(at(9, 1, 0)));
    }

    #[tokio::test]
    async fn test_overwrite_and_remove() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let noop = job(|| async { Ok(()) });
        scheduler.add_job("a", TaskKind::every(10), noop.clone(), false).await.unwrap();
        scheduler.add_job("a", TaskKind::every(20), noop, false).await.unwrap();

        assert_eq!(scheduler.list_tasks().await.len(), 1);
        assert_eq!(scheduler.task_info("a").await.unwrap().schedule, "every 20s");
        assert!(scheduler.remove_task("a").await);
        assert!(!scheduler.remove_task("a").await);
    }

    #[tokio::test]
    async fn test_pause_non_critical_and_resume_all() {
        let t0 = Instant::now();
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let counter = Arc::new(AtomicU32::new(0));
        scheduler.add_job("critical", TaskKind::every(1), counting_job(counter.clone()), true).await.unwrap();
        scheduler.add_job("report", TaskKind::every(1), counting_job(counter.clone()), false).await.unwrap();
        scheduler.add_job("cleanup", TaskKind::every(1), counting_job(counter.clone()), false).await.unwrap();

        assert_eq!(scheduler.pause_non_critical_tasks().await, 2);
        assert_eq!(tick(&scheduler, t0, 1, 0, 0).await, vec!["critical"]);

        // paused tasks stay silent no matter how much time passes
        assert_eq!(tick(&scheduler, t0, 23, 0, 0).await, vec!["critical"]);

        assert_eq!(scheduler.resume_all_tasks().await, 2);
        assert_eq!(tick(&scheduler, t0, 23, 0, 1).await.len(), 3);
    }

    #[tokio::test]
    async fn test_failing_task_does_not_affect_others() {
        let t0 = Instant::now();
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let counter = Arc::new(AtomicU32::new(0));
        scheduler
            .add_job("boom", TaskKind::every(1), job(|| async { anyhow::bail!("exploded") }), false)
            .await
            .unwrap();
        scheduler.add_job("fine", TaskKind::every(1), counting_job(counter.clone()), false).await.unwrap();

        assert_eq!(tick(&scheduler, t0, 2, 0, 0).await.len(), 2);
        settle().await;

        let boom = scheduler.task_info("boom").await.unwrap();
        assert_eq!(boom.failure_count, 1);
        assert_eq!(boom.last_error.as_deref(), Some("exploded"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_task_is_recorded_as_failure() {
        let t0 = Instant::now();
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let counter = Arc::new(AtomicU32::new(0));
        let panics = job(|| async {
            if true {
                panic!("bad state");
            }
            Ok(())
        });
        scheduler.add_job("panics", TaskKind::every(1), panics, false).await.unwrap();
        scheduler.add_job("fine", TaskKind::every(1), counting_job(counter.clone()), false).await.unwrap();

        assert_eq!(tick(&scheduler, t0, 3, 0, 0).await.len(), 2);
        settle().await;

        let info = scheduler.task_info("panics").await.unwrap();
        assert_eq!(info.run_count, 1);
        assert_eq!(info.failure_count, 1);
        assert_eq!(info.in_flight, 0);
        assert_eq!(info.last_error.as_deref(), Some("task panicked"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // the task keeps its schedule after a panic
        assert_eq!(tick(&scheduler, t0, 3, 0, 1).await.len(), 2);
    }

    #[tokio::test]
    async fn test_overlap_policies() {
        let t0 = Instant::now();
        let slow = job(|| async {
            std::future::pending::<()>().await;
            Ok(())
        });

        let allow = Scheduler::new(SchedulerConfig::default());
        allow.add_job("slow", TaskKind::every(1), slow.clone(), false).await.unwrap();
        tick(&allow, t0, 0, 0, 0).await;
        settle().await;
        assert_eq!(tick(&allow, t0, 0, 0, 5).await.len(), 1);
        settle().await;
        assert_eq!(allow.task_info("slow").await.unwrap().in_flight, 2);

        let skip = Scheduler::new(SchedulerConfig {
            overlap: OverlapPolicy::SkipIfRunning,
            ..SchedulerConfig::default()
        });
        skip.add_job("slow", TaskKind::every(1), slow, false).await.unwrap();
        tick(&skip, t0, 0, 0, 0).await;
        settle().await;
        assert!(tick(&skip, t0, 0, 0, 5).await.is_empty());
        let info = skip.task_info("slow").await.unwrap();
        assert_eq!(info.skipped_count, 1);
        assert_eq!(info.in_flight, 1);
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let scheduler = Scheduler::new(SchedulerConfig {
            tick_millis: 10,
            ..SchedulerConfig::default()
        });
        let counter = Arc::new(AtomicU32::new(0));
        scheduler.add_job("tick", TaskKind::every(3600), counting_job(counter.clone()), false).await.unwrap();

        assert!(scheduler.start().await);
        assert!(!scheduler.start().await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(scheduler.stop().await);
        assert!(!scheduler.stop().await);

        // fired exactly once: first tick, then the hour-long interval holds
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
