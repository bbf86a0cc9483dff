use chrono::{Datelike, NaiveDateTime, Timelike, Weekday};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

pub type JobFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// A re-invocable unit of scheduled work
pub type Job = Arc<dyn Fn() -> JobFuture + Send + Sync>;

/// Wrap an async closure as a `Job`
pub fn job<F, Fut>(f: F) -> Job
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()) as JobFuture)
}

/// When a task is due
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Interval { every: Duration },
    Daily { hour: u32, minute: u32 },
    Weekly { weekday: Weekday, hour: u32, minute: u32 },
    Monthly { day: u32, hour: u32, minute: u32 },
}

impl TaskKind {
    pub fn every(secs: u64) -> Self {
        TaskKind::Interval {
            every: Duration::from_secs(secs),
        }
    }

    /// Reject calendar fields that can never match
    pub fn validate(&self) -> bool {
        match *self {
            TaskKind::Interval { .. } => true,
            TaskKind::Daily { hour, minute } | TaskKind::Weekly { hour, minute, .. } => {
                hour < 24 && minute < 60
            }
            TaskKind::Monthly { day, hour, minute } => (1..=31).contains(&day) && hour < 24 && minute < 60,
        }
    }

    fn calendar_matches(&self, now: NaiveDateTime) -> bool {
        let at = |hour: u32, minute: u32| now.hour() == hour && now.minute() == minute;
        match *self {
            TaskKind::Interval { .. } => false,
            TaskKind::Daily { hour, minute } => at(hour, minute),
            TaskKind::Weekly {
                weekday,
                hour,
                minute,
            } => now.weekday() == weekday && at(hour, minute),
            TaskKind::Monthly { day, hour, minute } => now.day() == day && at(hour, minute),
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Interval { every } => write!(f, "every {}s", every.as_secs_f64()),
            TaskKind::Daily { hour, minute } => write!(f, "daily {:02}:{:02}", hour, minute),
            TaskKind::Weekly {
                weekday,
                hour,
                minute,
            } => write!(f, "weekly {} {:02}:{:02}", weekday, hour, minute),
            TaskKind::Monthly { day, hour, minute } => {
                write!(f, "monthly day {} {:02}:{:02}", day, hour, minute)
            }
        }
    }
}

/// Parse "HH:MM" into (hour, minute)
pub fn parse_time_of_day(raw: &str) -> Option<(u32, u32)> {
    let (h, m) = raw.trim().split_once(':')?;
    let hour: u32 = h.parse().ok()?;
    let minute: u32 = m.parse().ok()?;
    (hour < 24 && minute < 60).then_some((hour, minute))
}

/// Counters written by workers after the registry lock is released
#[derive(Debug, Default)]
pub struct TaskStats {
    pub in_flight: AtomicUsize,
    pub run_count: AtomicU64,
    pub failure_count: AtomicU64,
    pub skipped_count: AtomicU64,
    pub last_duration: Mutex<Option<Duration>>,
    pub last_error: Mutex<Option<String>>,
}

impl TaskStats {
    pub fn record_duration(&self, duration: Duration) {
        *self.last_duration.lock().unwrap_or_else(|p| p.into_inner()) = Some(duration);
    }

    pub fn record_error(&self, error: String) {
        *self.last_error.lock().unwrap_or_else(|p| p.into_inner()) = Some(error);
    }
}

/// Decrements the in-flight count even if the job panics
pub(crate) struct InFlightGuard(pub(crate) Arc<TaskStats>);

impl InFlightGuard {
    pub(crate) fn enter(stats: Arc<TaskStats>) -> Self {
        stats.in_flight.fetch_add(1, Ordering::SeqCst);
        Self(stats)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ScheduledTask {
    pub id: String,
    pub kind: TaskKind,
    /// Wall-clock stamp of the last dispatch; calendar tasks match against it
    pub last_run: Option<NaiveDateTime>,
    /// Monotonic stamp of the last dispatch; `None` makes interval tasks due
    /// immediately
    pub last_fired: Option<Instant>,
    pub paused: bool,
    pub critical: bool,
    pub job: Job,
    pub stats: Arc<TaskStats>,
}

impl ScheduledTask {
    pub fn new(id: impl Into<String>, kind: TaskKind, job: Job, critical: bool) -> Self {
        Self {
            id: id.into(),
            kind,
            last_run: None,
            last_fired: None,
            paused: false,
            critical,
            job,
            stats: Arc::new(TaskStats::default()),
        }
    }

    /// Pure due-check; calling it does not change the task
    ///
    /// Intervals are measured on `mono` so wall-clock steps cannot stall
    /// them; `now` only drives calendar matching.
    pub fn is_due(&self, now: NaiveDateTime, mono: Instant) -> bool {
        if self.paused {
            return false;
        }

        match self.kind {
            TaskKind::Interval { every } => match self.last_fired {
                None => true,
                Some(last) => mono.saturating_duration_since(last) >= every,
            },
            _ => {
                // Any second inside the matching minute counts, once
                self.kind.calendar_matches(now)
                    && self.last_run.map_or(true, |last| minute_of(last) != minute_of(now))
            }
        }
    }

    pub fn mark_fired(&mut self, now: NaiveDateTime, mono: Instant) {
        self.last_run = Some(now);
        self.last_fired = Some(mono);
    }

    pub fn info(&self) -> TaskInfo {
        let stats = &self.stats;
        TaskInfo {
            id: self.id.clone(),
            schedule: self.kind.to_string(),
            last_run: self.last_run,
            paused: self.paused,
            critical: self.critical,
            in_flight: stats.in_flight.load(Ordering::SeqCst),
            run_count: stats.run_count.load(Ordering::SeqCst),
            failure_count: stats.failure_count.load(Ordering::SeqCst),
            skipped_count: stats.skipped_count.load(Ordering::SeqCst),
            last_duration: *stats.last_duration.lock().unwrap_or_else(|p| p.into_inner()),
            last_error: stats
                .last_error
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .clone(),
        }
    }
}

fn minute_of(t: NaiveDateTime) -> Option<NaiveDateTime> {
    t.with_second(0).and_then(|t| t.with_nanosecond(0))
}

/// Read-only snapshot of a task
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub id: String,
    pub schedule: String,
    pub last_run: Option<NaiveDateTime>,
    pub paused: bool,
    pub critical: bool,
    pub in_flight: usize,
    pub run_count: u64,
    pub failure_count: u64,
    pub skipped_count: u64,
    pub last_duration: Option<Duration>,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    fn noop() -> Job {
        job(|| async { Ok(()) })
    }

    #[test]
    fn test_job_is_reinvocable() {
        let failing = job(|| async { Err(anyhow::anyhow!("exchange down")) });
        for _ in 0..2 {
            let err = tokio_test::block_on(failing()).unwrap_err();
            assert_eq!(err.to_string(), "exchange down");
        }
        assert!(tokio_test::block_on(noop()()).is_ok());
    }

    #[test]
    fn test_interval_first_tick_fires() {
        let task = ScheduledTask::new("t", TaskKind::every(60), noop(), false);
        assert!(task.is_due(at(2024, 1, 1, 0, 0, 0), Instant::now()));
    }

    #[test]
    fn test_interval_boundary() {
        let mut task = ScheduledTask::new("t", TaskKind::every(60), noop(), false);
        let start = Instant::now();
        task.mark_fired(at(2024, 1, 1, 12, 0, 0), start);

        assert!(!task.is_due(at(2024, 1, 1, 12, 0, 59), start + Duration::from_secs(59)));
        assert!(task.is_due(at(2024, 1, 1, 12, 1, 0), start + Duration::from_secs(60)));
        assert!(task.is_due(at(2024, 1, 1, 13, 0, 0), start + Duration::from_secs(3600)));
    }

    #[test]
    fn test_interval_ignores_wall_clock_steps() {
        let mut task = ScheduledTask::new("t", TaskKind::every(60), noop(), false);
        let start = Instant::now();
        task.mark_fired(at(2024, 1, 1, 12, 0, 0), start);

        // wall clock stepped back an hour while a minute really passed
        assert!(task.is_due(at(2024, 1, 1, 11, 1, 0), start + Duration::from_secs(60)));
        // wall clock jumped forward a day while only a second passed
        assert!(!task.is_due(at(2024, 1, 2, 12, 0, 0), start + Duration::from_secs(1)));
    }

    #[test]
    fn test_due_check_is_idempotent() {
        let task = ScheduledTask::new("t", TaskKind::every(5), noop(), false);
        let now = at(2024, 1, 1, 0, 0, 0);
        let mono = Instant::now();
        assert!(task.is_due(now, mono));
        assert!(task.is_due(now, mono));
        assert!(task.last_run.is_none());
        assert!(task.last_fired.is_none());
    }

    #[test]
    fn test_paused_never_due() {
        let mut task = ScheduledTask::new("t", TaskKind::every(1), noop(), false);
        let start = Instant::now();
        task.mark_fired(at(2000, 1, 1, 0, 0, 0), start);
        task.paused = true;
        assert!(!task.is_due(at(2024, 1, 1, 0, 0, 0), start + Duration::from_secs(3600)));
    }

    #[test]
    fn test_daily_fires_once_per_minute_despite_drift() {
        let mut task = ScheduledTask::new("d", TaskKind::Daily { hour: 9, minute: 30 }, noop(), false);
        let mono = Instant::now();

        // tick landed late in the minute
        let late = at(2024, 3, 5, 9, 30, 1);
        assert!(task.is_due(late, mono));
        task.mark_fired(late, mono);

        assert!(!task.is_due(at(2024, 3, 5, 9, 30, 2), mono));
        assert!(!task.is_due(at(2024, 3, 5, 9, 31, 0), mono));
        assert!(task.is_due(at(2024, 3, 6, 9, 30, 0), mono));
    }

    #[test]
    fn test_weekly_and_monthly_match() {
        // 2024-03-04 is a Monday
        let weekly = ScheduledTask::new(
            "w",
            TaskKind::Weekly {
                weekday: Weekday::Mon,
                hour: 8,
                minute: 0,
            },
            noop(),
            false,
        );
        let mono = Instant::now();
        assert!(weekly.is_due(at(2024, 3, 4, 8, 0, 0), mono));
        assert!(!weekly.is_due(at(2024, 3, 5, 8, 0, 0), mono));

        let monthly = ScheduledTask::new(
            "m",
            TaskKind::Monthly {
                day: 1,
                hour: 3,
                minute: 0,
            },
            noop(),
            false,
        );
        assert!(monthly.is_due(at(2024, 4, 1, 3, 0, 0), mono));
        assert!(!monthly.is_due(at(2024, 4, 2, 3, 0, 0), mono));
    }

    #[test]
    fn test_parse_time_of_day() {
        assert_eq!(parse_time_of_day("09:05"), Some((9, 5)));
        assert_eq!(parse_time_of_day("24:00"), None);
        assert_eq!(parse_time_of_day("noon"), None);
        assert_eq!(parse_time_of_day("12"), None);
    }
}
