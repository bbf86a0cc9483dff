use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Check and repair hooks for one monitored subsystem
///
/// `check` returning `Err` means the probe itself broke, which is different
/// from a subsystem reported unhealthy (`Ok(false)`).
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> Result<bool>;

    async fn heal(&self) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealingPolicy {
    pub severity: Severity,
    pub max_attempts: u32,
    pub backoff_factor: f64,
    pub initial_delay: Duration,
}

impl HealingPolicy {
    pub fn database() -> Self {
        Self::critical(5, Duration::from_secs(5))
    }

    pub fn api_connections() -> Self {
        Self::critical(5, Duration::from_secs(5))
    }

    pub fn system_health() -> Self {
        Self {
            severity: Severity::Warning,
            max_attempts: 3,
            backoff_factor: 2.0,
            initial_delay: Duration::from_secs(5),
        }
    }

    pub fn trading_engine() -> Self {
        Self::critical(3, Duration::from_secs(10))
    }

    fn critical(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            severity: Severity::Critical,
            max_attempts,
            backoff_factor: 2.0,
            initial_delay,
        }
    }

    /// `initial_delay × backoff_factor^(attempt-1)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        self.initial_delay
            .mul_f64(self.backoff_factor.powi(exponent))
    }
}

/// What the supervisor should do after a failed check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStep {
    /// Run the heal action for this attempt
    Heal { attempt: u32 },
    /// Attempts are exhausted; alert once and stop retrying
    Escalate,
    /// Already escalated; waiting for a manual reset
    Suspended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alert {
    /// Heal failed on the last allowed attempt
    Critical,
    ManualIntervention,
}

/// A named check/heal/escalate unit with its attempt counter
pub struct HealingStrategy {
    pub name: String,
    pub policy: HealingPolicy,
    probe: Arc<dyn HealthProbe>,
    attempts: u32,
    suspended: bool,
    last_check: Option<DateTime<Utc>>,
    last_healthy: Option<bool>,
}

impl HealingStrategy {
    pub fn new(name: impl Into<String>, policy: HealingPolicy, probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            name: name.into(),
            policy,
            probe,
            attempts: 0,
            suspended: false,
            last_check: None,
            last_healthy: None,
        }
    }

    pub fn probe(&self) -> Arc<dyn HealthProbe> {
        self.probe.clone()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn record_check(&mut self, healthy: bool) {
        self.last_check = Some(Utc::now());
        self.last_healthy = Some(healthy);
    }

    /// Count a failed check and decide the next step, with the delay to wait
    /// before taking it
    pub fn record_failure(&mut self) -> (RecoveryStep, Duration) {
        if self.suspended {
            return (RecoveryStep::Suspended, Duration::ZERO);
        }

        self.attempts += 1;
        let delay = self.policy.delay_for(self.attempts);
        if self.attempts <= self.policy.max_attempts {
            (RecoveryStep::Heal { attempt: self.attempts }, delay)
        } else {
            self.suspended = true;
            (RecoveryStep::Escalate, delay)
        }
    }

    /// A successful heal forgives one attempt; a failure on the final
    /// attempt of a critical strategy raises an alert
    pub fn on_heal_result(&mut self, healed: bool) -> Option<Alert> {
        if healed {
            self.attempts = self.attempts.saturating_sub(1);
            return None;
        }
        (self.policy.severity == Severity::Critical && self.attempts == self.policy.max_attempts)
            .then_some(Alert::Critical)
    }

    /// Manual reset: clears the counter and lifts a suspension
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.suspended = false;
    }

    pub fn stats(&self) -> StrategyStats {
        StrategyStats {
            attempts: self.attempts,
            max_attempts: self.policy.max_attempts,
            severity: self.policy.severity,
            suspended: self.suspended,
            last_check: self.last_check,
            last_healthy: self.last_healthy,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StrategyStats {
    pub attempts: u32,
    pub max_attempts: u32,
    pub severity: Severity,
    pub suspended: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub last_healthy: Option<bool>,
}
