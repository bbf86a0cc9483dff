// Self-healing supervisor: per-subsystem check, heal, and escalation
pub mod checks;
pub mod resources;
pub mod strategy;
pub mod supervisor;

pub use checks::{ApiProbe, DatabaseProbe, EngineProbe, SystemProbe};
pub use resources::{cleanup_old_logs, ResourceMonitor, ResourceUsage};
pub use strategy::{Alert, HealingPolicy, HealingStrategy, HealthProbe, RecoveryStep, Severity, StrategyStats};
pub use supervisor::{Component, ComponentStatus, Supervisor, SystemDiagnostics};
