// Risk management: drawdown staging, sizing, correlation gate, portfolio sweep
pub mod correlation;
pub mod drawdown;
pub mod gate;
pub mod portfolio;
pub mod sizing;
pub mod state;

pub use correlation::CorrelationTable;
pub use drawdown::{drawdown_percent, DrawdownStage, EquityTracker};
pub use gate::{Admission, RejectReason, RiskGate};
pub use portfolio::{ActionType, PortfolioAssessment, PortfolioMetrics, RiskAction, Severity};
pub use sizing::{max_position_quantity, position_size, round_quantity, SizingInput};
pub use state::{HeldPosition, RiskSnapshot, UserRiskState};
