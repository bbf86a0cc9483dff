use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use super::state::UserRiskState;
use crate::config::RiskConfig;
use crate::models::UserId;

/// Aggregate exposure figures for one user's book
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct PortfolioMetrics {
    pub position_count: usize,
    pub total_exposure: f64,
    pub exposure_percent: f64,
    pub highest_concentration: f64,
    pub concentration_symbol: String,
    pub portfolio_correlation: f64,
    pub potential_drawdown: f64,
    pub value_at_risk: f64,
    pub overnight_exposure: f64,
    pub volatility_exposure: f64,
}

impl PortfolioMetrics {
    pub fn from_state(state: &UserRiskState, default_correlation: f64) -> Self {
        let mut metrics = PortfolioMetrics {
            position_count: state.positions.len(),
            ..Default::default()
        };
        if state.positions.is_empty() {
            return metrics;
        }

        // sorted so ties pick the same symbol every run
        let mut largest = (String::new(), 0.0_f64);
        for symbol in state.symbols() {
            let value = state.positions[&symbol].notional();
            metrics.total_exposure += value;
            if value > largest.1 {
                largest = (symbol, value);
            }
        }

        let equity = state.equity.current;
        if equity > 0.0 {
            metrics.exposure_percent = metrics.total_exposure / equity * 100.0;
        }
        if metrics.total_exposure > 0.0 {
            metrics.highest_concentration = largest.1 / metrics.total_exposure * 100.0;
            metrics.concentration_symbol = largest.0;
        }

        metrics.portfolio_correlation = state
            .correlations
            .average_among(&state.symbols(), default_correlation);
        metrics.potential_drawdown = metrics.exposure_percent * 0.1;
        metrics.value_at_risk = metrics.total_exposure * 0.05;
        metrics.overnight_exposure = metrics.total_exposure;
        metrics.volatility_exposure = metrics.total_exposure * 0.2;
        metrics
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    ReduceExposure,
    ReduceConcentration,
    Diversify,
    ReduceOvernight,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::ReduceExposure => "reduce_exposure",
            ActionType::ReduceConcentration => "reduce_concentration",
            ActionType::Diversify => "diversify",
            ActionType::ReduceOvernight => "reduce_overnight",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mitigation the sweep recommends
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskAction {
    pub action: ActionType,
    pub reason: String,
    pub symbol: Option<String>,
    pub threshold: f64,
    pub current: f64,
    pub severity: Severity,
    pub recommendation: String,
}

/// Actions for a set of metrics, highest severity first
pub fn determine_actions(metrics: &PortfolioMetrics, equity: f64, config: &RiskConfig) -> Vec<RiskAction> {
    let mut actions = Vec::new();

    if metrics.exposure_percent > config.exposure_limit_percent {
        actions.push(RiskAction {
            action: ActionType::ReduceExposure,
            reason: "Excessive Portfolio Allocation".to_string(),
            symbol: None,
            threshold: config.exposure_limit_percent,
            current: metrics.exposure_percent,
            severity: Severity::High,
            recommendation: "Immediately reduce total portfolio exposure".to_string(),
        });
    }

    if metrics.highest_concentration > config.concentration_limit_percent {
        actions.push(RiskAction {
            action: ActionType::ReduceConcentration,
            reason: "Overexposure to Single Asset".to_string(),
            symbol: Some(metrics.concentration_symbol.clone()),
            threshold: config.concentration_limit_percent,
            current: metrics.highest_concentration,
            severity: Severity::Medium,
            recommendation: format!(
                "Diversify positions, reduce allocation in {}",
                metrics.concentration_symbol
            ),
        });
    }

    if metrics.portfolio_correlation > config.correlation_threshold {
        actions.push(RiskAction {
            action: ActionType::Diversify,
            reason: "High Asset Correlation".to_string(),
            symbol: None,
            threshold: config.correlation_threshold,
            current: metrics.portfolio_correlation,
            severity: Severity::Medium,
            recommendation: "Introduce uncorrelated assets to reduce portfolio risk".to_string(),
        });
    }

    if metrics.potential_drawdown > config.potential_drawdown_limit_percent {
        actions.push(RiskAction {
            action: ActionType::ReduceExposure,
            reason: "High Potential Drawdown".to_string(),
            symbol: None,
            threshold: config.potential_drawdown_limit_percent,
            current: metrics.potential_drawdown,
            severity: Severity::High,
            recommendation: "Implement strict risk management to limit potential losses".to_string(),
        });
    }

    if equity > 0.0 && metrics.overnight_exposure > config.overnight_limit_percent / 100.0 * equity {
        actions.push(RiskAction {
            action: ActionType::ReduceOvernight,
            reason: "Excessive Overnight Position Risk".to_string(),
            symbol: None,
            threshold: config.overnight_limit_percent,
            current: metrics.overnight_exposure / equity * 100.0,
            severity: Severity::Medium,
            recommendation: "Reduce overnight positions to minimize after-hours risk".to_string(),
        });
    }

    // stable sort keeps detection order within a severity
    actions.sort_by(|a, b| b.severity.cmp(&a.severity));
    actions
}

/// One user's sweep outcome
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioAssessment {
    pub user_id: UserId,
    pub timestamp: DateTime<Utc>,
    pub metrics: PortfolioMetrics,
    pub actions: Vec<RiskAction>,
    /// Whether the user's max position size was shrunk by this sweep
    pub protective_applied: bool,
}

impl PortfolioAssessment {
    pub fn has_high_severity(&self) -> bool {
        self.actions.iter().any(|a| a.severity == Severity::High)
    }
}

/// User-facing summary of a set of actions; `None` when there is nothing to say
pub fn risk_notification(actions: &[RiskAction]) -> Option<String> {
    if actions.is_empty() {
        return None;
    }

    let mut message = String::from("Portfolio Risk Management Alert\n\nDetailed Risk Assessment:\n");
    for action in actions {
        let line = match action.action {
            ActionType::ReduceExposure => format!(
                "- Exposure Alert: Current {:.1}% exceeds {}% threshold\n",
                action.current, action.threshold
            ),
            ActionType::ReduceConcentration => format!(
                "- Concentration Risk: {} represents {:.1}% of portfolio\n",
                action.symbol.as_deref().unwrap_or("?"),
                action.current
            ),
            ActionType::Diversify => format!(
                "- Correlation Risk: Portfolio correlation at {:.2}\n",
                action.current
            ),
            ActionType::ReduceOvernight => format!(
                "- Overnight Exposure: {:.1}% of equity at risk\n",
                action.current
            ),
        };
        message.push_str(&line);
    }

    message.push_str("\nRecommended Immediate Actions:\n");
    let mut seen: Vec<&str> = Vec::new();
    for action in actions {
        if !seen.contains(&action.recommendation.as_str()) {
            seen.push(&action.recommendation);
            message.push_str(&format!("- {}\n", action.recommendation));
        }
    }
    Some(message)
}
