use serde::{Deserialize, Serialize};
use std::fmt;

/// Discretized risk-reduction level derived from the decline below peak equity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DrawdownStage {
    #[default]
    Normal,
    /// Trading allowed, sizing reduced
    Reduced,
    /// No new entries, exits allowed
    EntriesPaused,
    /// Only closing trades
    ClosingOnly,
    /// Everything rejected
    Halted,
}

impl DrawdownStage {
    pub const ALL: [DrawdownStage; 5] = [
        DrawdownStage::Normal,
        DrawdownStage::Reduced,
        DrawdownStage::EntriesPaused,
        DrawdownStage::ClosingOnly,
        DrawdownStage::Halted,
    ];

    /// Stage for a drawdown percent against ascending thresholds for stages 1..=4
    pub fn from_drawdown(drawdown_percent: f64, thresholds: &[f64; 4]) -> Self {
        let crossed = thresholds
            .iter()
            .take_while(|t| drawdown_percent >= **t)
            .count();
        Self::ALL[crossed]
    }

    /// Stage for a (peak, current) equity pair; a non-positive peak is stage 0
    pub fn from_equity(peak: f64, current: f64, thresholds: &[f64; 4]) -> Self {
        Self::from_drawdown(drawdown_percent(peak, current), thresholds)
    }

    pub fn level(&self) -> u8 {
        *self as u8
    }

    pub fn allows_entries(&self) -> bool {
        *self <= DrawdownStage::Reduced
    }

    pub fn allows_exits(&self) -> bool {
        *self < DrawdownStage::Halted
    }

    /// Multiplier on the base risk percent
    pub fn sizing_multiplier(&self, stage1: f64, stage2: f64) -> f64 {
        match self {
            DrawdownStage::Normal => 1.0,
            DrawdownStage::Reduced => stage1,
            _ => stage2,
        }
    }
}

impl fmt::Display for DrawdownStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage {}", self.level())
    }
}

/// Percent decline of `current` below `peak`, never negative
pub fn drawdown_percent(peak: f64, current: f64) -> f64 {
    if peak <= 0.0 {
        return 0.0;
    }
    ((peak - current) / peak * 100.0).max(0.0)
}

/// Running peak/current equity pair
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct EquityTracker {
    pub peak: f64,
    pub current: f64,
}

impl EquityTracker {
    pub fn observe(&mut self, equity: f64) {
        self.current = equity;
        if equity > self.peak {
            self.peak = equity;
        }
    }

    pub fn drawdown_percent(&self) -> f64 {
        drawdown_percent(self.peak, self.current)
    }

    pub fn stage(&self, thresholds: &[f64; 4]) -> DrawdownStage {
        DrawdownStage::from_equity(self.peak, self.current, thresholds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLDS: [f64; 4] = [5.0, 10.0, 15.0, 20.0];

    #[test]
    fn test_stage_boundaries() {
        assert_eq!(DrawdownStage::from_drawdown(0.0, &THRESHOLDS), DrawdownStage::Normal);
        assert_eq!(DrawdownStage::from_drawdown(4.99, &THRESHOLDS), DrawdownStage::Normal);
        assert_eq!(DrawdownStage::from_drawdown(5.0, &THRESHOLDS), DrawdownStage::Reduced);
        assert_eq!(DrawdownStage::from_drawdown(12.0, &THRESHOLDS), DrawdownStage::EntriesPaused);
        assert_eq!(DrawdownStage::from_drawdown(15.0, &THRESHOLDS), DrawdownStage::ClosingOnly);
        assert_eq!(DrawdownStage::from_drawdown(22.0, &THRESHOLDS), DrawdownStage::Halted);
        assert_eq!(DrawdownStage::from_drawdown(100.0, &THRESHOLDS).level(), 4);
    }

    #[test]
    fn test_stage_is_monotone_in_drawdown() {
        let peak = 10_000.0;
        let mut previous = DrawdownStage::Normal;
        for step in 0..=1000 {
            let current = peak - step as f64 * 10.0;
            let stage = DrawdownStage::from_equity(peak, current, &THRESHOLDS);
            assert!(stage >= previous, "stage fell at equity {}", current);
            // deterministic for the same inputs
            assert_eq!(stage, DrawdownStage::from_equity(peak, current, &THRESHOLDS));
            previous = stage;
        }
        assert_eq!(previous, DrawdownStage::Halted);
    }

    #[test]
    fn test_zero_peak_and_gains() {
        assert_eq!(DrawdownStage::from_equity(0.0, 0.0, &THRESHOLDS), DrawdownStage::Normal);
        assert_eq!(DrawdownStage::from_equity(100.0, 150.0, &THRESHOLDS), DrawdownStage::Normal);
    }

    #[test]
    fn test_permissions_and_multipliers() {
        assert!(DrawdownStage::Reduced.allows_entries());
        assert!(!DrawdownStage::EntriesPaused.allows_entries());
        assert!(DrawdownStage::ClosingOnly.allows_exits());
        assert!(!DrawdownStage::Halted.allows_exits());

        assert_eq!(DrawdownStage::Normal.sizing_multiplier(0.75, 0.5), 1.0);
        assert_eq!(DrawdownStage::Reduced.sizing_multiplier(0.75, 0.5), 0.75);
        assert_eq!(DrawdownStage::Halted.sizing_multiplier(0.75, 0.5), 0.5);
    }

    #[test]
    fn test_tracker_keeps_peak() {
        let mut tracker = EquityTracker::default();
        tracker.observe(10_000.0);
        tracker.observe(12_000.0);
        tracker.observe(9_000.0);

        assert_eq!(tracker.peak, 12_000.0);
        assert!((tracker.drawdown_percent() - 25.0).abs() < 1e-9);
        assert_eq!(tracker.stage(&THRESHOLDS), DrawdownStage::Halted);
    }
}
