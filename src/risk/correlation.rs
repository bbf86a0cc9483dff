use std::collections::HashMap;

use crate::indicators::{pearson_correlation, simple_returns};

/// Symmetric symbol-pair correlation coefficients in [0, 1]
#[derive(Debug, Clone, Default)]
pub struct CorrelationTable {
    pairs: HashMap<(String, String), f64>,
}

fn key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// |Pearson| of period returns for every pair of series with enough data
    pub fn from_closes(closes: &HashMap<String, Vec<f64>>) -> Self {
        let returns: Vec<(&String, Vec<f64>)> = closes
            .iter()
            .map(|(symbol, series)| (symbol, simple_returns(series)))
            .filter(|(_, r)| r.len() >= 2)
            .collect();

        let mut table = Self::new();
        for (i, (a, ra)) in returns.iter().enumerate() {
            for (b, rb) in returns.iter().skip(i + 1) {
                if let Some(coefficient) = pearson_correlation(ra, rb) {
                    table.set(a, b, coefficient.abs());
                }
            }
        }
        table
    }

    pub fn set(&mut self, a: &str, b: &str, coefficient: f64) {
        if a == b {
            return;
        }
        self.pairs.insert(key(a, b), coefficient.clamp(0.0, 1.0));
    }

    /// Known coefficient for a pair; a symbol with itself is 1.0
    pub fn get(&self, a: &str, b: &str) -> Option<f64> {
        if a == b {
            return Some(1.0);
        }
        self.pairs.get(&key(a, b)).copied()
    }

    pub fn get_or(&self, a: &str, b: &str, default: f64) -> f64 {
        self.get(a, b).unwrap_or(default)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Overlay another table's pairs onto this one
    pub fn merge(&mut self, other: &CorrelationTable) {
        for (k, v) in &other.pairs {
            self.pairs.insert(k.clone(), *v);
        }
    }

    /// Mean coefficient over all distinct pairs of `symbols`; 0 with fewer than two
    pub fn average_among(&self, symbols: &[String], default: f64) -> f64 {
        let mut sum = 0.0;
        let mut count = 0usize;
        for (i, a) in symbols.iter().enumerate() {
            for b in symbols.iter().skip(i + 1) {
                sum += self.get_or(a, b, default);
                count += 1;
            }
        }
        if count == 0 {
            0.0
        } else {
            sum / count as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symmetric_lookup_and_self() {
        let mut table = CorrelationTable::new();
        table.set("BTC/USDT", "ETH/USDT", 0.85);

        assert_eq!(table.get("ETH/USDT", "BTC/USDT"), Some(0.85));
        assert_eq!(table.get("BTC/USDT", "BTC/USDT"), Some(1.0));
        assert_eq!(table.get_or("BTC/USDT", "SOL/USDT", 0.3), 0.3);
    }

    #[test]
    fn test_from_closes_uses_absolute_return_correlation() {
        let up: Vec<f64> = vec![100.0, 101.0, 103.0, 102.0, 105.0, 107.0];
        let mirrored: Vec<f64> = up.iter().map(|p| 200.0 - p).collect();
        let mut closes = HashMap::new();
        closes.insert("A".to_string(), up.clone());
        closes.insert("B".to_string(), up.iter().map(|p| p * 2.0).collect());
        closes.insert("C".to_string(), mirrored);

        let table = CorrelationTable::from_closes(&closes);
        assert!((table.get("A", "B").unwrap() - 1.0).abs() < 1e-9);
        // inverse movers still count as co-moving
        assert!(table.get("A", "C").unwrap() > 0.9);
    }

    #[test]
    fn test_average_among() {
        let mut table = CorrelationTable::new();
        table.set("A", "B", 0.9);
        table.set("A", "C", 0.5);
        let symbols = vec!["A".to_string(), "B".to_string(), "C".to_string()];

        // B-C falls back to the default 0.3
        let avg = table.average_among(&symbols, 0.3);
        assert!((avg - (0.9 + 0.5 + 0.3) / 3.0).abs() < 1e-9);
        assert_eq!(table.average_among(&symbols[..1], 0.3), 0.0);
    }
}
