/// Relative Strength Index with Wilder smoothing
///
/// Above 70 reads as overbought, below 30 as oversold.
pub fn calculate_rsi(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period + 1 {
        return None;
    }

    let changes: Vec<f64> = prices.windows(2).map(|w| w[1] - w[0]).collect();

    let (seed, rest) = changes.split_at(period);
    let mut avg_gain = seed.iter().filter(|c| **c > 0.0).sum::<f64>() / period as f64;
    let mut avg_loss = seed.iter().filter(|c| **c < 0.0).map(|c| -c).sum::<f64>() / period as f64;

    let n = period as f64;
    for change in rest {
        avg_gain = (avg_gain * (n - 1.0) + change.max(0.0)) / n;
        avg_loss = (avg_loss * (n - 1.0) + (-change).max(0.0)) / n;
    }

    if avg_loss == 0.0 {
        return Some(if avg_gain == 0.0 { 50.0 } else { 100.0 });
    }

    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rsi_bounds() {
        let prices = vec![
            44.0, 44.25, 44.5, 43.75, 44.0, 44.5, 45.0, 45.5, 45.25, 45.5, 46.0, 46.5, 46.25,
            46.0, 46.5, 46.75,
        ];
        let rsi = calculate_rsi(&prices, 14).unwrap();
        assert!(rsi > 50.0 && rsi < 100.0);
    }

    #[test]
    fn test_rsi_extremes() {
        let rising: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        assert_eq!(calculate_rsi(&rising, 14), Some(100.0));

        let falling: Vec<f64> = (0..20).map(|i| 100.0 - i as f64).collect();
        assert!(calculate_rsi(&falling, 14).unwrap() < 1.0);

        let flat = vec![100.0; 20];
        assert_eq!(calculate_rsi(&flat, 14), Some(50.0));
    }

    #[test]
    fn test_rsi_insufficient_data() {
        assert!(calculate_rsi(&[100.0, 101.0], 14).is_none());
    }
}
