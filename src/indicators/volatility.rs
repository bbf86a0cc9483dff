/// Period-over-period simple returns
pub fn simple_returns(prices: &[f64]) -> Vec<f64> {
    prices
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect()
}

/// Population standard deviation
pub fn std_dev(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some(variance.sqrt())
}

/// Annualized volatility in percent from closes sampled `periods_per_year` times a year
///
/// Fewer than two closes yields 0.
pub fn annualized_volatility(closes: &[f64], periods_per_year: f64) -> f64 {
    let returns = simple_returns(closes);
    std_dev(&returns)
        .map(|sd| sd * periods_per_year.sqrt() * 100.0)
        .unwrap_or(0.0)
}

/// Pearson correlation of two equally long series; `None` when undefined
pub fn pearson_correlation(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len().min(b.len());
    if n < 2 {
        return None;
    }
    let (a, b) = (&a[a.len() - n..], &b[b.len() - n..]);

    let mean_a = a.iter().sum::<f64>() / n as f64;
    let mean_b = b.iter().sum::<f64>() / n as f64;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (x, y) in a.iter().zip(b) {
        let dx = x - mean_a;
        let dy = y - mean_b;
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }

    if var_a == 0.0 || var_b == 0.0 {
        return None;
    }
    Some(cov / (var_a.sqrt() * var_b.sqrt()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_prices_have_zero_volatility() {
        assert_eq!(annualized_volatility(&[100.0; 24], 24.0 * 365.0), 0.0);
        assert_eq!(annualized_volatility(&[100.0], 24.0 * 365.0), 0.0);
    }

    #[test]
    fn test_volatility_scales_with_swings() {
        let calm: Vec<f64> = (0..24).map(|i| if i % 2 == 0 { 100.0 } else { 100.1 }).collect();
        let wild: Vec<f64> = (0..24).map(|i| if i % 2 == 0 { 100.0 } else { 105.0 }).collect();
        assert!(annualized_volatility(&wild, 8760.0) > annualized_volatility(&calm, 8760.0));
    }

    #[test]
    fn test_pearson() {
        let a = vec![1.0, 2.0, 3.0, 4.0];
        let b = vec![2.0, 4.0, 6.0, 8.0];
        let c = vec![8.0, 6.0, 4.0, 2.0];
        assert!((pearson_correlation(&a, &b).unwrap() - 1.0).abs() < 1e-9);
        assert!((pearson_correlation(&a, &c).unwrap() + 1.0).abs() < 1e-9);
        assert!(pearson_correlation(&a, &[1.0, 1.0, 1.0, 1.0]).is_none());
    }
}
