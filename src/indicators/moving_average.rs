/// Simple Moving Average over the last `period` values
pub fn calculate_sma(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let window = &prices[prices.len() - period..];
    Some(window.iter().sum::<f64>() / period as f64)
}

/// Exponential Moving Average seeded with the SMA of the first `period` values
pub fn calculate_ema(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let k = 2.0 / (period as f64 + 1.0);
    let seed = prices[..period].iter().sum::<f64>() / period as f64;

    Some(prices[period..].iter().fold(seed, |ema, p| (p - ema) * k + ema))
}

/// Highest value among the `period` values preceding the last one
pub fn rolling_high(prices: &[f64], period: usize) -> Option<f64> {
    prior_window(prices, period).map(|w| w.iter().cloned().fold(f64::MIN, f64::max))
}

/// Lowest value among the `period` values preceding the last one
pub fn rolling_low(prices: &[f64], period: usize) -> Option<f64> {
    prior_window(prices, period).map(|w| w.iter().cloned().fold(f64::MAX, f64::min))
}

fn prior_window(prices: &[f64], period: usize) -> Option<&[f64]> {
    if period == 0 || prices.len() < period + 1 {
        return None;
    }
    let end = prices.len() - 1;
    Some(&prices[end - period..end])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crossover {
    /// Fast average moved above the slow one on the latest value
    Bullish,
    /// Fast average moved below the slow one on the latest value
    Bearish,
    None,
}

/// Compare fast/slow SMA relation on the latest value against the one before
pub fn sma_crossover(prices: &[f64], fast: usize, slow: usize) -> Option<Crossover> {
    if prices.len() < slow + 1 {
        return None;
    }

    let previous = &prices[..prices.len() - 1];
    let prev_diff = calculate_sma(previous, fast)? - calculate_sma(previous, slow)?;
    let diff = calculate_sma(prices, fast)? - calculate_sma(prices, slow)?;

    Some(if prev_diff <= 0.0 && diff > 0.0 {
        Crossover::Bullish
    } else if prev_diff >= 0.0 && diff < 0.0 {
        Crossover::Bearish
    } else {
        Crossover::None
    })
}
