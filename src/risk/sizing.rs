/// Inputs to the risk-based position size
#[derive(Debug, Clone, Copy)]
pub struct SizingInput {
    pub balance: f64,
    /// Percent of balance put at risk, already scaled for drawdown
    pub risk_percent: f64,
    pub price: f64,
    pub stop_loss: Option<f64>,
    /// Cap on position value as percent of balance
    pub max_position_percent: f64,
}

/// Largest quantity the cap permits at `price`
pub fn max_position_quantity(balance: f64, max_position_percent: f64, price: f64) -> f64 {
    if balance <= 0.0 || price <= 0.0 || max_position_percent <= 0.0 {
        return 0.0;
    }
    balance * max_position_percent / 100.0 / price
}

/// Risk-based size, capped at the maximum position and rounded down to the
/// symbol's precision; never negative
///
/// With a stop the size is `risk_amount / stop_distance_percent`; without one
/// it is `risk_amount / price`.
pub fn position_size(input: &SizingInput, symbol: &str) -> f64 {
    let SizingInput {
        balance,
        risk_percent,
        price,
        stop_loss,
        max_position_percent,
    } = *input;

    let max_quantity = max_position_quantity(balance, max_position_percent, price);
    if max_quantity <= 0.0 || risk_percent <= 0.0 {
        return 0.0;
    }

    let risk_amount = balance * risk_percent / 100.0;
    let raw = match stop_loss {
        Some(stop) => {
            let distance_percent = (price - stop).abs() / price * 100.0;
            if distance_percent > 0.0 {
                risk_amount / distance_percent
            } else {
                max_quantity * 0.5
            }
        }
        None => risk_amount / price,
    };

    round_quantity(raw.clamp(0.0, max_quantity), symbol)
}

/// Decimal places allowed for a symbol's quantity
pub fn quantity_precision(symbol: &str) -> u32 {
    if symbol.contains("BTC") {
        6
    } else if symbol.contains("ETH") {
        5
    } else {
        2
    }
}

/// Floor to the symbol's precision so rounding never breaches the cap
pub fn round_quantity(quantity: f64, symbol: &str) -> f64 {
    if !quantity.is_finite() || quantity <= 0.0 {
        return 0.0;
    }
    let factor = 10f64.powi(quantity_precision(symbol) as i32);
    // nudge before flooring so 4.999999999 from float noise stays 5
    ((quantity * factor) + 1e-9).floor() / factor
}
