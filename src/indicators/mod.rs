// Technical indicators module
// Moving averages, RSI, and return statistics for strategies and the risk gate

pub mod moving_average;
pub mod rsi;
pub mod volatility;

pub use moving_average::{calculate_ema, calculate_sma, rolling_high, rolling_low, sma_crossover, Crossover};
pub use rsi::calculate_rsi;
pub use volatility::{annualized_volatility, pearson_correlation, simple_returns, std_dev};
