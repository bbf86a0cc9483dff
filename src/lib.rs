// Core modules
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod healing;
pub mod indicators;
pub mod logging;
pub mod models;
pub mod notify;
pub mod persistence;
pub mod risk;
pub mod scheduler;
pub mod strategy;

// Re-export commonly used types
pub use config::AppConfig;
pub use engine::{EngineHandle, TradingEngine};
pub use error::{Result, TradeError};
pub use models::*;
pub use risk::RiskGate;
pub use strategy::Strategy;
