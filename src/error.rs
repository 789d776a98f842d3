//! Error types for backtesting operations.

use thiserror::Error;

/// Backtest-specific errors
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BacktestError {
    /// Invalid configuration parameter
    #[error("Invalid parameter '{param}': {reason}")]
    InvalidParameter {
        /// Parameter name
        param: String,
        /// Reason for invalidity
        reason: String,
    },

    /// Queried ticker has no price history
    #[error("Unknown ticker '{ticker}'")]
    UnknownTicker {
        /// Ticker symbol
        ticker: String,
    },

    /// Duplicate trading day within a single ticker's history
    #[error("Duplicate day {day} in price history for '{ticker}'")]
    DuplicateDay {
        /// Ticker symbol
        ticker: String,
        /// Offending day ordinal
        day: i64,
    },

    /// Worker pool could not be constructed
    #[error("Worker pool error: {0}")]
    Pool(String),
}

/// Result type for backtest operations
pub type Result<T> = std::result::Result<T, BacktestError>;

impl BacktestError {
    /// Create an invalid parameter error
    pub fn invalid_param(param: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            param: param.into(),
            reason: reason.into(),
        }
    }

    /// Create an unknown ticker error
    pub fn unknown_ticker(ticker: impl Into<String>) -> Self {
        Self::UnknownTicker {
            ticker: ticker.into(),
        }
    }

    /// Create a duplicate day error
    pub fn duplicate_day(ticker: impl Into<String>, day: i64) -> Self {
        Self::DuplicateDay {
            ticker: ticker.into(),
            day,
        }
    }
}
