//! # signal-backtest
//!
//! An event-driven trading-strategy backtesting and optimization engine.
//!
//! Given time-stamped entry signals per instrument and per-instrument OHLC
//! price history, the engine simulates portfolio evolution under configurable
//! exit rules (stop-loss, take-profit, time-based holding period), position
//! sizing policies, and leverage constraints, producing a trade log,
//! performance statistics, and an equity curve. A grid optimizer fans the
//! simulator out over exit-rule combinations on a bounded worker pool.
//!
//! ## Quick Start
//!
//! ```
//! use signal_backtest::{
//!     PerformanceMetrics, PriceIndex, PriceRow, Signal, SimulationConfig, Simulator,
//! };
//!
//! # fn main() -> Result<(), signal_backtest::BacktestError> {
//! let index = PriceIndex::from_rows(vec![
//!     PriceRow { ticker: "ACME".into(), day: 1, open: 100.0, high: 100.0, low: 99.0, close: 100.0, volume: 1e6 },
//!     PriceRow { ticker: "ACME".into(), day: 2, open: 110.0, high: 112.0, low: 100.0, close: 110.0, volume: 1e6 },
//!     PriceRow { ticker: "ACME".into(), day: 3, open: 118.0, high: 120.0, low: 108.0, close: 118.0, volume: 1e6 },
//!     PriceRow { ticker: "ACME".into(), day: 4, open: 119.0, high: 121.0, low: 117.0, close: 119.0, volume: 1e6 },
//! ])?;
//!
//! let config = SimulationConfig::builder()
//!     .initial_capital(100_000.0)
//!     .holding_period_days(3)
//!     .stop_loss_pct(5.0)
//!     .take_profit_pct(10.0)
//!     .build()?;
//!
//! let result = Simulator::new(config).run(&index, &[Signal::new("ACME", 1)]);
//! let metrics = PerformanceMetrics::calculate(&result.trades, 100_000.0);
//!
//! println!("Return: {:.2}%", metrics.total_return_pct);
//! println!("Trades: {}", metrics.total_trades);
//! # Ok(())
//! # }
//! ```
//!
//! ## Grid optimization
//!
//! ```ignore
//! use signal_backtest::{CancelToken, Optimizer, OptimizeKey, ParamGrid};
//!
//! let grid = ParamGrid {
//!     holding_periods: vec![5, 10, 20],
//!     stop_losses: vec![3.0, 5.0, 8.0],
//!     take_profits: vec![10.0, 15.0],
//! };
//! let report = Optimizer::new(8).run(&index, &signals, &config, &grid, &CancelToken::new())?;
//! let best = report.best(OptimizeKey::TotalReturn);
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

/// Simulation configuration and builder
pub mod config;
/// Equity and invested-capital curves
pub mod curves;
/// Error types and result definitions
pub mod error;
/// Cache-key fingerprinting over canonicalized inputs
pub mod fingerprint;
/// Performance metrics over a trade log
pub mod metrics;
/// Grid-search parameter optimisation
pub mod optimizer;
/// Price history storage and date lookup
pub mod price_index;
/// First-touching exit resolution
pub mod resolver;
/// Position sizing policies
pub mod sizing;
/// The per-signal simulation state machine
pub mod simulator;
/// Completed trades and open positions
pub mod trade;
/// Trailing volatility and ATR estimates
pub mod volatility;

// Re-export main types
pub use config::{Direction, ExitRules, SimulationConfig, SimulationConfigBuilder};
pub use curves::{EquityPoint, InvestedPoint, equity_curve, invested_capital_curve};
pub use error::{BacktestError, Result};
pub use fingerprint::cache_key;
pub use metrics::{
    LeverageBucketPerformance, LeverageBuckets, LeverageStats, PerformanceMetrics,
};
pub use optimizer::{
    CancelToken, GridCell, GridSummary, OptimizationReport, OptimizeKey, Optimizer, ParamCombo,
    ParamGrid,
};
pub use price_index::{
    DayOrdinal, Instrument, OhlcBar, PriceIndex, PriceRow, Signal, day_ordinal, ordinal_date,
};
pub use resolver::{ExitEvent, resolve_exit};
pub use simulator::{SimulationResult, Simulator};
pub use sizing::{SizingAux, SizingContext, SizingPolicy};
pub use trade::{ExitReason, OpenPosition, Trade};
