//! Trade and open-position types.

use serde::{Deserialize, Serialize};

use crate::config::Direction;
use crate::price_index::DayOrdinal;

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Stop-loss threshold touched intrabar
    StopLoss,
    /// Take-profit threshold touched intrabar
    TakeProfit,
    /// Holding period elapsed; exit at the window's closing price
    TimeExit,
    /// No forward data was available to resolve an exit
    NoData,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StopLoss => write!(f, "Stop Loss"),
            Self::TakeProfit => write!(f, "Take Profit"),
            Self::TimeExit => write!(f, "Time Exit"),
            Self::NoData => write!(f, "No Data"),
        }
    }
}

/// An open position, owned by the simulator for the lifetime of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenPosition {
    /// Ticker symbol
    pub ticker: String,
    /// Index of the entry bar in the instrument's history
    pub entry_row: usize,
    /// Entry price (close of the entry bar)
    pub entry_price: f64,
    /// Whole units held
    pub shares: u64,
    /// Capital commitment: `shares * entry_price`
    pub notional: f64,
}

/// A completed round-trip trade.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    /// Ticker symbol
    pub ticker: String,

    /// Trade direction
    pub direction: Direction,

    /// Day ordinal of the entry bar
    pub entry_day: DayOrdinal,

    /// Entry price (close of the entry bar)
    pub entry_price: f64,

    /// Day ordinal of the exit bar
    pub exit_day: DayOrdinal,

    /// Exit price (threshold price for stop/target exits, close for time exits)
    pub exit_price: f64,

    /// Whole units traded
    pub shares: u64,

    /// Capital commitment: `shares * entry_price`
    pub notional: f64,

    /// Realized profit or loss in currency
    pub pnl_currency: f64,

    /// Realized profit or loss as a percentage of entry price
    pub pnl_pct: f64,

    /// Why the position was closed
    pub exit_reason: ExitReason,

    /// Bars between entry and exit
    pub days_held: usize,

    /// Portfolio value after booking this trade's P&L
    pub portfolio_value_after: f64,

    /// `notional / portfolio_value_at_entry_before_opening`.
    ///
    /// Recorded as 0 (with a run warning) when that denominator is not
    /// positive.
    pub leverage_at_entry: f64,
}

impl Trade {
    /// Whether the trade finished with a positive return.
    pub fn is_win(&self) -> bool {
        self.pnl_pct > 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_reason_serde() {
        assert_eq!(
            serde_json::to_string(&ExitReason::StopLoss).unwrap(),
            "\"stop_loss\""
        );
        let r: ExitReason = serde_json::from_str("\"time_exit\"").unwrap();
        assert_eq!(r, ExitReason::TimeExit);
    }

    #[test]
    fn test_exit_reason_display() {
        assert_eq!(ExitReason::TakeProfit.to_string(), "Take Profit");
    }
}
