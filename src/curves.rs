//! Equity and invested-capital curves derived from a trade log.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::price_index::DayOrdinal;
use crate::trade::Trade;

/// Point on the equity curve
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    /// Exit day the value was realized on
    pub day: DayOrdinal,
    /// Portfolio value after all trades exiting up to and including this day
    pub value: f64,
}

/// Point on the invested-capital curve
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InvestedPoint {
    /// Calendar day
    pub day: DayOrdinal,
    /// Sum of open notionals on this day
    pub invested: f64,
}

/// Portfolio value after each realized trade, merged to the last value per
/// exit day.
///
/// `trades` must be in non-decreasing exit-day order (as emitted by the
/// simulator).
pub fn equity_curve(trades: &[Trade], initial_capital: f64) -> Vec<EquityPoint> {
    let mut curve: Vec<EquityPoint> = Vec::new();
    let mut equity = initial_capital;

    for trade in trades {
        equity += trade.pnl_currency;
        match curve.last_mut() {
            Some(last) if last.day == trade.exit_day => last.value = equity,
            _ => curve.push(EquityPoint {
                day: trade.exit_day,
                value: equity,
            }),
        }
    }

    curve
}

/// Total capital committed to open positions for each day of the backtest.
///
/// Each trade contributes `+notional` on its entry day and `-notional` on the
/// day after its exit (a position stays invested through its exit day). The
/// curve covers every calendar day from the first entry to one day past the
/// last exit, cumulative and clamped at zero.
pub fn invested_capital_curve(trades: &[Trade]) -> Vec<InvestedPoint> {
    if trades.is_empty() {
        return Vec::new();
    }

    let mut daily_change: BTreeMap<DayOrdinal, f64> = BTreeMap::new();
    for trade in trades {
        *daily_change.entry(trade.entry_day).or_insert(0.0) += trade.notional;
        *daily_change.entry(trade.exit_day + 1).or_insert(0.0) -= trade.notional;
    }

    let first = trades.iter().map(|t| t.entry_day).min().unwrap_or(0);
    let last = trades.iter().map(|t| t.exit_day).max().unwrap_or(0) + 1;

    let mut curve = Vec::with_capacity((last - first + 1).max(0) as usize);
    let mut invested = 0.0_f64;
    for day in first..=last {
        invested += daily_change.get(&day).copied().unwrap_or(0.0);
        if invested < 0.0 {
            invested = 0.0;
        }
        curve.push(InvestedPoint { day, invested });
    }

    curve
}
