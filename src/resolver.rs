//! First-touching exit resolution for a single trade.

use crate::config::{Direction, ExitRules};
use crate::price_index::OhlcBar;
use crate::trade::ExitReason;

/// A resolved exit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitEvent {
    /// Index of the exit bar in the instrument's history
    pub exit_index: usize,
    /// Exit price (threshold price for stop/target, close for time exits)
    pub exit_price: f64,
    /// Which rule fired
    pub reason: ExitReason,
}

/// Scan forward from an entry bar for the first-touching exit.
///
/// Returns `None` when the history cannot cover the full holding period
/// (`entry_index + holding_period + 1 > bars.len()`); the caller drops the
/// signal.
///
/// Within a single bar the stop check precedes the take-profit check:
/// intraday ordering is indeterminate in daily data, and assuming the stop
/// traded first is the conservative resolution. Stop and target exits price
/// at the threshold; time exits price at the close of the window's last bar.
pub fn resolve_exit(
    bars: &[OhlcBar],
    entry_index: usize,
    rules: &ExitRules,
    direction: Direction,
) -> Option<ExitEvent> {
    let holding = rules.holding_period_days;
    if holding == 0 || entry_index + holding + 1 > bars.len() {
        return None;
    }

    let entry_price = bars[entry_index].close;
    let (stop_price, target_price) = threshold_prices(entry_price, rules, direction);

    let last = entry_index + holding;
    for (i, bar) in bars.iter().enumerate().take(last + 1).skip(entry_index + 1) {
        match direction {
            Direction::Long => {
                if bar.low <= stop_price {
                    return Some(ExitEvent {
                        exit_index: i,
                        exit_price: stop_price,
                        reason: ExitReason::StopLoss,
                    });
                }
                if let Some(target) = target_price {
                    if bar.high >= target {
                        return Some(ExitEvent {
                            exit_index: i,
                            exit_price: target,
                            reason: ExitReason::TakeProfit,
                        });
                    }
                }
            }
            Direction::Short => {
                if bar.high >= stop_price {
                    return Some(ExitEvent {
                        exit_index: i,
                        exit_price: stop_price,
                        reason: ExitReason::StopLoss,
                    });
                }
                if let Some(target) = target_price {
                    if bar.low <= target {
                        return Some(ExitEvent {
                            exit_index: i,
                            exit_price: target,
                            reason: ExitReason::TakeProfit,
                        });
                    }
                }
            }
        }
    }

    Some(ExitEvent {
        exit_index: last,
        exit_price: bars[last].close,
        reason: ExitReason::TimeExit,
    })
}

/// Stop and target prices relative to entry, per direction.
fn threshold_prices(
    entry_price: f64,
    rules: &ExitRules,
    direction: Direction,
) -> (f64, Option<f64>) {
    match direction {
        Direction::Long => (
            entry_price * (1.0 - rules.stop_loss_pct / 100.0),
            rules
                .take_profit_pct
                .map(|tp| entry_price * (1.0 + tp / 100.0)),
        ),
        Direction::Short => (
            entry_price * (1.0 + rules.stop_loss_pct / 100.0),
            rules
                .take_profit_pct
                .map(|tp| entry_price * (1.0 - tp / 100.0)),
        ),
    }
}
