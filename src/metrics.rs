//! Performance metrics derived from a trade log.
//!
//! All reductions stream over the trade sequence; the trade log is the single
//! source of truth and the metrics never look back at price data.

use serde::{Deserialize, Serialize};

use crate::trade::Trade;

/// Default annual risk-free rate for Sharpe calculations.
pub const DEFAULT_RISK_FREE_RATE: f64 = 0.06;

/// Trading days per year used for annualisation.
const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// Leverage bucket counts.
///
/// Buckets partition `leverage_at_entry` as
/// `<=1`, `(1,2]`, `(2,3]`, `(3,5]`, `>5`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeverageBuckets {
    /// Trades with leverage at or below 1x
    pub at_or_below_1x: usize,
    /// Trades with leverage in (1, 2]
    pub over_1x_to_2x: usize,
    /// Trades with leverage in (2, 3]
    pub over_2x_to_3x: usize,
    /// Trades with leverage in (3, 5]
    pub over_3x_to_5x: usize,
    /// Trades with leverage above 5x
    pub over_5x: usize,
}

/// Mean `pnl_pct` per leverage bucket (0 for empty buckets).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LeverageBucketPerformance {
    /// Mean return of trades at or below 1x
    pub at_or_below_1x: f64,
    /// Mean return of trades in (1, 2]
    pub over_1x_to_2x: f64,
    /// Mean return of trades in (2, 3]
    pub over_2x_to_3x: f64,
    /// Mean return of trades in (3, 5]
    pub over_3x_to_5x: f64,
    /// Mean return of trades above 5x
    pub over_5x: f64,
}

/// Leverage usage statistics over a trade log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeverageStats {
    /// Mean leverage at entry
    pub mean: f64,
    /// Maximum leverage at entry
    pub max: f64,
    /// Median leverage at entry
    pub median: f64,
    /// Sample standard deviation of leverage at entry
    pub stdev: f64,
    /// Trade counts per leverage bucket
    pub buckets: LeverageBuckets,
    /// Pearson correlation of leverage with trade return (0 when undefined)
    pub performance_correlation: f64,
    /// Mean trade return per leverage bucket
    pub bucket_performance: LeverageBucketPerformance,
}

/// Scalar performance aggregates for one simulation.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    /// Total number of trades
    pub total_trades: usize,

    /// `(final - initial) / initial * 100`; 0 with no trades
    pub total_return_pct: f64,

    /// Sum of trade P&L in currency
    pub total_pnl: f64,

    /// Percentage of trades with positive return
    pub win_rate_pct: f64,

    /// Mean return of winning trades, percent (0 when none)
    pub avg_win_pct: f64,

    /// Mean return of losing trades, percent (0 when none)
    pub avg_loss_pct: f64,

    /// Mean P&L of winning trades in currency (0 when none)
    pub avg_win_currency: f64,

    /// Mean P&L of losing trades in currency (0 when none)
    pub avg_loss_currency: f64,

    /// Gross profit over gross loss.
    ///
    /// `+inf` when there are winners but no losses (serialized as JSON
    /// `null`); 0 when there are no winners.
    pub profit_factor: f64,

    /// Worst peak-to-trough decline of the equity series, percent
    /// (negative or zero)
    pub max_drawdown_pct: f64,

    /// Annualized per-trade Sharpe ratio (0 with fewer than 2 trades or
    /// zero dispersion)
    pub sharpe_ratio: f64,

    /// `total_return_pct / |max_drawdown_pct|`; 0 when drawdown is 0
    pub calmar_ratio: f64,

    /// Mean bars held per trade
    pub avg_holding_period_days: f64,

    /// Mean trade notional
    pub avg_position_size: f64,

    /// Largest trade notional
    pub max_position_size: f64,

    /// Smallest trade notional
    pub min_position_size: f64,

    /// Leverage usage statistics
    pub leverage: LeverageStats,
}

impl PerformanceMetrics {
    /// Calculate metrics with the default 6% annual risk-free rate.
    pub fn calculate(trades: &[Trade], initial_capital: f64) -> Self {
        Self::calculate_with_rate(trades, initial_capital, DEFAULT_RISK_FREE_RATE)
    }

    /// Calculate metrics from an exit-ordered trade log.
    ///
    /// `risk_free_rate` is the annual rate (e.g. `0.06`), converted to a
    /// daily rate internally for the Sharpe calculation.
    pub fn calculate_with_rate(
        trades: &[Trade],
        initial_capital: f64,
        risk_free_rate: f64,
    ) -> Self {
        if trades.is_empty() {
            return Self::default();
        }

        let total_trades = trades.len();
        let total_pnl: f64 = trades.iter().map(|t| t.pnl_currency).sum();

        let winners: Vec<&Trade> = trades.iter().filter(|t| t.pnl_pct > 0.0).collect();
        let losers: Vec<&Trade> = trades.iter().filter(|t| t.pnl_pct <= 0.0).collect();

        let win_rate_pct = winners.len() as f64 / total_trades as f64 * 100.0;
        let avg_win_pct = mean(winners.iter().map(|t| t.pnl_pct));
        let avg_loss_pct = mean(losers.iter().map(|t| t.pnl_pct));
        let avg_win_currency = mean(winners.iter().map(|t| t.pnl_currency));
        let avg_loss_currency = mean(losers.iter().map(|t| t.pnl_currency));

        let gross_profit: f64 = trades
            .iter()
            .map(|t| t.pnl_currency.max(0.0))
            .sum();
        let gross_loss: f64 = trades
            .iter()
            .map(|t| (-t.pnl_currency).max(0.0))
            .sum();
        let profit_factor = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let final_value = initial_capital + total_pnl;
        let total_return_pct = (final_value - initial_capital) / initial_capital * 100.0;

        let max_drawdown_pct = max_drawdown(trades, initial_capital);
        let sharpe_ratio = sharpe(trades, initial_capital, risk_free_rate);
        let calmar_ratio = if max_drawdown_pct != 0.0 {
            total_return_pct / max_drawdown_pct.abs()
        } else {
            0.0
        };

        let avg_holding_period_days = mean(trades.iter().map(|t| t.days_held as f64));
        let avg_position_size = mean(trades.iter().map(|t| t.notional));
        let max_position_size = trades.iter().map(|t| t.notional).fold(f64::MIN, f64::max);
        let min_position_size = trades.iter().map(|t| t.notional).fold(f64::MAX, f64::min);

        Self {
            total_trades,
            total_return_pct,
            total_pnl,
            win_rate_pct,
            avg_win_pct,
            avg_loss_pct,
            avg_win_currency,
            avg_loss_currency,
            profit_factor,
            max_drawdown_pct,
            sharpe_ratio,
            calmar_ratio,
            avg_holding_period_days,
            avg_position_size,
            max_position_size,
            min_position_size,
            leverage: LeverageStats::calculate(trades),
        }
    }
}

impl LeverageStats {
    /// Leverage statistics over a trade log.
    pub fn calculate(trades: &[Trade]) -> Self {
        if trades.is_empty() {
            return Self::default();
        }

        let levs: Vec<f64> = trades.iter().map(|t| t.leverage_at_entry).collect();
        let rets: Vec<f64> = trades.iter().map(|t| t.pnl_pct).collect();

        let mut buckets = LeverageBuckets::default();
        let mut sums = [0.0_f64; 5];
        let mut counts = [0_usize; 5];
        for (lev, ret) in levs.iter().zip(&rets) {
            let slot = bucket_slot(*lev);
            sums[slot] += ret;
            counts[slot] += 1;
            match slot {
                0 => buckets.at_or_below_1x += 1,
                1 => buckets.over_1x_to_2x += 1,
                2 => buckets.over_2x_to_3x += 1,
                3 => buckets.over_3x_to_5x += 1,
                _ => buckets.over_5x += 1,
            }
        }
        let bucket_mean = |slot: usize| {
            if counts[slot] > 0 {
                sums[slot] / counts[slot] as f64
            } else {
                0.0
            }
        };

        Self {
            mean: mean(levs.iter().copied()),
            max: levs.iter().copied().fold(f64::MIN, f64::max),
            median: median(&levs),
            stdev: sample_std(&levs),
            buckets,
            performance_correlation: pearson(&levs, &rets),
            bucket_performance: LeverageBucketPerformance {
                at_or_below_1x: bucket_mean(0),
                over_1x_to_2x: bucket_mean(1),
                over_2x_to_3x: bucket_mean(2),
                over_3x_to_5x: bucket_mean(3),
                over_5x: bucket_mean(4),
            },
        }
    }
}

/// Bucket index for a leverage value: `<=1`, `(1,2]`, `(2,3]`, `(3,5]`, `>5`.
fn bucket_slot(leverage: f64) -> usize {
    if leverage <= 1.0 {
        0
    } else if leverage <= 2.0 {
        1
    } else if leverage <= 3.0 {
        2
    } else if leverage <= 5.0 {
        3
    } else {
        4
    }
}

/// Worst drawdown of `initial + cumsum(pnl)` against its running maximum,
/// as a percentage (negative or zero).
fn max_drawdown(trades: &[Trade], initial_capital: f64) -> f64 {
    let mut equity = initial_capital;
    let mut running_max = f64::MIN;
    let mut worst = 0.0_f64;

    for trade in trades {
        equity += trade.pnl_currency;
        running_max = running_max.max(equity);
        if running_max > 0.0 {
            let drawdown = (equity - running_max) / running_max;
            worst = worst.min(drawdown);
        }
    }

    worst * 100.0
}

/// Annualized per-trade Sharpe ratio.
///
/// Per-trade returns are `pnl / initial_capital`; the annual risk-free rate
/// is scaled to daily and the result annualized by sqrt(252).
fn sharpe(trades: &[Trade], initial_capital: f64, risk_free_rate: f64) -> f64 {
    if trades.len() < 2 {
        return 0.0;
    }

    let returns: Vec<f64> = trades
        .iter()
        .map(|t| t.pnl_currency / initial_capital)
        .collect();
    let mean_r = mean(returns.iter().copied());
    let std = sample_std(&returns);
    if std == 0.0 {
        return 0.0;
    }

    let excess = mean_r - risk_free_rate / TRADING_DAYS_PER_YEAR;
    excess / std * TRADING_DAYS_PER_YEAR.sqrt()
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let mut sum = 0.0;
    let mut n = 0_usize;
    for v in values {
        sum += v;
        n += 1;
    }
    if n == 0 { 0.0 } else { sum / n as f64 }
}

/// Sample standard deviation (n-1); 0 with fewer than two values.
fn sample_std(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let m = mean(values.iter().copied());
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (n as f64 - 1.0);
    variance.sqrt()
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Pearson correlation; 0 when undefined (fewer than two points or zero
/// variance on either side).
fn pearson(xs: &[f64], ys: &[f64]) -> f64 {
    let n = xs.len().min(ys.len());
    if n < 2 {
        return 0.0;
    }
    let mx = mean(xs.iter().copied());
    let my = mean(ys.iter().copied());

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for i in 0..n {
        let dx = xs[i] - mx;
        let dy = ys[i] - my;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x == 0.0 || var_y == 0.0 {
        return 0.0;
    }
    cov / (var_x.sqrt() * var_y.sqrt())
}
