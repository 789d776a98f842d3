//! Grid-search parameter optimisation over exit rules.
//!
//! Sweeps the Cartesian product of holding periods, stop losses, and take
//! profits, running one independent simulation per combination on a bounded
//! worker pool. Workers share the read-only [`PriceIndex`]; no mutable state
//! crosses a worker boundary, so any single cell's summary is bit-for-bit
//! the summary the simulator would produce stand-alone.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::{ExitRules, SimulationConfig};
use crate::error::{BacktestError, Result};
use crate::metrics::PerformanceMetrics;
use crate::price_index::{PriceIndex, Signal};
use crate::simulator::Simulator;

/// Hard ceiling on optimizer worker threads.
const MAX_POOL_SIZE: usize = 8;

/// Cooperative cancellation flag checked between grid cells.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create an un-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Cells not yet started will be skipped.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Parameter ranges to sweep. Combinations are the Cartesian product; an
/// empty `take_profits` contributes a single "no take-profit" value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParamGrid {
    /// Holding periods in bars
    pub holding_periods: Vec<usize>,
    /// Stop-loss percentages
    pub stop_losses: Vec<f64>,
    /// Take-profit percentages (may be empty)
    pub take_profits: Vec<f64>,
}

impl ParamGrid {
    /// Expand into the full combination list, holding period outermost and
    /// take profit innermost.
    pub fn combinations(&self) -> Vec<ParamCombo> {
        let take_profits: Vec<Option<f64>> = if self.take_profits.is_empty() {
            vec![None]
        } else {
            self.take_profits.iter().copied().map(Some).collect()
        };

        let mut combos =
            Vec::with_capacity(self.holding_periods.len() * self.stop_losses.len() * take_profits.len());
        for &hp in &self.holding_periods {
            for &sl in &self.stop_losses {
                for &tp in &take_profits {
                    combos.push(ParamCombo {
                        holding_period: hp,
                        stop_loss_pct: sl,
                        take_profit_pct: tp,
                    });
                }
            }
        }
        combos
    }
}

/// One grid point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParamCombo {
    /// Holding period in bars
    pub holding_period: usize,
    /// Stop-loss percentage
    pub stop_loss_pct: f64,
    /// Take-profit percentage, `None` for no target
    pub take_profit_pct: Option<f64>,
}

impl ParamCombo {
    /// Lexicographic ordering key for deterministic tie-breaking.
    fn lex_key(&self) -> (usize, f64, f64) {
        (
            self.holding_period,
            self.stop_loss_pct,
            self.take_profit_pct.unwrap_or(f64::MAX),
        )
    }
}

/// Compact per-cell summary row.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridSummary {
    /// Total return percentage
    pub total_return_pct: f64,
    /// Total P&L in currency
    pub total_pnl: f64,
    /// Win rate percentage
    pub win_rate_pct: f64,
    /// Max drawdown percentage (negative or zero)
    pub max_drawdown_pct: f64,
    /// Profit factor
    pub profit_factor: f64,
    /// Annualized Sharpe ratio
    pub sharpe_ratio: f64,
    /// Calmar ratio
    pub calmar_ratio: f64,
    /// Mean winning-trade return percentage
    pub avg_win_pct: f64,
    /// Mean losing-trade return percentage
    pub avg_loss_pct: f64,
    /// Number of trades
    pub total_trades: usize,
    /// Mean trade notional
    pub avg_position_size: f64,
}

impl GridSummary {
    fn from_metrics(metrics: &PerformanceMetrics) -> Self {
        Self {
            total_return_pct: metrics.total_return_pct,
            total_pnl: metrics.total_pnl,
            win_rate_pct: metrics.win_rate_pct,
            max_drawdown_pct: metrics.max_drawdown_pct,
            profit_factor: metrics.profit_factor,
            sharpe_ratio: metrics.sharpe_ratio,
            calmar_ratio: metrics.calmar_ratio,
            avg_win_pct: metrics.avg_win_pct,
            avg_loss_pct: metrics.avg_loss_pct,
            total_trades: metrics.total_trades,
            avg_position_size: metrics.avg_position_size,
        }
    }
}

/// Outcome of one grid cell: a summary, or the reason the cell failed.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridCell {
    /// The parameters of this cell
    pub params: ParamCombo,
    /// Summary row, absent when the cell failed or was cancelled
    pub summary: Option<GridSummary>,
    /// Failure description, when the cell did not complete
    pub error: Option<String>,
}

/// Metric to rank grid cells by. Higher is always better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizeKey {
    /// Maximise total return percentage
    TotalReturn,
    /// Maximise Sharpe ratio
    SharpeRatio,
    /// Maximise Calmar ratio
    CalmarRatio,
    /// Maximise profit factor
    ProfitFactor,
    /// Maximise win rate
    WinRate,
    /// Minimise maximum drawdown (negated for sorting)
    MinDrawdown,
}

impl OptimizeKey {
    /// Extract the ranking score from a summary. Higher is always better.
    fn score(&self, summary: &GridSummary) -> f64 {
        match self {
            Self::TotalReturn => summary.total_return_pct,
            Self::SharpeRatio => summary.sharpe_ratio,
            Self::CalmarRatio => summary.calmar_ratio,
            Self::ProfitFactor => summary.profit_factor,
            Self::WinRate => summary.win_rate_pct,
            Self::MinDrawdown => -summary.max_drawdown_pct.abs(),
        }
    }
}

/// Completed grid-search report. Cells are in submission (combination) order.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationReport {
    /// One cell per parameter combination, in submission order
    pub cells: Vec<GridCell>,
    /// Number of cells that produced a summary
    pub completed: usize,
    /// Number of cells that failed or were cancelled
    pub failed: usize,
}

impl OptimizationReport {
    /// The best completed cell by `key`.
    ///
    /// Ties break deterministically on the parameter tuple (lexicographic),
    /// so the winner is independent of worker scheduling. NaN scores never
    /// win.
    pub fn best(&self, key: OptimizeKey) -> Option<&GridCell> {
        self.cells
            .iter()
            .filter(|c| c.summary.is_some())
            .filter(|c| {
                !key.score(c.summary.as_ref().expect("filtered on summary"))
                    .is_nan()
            })
            .min_by(|a, b| {
                let sa = key.score(a.summary.as_ref().expect("filtered on summary"));
                let sb = key.score(b.summary.as_ref().expect("filtered on summary"));
                // Descending score, then ascending parameter tuple
                sb.partial_cmp(&sa)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| {
                        a.params
                            .lex_key()
                            .partial_cmp(&b.params.lex_key())
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
            })
    }

    /// Cells re-sorted best-first by `key`; NaN and failed cells sort last.
    pub fn sorted_by(&self, key: OptimizeKey) -> Vec<&GridCell> {
        let mut cells: Vec<&GridCell> = self.cells.iter().collect();
        cells.sort_by(|a, b| {
            let sa = a.summary.as_ref().map(|s| key.score(s));
            let sb = b.summary.as_ref().map(|s| key.score(s));
            match (sa, sb) {
                (None, None) => std::cmp::Ordering::Equal,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (Some(_), None) => std::cmp::Ordering::Less,
                (Some(x), Some(y)) => match (x.is_nan(), y.is_nan()) {
                    (true, true) => std::cmp::Ordering::Equal,
                    (true, false) => std::cmp::Ordering::Greater,
                    (false, true) => std::cmp::Ordering::Less,
                    (false, false) => y
                        .partial_cmp(&x)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| {
                            a.params
                                .lex_key()
                                .partial_cmp(&b.params.lex_key())
                                .unwrap_or(std::cmp::Ordering::Equal)
                        }),
                },
            }
        });
        cells
    }
}

/// Worker count: `min(max_workers, cpu_count - 1, 8)`, at least 1.
fn worker_count(max_workers: usize) -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    max_workers
        .min(cpus.saturating_sub(1).max(1))
        .min(MAX_POOL_SIZE)
        .max(1)
}

/// Grid-search optimizer.
pub struct Optimizer {
    max_workers: usize,
}

impl Optimizer {
    /// Create an optimizer with an upper bound on worker threads.
    ///
    /// The effective pool size is `min(max_workers, cpu_count - 1, 8)`.
    pub fn new(max_workers: usize) -> Self {
        Self { max_workers }
    }

    /// Run one simulation per grid combination.
    ///
    /// Each cell's configuration differs from `base` only in its exit rules.
    /// Cells are dispatched onto the worker pool and reported in submission
    /// order regardless of completion order. A panicking cell is recorded as
    /// failed; remaining cells proceed. `cancel` is checked before each cell.
    pub fn run(
        &self,
        index: &PriceIndex,
        signals: &[Signal],
        base: &SimulationConfig,
        grid: &ParamGrid,
        cancel: &CancelToken,
    ) -> Result<OptimizationReport> {
        let combos = grid.combinations();
        if combos.is_empty() {
            return Err(BacktestError::invalid_param(
                "param_ranges",
                "grid expands to zero combinations",
            ));
        }

        let workers = worker_count(self.max_workers);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| BacktestError::Pool(e.to_string()))?;

        tracing::info!(
            combinations = combos.len(),
            workers,
            "starting grid optimization"
        );

        let total = combos.len();
        let progress = AtomicUsize::new(0);

        let cells: Vec<GridCell> = pool.install(|| {
            combos
                .par_iter()
                .map(|combo| {
                    if cancel.is_cancelled() {
                        return GridCell {
                            params: *combo,
                            summary: None,
                            error: Some("cancelled".to_string()),
                        };
                    }

                    let cell = run_cell(index, signals, base, combo);
                    let done = progress.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::debug!(done, total, "grid cell finished");
                    cell
                })
                .collect()
        });

        let completed = cells.iter().filter(|c| c.summary.is_some()).count();
        let failed = cells.len() - completed;
        tracing::info!(completed, failed, "grid optimization finished");

        Ok(OptimizationReport {
            cells,
            completed,
            failed,
        })
    }
}

/// Simulate one combination and summarize it.
fn run_cell(
    index: &PriceIndex,
    signals: &[Signal],
    base: &SimulationConfig,
    combo: &ParamCombo,
) -> GridCell {
    let config = base.with_exit_rules(ExitRules {
        holding_period_days: combo.holding_period,
        stop_loss_pct: combo.stop_loss_pct,
        take_profit_pct: combo.take_profit_pct,
    });
    let initial_capital = config.initial_capital;

    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
        let result = Simulator::new(config).run(index, signals);
        let metrics = PerformanceMetrics::calculate(&result.trades, initial_capital);
        GridSummary::from_metrics(&metrics)
    }));

    match outcome {
        Ok(summary) => GridCell {
            params: *combo,
            summary: Some(summary),
            error: None,
        },
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "worker panicked".to_string());
            tracing::warn!(?combo, error = %message, "grid cell failed");
            GridCell {
                params: *combo,
                summary: None,
                error: Some(message),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::price_index::PriceRow;

    fn row(ticker: &str, day: i64, high: f64, low: f64, close: f64) -> PriceRow {
        PriceRow {
            ticker: ticker.to_string(),
            day,
            open: close,
            high,
            low,
            close,
            volume: 1_000.0,
        }
    }

    fn scenario_index() -> PriceIndex {
        PriceIndex::from_rows(vec![
            row("X", 1, 100.0, 99.0, 100.0),
            row("X", 2, 112.0, 100.0, 110.0),
            row("X", 3, 120.0, 108.0, 118.0),
            row("X", 4, 121.0, 117.0, 119.0),
        ])
        .unwrap()
    }

    fn base_config() -> SimulationConfig {
        SimulationConfig::builder()
            .initial_capital(100_000.0)
            .holding_period_days(3)
            .stop_loss_pct(5.0)
            .build()
            .unwrap()
    }

    #[test]
    fn test_combination_expansion() {
        let grid = ParamGrid {
            holding_periods: vec![3, 5],
            stop_losses: vec![2.0, 5.0],
            take_profits: vec![10.0],
        };
        let combos = grid.combinations();
        assert_eq!(combos.len(), 4);
        // Holding period outermost, stop loss inner
        assert_eq!(combos[0].holding_period, 3);
        assert_eq!(combos[1].stop_loss_pct, 5.0);
        assert_eq!(combos[3].holding_period, 5);
    }

    #[test]
    fn test_empty_take_profits_yield_none() {
        let grid = ParamGrid {
            holding_periods: vec![3],
            stop_losses: vec![5.0],
            take_profits: vec![],
        };
        let combos = grid.combinations();
        assert_eq!(combos.len(), 1);
        assert!(combos[0].take_profit_pct.is_none());
    }

    #[test]
    fn test_empty_grid_is_an_error() {
        let optimizer = Optimizer::new(4);
        let result = optimizer.run(
            &scenario_index(),
            &[Signal::new("X", 1)],
            &base_config(),
            &ParamGrid::default(),
            &CancelToken::new(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_single_cell_parity_with_simulator() {
        // A one-cell grid must reproduce the standalone simulator exactly
        let grid = ParamGrid {
            holding_periods: vec![3],
            stop_losses: vec![5.0],
            take_profits: vec![10.0],
        };
        let signals = vec![Signal::new("X", 1)];
        let base = base_config();

        let report = Optimizer::new(4)
            .run(&scenario_index(), &signals, &base, &grid, &CancelToken::new())
            .unwrap();
        assert_eq!(report.cells.len(), 1);
        let summary = report.cells[0].summary.as_ref().unwrap();

        let standalone = Simulator::new(base.with_exit_rules(ExitRules {
            holding_period_days: 3,
            stop_loss_pct: 5.0,
            take_profit_pct: Some(10.0),
        }))
        .run(&scenario_index(), &signals);
        let metrics = PerformanceMetrics::calculate(&standalone.trades, 100_000.0);

        assert_eq!(summary.total_trades, metrics.total_trades);
        assert!((summary.total_return_pct - metrics.total_return_pct).abs() <= 1e-10);
        assert!((summary.total_pnl - metrics.total_pnl).abs() <= 1e-10);
        assert!((summary.sharpe_ratio - metrics.sharpe_ratio).abs() <= 1e-10);
    }

    #[test]
    fn test_results_in_submission_order() {
        let grid = ParamGrid {
            holding_periods: vec![1, 2, 3],
            stop_losses: vec![2.0, 5.0],
            take_profits: vec![10.0],
        };
        let combos = grid.combinations();
        let report = Optimizer::new(4)
            .run(
                &scenario_index(),
                &[Signal::new("X", 1)],
                &base_config(),
                &grid,
                &CancelToken::new(),
            )
            .unwrap();

        assert_eq!(report.cells.len(), combos.len());
        for (cell, combo) in report.cells.iter().zip(&combos) {
            assert_eq!(cell.params, *combo);
        }
    }

    #[test]
    fn test_determinism_across_worker_counts() {
        let grid = ParamGrid {
            holding_periods: vec![1, 2, 3],
            stop_losses: vec![2.0, 5.0, 8.0],
            take_profits: vec![5.0, 10.0],
        };
        let signals = vec![Signal::new("X", 1), Signal::new("X", 2)];
        let base = base_config();

        let one = Optimizer::new(1)
            .run(&scenario_index(), &signals, &base, &grid, &CancelToken::new())
            .unwrap();
        let many = Optimizer::new(8)
            .run(&scenario_index(), &signals, &base, &grid, &CancelToken::new())
            .unwrap();

        assert_eq!(one.cells.len(), many.cells.len());
        for (a, b) in one.cells.iter().zip(&many.cells) {
            assert_eq!(a.params, b.params);
            let (sa, sb) = (a.summary.as_ref().unwrap(), b.summary.as_ref().unwrap());
            assert_eq!(sa.total_trades, sb.total_trades);
            assert_eq!(sa.total_return_pct, sb.total_return_pct);
            assert_eq!(sa.sharpe_ratio, sb.sharpe_ratio);
        }
    }

    #[test]
    fn test_best_deterministic_tie_break() {
        // A flat series gives every cell identical (zero) returns: the best
        // pick must fall back to the smallest parameter tuple
        let mut rows = Vec::new();
        for d in 1..=20 {
            rows.push(row("X", d, 100.0, 100.0, 100.0));
        }
        let index = PriceIndex::from_rows(rows).unwrap();
        let grid = ParamGrid {
            holding_periods: vec![5, 2],
            stop_losses: vec![5.0, 3.0],
            take_profits: vec![],
        };
        let report = Optimizer::new(4)
            .run(
                &index,
                &[Signal::new("X", 1)],
                &base_config(),
                &grid,
                &CancelToken::new(),
            )
            .unwrap();

        let best = report.best(OptimizeKey::TotalReturn).unwrap();
        assert_eq!(best.params.holding_period, 2);
        assert_eq!(best.params.stop_loss_pct, 3.0);
    }

    #[test]
    fn test_cancelled_token_skips_cells() {
        let grid = ParamGrid {
            holding_periods: vec![1, 2, 3],
            stop_losses: vec![5.0],
            take_profits: vec![],
        };
        let cancel = CancelToken::new();
        cancel.cancel();
        let report = Optimizer::new(2)
            .run(
                &scenario_index(),
                &[Signal::new("X", 1)],
                &base_config(),
                &grid,
                &cancel,
            )
            .unwrap();

        assert_eq!(report.completed, 0);
        assert_eq!(report.failed, 3);
        assert!(report.cells.iter().all(|c| c.error.as_deref() == Some("cancelled")));
    }

    #[test]
    fn test_sorted_by_ranks_best_first() {
        let grid = ParamGrid {
            holding_periods: vec![3],
            stop_losses: vec![5.0],
            take_profits: vec![10.0, 2.0],
        };
        let report = Optimizer::new(2)
            .run(
                &scenario_index(),
                &[Signal::new("X", 1)],
                &base_config(),
                &grid,
                &CancelToken::new(),
            )
            .unwrap();

        let sorted = report.sorted_by(OptimizeKey::TotalReturn);
        let first = OptimizeKey::TotalReturn.score(sorted[0].summary.as_ref().unwrap());
        let second = OptimizeKey::TotalReturn.score(sorted[1].summary.as_ref().unwrap());
        assert!(first >= second);
    }

    #[test]
    fn test_worker_count_caps() {
        assert!(worker_count(100) <= MAX_POOL_SIZE);
        assert_eq!(worker_count(0).max(1), 1);
        assert!(worker_count(1) >= 1);
    }
}
