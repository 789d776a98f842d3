//! The per-signal simulation state machine.
//!
//! Orchestrates the price index, sizing policies, and trade resolver over a
//! chronologically ordered signal stream, maintaining portfolio and
//! open-position accounting. Single-threaded and deterministic; parallelism
//! lives one level up in the optimizer.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::{Direction, SimulationConfig};
use crate::price_index::{DayOrdinal, Instrument, PriceIndex, Signal};
use crate::resolver::resolve_exit;
use crate::sizing::{self, SizingAux, SizingContext, SizingPolicy};
use crate::trade::{OpenPosition, Trade};
use crate::volatility::{average_true_range, realized_volatility};

/// Trailing bars fed into the ATR estimate at each entry.
const ATR_HISTORY_BARS: usize = 30;

/// Output of one simulation run.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationResult {
    /// Completed trades in non-decreasing exit-day order
    pub trades: Vec<Trade>,
    /// Portfolio value after the last trade
    pub final_portfolio_value: f64,
    /// Per-signal capital-constraint warnings
    pub leverage_warnings: Vec<String>,
}

/// Event-driven backtest simulator.
pub struct Simulator {
    config: SimulationConfig,
}

impl Simulator {
    /// Create a simulator for the given configuration.
    pub fn new(config: SimulationConfig) -> Self {
        Self { config }
    }

    /// Run the simulation over a signal stream.
    ///
    /// Signals are consumed in ascending day order, stable on ties. Per-signal
    /// failures (unknown ticker, insufficient forward data, zero-share sizing,
    /// leverage refusal) skip the signal and never abort the run; an empty
    /// trade log is a valid outcome.
    ///
    /// A position's notional stays committed through its exit day inclusive:
    /// it is released from `open_notional` only once a later signal's day
    /// moves past the exit day, so overlapping holding windows compete for
    /// the same capital.
    pub fn run(&self, index: &PriceIndex, signals: &[Signal]) -> SimulationResult {
        let config = &self.config;

        let mut ordered: Vec<&Signal> = signals.iter().collect();
        ordered.sort_by_key(|s| s.day);

        let mut portfolio_value = config.initial_capital;
        let mut open_notional = 0.0_f64;
        // Positions not yet past their exit day, keyed by that day
        let mut committed: Vec<(DayOrdinal, OpenPosition)> = Vec::new();
        let mut active_exit_by_ticker: HashMap<String, DayOrdinal> = HashMap::new();
        let mut trades: Vec<Trade> = Vec::new();
        let mut leverage_warnings: Vec<String> = Vec::new();

        for signal in ordered {
            // Release capital from positions whose exit day has passed
            committed.retain(|(exit_day, position)| {
                if *exit_day < signal.day {
                    open_notional -= position.notional;
                    false
                } else {
                    true
                }
            });

            // Per-instrument gate
            if config.one_trade_per_instrument {
                match active_exit_by_ticker.get(&signal.ticker) {
                    Some(&exit_day) if signal.day <= exit_day => continue,
                    Some(_) => {
                        active_exit_by_ticker.remove(&signal.ticker);
                    }
                    None => {}
                }
            }

            let Some(instrument) = index.get(&signal.ticker) else {
                tracing::debug!(ticker = %signal.ticker, "signal for unknown ticker, skipping");
                continue;
            };

            let Some(entry_index) = instrument.lookup_from(signal.day) else {
                continue;
            };
            let holding = config.exit_rules.holding_period_days;
            if entry_index + holding + 1 > instrument.len() {
                continue;
            }

            let entry_bar = instrument.bar(entry_index);
            let entry_price = entry_bar.close;
            let aux = sizing_aux(&config.sizing_policy, instrument, entry_index);

            // The leverage constraint is enforced below by refusing oversized
            // entries outright rather than shrinking them to fit, so sizing
            // runs with the portfolio cap only.
            let shares = sizing::shares(
                &config.sizing_policy,
                &SizingContext {
                    entry_price,
                    portfolio_value,
                    open_notional,
                    allow_leverage: true,
                },
                &aux,
            );
            if shares == 0 {
                continue;
            }

            let notional = shares as f64 * entry_price;
            if !config.allow_leverage && open_notional + notional > portfolio_value {
                leverage_warnings.push(format!(
                    "Skipped {}@{}: would require leverage",
                    signal.ticker, signal.day
                ));
                continue;
            }

            let Some(exit) = resolve_exit(
                instrument.bars(),
                entry_index,
                &config.exit_rules,
                config.direction,
            ) else {
                continue;
            };

            let portfolio_value_pre_open = portfolio_value;
            let leverage_at_entry = if portfolio_value_pre_open > 0.0 {
                notional / portfolio_value_pre_open
            } else {
                leverage_warnings.push(format!(
                    "Leverage undefined for {}@{}: portfolio value not positive at entry",
                    signal.ticker, signal.day
                ));
                0.0
            };

            let exit_day = instrument.bar(exit.exit_index).day;
            open_notional += notional;
            committed.push((
                exit_day,
                OpenPosition {
                    ticker: signal.ticker.clone(),
                    entry_row: entry_index,
                    entry_price,
                    shares,
                    notional,
                },
            ));

            let (pnl_currency, pnl_pct) = match config.direction {
                Direction::Long => (
                    (exit.exit_price - entry_price) * shares as f64,
                    (exit.exit_price - entry_price) / entry_price * 100.0,
                ),
                Direction::Short => (
                    (entry_price - exit.exit_price) * shares as f64,
                    (entry_price - exit.exit_price) / entry_price * 100.0,
                ),
            };

            portfolio_value += pnl_currency;

            trades.push(Trade {
                ticker: signal.ticker.clone(),
                direction: config.direction,
                entry_day: entry_bar.day,
                entry_price,
                exit_day,
                exit_price: exit.exit_price,
                shares,
                notional,
                pnl_currency,
                pnl_pct,
                exit_reason: exit.reason,
                days_held: exit.exit_index - entry_index,
                portfolio_value_after: portfolio_value,
                leverage_at_entry,
            });

            if config.one_trade_per_instrument {
                active_exit_by_ticker.insert(signal.ticker.clone(), exit_day);
            }
        }

        trades.sort_by_key(|t| t.exit_day);

        SimulationResult {
            trades,
            final_portfolio_value: portfolio_value,
            leverage_warnings,
        }
    }
}

/// Compute the market inputs a sizing policy needs at a given entry bar.
fn sizing_aux(policy: &SizingPolicy, instrument: &Instrument, entry_index: usize) -> SizingAux {
    match policy {
        SizingPolicy::VolatilityTarget {
            realized_vol_window,
            ..
        } => {
            let start = (entry_index + 1).saturating_sub(realized_vol_window + 1);
            let closes: Vec<f64> = instrument.bars()[start..=entry_index]
                .iter()
                .map(|b| b.close)
                .collect();
            SizingAux {
                realized_vol: realized_volatility(&closes, *realized_vol_window),
                atr: None,
            }
        }
        SizingPolicy::AtrBased { atr_window, .. } => {
            let start = (entry_index + 1).saturating_sub(ATR_HISTORY_BARS);
            let window_bars = &instrument.bars()[start..=entry_index];
            SizingAux {
                realized_vol: None,
                atr: average_true_range(window_bars, *atr_window),
            }
        }
        _ => SizingAux::default(),
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

    /// Shared scenario bars: (day, high, low, close).
    fn scenario_index() -> PriceIndex {
        PriceIndex::from_rows(vec![
            row("X", 1, 100.0, 99.0, 100.0),
            row("X", 2, 112.0, 100.0, 110.0),
            row("X", 3, 120.0, 108.0, 118.0),
            row("X", 4, 121.0, 117.0, 119.0),
        ])
        .unwrap()
    }

    #[test]
    fn test_single_long_take_profit() {
        // Entry 100, take-profit at 110 on day 2, 20 shares, final 100_200
        let config = SimulationConfig::builder()
            .direction(Direction::Long)
            .stop_loss_pct(5.0)
            .take_profit_pct(10.0)
            .holding_period_days(3)
            .initial_capital(100_000.0)
            .build()
            .unwrap();
        let result = Simulator::new(config).run(&scenario_index(), &[Signal::new("X", 1)]);

        assert_eq!(result.trades.len(), 1);
        let trade = &result.trades[0];
        assert_eq!(trade.entry_day, 1);
        assert!((trade.entry_price - 100.0).abs() < 1e-12);
        assert_eq!(trade.exit_day, 2);
        assert_eq!(trade.exit_reason, crate::ExitReason::TakeProfit);
        assert_eq!(trade.shares, 20);
        assert!((trade.pnl_currency - 200.0).abs() < 1e-9);
        assert!((result.final_portfolio_value - 100_200.0).abs() < 1e-9);
    }

    #[test]
    fn test_single_short_stop_loss() {
        // Short entry 100, stop 105 hit on day 2, pnl -100
        let config = SimulationConfig::builder()
            .direction(Direction::Short)
            .stop_loss_pct(5.0)
            .take_profit_pct(15.0)
            .holding_period_days(3)
            .initial_capital(100_000.0)
            .build()
            .unwrap();
        let result = Simulator::new(config).run(&scenario_index(), &[Signal::new("X", 1)]);

        assert_eq!(result.trades.len(), 1);
        let trade = &result.trades[0];
        assert_eq!(trade.exit_reason, crate::ExitReason::StopLoss);
        assert!((trade.exit_price - 105.0).abs() < 1e-12);
        assert_eq!(trade.shares, 20);
        assert!((trade.pnl_currency + 100.0).abs() < 1e-9);
        assert!((result.final_portfolio_value - 99_900.0).abs() < 1e-9);
    }

    fn flat_index(tickers: &[&str], days: i64) -> PriceIndex {
        let mut rows = Vec::new();
        for t in tickers {
            for d in 1..=days {
                rows.push(row(t, d, 100.0, 100.0, 100.0));
            }
        }
        PriceIndex::from_rows(rows).unwrap()
    }

    #[test]
    fn test_no_leverage_equal_weight_sizes_zero() {
        // 2% of 1000 = 20 < entry 100: both signals size to 0 shares
        let config = SimulationConfig::builder()
            .initial_capital(1_000.0)
            .holding_period_days(3)
            .build()
            .unwrap();
        let index = flat_index(&["A", "B"], 6);
        let result =
            Simulator::new(config).run(&index, &[Signal::new("A", 1), Signal::new("B", 1)]);

        assert!(result.trades.is_empty());
        assert!(result.leverage_warnings.is_empty());
        assert!((result.final_portfolio_value - 1_000.0).abs() < 1e-12);
    }

    #[test]
    fn test_no_leverage_fixed_notional_refuses_second() {
        // First opens 6 shares (600); second would need 600 > 400 available
        let config = SimulationConfig::builder()
            .initial_capital(1_000.0)
            .holding_period_days(3)
            .sizing_policy(SizingPolicy::FixedNotional { amount: 600.0 })
            .build()
            .unwrap();
        let index = flat_index(&["A", "B"], 6);
        let result =
            Simulator::new(config).run(&index, &[Signal::new("A", 1), Signal::new("B", 1)]);

        assert_eq!(result.trades.len(), 1);
        assert_eq!(result.trades[0].ticker, "A");
        assert_eq!(result.trades[0].shares, 6);
        assert_eq!(result.leverage_warnings.len(), 1);
        assert!(result.leverage_warnings[0].contains("B@1"));
        assert!(result.leverage_warnings[0].contains("would require leverage"));
    }

    #[test]
    fn test_capital_released_after_exit_day() {
        // First position (entry day 1, exit day 4) releases its 600 before a
        // day-5 signal, which can then open
        let config = SimulationConfig::builder()
            .initial_capital(1_000.0)
            .holding_period_days(3)
            .sizing_policy(SizingPolicy::FixedNotional { amount: 600.0 })
            .build()
            .unwrap();
        let index = flat_index(&["A", "B"], 10);
        let result =
            Simulator::new(config).run(&index, &[Signal::new("A", 1), Signal::new("B", 5)]);

        assert_eq!(result.trades.len(), 2);
        assert!(result.leverage_warnings.is_empty());
    }

    #[test]
    fn test_leverage_allowed_opens_both() {
        let config = SimulationConfig::builder()
            .initial_capital(1_000.0)
            .holding_period_days(3)
            .sizing_policy(SizingPolicy::FixedNotional { amount: 600.0 })
            .allow_leverage(true)
            .build()
            .unwrap();
        let index = flat_index(&["A", "B"], 6);
        let result =
            Simulator::new(config).run(&index, &[Signal::new("A", 1), Signal::new("B", 1)]);

        assert_eq!(result.trades.len(), 2);
        assert!(result.leverage_warnings.is_empty());
        // Second entry: 600 notional over a still-1000 portfolio
        assert!((result.trades[1].leverage_at_entry - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_one_trade_per_instrument_gate() {
        // Second signal arrives while the first is still active
        let config = SimulationConfig::builder()
            .initial_capital(100_000.0)
            .holding_period_days(5)
            .one_trade_per_instrument(true)
            .build()
            .unwrap();
        let index = flat_index(&["X"], 10);
        let result =
            Simulator::new(config).run(&index, &[Signal::new("X", 1), Signal::new("X", 2)]);

        assert_eq!(result.trades.len(), 1);
    }

    #[test]
    fn test_one_trade_gate_releases_after_exit() {
        let config = SimulationConfig::builder()
            .initial_capital(100_000.0)
            .holding_period_days(2)
            .one_trade_per_instrument(true)
            .build()
            .unwrap();
        let index = flat_index(&["X"], 12);
        // First exits at day 3 (time exit); a day-4 signal may open again
        let result =
            Simulator::new(config).run(&index, &[Signal::new("X", 1), Signal::new("X", 4)]);

        assert_eq!(result.trades.len(), 2);
    }

    #[test]
    fn test_time_exit_flat_series() {
        // Flat at 100, holding 3: exit day 4 at close 100, pnl 0
        let config = SimulationConfig::builder()
            .initial_capital(100_000.0)
            .holding_period_days(3)
            .stop_loss_pct(5.0)
            .build()
            .unwrap();
        let index = flat_index(&["X"], 5);
        let result = Simulator::new(config).run(&index, &[Signal::new("X", 1)]);

        assert_eq!(result.trades.len(), 1);
        let trade = &result.trades[0];
        assert_eq!(trade.exit_day, 4);
        assert_eq!(trade.exit_reason, crate::ExitReason::TimeExit);
        assert!(trade.pnl_currency.abs() < 1e-12);
        assert!((result.final_portfolio_value - 100_000.0).abs() < 1e-12);
    }

    #[test]
    fn test_entry_beyond_last_bar_skipped() {
        let config = SimulationConfig::builder().holding_period_days(3).build().unwrap();
        let index = flat_index(&["X"], 5);
        let result = Simulator::new(config).run(&index, &[Signal::new("X", 9)]);
        assert!(result.trades.is_empty());
    }

    #[test]
    fn test_insufficient_holding_window_skipped() {
        let config = SimulationConfig::builder().holding_period_days(10).build().unwrap();
        let index = flat_index(&["X"], 5);
        let result = Simulator::new(config).run(&index, &[Signal::new("X", 1)]);
        assert!(result.trades.is_empty());
    }

    #[test]
    fn test_unknown_ticker_skipped() {
        let config = SimulationConfig::builder().holding_period_days(3).build().unwrap();
        let index = flat_index(&["X"], 6);
        let result = Simulator::new(config).run(&index, &[Signal::new("MISSING", 1)]);
        assert!(result.trades.is_empty());
    }

    #[test]
    fn test_empty_signals() {
        let config = SimulationConfig::builder().build().unwrap();
        let capital = config.initial_capital;
        let index = flat_index(&["X"], 6);
        let result = Simulator::new(config).run(&index, &[]);
        assert!(result.trades.is_empty());
        assert!((result.final_portfolio_value - capital).abs() < 1e-12);
    }

    #[test]
    fn test_signal_between_bars_enters_next_bar() {
        // Bars on days 1 and 3 only; a day-2 signal enters at day 3
        let config = SimulationConfig::builder()
            .initial_capital(100_000.0)
            .holding_period_days(2)
            .build()
            .unwrap();
        let index = PriceIndex::from_rows(vec![
            row("X", 1, 100.0, 100.0, 100.0),
            row("X", 3, 100.0, 100.0, 100.0),
            row("X", 5, 100.0, 100.0, 100.0),
            row("X", 7, 100.0, 100.0, 100.0),
        ])
        .unwrap();
        let result = Simulator::new(config).run(&index, &[Signal::new("X", 2)]);

        assert_eq!(result.trades.len(), 1);
        assert_eq!(result.trades[0].entry_day, 3);
    }

    #[test]
    fn test_trades_sorted_by_exit_day() {
        // A (day 1, holding 5) exits after B (day 2, stop hit day 3)
        let config = SimulationConfig::builder()
            .initial_capital(100_000.0)
            .holding_period_days(5)
            .stop_loss_pct(5.0)
            .allow_leverage(true)
            .build()
            .unwrap();
        let mut rows = Vec::new();
        for d in 1..=8 {
            rows.push(row("A", d, 100.0, 100.0, 100.0));
        }
        rows.push(row("B", 2, 100.0, 99.0, 100.0));
        rows.push(row("B", 3, 100.0, 90.0, 92.0));
        for d in 4..=8 {
            rows.push(row("B", d, 93.0, 91.0, 92.0));
        }
        let index = PriceIndex::from_rows(rows).unwrap();
        let result =
            Simulator::new(config).run(&index, &[Signal::new("A", 1), Signal::new("B", 2)]);

        assert_eq!(result.trades.len(), 2);
        assert!(result.trades[0].exit_day <= result.trades[1].exit_day);
        assert_eq!(result.trades[0].ticker, "B");
    }

    #[test]
    fn test_portfolio_identity() {
        // final == initial + sum(pnl)
        let config = SimulationConfig::builder()
            .initial_capital(100_000.0)
            .holding_period_days(3)
            .take_profit_pct(10.0)
            .build()
            .unwrap();
        let result = Simulator::new(config).run(&scenario_index(), &[Signal::new("X", 1)]);
        let pnl_sum: f64 = result.trades.iter().map(|t| t.pnl_currency).sum();
        assert!((result.final_portfolio_value - (100_000.0 + pnl_sum)).abs() < 1e-6);
    }

    #[test]
    fn test_determinism() {
        let config = SimulationConfig::builder()
            .initial_capital(50_000.0)
            .holding_period_days(3)
            .take_profit_pct(10.0)
            .build()
            .unwrap();
        let signals = vec![Signal::new("X", 1), Signal::new("X", 2)];
        let sim = Simulator::new(config);
        let a = sim.run(&scenario_index(), &signals);
        let b = sim.run(&scenario_index(), &signals);
        assert_eq!(a.trades, b.trades);
        assert_eq!(a.final_portfolio_value, b.final_portfolio_value);
    }

    #[test]
    fn test_volatility_target_sizing_in_run() {
        // Flat history: realized vol 0 clamps to the 0.20 floor:
        // 100_000 * 0.15 / 0.20 / 100 = 750 shares
        let config = SimulationConfig::builder()
            .initial_capital(100_000.0)
            .holding_period_days(3)
            .sizing_policy(SizingPolicy::VolatilityTarget {
                target_annual_vol: 0.15,
                realized_vol_window: 60,
            })
            .build()
            .unwrap();
        let index = flat_index(&["X"], 80);
        let result = Simulator::new(config).run(&index, &[Signal::new("X", 70)]);

        assert_eq!(result.trades.len(), 1);
        assert_eq!(result.trades[0].shares, 750);
    }
}
