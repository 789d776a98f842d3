//! Simulation configuration and builder.

use serde::{Deserialize, Serialize};

use crate::error::{BacktestError, Result};
use crate::sizing::SizingPolicy;

/// Position direction, applied uniformly to all signals within one simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Profit when price rises
    Long,
    /// Profit when price falls
    Short,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// Exit rules applied to every trade.
///
/// Percentages are positive and relative to the entry price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitRules {
    /// Maximum number of bars a position may remain open before time-exit
    pub holding_period_days: usize,
    /// Stop-loss threshold in percent (e.g. `5.0`)
    pub stop_loss_pct: f64,
    /// Optional take-profit threshold in percent (e.g. `10.0`)
    pub take_profit_pct: Option<f64>,
}

/// Configuration for a single simulation run.
///
/// Use [`SimulationConfig::builder`] to construct with validation.
///
/// # Example
///
/// ```
/// use signal_backtest::{Direction, SimulationConfig, SizingPolicy};
///
/// let config = SimulationConfig::builder()
///     .direction(Direction::Long)
///     .holding_period_days(20)
///     .stop_loss_pct(5.0)
///     .take_profit_pct(10.0)
///     .initial_capital(100_000.0)
///     .sizing_policy(SizingPolicy::EqualWeight)
///     .build()
///     .unwrap();
/// assert_eq!(config.exit_rules.holding_period_days, 20);
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Trade direction for every signal
    pub direction: Direction,
    /// Stop / target / time exit rules
    pub exit_rules: ExitRules,
    /// Position sizing policy
    pub sizing_policy: SizingPolicy,
    /// Starting portfolio value
    pub initial_capital: f64,
    /// Whether total open notional may exceed portfolio value
    pub allow_leverage: bool,
    /// Skip signals for instruments with a still-active position
    pub one_trade_per_instrument: bool,
}

impl SimulationConfig {
    /// Start building a configuration.
    pub fn builder() -> SimulationConfigBuilder {
        SimulationConfigBuilder::default()
    }

    /// A copy of this configuration with different exit rules.
    ///
    /// The optimizer uses this to vary one grid cell at a time.
    pub fn with_exit_rules(&self, exit_rules: ExitRules) -> Self {
        Self {
            exit_rules,
            ..self.clone()
        }
    }
}

/// Builder for [`SimulationConfig`].
#[derive(Debug, Clone)]
pub struct SimulationConfigBuilder {
    direction: Direction,
    holding_period_days: usize,
    stop_loss_pct: f64,
    take_profit_pct: Option<f64>,
    sizing_policy: SizingPolicy,
    initial_capital: f64,
    allow_leverage: bool,
    one_trade_per_instrument: bool,
}

impl Default for SimulationConfigBuilder {
    fn default() -> Self {
        Self {
            direction: Direction::Long,
            holding_period_days: 20,
            stop_loss_pct: 5.0,
            take_profit_pct: None,
            sizing_policy: SizingPolicy::EqualWeight,
            initial_capital: 100_000.0,
            allow_leverage: false,
            one_trade_per_instrument: false,
        }
    }
}

impl SimulationConfigBuilder {
    /// Set the trade direction.
    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// Set the maximum holding period in bars.
    pub fn holding_period_days(mut self, days: usize) -> Self {
        self.holding_period_days = days;
        self
    }

    /// Set the stop-loss percentage.
    pub fn stop_loss_pct(mut self, pct: f64) -> Self {
        self.stop_loss_pct = pct;
        self
    }

    /// Set the take-profit percentage.
    pub fn take_profit_pct(mut self, pct: f64) -> Self {
        self.take_profit_pct = Some(pct);
        self
    }

    /// Clear the take-profit threshold.
    pub fn no_take_profit(mut self) -> Self {
        self.take_profit_pct = None;
        self
    }

    /// Set the sizing policy.
    pub fn sizing_policy(mut self, policy: SizingPolicy) -> Self {
        self.sizing_policy = policy;
        self
    }

    /// Set the initial capital.
    pub fn initial_capital(mut self, capital: f64) -> Self {
        self.initial_capital = capital;
        self
    }

    /// Allow open notional to exceed portfolio value.
    pub fn allow_leverage(mut self, allow: bool) -> Self {
        self.allow_leverage = allow;
        self
    }

    /// Restrict each instrument to one active position at a time.
    pub fn one_trade_per_instrument(mut self, one: bool) -> Self {
        self.one_trade_per_instrument = one;
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<SimulationConfig> {
        if !self.initial_capital.is_finite() || self.initial_capital <= 0.0 {
            return Err(BacktestError::invalid_param(
                "initial_capital",
                "must be a positive finite number",
            ));
        }
        if self.holding_period_days == 0 {
            return Err(BacktestError::invalid_param(
                "holding_period_days",
                "must be at least 1",
            ));
        }
        if !self.stop_loss_pct.is_finite() || self.stop_loss_pct <= 0.0 {
            return Err(BacktestError::invalid_param(
                "stop_loss_pct",
                "must be a positive finite percentage",
            ));
        }
        if let Some(tp) = self.take_profit_pct {
            if !tp.is_finite() || tp <= 0.0 {
                return Err(BacktestError::invalid_param(
                    "take_profit_pct",
                    "must be a positive finite percentage",
                ));
            }
        }
        validate_sizing_policy(&self.sizing_policy)?;

        Ok(SimulationConfig {
            direction: self.direction,
            exit_rules: ExitRules {
                holding_period_days: self.holding_period_days,
                stop_loss_pct: self.stop_loss_pct,
                take_profit_pct: self.take_profit_pct,
            },
            sizing_policy: self.sizing_policy,
            initial_capital: self.initial_capital,
            allow_leverage: self.allow_leverage,
            one_trade_per_instrument: self.one_trade_per_instrument,
        })
    }
}

/// Reject non-finite or non-positive sizing parameters up front.
///
/// Kelly statistics are exempt: missing or pathological values fall through
/// to the documented 2% fallback at sizing time instead of failing the run.
fn validate_sizing_policy(policy: &SizingPolicy) -> Result<()> {
    let check = |name: &str, value: f64| -> Result<()> {
        if !value.is_finite() || value <= 0.0 {
            return Err(BacktestError::invalid_param(
                name,
                "must be a positive finite number",
            ));
        }
        Ok(())
    };

    match policy {
        SizingPolicy::EqualWeight => Ok(()),
        SizingPolicy::FixedNotional { amount } => check("amount", *amount),
        SizingPolicy::PercentRisk {
            risk_pct,
            stop_assumption_pct,
        } => {
            check("risk_pct", *risk_pct)?;
            check("stop_assumption_pct", *stop_assumption_pct)
        }
        SizingPolicy::VolatilityTarget {
            target_annual_vol, ..
        } => check("target_annual_vol", *target_annual_vol),
        SizingPolicy::AtrBased { risk_pct, .. } => check("risk_pct", *risk_pct),
        SizingPolicy::KellyCriterion {
            win_rate_pct,
            avg_win_pct,
            avg_loss_pct,
        } => {
            for (name, value) in [
                ("win_rate_pct", win_rate_pct),
                ("avg_win_pct", avg_win_pct),
                ("avg_loss_pct", avg_loss_pct),
            ] {
                if !value.is_finite() {
                    return Err(BacktestError::invalid_param(name, "must be finite"));
                }
            }
            Ok(())
        }
    }
}
