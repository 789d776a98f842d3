//! Position sizing policies and the shared cap pipeline.
//!
//! Each policy produces a raw share count from its own formula; a single
//! cap pipeline is then applied identically so no policy can bypass the
//! portfolio or leverage constraints.

use serde::{Deserialize, Serialize};

/// Fraction of portfolio value committed by [`SizingPolicy::EqualWeight`].
pub const EQUAL_WEIGHT_FRACTION: f64 = 0.02;

/// Floor applied to realized volatility in [`SizingPolicy::VolatilityTarget`].
pub const VOLATILITY_FLOOR: f64 = 0.20;

/// ATR floor as a fraction of entry price in [`SizingPolicy::AtrBased`].
pub const ATR_FLOOR_PCT: f64 = 0.02;

/// Maximum Kelly fraction.
pub const KELLY_CAP: f64 = 0.25;

/// Fallback fraction when Kelly parameters are missing or pathological.
pub const KELLY_FALLBACK_FRACTION: f64 = 0.02;

/// Default trailing-close window for realized volatility.
pub const DEFAULT_REALIZED_VOL_WINDOW: usize = 60;

/// Default ATR lookback window.
pub const DEFAULT_ATR_WINDOW: usize = 14;

/// How many shares to buy for a given entry, as a pure function of the
/// policy and the portfolio state.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SizingPolicy {
    /// Fixed 2% of current portfolio value per trade
    EqualWeight,

    /// Fixed currency amount per trade
    FixedNotional {
        /// Notional committed per trade
        amount: f64,
    },

    /// Risk a percentage of the portfolio against an assumed stop distance
    PercentRisk {
        /// Percent of portfolio value risked per trade (e.g. 2.0)
        risk_pct: f64,
        /// Assumed stop distance as a fraction of entry price (e.g. 0.05)
        stop_assumption_pct: f64,
    },

    /// Scale exposure so the position's annualised volatility hits a target
    VolatilityTarget {
        /// Target annual volatility (e.g. 0.15)
        target_annual_vol: f64,
        /// Trailing-close window for the realized-volatility estimate
        realized_vol_window: usize,
    },

    /// Risk a percentage of the portfolio against twice the ATR
    AtrBased {
        /// Percent of portfolio value risked per trade (e.g. 2.0)
        risk_pct: f64,
        /// ATR lookback window
        atr_window: usize,
    },

    /// Kelly-criterion fraction from historical win/loss statistics
    KellyCriterion {
        /// Historical win rate in percent (e.g. 55.0)
        win_rate_pct: f64,
        /// Average winning trade return in percent (e.g. 8.0)
        avg_win_pct: f64,
        /// Average losing trade return in percent (negative, e.g. -4.0)
        avg_loss_pct: f64,
    },
}

impl Default for SizingPolicy {
    fn default() -> Self {
        Self::EqualWeight
    }
}

/// Portfolio state at the moment of sizing.
#[derive(Debug, Clone, Copy)]
pub struct SizingContext {
    /// Candidate entry price
    pub entry_price: f64,
    /// Current portfolio value (pre-P&L of the candidate trade)
    pub portfolio_value: f64,
    /// Sum of notionals of currently open positions
    pub open_notional: f64,
    /// Whether open notional may exceed portfolio value
    pub allow_leverage: bool,
}

/// On-demand market inputs some policies need.
#[derive(Debug, Clone, Copy, Default)]
pub struct SizingAux {
    /// Annualised realized volatility, when computable
    pub realized_vol: Option<f64>,
    /// Average true range, when computable
    pub atr: Option<f64>,
}

/// Compute the whole-unit share count for a candidate entry.
///
/// The raw per-policy share count passes through the cap pipeline:
/// 1. cap at `portfolio_value / entry_price` (never exceed the full
///    portfolio in one trade, even with leverage);
/// 2. when `allow_leverage` is false, cap at
///    `(portfolio_value - open_notional) / entry_price`, returning 0 when
///    no capital is available;
/// 3. floor to a whole number of shares, clamped at zero.
pub fn shares(policy: &SizingPolicy, ctx: &SizingContext, aux: &SizingAux) -> u64 {
    if ctx.entry_price <= 0.0 || !ctx.entry_price.is_finite() || ctx.portfolio_value <= 0.0 {
        return 0;
    }

    let mut raw = raw_shares(policy, ctx, aux);
    if !raw.is_finite() || raw <= 0.0 {
        return 0;
    }

    raw = raw.min(ctx.portfolio_value / ctx.entry_price);

    if !ctx.allow_leverage {
        let available = ctx.portfolio_value - ctx.open_notional;
        if available <= 0.0 {
            return 0;
        }
        raw = raw.min(available / ctx.entry_price);
    }

    raw.floor() as u64
}

/// Per-policy raw share count, before the cap pipeline.
fn raw_shares(policy: &SizingPolicy, ctx: &SizingContext, aux: &SizingAux) -> f64 {
    let entry = ctx.entry_price;
    let portfolio = ctx.portfolio_value;

    match policy {
        SizingPolicy::EqualWeight => EQUAL_WEIGHT_FRACTION * portfolio / entry,

        SizingPolicy::FixedNotional { amount } => amount / entry,

        SizingPolicy::PercentRisk {
            risk_pct,
            stop_assumption_pct,
        } => {
            let risk_amount = portfolio * risk_pct / 100.0;
            risk_amount / (entry * stop_assumption_pct)
        }

        SizingPolicy::VolatilityTarget {
            target_annual_vol, ..
        } => {
            let vol = aux
                .realized_vol
                .unwrap_or(VOLATILITY_FLOOR)
                .max(VOLATILITY_FLOOR);
            portfolio * target_annual_vol / vol / entry
        }

        SizingPolicy::AtrBased { risk_pct, .. } => {
            let floor = entry * ATR_FLOOR_PCT;
            let atr = aux.atr.unwrap_or(floor).max(floor);
            let risk_amount = portfolio * risk_pct / 100.0;
            risk_amount / (2.0 * atr)
        }

        SizingPolicy::KellyCriterion {
            win_rate_pct,
            avg_win_pct,
            avg_loss_pct,
        } => {
            let fraction = kelly_fraction(*win_rate_pct, *avg_win_pct, *avg_loss_pct);
            fraction * portfolio / entry
        }
    }
}

/// Kelly fraction clamped to `[0, KELLY_CAP]`.
///
/// Falls back to [`KELLY_FALLBACK_FRACTION`] when the inputs are missing or
/// pathological (non-finite, non-positive win rate or average win, or an
/// average loss of zero).
fn kelly_fraction(win_rate_pct: f64, avg_win_pct: f64, avg_loss_pct: f64) -> f64 {
    let p = win_rate_pct / 100.0;
    let win = avg_win_pct.abs() / 100.0;
    let loss = avg_loss_pct.abs() / 100.0;

    let usable = p.is_finite()
        && win.is_finite()
        && loss.is_finite()
        && p > 0.0
        && win > 0.0
        && loss > 0.0;
    if !usable {
        tracing::warn!(
            win_rate_pct,
            avg_win_pct,
            avg_loss_pct,
            "Kelly parameters missing or pathological; falling back to 2% fraction"
        );
        return KELLY_FALLBACK_FRACTION;
    }

    let b = win / loss;
    let fraction = (b * p - (1.0 - p)) / b;
    fraction.clamp(0.0, KELLY_CAP)
}
