//! Trailing volatility and ATR inputs for position sizing.

use crate::price_index::OhlcBar;

/// Trading days per year used for annualisation.
const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// Annualised realized volatility over the trailing `window` closes.
///
/// Computes the sample standard deviation of simple returns over the last
/// `window` closes and scales by sqrt(252). Returns `None` when fewer than
/// three closes (two returns) are available in the window.
pub fn realized_volatility(closes: &[f64], window: usize) -> Option<f64> {
    let start = closes.len().saturating_sub(window);
    let tail = &closes[start..];
    if tail.len() < 3 {
        return None;
    }

    let returns: Vec<f64> = tail
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect();
    if returns.len() < 2 {
        return None;
    }

    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);

    Some(variance.sqrt() * TRADING_DAYS_PER_YEAR.sqrt())
}

/// Average true range over the trailing `window` bars.
///
/// True range needs the previous close, so `window + 1` bars are required;
/// returns `None` with shorter history.
pub fn average_true_range(bars: &[OhlcBar], window: usize) -> Option<f64> {
    if window == 0 || bars.len() < window + 1 {
        return None;
    }

    let start = bars.len() - window;
    let mut sum = 0.0;
    for i in start..bars.len() {
        let prev_close = bars[i - 1].close;
        let high_low = bars[i].high - bars[i].low;
        let high_close = (bars[i].high - prev_close).abs();
        let low_close = (bars[i].low - prev_close).abs();
        sum += high_low.max(high_close).max(low_close);
    }

    Some(sum / window as f64)
}
