//! Per-instrument OHLC price history with O(log n) date lookup.
//!
//! The [`PriceIndex`] is built once per request from a flat stream of price
//! rows and is read-only afterwards, so it can be shared freely across
//! optimiser workers.

use std::collections::HashMap;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::{BacktestError, Result};

/// Integer day count from the proleptic Gregorian epoch (0001-01-01 = day 1).
///
/// Days need not be consecutive; weekends and holidays simply don't appear.
pub type DayOrdinal = i64;

/// Convert a calendar date to its day ordinal.
pub fn day_ordinal(date: NaiveDate) -> DayOrdinal {
    date.num_days_from_ce() as DayOrdinal
}

/// Convert a day ordinal back to a calendar date.
///
/// Returns `None` for ordinals outside chrono's representable range.
pub fn ordinal_date(day: DayOrdinal) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(i32::try_from(day).ok()?)
}

/// One period's open/high/low/close/volume for one instrument.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OhlcBar {
    /// Trading day ordinal
    pub day: DayOrdinal,
    /// Opening price
    pub open: f64,
    /// Intraday high
    pub high: f64,
    /// Intraday low
    pub low: f64,
    /// Closing price
    pub close: f64,
    /// Traded volume
    pub volume: f64,
}

/// A single input row for [`PriceIndex::from_rows`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRow {
    /// Ticker symbol
    pub ticker: String,
    /// Trading day ordinal
    pub day: DayOrdinal,
    /// Opening price
    pub open: f64,
    /// Intraday high
    pub high: f64,
    /// Intraday low
    pub low: f64,
    /// Closing price
    pub close: f64,
    /// Traded volume
    pub volume: f64,
}

/// An instruction to open a position in a ticker on or after a given day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    /// Ticker symbol
    pub ticker: String,
    /// Earliest day the position may be opened
    pub day: DayOrdinal,
}

impl Signal {
    /// Convenience constructor.
    pub fn new(ticker: impl Into<String>, day: DayOrdinal) -> Self {
        Self {
            ticker: ticker.into(),
            day,
        }
    }
}

/// Date-sorted OHLC history for one instrument.
#[derive(Debug, Clone)]
pub struct Instrument {
    /// Ticker symbol
    pub ticker: String,
    bars: Vec<OhlcBar>,
}

impl Instrument {
    /// Number of bars.
    pub fn len(&self) -> usize {
        self.bars.len()
    }

    /// Whether the instrument has no bars.
    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Bar at index `i`.
    pub fn bar(&self, i: usize) -> &OhlcBar {
        &self.bars[i]
    }

    /// All bars, day ascending.
    pub fn bars(&self) -> &[OhlcBar] {
        &self.bars
    }

    /// Index of the first bar whose day is `>= day`, or `None` when the
    /// requested day lies beyond the last bar.
    pub fn lookup_from(&self, day: DayOrdinal) -> Option<usize> {
        let idx = self.bars.partition_point(|b| b.day < day);
        (idx < self.bars.len()).then_some(idx)
    }
}

/// Immutable mapping from ticker to its date-sorted price history.
#[derive(Debug, Clone, Default)]
pub struct PriceIndex {
    instruments: HashMap<String, Instrument>,
}

impl PriceIndex {
    /// Build the index from a flat stream of price rows.
    ///
    /// Rows are grouped by ticker and stable-sorted by day. Duplicate days
    /// within a ticker are rejected. Bars violating `low <= open,close <= high`
    /// are kept but logged as warnings.
    pub fn from_rows(rows: impl IntoIterator<Item = PriceRow>) -> Result<Self> {
        let mut grouped: HashMap<String, Vec<OhlcBar>> = HashMap::new();
        for row in rows {
            grouped.entry(row.ticker.clone()).or_default().push(OhlcBar {
                day: row.day,
                open: row.open,
                high: row.high,
                low: row.low,
                close: row.close,
                volume: row.volume,
            });
        }

        let mut instruments = HashMap::with_capacity(grouped.len());
        for (ticker, mut bars) in grouped {
            bars.sort_by_key(|b| b.day);
            for pair in bars.windows(2) {
                if pair[0].day == pair[1].day {
                    return Err(BacktestError::duplicate_day(ticker, pair[0].day));
                }
            }
            for bar in &bars {
                let sane = bar.low <= bar.open
                    && bar.low <= bar.close
                    && bar.open <= bar.high
                    && bar.close <= bar.high;
                if !sane {
                    tracing::warn!(
                        ticker = %ticker,
                        day = bar.day,
                        "OHLC sanity violation: low <= open,close <= high does not hold"
                    );
                }
            }
            instruments.insert(
                ticker.clone(),
                Instrument { ticker, bars },
            );
        }

        Ok(Self { instruments })
    }

    /// Look up a ticker, failing with [`BacktestError::UnknownTicker`].
    pub fn instrument(&self, ticker: &str) -> Result<&Instrument> {
        self.instruments
            .get(ticker)
            .ok_or_else(|| BacktestError::unknown_ticker(ticker))
    }

    /// Look up a ticker, `None` when absent.
    pub fn get(&self, ticker: &str) -> Option<&Instrument> {
        self.instruments.get(ticker)
    }

    /// Number of instruments.
    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    /// Whether the index holds no instruments.
    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }

    /// Iterate over ticker symbols.
    pub fn tickers(&self) -> impl Iterator<Item = &str> {
        self.instruments.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(ticker: &str, day: DayOrdinal, close: f64) -> PriceRow {
        PriceRow {
            ticker: ticker.to_string(),
            day,
            open: close,
            high: close * 1.01,
            low: close * 0.99,
            close,
            volume: 1_000.0,
        }
    }

    #[test]
    fn test_build_sorts_by_day() {
        let index = PriceIndex::from_rows(vec![
            row("X", 30, 102.0),
            row("X", 10, 100.0),
            row("X", 20, 101.0),
        ])
        .unwrap();

        let inst = index.instrument("X").unwrap();
        let days: Vec<_> = inst.bars().iter().map(|b| b.day).collect();
        assert_eq!(days, vec![10, 20, 30]);
    }

    #[test]
    fn test_duplicate_day_rejected() {
        let result = PriceIndex::from_rows(vec![row("X", 10, 100.0), row("X", 10, 101.0)]);
        assert!(matches!(result, Err(BacktestError::DuplicateDay { .. })));
    }

    #[test]
    fn test_lookup_from_exact_and_gap() {
        let index =
            PriceIndex::from_rows(vec![row("X", 10, 100.0), row("X", 13, 101.0)]).unwrap();
        let inst = index.instrument("X").unwrap();

        // Exact match
        assert_eq!(inst.lookup_from(10), Some(0));
        // Gap: next bar on or after day 11 is day 13
        assert_eq!(inst.lookup_from(11), Some(1));
        // Beyond last bar
        assert_eq!(inst.lookup_from(14), None);
    }

    #[test]
    fn test_unknown_ticker() {
        let index = PriceIndex::from_rows(vec![row("X", 10, 100.0)]).unwrap();
        assert!(matches!(
            index.instrument("Y"),
            Err(BacktestError::UnknownTicker { .. })
        ));
    }

    #[test]
    fn test_insane_bar_is_kept() {
        // high < low: warned, not rejected
        let index = PriceIndex::from_rows(vec![PriceRow {
            ticker: "X".to_string(),
            day: 10,
            open: 100.0,
            high: 90.0,
            low: 110.0,
            close: 100.0,
            volume: 0.0,
        }])
        .unwrap();
        assert_eq!(index.instrument("X").unwrap().len(), 1);
    }

    #[test]
    fn test_day_ordinal_roundtrip() {
        let date = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();
        let day = day_ordinal(date);
        assert_eq!(ordinal_date(day), Some(date));
    }
}
