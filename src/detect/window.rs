//! Lookback windows over daily periods.

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

/// Longest lookback a rule may ask for; longer windows are clamped to it.
pub const MAX_LOOKBACK_DAYS: u32 = 3650;

/// An inclusive range of days. `start > end` is an empty range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// The trailing window `[effective_date - lookback_days, effective_date]`.
    pub fn lookback(effective_date: NaiveDate, lookback_days: u32) -> Self {
        Self::new(cutoff(effective_date, lookback_days), effective_date)
    }

    /// Split the lookback window at `cutoff + lookback_days / 2` into
    /// `[cutoff, midpoint)` and `[midpoint, effective_date]`.
    ///
    /// When the midpoint falls outside the calendar the first half is empty.
    pub fn halves(effective_date: NaiveDate, lookback_days: u32) -> (Self, Self) {
        let start = cutoff(effective_date, lookback_days);
        let Some(midpoint) = start.checked_add_days(Days::new(u64::from(lookback_days / 2))) else {
            return (
                Self::new(effective_date, start),
                Self::new(start, effective_date),
            );
        };
        let first_end = midpoint.pred_opt().unwrap_or(NaiveDate::MIN);
        (
            Self::new(start, first_end),
            Self::new(midpoint, effective_date),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        self.start <= day && day <= self.end
    }
}

fn cutoff(effective_date: NaiveDate, lookback_days: u32) -> NaiveDate {
    effective_date
        .checked_sub_days(Days::new(u64::from(lookback_days)))
        .unwrap_or(NaiveDate::MIN)
}

/// Arithmetic mean, `None` for an empty slice.
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Relative change from `base` to `value`, in percent.
pub fn pct_change(base: f64, value: f64) -> f64 {
    (value - base) / base * 100.0
}

/// Round to two decimals for reporting.
pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
