//! Time handling for query compilation

use chrono::{Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{SearchError, SearchResult};

/// Bucket-interval placeholder resolved at compile time.
pub const INTERVAL_PLACEHOLDER: &str = "$__interval";

/// Range lower-bound placeholder, resolved to epoch milliseconds.
pub const TIME_FROM_PLACEHOLDER: &str = "$timeFrom";

/// Range upper-bound placeholder, resolved to epoch milliseconds.
pub const TIME_TO_PLACEHOLDER: &str = "$timeTo";

/// Interval wide enough to fold a month-to-date query into a single bucket.
pub const MTD_INTERVAL: &str = "10000d";

/// Time range for queries, in epoch milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start time (inclusive)
    pub from: i64,
    /// End time (inclusive)
    pub to: i64,
}

impl TimeRange {
    /// Create a new time range
    pub fn new(from: i64, to: i64) -> SearchResult<Self> {
        if from >= to {
            return Err(SearchError::time_range(
                "Range start must be before range end",
            ));
        }
        Ok(Self { from, to })
    }

    /// Get the duration of this time range in milliseconds
    pub fn duration_millis(&self) -> i64 {
        self.to - self.from
    }

    /// The same range moved back by `shift_ms` milliseconds.
    pub fn shifted_back(&self, shift_ms: i64) -> Self {
        Self {
            from: self.from - shift_ms,
            to: self.to - shift_ms,
        }
    }

    /// Check if a timestamp falls within this range
    pub fn contains(&self, timestamp_ms: i64) -> bool {
        timestamp_ms >= self.from && timestamp_ms <= self.to
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} - {}]", self.from, self.to)
    }
}

/// Parse a comparison-shift duration string like `"30m"`, `"1d"` or `"1M"`
/// into milliseconds.
///
/// Recognized units: `m` minutes, `h` hours, `d` days, `w` weeks,
/// `M` months (30 days), `Y` years (365 days).
pub fn calc_time_shift(shift: &str) -> SearchResult<i64> {
    if shift.len() < 2 || !shift.is_ascii() {
        return Err(SearchError::time_range(format!(
            "Invalid time shift: '{shift}'"
        )));
    }

    let (amount, unit) = shift.split_at(shift.len() - 1);
    let unit_ms: i64 = match unit {
        "m" => 60 * 1000,
        "h" => 60 * 60 * 1000,
        "d" => 24 * 60 * 60 * 1000,
        "w" => 7 * 24 * 60 * 60 * 1000,
        "M" => 30 * 24 * 60 * 60 * 1000,
        "Y" => 365 * 24 * 60 * 60 * 1000,
        other => {
            return Err(SearchError::time_range(format!(
                "Unknown time shift unit: '{other}'"
            )))
        }
    };

    let amount: f64 = amount.parse().map_err(|_| {
        SearchError::time_range(format!("Invalid time shift amount: '{amount}'"))
    })?;

    Ok((amount * unit_ms as f64) as i64)
}

/// Epoch milliseconds of the first instant of the month containing
/// `epoch_ms` (UTC).
pub fn month_start_millis(epoch_ms: i64) -> SearchResult<i64> {
    let dt = Utc
        .timestamp_millis_opt(epoch_ms)
        .single()
        .ok_or_else(|| SearchError::time_range(format!("Invalid timestamp: {epoch_ms}")))?;

    let first = Utc
        .with_ymd_and_hms(dt.year(), dt.month(), 1, 0, 0, 0)
        .single()
        .ok_or_else(|| SearchError::time_range(format!("Invalid month start for: {epoch_ms}")))?;

    Ok(first.timestamp_millis())
}
