//! Index resolution for request headers
//!
//! Rotated indices are named by a date pattern such as
//! `[metrics-]YYYY.MM.DD`; bracketed text is literal, the rest is a date
//! format. The header of every batched request item carries the list of
//! indices covering the item's effective time range.

use chrono::{DateTime, Datelike, Duration, Months, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use metricsearch_core::time::TimeRange;

/// Rotation interval of an index pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternInterval {
    /// Single static index, no rotation
    None,
    Daily,
    Monthly,
}

/// Resolves index names for a time range
#[derive(Debug, Clone)]
pub struct IndexPattern {
    pattern: String,
    interval: PatternInterval,
}

impl IndexPattern {
    pub fn new(pattern: impl Into<String>, interval: PatternInterval) -> Self {
        Self {
            pattern: pattern.into(),
            interval,
        }
    }

    /// All index names covering `range`, in ascending order.
    pub fn index_list(&self, range: &TimeRange) -> Vec<String> {
        match self.interval {
            PatternInterval::None => vec![self.pattern.clone()],
            PatternInterval::Daily | PatternInterval::Monthly => {
                let mut indices = Vec::new();
                let mut current = self.period_start(range.from);
                while current.timestamp_millis() <= range.to {
                    let name = self.format_index(current);
                    if indices.last() != Some(&name) {
                        indices.push(name);
                    }
                    current = match self.interval {
                        PatternInterval::Daily => current + Duration::days(1),
                        PatternInterval::Monthly => match current.checked_add_months(Months::new(1))
                        {
                            Some(next) => next,
                            None => break,
                        },
                        PatternInterval::None => unreachable!(),
                    };
                }
                indices
            }
        }
    }

    /// The index name for a single point in time.
    pub fn index_for(&self, epoch_ms: i64) -> String {
        match self.interval {
            PatternInterval::None => self.pattern.clone(),
            _ => self.format_index(self.period_start(epoch_ms)),
        }
    }

    fn period_start(&self, epoch_ms: i64) -> DateTime<Utc> {
        let dt = Utc
            .timestamp_millis_opt(epoch_ms)
            .single()
            .unwrap_or_else(Utc::now);
        let day = Utc
            .with_ymd_and_hms(dt.year(), dt.month(), dt.day(), 0, 0, 0)
            .single()
            .unwrap_or(dt);
        match self.interval {
            PatternInterval::Monthly => day.with_day(1).unwrap_or(day),
            _ => day,
        }
    }

    fn format_index(&self, dt: DateTime<Utc>) -> String {
        let mut out = String::new();
        let mut tokens = String::new();
        let mut literal = false;

        let mut flush = |tokens: &mut String, out: &mut String| {
            if tokens.is_empty() {
                return;
            }
            let fmt = tokens
                .replace("YYYY", "%Y")
                .replace("MM", "%m")
                .replace("DD", "%d")
                .replace("HH", "%H");
            out.push_str(&dt.format(&fmt).to_string());
            tokens.clear();
        };

        for c in self.pattern.chars() {
            match c {
                '[' => {
                    flush(&mut tokens, &mut out);
                    literal = true;
                }
                ']' => literal = false,
                c if literal => out.push(c),
                c => tokens.push(c),
            }
        }
        flush(&mut tokens, &mut out);
        out
    }
}
