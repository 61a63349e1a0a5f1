//! Declarative query target model
//!
//! A [`Target`] is one UI-authored query specification: a free-text filter,
//! an ordered list of metric aggregations and an ordered list of bucket
//! (grouping) aggregations, outermost first. The compiler and transformer
//! only read targets; all derived state lives in the compilation result.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::error::SearchResult;
use crate::time::calc_time_shift;

/// One query specification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    /// Unique id of this target within one request
    pub ref_id: String,

    /// Free-text filter string, may contain template variables
    #[serde(default)]
    pub query: Option<String>,

    /// Requested metric aggregations
    #[serde(default)]
    pub metrics: Vec<Metric>,

    /// Grouping levels, outermost first; the last element is the innermost
    #[serde(default)]
    pub bucket_aggs: Vec<BucketAgg>,

    /// Naming template for produced series
    #[serde(default)]
    pub alias: Option<String>,

    /// Skip this target entirely when set
    #[serde(default)]
    pub hide: bool,

    /// Comparison shift duration string, e.g. "1d" or "1w"
    #[serde(default)]
    pub time_shift_comparison: Option<String>,

    /// Request an additional month-to-date series derived from this target
    #[serde(default)]
    pub mtd: bool,

    /// When set, `raw_query` replaces the generated request body
    #[serde(default)]
    pub edit_query_mode: bool,

    /// Raw request body override (JSON text)
    #[serde(default)]
    pub raw_query: Option<String>,
}

impl Target {
    /// True when this target is a calculated metric: it contributes no
    /// request body of its own, only a formula over the other responses.
    pub fn is_calc_metric(&self) -> bool {
        self.metrics
            .first()
            .map(|m| m.metric_type == MetricType::CalcMetric)
            .unwrap_or(false)
    }

    /// The target's date-histogram grouping, if it has one.
    pub fn date_histogram(&self) -> Option<&BucketAgg> {
        self.bucket_aggs
            .iter()
            .find(|agg| agg.agg_type == BucketAggType::DateHistogram)
    }

    /// Parsed comparison shift in milliseconds, `None` when unset or blank.
    pub fn time_shift_ms(&self) -> SearchResult<Option<i64>> {
        match self.time_shift_comparison.as_deref() {
            None | Some("") => Ok(None),
            Some(shift) => calc_time_shift(shift).map(Some),
        }
    }
}

/// One requested metric aggregation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    /// Unique id within a target, used as the response key
    pub id: String,

    #[serde(rename = "type")]
    pub metric_type: MetricType,

    /// Source field name, absent for `count`
    #[serde(default)]
    pub field: Option<String>,

    /// Arithmetic formula, only for `calc_metric`
    #[serde(default)]
    pub formula: Option<String>,

    /// Stat-name -> enabled toggles, only for `extended_stats`
    #[serde(default)]
    pub meta: Map<String, Value>,

    /// Skip this metric when emitting series
    #[serde(default)]
    pub hide: bool,

    /// Aggregation-specific request settings (percents, sigma, ...)
    #[serde(default)]
    pub settings: Map<String, Value>,

    /// Source-field rename map applied to returned hit documents
    #[serde(default, rename = "aliasDic")]
    pub alias_dict: HashMap<String, String>,
}

/// Metric aggregation types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Count,
    Avg,
    Sum,
    Min,
    Max,
    ExtendedStats,
    Percentiles,
    Cardinality,
    MovingAvg,
    Derivative,
    RawDocument,
    CalcMetric,
    #[serde(untagged)]
    Other(String),
}

impl MetricType {
    /// The wire name of this metric type
    pub fn as_str(&self) -> &str {
        match self {
            MetricType::Count => "count",
            MetricType::Avg => "avg",
            MetricType::Sum => "sum",
            MetricType::Min => "min",
            MetricType::Max => "max",
            MetricType::ExtendedStats => "extended_stats",
            MetricType::Percentiles => "percentiles",
            MetricType::Cardinality => "cardinality",
            MetricType::MovingAvg => "moving_avg",
            MetricType::Derivative => "derivative",
            MetricType::RawDocument => "raw_document",
            MetricType::CalcMetric => "calc_metric",
            MetricType::Other(s) => s,
        }
    }

    /// True for pipeline aggregations, which reference another metric by id
    /// instead of a document field.
    pub fn is_pipeline(&self) -> bool {
        matches!(self, MetricType::MovingAvg | MetricType::Derivative)
    }

    /// Human-readable label used for series naming
    pub fn label(&self) -> &str {
        metric_label(self.as_str())
    }
}

/// One grouping level
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketAgg {
    /// Unique id within a target, used as the response key
    pub id: String,

    #[serde(rename = "type")]
    pub agg_type: BucketAggType,

    /// Grouping field, absent when the aggregation implies one
    #[serde(default)]
    pub field: Option<String>,

    /// Aggregation-specific settings (interval, size, trimEdges, ...)
    #[serde(default)]
    pub settings: Map<String, Value>,
}

impl BucketAgg {
    /// A settings entry as string, accepting both string and numeric forms.
    pub fn setting_str(&self, key: &str) -> Option<String> {
        match self.settings.get(key)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// A settings entry as integer, accepting both numeric and string forms.
    pub fn setting_u64(&self, key: &str) -> Option<u64> {
        match self.settings.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// The `trimEdges` setting: number of edge datapoints to drop per side.
    pub fn trim_edges(&self) -> Option<usize> {
        self.setting_u64("trimEdges").map(|n| n as usize)
    }
}

/// Bucket aggregation types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketAggType {
    DateHistogram,
    Terms,
    Filters,
    Histogram,
    #[serde(rename = "geohash_grid")]
    GeohashGrid,
    #[serde(untagged)]
    Other(String),
}

/// Metric-type value -> display label table
const METRIC_AGG_LABELS: &[(&str, &str)] = &[
    ("count", "Count"),
    ("avg", "Average"),
    ("sum", "Sum"),
    ("max", "Max"),
    ("min", "Min"),
    ("extended_stats", "Extended Stats"),
    ("percentiles", "Percentiles"),
    ("cardinality", "Unique Count"),
    ("moving_avg", "Moving Average"),
    ("derivative", "Derivative"),
    ("raw_document", "Raw Document"),
    ("calc_metric", "Calculated Metric"),
];

/// Extended-stats stat name -> display label table
const EXTENDED_STAT_LABELS: &[(&str, &str)] = &[
    ("avg", "Avg"),
    ("min", "Min"),
    ("max", "Max"),
    ("sum", "Sum"),
    ("count", "Count"),
    ("std_deviation", "Std Dev"),
    ("std_deviation_bounds_upper", "Std Dev Upper"),
    ("std_deviation_bounds_lower", "Std Dev Lower"),
];

/// Resolve a series metric key (a metric type, percentile name or stat name)
/// to a human-readable label, falling back to the raw key.
pub fn metric_label(metric: &str) -> &str {
    METRIC_AGG_LABELS
        .iter()
        .chain(EXTENDED_STAT_LABELS.iter())
        .find(|(value, _)| *value == metric)
        .map(|(_, text)| *text)
        .unwrap_or(metric)
}

/// True when the series metric key names a pipeline aggregation.
pub fn is_pipeline_agg(metric: &str) -> bool {
    metric == "moving_avg" || metric == "derivative"
}

/// Short description of a metric for pipeline-reference naming:
/// label plus source field.
pub fn describe_metric(metric: &Metric) -> String {
    match metric.field.as_deref() {
        Some(field) if !field.is_empty() => {
            format!("{} {}", metric.metric_type.label(), field)
        }
        _ => metric.metric_type.label().to_string(),
    }
}
