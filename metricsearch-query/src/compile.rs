//! Query compilation
//!
//! Turns a list of declarative targets into one batched multi-search
//! request. Each visible non-calculated target yields a header line (index
//! list, search type) and a body line; calculated-metric targets contribute
//! no request of their own and are recorded for synthesis after the response
//! arrives. Month-to-date companions are appended after the main pass so the
//! response stays index-aligned with the compiled items.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::debug;

use metricsearch_core::error::{SearchError, SearchResult};
use metricsearch_core::target::Target;
use metricsearch_core::time::{
    month_start_millis, TimeRange, INTERVAL_PLACEHOLDER, MTD_INTERVAL, TIME_FROM_PLACEHOLDER,
    TIME_TO_PLACEHOLDER,
};

use crate::builder::RequestBodyBuilder;
use crate::config::DatasourceSettings;
use crate::index_pattern::IndexPattern;

/// Template variable scope for one request
pub type ScopedVars = Map<String, Value>;

/// Escaping rule applied by the template renderer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateFormat {
    /// No extra escaping
    Default,
    /// Escape characters reserved by the query-string syntax
    Lucene,
}

/// Host-provided template variable interpolation.
pub trait TemplateRenderer: Send + Sync {
    fn replace(&self, text: &str, scoped_vars: &ScopedVars, format: TemplateFormat) -> String;
}

/// Per-request compile parameters
#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub range: TimeRange,
    /// Resolved bucket interval, e.g. "30s"
    pub interval: String,
    pub scoped_vars: ScopedVars,
}

/// One header/body pair of the batched request
#[derive(Debug, Clone)]
pub struct BatchedRequestItem {
    pub header: Value,
    pub body: Value,
}

/// A compiled target, index-aligned with the batched items
#[derive(Debug, Clone)]
pub struct CompiledTarget {
    pub target: Target,
    /// Comparison shift applied to this item's time range, if any
    pub time_shift_ms: Option<i64>,
    /// For month-to-date companions: index of the item they were derived from
    pub mtd_source: Option<usize>,
}

/// A calculated-metric target awaiting synthesis from the real responses
#[derive(Debug, Clone)]
pub struct CalcMetricQuery {
    pub target: Target,
    pub formula: String,
    /// True when the contributing targets group by a date histogram, which
    /// makes synthetic bucket keys numeric timestamps.
    pub date_based: bool,
}

/// Everything the transformer needs to interpret the batched response
#[derive(Debug, Clone, Default)]
pub struct CompilationResult {
    pub items: Vec<BatchedRequestItem>,
    pub targets: Vec<CompiledTarget>,
    pub calc_metrics: Vec<CalcMetricQuery>,
}

impl CompilationResult {
    /// True when nothing needs to be sent upstream.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Compiles targets into batched multi-search requests.
#[derive(Debug, Clone)]
pub struct QueryCompiler {
    builder: RequestBodyBuilder,
    index_pattern: IndexPattern,
    backend_version: u32,
}

impl QueryCompiler {
    pub fn new(settings: &DatasourceSettings) -> Self {
        Self {
            builder: RequestBodyBuilder::new(&settings.time_field),
            index_pattern: IndexPattern::new(&settings.index, settings.pattern_interval),
            backend_version: settings.backend_version,
        }
    }

    /// Compile all visible targets against `options`.
    pub fn compile(
        &self,
        targets: &[Target],
        options: &QueryOptions,
        templating: &dyn TemplateRenderer,
    ) -> SearchResult<CompilationResult> {
        let mut result = CompilationResult::default();
        let mut mtd_pending: Vec<(usize, Target, Value)> = Vec::new();

        for target in targets {
            if target.hide {
                continue;
            }

            if target.is_calc_metric() {
                let metric = &target.metrics[0];
                let formula = metric
                    .formula
                    .as_deref()
                    .filter(|f| !f.trim().is_empty())
                    .unwrap_or("query1 * 1")
                    .to_string();
                let date_based = target.date_histogram().is_some();
                result.calc_metrics.push(CalcMetricQuery {
                    target: target.clone(),
                    formula,
                    date_based,
                });
                continue;
            }

            let query_string =
                interpolate_query(target.query.as_deref(), &options.scoped_vars, templating);
            let mut body = self.builder.build(target, &query_string)?;

            // The companion is derived from the body before any shift or
            // interval substitution so it can get its own range and interval.
            if target.mtd {
                let mut companion = target.clone();
                companion.mtd = false;
                companion.alias = Some(match &target.alias {
                    Some(alias) if !alias.is_empty() => format!("{alias} MTD"),
                    _ => format!("{} MTD", target.ref_id),
                });
                mtd_pending.push((result.items.len(), companion, body.clone()));
            }

            substitute(&mut body, INTERVAL_PLACEHOLDER, &json!(options.interval));

            let shift_ms = target.time_shift_ms()?;
            let effective_range = match shift_ms {
                Some(shift) => options.range.shifted_back(shift),
                None => options.range,
            };
            substitute_range(&mut body, &effective_range);

            result.items.push(BatchedRequestItem {
                header: self.header(&body, &effective_range),
                body,
            });
            result.targets.push(CompiledTarget {
                target: target.clone(),
                time_shift_ms: shift_ms,
                mtd_source: None,
            });
        }

        for (source, companion, mut body) in mtd_pending {
            // A range ending exactly on the month boundary would otherwise
            // leave the companion with an empty month.
            let month_start = month_start_millis(options.range.to)?.min(options.range.to - 1);
            let range = TimeRange::new(month_start, options.range.to)?;
            substitute(&mut body, INTERVAL_PLACEHOLDER, &json!(MTD_INTERVAL));
            substitute_range(&mut body, &range);
            result.items.push(BatchedRequestItem {
                header: self.header(&body, &range),
                body,
            });
            result.targets.push(CompiledTarget {
                target: companion,
                time_shift_ms: None,
                mtd_source: Some(source),
            });
        }

        debug!(
            items = result.items.len(),
            calc_metrics = result.calc_metrics.len(),
            "compiled query batch"
        );
        Ok(result)
    }

    /// Serialize a compilation into the newline-delimited wire payload.
    pub fn payload(
        &self,
        compilation: &CompilationResult,
        options: &QueryOptions,
        templating: &dyn TemplateRenderer,
    ) -> SearchResult<String> {
        let mut lines = String::new();
        for item in &compilation.items {
            lines.push_str(&serde_json::to_string(&item.header)?);
            lines.push('\n');
            lines.push_str(&serde_json::to_string(&item.body)?);
            lines.push('\n');
        }

        // Placeholders left by raw query bodies resolve against the
        // unshifted request range.
        let lines = lines
            .replace(
                &format!("\"{TIME_FROM_PLACEHOLDER}\""),
                &options.range.from.to_string(),
            )
            .replace(
                &format!("\"{TIME_TO_PLACEHOLDER}\""),
                &options.range.to.to_string(),
            )
            .replace(TIME_FROM_PLACEHOLDER, &options.range.from.to_string())
            .replace(TIME_TO_PLACEHOLDER, &options.range.to.to_string());

        let payload = templating.replace(&lines, &options.scoped_vars, TemplateFormat::Default);

        if payload.contains(INTERVAL_PLACEHOLDER) {
            return Err(SearchError::compile(
                "Unresolved interval placeholder in request payload",
            ));
        }
        Ok(payload)
    }

    fn header(&self, body: &Value, range: &TimeRange) -> Value {
        let size_zero = body.get("size").and_then(Value::as_u64) == Some(0);
        let search_type = if size_zero && self.backend_version < 5 {
            "count"
        } else {
            "query_then_fetch"
        };
        json!({
            "search_type": search_type,
            "ignore_unavailable": true,
            "index": self.index_pattern.index_list(range)
        })
    }
}

/// Interpolate template variables into the free-text query and normalize the
/// leftovers a cleared variable leaves behind: dangling boolean operators and
/// `field:RemoveWildcard` clauses.
pub fn interpolate_query(
    query: Option<&str>,
    scoped_vars: &ScopedVars,
    templating: &dyn TemplateRenderer,
) -> String {
    static REMOVE_CLAUSE: OnceLock<Regex> = OnceLock::new();
    let remove_clause = REMOVE_CLAUSE.get_or_init(|| {
        Regex::new(r"((AND|OR|NOT)\s+)*[A-Za-z_0-9]*:RemoveWildcard").unwrap()
    });

    let raw = match query {
        Some(q) if !q.trim().is_empty() => q,
        _ => return "*".to_string(),
    };

    let mut text = templating.replace(raw, scoped_vars, TemplateFormat::Lucene);
    text = text
        .replace(" and ", " AND ")
        .replace(" or ", " OR ")
        .replace(" not ", " NOT ");
    text = remove_clause.replace_all(&text, "").trim().to_string();

    // Removing a leading clause can leave a bare operator at the front.
    for op in ["AND", "OR"] {
        if text == op {
            text.clear();
        } else if let Some(rest) = text.strip_prefix(&format!("{op} ")) {
            text = rest.trim_start().to_string();
        }
    }

    if text.is_empty() {
        "*".to_string()
    } else {
        text
    }
}

/// Replace every whole-string occurrence of `token` in `value` with
/// `replacement`, and every embedded occurrence textually.
fn substitute(value: &mut Value, token: &str, replacement: &Value) {
    match value {
        Value::String(text) => {
            let substituted = if text == token {
                Some(replacement.clone())
            } else if text.contains(token) {
                let rendered = match replacement {
                    Value::String(r) => text.replace(token, r),
                    other => text.replace(token, &other.to_string()),
                };
                Some(Value::String(rendered))
            } else {
                None
            };
            if let Some(substituted) = substituted {
                *value = substituted;
            }
        }
        Value::Array(items) => {
            for item in items {
                substitute(item, token, replacement);
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                substitute(item, token, replacement);
            }
        }
        _ => {}
    }
}

fn substitute_range(body: &mut Value, range: &TimeRange) {
    substitute(body, TIME_FROM_PLACEHOLDER, &json!(range.from));
    substitute(body, TIME_TO_PLACEHOLDER, &json!(range.to));
}
