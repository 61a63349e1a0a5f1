//! Response transformation
//!
//! Walks the nested aggregation trees of a batched response and flattens
//! them into named time series and document tables. The batch is interpreted
//! through the [`CompilationResult`] that produced it: responses are paired
//! with their targets by position, comparison series get their timestamps
//! moved back onto the request range, month-to-date companions are aligned
//! with their source series and calculated metrics are synthesized from the
//! real responses before the main walk.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::{json, Value};
use tracing::debug;

use metricsearch_core::error::{SearchError, SearchResult};
use metricsearch_core::response::{
    AggregationNode, BatchedResponse, Buckets, Hits, SearchResponse,
};
use metricsearch_core::series::{
    DataPoint, DocSeries, Document, QueryData, SeriesResult, TimeSeries,
};
use metricsearch_core::target::{
    describe_metric, is_pipeline_agg, metric_label, BucketAgg, BucketAggType, Metric, MetricType,
    Target,
};

use crate::compile::CompilationResult;
use crate::formula::parse_formula;

/// One response paired with the target that produced it
struct ResolvedQuery {
    target: Target,
    response: SearchResponse,
}

/// One flat row extracted from a non-date grouping, before pivoting
struct DocRow {
    columns: Document,
    target_index: usize,
}

/// One unnamed series produced by the bucket walk
struct RawSeries {
    datapoints: Vec<DataPoint>,
    /// Series metric key: a metric type, percentile name or stat name
    metric: String,
    field: Option<String>,
    /// Grouping values collected on the way down
    props: Document,
}

/// Transforms one batched response against its compilation.
pub struct ResponseTransformer<'a> {
    compilation: &'a CompilationResult,
}

impl<'a> ResponseTransformer<'a> {
    pub fn new(compilation: &'a CompilationResult) -> Self {
        Self { compilation }
    }

    /// Flatten `batched` into named series and document tables.
    pub fn transform(&self, batched: BatchedResponse) -> SearchResult<QueryData> {
        let BatchedResponse {
            mut responses,
            config,
        } = batched;

        if responses.len() != self.compilation.items.len() {
            return Err(SearchError::transform(format!(
                "Expected {} responses in batch, got {}",
                self.compilation.items.len(),
                responses.len()
            )));
        }
        for response in &responses {
            if let Some(error) = &response.error {
                return Err(SearchError::upstream(error, config.clone()));
            }
        }

        self.reconcile_time_shift(&mut responses);
        self.reconcile_mtd(&mut responses);

        let mut resolved: Vec<ResolvedQuery> = self
            .compilation
            .targets
            .iter()
            .zip(responses)
            .map(|(compiled, response)| ResolvedQuery {
                target: compiled.target.clone(),
                response,
            })
            .collect();
        let synthesized = self.synthesize_calc_metrics(&resolved)?;
        resolved.extend(synthesized);

        let aliases = alias_map(&resolved);
        let mut data: Vec<SeriesResult> = Vec::new();
        let mut time_series: Vec<TimeSeries> = Vec::new();
        let mut doc_rows: Vec<DocRow> = Vec::new();

        for (index, query) in resolved.iter().enumerate() {
            if let Some(hits) = &query.response.hits {
                if !hits.hits.is_empty() {
                    data.push(SeriesResult::Docs(process_hits(hits, &query.target)));
                }
            }
            if let Some(aggs) = query.response.aggregations.as_ref().and_then(Value::as_object) {
                let mut raw = Vec::new();
                process_buckets(
                    aggs,
                    &query.target,
                    &mut raw,
                    &mut doc_rows,
                    &Document::new(),
                    index,
                );
                trim_datapoints(&query.target, &mut raw);
                time_series.extend(name_series(raw, &query.target));
            }
        }

        let had_time_series = !time_series.is_empty();
        data.extend(time_series.into_iter().map(SeriesResult::Time));
        if !had_time_series && !doc_rows.is_empty() {
            data.push(SeriesResult::Docs(pivot_doc_rows(
                &doc_rows, &resolved, &aliases,
            )));
        }

        debug!(results = data.len(), "transformed batched response");
        Ok(QueryData { data })
    }

    /// Move comparison-series timestamps forward onto the request range so
    /// they overlay their unshifted counterparts.
    fn reconcile_time_shift(&self, responses: &mut [SearchResponse]) {
        for (index, compiled) in self.compilation.targets.iter().enumerate() {
            let Some(shift) = compiled.time_shift_ms else {
                continue;
            };
            let Some(histogram) = compiled.target.date_histogram() else {
                continue;
            };
            let Some(aggs) = responses[index].aggregations.as_mut() else {
                continue;
            };
            for_each_agg_node_mut(aggs, &histogram.id, &mut |node| {
                let Some(buckets) = node.get_mut("buckets").and_then(Value::as_array_mut) else {
                    return;
                };
                for bucket in buckets {
                    let Some(key) = bucket.get("key").and_then(Value::as_i64) else {
                        continue;
                    };
                    let moved = key + shift;
                    bucket["key"] = json!(moved);
                    bucket["key_as_string"] = json!(moved.to_string());
                }
            });
        }
    }

    /// Align each month-to-date companion with its source series: the single
    /// wide bucket is rendered at the source's latest timestamp.
    fn reconcile_mtd(&self, responses: &mut [SearchResponse]) {
        let mut updates = Vec::new();
        for (index, compiled) in self.compilation.targets.iter().enumerate() {
            let Some(source) = compiled.mtd_source else {
                continue;
            };
            let Some(histogram) = compiled.target.date_histogram() else {
                continue;
            };
            let last_key = responses
                .get(source)
                .and_then(|r| r.aggregations.as_ref())
                .and_then(|aggs| find_agg_node(aggs, &histogram.id))
                .and_then(|node| node.get("buckets"))
                .and_then(Value::as_array)
                .and_then(|buckets| buckets.last())
                .and_then(|bucket| bucket.get("key"))
                .cloned();
            if let Some(key) = last_key {
                updates.push((index, histogram.id.clone(), key));
            }
        }

        for (index, id, key) in updates {
            let Some(aggs) = responses[index].aggregations.as_mut() else {
                continue;
            };
            for_each_agg_node_mut(aggs, &id, &mut |node| {
                let Some(first) = node
                    .get_mut("buckets")
                    .and_then(Value::as_array_mut)
                    .and_then(|buckets| buckets.first_mut())
                else {
                    return;
                };
                first["key"] = key.clone();
                first["key_as_string"] = json!(value_text(&key));
            });
        }
    }

    /// Build synthetic responses for calculated-metric targets by evaluating
    /// their formula per bucket key over the contributing responses.
    ///
    /// `queryN` refers to the N-th real (non-companion) target in batch
    /// order; keys missing from a contributing response count as zero.
    fn synthesize_calc_metrics(
        &self,
        resolved: &[ResolvedQuery],
    ) -> SearchResult<Vec<ResolvedQuery>> {
        if self.compilation.calc_metrics.is_empty() {
            return Ok(Vec::new());
        }

        let contributing: Vec<HashMap<String, f64>> = self
            .compilation
            .targets
            .iter()
            .zip(resolved)
            .filter(|(compiled, _)| compiled.mtd_source.is_none())
            .map(|(_, query)| key_values(&query.target, &query.response))
            .collect();

        let mut synthesized = Vec::new();
        for calc in &self.compilation.calc_metrics {
            let Some(bucket_agg) = calc.target.bucket_aggs.first() else {
                debug!(ref_id = %calc.target.ref_id, "calc metric without grouping, skipped");
                continue;
            };
            let Some(metric_id) = calc.target.metrics.first().map(|m| m.id.clone()) else {
                continue;
            };
            let expr = parse_formula(&calc.formula)?;

            let mut keys: Vec<String> = contributing
                .iter()
                .flat_map(|map| map.keys().cloned())
                .collect::<HashSet<_>>()
                .into_iter()
                .collect();
            if calc.date_based {
                keys.sort_by_key(|key| key.parse::<i64>().unwrap_or(0));
            } else {
                keys.sort();
            }

            let mut buckets = Vec::with_capacity(keys.len());
            for key in keys {
                let values: Vec<f64> = contributing
                    .iter()
                    .map(|map| map.get(&key).copied().unwrap_or(0.0))
                    .collect();
                let value = expr.evaluate(&values)?;
                let key_value = match key.parse::<i64>() {
                    Ok(n) if calc.date_based => json!(n),
                    _ => json!(key),
                };
                buckets.push(json!({
                    "key": key_value,
                    "key_as_string": key,
                    "doc_count": 0,
                    metric_id.as_str(): {"value": value}
                }));
            }

            synthesized.push(ResolvedQuery {
                target: calc.target.clone(),
                response: SearchResponse {
                    error: None,
                    hits: None,
                    aggregations: Some(json!({ bucket_agg.id.as_str(): {"buckets": buckets} })),
                },
            });
        }
        Ok(synthesized)
    }
}

/// Per-key metric values of one response, used by formula evaluation. The
/// value of a bucket is its first metric result, falling back to the
/// document count.
fn key_values(target: &Target, response: &SearchResponse) -> HashMap<String, f64> {
    let mut map = HashMap::new();
    let Some(aggs) = &response.aggregations else {
        return map;
    };
    let Some(first_agg) = target.bucket_aggs.first() else {
        return map;
    };
    let Some(node) = find_agg_node(aggs, &first_agg.id) else {
        return map;
    };
    let Some(buckets) = Buckets::from_value(node) else {
        return map;
    };

    for (keyed_name, bucket) in buckets.entries() {
        let key = keyed_name
            .map(str::to_string)
            .or_else(|| bucket.key().map(value_text));
        let Some(key) = key else { continue };
        let value = bucket
            .sub_entries()
            .find_map(|(_, entry)| entry.get("value").and_then(Value::as_f64))
            .or_else(|| bucket.doc_count());
        if let Some(value) = value {
            map.insert(key, value);
        }
    }
    map
}

/// Flatten returned documents, applying the target's source-field renames.
fn process_hits(hits: &Hits, target: &Target) -> DocSeries {
    let alias_dict = target.metrics.first().map(|m| &m.alias_dict);
    let mut docs = Vec::with_capacity(hits.hits.len());
    for hit in &hits.hits {
        let mut doc = Document::new();
        if let Some(source) = &hit.source {
            for (key, value) in source {
                let name = alias_dict
                    .and_then(|dict| dict.get(key))
                    .cloned()
                    .unwrap_or_else(|| key.clone());
                doc.insert(name, value.clone());
            }
        }
        if let Some(fields) = &hit.fields {
            for (key, value) in fields {
                doc.insert(key.clone(), value.clone());
            }
        }
        if let Some(id) = &hit.id {
            doc.insert("_id".to_string(), id.clone());
        }
        if let Some(doc_type) = &hit.doc_type {
            doc.insert("_type".to_string(), doc_type.clone());
        }
        if let Some(index) = &hit.index {
            doc.insert("_index".to_string(), index.clone());
        }
        docs.push(doc);
    }
    DocSeries::new(docs).with_total(hits.total)
}

/// Recursive walk over one aggregation level. Grouping values are collected
/// into `props` on the way down; the innermost level either emits datapoints
/// (date histogram) or table rows (any other grouping).
fn process_buckets(
    aggs: &serde_json::Map<String, Value>,
    target: &Target,
    series: &mut Vec<RawSeries>,
    rows: &mut Vec<DocRow>,
    props: &Document,
    target_index: usize,
) {
    let max_depth = target.bucket_aggs.len().saturating_sub(1);
    for (id, node) in aggs {
        let Some((depth, bucket_agg)) = target
            .bucket_aggs
            .iter()
            .enumerate()
            .find(|(_, agg)| agg.id == *id)
        else {
            continue;
        };

        if depth == max_depth {
            if bucket_agg.agg_type == BucketAggType::DateHistogram {
                process_metrics(node, target, series, props);
            } else {
                process_aggregation_docs(node, bucket_agg, target, rows, props, target_index);
            }
        } else if let AggregationNode::Bucketed(buckets) = AggregationNode::classify(node) {
            for (keyed_name, bucket) in buckets.entries() {
                let mut child_props = props.clone();
                match keyed_name {
                    Some(name) => {
                        child_props.insert("filter".to_string(), json!(name));
                    }
                    None => {
                        let label = bucket
                            .key_as_string()
                            .map(str::to_string)
                            .or_else(|| bucket.key().map(value_text))
                            .unwrap_or_default();
                        let prop_key = bucket_agg
                            .field
                            .clone()
                            .unwrap_or_else(|| bucket_agg.id.clone());
                        child_props.insert(prop_key, json!(label));
                    }
                }
                let children: serde_json::Map<String, Value> = bucket
                    .sub_entries()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect();
                process_buckets(&children, target, series, rows, &child_props, target_index);
            }
        }
    }
}

/// Emit one series per visible metric from a date-histogram level.
fn process_metrics(node: &Value, target: &Target, series: &mut Vec<RawSeries>, props: &Document) {
    let AggregationNode::Bucketed(buckets) = AggregationNode::classify(node) else {
        return;
    };
    let buckets = buckets.list();

    for metric in &target.metrics {
        if metric.hide {
            continue;
        }
        match &metric.metric_type {
            MetricType::Count => {
                series.push(RawSeries {
                    datapoints: buckets
                        .iter()
                        .filter_map(|b| Some(DataPoint::new(b.doc_count(), b.key_millis()?)))
                        .collect(),
                    metric: "count".to_string(),
                    field: None,
                    props: props.clone(),
                });
            }
            MetricType::Percentiles => {
                let Some(values) = buckets
                    .first()
                    .and_then(|b| b.entry(&metric.id))
                    .and_then(|entry| entry.get("values"))
                    .and_then(Value::as_object)
                else {
                    continue;
                };
                for percentile in values.keys() {
                    series.push(RawSeries {
                        datapoints: buckets
                            .iter()
                            .filter_map(|b| {
                                let value = b
                                    .entry(&metric.id)
                                    .and_then(|entry| entry.get("values"))
                                    .and_then(|v| v.get(percentile))
                                    .and_then(Value::as_f64);
                                Some(DataPoint::new(value, b.key_millis()?))
                            })
                            .collect(),
                        metric: format!("p{percentile}"),
                        field: metric.field.clone(),
                        props: props.clone(),
                    });
                }
            }
            MetricType::ExtendedStats => {
                for (stat, enabled) in &metric.meta {
                    if enabled.as_bool() != Some(true) {
                        continue;
                    }
                    series.push(RawSeries {
                        datapoints: buckets
                            .iter()
                            .filter_map(|b| {
                                let value =
                                    b.entry(&metric.id).and_then(|entry| stat_value(entry, stat));
                                Some(DataPoint::new(value, b.key_millis()?))
                            })
                            .collect(),
                        metric: stat.clone(),
                        field: metric.field.clone(),
                        props: props.clone(),
                    });
                }
            }
            _ => {
                if buckets
                    .first()
                    .map(|b| b.entry(&metric.id).is_none())
                    .unwrap_or(true)
                {
                    continue;
                }
                series.push(RawSeries {
                    datapoints: buckets
                        .iter()
                        .filter_map(|b| {
                            let value = b.entry(&metric.id).and_then(metric_value);
                            Some(DataPoint::new(value, b.key_millis()?))
                        })
                        .collect(),
                    metric: metric.metric_type.as_str().to_string(),
                    field: metric.field.clone(),
                    props: props.clone(),
                });
            }
        }
    }
}

/// Emit one table row per bucket of a non-date innermost grouping. All
/// metrics appear as columns here, including hidden ones, so calculated
/// metrics built on hidden inputs still pivot correctly.
fn process_aggregation_docs(
    node: &Value,
    bucket_agg: &BucketAgg,
    target: &Target,
    rows: &mut Vec<DocRow>,
    props: &Document,
    target_index: usize,
) {
    let Some(buckets) = Buckets::from_value(node) else {
        return;
    };

    for (keyed_name, bucket) in buckets.entries() {
        let mut columns = props.clone();
        let key_label = keyed_name
            .map(str::to_string)
            .or_else(|| bucket.key_as_string().map(str::to_string))
            .or_else(|| bucket.key().map(value_text))
            .unwrap_or_default();
        let dimension = bucket_agg
            .field
            .clone()
            .unwrap_or_else(|| bucket_agg.id.clone());
        columns.insert(dimension, json!(key_label));

        for metric in &target.metrics {
            match &metric.metric_type {
                MetricType::Count => {
                    columns.insert(
                        format!("count {}", target.ref_id),
                        json!(bucket.doc_count()),
                    );
                }
                MetricType::ExtendedStats => {
                    let Some(entry) = bucket.entry(&metric.id) else {
                        continue;
                    };
                    for (stat, enabled) in &metric.meta {
                        if enabled.as_bool() != Some(true) {
                            continue;
                        }
                        columns.insert(
                            format!(
                                "{stat} {} {}",
                                metric.field.as_deref().unwrap_or(""),
                                target.ref_id
                            ),
                            json!(stat_value(entry, stat)),
                        );
                    }
                }
                MetricType::CalcMetric => {
                    let Some(entry) = bucket.entry(&metric.id) else {
                        continue;
                    };
                    columns.insert(
                        format!(
                            "calc_metric {} {}",
                            metric.formula.as_deref().unwrap_or(""),
                            target.ref_id
                        ),
                        json!(metric_value(entry)),
                    );
                }
                MetricType::RawDocument => {}
                other => {
                    let Some(entry) = bucket.entry(&metric.id) else {
                        continue;
                    };
                    columns.insert(
                        format!(
                            "{} {} {}",
                            other.as_str(),
                            metric.field.as_deref().unwrap_or(""),
                            target.ref_id
                        ),
                        json!(metric_value(entry)),
                    );
                }
            }
        }
        rows.push(DocRow {
            columns,
            target_index,
        });
    }
}

/// Drop N leading and trailing datapoints per the histogram's `trimEdges`
/// setting; series too short to survive the trim are left whole.
fn trim_datapoints(target: &Target, series: &mut [RawSeries]) {
    let Some(trim) = target.date_histogram().and_then(|h| h.trim_edges()) else {
        return;
    };
    if trim == 0 {
        return;
    }
    for s in series.iter_mut() {
        let len = s.datapoints.len();
        if len > trim * 2 {
            s.datapoints.drain(..trim);
            s.datapoints.truncate(len - trim * 2);
        }
    }
}

/// Resolve display names for all series of one target.
fn name_series(raw: Vec<RawSeries>, target: &Target) -> Vec<TimeSeries> {
    let metric_type_count = raw
        .iter()
        .map(|s| s.metric.as_str())
        .collect::<HashSet<_>>()
        .len();
    raw.into_iter()
        .map(|s| TimeSeries {
            target: series_name(&s, target, metric_type_count),
            datapoints: s.datapoints,
        })
        .collect()
}

fn series_name(series: &RawSeries, target: &Target, metric_type_count: usize) -> String {
    static TEMPLATE: OnceLock<Regex> = OnceLock::new();
    let template = TEMPLATE.get_or_init(|| Regex::new(r"\{\{([\s\S]+?)\}\}").unwrap());

    let metric_name = metric_label(&series.metric).to_string();

    if let Some(alias) = target.alias.as_deref().filter(|a| !a.is_empty()) {
        return template
            .replace_all(alias, |caps: &Captures| {
                let group = caps[1].trim();
                if let Some(prop) = group.strip_prefix("term ") {
                    return series.props.get(prop).map(value_text).unwrap_or_default();
                }
                if let Some(value) = series.props.get(group) {
                    return value_text(value);
                }
                match group {
                    "metric" => metric_name.clone(),
                    "field" => series.field.clone().unwrap_or_default(),
                    _ => caps[0].to_string(),
                }
            })
            .to_string();
    }

    let mut metric_name = metric_name;
    if let Some(field) = &series.field {
        if is_pipeline_agg(&series.metric) {
            // Pipeline metrics reference another metric by id; name them
            // after the metric they read from.
            metric_name = match target.metrics.iter().find(|m| m.id == *field) {
                Some(referenced) => format!("{metric_name} {}", describe_metric(referenced)),
                None => format!("{metric_name} Unset"),
            };
        } else {
            metric_name = format!("{metric_name} {field}");
        }
    }

    if series.props.is_empty() {
        return metric_name;
    }
    let prop_text = series
        .props
        .values()
        .map(value_text)
        .collect::<Vec<_>>()
        .join(" ");
    if metric_type_count == 1 {
        prop_text
    } else {
        format!("{prop_text} {metric_name}")
    }
}

/// Column name (lowercased) -> target alias, for renaming pivoted columns.
fn alias_map(resolved: &[ResolvedQuery]) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for query in resolved {
        let Some(alias) = query.target.alias.as_deref().filter(|a| !a.is_empty()) else {
            continue;
        };
        for metric in &query.target.metrics {
            for column in metric_columns(metric, &query.target.ref_id) {
                map.insert(column.to_lowercase(), alias.to_string());
            }
        }
    }
    map
}

fn metric_columns(metric: &Metric, ref_id: &str) -> Vec<String> {
    match &metric.metric_type {
        MetricType::Count => vec![format!("count {ref_id}")],
        MetricType::CalcMetric => vec![format!(
            "calc_metric {} {ref_id}",
            metric.formula.as_deref().unwrap_or("")
        )],
        MetricType::ExtendedStats => metric
            .meta
            .iter()
            .filter(|(_, enabled)| enabled.as_bool() == Some(true))
            .map(|(stat, _)| {
                format!("{stat} {} {ref_id}", metric.field.as_deref().unwrap_or(""))
            })
            .collect(),
        MetricType::RawDocument => Vec::new(),
        other => vec![format!(
            "{} {} {ref_id}",
            other.as_str(),
            metric.field.as_deref().unwrap_or("")
        )],
    }
}

/// Merge per-target rows into one table keyed by the shared grouping values,
/// so metrics from different targets over the same dimensions land on the
/// same row. Columns are lowercased, metric columns renamed by target alias.
fn pivot_doc_rows(
    rows: &[DocRow],
    resolved: &[ResolvedQuery],
    aliases: &HashMap<String, String>,
) -> DocSeries {
    let mut tally: Vec<(String, usize)> = Vec::new();
    for row in rows {
        for key in row.columns.keys() {
            match tally.iter_mut().find(|(name, _)| name == key) {
                Some(entry) => entry.1 += 1,
                None => tally.push((key.clone(), 1)),
            }
        }
    }
    let mut group_key = String::new();
    let mut best = 0;
    for (name, count) in &tally {
        if *count > best {
            best = *count;
            group_key = name.clone();
        }
    }

    let mut merged: Vec<(String, Document)> = Vec::new();
    for row in rows {
        let target = &resolved[row.target_index].target;
        let dimension_fields: Vec<&str> = target
            .bucket_aggs
            .iter()
            .filter_map(|agg| agg.field.as_deref())
            .collect();
        let dims: Vec<String> = dimension_fields
            .iter()
            .filter_map(|field| row.columns.get(*field).map(value_text))
            .collect();
        let dims = if dims.is_empty() {
            row.columns
                .get(&group_key)
                .map(value_text)
                .unwrap_or_default()
        } else {
            dims.join("-")
        };

        let position = match merged.iter().position(|(key, _)| *key == dims) {
            Some(position) => position,
            None => {
                merged.push((dims.clone(), Document::new()));
                merged.len() - 1
            }
        };
        // The joined key only selects the row; every column of the row,
        // grouping dimensions included, lands on the merged document.
        let doc = &mut merged[position].1;
        for (key, value) in &row.columns {
            if key == "filter" {
                continue;
            }
            let lower = key.to_lowercase();
            let column = aliases.get(&lower).cloned().unwrap_or(lower);
            doc.insert(column, value.clone());
        }
    }

    DocSeries::new(merged.into_iter().map(|(_, doc)| doc).collect())
}

fn metric_value(entry: &Value) -> Option<f64> {
    entry
        .get("normalized_value")
        .and_then(Value::as_f64)
        .or_else(|| entry.get("value").and_then(Value::as_f64))
}

fn stat_value(entry: &Value, stat: &str) -> Option<f64> {
    match stat {
        "std_deviation_bounds_upper" => entry
            .get("std_deviation_bounds")?
            .get("upper")?
            .as_f64(),
        "std_deviation_bounds_lower" => entry
            .get("std_deviation_bounds")?
            .get("lower")?
            .as_f64(),
        _ => entry.get(stat)?.as_f64(),
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Visit every node stored under key `id`, at any depth.
fn for_each_agg_node_mut(value: &mut Value, id: &str, visit: &mut dyn FnMut(&mut Value)) {
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                if key == id {
                    visit(child);
                } else {
                    for_each_agg_node_mut(child, id, visit);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                for_each_agg_node_mut(item, id, visit);
            }
        }
        _ => {}
    }
}

/// First node stored under key `id`, at any depth.
fn find_agg_node<'v>(value: &'v Value, id: &str) -> Option<&'v Value> {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if key == id {
                    return Some(child);
                }
                if let Some(found) = find_agg_node(child, id) {
                    return Some(found);
                }
            }
            None
        }
        Value::Array(items) => items.iter().find_map(|item| find_agg_node(item, id)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use metricsearch_core::time::TimeRange;

    use crate::compile::{
        QueryCompiler, QueryOptions, ScopedVars, TemplateFormat, TemplateRenderer,
    };
    use crate::config::DatasourceSettings;

    struct NoopTemplates;

    impl TemplateRenderer for NoopTemplates {
        fn replace(&self, text: &str, _vars: &ScopedVars, _format: TemplateFormat) -> String {
            text.to_string()
        }
    }

    fn options() -> QueryOptions {
        QueryOptions {
            range: TimeRange::new(1_000, 10_000).unwrap(),
            interval: "30s".to_string(),
            scoped_vars: ScopedVars::new(),
        }
    }

    fn compile(targets: Vec<Value>) -> CompilationResult {
        let targets: Vec<Target> = targets
            .into_iter()
            .map(|t| serde_json::from_value(t).unwrap())
            .collect();
        QueryCompiler::new(&DatasourceSettings::default())
            .compile(&targets, &options(), &NoopTemplates)
            .unwrap()
    }

    fn batched(responses: Value) -> BatchedResponse {
        serde_json::from_value(json!({ "responses": responses })).unwrap()
    }

    fn count_target(ref_id: &str) -> Value {
        json!({
            "refId": ref_id,
            "metrics": [{"id": "1", "type": "count"}],
            "bucketAggs": [{"id": "2", "type": "date_histogram"}]
        })
    }

    #[test]
    fn test_count_series_from_date_histogram() {
        let compilation = compile(vec![count_target("A")]);
        let response = batched(json!([{
            "aggregations": {"2": {"buckets": [
                {"key": 1000, "doc_count": 5},
                {"key": 2000, "doc_count": 3}
            ]}}
        }]));

        let data = ResponseTransformer::new(&compilation)
            .transform(response)
            .unwrap();
        assert_eq!(data.data.len(), 1);
        let series = data.data[0].as_time().unwrap();
        assert_eq!(series.target, "Count");
        assert_eq!(
            series.datapoints,
            vec![
                DataPoint::new(Some(5.0), 1000),
                DataPoint::new(Some(3.0), 2000)
            ]
        );
    }

    #[test]
    fn test_terms_grouping_names_series_by_key() {
        let compilation = compile(vec![json!({
            "refId": "A",
            "metrics": [{"id": "1", "type": "avg", "field": "bytes"}],
            "bucketAggs": [
                {"id": "3", "type": "terms", "field": "host"},
                {"id": "2", "type": "date_histogram"}
            ]
        })]);
        let response = batched(json!([{
            "aggregations": {"3": {"buckets": [
                {"key": "srv1", "doc_count": 5, "2": {"buckets": [
                    {"key": 1000, "doc_count": 5, "1": {"value": 2.0}}
                ]}},
                {"key": "srv2", "doc_count": 3, "2": {"buckets": [
                    {"key": 1000, "doc_count": 3, "1": {"value": 4.0}}
                ]}}
            ]}}
        }]));

        let data = ResponseTransformer::new(&compilation)
            .transform(response)
            .unwrap();
        let names: Vec<&str> = data
            .data
            .iter()
            .map(|r| r.as_time().unwrap().target.as_str())
            .collect();
        assert_eq!(names, vec!["srv1", "srv2"]);
    }

    #[test]
    fn test_alias_template_expansion() {
        let compilation = compile(vec![json!({
            "refId": "A",
            "alias": "{{term host}} - {{metric}}",
            "metrics": [{"id": "1", "type": "avg", "field": "bytes"}],
            "bucketAggs": [
                {"id": "3", "type": "terms", "field": "host"},
                {"id": "2", "type": "date_histogram"}
            ]
        })]);
        let response = batched(json!([{
            "aggregations": {"3": {"buckets": [
                {"key": "srv1", "doc_count": 5, "2": {"buckets": [
                    {"key": 1000, "doc_count": 5, "1": {"value": 2.0}}
                ]}}
            ]}}
        }]));

        let data = ResponseTransformer::new(&compilation)
            .transform(response)
            .unwrap();
        assert_eq!(data.data[0].as_time().unwrap().target, "srv1 - Average");
    }

    #[test]
    fn test_extended_stats_emits_enabled_stats_only() {
        let compilation = compile(vec![json!({
            "refId": "A",
            "metrics": [{
                "id": "1",
                "type": "extended_stats",
                "field": "bytes",
                "meta": {"avg": true, "max": false, "std_deviation_bounds_upper": true}
            }],
            "bucketAggs": [{"id": "2", "type": "date_histogram"}]
        })]);
        let response = batched(json!([{
            "aggregations": {"2": {"buckets": [{
                "key": 1000,
                "doc_count": 5,
                "1": {
                    "avg": 2.5,
                    "max": 9.0,
                    "std_deviation_bounds": {"upper": 4.0, "lower": 1.0}
                }
            }]}}
        }]));

        let data = ResponseTransformer::new(&compilation)
            .transform(response)
            .unwrap();
        assert_eq!(data.data.len(), 2);
        let names: Vec<&str> = data
            .data
            .iter()
            .map(|r| r.as_time().unwrap().target.as_str())
            .collect();
        assert!(names.contains(&"Average bytes"));
        assert!(names.contains(&"Std Dev Upper bytes"));
        let avg = data
            .data
            .iter()
            .map(|r| r.as_time().unwrap())
            .find(|s| s.target == "Average bytes")
            .unwrap();
        assert_eq!(avg.datapoints, vec![DataPoint::new(Some(2.5), 1000)]);
    }

    #[test]
    fn test_percentiles_emit_one_series_per_percentile() {
        let compilation = compile(vec![json!({
            "refId": "A",
            "metrics": [{"id": "1", "type": "percentiles", "field": "latency"}],
            "bucketAggs": [{"id": "2", "type": "date_histogram"}]
        })]);
        let response = batched(json!([{
            "aggregations": {"2": {"buckets": [{
                "key": 1000,
                "doc_count": 5,
                "1": {"values": {"75.0": 3.3, "99.0": 9.9}}
            }]}}
        }]));

        let data = ResponseTransformer::new(&compilation)
            .transform(response)
            .unwrap();
        let names: Vec<&str> = data
            .data
            .iter()
            .map(|r| r.as_time().unwrap().target.as_str())
            .collect();
        assert!(names.contains(&"p75.0 latency"));
        assert!(names.contains(&"p99.0 latency"));
    }

    #[test]
    fn test_trim_edges_drops_boundary_points() {
        let compilation = compile(vec![json!({
            "refId": "A",
            "metrics": [{"id": "1", "type": "count"}],
            "bucketAggs": [{
                "id": "2",
                "type": "date_histogram",
                "settings": {"trimEdges": 2}
            }]
        })]);
        let buckets: Vec<Value> = (0..10)
            .map(|i| json!({"key": i * 1000, "doc_count": i}))
            .collect();
        let response = batched(json!([{ "aggregations": {"2": {"buckets": buckets}} }]));

        let data = ResponseTransformer::new(&compilation)
            .transform(response)
            .unwrap();
        let series = data.data[0].as_time().unwrap();
        assert_eq!(series.datapoints.len(), 6);
        assert_eq!(series.datapoints[0].timestamp, 2000);
        assert_eq!(series.datapoints[5].timestamp, 7000);
    }

    #[test]
    fn test_trim_edges_leaves_short_series_whole() {
        let compilation = compile(vec![json!({
            "refId": "A",
            "metrics": [{"id": "1", "type": "count"}],
            "bucketAggs": [{
                "id": "2",
                "type": "date_histogram",
                "settings": {"trimEdges": 2}
            }]
        })]);
        let response = batched(json!([{
            "aggregations": {"2": {"buckets": [
                {"key": 1000, "doc_count": 1},
                {"key": 2000, "doc_count": 2},
                {"key": 3000, "doc_count": 3}
            ]}}
        }]));

        let data = ResponseTransformer::new(&compilation)
            .transform(response)
            .unwrap();
        assert_eq!(data.data[0].as_time().unwrap().datapoints.len(), 3);
    }

    #[test]
    fn test_time_shift_moves_comparison_series_forward() {
        let compilation = compile(vec![json!({
            "refId": "A",
            "timeShiftComparison": "1d",
            "metrics": [{"id": "1", "type": "count"}],
            "bucketAggs": [{"id": "2", "type": "date_histogram"}]
        })]);
        let shifted_key = 1000 - 86_400_000i64;
        let response = batched(json!([{
            "aggregations": {"2": {"buckets": [
                {"key": shifted_key, "doc_count": 5}
            ]}}
        }]));

        let data = ResponseTransformer::new(&compilation)
            .transform(response)
            .unwrap();
        let series = data.data[0].as_time().unwrap();
        assert_eq!(series.datapoints[0].timestamp, 1000);
    }

    #[test]
    fn test_mtd_companion_lands_on_source_last_timestamp() {
        let mut target = count_target("A");
        target["mtd"] = json!(true);
        let compilation = compile(vec![target]);
        assert_eq!(compilation.items.len(), 2);

        let response = batched(json!([
            {"aggregations": {"2": {"buckets": [
                {"key": 1000, "doc_count": 5},
                {"key": 9000, "doc_count": 3}
            ]}}},
            {"aggregations": {"2": {"buckets": [
                {"key": 99, "doc_count": 42}
            ]}}}
        ]));

        let data = ResponseTransformer::new(&compilation)
            .transform(response)
            .unwrap();
        assert_eq!(data.data.len(), 2);
        let mtd = data.data[1].as_time().unwrap();
        assert_eq!(mtd.target, "A MTD");
        assert_eq!(mtd.datapoints, vec![DataPoint::new(Some(42.0), 9000)]);
    }

    #[test]
    fn test_calc_metric_synthesis_over_two_queries() {
        let calc = json!({
            "refId": "C",
            "metrics": [{"id": "1", "type": "calc_metric", "formula": "query1 + query2"}],
            "bucketAggs": [{"id": "2", "type": "date_histogram"}]
        });
        let compilation = compile(vec![count_target("A"), count_target("B"), calc]);
        let response = batched(json!([
            {"aggregations": {"2": {"buckets": [
                {"key": 1000, "doc_count": 2},
                {"key": 2000, "doc_count": 4}
            ]}}},
            {"aggregations": {"2": {"buckets": [
                {"key": 1000, "doc_count": 3},
                {"key": 2000, "doc_count": 1}
            ]}}}
        ]));

        let data = ResponseTransformer::new(&compilation)
            .transform(response)
            .unwrap();
        assert_eq!(data.data.len(), 3);
        let calc_series = data.data[2].as_time().unwrap();
        assert_eq!(calc_series.target, "Calculated Metric");
        assert_eq!(
            calc_series.datapoints,
            vec![
                DataPoint::new(Some(5.0), 1000),
                DataPoint::new(Some(5.0), 2000)
            ]
        );
    }

    #[test]
    fn test_calc_metric_zero_fills_missing_keys() {
        let calc = json!({
            "refId": "C",
            "metrics": [{"id": "1", "type": "calc_metric", "formula": "query1 - query2"}],
            "bucketAggs": [{"id": "2", "type": "date_histogram"}]
        });
        let compilation = compile(vec![count_target("A"), count_target("B"), calc]);
        let response = batched(json!([
            {"aggregations": {"2": {"buckets": [
                {"key": 1000, "doc_count": 7}
            ]}}},
            {"aggregations": {"2": {"buckets": [
                {"key": 2000, "doc_count": 3}
            ]}}}
        ]));

        let data = ResponseTransformer::new(&compilation)
            .transform(response)
            .unwrap();
        let calc_series = data.data[2].as_time().unwrap();
        assert_eq!(
            calc_series.datapoints,
            vec![
                DataPoint::new(Some(7.0), 1000),
                DataPoint::new(Some(-3.0), 2000)
            ]
        );
    }

    #[test]
    fn test_raw_document_hits_become_doc_series() {
        let compilation = compile(vec![json!({
            "refId": "A",
            "metrics": [{
                "id": "1",
                "type": "raw_document",
                "aliasDic": {"@timestamp": "time"}
            }]
        })]);
        let response = batched(json!([{
            "hits": {
                "total": 2,
                "hits": [
                    {
                        "_id": "a1",
                        "_type": "doc",
                        "_index": "metrics",
                        "_source": {"@timestamp": 1000, "message": "hello"}
                    },
                    {
                        "_id": "a2",
                        "_source": {"@timestamp": 2000, "message": "world"},
                        "fields": {"level": "info"}
                    }
                ]
            }
        }]));

        let data = ResponseTransformer::new(&compilation)
            .transform(response)
            .unwrap();
        let docs = data.data[0].as_docs().unwrap();
        assert_eq!(docs.series_type, "docs");
        assert_eq!(docs.total, Some(2));
        assert_eq!(docs.datapoints.len(), 2);
        assert_eq!(docs.datapoints[0]["time"], json!(1000));
        assert_eq!(docs.datapoints[0]["message"], json!("hello"));
        assert_eq!(docs.datapoints[0]["_id"], json!("a1"));
        assert_eq!(docs.datapoints[1]["level"], json!("info"));
    }

    #[test]
    fn test_terms_only_targets_pivot_into_one_table() {
        let compilation = compile(vec![
            json!({
                "refId": "A",
                "metrics": [{"id": "1", "type": "avg", "field": "bytes"}],
                "bucketAggs": [{"id": "2", "type": "terms", "field": "host"}]
            }),
            json!({
                "refId": "B",
                "alias": "Requests",
                "metrics": [{"id": "1", "type": "count"}],
                "bucketAggs": [{"id": "2", "type": "terms", "field": "host"}]
            }),
        ]);
        let response = batched(json!([
            {"aggregations": {"2": {"buckets": [
                {"key": "srv1", "doc_count": 5, "1": {"value": 2.5}},
                {"key": "srv2", "doc_count": 3, "1": {"value": 4.5}}
            ]}}},
            {"aggregations": {"2": {"buckets": [
                {"key": "srv1", "doc_count": 7},
                {"key": "srv2", "doc_count": 9}
            ]}}}
        ]));

        let data = ResponseTransformer::new(&compilation)
            .transform(response)
            .unwrap();
        assert_eq!(data.data.len(), 1);
        let table = data.data[0].as_docs().unwrap();
        assert_eq!(table.datapoints.len(), 2);
        let row = &table.datapoints[0];
        assert_eq!(row["host"], json!("srv1"));
        assert_eq!(row["avg bytes a"], json!(2.5));
        assert_eq!(row["Requests"], json!(7.0));
    }

    #[test]
    fn test_multi_dimension_pivot_keeps_each_grouping_column() {
        let compilation = compile(vec![json!({
            "refId": "A",
            "metrics": [{"id": "1", "type": "avg", "field": "bytes"}],
            "bucketAggs": [
                {"id": "3", "type": "terms", "field": "host"},
                {"id": "2", "type": "terms", "field": "dc"}
            ]
        })]);
        let response = batched(json!([{
            "aggregations": {"3": {"buckets": [
                {"key": "srv1", "doc_count": 5, "2": {"buckets": [
                    {"key": "dc1", "doc_count": 5, "1": {"value": 2.5}}
                ]}},
                {"key": "srv2", "doc_count": 3, "2": {"buckets": [
                    {"key": "dc2", "doc_count": 3, "1": {"value": 4.0}}
                ]}}
            ]}}
        }]));

        let data = ResponseTransformer::new(&compilation)
            .transform(response)
            .unwrap();
        assert_eq!(data.data.len(), 1);
        let table = data.data[0].as_docs().unwrap();
        assert_eq!(table.datapoints.len(), 2);

        let row = &table.datapoints[0];
        assert_eq!(row["host"], json!("srv1"));
        assert_eq!(row["dc"], json!("dc1"));
        assert_eq!(row["avg bytes a"], json!(2.5));
        let row = &table.datapoints[1];
        assert_eq!(row["host"], json!("srv2"));
        assert_eq!(row["dc"], json!("dc2"));
        assert_eq!(row["avg bytes a"], json!(4.0));
    }

    #[test]
    fn test_upstream_error_fails_the_whole_batch() {
        let compilation = compile(vec![count_target("A"), count_target("B")]);
        let response = batched(json!([
            {"aggregations": {"2": {"buckets": []}}},
            {"error": {"root_cause": [{"reason": "shard failure"}]}}
        ]));

        let err = ResponseTransformer::new(&compilation)
            .transform(response)
            .unwrap_err();
        assert_eq!(err.to_string(), "shard failure");
        assert_eq!(err.category(), "upstream");
    }

    #[test]
    fn test_response_count_mismatch_is_an_error() {
        let compilation = compile(vec![count_target("A")]);
        let response = batched(json!([]));
        let err = ResponseTransformer::new(&compilation)
            .transform(response)
            .unwrap_err();
        assert_eq!(err.category(), "transform");
    }

    #[test]
    fn test_hidden_metric_emits_no_series() {
        let compilation = compile(vec![json!({
            "refId": "A",
            "metrics": [
                {"id": "1", "type": "count", "hide": true},
                {"id": "3", "type": "avg", "field": "bytes"}
            ],
            "bucketAggs": [{"id": "2", "type": "date_histogram"}]
        })]);
        let response = batched(json!([{
            "aggregations": {"2": {"buckets": [
                {"key": 1000, "doc_count": 5, "3": {"value": 1.5}}
            ]}}
        }]));

        let data = ResponseTransformer::new(&compilation)
            .transform(response)
            .unwrap();
        assert_eq!(data.data.len(), 1);
        assert_eq!(data.data[0].as_time().unwrap().target, "Average bytes");
    }

    #[test]
    fn test_pipeline_metric_named_after_referenced_metric() {
        let compilation = compile(vec![json!({
            "refId": "A",
            "metrics": [
                {"id": "1", "type": "sum", "field": "bytes", "hide": true},
                {"id": "4", "type": "moving_avg", "field": "1"}
            ],
            "bucketAggs": [{"id": "2", "type": "date_histogram"}]
        })]);
        let response = batched(json!([{
            "aggregations": {"2": {"buckets": [
                {"key": 1000, "doc_count": 5, "1": {"value": 10.0}, "4": {"value": 10.0}}
            ]}}
        }]));

        let data = ResponseTransformer::new(&compilation)
            .transform(response)
            .unwrap();
        assert_eq!(
            data.data[0].as_time().unwrap().target,
            "Moving Average Sum bytes"
        );
    }

    #[test]
    fn test_derivative_prefers_normalized_value() {
        let compilation = compile(vec![json!({
            "refId": "A",
            "metrics": [
                {"id": "1", "type": "sum", "field": "bytes", "hide": true},
                {"id": "4", "type": "derivative", "field": "1"}
            ],
            "bucketAggs": [{"id": "2", "type": "date_histogram"}]
        })]);
        let response = batched(json!([{
            "aggregations": {"2": {"buckets": [
                {"key": 1000, "doc_count": 5, "1": {"value": 10.0},
                 "4": {"value": 60.0, "normalized_value": 1.0}}
            ]}}
        }]));

        let data = ResponseTransformer::new(&compilation)
            .transform(response)
            .unwrap();
        assert_eq!(
            data.data[0].as_time().unwrap().datapoints,
            vec![DataPoint::new(Some(1.0), 1000)]
        );
    }

    #[test]
    fn test_filters_grouping_uses_filter_name_as_prop() {
        let compilation = compile(vec![json!({
            "refId": "A",
            "metrics": [{"id": "1", "type": "count"}],
            "bucketAggs": [
                {"id": "3", "type": "filters", "settings": {"filters": [
                    {"query": "status:500", "label": "errors"}
                ]}},
                {"id": "2", "type": "date_histogram"}
            ]
        })]);
        let response = batched(json!([{
            "aggregations": {"3": {"buckets": {
                "errors": {"doc_count": 3, "2": {"buckets": [
                    {"key": 1000, "doc_count": 3}
                ]}}
            }}}
        }]));

        let data = ResponseTransformer::new(&compilation)
            .transform(response)
            .unwrap();
        assert_eq!(data.data[0].as_time().unwrap().target, "errors");
    }
}
