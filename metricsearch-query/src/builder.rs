//! Request body construction
//!
//! Turns one [`Target`] into a single search body: a filtered query plus a
//! nested aggregation tree. Grouping levels are listed outermost-first on the
//! target and nested right-to-left here so the innermost grouping carries the
//! metric aggregations.

use serde_json::{json, Map, Value};

use metricsearch_core::error::{SearchError, SearchResult};
use metricsearch_core::target::{BucketAgg, BucketAggType, MetricType, Target};
use metricsearch_core::time::{
    INTERVAL_PLACEHOLDER, TIME_FROM_PLACEHOLDER, TIME_TO_PLACEHOLDER,
};

const DEFAULT_TERMS_SIZE: u64 = 10;
const UNLIMITED_TERMS_SIZE: u64 = 500;
const DEFAULT_RAW_DOCUMENT_SIZE: u64 = 500;
const DEFAULT_GEOHASH_PRECISION: u64 = 3;

/// Builds search request bodies for individual targets.
#[derive(Debug, Clone)]
pub struct RequestBodyBuilder {
    time_field: String,
}

impl RequestBodyBuilder {
    pub fn new(time_field: impl Into<String>) -> Self {
        Self {
            time_field: time_field.into(),
        }
    }

    /// Build the request body for `target`, with `query_string` already
    /// interpolated. Range bounds and the bucket interval stay as
    /// placeholders so the compiler can substitute per-item effective values.
    pub fn build(&self, target: &Target, query_string: &str) -> SearchResult<Value> {
        if target.edit_query_mode {
            if let Some(raw) = target.raw_query.as_deref() {
                return self.parse_raw_query(raw);
            }
        }

        let mut body = json!({
            "size": 0,
            "query": {
                "bool": {
                    "filter": [
                        {
                            "range": {
                                self.time_field.as_str(): {
                                    "gte": TIME_FROM_PLACEHOLDER,
                                    "lte": TIME_TO_PLACEHOLDER,
                                    "format": "epoch_millis"
                                }
                            }
                        },
                        {
                            "query_string": {
                                "analyze_wildcard": true,
                                "query": query_string
                            }
                        }
                    ]
                }
            }
        });

        // A leading raw_document metric turns the target into a plain
        // document fetch with no aggregations.
        if let Some(first) = target.metrics.first() {
            if first.metric_type == MetricType::RawDocument {
                let size = first
                    .settings
                    .get("size")
                    .and_then(size_setting)
                    .unwrap_or(DEFAULT_RAW_DOCUMENT_SIZE);
                body["size"] = json!(size);
                return Ok(body);
            }
        }

        let metric_aggs = self.metric_aggs(target);
        let mut aggs = metric_aggs;
        for agg in target.bucket_aggs.iter().rev() {
            let mut node = self.bucket_agg(agg)?;
            if let (Some(obj), false) = (node.as_object_mut(), aggs.is_empty()) {
                obj.insert("aggs".to_string(), Value::Object(aggs));
            }
            let mut level = Map::new();
            level.insert(agg.id.clone(), node);
            aggs = level;
        }

        if !aggs.is_empty() {
            body["aggs"] = Value::Object(aggs);
        }

        Ok(body)
    }

    fn parse_raw_query(&self, raw: &str) -> SearchResult<Value> {
        let flat: String = raw.chars().filter(|c| *c != '\n' && *c != '\r').collect();
        serde_json::from_str(&flat)
            .map_err(|e| SearchError::compile(format!("Invalid raw query body: {e}")))
    }

    fn bucket_agg(&self, agg: &BucketAgg) -> SearchResult<Value> {
        let node = match &agg.agg_type {
            BucketAggType::DateHistogram => {
                let field = agg
                    .field
                    .clone()
                    .unwrap_or_else(|| self.time_field.clone());
                let interval = agg
                    .setting_str("interval")
                    .filter(|i| i != "auto")
                    .unwrap_or_else(|| INTERVAL_PLACEHOLDER.to_string());
                json!({
                    "date_histogram": {
                        "field": field,
                        "interval": interval,
                        "min_doc_count": 0,
                        "extended_bounds": {
                            "min": TIME_FROM_PLACEHOLDER,
                            "max": TIME_TO_PLACEHOLDER
                        },
                        "format": "epoch_millis"
                    }
                })
            }
            BucketAggType::Terms => {
                let mut terms = Map::new();
                if let Some(field) = &agg.field {
                    terms.insert("field".to_string(), json!(field));
                }
                let size = match agg.setting_u64("size") {
                    // Size zero means "no limit" in the UI; the backend
                    // rejects it, so it becomes a large finite cap.
                    Some(0) => UNLIMITED_TERMS_SIZE,
                    Some(n) => n,
                    None => DEFAULT_TERMS_SIZE,
                };
                terms.insert("size".to_string(), json!(size));
                let order_by = agg
                    .setting_str("orderBy")
                    .unwrap_or_else(|| "_term".to_string());
                let order = agg
                    .setting_str("order")
                    .unwrap_or_else(|| "asc".to_string());
                terms.insert("order".to_string(), json!({ order_by: order }));
                if let Some(min) = agg.setting_u64("min_doc_count") {
                    terms.insert("min_doc_count".to_string(), json!(min));
                }
                json!({ "terms": terms })
            }
            BucketAggType::Filters => {
                let mut filters = Map::new();
                if let Some(Value::Array(entries)) = agg.settings.get("filters") {
                    for entry in entries {
                        let query = entry
                            .get("query")
                            .and_then(Value::as_str)
                            .unwrap_or("*");
                        let label = entry
                            .get("label")
                            .and_then(Value::as_str)
                            .filter(|l| !l.is_empty())
                            .unwrap_or(query);
                        filters.insert(
                            label.to_string(),
                            json!({
                                "query_string": {
                                    "query": query,
                                    "analyze_wildcard": true
                                }
                            }),
                        );
                    }
                }
                json!({ "filters": { "filters": filters } })
            }
            BucketAggType::Histogram => {
                let mut histogram = Map::new();
                if let Some(field) = &agg.field {
                    histogram.insert("field".to_string(), json!(field));
                }
                if let Some(interval) = agg.setting_str("interval") {
                    histogram.insert("interval".to_string(), json!(interval));
                }
                histogram.insert(
                    "min_doc_count".to_string(),
                    json!(agg.setting_u64("min_doc_count").unwrap_or(0)),
                );
                json!({ "histogram": histogram })
            }
            BucketAggType::GeohashGrid => {
                let precision = agg
                    .setting_u64("precision")
                    .unwrap_or(DEFAULT_GEOHASH_PRECISION);
                json!({
                    "geohash_grid": {
                        "field": agg.field,
                        "precision": precision
                    }
                })
            }
            BucketAggType::Other(name) => {
                let mut inner = agg.settings.clone();
                if let Some(field) = &agg.field {
                    inner.entry("field".to_string()).or_insert(json!(field));
                }
                json!({ name.clone(): inner })
            }
        };
        Ok(node)
    }

    fn metric_aggs(&self, target: &Target) -> Map<String, Value> {
        let mut aggs = Map::new();
        for metric in &target.metrics {
            // Count reads doc_count, calc metrics are synthesized from other
            // responses; neither needs an aggregation of its own.
            if matches!(
                metric.metric_type,
                MetricType::Count | MetricType::CalcMetric | MetricType::RawDocument
            ) {
                continue;
            }

            let mut inner = Map::new();
            if metric.metric_type.is_pipeline() {
                if let Some(path) = &metric.field {
                    inner.insert("buckets_path".to_string(), json!(path));
                }
            } else if let Some(field) = &metric.field {
                inner.insert("field".to_string(), json!(field));
            }
            for (key, value) in &metric.settings {
                inner.insert(key.clone(), value.clone());
            }

            aggs.insert(
                metric.id.clone(),
                json!({ metric.metric_type.as_str(): inner }),
            );
        }
        aggs
    }
}

fn size_setting(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn target(value: Value) -> Target {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_body_has_range_and_query_filters() {
        let builder = RequestBodyBuilder::new("@timestamp");
        let t = target(json!({
            "refId": "A",
            "metrics": [{"id": "1", "type": "count"}],
            "bucketAggs": [{"id": "2", "type": "date_histogram"}]
        }));

        let body = builder.build(&t, "status:200").unwrap();
        assert_eq!(body["size"], json!(0));
        let filters = body["query"]["bool"]["filter"].as_array().unwrap();
        assert_eq!(
            filters[0]["range"]["@timestamp"]["gte"],
            json!("$timeFrom")
        );
        assert_eq!(filters[1]["query_string"]["query"], json!("status:200"));
    }

    #[test]
    fn test_bucket_aggs_nest_innermost_last() {
        let builder = RequestBodyBuilder::new("@timestamp");
        let t = target(json!({
            "refId": "A",
            "metrics": [{"id": "1", "type": "avg", "field": "bytes"}],
            "bucketAggs": [
                {"id": "3", "type": "terms", "field": "host"},
                {"id": "2", "type": "date_histogram"}
            ]
        }));

        let body = builder.build(&t, "*").unwrap();
        let terms = &body["aggs"]["3"];
        assert_eq!(terms["terms"]["field"], json!("host"));
        assert_eq!(terms["terms"]["size"], json!(10));
        let histogram = &terms["aggs"]["2"]["date_histogram"];
        assert_eq!(histogram["interval"], json!("$__interval"));
        assert_eq!(histogram["min_doc_count"], json!(0));
        assert_eq!(
            terms["aggs"]["2"]["aggs"]["1"]["avg"]["field"],
            json!("bytes")
        );
    }

    #[test]
    fn test_terms_size_zero_becomes_large_cap() {
        let builder = RequestBodyBuilder::new("@timestamp");
        let t = target(json!({
            "refId": "A",
            "metrics": [{"id": "1", "type": "count"}],
            "bucketAggs": [{
                "id": "2",
                "type": "terms",
                "field": "host",
                "settings": {"size": "0", "orderBy": "_count", "order": "desc"}
            }]
        }));

        let body = builder.build(&t, "*").unwrap();
        assert_eq!(body["aggs"]["2"]["terms"]["size"], json!(500));
        assert_eq!(
            body["aggs"]["2"]["terms"]["order"],
            json!({"_count": "desc"})
        );
    }

    #[test]
    fn test_filters_agg_uses_labels_as_keys() {
        let builder = RequestBodyBuilder::new("@timestamp");
        let t = target(json!({
            "refId": "A",
            "metrics": [{"id": "1", "type": "count"}],
            "bucketAggs": [{
                "id": "2",
                "type": "filters",
                "settings": {"filters": [
                    {"query": "status:500", "label": "errors"},
                    {"query": "status:200"}
                ]}
            }]
        }));

        let body = builder.build(&t, "*").unwrap();
        let filters = &body["aggs"]["2"]["filters"]["filters"];
        assert_eq!(
            filters["errors"]["query_string"]["query"],
            json!("status:500")
        );
        assert!(filters.get("status:200").is_some());
    }

    #[test]
    fn test_raw_document_skips_aggregations() {
        let builder = RequestBodyBuilder::new("@timestamp");
        let t = target(json!({
            "refId": "A",
            "metrics": [{"id": "1", "type": "raw_document", "settings": {"size": "100"}}]
        }));

        let body = builder.build(&t, "*").unwrap();
        assert_eq!(body["size"], json!(100));
        assert!(body.get("aggs").is_none());
    }

    #[test]
    fn test_pipeline_metric_uses_buckets_path() {
        let builder = RequestBodyBuilder::new("@timestamp");
        let t = target(json!({
            "refId": "A",
            "metrics": [
                {"id": "1", "type": "sum", "field": "bytes"},
                {"id": "4", "type": "moving_avg", "field": "1", "settings": {"window": 5}}
            ],
            "bucketAggs": [{"id": "2", "type": "date_histogram"}]
        }));

        let body = builder.build(&t, "*").unwrap();
        let pipeline = &body["aggs"]["2"]["aggs"]["4"]["moving_avg"];
        assert_eq!(pipeline["buckets_path"], json!("1"));
        assert_eq!(pipeline["window"], json!(5));
    }

    #[test]
    fn test_raw_query_override() {
        let builder = RequestBodyBuilder::new("@timestamp");
        let t = target(json!({
            "refId": "A",
            "editQueryMode": true,
            "rawQuery": "{\"size\": 0,\n \"query\": {\"match_all\": {}}}"
        }));

        let body = builder.build(&t, "*").unwrap();
        assert_eq!(body["query"]["match_all"], json!({}));
    }

    #[test]
    fn test_invalid_raw_query_is_an_error() {
        let builder = RequestBodyBuilder::new("@timestamp");
        let t = target(json!({
            "refId": "A",
            "editQueryMode": true,
            "rawQuery": "{not json"
        }));

        assert!(builder.build(&t, "*").is_err());
    }
}
