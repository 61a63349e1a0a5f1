//! Typed view over the multi-search response
//!
//! The search backend gives no schema guarantees about the shape of the
//! aggregation tree, so the envelope is deserialized into typed records and
//! the recursive part is classified into a tagged variant: a node is
//! [`AggregationNode::Bucketed`] exactly when it carries a `buckets` field,
//! otherwise it is a metric-result leaf.

use serde::Deserialize;
use serde_json::{Map, Value};

/// The full multi-search reply, index-aligned with the submitted batch.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchedResponse {
    pub responses: Vec<SearchResponse>,
    /// Request context attached by the transport for diagnostics.
    #[serde(default, rename = "$$config")]
    pub config: Option<Value>,
}

/// One per-target search result
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub error: Option<Value>,

    #[serde(default)]
    pub hits: Option<Hits>,

    /// Nested aggregation tree, kept dynamic; walked via [`AggregationNode`].
    #[serde(default)]
    pub aggregations: Option<Value>,
}

/// Raw document hits for non-aggregated queries
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Hits {
    #[serde(default)]
    pub total: Option<u64>,

    #[serde(default)]
    pub hits: Vec<Hit>,
}

/// One returned document
#[derive(Debug, Clone, Deserialize)]
pub struct Hit {
    #[serde(default, rename = "_id")]
    pub id: Option<Value>,

    #[serde(default, rename = "_type")]
    pub doc_type: Option<Value>,

    #[serde(default, rename = "_index")]
    pub index: Option<Value>,

    #[serde(default, rename = "_source")]
    pub source: Option<Map<String, Value>>,

    #[serde(default)]
    pub fields: Option<Map<String, Value>>,
}

/// Tagged view of one aggregation result node
#[derive(Debug)]
pub enum AggregationNode<'a> {
    /// Metric result: `{"value": ...}`, percentile values, stats, ...
    Leaf(&'a Value),
    /// Grouping result carrying child buckets
    Bucketed(Buckets<'a>),
}

impl<'a> AggregationNode<'a> {
    /// Classify a raw node by the presence of a `buckets` field.
    pub fn classify(value: &'a Value) -> AggregationNode<'a> {
        match Buckets::from_value(value) {
            Some(buckets) => AggregationNode::Bucketed(buckets),
            None => AggregationNode::Leaf(value),
        }
    }
}

/// Child buckets of a grouping aggregation: either an ordered list or, for
/// filters-style aggregations, an object keyed by filter name.
#[derive(Debug)]
pub enum Buckets<'a> {
    List(Vec<Bucket<'a>>),
    Keyed(Vec<(&'a str, Bucket<'a>)>),
}

impl<'a> Buckets<'a> {
    /// View the `buckets` field of an aggregation node, if it has one.
    pub fn from_value(node: &'a Value) -> Option<Buckets<'a>> {
        match node.get("buckets")? {
            Value::Array(items) => Some(Buckets::List(
                items.iter().filter_map(Bucket::from_value).collect(),
            )),
            Value::Object(map) => Some(Buckets::Keyed(
                map.iter()
                    .filter_map(|(name, v)| Bucket::from_value(v).map(|b| (name.as_str(), b)))
                    .collect(),
            )),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Buckets::List(items) => items.len(),
            Buckets::Keyed(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All buckets in document order, paired with the keyed name when the
    /// bucket came from a keyed (filters) aggregation.
    pub fn entries(&self) -> Vec<(Option<&'a str>, Bucket<'a>)> {
        match self {
            Buckets::List(items) => items.iter().map(|b| (None, *b)).collect(),
            Buckets::Keyed(items) => items.iter().map(|(name, b)| (Some(*name), *b)).collect(),
        }
    }

    /// All buckets in document order, without keyed names.
    pub fn list(&self) -> Vec<Bucket<'a>> {
        self.entries().into_iter().map(|(_, b)| b).collect()
    }

    pub fn first(&self) -> Option<Bucket<'a>> {
        self.list().into_iter().next()
    }
}

/// Borrowed view of one bucket object
#[derive(Debug, Clone, Copy)]
pub struct Bucket<'a> {
    raw: &'a Map<String, Value>,
}

impl<'a> Bucket<'a> {
    pub fn from_value(value: &'a Value) -> Option<Bucket<'a>> {
        value.as_object().map(|raw| Bucket { raw })
    }

    pub fn key(&self) -> Option<&'a Value> {
        self.raw.get("key")
    }

    /// The bucket key as epoch milliseconds, for date-based buckets.
    pub fn key_millis(&self) -> Option<i64> {
        let key = self.key()?;
        key.as_i64().or_else(|| key.as_f64().map(|f| f as i64))
    }

    pub fn key_as_string(&self) -> Option<&'a str> {
        self.raw.get("key_as_string").and_then(Value::as_str)
    }

    pub fn doc_count(&self) -> Option<f64> {
        self.raw.get("doc_count").and_then(Value::as_f64)
    }

    /// A child entry by aggregation/metric id.
    pub fn entry(&self, id: &str) -> Option<&'a Value> {
        self.raw.get(id)
    }

    /// Child entries that are aggregation results rather than bucket
    /// bookkeeping fields.
    pub fn sub_entries(&self) -> impl Iterator<Item = (&'a String, &'a Value)> {
        self.raw.iter().filter(|(name, _)| {
            !matches!(
                name.as_str(),
                "key" | "key_as_string" | "doc_count" | "from" | "to"
            )
        })
    }

    pub fn as_map(&self) -> &'a Map<String, Value> {
        self.raw
    }
}
