//! Transformed output model: flat, named series and document tables

use serde::de::{Deserializer, Error as DeError};
use serde::ser::{SerializeTuple, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One time-series point, serialized as a `[value, timestamp]` pair.
///
/// The value may be absent when the backend reported `null` for a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataPoint {
    pub value: Option<f64>,
    /// Epoch milliseconds
    pub timestamp: i64,
}

impl DataPoint {
    pub fn new(value: Option<f64>, timestamp: i64) -> Self {
        Self { value, timestamp }
    }
}

impl Serialize for DataPoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(&self.value)?;
        tuple.serialize_element(&self.timestamp)?;
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for DataPoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pair = <(Option<f64>, Value)>::deserialize(deserializer)?;
        let timestamp = pair
            .1
            .as_i64()
            .ok_or_else(|| D::Error::custom("datapoint timestamp must be an integer"))?;
        Ok(Self::new(pair.0, timestamp))
    }
}

/// One named time series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    /// Display name
    pub target: String,
    pub datapoints: Vec<DataPoint>,
}

/// One flat document row
pub type Document = Map<String, Value>;

/// Document-style result: one row per document, no time axis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocSeries {
    pub target: String,
    #[serde(rename = "type")]
    pub series_type: String,
    pub datapoints: Vec<Document>,
    /// Total hit count reported by the backend, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

impl DocSeries {
    pub fn new(datapoints: Vec<Document>) -> Self {
        Self {
            target: "docs".to_string(),
            series_type: "docs".to_string(),
            datapoints,
            total: None,
        }
    }

    pub fn with_total(mut self, total: Option<u64>) -> Self {
        self.total = total;
        self
    }
}

/// One transformed result entry: either a time series or a document table
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SeriesResult {
    Time(TimeSeries),
    Docs(DocSeries),
}

impl SeriesResult {
    pub fn as_time(&self) -> Option<&TimeSeries> {
        match self {
            SeriesResult::Time(series) => Some(series),
            SeriesResult::Docs(_) => None,
        }
    }

    pub fn as_docs(&self) -> Option<&DocSeries> {
        match self {
            SeriesResult::Docs(series) => Some(series),
            SeriesResult::Time(_) => None,
        }
    }
}

/// Final output handed back to the caller
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryData {
    pub data: Vec<SeriesResult>,
}
