//! # Metricsearch Core Library
//!
//! Shared data model for the metricsearch query engine: declarative query
//! targets, the typed view over multi-search responses, output series types,
//! time handling and error types.
//!
//! The actual query compilation and response transformation live in the
//! `metricsearch-query` crate; this library only defines the vocabulary both
//! sides of that pipeline speak.

pub mod error;
pub mod response;
pub mod series;
pub mod target;
pub mod time;

// Re-export commonly used types
pub use error::{SearchError, SearchResult};
pub use response::{AggregationNode, BatchedResponse, Bucket, Buckets, Hit, Hits, SearchResponse};
pub use series::{DataPoint, DocSeries, Document, QueryData, SeriesResult, TimeSeries};
pub use target::{BucketAgg, BucketAggType, Metric, MetricType, Target};
pub use time::TimeRange;

/// Version information for metricsearch
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
