//! # Metricsearch Query Engine
//!
//! Compiles declarative metric targets into batched multi-search requests
//! and transforms the nested aggregation responses back into flat, named
//! time series and document tables.
//!
//! The pipeline has three stages:
//! 1. [`compile::QueryCompiler`] turns targets into newline-delimited
//!    header/body pairs, resolving index patterns, time ranges, comparison
//!    shifts and month-to-date companions.
//! 2. A host-provided [`datasource::SearchTransport`] posts the payload.
//! 3. [`transform::ResponseTransformer`] walks the aggregation trees and
//!    emits series, synthesizing calculated metrics along the way.

pub mod builder;
pub mod compile;
pub mod config;
pub mod datasource;
pub mod formula;
pub mod index_pattern;
pub mod transform;

pub use builder::RequestBodyBuilder;
pub use compile::{
    BatchedRequestItem, CalcMetricQuery, CompilationResult, CompiledTarget, QueryCompiler,
    QueryOptions, ScopedVars, TemplateFormat, TemplateRenderer,
};
pub use config::DatasourceSettings;
pub use datasource::{
    MetricDatasource, QueryRequest, SearchTransport, TimeRangeProvider, MULTI_SEARCH_PATH,
};
pub use formula::{parse_formula, Expr};
pub use index_pattern::{IndexPattern, PatternInterval};
pub use transform::ResponseTransformer;
