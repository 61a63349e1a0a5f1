//! Datasource facade
//!
//! Ties the pipeline together: compile targets, serialize the batch, post it
//! through the transport and transform the reply. The transport, template
//! interpolation and default time range are host concerns and come in as
//! trait implementations.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument};

use metricsearch_core::error::SearchResult;
use metricsearch_core::response::BatchedResponse;
use metricsearch_core::series::QueryData;
use metricsearch_core::target::Target;
use metricsearch_core::time::TimeRange;

use crate::compile::{QueryCompiler, QueryOptions, ScopedVars, TemplateRenderer};
use crate::config::DatasourceSettings;
use crate::transform::ResponseTransformer;

/// Wire path of the batched search endpoint
pub const MULTI_SEARCH_PATH: &str = "_msearch";

/// Host-provided HTTP transport to the search backend.
#[async_trait]
pub trait SearchTransport: Send + Sync {
    /// Post a newline-delimited payload and decode the batched reply.
    async fn post(&self, path: &str, body: String) -> SearchResult<BatchedResponse>;
}

/// Host-provided default time range, used when a request carries none.
pub trait TimeRangeProvider: Send + Sync {
    fn time_range(&self) -> TimeRange;
}

/// One metric query request against the datasource
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub targets: Vec<Target>,
    /// Resolved bucket interval, e.g. "30s"
    pub interval: String,
    pub scoped_vars: ScopedVars,
    /// Explicit range; falls back to the datasource's range provider
    pub range: Option<TimeRange>,
}

impl QueryRequest {
    pub fn new(targets: Vec<Target>, interval: impl Into<String>) -> Self {
        Self {
            targets,
            interval: interval.into(),
            scoped_vars: ScopedVars::new(),
            range: None,
        }
    }

    pub fn with_range(mut self, range: TimeRange) -> Self {
        self.range = Some(range);
        self
    }
}

/// A configured metric datasource
pub struct MetricDatasource<T, R, P> {
    transport: T,
    templating: R,
    time_provider: P,
    compiler: QueryCompiler,
}

impl<T, R, P> MetricDatasource<T, R, P>
where
    T: SearchTransport,
    R: TemplateRenderer,
    P: TimeRangeProvider,
{
    pub fn new(settings: &DatasourceSettings, transport: T, templating: R, time_provider: P) -> Self {
        Self {
            transport,
            templating,
            time_provider,
            compiler: QueryCompiler::new(settings),
        }
    }

    /// Run one query end to end. When every target is hidden or calculated
    /// away to nothing, the transport is not called at all.
    #[instrument(skip(self, request), fields(targets = request.targets.len()))]
    pub async fn query(&self, request: QueryRequest) -> SearchResult<QueryData> {
        let options = QueryOptions {
            range: request
                .range
                .unwrap_or_else(|| self.time_provider.time_range()),
            interval: request.interval,
            scoped_vars: request.scoped_vars,
        };

        let compilation = self
            .compiler
            .compile(&request.targets, &options, &self.templating)?;
        if compilation.is_empty() {
            debug!("no visible targets, skipping upstream call");
            return Ok(QueryData::default());
        }

        let payload = self
            .compiler
            .payload(&compilation, &options, &self.templating)?;
        let response = self.transport.post(MULTI_SEARCH_PATH, payload).await?;

        ResponseTransformer::new(&compilation).transform(response)
    }
}

/// Sanity probe for the datasource configuration: one minimal match-all
/// request, reporting reachability rather than data.
pub async fn test_datasource<T: SearchTransport>(transport: &T) -> SearchResult<Value> {
    let header = serde_json::json!({"index": [], "ignore_unavailable": true});
    let body = serde_json::json!({"size": 0, "query": {"match_all": {}}});
    let payload = format!(
        "{}\n{}\n",
        serde_json::to_string(&header)?,
        serde_json::to_string(&body)?
    );
    transport.post(MULTI_SEARCH_PATH, payload).await?;
    debug!("datasource probe succeeded");
    Ok(serde_json::json!({"status": "success"}))
}
