//! Datasource configuration

use serde::{Deserialize, Serialize};

use crate::index_pattern::PatternInterval;

/// Configuration for one metric datasource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasourceSettings {
    /// Index name or index date pattern, e.g. `metrics` or
    /// `[metrics-]YYYY.MM.DD`
    pub index: String,

    /// Rotation interval of the index pattern
    pub pattern_interval: PatternInterval,

    /// Document field holding the event timestamp
    pub time_field: String,

    /// Major version of the search backend; affects the header search type
    pub backend_version: u32,
}

impl Default for DatasourceSettings {
    fn default() -> Self {
        Self {
            index: "metrics".to_string(),
            pattern_interval: PatternInterval::None,
            time_field: "@timestamp".to_string(),
            backend_version: 5,
        }
    }
}
