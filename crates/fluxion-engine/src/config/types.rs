//! Pipeline file model.

use fluxion_types::config::{StreamingErrorPolicy, StreamingRuntimeConfig};
use fluxion_types::document::Document;
use fluxion_types::stage::Stage;
use serde::{Deserialize, Serialize};

pub const SUPPORTED_VERSION: &str = "1.0";

/// Top-level pipeline file.
///
/// ```yaml
/// version: "1.0"
/// pipeline: paid_orders
/// source:
///   use: jsonl
///   config: { path: orders.jsonl }
/// sink:
///   use: stdout
/// runtime:
///   micro_batch_size: 128
/// error_policy:
///   max_retries: 3
///   fail_fast: false
/// stages:
///   - $match: { status: PAID }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub version: String,
    pub pipeline: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub source: ConnectorConfig,
    pub sink: ConnectorConfig,
    #[serde(default)]
    pub runtime: StreamingRuntimeConfig,
    #[serde(default, alias = "errorPolicy")]
    pub error_policy: StreamingErrorPolicy,
    #[serde(default)]
    pub stages: Vec<Stage>,
}

/// Connector reference plus its options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectorConfig {
    #[serde(rename = "use")]
    pub use_ref: String,
    #[serde(default)]
    pub config: Document,
}
