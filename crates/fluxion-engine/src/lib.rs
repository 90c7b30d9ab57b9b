//! Pipeline evaluation and streaming execution for Fluxion.
//!
//! | Module         | Responsibility |
//! |----------------|----------------|
//! | `evaluator`    | Compiles stage lists and applies them to batches |
//! | `expression`   | `$field` references and expression operators |
//! | `predicate`    | `$match` filter language |
//! | `operators`    | Built-in stage operators |
//! | `registry`     | Custom stage operator registration |
//! | `enrich`       | `httpCall` enrichment and circuit breakers |
//! | `streaming`    | Sources, sinks, bridges, workers and the executor |
//! | `connectors`   | File and stdout connectors for pipeline files |
//! | `config`       | Pipeline file parsing and validation |
//! | `orchestrator` | Runs and checks pipeline files |

pub mod config;
pub mod connectors;
pub mod enrich;
pub mod errors;
pub mod evaluator;
pub mod expression;
pub mod operators;
pub mod orchestrator;
pub mod predicate;
pub mod registry;
pub mod result;
pub mod streaming;

// Re-export public API for convenience
pub use config::{parse_pipeline, parse_pipeline_str, validate_pipeline, PipelineConfig};
pub use connectors::ConnectorRegistry;
pub use errors::PipelineError;
pub use evaluator::{Pipeline, PipelineEnv, PipelineExecutor};
pub use orchestrator::{check_pipeline, run_pipeline, CheckResult};
pub use registry::{OperatorRegistry, StageOperator};
pub use result::{RunError, RunSummary};
pub use streaming::{
    RunState, StreamingContext, StreamingExecutor, StreamingSink, StreamingSource,
};
