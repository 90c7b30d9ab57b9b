//! Pipeline files: model, parsing and semantic validation.

pub mod parser;
pub mod types;
pub mod validator;

pub use parser::{parse_documents, parse_pipeline, parse_pipeline_str, substitute_env_vars};
pub use types::{ConnectorConfig, PipelineConfig};
pub use validator::validate_pipeline;
