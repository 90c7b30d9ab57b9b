//! Semantic validation for parsed pipeline files.

use anyhow::{bail, Result};

use crate::config::types::{ConnectorConfig, PipelineConfig, SUPPORTED_VERSION};
use crate::connectors::{ConnectorDescriptor, ConnectorRegistry};
use crate::evaluator::{Pipeline, PipelineEnv};

fn validate_connector(
    connector: &ConnectorConfig,
    descriptor: Option<&ConnectorDescriptor>,
    context: &str,
    errors: &mut Vec<String>,
) {
    if connector.use_ref.trim().is_empty() {
        errors.push(format!("{context} connector reference (use) must not be empty"));
        return;
    }
    match descriptor {
        Some(descriptor) => errors.extend(descriptor.validate(&connector.config)),
        None => errors.push(format!(
            "Unknown {context} connector '{}'",
            connector.use_ref
        )),
    }
}

/// Validate a parsed pipeline file against the registered connectors and
/// operators. Stages are compiled, so expression and operator errors
/// surface here rather than at run time.
///
/// # Errors
///
/// Returns an error listing every validation failure found.
pub fn validate_pipeline(
    config: &PipelineConfig,
    connectors: &ConnectorRegistry,
    env: &PipelineEnv,
) -> Result<()> {
    let mut errors = Vec::new();

    if config.version != SUPPORTED_VERSION {
        errors.push(format!(
            "Unsupported pipeline version '{}', expected '{SUPPORTED_VERSION}'",
            config.version
        ));
    }

    if config.pipeline.trim().is_empty() {
        errors.push("Pipeline name must not be empty".to_string());
    }

    validate_connector(
        &config.source,
        connectors
            .source(&config.source.use_ref)
            .map(|factory| factory.descriptor()),
        "source",
        &mut errors,
    );
    validate_connector(
        &config.sink,
        connectors
            .sink(&config.sink.use_ref)
            .map(|factory| factory.descriptor()),
        "sink",
        &mut errors,
    );

    if let Err(e) = config.runtime.validate() {
        errors.push(e.to_string());
    }
    if let Err(e) = config.error_policy.validate() {
        errors.push(e.to_string());
    }

    if let Err(e) = Pipeline::compile(&config.stages, env) {
        errors.push(e.to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        bail!("Pipeline validation failed:\n  - {}", errors.join("\n  - "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parser::parse_pipeline_str;

    fn valid_yaml() -> &'static str {
        r#"
version: "1.0"
pipeline: paid_orders
source:
  use: jsonl
  config:
    path: orders.jsonl
sink:
  use: stdout
  config:
    pretty: false
stages:
  - $set: { revenue: { $multiply: [$price, $qty] } }
  - $match: { status: PAID }
"#
    }

    fn validate(yaml: &str) -> Result<()> {
        let config = parse_pipeline_str(yaml).unwrap();
        validate_pipeline(
            &config,
            &ConnectorRegistry::with_builtins(),
            &PipelineEnv::default(),
        )
    }

    #[test]
    fn test_valid_pipeline_passes() {
        validate(valid_yaml()).unwrap();
    }

    #[test]
    fn test_wrong_version_fails() {
        let err = validate(&valid_yaml().replace("\"1.0\"", "\"2.0\""))
            .unwrap_err()
            .to_string();
        assert!(err.contains("Unsupported pipeline version '2.0'"));
    }

    #[test]
    fn test_empty_pipeline_name_fails() {
        let err = validate(&valid_yaml().replace("paid_orders", "\"\""))
            .unwrap_err()
            .to_string();
        assert!(err.contains("Pipeline name must not be empty"));
    }

    #[test]
    fn test_unknown_connector_fails() {
        let err = validate(&valid_yaml().replace("use: stdout", "use: kafka"))
            .unwrap_err()
            .to_string();
        assert!(err.contains("Unknown sink connector 'kafka'"));
    }

    #[test]
    fn test_connector_options_are_checked() {
        let err = validate(&valid_yaml().replace("path: orders.jsonl", "file: orders.jsonl"))
            .unwrap_err()
            .to_string();
        assert!(err.contains("missing required option 'path'"));
        assert!(err.contains("unknown option 'file'"));
    }

    #[test]
    fn test_invalid_stage_fails() {
        let err = validate(&valid_yaml().replace("$multiply", "$frobnicate"))
            .unwrap_err()
            .to_string();
        assert!(err.contains("frobnicate"), "{err}");
    }

    #[test]
    fn test_all_errors_reported_together() {
        let yaml = valid_yaml()
            .replace("\"1.0\"", "\"0.9\"")
            .replace("use: jsonl", "use: \"\"")
            .replace("  - $match: { status: PAID }", "  - $sort: {}\nruntime:\n  micro_batch_size: 0");
        let err = validate(&yaml).unwrap_err().to_string();
        assert!(err.starts_with("Pipeline validation failed:"));
        assert!(err.contains("Unsupported pipeline version"));
        assert!(err.contains("source connector reference (use) must not be empty"));
        assert!(err.contains("micro_batch_size"));
        assert!(err.contains("sort"));
    }
}
