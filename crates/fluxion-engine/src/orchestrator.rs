//! Pipeline orchestrator: validates a pipeline file, opens its connectors,
//! and drives the streaming executor.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use fluxion_types::error::ConfigurationError;

use crate::config::types::PipelineConfig;
use crate::config::validator::validate_pipeline;
use crate::connectors::ConnectorRegistry;
use crate::errors::PipelineError;
use crate::evaluator::{Pipeline, PipelineEnv};
use crate::result::{RunError, RunSummary};
use crate::streaming::{RunState, StreamingContext, StreamingExecutor, StreamingSink, StreamingSource};

/// Outcome of [`check_pipeline`].
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub pipeline: String,
    pub stage_ids: Vec<String>,
    pub has_enrichment: bool,
    /// Set when the source could not be opened.
    pub source_error: Option<String>,
}

impl CheckResult {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.source_error.is_none()
    }
}

struct PreparedRun {
    executor: StreamingExecutor,
    source: Arc<dyn StreamingSource>,
    sink: Arc<dyn StreamingSink>,
}

fn prepare(
    config: &PipelineConfig,
    connectors: &ConnectorRegistry,
    env: &PipelineEnv,
) -> Result<PreparedRun, PipelineError> {
    validate_pipeline(config, connectors, env)
        .map_err(|e| ConfigurationError::new("INVALID_PIPELINE", format!("{e:#}")))?;
    let pipeline = Pipeline::compile(&config.stages, env)?;
    let executor = StreamingExecutor::new(
        pipeline,
        config.runtime.clone(),
        config.error_policy.clone(),
    )?;
    let source = connectors
        .create_source(&config.source.use_ref, &config.source.config)
        .with_context(|| format!("Failed to open source '{}'", config.source.use_ref))?;
    let sink = connectors
        .create_sink(&config.sink.use_ref, &config.sink.config)
        .with_context(|| format!("Failed to open sink '{}'", config.sink.use_ref))?;
    Ok(PreparedRun {
        executor,
        source,
        sink,
    })
}

fn not_started(ctx: &StreamingContext, started: Instant, error: PipelineError) -> RunError {
    tracing::error!(stream_id = ctx.stream_id(), error = %error, "Pipeline setup failed");
    ctx.advance_state(RunState::Aborted);
    RunError {
        error,
        summary: RunSummary {
            state: ctx.run_state(),
            documents_read: 0,
            documents_written: 0,
            documents_dropped: 0,
            documents_discarded: 0,
            batches_dropped: 0,
            cancelled: ctx.is_cancelled(),
            elapsed: started.elapsed(),
            metrics: ctx.metrics().snapshot(),
        },
    }
}

/// Run a pipeline file end to end: validate, open the source and sink,
/// then stream until the source is exhausted or `ctx` is cancelled.
///
/// # Errors
///
/// Returns a [`RunError`] if validation or connector setup fails (state
/// `Aborted`, nothing processed), or if the run aborts.
pub async fn run_pipeline(
    config: &PipelineConfig,
    connectors: &ConnectorRegistry,
    env: &PipelineEnv,
    ctx: &StreamingContext,
) -> Result<RunSummary, RunError> {
    let started = Instant::now();
    tracing::info!(
        pipeline = config.pipeline,
        source = config.source.use_ref,
        sink = config.sink.use_ref,
        stages = config.stages.len(),
        "Starting pipeline"
    );

    let prepared = prepare(config, connectors, env).map_err(|e| not_started(ctx, started, e))?;
    prepared
        .executor
        .process_stream(prepared.source, prepared.sink, ctx)
        .await
}

/// Validate a pipeline file and probe its source without running it.
///
/// The sink is not opened: file sinks truncate on open.
///
/// # Errors
///
/// Returns an error listing every validation failure.
pub fn check_pipeline(
    config: &PipelineConfig,
    connectors: &ConnectorRegistry,
    env: &PipelineEnv,
) -> Result<CheckResult> {
    tracing::info!(pipeline = config.pipeline, "Checking pipeline configuration");

    validate_pipeline(config, connectors, env)?;
    let pipeline = Pipeline::compile(&config.stages, env)?;

    let source_error = connectors
        .create_source(&config.source.use_ref, &config.source.config)
        .err()
        .map(|e| format!("{e:#}"));

    Ok(CheckResult {
        pipeline: config.pipeline.clone(),
        stage_ids: pipeline.stage_ids().into_iter().map(str::to_string).collect(),
        has_enrichment: pipeline.has_enrichment(),
        source_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parser::parse_pipeline_str;

    fn pipeline_yaml(input: &str, output: &str) -> String {
        format!(
            r#"
version: "1.0"
pipeline: paid_orders
source:
  use: jsonl
  config:
    path: "{input}"
    batch_size: 2
sink:
  use: jsonl
  config:
    path: "{output}"
runtime:
  micro_batch_size: 2
stages:
  - $match: {{ status: PAID }}
  - $project: {{ id: 1, _id: 0 }}
"#
        )
    }

    #[tokio::test]
    async fn test_runs_file_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("orders.jsonl");
        let output = dir.path().join("paid.jsonl");
        std::fs::write(
            &input,
            "{\"id\": 1, \"status\": \"PAID\"}\n{\"id\": 2, \"status\": \"NEW\"}\n{\"id\": 3, \"status\": \"PAID\"}\n",
        )
        .unwrap();

        let config = parse_pipeline_str(&pipeline_yaml(
            &input.display().to_string(),
            &output.display().to_string(),
        ))
        .unwrap();
        let ctx = StreamingContext::new(config.pipeline.clone());
        let summary = run_pipeline(
            &config,
            &ConnectorRegistry::with_builtins(),
            &PipelineEnv::default(),
            &ctx,
        )
        .await
        .unwrap();

        assert_eq!(summary.state, RunState::Stopped);
        assert_eq!(summary.documents_read, 3);
        assert_eq!(summary.documents_written, 2);
        assert_eq!(
            std::fs::read_to_string(&output).unwrap(),
            "{\"id\":1}\n{\"id\":3}\n"
        );
    }

    #[tokio::test]
    async fn test_missing_source_file_aborts_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let config = parse_pipeline_str(&pipeline_yaml(
            &dir.path().join("missing.jsonl").display().to_string(),
            &dir.path().join("out.jsonl").display().to_string(),
        ))
        .unwrap();
        let ctx = StreamingContext::new("missing");
        let err = run_pipeline(
            &config,
            &ConnectorRegistry::with_builtins(),
            &PipelineEnv::default(),
            &ctx,
        )
        .await
        .unwrap_err();
        assert!(matches!(err.error, PipelineError::Infrastructure(_)));
        assert!(err.error.to_string().contains("Failed to open source 'jsonl'"));
        assert_eq!(err.summary.state, RunState::Aborted);
        assert_eq!(err.summary.documents_read, 0);
    }

    #[tokio::test]
    async fn test_invalid_pipeline_is_a_configuration_error() {
        let yaml = pipeline_yaml("in.jsonl", "out.jsonl").replace(
            "use: jsonl\n  config:\n    path: \"out",
            "use: kafka\n  config:\n    path: \"out",
        );
        let config = parse_pipeline_str(&yaml).unwrap();
        let err = run_pipeline(
            &config,
            &ConnectorRegistry::with_builtins(),
            &PipelineEnv::default(),
            &StreamingContext::new("invalid"),
        )
        .await
        .unwrap_err();
        let PipelineError::Configuration(config_err) = err.error else {
            panic!("expected a configuration error, got {:?}", err.error);
        };
        assert_eq!(config_err.code, "INVALID_PIPELINE");
        assert!(config_err.message.contains("Unknown sink connector 'kafka'"));
    }

    #[test]
    fn test_check_reports_stages_and_source_probe() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("orders.jsonl");
        std::fs::write(&input, "").unwrap();
        let yaml = pipeline_yaml(&input.display().to_string(), "unused.jsonl");
        let result = check_pipeline(
            &parse_pipeline_str(&yaml).unwrap(),
            &ConnectorRegistry::with_builtins(),
            &PipelineEnv::default(),
        )
        .unwrap();
        assert!(result.is_ok());
        assert_eq!(result.stage_ids, vec!["0:match", "1:project"]);
        assert!(!result.has_enrichment);

        let yaml = pipeline_yaml("/nonexistent/orders.jsonl", "unused.jsonl");
        let result = check_pipeline(
            &parse_pipeline_str(&yaml).unwrap(),
            &ConnectorRegistry::with_builtins(),
            &PipelineEnv::default(),
        )
        .unwrap();
        assert!(!result.is_ok());
    }
}
