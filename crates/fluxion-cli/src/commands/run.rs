use std::path::Path;

use anyhow::{Context, Result};
use fluxion_engine::config::parser;
use fluxion_engine::{run_pipeline, ConnectorRegistry, PipelineEnv, RunSummary, StreamingContext};

/// Execute the `run` command: parse, validate, and stream a pipeline until
/// its source is exhausted or Ctrl-C cancels it.
pub async fn execute(pipeline_path: &Path) -> Result<()> {
    let config = parser::parse_pipeline(pipeline_path)
        .with_context(|| format!("Failed to parse pipeline: {}", pipeline_path.display()))?;

    let ctx = StreamingContext::new(config.pipeline.clone());
    let ctrl_c = {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupt received, draining");
                ctx.cancel();
            }
        })
    };

    let result = run_pipeline(
        &config,
        &ConnectorRegistry::with_builtins(),
        &PipelineEnv::default(),
        &ctx,
    )
    .await;
    ctrl_c.abort();

    match result {
        Ok(summary) => {
            let verb = if summary.cancelled { "stopped" } else { "completed" };
            eprintln!("Pipeline '{}' {verb}.", config.pipeline);
            print_summary(&summary);
            Ok(())
        }
        Err(err) => {
            eprintln!("Pipeline '{}' aborted.", config.pipeline);
            print_summary(&err.summary);
            Err(anyhow::Error::from(err.error))
                .with_context(|| format!("Pipeline '{}' failed", config.pipeline))
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn print_summary(summary: &RunSummary) {
    eprintln!("  State:               {}", summary.state);
    eprintln!("  Documents read:      {}", summary.documents_read);
    eprintln!("  Documents written:   {}", summary.documents_written);
    if summary.documents_dropped > 0 {
        eprintln!(
            "  Documents dropped:   {} ({} batches)",
            summary.documents_dropped, summary.batches_dropped
        );
    }
    if summary.documents_discarded > 0 {
        eprintln!("  Documents discarded: {}", summary.documents_discarded);
    }
    eprintln!("  Duration:            {:.2}s", summary.duration_secs());
    if summary.duration_secs() > 0.0 {
        eprintln!(
            "  Throughput:          {:.0} docs/sec",
            summary.documents_read as f64 / summary.duration_secs()
        );
    }
    for (stage, metrics) in &summary.metrics.stages {
        eprintln!(
            "    {stage:20} in={:<8} out={:<8} errors={:<4} {:.3}s",
            metrics.documents_in,
            metrics.documents_out,
            metrics.errors,
            metrics.elapsed_micros as f64 / 1e6,
        );
    }
}
