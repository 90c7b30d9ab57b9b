use std::path::Path;

use anyhow::{Context, Result};
use fluxion_engine::config::parser;
use fluxion_engine::{check_pipeline, ConnectorRegistry, PipelineEnv};

/// Execute the `check` command: validate the pipeline and probe its source.
pub fn execute(pipeline_path: &Path) -> Result<()> {
    let config = parser::parse_pipeline(pipeline_path)
        .with_context(|| format!("Failed to parse pipeline: {}", pipeline_path.display()))?;

    let result = check_pipeline(
        &config,
        &ConnectorRegistry::with_builtins(),
        &PipelineEnv::default(),
    )?;
    println!("Pipeline structure: OK");
    println!("Stages:             {}", result.stage_ids.len());
    for id in &result.stage_ids {
        println!("  {id}");
    }
    if result.has_enrichment {
        println!("Enrichment:         yes");
    }

    match &result.source_error {
        None => println!("Source:             OK"),
        Some(err) => println!("Source:             FAILED\n  {err}"),
    }

    if result.is_ok() {
        println!("\nAll checks passed.");
        Ok(())
    } else {
        anyhow::bail!("One or more checks failed")
    }
}
