use std::path::Path;

use anyhow::{Context, Result};
use fluxion_engine::config::parser;
use fluxion_engine::PipelineExecutor;
use fluxion_types::document::Document;

/// Execute the `eval` command: run the pipeline's stages over `--input`
/// documents in memory and print the output as a JSON array. The pipeline's
/// source and sink are ignored.
pub async fn execute(pipeline_path: &Path, input: &str) -> Result<()> {
    let config = parser::parse_pipeline(pipeline_path)
        .with_context(|| format!("Failed to parse pipeline: {}", pipeline_path.display()))?;
    let documents = parser::parse_documents(input)?;

    tracing::debug!(
        pipeline = config.pipeline,
        stages = config.stages.len(),
        documents = documents.len(),
        "Evaluating pipeline"
    );

    let output = PipelineExecutor::new()
        .run(documents, &config.stages, Document::new())
        .await?;

    let json: Vec<serde_json::Value> = output.iter().map(Document::to_json).collect();
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
