//! Pipeline file parsing with environment variable substitution.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use fluxion_types::document::Document;
use regex::Regex;

use crate::config::types::PipelineConfig;

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// Substitute `${VAR_NAME}` patterns with environment variable values.
///
/// Field references such as `$user.id` are left alone; only the braced
/// form is substituted.
///
/// # Errors
///
/// Returns an error naming every referenced variable that is not set.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let mut missing = Vec::new();
    let result = ENV_VAR_RE.replace_all(input, |cap: &regex::Captures<'_>| {
        std::env::var(&cap[1]).unwrap_or_else(|_| {
            missing.push(cap[1].to_string());
            String::new()
        })
    });

    if !missing.is_empty() {
        anyhow::bail!("Missing environment variable(s): {}", missing.join(", "));
    }

    Ok(result.into_owned())
}

/// Parse a pipeline file body (YAML, and therefore JSON) after env var
/// substitution.
///
/// # Errors
///
/// Returns an error if substitution fails or the document does not match
/// the pipeline file shape.
pub fn parse_pipeline_str(input: &str) -> Result<PipelineConfig> {
    let substituted = substitute_env_vars(input)?;
    let config: PipelineConfig =
        serde_yaml::from_str(&substituted).context("Failed to parse pipeline file")?;
    Ok(config)
}

/// Parse a pipeline file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or does not parse.
pub fn parse_pipeline(path: &Path) -> Result<PipelineConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;
    parse_pipeline_str(&content)
        .with_context(|| format!("Invalid pipeline file: {}", path.display()))
}

/// Parse one document from a JSON string, or a JSON array of documents.
///
/// # Errors
///
/// Returns an error if the input is neither an object nor an array of objects.
pub fn parse_documents(input: &str) -> Result<Vec<Document>> {
    let value: serde_json::Value =
        serde_json::from_str(input).context("Input is not valid JSON")?;
    match value {
        serde_json::Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, item)| {
                Document::try_from(item).map_err(|found| {
                    anyhow::anyhow!("Input document {i} must be an object, found {found}")
                })
            })
            .collect(),
        other => Document::try_from(other)
            .map(|doc| vec![doc])
            .map_err(|found| anyhow::anyhow!("Input must be an object or an array, found {found}")),
    }
}
