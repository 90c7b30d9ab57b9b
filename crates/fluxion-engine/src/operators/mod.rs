//! Built-in stage operators.
//!
//! Stateless operators (`set`, `project`, `unset`, `unwind`) work one
//! document at a time and preserve order. Stateful operators (`group`,
//! `sort`, `limit`, `skip`, `count`) see the current micro-batch only.

pub mod group;
pub mod misc;
pub mod project;
pub mod set;

use fluxion_types::config::StreamingErrorPolicy;
use fluxion_types::error::{ConfigurationError, EvaluationErrorKind};
use fluxion_types::value::Value;
use tokio_util::sync::CancellationToken;

use crate::streaming::metrics::StageCounters;

/// An operator failed on the batch, optionally on a specific document.
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorFailure {
    pub document_index: Option<usize>,
    pub kind: EvaluationErrorKind,
}

impl OperatorFailure {
    pub(crate) fn at(document_index: usize, kind: EvaluationErrorKind) -> Self {
        Self {
            document_index: Some(document_index),
            kind,
        }
    }

    pub(crate) fn batch(kind: EvaluationErrorKind) -> Self {
        Self {
            document_index: None,
            kind,
        }
    }
}

/// Run-scoped inputs an operator needs beyond the batch itself.
#[derive(Clone, Copy)]
pub struct EvalScope<'a> {
    pub cancel: &'a CancellationToken,
    pub policy: &'a StreamingErrorPolicy,
    pub counters: &'a StageCounters,
}

/// Field names written by an operator may not be empty or start with `$`.
pub(crate) fn check_field_name(operator: &str, name: &str) -> Result<(), ConfigurationError> {
    if name.is_empty() || name.starts_with('$') || name.split('.').any(str::is_empty) {
        return Err(ConfigurationError::invalid_stage(
            operator,
            format!("invalid field name '{name}'"),
        ));
    }
    Ok(())
}

/// Field paths are given either bare (`total`) or as references (`$total`).
pub(crate) fn field_path<'a>(operator: &str, spec: &'a Value) -> Result<&'a str, ConfigurationError> {
    let Some(raw) = spec.as_str() else {
        return Err(ConfigurationError::invalid_stage(
            operator,
            format!("expected a field path, found {}", spec.type_name()),
        ));
    };
    let path = raw.strip_prefix('$').unwrap_or(raw);
    check_field_name(operator, path)?;
    Ok(path)
}
