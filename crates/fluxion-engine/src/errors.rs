//! Pipeline error model and retry backoff policy helpers.

use std::time::Duration;

use fluxion_types::config::BackoffStrategy;
use fluxion_types::error::{
    ConfigurationError, EnrichmentError, ErrorCategory, SinkError, SourceError,
    StageEvaluationError,
};

// ---------------------------------------------------------------------------
// PipelineError: categorised errors for retry and abort decisions
// ---------------------------------------------------------------------------

/// Categorized pipeline error.
///
/// The typed variants carry the classification the error policy needs.
/// `Infrastructure` wraps opaque host-side failures (task panics, I/O
/// while wiring connectors) that are never retryable.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Evaluation(#[from] StageEvaluationError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Infrastructure(#[from] anyhow::Error),
}

impl PipelineError {
    /// Returns `true` if retrying the failed unit of work may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Evaluation(e) => e.is_retryable(),
            Self::Sink(e) => e.retryable,
            Self::Source(e) => e.retryable,
            Self::Configuration(_) | Self::Infrastructure(_) => false,
        }
    }

    #[must_use]
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            Self::Configuration(_) => Some(ErrorCategory::Config),
            Self::Evaluation(e) => Some(e.category()),
            Self::Sink(_) => Some(ErrorCategory::Sink),
            Self::Source(_) => Some(ErrorCategory::Source),
            Self::Infrastructure(_) => None,
        }
    }
}

/// Failures the retry loop can classify.
pub(crate) trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for EnrichmentError {
    fn is_retryable(&self) -> bool {
        EnrichmentError::is_retryable(self)
    }
}

impl Retryable for SinkError {
    fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl Retryable for SourceError {
    fn is_retryable(&self) -> bool {
        self.retryable
    }
}

/// Compute the delay before retry `attempt` (1-based).
#[must_use]
pub fn compute_backoff(strategy: &BackoffStrategy, attempt: u32) -> Duration {
    match *strategy {
        BackoffStrategy::None => Duration::ZERO,
        BackoffStrategy::Fixed { delay_ms } => Duration::from_millis(delay_ms),
        BackoffStrategy::Exponential { base_ms, max_ms } => {
            let exponent = attempt.saturating_sub(1).min(32);
            let delay_ms = base_ms.saturating_mul(2u64.saturating_pow(exponent));
            Duration::from_millis(delay_ms.min(max_ms))
        }
    }
}
