//! Streaming run outcome types.

use std::time::Duration;

use fluxion_types::metric::MetricsSnapshot;

use crate::errors::PipelineError;
use crate::streaming::context::RunState;

/// Counters and final state of a streaming run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub state: RunState,
    pub documents_read: u64,
    pub documents_written: u64,
    /// Documents in batches dropped after a failure the policy tolerated.
    pub documents_dropped: u64,
    /// Documents still queued or in flight when the run was cancelled or aborted.
    pub documents_discarded: u64,
    pub batches_dropped: u64,
    /// The caller cancelled the run.
    pub cancelled: bool,
    pub elapsed: Duration,
    pub metrics: MetricsSnapshot,
}

impl RunSummary {
    #[must_use]
    pub fn duration_secs(&self) -> f64 {
        self.elapsed.as_secs_f64()
    }
}

/// A run that aborted, with whatever was accomplished before the abort.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct RunError {
    pub error: PipelineError,
    pub summary: RunSummary,
}
