//! Lock-free per-stage counters.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use fluxion_types::metric::{MetricsSnapshot, StageMetricsSnapshot};

pub const SOURCE_STAGE_ID: &str = "source";
pub const SINK_STAGE_ID: &str = "sink";

/// Counters for one stage. Updated concurrently by every worker.
#[derive(Debug, Default)]
pub struct StageCounters {
    documents_in: AtomicU64,
    documents_out: AtomicU64,
    errors: AtomicU64,
    elapsed_micros: AtomicU64,
}

impl StageCounters {
    pub fn record_in(&self, documents: usize) {
        self.documents_in.fetch_add(as_u64(documents), Ordering::Relaxed);
    }

    pub fn record_out(&self, documents: usize) {
        self.documents_out.fetch_add(as_u64(documents), Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_elapsed(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.elapsed_micros.fetch_add(micros, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> StageMetricsSnapshot {
        StageMetricsSnapshot {
            documents_in: self.documents_in.load(Ordering::Relaxed),
            documents_out: self.documents_out.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            elapsed_micros: self.elapsed_micros.load(Ordering::Relaxed),
        }
    }
}

fn as_u64(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}

/// Registry of stage counters for one run.
///
/// The id map is only written when a stage registers; counter updates go
/// through the shared `Arc<StageCounters>` without taking the lock for writing.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    stages: RwLock<BTreeMap<String, Arc<StageCounters>>>,
}

impl MetricsRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters for `id`, registered on first use.
    pub fn stage(&self, id: &str) -> Arc<StageCounters> {
        if let Some(counters) = self
            .stages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
        {
            return Arc::clone(counters);
        }
        let mut stages = self.stages.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(stages.entry(id.to_string()).or_default())
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let stages = self.stages.read().unwrap_or_else(PoisonError::into_inner);
        MetricsSnapshot {
            stages: stages
                .iter()
                .map(|(id, counters)| (id.clone(), counters.snapshot()))
                .collect(),
        }
    }
}

/// Metrics id of a pipeline stage.
#[must_use]
pub fn stage_id(index: usize, operator: &str) -> String {
    format!("{index}:{operator}")
}
