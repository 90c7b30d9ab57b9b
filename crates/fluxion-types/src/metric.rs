//! Point-in-time metrics snapshots.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Counters for one stage, or for the `source` / `sink` endpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageMetricsSnapshot {
    pub documents_in: u64,
    pub documents_out: u64,
    pub errors: u64,
    pub elapsed_micros: u64,
}

/// Metrics keyed by stage id (`"{index}:{operator}"`, `source`, `sink`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageMetricsSnapshot>,
}

impl MetricsSnapshot {
    #[must_use]
    pub fn stage(&self, id: &str) -> Option<&StageMetricsSnapshot> {
        self.stages.get(id)
    }

    #[must_use]
    pub fn total_errors(&self) -> u64 {
        self.stages.values().map(|s| s.errors).sum()
    }
}
