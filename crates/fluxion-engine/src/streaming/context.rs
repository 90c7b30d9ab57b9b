//! Run-scoped shared state.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use fluxion_types::document::Document;
use tokio_util::sync::CancellationToken;

use super::metrics::MetricsRegistry;

/// Lifecycle of a streaming run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RunState {
    Initializing = 0,
    Running = 1,
    Draining = 2,
    Stopped = 3,
    Aborted = 4,
}

impl RunState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Draining,
            3 => Self::Stopped,
            4 => Self::Aborted,
            _ => Self::Initializing,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Aborted)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

struct ContextInner {
    stream_id: String,
    metadata: Document,
    cancellation: CancellationToken,
    metrics: MetricsRegistry,
    state: AtomicU8,
}

/// Per-run context: cancellation, metrics, metadata and run state.
///
/// Cheap to clone; all clones observe the same run.
#[derive(Clone)]
pub struct StreamingContext {
    inner: Arc<ContextInner>,
}

impl StreamingContext {
    #[must_use]
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self::builder(stream_id).build()
    }

    #[must_use]
    pub fn builder(stream_id: impl Into<String>) -> StreamingContextBuilder {
        StreamingContextBuilder {
            stream_id: stream_id.into(),
            metadata: Document::new(),
            cancellation: None,
        }
    }

    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.inner.stream_id
    }

    /// Read-only run metadata (tenant, trace ids).
    #[must_use]
    pub fn metadata(&self) -> &Document {
        &self.inner.metadata
    }

    #[must_use]
    pub fn metrics(&self) -> &MetricsRegistry {
        &self.inner.metrics
    }

    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.inner.cancellation
    }

    /// Request an orderly shutdown of the run.
    pub fn cancel(&self) {
        self.inner.cancellation.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancellation.is_cancelled()
    }

    #[must_use]
    pub fn run_state(&self) -> RunState {
        RunState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Advance the run state. Terminal states are final and states never
    /// move backwards.
    pub(crate) fn advance_state(&self, next: RunState) {
        let _ = self
            .inner
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let current = RunState::from_u8(current);
                (!current.is_terminal() && next as u8 > current as u8).then_some(next as u8)
            });
    }
}

impl fmt::Debug for StreamingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingContext")
            .field("stream_id", &self.inner.stream_id)
            .field("state", &self.run_state())
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

pub struct StreamingContextBuilder {
    stream_id: String,
    metadata: Document,
    cancellation: Option<CancellationToken>,
}

impl StreamingContextBuilder {
    #[must_use]
    pub fn metadata(mut self, metadata: Document) -> Self {
        self.metadata = metadata;
        self
    }

    /// Use an externally owned token, e.g. one shared with a signal handler.
    #[must_use]
    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    #[must_use]
    pub fn build(self) -> StreamingContext {
        StreamingContext {
            inner: Arc::new(ContextInner {
                stream_id: self.stream_id,
                metadata: self.metadata,
                cancellation: self.cancellation.unwrap_or_default(),
                metrics: MetricsRegistry::new(),
                state: AtomicU8::new(RunState::Initializing as u8),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_only_moves_forward() {
        let ctx = StreamingContext::new("orders-stream");
        assert_eq!(ctx.run_state(), RunState::Initializing);
        ctx.advance_state(RunState::Draining);
        ctx.advance_state(RunState::Running);
        assert_eq!(ctx.run_state(), RunState::Draining);
        ctx.advance_state(RunState::Aborted);
        ctx.advance_state(RunState::Stopped);
        assert_eq!(ctx.run_state(), RunState::Aborted);
    }

    #[test]
    fn clones_share_cancellation_and_metrics() {
        let mut metadata = Document::new();
        metadata.insert("tenant", "acme");
        let ctx = StreamingContext::builder("orders-stream")
            .metadata(metadata)
            .build();
        let clone = ctx.clone();
        clone.metrics().stage("source").record_in(3);
        clone.cancel();

        assert!(ctx.is_cancelled());
        assert_eq!(ctx.metrics().snapshot().stage("source").unwrap().documents_in, 3);
        assert_eq!(ctx.metadata().get("tenant").and_then(|v| v.as_str()), Some("acme"));
        assert_eq!(ctx.stream_id(), "orders-stream");
    }
}
