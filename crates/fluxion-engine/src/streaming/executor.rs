//! Top-level streaming orchestration.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use fluxion_types::config::{StreamingErrorPolicy, StreamingRuntimeConfig};
use fluxion_types::document::Document;
use fluxion_types::error::ConfigurationError;
use tokio::task::JoinSet;

use super::bridge::{bridge, BridgeMode};
use super::context::{RunState, StreamingContext};
use super::sink::StreamingSink;
use super::source::{IterSource, StreamingSource};
use super::worker::{run_source, run_worker, run_writer, RunCounters, RunShared};
use crate::errors::PipelineError;
use crate::evaluator::Pipeline;
use crate::result::{RunError, RunSummary};

/// Runs a compiled pipeline over a source, writing to a sink.
///
/// One executor can serve any number of sequential or concurrent runs;
/// each run gets its own [`StreamingContext`].
#[derive(Debug, Clone)]
pub struct StreamingExecutor {
    pipeline: Arc<Pipeline>,
    config: StreamingRuntimeConfig,
    policy: StreamingErrorPolicy,
}

impl StreamingExecutor {
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] if the runtime config or the error
    /// policy is invalid.
    pub fn new(
        pipeline: impl Into<Arc<Pipeline>>,
        config: StreamingRuntimeConfig,
        policy: StreamingErrorPolicy,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;
        policy.validate()?;
        Ok(Self {
            pipeline: pipeline.into(),
            config,
            policy,
        })
    }

    #[must_use]
    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    #[must_use]
    pub fn config(&self) -> &StreamingRuntimeConfig {
        &self.config
    }

    #[must_use]
    pub fn policy(&self) -> &StreamingErrorPolicy {
        &self.policy
    }

    /// Run until the source is exhausted, `ctx` is cancelled, or a fatal
    /// error aborts the run. The sink is closed in every case.
    ///
    /// # Errors
    ///
    /// Returns a [`RunError`] carrying the first fatal error and a summary of
    /// what was processed before the abort.
    pub async fn process_stream(
        &self,
        source: Arc<dyn StreamingSource>,
        sink: Arc<dyn StreamingSink>,
        ctx: &StreamingContext,
    ) -> Result<RunSummary, RunError> {
        let started = Instant::now();
        let shared = Arc::new(RunShared::new(
            ctx.clone(),
            Arc::clone(&self.pipeline),
            self.config.clone(),
            self.policy.clone(),
            Arc::clone(&sink),
        ));
        ctx.advance_state(RunState::Running);

        let source_mode = if self.config.direct_handoff || self.config.source_queue_capacity == 0 {
            BridgeMode::Handoff
        } else {
            BridgeMode::Buffered(self.config.source_queue_capacity)
        };
        let output_mode = if self.config.direct_handoff {
            BridgeMode::Handoff
        } else {
            BridgeMode::Buffered(self.config.queue_capacity)
        };
        let concurrent_sink = sink.is_concurrent();

        tracing::info!(
            stream_id = ctx.stream_id(),
            stages = self.pipeline.len(),
            workers = self.config.worker_thread_pool_size,
            micro_batch_size = self.config.micro_batch_size,
            ?source_mode,
            ?output_mode,
            concurrent_sink,
            "Streaming run started"
        );

        let (source_tx, source_rx) = bridge(source_mode);
        let (output_tx, output_rx) = if concurrent_sink {
            (None, None)
        } else {
            let (tx, rx) = bridge(output_mode);
            (Some(tx), Some(rx))
        };

        let mut tasks = JoinSet::new();
        tasks.spawn(run_source(Arc::clone(&shared), Arc::clone(&source), source_tx));
        for worker_id in 0..self.config.worker_thread_pool_size {
            tasks.spawn(run_worker(
                Arc::clone(&shared),
                worker_id,
                source_rx.clone(),
                output_tx.clone(),
            ));
        }
        drop(output_tx);
        if let Some(rx) = output_rx.clone() {
            tasks.spawn(run_writer(Arc::clone(&shared), rx));
        }

        tokio::select! {
            () = join_all(&mut tasks, &shared) => {}
            () = shared.token.cancelled() => {}
        }

        if !tasks.is_empty() {
            ctx.advance_state(RunState::Draining);
            source.cancel();
            let grace = self.config.shutdown_grace();
            if tokio::time::timeout(grace, join_all(&mut tasks, &shared))
                .await
                .is_err()
            {
                tracing::warn!(
                    stream_id = ctx.stream_id(),
                    grace_ms = self.config.shutdown_grace_ms,
                    remaining_tasks = tasks.len(),
                    "Shutdown grace period elapsed, aborting remaining tasks"
                );
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
            }
        }
        source.cancel();

        let mut discarded = 0;
        source_rx.drain(|batch| discarded += batch.len()).await;
        if let Some(rx) = &output_rx {
            rx.drain(|batch| discarded += batch.len()).await;
        }
        if discarded > 0 {
            tracing::warn!(stream_id = ctx.stream_id(), documents = discarded, "Discarded queued batches");
        }
        RunCounters::add(&shared.counters.discarded, discarded);

        if let Err(err) = sink.close().await {
            tracing::error!(stream_id = ctx.stream_id(), error = %err, "Sink close failed");
            shared.abort(PipelineError::Sink(err));
        }

        let error = shared.take_error();
        ctx.advance_state(RunState::Draining);
        ctx.advance_state(if error.is_some() {
            RunState::Aborted
        } else {
            RunState::Stopped
        });

        let summary = summarize(&shared, ctx, started);
        tracing::info!(
            stream_id = ctx.stream_id(),
            state = %summary.state,
            documents_read = summary.documents_read,
            documents_written = summary.documents_written,
            documents_dropped = summary.documents_dropped,
            documents_discarded = summary.documents_discarded,
            duration_secs = summary.duration_secs(),
            "Streaming run finished"
        );

        match error {
            Some(error) => Err(RunError { error, summary }),
            None => Ok(summary),
        }
    }

    /// Stream an in-memory document list through the pipeline.
    ///
    /// # Errors
    ///
    /// Same as [`process_stream`](Self::process_stream).
    pub async fn process_iter<I>(
        &self,
        documents: I,
        sink: Arc<dyn StreamingSink>,
        ctx: &StreamingContext,
    ) -> Result<RunSummary, RunError>
    where
        I: IntoIterator<Item = Document>,
        I::IntoIter: Send + 'static,
    {
        let source = Arc::new(IterSource::new(documents, self.config.micro_batch_size));
        self.process_stream(source, sink, ctx).await
    }
}

/// Wait for every task. A panicked task aborts the run immediately so the
/// remaining tasks stop blocking on the bridges.
async fn join_all(tasks: &mut JoinSet<()>, shared: &RunShared) {
    while let Some(joined) = tasks.join_next().await {
        if let Err(join_err) = joined {
            if join_err.is_panic() {
                shared.abort(PipelineError::Infrastructure(anyhow::anyhow!(
                    "Streaming task panicked: {join_err}"
                )));
            }
        }
    }
}

fn summarize(shared: &RunShared, ctx: &StreamingContext, started: Instant) -> RunSummary {
    let counters = &shared.counters;
    RunSummary {
        state: ctx.run_state(),
        documents_read: counters.read.load(Ordering::Relaxed),
        documents_written: counters.written.load(Ordering::Relaxed),
        documents_dropped: counters.dropped.load(Ordering::Relaxed),
        documents_discarded: counters.discarded.load(Ordering::Relaxed),
        batches_dropped: counters.batches_dropped.load(Ordering::Relaxed),
        cancelled: ctx.is_cancelled(),
        elapsed: started.elapsed(),
        metrics: ctx.metrics().snapshot(),
    }
}

#[cfg(test)]
mod tests {
    use fluxion_types::error::SinkError;
    use fluxion_types::stage::stages_from_json_array;
    use fluxion_types::value::Value;

    use super::*;
    use crate::evaluator::PipelineEnv;
    use crate::streaming::sink::{CallbackSink, CollectSink};

    fn executor(stages: serde_json::Value, config: StreamingRuntimeConfig) -> StreamingExecutor {
        let stages = stages_from_json_array(&stages.to_string()).unwrap();
        let pipeline = Pipeline::compile(&stages, &PipelineEnv::default()).unwrap();
        StreamingExecutor::new(pipeline, config, StreamingErrorPolicy::fail_fast()).unwrap()
    }

    fn numbered(n: i64) -> Vec<Document> {
        (0..n)
            .map(|i| {
                let mut doc = Document::new();
                doc.insert("n", i);
                doc
            })
            .collect()
    }

    #[test]
    fn rejects_invalid_runtime_config() {
        let pipeline = Pipeline::compile(&[], &PipelineEnv::default()).unwrap();
        let config = StreamingRuntimeConfig {
            micro_batch_size: 0,
            ..StreamingRuntimeConfig::default()
        };
        let err = StreamingExecutor::new(pipeline, config, StreamingErrorPolicy::fail_fast())
            .unwrap_err();
        assert_eq!(err.code, "INVALID_RUNTIME");
    }

    #[tokio::test]
    async fn exhausted_source_stops_cleanly() {
        let exec = executor(
            serde_json::json!([{"$match": {"n": {"$gte": 5}}}]),
            StreamingRuntimeConfig::builder()
                .micro_batch_size(3)
                .worker_thread_pool_size(1)
                .build()
                .unwrap(),
        );
        let sink = CollectSink::new();
        let ctx = StreamingContext::new("exhaust");
        let summary = exec
            .process_iter(numbered(10), Arc::new(sink.clone()), &ctx)
            .await
            .unwrap();
        assert_eq!(summary.state, RunState::Stopped);
        assert_eq!(ctx.run_state(), RunState::Stopped);
        assert_eq!(summary.documents_read, 10);
        assert_eq!(summary.documents_written, 5);
        assert!(!summary.cancelled);
        let ns: Vec<Value> = sink
            .documents()
            .iter()
            .map(|d| d.get("n").cloned().unwrap_or_default())
            .collect();
        assert_eq!(ns, (5..10).map(Value::from).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn direct_handoff_with_serialized_sink() {
        let exec = executor(
            serde_json::json!([{"$set": {"seen": true}}]),
            StreamingRuntimeConfig::builder()
                .micro_batch_size(2)
                .worker_thread_pool_size(3)
                .direct_handoff(true)
                .queue_capacity(0)
                .build()
                .unwrap(),
        );
        let written = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&written);
        let sink = CallbackSink::new(move |batch| {
            counter.fetch_add(batch.len(), Ordering::SeqCst);
            Ok(())
        });
        let summary = exec
            .process_iter(numbered(9), Arc::new(sink), &StreamingContext::new("handoff"))
            .await
            .unwrap();
        assert_eq!(summary.documents_written, 9);
        assert_eq!(written.load(Ordering::SeqCst), 9);
    }

    #[tokio::test]
    async fn rejected_write_aborts_under_fail_fast() {
        let exec = executor(serde_json::json!([]), StreamingRuntimeConfig::default());
        let sink = CallbackSink::new(|_| Err(SinkError::rejected("schema mismatch")));
        let ctx = StreamingContext::new("reject");
        let err = exec
            .process_iter(numbered(3), Arc::new(sink), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err.error, PipelineError::Sink(_)));
        assert_eq!(err.summary.state, RunState::Aborted);
        assert_eq!(err.summary.documents_written, 0);
        assert!(!ctx.is_cancelled(), "abort must not cancel the caller's token");
    }
}
