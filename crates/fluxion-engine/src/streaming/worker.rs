//! Tasks of a streaming run: one source reader, a pool of workers and an
//! optional single writer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use fluxion_types::config::{StreamingErrorPolicy, StreamingRuntimeConfig};
use fluxion_types::document::Document;
use fluxion_types::error::SourceError;
use tokio_util::sync::CancellationToken;

use super::bridge::{BridgeReceiver, BridgeSender};
use super::context::{RunState, StreamingContext};
use super::metrics::{SINK_STAGE_ID, SOURCE_STAGE_ID};
use super::policy::retry_with_policy;
use super::sink::StreamingSink;
use super::source::{SourceEvent, StreamingSource};
use crate::errors::PipelineError;
use crate::evaluator::Pipeline;

pub(crate) type Batch = Vec<Document>;

#[derive(Debug, Default)]
pub(crate) struct RunCounters {
    pub(crate) read: AtomicU64,
    pub(crate) written: AtomicU64,
    pub(crate) dropped: AtomicU64,
    pub(crate) discarded: AtomicU64,
    pub(crate) batches_dropped: AtomicU64,
}

impl RunCounters {
    pub(crate) fn add(counter: &AtomicU64, documents: usize) {
        counter.fetch_add(u64::try_from(documents).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    fn drop_batch(&self, documents: usize) {
        Self::add(&self.dropped, documents);
        self.batches_dropped.fetch_add(1, Ordering::Relaxed);
    }
}

/// State shared by every task of one run.
pub(crate) struct RunShared {
    pub(crate) ctx: StreamingContext,
    /// Child of the context token; cancelled on caller cancellation and on abort.
    pub(crate) token: CancellationToken,
    pub(crate) pipeline: Arc<Pipeline>,
    pub(crate) config: StreamingRuntimeConfig,
    pub(crate) policy: StreamingErrorPolicy,
    pub(crate) sink: Arc<dyn StreamingSink>,
    pub(crate) counters: RunCounters,
    first_error: Mutex<Option<PipelineError>>,
}

impl RunShared {
    pub(crate) fn new(
        ctx: StreamingContext,
        pipeline: Arc<Pipeline>,
        config: StreamingRuntimeConfig,
        policy: StreamingErrorPolicy,
        sink: Arc<dyn StreamingSink>,
    ) -> Self {
        let token = ctx.cancellation_token().child_token();
        Self {
            ctx,
            token,
            pipeline,
            config,
            policy,
            sink,
            counters: RunCounters::default(),
            first_error: Mutex::new(None),
        }
    }

    /// Record a fatal error and stop the run. Only the first error is kept.
    pub(crate) fn abort(&self, error: PipelineError) {
        {
            let mut first = self.first_error.lock().unwrap_or_else(PoisonError::into_inner);
            if first.is_none() {
                tracing::error!(stream_id = self.ctx.stream_id(), error = %error, "Aborting run");
                *first = Some(error);
            }
        }
        self.ctx.advance_state(RunState::Draining);
        self.token.cancel();
    }

    pub(crate) fn take_error(&self) -> Option<PipelineError> {
        self.first_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Set once the run is cancelled or aborted.
    fn stopping(&self) -> bool {
        self.token.is_cancelled()
    }
}

// ── Source ──────────────────────────────────────────────────────────

/// Poll the source and feed micro-batches into the source bridge until the
/// stream ends, the run stops, or the source fails for good.
pub(crate) async fn run_source(
    shared: Arc<RunShared>,
    source: Arc<dyn StreamingSource>,
    tx: BridgeSender<Batch>,
) {
    let metrics = shared.ctx.metrics().stage(SOURCE_STAGE_ID);
    let poll_timeout = shared.config.poll_timeout();
    let micro_batch_size = shared.config.micro_batch_size;

    loop {
        if shared.stopping() {
            break;
        }
        let started = Instant::now();
        let polled = retry_with_policy(
            &shared.policy,
            &shared.token,
            "source.poll",
            |_attempt| {
                let source = &source;
                let shared = &shared;
                let metrics = &metrics;
                async move {
                    let result: Result<Option<SourceEvent>, SourceError> = tokio::select! {
                        biased;
                        () = shared.token.cancelled() => Ok(None),
                        event = source.poll(poll_timeout) => event.map(Some),
                    };
                    if result.is_err() {
                        metrics.record_error();
                    }
                    result
                }
            },
        )
        .await;
        metrics.record_elapsed(started.elapsed());

        let event = match polled {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(_) if shared.stopping() => break,
            Err(err) => {
                shared.abort(PipelineError::Source(err));
                break;
            }
        };

        match event {
            SourceEvent::Timeout => {}
            SourceEvent::EndOfStream => {
                tracing::debug!(stream_id = shared.ctx.stream_id(), "Source exhausted, draining");
                shared.ctx.advance_state(RunState::Draining);
                break;
            }
            SourceEvent::Batch(batch) => {
                metrics.record_in(batch.len());
                metrics.record_out(batch.len());
                RunCounters::add(&shared.counters.read, batch.len());
                if !forward_micro_batches(&shared, &tx, batch, micro_batch_size).await {
                    break;
                }
            }
        }
    }

    if shared.stopping() {
        source.cancel();
    }
}

/// Split `batch` into micro-batches and send them in order. Returns `false`
/// once the bridge refuses a send; unsent documents are counted as discarded.
async fn forward_micro_batches(
    shared: &RunShared,
    tx: &BridgeSender<Batch>,
    mut batch: Batch,
    micro_batch_size: usize,
) -> bool {
    while !batch.is_empty() {
        let rest = if batch.len() > micro_batch_size {
            batch.split_off(micro_batch_size)
        } else {
            Vec::new()
        };
        let len = batch.len();
        if tx.send(batch, &shared.token).await.is_err() {
            RunCounters::add(&shared.counters.discarded, len + rest.len());
            return false;
        }
        batch = rest;
    }
    true
}

// ── Workers ─────────────────────────────────────────────────────────

/// Evaluate micro-batches until the source bridge closes or the run stops.
/// Output goes to the writer bridge, or straight to a concurrent sink.
pub(crate) async fn run_worker(
    shared: Arc<RunShared>,
    worker_id: usize,
    rx: BridgeReceiver<Batch>,
    out: Option<BridgeSender<Batch>>,
) {
    tracing::debug!(worker_id, "Worker started");
    loop {
        if shared.stopping() {
            break;
        }
        let Some(batch) = rx.recv(&shared.token).await else {
            break;
        };
        let len = batch.len();
        let evaluated = shared
            .pipeline
            .evaluate_with_cancel(batch, shared.ctx.metrics(), &shared.token, &shared.policy)
            .await;
        match evaluated {
            Ok(docs) if docs.is_empty() => {}
            Ok(docs) => match &out {
                Some(out) => {
                    let produced = docs.len();
                    if out.send(docs, &shared.token).await.is_err() {
                        RunCounters::add(&shared.counters.discarded, produced);
                    }
                }
                None => write_batch(&shared, docs).await,
            },
            Err(_) if shared.stopping() => {
                RunCounters::add(&shared.counters.discarded, len);
            }
            Err(err) if shared.policy.fail_fast => {
                shared.abort(PipelineError::Evaluation(err));
            }
            Err(err) => {
                tracing::warn!(
                    worker_id,
                    stage = err.stage_index,
                    operator = %err.operator,
                    documents = len,
                    error = %err,
                    "Dropping batch after stage failure"
                );
                shared.counters.drop_batch(len);
            }
        }
    }
    tracing::debug!(worker_id, "Worker stopped");
}

// ── Writer ──────────────────────────────────────────────────────────

/// Serialize writes to a sink that is not concurrency-safe.
pub(crate) async fn run_writer(shared: Arc<RunShared>, rx: BridgeReceiver<Batch>) {
    while let Some(batch) = rx.recv(&shared.token).await {
        write_batch(&shared, batch).await;
    }
}

/// Write one batch with retries, then account for the outcome.
async fn write_batch(shared: &RunShared, batch: Batch) {
    let len = batch.len();
    let metrics = shared.ctx.metrics().stage(SINK_STAGE_ID);
    metrics.record_in(len);
    let started = Instant::now();
    let result = retry_with_policy(&shared.policy, &shared.token, "sink.accept", |_attempt| {
        let batch = &batch;
        let metrics = &metrics;
        async move {
            let result = shared.sink.accept(batch).await;
            if result.is_err() {
                metrics.record_error();
            }
            result
        }
    })
    .await;
    metrics.record_elapsed(started.elapsed());

    match result {
        Ok(()) => {
            metrics.record_out(len);
            RunCounters::add(&shared.counters.written, len);
        }
        Err(_) if shared.stopping() => {
            RunCounters::add(&shared.counters.discarded, len);
        }
        Err(err) if shared.policy.fail_fast => shared.abort(PipelineError::Sink(err)),
        Err(err) => {
            tracing::warn!(
                documents = len,
                retryable = err.retryable,
                error = %err,
                "Dropping batch after sink failure"
            );
            shared.counters.drop_batch(len);
        }
    }
}
