//! End-to-end tests of the streaming executor: retries, backpressure,
//! cancellation, ordering and abort behaviour.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use fluxion_engine::evaluator::{Pipeline, PipelineEnv, PipelineExecutor};
use fluxion_engine::streaming::{
    CallbackSink, CollectSink, IterSource, SourceEvent, StreamingContext, StreamingExecutor,
    StreamingSink, StreamingSource,
};
use fluxion_engine::{OperatorRegistry, PipelineError, RunState, StageOperator};
use fluxion_types::config::{BackoffStrategy, StreamingErrorPolicy, StreamingRuntimeConfig};
use fluxion_types::error::{EvaluationErrorKind, SinkError, SourceError};
use fluxion_types::{documents_from_json_array, stages_from_json_array, Document, Stage, Value};
use serde_json::json;

fn stages(value: serde_json::Value) -> Vec<Stage> {
    stages_from_json_array(&value.to_string()).unwrap()
}

fn compile(value: serde_json::Value) -> Pipeline {
    Pipeline::compile(&stages(value), &PipelineEnv::default()).unwrap()
}

fn docs(value: serde_json::Value) -> Vec<Document> {
    documents_from_json_array(&value.to_string()).unwrap()
}

fn numbered(n: u64) -> impl Iterator<Item = Document> + Send + 'static {
    (0..n).map(|i| {
        let mut doc = Document::new();
        doc.insert("n", i64::try_from(i).unwrap());
        doc
    })
}

fn orders() -> Vec<Document> {
    docs(json!([
        {"orderId": "A-100", "status": "PAID", "total": 120.0},
        {"orderId": "A-101", "status": "PENDING", "total": 65.0},
        {"orderId": "A-102", "status": "PAID", "total": 98.5}
    ]))
}

/// Source that never ends, counting every document it hands out.
struct EndlessSource {
    produced: Arc<AtomicU64>,
}

#[async_trait]
impl StreamingSource for EndlessSource {
    async fn poll(&self, _timeout: Duration) -> Result<SourceEvent, SourceError> {
        let n = self.produced.fetch_add(1, Ordering::SeqCst);
        let mut doc = Document::new();
        doc.insert("n", i64::try_from(n).unwrap_or(i64::MAX));
        Ok(SourceEvent::Batch(vec![doc]))
    }

    fn cancel(&self) {}
}

/// Source that only ever times out.
struct IdleSource;

#[async_trait]
impl StreamingSource for IdleSource {
    async fn poll(&self, timeout: Duration) -> Result<SourceEvent, SourceError> {
        tokio::time::sleep(timeout).await;
        Ok(SourceEvent::Timeout)
    }

    fn cancel(&self) {}
}

/// Serialized sink that takes `delay` per batch and tracks the largest
/// observed gap between documents produced and documents written.
struct SlowSink {
    delay: Duration,
    produced: Arc<AtomicU64>,
    written: AtomicU64,
    max_pending: AtomicU64,
}

#[async_trait]
impl StreamingSink for SlowSink {
    async fn accept(&self, batch: &[Document]) -> Result<(), SinkError> {
        let pending = self.produced.load(Ordering::SeqCst) - self.written.load(Ordering::SeqCst);
        self.max_pending.fetch_max(pending, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.written.fetch_add(batch.len() as u64, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn orders_example_yields_paid_revenue() {
    let pipeline = compile(json!([
        {"$match": {"status": "PAID"}},
        {"$group": {
            "_id": "$status",
            "count": {"$sum": 1},
            "totalRevenue": {"$sum": "$total"}
        }}
    ]));
    let executor = StreamingExecutor::new(
        pipeline,
        StreamingRuntimeConfig::default(),
        StreamingErrorPolicy::fail_fast(),
    )
    .unwrap();
    let sink = CollectSink::new();
    let ctx = StreamingContext::new("orders");

    let summary = executor
        .process_iter(orders(), Arc::new(sink.clone()), &ctx)
        .await
        .unwrap();

    let out: Vec<serde_json::Value> = sink.documents().iter().map(Document::to_json).collect();
    assert_eq!(out, vec![json!({"_id": "PAID", "count": 2, "totalRevenue": 218.5})]);
    assert_eq!(summary.state, RunState::Stopped);
    assert_eq!(summary.documents_read, 3);
    assert_eq!(summary.documents_written, 1);

    let metrics = ctx.metrics().snapshot();
    let matched = metrics.stage("0:match").unwrap();
    assert_eq!((matched.documents_in, matched.documents_out), (3, 2));
    let grouped = metrics.stage("1:group").unwrap();
    assert_eq!((grouped.documents_in, grouped.documents_out), (2, 1));
    assert_eq!(metrics.stage("sink").unwrap().documents_out, 1);
    assert_eq!(metrics.total_errors(), 0);
}

#[tokio::test]
async fn sink_failing_twice_is_retried_then_delivered() {
    let executor = StreamingExecutor::new(
        compile(json!([{"$set": {"seen": true}}])),
        StreamingRuntimeConfig::default(),
        StreamingErrorPolicy::retrying(2, BackoffStrategy::Fixed { delay_ms: 5 }),
    )
    .unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let calls = Arc::clone(&calls);
        let delivered = Arc::clone(&delivered);
        CallbackSink::new(move |batch| {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                return Err(SinkError::transient("connection reset"));
            }
            delivered.lock().unwrap().extend_from_slice(batch);
            Ok(())
        })
    };

    let summary = executor
        .process_iter(numbered(3), Arc::new(sink), &StreamingContext::new("retry"))
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(summary.documents_written, 3);
    assert_eq!(summary.documents_dropped, 0);
    assert_eq!(summary.metrics.stage("sink").unwrap().errors, 2);
    let delivered = delivered.lock().unwrap();
    assert_eq!(delivered.len(), 3);
    assert!(delivered.iter().all(|d| d.get("seen") == Some(&Value::Bool(true))));
}

#[tokio::test]
async fn exhausted_retries_drop_the_batch_without_fail_fast() {
    let executor = StreamingExecutor::new(
        compile(json!([])),
        StreamingRuntimeConfig::builder()
            .micro_batch_size(2)
            .build()
            .unwrap(),
        StreamingErrorPolicy::retrying(1, BackoffStrategy::None),
    )
    .unwrap();
    let sink = CallbackSink::new(|batch| {
        if batch.iter().any(|d| d.get("n") == Some(&Value::from(0))) {
            Err(SinkError::transient("poison batch"))
        } else {
            Ok(())
        }
    });

    let summary = executor
        .process_iter(numbered(6), Arc::new(sink), &StreamingContext::new("drop"))
        .await
        .unwrap();

    assert_eq!(summary.state, RunState::Stopped);
    assert_eq!(summary.documents_written, 4);
    assert_eq!(summary.documents_dropped, 2);
    assert_eq!(summary.batches_dropped, 1);
    assert_eq!(summary.metrics.stage("sink").unwrap().errors, 2);
}

#[tokio::test]
async fn slow_sink_bounds_in_flight_documents() {
    let micro_batch_size = 1;
    let source_queue_capacity = 2;
    let queue_capacity = 2;
    let workers = 1;
    let executor = StreamingExecutor::new(
        compile(json!([{"$set": {"doubled": {"$multiply": ["$n", 2]}}}])),
        StreamingRuntimeConfig::builder()
            .micro_batch_size(micro_batch_size)
            .source_queue_capacity(source_queue_capacity)
            .queue_capacity(queue_capacity)
            .worker_thread_pool_size(workers)
            .shutdown_grace_ms(1_000)
            .build()
            .unwrap(),
        StreamingErrorPolicy::fail_fast(),
    )
    .unwrap();

    let produced = Arc::new(AtomicU64::new(0));
    let sink = Arc::new(SlowSink {
        delay: Duration::from_millis(20),
        produced: Arc::clone(&produced),
        written: AtomicU64::new(0),
        max_pending: AtomicU64::new(0),
    });
    let ctx = StreamingContext::new("backpressure");
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(400)).await;
        canceller.cancel();
    });

    let source = Arc::new(EndlessSource {
        produced: Arc::clone(&produced),
    });
    let summary = executor
        .process_stream(source, Arc::clone(&sink) as Arc<dyn StreamingSink>, &ctx)
        .await
        .unwrap();

    // Queued batches alone are bounded by the two queue capacities. Each
    // worker, the writer and the source may also hold one batch in hand.
    let bound = (micro_batch_size * (source_queue_capacity + queue_capacity + workers + 2)) as u64;
    let max_pending = sink.max_pending.load(Ordering::SeqCst);
    assert!(max_pending <= bound, "{max_pending} documents in flight, bound {bound}");
    assert!(summary.documents_written >= 5, "{}", summary.documents_written);
    assert!(summary.cancelled);
}

#[tokio::test]
async fn cancellation_stops_an_idle_stream_within_grace() {
    let executor = StreamingExecutor::new(
        compile(json!([{"$match": {"n": {"$gte": 0}}}])),
        StreamingRuntimeConfig::builder()
            .poll_timeout_ms(100)
            .shutdown_grace_ms(500)
            .worker_thread_pool_size(2)
            .build()
            .unwrap(),
        StreamingErrorPolicy::fail_fast(),
    )
    .unwrap();
    let ctx = StreamingContext::new("idle");
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let summary = executor
        .process_stream(Arc::new(IdleSource), Arc::new(CollectSink::new()), &ctx)
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
    assert_eq!(summary.state, RunState::Stopped);
    assert_eq!(ctx.run_state(), RunState::Stopped);
    assert!(summary.cancelled);
    assert_eq!(summary.documents_read, 0);
}

#[tokio::test]
async fn cancellation_stops_an_unbounded_stream() {
    let executor = StreamingExecutor::new(
        compile(json!([{"$set": {"k": 1}}])),
        StreamingRuntimeConfig::builder()
            .micro_batch_size(32)
            .worker_thread_pool_size(4)
            .poll_timeout_ms(100)
            .shutdown_grace_ms(500)
            .build()
            .unwrap(),
        StreamingErrorPolicy::fail_fast(),
    )
    .unwrap();
    let ctx = StreamingContext::new("unbounded");
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        canceller.cancel();
    });

    let sink = CollectSink::new();
    let started = Instant::now();
    let summary = executor
        .process_stream(
            Arc::new(IterSource::new((0_i64..).map(|n| {
                let mut doc = Document::new();
                doc.insert("n", n);
                doc
            }), 32)),
            Arc::new(sink.clone()),
            &ctx,
        )
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(summary.state, RunState::Stopped);
    assert!(summary.documents_read > 0);
    assert_eq!(summary.documents_written, sink.len() as u64);
    assert_eq!(
        summary.documents_read,
        summary.documents_written + summary.documents_discarded + summary.documents_dropped
    );
}

#[tokio::test]
async fn single_worker_preserves_order_and_matches_sequential_evaluation() {
    let stages = stages(json!([
        {"$set": {"total": {"$multiply": ["$price", "$qty"]}}},
        {"$match": {"total": {"$gt": 10}}},
        {"$project": {"id": 1, "total": 1, "_id": 0}}
    ]));
    let input: Vec<Document> = (0..50_i64)
        .map(|i| {
            let mut doc = Document::new();
            doc.insert("id", i);
            doc.insert("price", i % 7);
            doc.insert("qty", 3);
            doc
        })
        .collect();

    let sequential = PipelineExecutor::new()
        .run(input.clone(), &stages, Document::new())
        .await
        .unwrap();

    let executor = StreamingExecutor::new(
        Pipeline::compile(&stages, &PipelineEnv::default()).unwrap(),
        StreamingRuntimeConfig::builder()
            .micro_batch_size(4)
            .worker_thread_pool_size(1)
            .build()
            .unwrap(),
        StreamingErrorPolicy::fail_fast(),
    )
    .unwrap();
    let sink = CollectSink::new();
    executor
        .process_iter(input, Arc::new(sink.clone()), &StreamingContext::new("order"))
        .await
        .unwrap();

    assert_eq!(sink.documents(), sequential);
}

#[tokio::test]
async fn stage_failure_aborts_under_fail_fast() {
    let executor = StreamingExecutor::new(
        compile(json!([{"$set": {"ratio": {"$divide": [10, "$n"]}}}])),
        StreamingRuntimeConfig::builder()
            .micro_batch_size(2)
            .build()
            .unwrap(),
        StreamingErrorPolicy::fail_fast(),
    )
    .unwrap();
    let ctx = StreamingContext::new("abort");

    let err = executor
        .process_iter(numbered(10), Arc::new(CollectSink::new()), &ctx)
        .await
        .unwrap_err();

    let PipelineError::Evaluation(stage_err) = &err.error else {
        panic!("expected an evaluation error, got {:?}", err.error);
    };
    assert_eq!(stage_err.stage_index, 0);
    assert_eq!(stage_err.document_index, Some(0));
    assert_eq!(err.summary.state, RunState::Aborted);
    assert_eq!(ctx.run_state(), RunState::Aborted);
    assert!(!ctx.is_cancelled());
    assert_eq!(err.summary.metrics.stage("0:set").unwrap().errors, 1);
}

#[tokio::test]
async fn stage_failure_drops_only_its_batch_without_fail_fast() {
    let executor = StreamingExecutor::new(
        compile(json!([{"$set": {"ratio": {"$divide": [10, "$n"]}}}])),
        StreamingRuntimeConfig::builder()
            .micro_batch_size(2)
            .build()
            .unwrap(),
        StreamingErrorPolicy::retrying(3, BackoffStrategy::None),
    )
    .unwrap();
    let sink = CollectSink::new();

    let summary = executor
        .process_iter(numbered(6), Arc::new(sink.clone()), &StreamingContext::new("lenient"))
        .await
        .unwrap();

    assert_eq!(summary.state, RunState::Stopped);
    assert_eq!(summary.documents_written, 4);
    assert_eq!(summary.documents_dropped, 2);
    assert_eq!(summary.batches_dropped, 1);
    // Evaluation errors are never retried.
    assert_eq!(summary.metrics.stage("0:set").unwrap().errors, 1);
}

/// Custom operator that panics on every batch.
struct PanickingOperator;

impl StageOperator for PanickingOperator {
    fn apply(&self, _spec: &Value, _batch: Vec<Document>) -> Result<Vec<Document>, EvaluationErrorKind> {
        panic!("operator exploded");
    }
}

#[tokio::test]
async fn panicking_worker_aborts_the_run() {
    let mut operators = OperatorRegistry::new();
    operators.register("explode", Arc::new(PanickingOperator)).unwrap();
    let pipeline = Pipeline::compile(
        &stages(json!([{"$explode": {}}])),
        &PipelineEnv::new(operators),
    )
    .unwrap();
    let executor = StreamingExecutor::new(
        pipeline,
        StreamingRuntimeConfig::builder()
            .micro_batch_size(1)
            .source_queue_capacity(1)
            .worker_thread_pool_size(1)
            .build()
            .unwrap(),
        StreamingErrorPolicy::fail_fast(),
    )
    .unwrap();
    let ctx = StreamingContext::new("panic");

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        executor.process_iter(numbered(10), Arc::new(CollectSink::new()), &ctx),
    )
    .await
    .expect("run must finish after a worker panic");

    let err = result.unwrap_err();
    assert!(matches!(err.error, PipelineError::Infrastructure(_)));
    assert!(err.error.to_string().contains("panicked"), "{}", err.error);
    assert_eq!(err.summary.state, RunState::Aborted);
    assert_eq!(err.summary.documents_written, 0);
    assert!(!ctx.is_cancelled());
}
