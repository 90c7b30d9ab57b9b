//! Pipeline compilation and batch evaluation.
//!
//! A [`Pipeline`] is compiled once from its stage list and can then be
//! evaluated against any number of batches, concurrently, from any task.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use fluxion_types::config::StreamingErrorPolicy;
use fluxion_types::document::Document;
use fluxion_types::error::{ConfigurationError, EvaluationErrorKind, StageEvaluationError};
use fluxion_types::stage::Stage;
use fluxion_types::value::Value;
use tokio_util::sync::CancellationToken;

use crate::enrich::http_call::DEFAULT_TARGET;
use crate::enrich::{CircuitRegistry, HttpCallOperator};
use crate::errors::PipelineError;
use crate::operators::group::GroupOperator;
use crate::operators::misc::{
    CountOperator, LimitOperator, SkipOperator, SortOperator, UnsetOperator, UnwindOperator,
};
use crate::operators::project::ProjectOperator;
use crate::operators::set::SetOperator;
use crate::operators::{EvalScope, OperatorFailure};
use crate::predicate::Predicate;
use crate::registry::{OperatorRegistry, StageOperator};
use crate::streaming::context::{RunState, StreamingContext};
use crate::streaming::metrics::{stage_id, MetricsRegistry};

/// Everything compilation needs besides the stages themselves.
///
/// Clones share the same registries, so pipelines compiled from clones of
/// one environment share circuit breakers.
#[derive(Debug, Clone, Default)]
pub struct PipelineEnv {
    pub operators: Arc<OperatorRegistry>,
    pub circuits: Arc<CircuitRegistry>,
}

impl PipelineEnv {
    #[must_use]
    pub fn new(operators: OperatorRegistry) -> Self {
        Self {
            operators: Arc::new(operators),
            circuits: Arc::new(CircuitRegistry::new()),
        }
    }
}

enum CompiledOperator {
    Match(Predicate),
    Set(SetOperator),
    Project(ProjectOperator),
    Unset(UnsetOperator),
    Unwind(UnwindOperator),
    Group(GroupOperator),
    Sort(SortOperator),
    Limit(LimitOperator),
    Skip(SkipOperator),
    Count(CountOperator),
    HttpCall {
        call: Box<HttpCallOperator>,
        target: String,
    },
    Custom {
        handler: Arc<dyn StageOperator>,
        spec: Value,
    },
}

struct CompiledStage {
    index: usize,
    operator: String,
    id: String,
    op: CompiledOperator,
}

/// A compiled, reusable stage list.
pub struct Pipeline {
    stages: Vec<CompiledStage>,
}

impl Pipeline {
    /// Resolve every stage into a typed operator.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigurationError`], tagged with its stage index.
    pub fn compile(stages: &[Stage], env: &PipelineEnv) -> Result<Self, ConfigurationError> {
        let compiled = stages
            .iter()
            .enumerate()
            .map(|(index, stage)| {
                let op = compile_stage(stage, env).map_err(|e| e.at_stage(index))?;
                Ok(CompiledStage {
                    index,
                    operator: stage.operator().to_string(),
                    id: stage_id(index, stage.operator()),
                    op,
                })
            })
            .collect::<Result<Vec<_>, ConfigurationError>>()?;
        Ok(Self { stages: compiled })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Metrics ids of the stages, in order.
    #[must_use]
    pub fn stage_ids(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.id.as_str()).collect()
    }

    /// Whether any stage makes network calls.
    #[must_use]
    pub fn has_enrichment(&self) -> bool {
        self.stages.iter().any(|s| match &s.op {
            CompiledOperator::HttpCall { .. } => true,
            CompiledOperator::Set(set) => set.has_enrichment(),
            _ => false,
        })
    }

    /// Run every stage over `batch`, recording per-stage metrics on `ctx`.
    ///
    /// # Errors
    ///
    /// Returns a [`StageEvaluationError`] naming the first stage and document
    /// that failed.
    pub async fn evaluate(
        &self,
        batch: Vec<Document>,
        ctx: &StreamingContext,
        policy: &StreamingErrorPolicy,
    ) -> Result<Vec<Document>, StageEvaluationError> {
        self.evaluate_with_cancel(batch, ctx.metrics(), ctx.cancellation_token(), policy)
            .await
    }

    pub(crate) async fn evaluate_with_cancel(
        &self,
        mut batch: Vec<Document>,
        metrics: &MetricsRegistry,
        cancel: &CancellationToken,
        policy: &StreamingErrorPolicy,
    ) -> Result<Vec<Document>, StageEvaluationError> {
        for stage in &self.stages {
            let counters = metrics.stage(&stage.id);
            counters.record_in(batch.len());
            let started = Instant::now();
            let scope = EvalScope {
                cancel,
                policy,
                counters: &counters,
            };
            let result = stage.apply(batch, scope).await;
            counters.record_elapsed(started.elapsed());
            match result {
                Ok(out) => {
                    counters.record_out(out.len());
                    batch = out;
                }
                Err(failure) => {
                    // Enrichment attempts count their own failures.
                    if !matches!(failure.kind, EvaluationErrorKind::Enrichment(_)) {
                        counters.record_error();
                    }
                    let mut err =
                        StageEvaluationError::new(stage.index, stage.operator.clone(), failure.kind);
                    if let Some(document) = failure.document_index {
                        err = err.with_document(document);
                    }
                    return Err(err);
                }
            }
        }
        Ok(batch)
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stage_ids())
            .finish()
    }
}

impl CompiledStage {
    async fn apply(
        &self,
        batch: Vec<Document>,
        scope: EvalScope<'_>,
    ) -> Result<Vec<Document>, OperatorFailure> {
        match &self.op {
            CompiledOperator::Match(predicate) => {
                let mut out = Vec::with_capacity(batch.len());
                for (index, doc) in batch.into_iter().enumerate() {
                    if predicate
                        .matches(&doc)
                        .map_err(|kind| OperatorFailure::at(index, kind))?
                    {
                        out.push(doc);
                    }
                }
                Ok(out)
            }
            CompiledOperator::Set(set) => set.apply(batch, scope).await,
            CompiledOperator::Project(project) => project.apply(batch),
            CompiledOperator::Unset(unset) => Ok(unset.apply(batch)),
            CompiledOperator::Unwind(unwind) => Ok(unwind.apply(batch)),
            CompiledOperator::Group(group) => group.apply(batch),
            CompiledOperator::Sort(sort) => Ok(sort.apply(batch)),
            CompiledOperator::Limit(limit) => Ok(limit.apply(batch)),
            CompiledOperator::Skip(skip) => Ok(skip.apply(batch)),
            CompiledOperator::Count(count) => Ok(count.apply(batch)),
            CompiledOperator::HttpCall { call, target } => {
                let mut out = Vec::with_capacity(batch.len());
                for (index, mut doc) in batch.into_iter().enumerate() {
                    let response = call
                        .call(&doc, scope.cancel, scope.policy, scope.counters)
                        .await
                        .map_err(|e| OperatorFailure::at(index, EvaluationErrorKind::Enrichment(e)))?;
                    doc.set_path(target, response);
                    out.push(doc);
                }
                Ok(out)
            }
            CompiledOperator::Custom { handler, spec } => {
                handler.apply(spec, batch).map_err(OperatorFailure::batch)
            }
        }
    }
}

fn compile_stage(stage: &Stage, env: &PipelineEnv) -> Result<CompiledOperator, ConfigurationError> {
    let spec = stage.spec();
    Ok(match stage.operator() {
        "match" => CompiledOperator::Match(Predicate::compile(spec)?),
        op @ ("set" | "addFields") => CompiledOperator::Set(SetOperator::compile(op, spec, &env.circuits)?),
        "project" => CompiledOperator::Project(ProjectOperator::compile(spec)?),
        "unset" => CompiledOperator::Unset(UnsetOperator::compile(spec)?),
        "unwind" => CompiledOperator::Unwind(UnwindOperator::compile(spec)?),
        "group" => CompiledOperator::Group(GroupOperator::compile(spec)?),
        "sort" => CompiledOperator::Sort(SortOperator::compile(spec)?),
        "limit" => CompiledOperator::Limit(LimitOperator::compile(spec)?),
        "skip" => CompiledOperator::Skip(SkipOperator::compile(spec)?),
        "count" => CompiledOperator::Count(CountOperator::compile(spec)?),
        "httpCall" => {
            let call = HttpCallOperator::compile(spec, &env.circuits)?;
            let target = call.target().unwrap_or(DEFAULT_TARGET).to_string();
            if target.is_empty() || target.starts_with('$') || target.split('.').any(str::is_empty) {
                return Err(ConfigurationError::invalid_stage(
                    "httpCall",
                    format!("invalid target '{target}'"),
                ));
            }
            CompiledOperator::HttpCall {
                call: Box::new(call),
                target,
            }
        }
        other => {
            let handler = env
                .operators
                .get(other)
                .ok_or_else(|| ConfigurationError::unknown_operator(other))?;
            handler.validate(spec)?;
            CompiledOperator::Custom {
                handler,
                spec: spec.clone(),
            }
        }
    })
}

// ---------------------------------------------------------------------------
// One-shot evaluation
// ---------------------------------------------------------------------------

/// Evaluates an in-memory document list as a single batch.
///
/// Runs fail-fast with no retries; use
/// [`StreamingExecutor`](crate::streaming::StreamingExecutor) for streams.
#[derive(Debug, Clone, Default)]
pub struct PipelineExecutor {
    env: PipelineEnv,
}

impl PipelineExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_env(env: PipelineEnv) -> Self {
        Self { env }
    }

    #[must_use]
    pub fn env(&self) -> &PipelineEnv {
        &self.env
    }

    /// Compile `stages` and apply them to `input`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Configuration`] if the stages do not compile
    /// and [`PipelineError::Evaluation`] on the first document failure.
    pub async fn run(
        &self,
        input: Vec<Document>,
        stages: &[Stage],
        metadata: Document,
    ) -> Result<Vec<Document>, PipelineError> {
        let pipeline = Pipeline::compile(stages, &self.env)?;
        let ctx = StreamingContext::builder("one-shot").metadata(metadata).build();
        ctx.advance_state(RunState::Running);
        let result = pipeline
            .evaluate(input, &ctx, &StreamingErrorPolicy::fail_fast())
            .await;
        ctx.advance_state(if result.is_ok() {
            RunState::Stopped
        } else {
            RunState::Aborted
        });
        Ok(result?)
    }
}

#[cfg(test)]
mod tests {
    use fluxion_types::{documents_from_json_array, stages_from_json_array};
    use serde_json::json;

    use super::*;

    fn stages(value: serde_json::Value) -> Vec<Stage> {
        stages_from_json_array(&value.to_string()).unwrap()
    }

    fn docs(value: serde_json::Value) -> Vec<Document> {
        documents_from_json_array(&value.to_string()).unwrap()
    }

    fn to_json(batch: &[Document]) -> Vec<serde_json::Value> {
        batch.iter().map(Document::to_json).collect()
    }

    #[tokio::test]
    async fn orders_pipeline_end_to_end() {
        let pipeline = stages(json!([
            {"$match": {"status": {"$in": ["PAID", "SHIPPED"]}}},
            {"$set": {"total": {"$multiply": ["$price", "$qty"]}}},
            {"$match": {"status": "PAID"}},
            {"$group": {"_id": "$status", "count": {"$sum": 1}, "totalRevenue": {"$sum": "$total"}}}
        ]));
        let input = docs(json!([
            {"orderId": 1, "status": "PAID", "price": 100.0, "qty": 1},
            {"orderId": 2, "status": "PENDING", "price": 5.0, "qty": 3},
            {"orderId": 3, "status": "PAID", "price": 39.5, "qty": 3},
            {"orderId": 4, "status": "SHIPPED", "price": 12.0, "qty": 1}
        ]));
        let out = PipelineExecutor::new()
            .run(input, &pipeline, Document::new())
            .await
            .unwrap();
        assert_eq!(
            to_json(&out),
            vec![json!({"_id": "PAID", "count": 2, "totalRevenue": 218.5})]
        );
    }

    #[tokio::test]
    async fn records_stage_metrics() {
        let pipeline = Pipeline::compile(
            &stages(json!([{"match": {"keep": true}}, {"$project": {"keep": 0}}])),
            &PipelineEnv::default(),
        )
        .unwrap();
        let ctx = StreamingContext::new("metrics");
        let out = pipeline
            .evaluate(
                docs(json!([{"keep": true}, {"keep": false}, {"keep": true}])),
                &ctx,
                &StreamingErrorPolicy::fail_fast(),
            )
            .await
            .unwrap();
        assert_eq!(out.len(), 2);

        let snapshot = ctx.metrics().snapshot();
        let matched = snapshot.stage("0:match").unwrap();
        assert_eq!((matched.documents_in, matched.documents_out), (3, 2));
        let projected = snapshot.stage("1:project").unwrap();
        assert_eq!((projected.documents_in, projected.documents_out), (2, 2));
        assert_eq!(snapshot.total_errors(), 0);
    }

    #[tokio::test]
    async fn failure_names_stage_and_document() {
        let pipeline = Pipeline::compile(
            &stages(json!([
                {"$match": {}},
                {"$set": {"ratio": {"$divide": ["$a", "$b"]}}}
            ])),
            &PipelineEnv::default(),
        )
        .unwrap();
        let ctx = StreamingContext::new("failure");
        let err = pipeline
            .evaluate(
                docs(json!([{"a": 1, "b": 2}, {"a": 1, "b": 0}])),
                &ctx,
                &StreamingErrorPolicy::fail_fast(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.stage_index, 1);
        assert_eq!(err.operator, "set");
        assert_eq!(err.document_index, Some(1));
        assert_eq!(ctx.metrics().snapshot().stage("1:set").unwrap().errors, 1);
    }

    #[test]
    fn unknown_operator_is_rejected_at_compile_time() {
        let err = Pipeline::compile(
            &stages(json!([{"$match": {}}, {"$lookup": {"from": "x"}}])),
            &PipelineEnv::default(),
        )
        .unwrap_err();
        assert_eq!(err.code, "UNKNOWN_OPERATOR");
        assert_eq!(err.stage_index, Some(1));
    }

    #[test]
    fn invalid_expression_reports_stage() {
        let err = Pipeline::compile(
            &stages(json!([{"$set": {"x": {"$frobnicate": 1}}}])),
            &PipelineEnv::default(),
        )
        .unwrap_err();
        assert_eq!(err.stage_index, Some(0));
    }

    struct Stamp;

    impl StageOperator for Stamp {
        fn validate(&self, spec: &Value) -> Result<(), ConfigurationError> {
            if spec.as_str().is_some() {
                Ok(())
            } else {
                Err(ConfigurationError::invalid_stage("stamp", "expected a string"))
            }
        }

        fn apply(&self, spec: &Value, batch: Vec<Document>) -> Result<Vec<Document>, EvaluationErrorKind> {
            if batch.iter().any(|d| d.contains_key("poison")) {
                return Err(EvaluationErrorKind::Custom("poisoned batch".into()));
            }
            Ok(batch
                .into_iter()
                .map(|mut doc| {
                    doc.insert("stamp", spec.clone());
                    doc
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn custom_operators_come_from_the_registry() {
        let mut operators = OperatorRegistry::new();
        operators.register("stamp", Arc::new(Stamp)).unwrap();
        let executor = PipelineExecutor::with_env(PipelineEnv::new(operators));

        let out = executor
            .run(docs(json!([{"a": 1}])), &stages(json!([{"$stamp": "v1"}])), Document::new())
            .await
            .unwrap();
        assert_eq!(to_json(&out), vec![json!({"a": 1, "stamp": "v1"})]);

        let err = executor
            .run(docs(json!([{"a": 1}])), &stages(json!([{"$stamp": 3}])), Document::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));

        let err = executor
            .run(docs(json!([{"poison": 1}])), &stages(json!([{"$stamp": "v1"}])), Document::new())
            .await
            .unwrap_err();
        let PipelineError::Evaluation(err) = err else {
            panic!("expected an evaluation error, got {err:?}");
        };
        assert_eq!(err.document_index, None);
    }

    #[tokio::test]
    async fn stateless_stages_preserve_order() {
        let pipeline = stages(json!([
            {"$addFields": {"double": {"$multiply": ["$n", 2]}}},
            {"$unset": "n"}
        ]));
        let out = PipelineExecutor::new()
            .run(docs(json!([{"n": 3}, {"n": 1}, {"n": 2}])), &pipeline, Document::new())
            .await
            .unwrap();
        assert_eq!(
            to_json(&out),
            vec![json!({"double": 6}), json!({"double": 2}), json!({"double": 4})]
        );
    }
}
