use super::batch::BatchProgress;
use super::context::ExecutionContext;
use super::dag::DependencyGraph;
use super::input::InputCollector;
use crate::analytics::{Analytics, StepCompletion, StepStart};
use crate::error::{Result, WorkflowError};
use crate::registry::StepRegistry;
use crate::step::{Step, StepOutput};
use crate::types::{ExecutionId, Payload, StepDeclaration, StepStatus};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::timeout;

/// Input key holding the item list of a batch-capable step
pub const BATCH_ITEMS_KEY: &str = "items";

/// Key a batch invocation may use to report partial success
pub const SUCCESSFUL_COUNT_KEY: &str = "successful_count";

/// A step whose dependencies are satisfied and whose input and implementation
/// are resolved. Holds no reference to the execution context, so several can
/// be invoked at once.
pub struct PreparedStep<'a> {
    pub step: &'a StepDeclaration,
    pub input: Payload,
    implementation: Arc<dyn Step>,
}

/// Runs single steps against an execution context
pub struct StepExecutor {
    registry: Arc<StepRegistry>,
    analytics: Arc<dyn Analytics>,
    collector: InputCollector,
    enforce_timeouts: bool,
}

impl StepExecutor {
    pub fn new(registry: Arc<StepRegistry>, analytics: Arc<dyn Analytics>) -> Self {
        Self {
            registry,
            analytics,
            collector: InputCollector::new(),
            enforce_timeouts: true,
        }
    }

    pub fn with_input_collector(mut self, collector: InputCollector) -> Self {
        self.collector = collector;
        self
    }

    pub fn with_timeouts(mut self, enforce_timeouts: bool) -> Self {
        self.enforce_timeouts = enforce_timeouts;
        self
    }

    /// Check readiness, collect the input and pick the implementation
    pub fn prepare<'a>(
        &self,
        ctx: &ExecutionContext,
        graph: &DependencyGraph,
        step: &'a StepDeclaration,
    ) -> Result<PreparedStep<'a>> {
        if !ctx.dependencies_satisfied(graph, &step.step_id) {
            return Err(WorkflowError::DependencyNotSatisfied {
                step_id: step.step_id.clone(),
                missing: graph.missing_dependencies(&step.step_id, ctx.completed_steps()),
            });
        }

        let input = self.collector.collect(ctx, graph, step)?;

        let implementation = self.registry.resolve(&step.step_type, step).ok_or_else(|| {
            WorkflowError::UnknownStepType {
                step_id: step.step_id.clone(),
                step_type: step.step_type.clone(),
            }
        })?;

        Ok(PreparedStep {
            step,
            input,
            implementation,
        })
    }

    /// Invoke a prepared step, enforcing its timeout and reporting telemetry
    pub async fn invoke(
        &self,
        execution_id: ExecutionId,
        prepared: PreparedStep<'_>,
    ) -> Result<StepOutput> {
        let step = prepared.step;
        tracing::info!(
            "Executing step {} ({}) for execution {}",
            step.step_id,
            step.step_type,
            execution_id
        );

        let step_ref = self.track_start(execution_id, step, &prepared.input).await;
        let start = Instant::now();

        // Execute with timeout if configured
        let result = match step.timeout().filter(|_| self.enforce_timeouts) {
            Some(limit) => match timeout(limit, self.run(execution_id, prepared)).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!("Step {} timed out", step.step_id);
                    Err(WorkflowError::StepTimeout {
                        step_id: step.step_id.clone(),
                        timeout_secs: limit.as_secs(),
                    })
                }
            },
            None => self.run(execution_id, prepared).await,
        };

        let completion = StepCompletion {
            status: if result.is_ok() {
                StepStatus::Completed
            } else {
                StepStatus::Failed
            },
            output: result.as_ref().ok().map(|output| output.data.clone()),
            error: result.as_ref().err().map(ToString::to_string),
            duration_ms: start.elapsed().as_millis() as u64,
        };
        self.track_completion(execution_id, step, &step_ref, &completion)
            .await;

        result
    }

    /// Record an invocation outcome into the context.
    ///
    /// Failures are stored with the step's rollback descriptor and handed back.
    pub fn record(
        &self,
        ctx: &mut ExecutionContext,
        step: &StepDeclaration,
        outcome: Result<StepOutput>,
    ) -> Result<()> {
        match outcome {
            Ok(output) => {
                ctx.mark_completed(&step.step_id, output.data);
                if let Some(rollback) = &step.rollback {
                    let mut rollback = rollback.clone();
                    if let Some(extra) = output.rollback_data {
                        rollback.parameters.extend(extra);
                    }
                    ctx.register_rollback(&step.step_id, rollback);
                }
                tracing::info!("Step {} completed", step.step_id);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Step {} failed: {}", step.step_id, e);
                ctx.mark_failed(&step.step_id, e.to_string(), step.rollback.clone());
                Err(e)
            }
        }
    }

    /// Prepare, invoke and record one step
    pub async fn execute_step(
        &self,
        ctx: &mut ExecutionContext,
        graph: &DependencyGraph,
        step: &StepDeclaration,
    ) -> Result<()> {
        let outcome = match self.prepare(ctx, graph, step) {
            Ok(prepared) => self.invoke(ctx.execution_id(), prepared).await,
            Err(e) => {
                self.report_unprepared(ctx.execution_id(), step, &e).await;
                Err(e)
            }
        };
        self.record(ctx, step, outcome)
    }

    /// Failure telemetry for a step rejected before its implementation ran
    pub async fn report_unprepared(
        &self,
        execution_id: ExecutionId,
        step: &StepDeclaration,
        error: &WorkflowError,
    ) {
        let step_ref = self.track_start(execution_id, step, &Payload::new()).await;
        let completion = StepCompletion {
            status: StepStatus::Failed,
            output: None,
            error: Some(error.to_string()),
            duration_ms: 0,
        };
        self.track_completion(execution_id, step, &step_ref, &completion)
            .await;
    }

    async fn track_start(
        &self,
        execution_id: ExecutionId,
        step: &StepDeclaration,
        input: &Payload,
    ) -> String {
        let mut metadata = Payload::new();
        if let Some(batch_size) = step.batch_size {
            metadata.insert("batch_size".into(), batch_size.into());
        }
        let start = StepStart {
            execution_id,
            step_id: step.step_id.clone(),
            step_type: step.step_type.clone(),
            step_name: step.name.clone(),
            input: input.clone(),
            metadata,
        };

        match self.analytics.track_step_start(&start).await {
            Ok(step_ref) => step_ref,
            Err(e) => {
                tracing::warn!("Failed to report start of step {}: {:#}", step.step_id, e);
                step.step_id.to_string()
            }
        }
    }

    async fn track_completion(
        &self,
        execution_id: ExecutionId,
        step: &StepDeclaration,
        step_ref: &str,
        completion: &StepCompletion,
    ) {
        if let Err(e) = self
            .analytics
            .complete_step(execution_id, step_ref, completion)
            .await
        {
            tracing::warn!("Failed to report completion of step {}: {:#}", step.step_id, e);
        }
    }

    async fn run(&self, execution_id: ExecutionId, prepared: PreparedStep<'_>) -> Result<StepOutput> {
        let PreparedStep {
            step,
            mut input,
            implementation,
        } = prepared;

        // Batch fan-out only applies when the input actually carries a list
        if let Some(batch_size) = step.batch_size {
            match input.remove(BATCH_ITEMS_KEY) {
                Some(Value::Array(items)) => {
                    return Ok(run_batches(
                        implementation.as_ref(),
                        execution_id,
                        step,
                        input,
                        items,
                        batch_size,
                    )
                    .await);
                }
                Some(other) => {
                    input.insert(BATCH_ITEMS_KEY.into(), other);
                }
                None => {}
            }
        }

        let output = implementation
            .execute(execution_id, step, input)
            .await
            .map_err(|e| WorkflowError::StepFailed {
                step_id: step.step_id.clone(),
                message: format!("{e:#}"),
            })?;

        if output.is_completed() {
            Ok(output)
        } else {
            Err(WorkflowError::StepFailed {
                step_id: step.step_id.clone(),
                message: output
                    .error
                    .unwrap_or_else(|| "step reported failure".to_string()),
            })
        }
    }
}

/// Invoke the implementation once per batch, tolerating failed batches
async fn run_batches(
    implementation: &dyn Step,
    execution_id: ExecutionId,
    step: &StepDeclaration,
    base_input: Payload,
    items: Vec<Value>,
    batch_size: usize,
) -> StepOutput {
    let batch_size = batch_size.max(1);
    let mut progress = BatchProgress::new(items.len(), batch_size);
    let mut results = Vec::with_capacity(progress.total_batches);

    for batch in items.chunks(batch_size) {
        progress.begin_batch();
        let mut input = base_input.clone();
        input.insert(BATCH_ITEMS_KEY.into(), Value::Array(batch.to_vec()));

        match implementation.execute(execution_id, step, input).await {
            Ok(output) if output.is_completed() => {
                let successful = output
                    .data
                    .get(SUCCESSFUL_COUNT_KEY)
                    .and_then(Value::as_u64)
                    .map_or(batch.len(), |n| n as usize);
                progress.record_success(batch.len(), successful);
                results.push(output.data);
            }
            Ok(output) => {
                let error = output.error.unwrap_or_else(|| "batch reported failure".into());
                record_batch_failure(&mut progress, &mut results, step, batch.len(), error);
            }
            Err(e) => {
                record_batch_failure(&mut progress, &mut results, step, batch.len(), format!("{e:#}"));
            }
        }

        tracing::debug!(
            "Step {} batch progress: {:.1}%",
            step.step_id,
            progress.progress_percentage()
        );
    }

    let data = serde_json::json!({
        "results": results,
        "summary": progress.summary(),
    });
    let mut output = StepOutput::completed(data);
    output.progress = Some(progress);
    output
}

/// Count a failed batch and keep its reason in the results
fn record_batch_failure(
    progress: &mut BatchProgress,
    results: &mut Vec<Value>,
    step: &StepDeclaration,
    batch_len: usize,
    error: String,
) {
    tracing::warn!(
        "Batch {}/{} of step {} failed: {}",
        progress.current_batch,
        progress.total_batches,
        step.step_id,
        error
    );
    progress.record_failure(batch_len);
    results.push(serde_json::json!({
        "error": error,
        "failed_count": batch_len,
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::InMemoryAnalytics;
    use crate::step::FnStep;
    use crate::types::StepId;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn payload(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn executor(registry: StepRegistry) -> StepExecutor {
        StepExecutor::new(Arc::new(registry), Arc::new(InMemoryAnalytics::new()))
    }

    fn echo() -> Arc<dyn Step> {
        Arc::new(FnStep::new(|_config: Payload, input: Payload| async move {
            Ok::<_, anyhow::Error>(StepOutput::completed(Value::Object(input)))
        }))
    }

    #[tokio::test]
    async fn test_execute_step_records_output() {
        let mut registry = StepRegistry::new();
        registry.register("data_input", echo());
        let executor = executor(registry);

        let steps = vec![StepDeclaration::new("load", "data_input")];
        let graph = DependencyGraph::build(&steps).unwrap();
        let mut ctx = ExecutionContext::new(ExecutionId::new(), payload(json!({"text": "hi"})));

        executor.execute_step(&mut ctx, &graph, &steps[0]).await.unwrap();

        assert_eq!(
            ctx.step_output(&StepId::new("load")),
            Some(&json!({"text": "hi"}))
        );
    }

    #[tokio::test]
    async fn test_unready_step_fails_fast() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut registry = StepRegistry::new();
        registry.register(
            "transformation",
            Arc::new(FnStep::new(move |_config: Payload, _input: Payload| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, anyhow::Error>(StepOutput::completed(json!(null))) }
            })),
        );
        let executor = executor(registry);

        let steps = vec![
            StepDeclaration::new("a", "transformation"),
            StepDeclaration::new("b", "transformation").depends_on(["a"]),
        ];
        let graph = DependencyGraph::build(&steps).unwrap();
        let mut ctx = ExecutionContext::new(ExecutionId::new(), Payload::new());

        let result = executor.execute_step(&mut ctx, &graph, &steps[1]).await;
        match result {
            Err(WorkflowError::DependencyNotSatisfied { missing, .. }) => {
                assert_eq!(missing, vec![StepId::new("a")]);
            }
            other => panic!("expected dependency error, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(ctx.is_failed(&StepId::new("b")));
    }

    async fn traced_execution(analytics: &InMemoryAnalytics) -> ExecutionId {
        let execution_id = ExecutionId::new();
        analytics
            .create_execution(&crate::analytics::ExecutionStart {
                execution_id,
                workflow_id: "wf".into(),
                workflow_name: "wf".into(),
                session_id: None,
                user_id: None,
                trigger: Payload::new(),
            })
            .await
            .unwrap();
        execution_id
    }

    #[tokio::test]
    async fn test_unknown_step_type_fails() {
        let analytics = Arc::new(InMemoryAnalytics::new());
        let executor = StepExecutor::new(Arc::new(StepRegistry::new()), analytics.clone());
        let execution_id = traced_execution(&analytics).await;

        let steps = vec![StepDeclaration::new("x", "ocr")];
        let graph = DependencyGraph::build(&steps).unwrap();
        let mut ctx = ExecutionContext::new(execution_id, Payload::new());

        let result = executor.execute_step(&mut ctx, &graph, &steps[0]).await;
        assert!(matches!(result, Err(WorkflowError::UnknownStepType { .. })));

        let trace = analytics.get_trace(execution_id).await.unwrap();
        assert_eq!(trace.steps.len(), 1);
        assert_eq!(trace.steps[0].status, Some(StepStatus::Failed));
        assert!(trace.steps[0]
            .error
            .as_deref()
            .is_some_and(|e| e.contains("step type 'ocr'")));
    }

    #[tokio::test]
    async fn test_strict_input_failure_is_reported() {
        let analytics = Arc::new(InMemoryAnalytics::new());
        let mut registry = StepRegistry::new();
        registry.register("transformation", echo());
        let executor = StepExecutor::new(Arc::new(registry), analytics.clone())
            .with_input_collector(InputCollector::strict());
        let execution_id = traced_execution(&analytics).await;

        let steps = vec![
            StepDeclaration::new("a", "transformation"),
            StepDeclaration::new("b", "transformation").map_input("text", "a.text"),
        ];
        let graph = DependencyGraph::build(&steps).unwrap();
        let mut ctx = ExecutionContext::new(execution_id, Payload::new());

        let result = executor.execute_step(&mut ctx, &graph, &steps[1]).await;
        assert!(matches!(result, Err(WorkflowError::InputResolution { .. })));

        let trace = analytics.get_trace(execution_id).await.unwrap();
        assert_eq!(trace.steps[0].step_id, StepId::new("b"));
        assert_eq!(trace.steps[0].status, Some(StepStatus::Failed));
        let stats = analytics.get_step_stats(&StepId::new("b")).await.unwrap();
        assert_eq!(stats.failure_count, 1);
    }

    #[tokio::test]
    async fn test_failure_keeps_message_and_rollback_descriptor() {
        let mut registry = StepRegistry::new();
        registry.register(
            "data_output",
            Arc::new(FnStep::new(|_config: Payload, _input: Payload| async {
                Err::<StepOutput, _>(anyhow::anyhow!("disk full"))
            })),
        );
        let executor = executor(registry);

        let steps = vec![StepDeclaration::new("save", "data_output").with_rollback("log", Payload::new())];
        let graph = DependencyGraph::build(&steps).unwrap();
        let mut ctx = ExecutionContext::new(ExecutionId::new(), Payload::new());

        let err = executor
            .execute_step(&mut ctx, &graph, &steps[0])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Step 'save' failed: disk full");

        let save = StepId::new("save");
        assert!(ctx.is_failed(&save));
        assert!(ctx.step_output(&save).is_none());
        assert_eq!(ctx.rollback_descriptor(&save).unwrap().rollback_type, "log");
    }

    #[tokio::test]
    async fn test_reported_failure_status_is_a_failure() {
        let mut registry = StepRegistry::new();
        registry.register(
            "validation",
            Arc::new(FnStep::new(|_config: Payload, _input: Payload| async {
                Ok::<_, anyhow::Error>(StepOutput::failed("missing field: text"))
            })),
        );
        let executor = executor(registry);

        let steps = vec![StepDeclaration::new("check", "validation")];
        let graph = DependencyGraph::build(&steps).unwrap();
        let mut ctx = ExecutionContext::new(ExecutionId::new(), Payload::new());

        let err = executor
            .execute_step(&mut ctx, &graph, &steps[0])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Step 'check' failed: missing field: text");
    }

    #[tokio::test]
    async fn test_rollback_data_is_merged_into_descriptor() {
        let mut registry = StepRegistry::new();
        registry.register(
            "data_output",
            Arc::new(FnStep::new(|_config: Payload, _input: Payload| async {
                Ok::<_, anyhow::Error>(
                    StepOutput::completed(json!({"rows": 3}))
                        .with_rollback_data(payload(json!({"row_ids": [1, 2, 3]}))),
                )
            })),
        );
        let executor = executor(registry);

        let steps = vec![StepDeclaration::new("save", "data_output")
            .with_rollback("delete_rows", payload(json!({"table": "docs"})))];
        let graph = DependencyGraph::build(&steps).unwrap();
        let mut ctx = ExecutionContext::new(ExecutionId::new(), Payload::new());

        executor.execute_step(&mut ctx, &graph, &steps[0]).await.unwrap();

        let rollback = ctx.rollback_descriptor(&StepId::new("save")).unwrap();
        assert_eq!(
            Value::Object(rollback.parameters.clone()),
            json!({"table": "docs", "row_ids": [1, 2, 3]})
        );
    }

    #[tokio::test]
    async fn test_batch_failure_is_tolerated() {
        let mut registry = StepRegistry::new();
        registry.register(
            "batch_processing",
            Arc::new(FnStep::new(|_config: Payload, input: Payload| async move {
                let items = input[BATCH_ITEMS_KEY].as_array().cloned().unwrap_or_default();
                if items.contains(&json!(3)) {
                    anyhow::bail!("bad batch");
                }
                Ok(StepOutput::completed(json!({ "processed": items })))
            })),
        );
        let executor = executor(registry);

        let steps = vec![StepDeclaration::new("batch", "batch_processing").with_batch_size(2)];
        let graph = DependencyGraph::build(&steps).unwrap();
        let mut ctx = ExecutionContext::new(
            ExecutionId::new(),
            payload(json!({"items": [1, 2, 3, 4, 5, 6]})),
        );

        executor.execute_step(&mut ctx, &graph, &steps[0]).await.unwrap();

        let output = ctx.step_output(&StepId::new("batch")).unwrap();
        assert_eq!(
            output["summary"],
            json!({
                "total_items": 6,
                "processed_items": 6,
                "successful_items": 4,
                "failed_items": 2,
                "total_batches": 3,
            })
        );
        assert_eq!(
            output["results"],
            json!([
                {"processed": [1, 2]},
                {"error": "bad batch", "failed_count": 2},
                {"processed": [5, 6]},
            ])
        );
    }

    #[tokio::test]
    async fn test_batch_partial_success_count() {
        let mut registry = StepRegistry::new();
        registry.register(
            "batch_processing",
            Arc::new(FnStep::new(|_config: Payload, _input: Payload| async {
                Ok::<_, anyhow::Error>(StepOutput::completed(json!({"successful_count": 1})))
            })),
        );
        let executor = executor(registry);

        let steps = vec![StepDeclaration::new("batch", "batch_processing").with_batch_size(3)];
        let graph = DependencyGraph::build(&steps).unwrap();
        let mut ctx =
            ExecutionContext::new(ExecutionId::new(), payload(json!({"items": [1, 2, 3]})));

        executor.execute_step(&mut ctx, &graph, &steps[0]).await.unwrap();

        let summary = &ctx.step_output(&StepId::new("batch")).unwrap()["summary"];
        assert_eq!(summary["successful_items"], json!(1));
        assert_eq!(summary["failed_items"], json!(2));
    }

    #[tokio::test]
    async fn test_batch_reported_failures_keep_reason() {
        let mut registry = StepRegistry::new();
        registry.register(
            "batch_processing",
            Arc::new(FnStep::new(|_config: Payload, _input: Payload| async {
                Ok::<_, anyhow::Error>(StepOutput::failed("quota exceeded"))
            })),
        );
        let executor = executor(registry);

        let steps = vec![StepDeclaration::new("batch", "batch_processing").with_batch_size(2)];
        let graph = DependencyGraph::build(&steps).unwrap();
        let mut ctx =
            ExecutionContext::new(ExecutionId::new(), payload(json!({"items": [1, 2, 3]})));

        executor.execute_step(&mut ctx, &graph, &steps[0]).await.unwrap();

        let output = ctx.step_output(&StepId::new("batch")).unwrap();
        assert_eq!(
            output["results"],
            json!([
                {"error": "quota exceeded", "failed_count": 2},
                {"error": "quota exceeded", "failed_count": 1},
            ])
        );
        assert_eq!(output["summary"]["failed_items"], json!(3));
        assert_eq!(output["summary"]["successful_items"], json!(0));
    }

    #[tokio::test]
    async fn test_batch_size_without_items_runs_once() {
        let mut registry = StepRegistry::new();
        registry.register("batch_processing", echo());
        let executor = executor(registry);

        let steps = vec![StepDeclaration::new("batch", "batch_processing").with_batch_size(2)];
        let graph = DependencyGraph::build(&steps).unwrap();
        let mut ctx = ExecutionContext::new(ExecutionId::new(), payload(json!({"items": "nope"})));

        executor.execute_step(&mut ctx, &graph, &steps[0]).await.unwrap();
        assert_eq!(
            ctx.step_output(&StepId::new("batch")),
            Some(&json!({"items": "nope"}))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_a_step_failure() {
        let mut registry = StepRegistry::new();
        registry.register(
            "tool_execution",
            Arc::new(FnStep::new(|_config: Payload, _input: Payload| async {
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                Ok::<_, anyhow::Error>(StepOutput::completed(json!(null)))
            })),
        );
        let executor = executor(registry);

        let steps = vec![StepDeclaration::new("slow", "tool_execution").with_timeout(1)];
        let graph = DependencyGraph::build(&steps).unwrap();
        let mut ctx = ExecutionContext::new(ExecutionId::new(), Payload::new());

        let result = executor.execute_step(&mut ctx, &graph, &steps[0]).await;
        assert!(matches!(
            result,
            Err(WorkflowError::StepTimeout { timeout_secs: 1, .. })
        ));
        assert!(ctx.is_failed(&StepId::new("slow")));
    }

    #[tokio::test]
    async fn test_step_telemetry_is_reported() {
        let analytics = Arc::new(InMemoryAnalytics::new());
        let mut registry = StepRegistry::new();
        registry.register("data_input", echo());
        let executor = StepExecutor::new(Arc::new(registry), analytics.clone());

        let execution_id = traced_execution(&analytics).await;

        let steps = vec![StepDeclaration::new("load", "data_input")];
        let graph = DependencyGraph::build(&steps).unwrap();
        let mut ctx = ExecutionContext::new(execution_id, payload(json!({"q": 1})));
        executor.execute_step(&mut ctx, &graph, &steps[0]).await.unwrap();

        let trace = analytics.get_trace(execution_id).await.unwrap();
        assert_eq!(trace.steps.len(), 1);
        assert_eq!(trace.steps[0].input, payload(json!({"q": 1})));
        assert_eq!(trace.steps[0].status, Some(StepStatus::Completed));
        assert_eq!(trace.steps[0].output, Some(json!({"q": 1})));
    }
}
