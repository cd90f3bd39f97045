use super::context::ExecutionContext;
use super::dag::DependencyGraph;
use super::input::InputCollector;
use super::prepare::expand_prev;
use super::rollback::{RollbackCoordinator, RollbackReport};
use super::step_executor::StepExecutor;
use super::validate::{validate_workflow, ValidationReport};
use crate::analytics::{Analytics, ExecutionStart, ExecutionUpdate};
use crate::config::EngineConfig;
use crate::error::{Result, WorkflowError};
use crate::registry::StepRegistry;
use crate::storage::RunLog;
use crate::types::{
    ExecutionId, ExecutionPattern, RunRecord, RunRequest, RunStatus, StepDeclaration,
    WorkflowConfig,
};
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::sync::Arc;

/// Workflow executor that schedules steps according to the execution pattern
pub struct WorkflowExecutor {
    registry: Arc<StepRegistry>,
    analytics: Arc<dyn Analytics>,
    step_executor: StepExecutor,
    rollback: RollbackCoordinator,
    run_log: Option<Arc<dyn RunLog>>,
    config: EngineConfig,
}

impl WorkflowExecutor {
    pub fn new(
        registry: Arc<StepRegistry>,
        analytics: Arc<dyn Analytics>,
        config: EngineConfig,
    ) -> Self {
        let step_executor = StepExecutor::new(registry.clone(), analytics.clone())
            .with_input_collector(InputCollector::with_strict(config.input.strict_mapping))
            .with_timeouts(config.execution.enforce_timeouts);
        let rollback = RollbackCoordinator::new(registry.clone());

        Self {
            registry,
            analytics,
            step_executor,
            rollback,
            run_log: None,
            config,
        }
    }

    /// Append every terminal run record to the given log
    pub fn with_run_log(mut self, run_log: Arc<dyn RunLog>) -> Self {
        self.run_log = Some(run_log);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Expand `$prev` and validate without running anything
    pub fn validate(&self, workflow: &WorkflowConfig) -> Result<ValidationReport> {
        let workflow = expand_prev(workflow)?;
        Ok(validate_workflow(&workflow, &self.registry))
    }

    /// Execute a workflow and return its terminal record.
    ///
    /// Configuration errors are returned before the run starts. Failures
    /// during the run produce a record with `status = failed`.
    pub async fn execute(&self, workflow: &WorkflowConfig, request: RunRequest) -> Result<RunRecord> {
        let workflow = expand_prev(workflow)?;
        let warnings = validate_workflow(&workflow, &self.registry).into_result()?;
        for warning in &warnings {
            tracing::warn!("Workflow {}: {}", workflow.workflow_id, warning);
        }
        let graph = DependencyGraph::build(&workflow.steps)?;

        let execution_id = ExecutionId::new();
        let started_at = chrono::Utc::now();

        tracing::info!(
            "Starting workflow execution: workflow_id={}, execution_id={}",
            workflow.workflow_id,
            execution_id
        );

        self.report(
            self.analytics.create_execution(&ExecutionStart {
                execution_id,
                workflow_id: workflow.workflow_id.clone(),
                workflow_name: workflow.workflow_name.clone(),
                session_id: request.session_id.clone(),
                user_id: request.user_id.clone(),
                trigger: request.trigger.clone(),
            }),
            "create execution",
        )
        .await;
        self.report(
            self.analytics.update_execution(&ExecutionUpdate {
                execution_id,
                status: RunStatus::Running,
                progress: Some(0.0),
                result: None,
                error: None,
            }),
            "mark execution running",
        )
        .await;

        let mut ctx = ExecutionContext::new(execution_id, request.trigger);

        let result = match workflow.execution_pattern {
            ExecutionPattern::Sequential => self.execute_sequential(&mut ctx, &graph, &workflow).await,
            ExecutionPattern::Parallel => self.execute_parallel(&mut ctx, &graph, &workflow).await,
            ExecutionPattern::Dag => self.execute_dag(&mut ctx, &graph, &workflow).await,
        };

        let completed_at = chrono::Utc::now();
        let progress = ctx.progress(workflow.steps.len());

        let (status, error, rollback) = match result {
            Ok(()) => {
                tracing::info!("Workflow execution completed: execution_id={}", execution_id);
                (RunStatus::Completed, None, None)
            }
            Err(e) => {
                tracing::error!(
                    "Workflow execution failed: execution_id={}, error={}",
                    execution_id,
                    e
                );
                let rollback = if self.config.execution.rollback_on_failure {
                    Some(self.rollback.rollback(&ctx).await)
                } else {
                    None
                };
                (RunStatus::Failed, Some(e.to_string()), rollback)
            }
        };

        let step_data = ctx.step_data_snapshot();
        self.report(
            self.analytics.update_execution(&ExecutionUpdate {
                execution_id,
                status,
                progress: Some(progress),
                result: (status == RunStatus::Completed)
                    .then(|| serde_json::to_value(&step_data).unwrap_or(Value::Null)),
                error: error.clone(),
            }),
            "finish execution",
        )
        .await;

        let record = RunRecord {
            execution_id,
            workflow_id: workflow.workflow_id.clone(),
            workflow_name: workflow.workflow_name.clone(),
            session_id: request.session_id,
            user_id: request.user_id,
            status,
            error,
            step_data,
            completed_steps: ctx.completion_order().to_vec(),
            failed_steps: ctx.failed_steps().to_vec(),
            step_errors: ctx
                .failed_steps()
                .iter()
                .filter_map(|id| ctx.step_error(id).map(|e| (id.clone(), e.to_string())))
                .collect(),
            progress,
            warnings,
            rollback: rollback.filter(|r: &RollbackReport| *r != RollbackReport::default()),
            started_at,
            completed_at: Some(completed_at),
            duration_ms: Some((completed_at - started_at).num_milliseconds().max(0) as u64),
        };

        if let Some(run_log) = &self.run_log {
            if let Err(e) = run_log.append(&record).await {
                tracing::warn!("Failed to persist run record {}: {:#}", execution_id, e);
            }
        }

        Ok(record)
    }

    /// Look up a terminal run record in the run log
    pub async fn get_run(&self, execution_id: ExecutionId) -> Result<Option<RunRecord>> {
        let Some(run_log) = &self.run_log else {
            return Ok(None);
        };
        run_log
            .get_run(execution_id)
            .await
            .map_err(|e| WorkflowError::Storage(format!("{e:#}")))
    }

    /// Declaration order; the first failure aborts the rest
    async fn execute_sequential(
        &self,
        ctx: &mut ExecutionContext,
        graph: &DependencyGraph,
        workflow: &WorkflowConfig,
    ) -> Result<()> {
        for step in &workflow.steps {
            self.run_step(ctx, graph, step).await?;
            self.report_progress(ctx, workflow.steps.len()).await;
        }
        Ok(())
    }

    /// Independent steps concurrently, then the dependent steps in declaration order
    async fn execute_parallel(
        &self,
        ctx: &mut ExecutionContext,
        graph: &DependencyGraph,
        workflow: &WorkflowConfig,
    ) -> Result<()> {
        let (independent, dependent): (Vec<&StepDeclaration>, Vec<&StepDeclaration>) = workflow
            .steps
            .iter()
            .partition(|s| s.dependencies.is_empty());

        tracing::debug!(
            "Parallel phase: {} independent steps, {} dependent steps",
            independent.len(),
            dependent.len()
        );

        self.run_concurrently(ctx, graph, &independent, workflow.steps.len())
            .await?;

        for step in dependent {
            self.run_step(ctx, graph, step).await?;
            self.report_progress(ctx, workflow.steps.len()).await;
        }
        Ok(())
    }

    /// Wavefront execution: run every ready step, then rescan
    async fn execute_dag(
        &self,
        ctx: &mut ExecutionContext,
        graph: &DependencyGraph,
        workflow: &WorkflowConfig,
    ) -> Result<()> {
        let total = workflow.steps.len();
        let mut pending: Vec<&StepDeclaration> = workflow.steps.iter().collect();

        while !pending.is_empty() {
            let (ready, blocked): (Vec<&StepDeclaration>, Vec<&StepDeclaration>) = pending
                .into_iter()
                .partition(|s| ctx.dependencies_satisfied(graph, &s.step_id));

            if ready.is_empty() {
                return Err(WorkflowError::CircularDependency {
                    steps: blocked.iter().map(|s| s.step_id.clone()).collect(),
                });
            }

            tracing::debug!(
                "DAG wave of {} ready steps, {} still blocked",
                ready.len(),
                blocked.len()
            );

            if self.config.execution.concurrent_waves {
                self.run_concurrently(ctx, graph, &ready, total).await?;
            } else {
                for step in ready {
                    self.step_executor.execute_step(ctx, graph, step).await?;
                    self.report_progress(ctx, total).await;
                }
            }

            pending = blocked;
        }
        Ok(())
    }

    /// Execute one step in order, reporting a stuck cycle as such
    async fn run_step(
        &self,
        ctx: &mut ExecutionContext,
        graph: &DependencyGraph,
        step: &StepDeclaration,
    ) -> Result<()> {
        if !ctx.dependencies_satisfied(graph, &step.step_id) {
            if let Some(cycle) = graph.cycle_containing(&step.step_id) {
                return Err(WorkflowError::CircularDependency { steps: cycle });
            }
        }
        self.step_executor.execute_step(ctx, graph, step).await
    }

    /// Fan out over `steps` and fan in. Siblings already in flight when one
    /// fails still finish and are recorded; the first error is returned.
    async fn run_concurrently(
        &self,
        ctx: &mut ExecutionContext,
        graph: &DependencyGraph,
        steps: &[&StepDeclaration],
        total: usize,
    ) -> Result<()> {
        let mut prepared = Vec::with_capacity(steps.len());
        for &step in steps {
            match self.step_executor.prepare(ctx, graph, step) {
                Ok(p) => prepared.push(p),
                Err(e) => {
                    self.step_executor
                        .report_unprepared(ctx.execution_id(), step, &e)
                        .await;
                    return self.step_executor.record(ctx, step, Err(e));
                }
            }
        }

        let execution_id = ctx.execution_id();
        let executor = &self.step_executor;
        let mut in_flight: FuturesUnordered<_> = prepared
            .into_iter()
            .map(|p| async move {
                let step = p.step;
                (step, executor.invoke(execution_id, p).await)
            })
            .collect();

        let mut first_error = None;
        while let Some((step, outcome)) = in_flight.next().await {
            if let Err(e) = self.step_executor.record(ctx, step, outcome) {
                first_error.get_or_insert(e);
            }
            self.report_progress(ctx, total).await;
        }

        first_error.map_or(Ok(()), Err)
    }

    async fn report_progress(&self, ctx: &ExecutionContext, total: usize) {
        let progress = ctx.progress(total);
        tracing::debug!(
            "Execution {} progress: {:.0}%",
            ctx.execution_id(),
            progress * 100.0
        );
        self.report(
            self.analytics
                .update_execution(&ExecutionUpdate::progress(ctx.execution_id(), progress)),
            "report progress",
        )
        .await;
    }

    /// Await a telemetry call, logging and dropping any error
    async fn report<F>(&self, call: F, what: &str)
    where
        F: std::future::Future<Output = anyhow::Result<()>>,
    {
        if let Err(e) = call.await {
            tracing::warn!("Analytics failed to {}: {:#}", what, e);
        }
    }
}
