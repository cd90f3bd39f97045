use crate::types::{ExecutionId, Payload, RunStatus, StepId, StepStatus, StepType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// A run announced to the analytics collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStart {
    pub execution_id: ExecutionId,
    pub workflow_id: String,
    pub workflow_name: String,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub trigger: Payload,
}

/// Status change of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionUpdate {
    pub execution_id: ExecutionId,
    pub status: RunStatus,
    pub progress: Option<f64>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl ExecutionUpdate {
    pub fn progress(execution_id: ExecutionId, progress: f64) -> Self {
        Self {
            execution_id,
            status: RunStatus::Running,
            progress: Some(progress),
            result: None,
            error: None,
        }
    }
}

/// A step about to be invoked
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepStart {
    pub execution_id: ExecutionId,
    pub step_id: StepId,
    pub step_type: StepType,
    pub step_name: String,
    pub input: Payload,
    pub metadata: Payload,
}

/// Outcome of a tracked step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCompletion {
    pub status: StepStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Telemetry sink the engine reports run and step lifecycle into.
///
/// Every call is best effort: the engine logs and drops errors returned here.
#[async_trait::async_trait]
pub trait Analytics: Send + Sync {
    async fn create_execution(&self, execution: &ExecutionStart) -> anyhow::Result<()>;

    async fn update_execution(&self, update: &ExecutionUpdate) -> anyhow::Result<()>;

    /// Returns an opaque reference used to complete the step later
    async fn track_step_start(&self, start: &StepStart) -> anyhow::Result<String>;

    async fn complete_step(
        &self,
        execution_id: ExecutionId,
        step_ref: &str,
        completion: &StepCompletion,
    ) -> anyhow::Result<()>;
}

/// Analytics sink that discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAnalytics;

#[async_trait::async_trait]
impl Analytics for NoopAnalytics {
    async fn create_execution(&self, _execution: &ExecutionStart) -> anyhow::Result<()> {
        Ok(())
    }

    async fn update_execution(&self, _update: &ExecutionUpdate) -> anyhow::Result<()> {
        Ok(())
    }

    async fn track_step_start(&self, start: &StepStart) -> anyhow::Result<String> {
        Ok(start.step_id.to_string())
    }

    async fn complete_step(
        &self,
        _execution_id: ExecutionId,
        _step_ref: &str,
        _completion: &StepCompletion,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Execution trace for a single workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub execution_id: ExecutionId,
    pub workflow_id: String,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub status: RunStatus,
    pub progress: f64,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub steps: Vec<StepTrace>,
}

/// Trace for a single step invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTrace {
    pub step_ref: String,
    pub step_id: StepId,
    pub step_type: StepType,
    pub input: Payload,
    pub started_at: DateTime<Utc>,
    pub status: Option<StepStatus>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
}

/// Statistics for a step id across runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepStats {
    pub step_id: StepId,
    pub execution_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub total_duration_ms: u64,
    pub min_duration_ms: u64,
    pub max_duration_ms: u64,
    pub avg_duration_ms: f64,
}

impl StepStats {
    fn new(step_id: StepId) -> Self {
        Self {
            step_id,
            execution_count: 0,
            success_count: 0,
            failure_count: 0,
            total_duration_ms: 0,
            min_duration_ms: u64::MAX,
            max_duration_ms: 0,
            avg_duration_ms: 0.0,
        }
    }

    fn record(&mut self, success: bool, duration_ms: u64) {
        self.execution_count += 1;
        if success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
        self.total_duration_ms += duration_ms;
        self.min_duration_ms = self.min_duration_ms.min(duration_ms);
        self.max_duration_ms = self.max_duration_ms.max(duration_ms);
        self.avg_duration_ms = self.total_duration_ms as f64 / self.execution_count as f64;
    }
}

#[derive(Default)]
struct AnalyticsState {
    traces: Vec<ExecutionTrace>,
    step_stats: HashMap<StepId, StepStats>,
    next_ref: u64,
}

impl AnalyticsState {
    fn trace_mut(&mut self, execution_id: ExecutionId) -> Option<&mut ExecutionTrace> {
        self.traces
            .iter_mut()
            .find(|t| t.execution_id == execution_id)
    }
}

/// Analytics sink that keeps traces and step statistics in memory
#[derive(Default)]
pub struct InMemoryAnalytics {
    state: Mutex<AnalyticsState>,
}

impl InMemoryAnalytics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get execution trace for a run
    pub async fn get_trace(&self, execution_id: ExecutionId) -> Option<ExecutionTrace> {
        let state = self.state.lock().await;
        state
            .traces
            .iter()
            .find(|t| t.execution_id == execution_id)
            .cloned()
    }

    /// Get all execution traces
    pub async fn get_all_traces(&self) -> Vec<ExecutionTrace> {
        self.state.lock().await.traces.clone()
    }

    pub async fn get_step_stats(&self, step_id: &StepId) -> Option<StepStats> {
        self.state.lock().await.step_stats.get(step_id).cloned()
    }
}

#[async_trait::async_trait]
impl Analytics for InMemoryAnalytics {
    async fn create_execution(&self, execution: &ExecutionStart) -> anyhow::Result<()> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.traces.push(ExecutionTrace {
            execution_id: execution.execution_id,
            workflow_id: execution.workflow_id.clone(),
            session_id: execution.session_id.clone(),
            user_id: execution.user_id.clone(),
            status: RunStatus::Pending,
            progress: 0.0,
            error: None,
            started_at: now,
            updated_at: now,
            steps: Vec::new(),
        });
        Ok(())
    }

    async fn update_execution(&self, update: &ExecutionUpdate) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let trace = state
            .trace_mut(update.execution_id)
            .ok_or_else(|| anyhow::anyhow!("Unknown execution {}", update.execution_id))?;

        trace.status = update.status;
        if let Some(progress) = update.progress {
            trace.progress = progress;
        }
        if update.error.is_some() {
            trace.error = update.error.clone();
        }
        trace.updated_at = Utc::now();
        Ok(())
    }

    async fn track_step_start(&self, start: &StepStart) -> anyhow::Result<String> {
        let mut state = self.state.lock().await;
        state.next_ref += 1;
        let step_ref = format!("{}#{}", start.step_id, state.next_ref);

        let trace = state
            .trace_mut(start.execution_id)
            .ok_or_else(|| anyhow::anyhow!("Unknown execution {}", start.execution_id))?;
        trace.steps.push(StepTrace {
            step_ref: step_ref.clone(),
            step_id: start.step_id.clone(),
            step_type: start.step_type.clone(),
            input: start.input.clone(),
            started_at: Utc::now(),
            status: None,
            output: None,
            error: None,
            duration_ms: None,
        });
        Ok(step_ref)
    }

    async fn complete_step(
        &self,
        execution_id: ExecutionId,
        step_ref: &str,
        completion: &StepCompletion,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let trace = state
            .trace_mut(execution_id)
            .ok_or_else(|| anyhow::anyhow!("Unknown execution {}", execution_id))?;
        let step = trace
            .steps
            .iter_mut()
            .find(|s| s.step_ref == step_ref)
            .ok_or_else(|| anyhow::anyhow!("Unknown step reference {}", step_ref))?;

        step.status = Some(completion.status);
        step.output = completion.output.clone();
        step.error = completion.error.clone();
        step.duration_ms = Some(completion.duration_ms);
        let step_id = step.step_id.clone();

        state
            .step_stats
            .entry(step_id.clone())
            .or_insert_with(|| StepStats::new(step_id))
            .record(
                completion.status == StepStatus::Completed,
                completion.duration_ms,
            );
        Ok(())
    }
}
