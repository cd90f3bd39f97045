use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Free-form key/value payload exchanged between the engine and step implementations
pub type Payload = serde_json::Map<String, Value>;

/// Unique identifier for a single workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a step, unique within one workflow
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StepId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Implementation family of a step.
///
/// Known families serialize to their snake_case names; anything else is kept
/// verbatim in `Custom` so config-driven step types stay extensible.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StepType {
    DataInput,
    DataOutput,
    Transformation,
    Validation,
    BatchProcessing,
    AgentExecution,
    ToolExecution,
    Custom(String),
}

impl StepType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::DataInput => "data_input",
            Self::DataOutput => "data_output",
            Self::Transformation => "transformation",
            Self::Validation => "validation",
            Self::BatchProcessing => "batch_processing",
            Self::AgentExecution => "agent_execution",
            Self::ToolExecution => "tool_execution",
            Self::Custom(name) => name,
        }
    }
}

impl From<String> for StepType {
    fn from(name: String) -> Self {
        match name.as_str() {
            "data_input" => Self::DataInput,
            "data_output" => Self::DataOutput,
            "transformation" => Self::Transformation,
            "validation" => Self::Validation,
            "batch_processing" => Self::BatchProcessing,
            "agent_execution" => Self::AgentExecution,
            "tool_execution" => Self::ToolExecution,
            _ => Self::Custom(name),
        }
    }
}

impl From<&str> for StepType {
    fn from(name: &str) -> Self {
        Self::from(name.to_string())
    }
}

impl From<StepType> for String {
    fn from(step_type: StepType) -> Self {
        step_type.as_str().to_string()
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the scheduler orders the steps of a workflow
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPattern {
    #[default]
    Sequential,
    Parallel,
    Dag,
}

/// Compensating action declared on a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackSpec {
    pub rollback_type: String,
    #[serde(default)]
    pub parameters: Payload,
}

/// A single step as authored by the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDeclaration {
    pub step_id: StepId,
    pub step_type: StepType,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub dependencies: Vec<StepId>,
    #[serde(default)]
    pub config: Payload,
    /// Local input key -> source reference (`producer.field`, `producer`) or literal
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input_mapping: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackSpec>,
}

impl StepDeclaration {
    pub fn new(step_id: impl Into<String>, step_type: impl Into<StepType>) -> Self {
        let step_id = step_id.into();
        Self {
            name: step_id.clone(),
            step_id: StepId(step_id),
            step_type: step_type.into(),
            dependencies: Vec::new(),
            config: Payload::new(),
            input_mapping: BTreeMap::new(),
            batch_size: None,
            timeout_seconds: None,
            rollback: None,
        }
    }

    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(|d| StepId(d.into())).collect();
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    pub fn map_input(mut self, key: impl Into<String>, source: impl Into<Value>) -> Self {
        self.input_mapping.insert(key.into(), source.into());
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = Some(timeout_seconds);
        self
    }

    pub fn with_rollback(mut self, rollback_type: impl Into<String>, parameters: Payload) -> Self {
        self.rollback = Some(RollbackSpec {
            rollback_type: rollback_type.into(),
            parameters,
        });
        self
    }

    /// Effective timeout; zero counts as "no limit"
    pub fn timeout(&self) -> Option<std::time::Duration> {
        self.timeout_seconds
            .filter(|secs| *secs > 0)
            .map(std::time::Duration::from_secs)
    }
}

/// A complete workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub workflow_id: String,
    pub workflow_name: String,
    #[serde(default)]
    pub execution_pattern: ExecutionPattern,
    pub steps: Vec<StepDeclaration>,
    /// Entry step whose output is aliased to the `trigger` pseudo-step when
    /// `$prev` references are expanded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_step: Option<StepId>,
}

impl WorkflowConfig {
    pub fn new(
        workflow_id: impl Into<String>,
        execution_pattern: ExecutionPattern,
        steps: Vec<StepDeclaration>,
    ) -> Self {
        let workflow_id = workflow_id.into();
        Self {
            workflow_name: workflow_id.clone(),
            workflow_id,
            execution_pattern,
            steps,
            trigger_step: None,
        }
    }

    pub fn step(&self, step_id: &StepId) -> Option<&StepDeclaration> {
        self.steps.iter().find(|s| &s.step_id == step_id)
    }
}

/// Caller-supplied inputs for one run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub trigger: Payload,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl RunRequest {
    pub fn with_trigger(trigger: Payload) -> Self {
        Self {
            trigger,
            ..Default::default()
        }
    }
}

/// Status of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Outcome reported by a step implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
}

/// Terminal record of a workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub execution_id: ExecutionId,
    pub workflow_id: String,
    pub workflow_name: String,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub status: RunStatus,
    pub error: Option<String>,
    /// Outputs of every step that completed before the run ended
    pub step_data: BTreeMap<StepId, Value>,
    /// Completed steps in completion order
    pub completed_steps: Vec<StepId>,
    pub failed_steps: Vec<StepId>,
    /// Error message of each failed step
    #[serde(default)]
    pub step_errors: BTreeMap<StepId, String>,
    pub progress: f64,
    pub warnings: Vec<String>,
    pub rollback: Option<crate::workflow::rollback::RollbackReport>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl RunRecord {
    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }
}
