//! Step contract implemented by every unit of work the engine can run.

use crate::types::{ExecutionId, Payload, StepDeclaration, StepId, StepStatus};
use crate::workflow::batch::BatchProgress;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;

/// Result of validating a step's static configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            ..Default::default()
        }
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
        self.is_valid = false;
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

/// Output of a single step invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutput {
    pub status: StepStatus,
    pub data: Value,
    #[serde(default)]
    pub metadata: Payload,
    #[serde(default)]
    pub error: Option<String>,
    /// Extra parameters handed to the step's rollback if a later step fails
    #[serde(default)]
    pub rollback_data: Option<Payload>,
    #[serde(default)]
    pub progress: Option<BatchProgress>,
}

impl StepOutput {
    pub fn completed(data: Value) -> Self {
        Self {
            status: StepStatus::Completed,
            data,
            metadata: Payload::new(),
            error: None,
            rollback_data: None,
            progress: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Failed,
            data: Value::Null,
            metadata: Payload::new(),
            error: Some(error.into()),
            rollback_data: None,
            progress: None,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn with_rollback_data(mut self, rollback_data: Payload) -> Self {
        self.rollback_data = Some(rollback_data);
        self
    }

    pub fn is_completed(&self) -> bool {
        self.status == StepStatus::Completed
    }
}

/// A unit of work registered under a step type.
///
/// One implementation serves every step of its type, so all per-step
/// configuration arrives through the declaration.
#[async_trait::async_trait]
pub trait Step: Send + Sync {
    /// Check static configuration. Must not depend on input data.
    fn validate_config(&self, _step: &StepDeclaration) -> ValidationResult {
        ValidationResult::valid()
    }

    /// Input keys the step expects. Informational only.
    fn required_inputs(&self, _step: &StepDeclaration) -> Vec<String> {
        Vec::new()
    }

    /// Run the step against its resolved input.
    async fn execute(
        &self,
        execution_id: ExecutionId,
        step: &StepDeclaration,
        input: Payload,
    ) -> anyhow::Result<StepOutput>;
}

/// Everything a compensating action gets to work with
#[derive(Debug, Clone)]
pub struct RollbackRequest {
    pub execution_id: ExecutionId,
    pub step_id: StepId,
    pub parameters: Payload,
    /// Output the step recorded when it completed
    pub output: Value,
}

/// Compensating action registered under a rollback type
#[async_trait::async_trait]
pub trait Rollback: Send + Sync {
    async fn rollback(&self, request: &RollbackRequest) -> anyhow::Result<()>;
}

/// Step backed by an async closure receiving `(config, input)`
pub struct FnStep<F> {
    f: F,
    required_inputs: Vec<String>,
}

impl<F> FnStep<F> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            required_inputs: Vec::new(),
        }
    }

    pub fn requires<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_inputs = inputs.into_iter().map(Into::into).collect();
        self
    }
}

#[async_trait::async_trait]
impl<F, Fut> Step for FnStep<F>
where
    F: Fn(Payload, Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<StepOutput>> + Send + 'static,
{
    fn required_inputs(&self, _step: &StepDeclaration) -> Vec<String> {
        self.required_inputs.clone()
    }

    async fn execute(
        &self,
        _execution_id: ExecutionId,
        step: &StepDeclaration,
        input: Payload,
    ) -> anyhow::Result<StepOutput> {
        (self.f)(step.config.clone(), input).await
    }
}

/// Rollback backed by an async closure
pub struct FnRollback<F> {
    f: F,
}

impl<F> FnRollback<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait::async_trait]
impl<F, Fut> Rollback for FnRollback<F>
where
    F: Fn(RollbackRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn rollback(&self, request: &RollbackRequest) -> anyhow::Result<()> {
        (self.f)(request.clone()).await
    }
}
