//! Reference step implementations for running declarations out of the box.

use crate::registry::StepRegistry;
use crate::step::{Rollback, RollbackRequest, Step, StepOutput, ValidationResult};
use crate::types::{ExecutionId, Payload, StepDeclaration, StepType};
use crate::workflow::input::STATIC_INPUT_KEY;
use anyhow::{anyhow, Context};
use serde_json::Value;
use std::sync::Arc;

pub const LOG_ROLLBACK: &str = "log";

const DEFAULT_FIELD: &str = "text";

/// Register every builtin step and the `log` rollback
pub fn register_builtins(registry: &mut StepRegistry) {
    registry.register(StepType::DataInput, Arc::new(DataInputStep));
    registry.register(StepType::Transformation, Arc::new(TransformationStep));
    registry.register(StepType::Validation, Arc::new(ValidationStep));
    registry.register(StepType::DataOutput, Arc::new(DataOutputStep));
    registry.register_rollback(LOG_ROLLBACK, Arc::new(LogRollback));
}

/// Emits its resolved input with `config.input_data` on top
pub struct DataInputStep;

#[async_trait::async_trait]
impl Step for DataInputStep {
    fn validate_config(&self, step: &StepDeclaration) -> ValidationResult {
        let mut result = ValidationResult::valid();
        if let Some(data) = step.config.get(STATIC_INPUT_KEY) {
            if !data.is_object() {
                result.error(format!("{STATIC_INPUT_KEY} must be an object"));
            }
        }
        result
    }

    async fn execute(
        &self,
        _execution_id: ExecutionId,
        step: &StepDeclaration,
        mut input: Payload,
    ) -> anyhow::Result<StepOutput> {
        if let Some(Value::Object(data)) = step.config.get(STATIC_INPUT_KEY) {
            input.extend(data.clone());
        }
        Ok(StepOutput::completed(Value::Object(input)))
    }
}

/// String operation applied by [`TransformationStep`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Uppercase,
    Lowercase,
    Trim,
    Reverse,
}

impl Operation {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "uppercase" => Some(Self::Uppercase),
            "lowercase" => Some(Self::Lowercase),
            "trim" => Some(Self::Trim),
            "reverse" => Some(Self::Reverse),
            _ => None,
        }
    }

    pub fn apply(self, text: &str) -> String {
        match self {
            Self::Uppercase => text.to_uppercase(),
            Self::Lowercase => text.to_lowercase(),
            Self::Trim => text.trim().to_string(),
            Self::Reverse => text.chars().rev().collect(),
        }
    }
}

/// Applies `config.operation` to the string at `config.field` (default `text`)
pub struct TransformationStep;

impl TransformationStep {
    fn field(step: &StepDeclaration) -> &str {
        step.config
            .get("field")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_FIELD)
    }
}

#[async_trait::async_trait]
impl Step for TransformationStep {
    fn validate_config(&self, step: &StepDeclaration) -> ValidationResult {
        let mut result = ValidationResult::valid();
        match step.config.get("operation").and_then(Value::as_str) {
            None => result.error("operation is required"),
            Some(name) if Operation::parse(name).is_none() => {
                result.error(format!("unsupported operation '{name}'"))
            }
            Some(_) => {}
        }
        result
    }

    fn required_inputs(&self, step: &StepDeclaration) -> Vec<String> {
        vec![Self::field(step).to_string()]
    }

    async fn execute(
        &self,
        _execution_id: ExecutionId,
        step: &StepDeclaration,
        mut input: Payload,
    ) -> anyhow::Result<StepOutput> {
        let name = step
            .config
            .get("operation")
            .and_then(Value::as_str)
            .context("operation is required")?;
        let operation =
            Operation::parse(name).ok_or_else(|| anyhow!("unsupported operation '{name}'"))?;

        let field = Self::field(step);
        let text = input
            .get(field)
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("input field '{field}' is missing or not a string"))?;

        let transformed = operation.apply(text);
        input.insert(field.to_string(), Value::String(transformed));

        Ok(StepOutput::completed(Value::Object(input)).with_metadata("operation", name.into()))
    }
}

/// Fails when any of `config.required_fields` is absent from the input
pub struct ValidationStep;

impl ValidationStep {
    fn required_fields(step: &StepDeclaration) -> Vec<String> {
        step.config
            .get("required_fields")
            .and_then(Value::as_array)
            .map(|fields| {
                fields
                    .iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl Step for ValidationStep {
    fn validate_config(&self, step: &StepDeclaration) -> ValidationResult {
        let mut result = ValidationResult::valid();
        match step.config.get("required_fields") {
            None => result.warning("no required_fields configured"),
            Some(Value::Array(fields)) if fields.iter().all(Value::is_string) => {}
            Some(_) => result.error("required_fields must be a list of strings"),
        }
        result
    }

    fn required_inputs(&self, step: &StepDeclaration) -> Vec<String> {
        Self::required_fields(step)
    }

    async fn execute(
        &self,
        _execution_id: ExecutionId,
        step: &StepDeclaration,
        input: Payload,
    ) -> anyhow::Result<StepOutput> {
        let missing: Vec<String> = Self::required_fields(step)
            .into_iter()
            .filter(|f| !input.contains_key(f))
            .collect();

        if !missing.is_empty() {
            return Ok(StepOutput::failed(format!(
                "Missing required fields: {}",
                missing.join(", ")
            )));
        }

        Ok(StepOutput::completed(Value::Object(input)).with_metadata("validated", true.into()))
    }
}

/// Echoes its input as output
pub struct DataOutputStep;

#[async_trait::async_trait]
impl Step for DataOutputStep {
    async fn execute(
        &self,
        _execution_id: ExecutionId,
        _step: &StepDeclaration,
        input: Payload,
    ) -> anyhow::Result<StepOutput> {
        Ok(StepOutput::completed(Value::Object(input)))
    }
}

/// Rollback that only logs what it would undo
pub struct LogRollback;

#[async_trait::async_trait]
impl Rollback for LogRollback {
    async fn rollback(&self, request: &RollbackRequest) -> anyhow::Result<()> {
        let parameters = Value::Object(request.parameters.clone());
        tracing::info!(
            "Rollback requested for step {} of execution {}: parameters={}",
            request.step_id,
            request.execution_id,
            parameters
        );
        Ok(())
    }
}
