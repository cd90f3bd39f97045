//! Error types for the workflow engine.

use crate::types::{StepId, StepType};

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, WorkflowError>;

fn join_ids(ids: &[StepId]) -> String {
    ids.iter()
        .map(|id| id.0.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors raised by the workflow engine.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// Two steps share an id.
    #[error("Duplicate step: {step_id}")]
    DuplicateStep { step_id: StepId },

    /// A dependency names a step that is not part of the workflow.
    #[error("Step '{step_id}' depends on unknown step '{dependency_id}'")]
    MissingDependency {
        step_id: StepId,
        dependency_id: StepId,
    },

    /// No implementation is registered for the step.
    #[error("No implementation registered for step type '{step_type}' (step '{step_id}')")]
    UnknownStepType { step_id: StepId, step_type: StepType },

    /// `$prev` used on a step without exactly one dependency.
    #[error("Step '{step_id}' uses $prev but has {dependency_count} dependencies")]
    AmbiguousPrevReference {
        step_id: StepId,
        dependency_count: usize,
    },

    /// Pre-run validation found configuration errors.
    #[error("Invalid workflow: {}", .errors.join("; "))]
    InvalidWorkflow { errors: Vec<String> },

    /// No remaining step can ever become ready.
    #[error("Circular dependency detected among steps: {}", join_ids(.steps))]
    CircularDependency { steps: Vec<StepId> },

    /// The scheduler asked for a step before its dependencies completed.
    #[error("Step '{step_id}' started before dependencies completed: {}", join_ids(.missing))]
    DependencyNotSatisfied { step_id: StepId, missing: Vec<StepId> },

    /// Strict input mapping could not resolve a reference.
    #[error("Step '{step_id}' input '{key}' references '{reference}' which produced no data")]
    InputResolution {
        step_id: StepId,
        key: String,
        reference: String,
    },

    /// The step implementation failed.
    #[error("Step '{step_id}' failed: {message}")]
    StepFailed { step_id: StepId, message: String },

    /// The step exceeded its declared timeout.
    #[error("Step '{step_id}' timed out after {timeout_secs} seconds")]
    StepTimeout { step_id: StepId, timeout_secs: u64 },

    /// Run record persistence failed.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl WorkflowError {
    /// Configuration errors are detected before a run starts.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::DuplicateStep { .. }
                | Self::MissingDependency { .. }
                | Self::UnknownStepType { .. }
                | Self::AmbiguousPrevReference { .. }
                | Self::InvalidWorkflow { .. }
        )
    }

    /// Step that caused the error, if any.
    pub fn step_id(&self) -> Option<&StepId> {
        match self {
            Self::DuplicateStep { step_id }
            | Self::MissingDependency { step_id, .. }
            | Self::UnknownStepType { step_id, .. }
            | Self::AmbiguousPrevReference { step_id, .. }
            | Self::DependencyNotSatisfied { step_id, .. }
            | Self::InputResolution { step_id, .. }
            | Self::StepFailed { step_id, .. }
            | Self::StepTimeout { step_id, .. } => Some(step_id),
            Self::InvalidWorkflow { .. } | Self::CircularDependency { .. } | Self::Storage(_) => {
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circular_dependency_names_steps() {
        let err = WorkflowError::CircularDependency {
            steps: vec![StepId::new("a"), StepId::new("b")],
        };
        assert_eq!(
            err.to_string(),
            "Circular dependency detected among steps: a, b"
        );
    }

    #[test]
    fn invalid_workflow_joins_errors() {
        let err = WorkflowError::InvalidWorkflow {
            errors: vec!["first".into(), "second".into()],
        };
        assert_eq!(err.to_string(), "Invalid workflow: first; second");
        assert!(err.is_configuration_error());
    }

    #[test]
    fn step_failed_keeps_original_message() {
        let err = WorkflowError::StepFailed {
            step_id: StepId::new("load"),
            message: "connection refused".into(),
        };
        assert_eq!(err.to_string(), "Step 'load' failed: connection refused");
        assert_eq!(err.step_id(), Some(&StepId::new("load")));
        assert!(!err.is_configuration_error());
    }

    #[test]
    fn unknown_step_type_displays_type() {
        let err = WorkflowError::UnknownStepType {
            step_id: StepId::new("x"),
            step_type: StepType::Custom("ocr".into()),
        };
        assert_eq!(
            err.to_string(),
            "No implementation registered for step type 'ocr' (step 'x')"
        );
    }
}
