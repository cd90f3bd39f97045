//! Pre-run rewrite of `$prev` shorthands into explicit producer references.
//!
//! `$prev` means "the single upstream dependency". It is expanded in every
//! `input_mapping` value and in every value of `config.param_mapping`; when the
//! dependency is the workflow's trigger step the reference becomes `trigger`.

use super::input::TRIGGER_REF;
use crate::error::{Result, WorkflowError};
use crate::types::{StepDeclaration, WorkflowConfig};
use serde_json::Value;

pub const PREV_REF: &str = "$prev";

/// Config key of the tool parameter mapping
pub const PARAM_MAPPING_KEY: &str = "param_mapping";

/// Return a copy of the workflow with every `$prev` expanded
pub fn expand_prev(workflow: &WorkflowConfig) -> Result<WorkflowConfig> {
    let mut expanded = workflow.clone();

    for step in &mut expanded.steps {
        if !uses_prev(step) {
            continue;
        }

        let [dependency] = step.dependencies.as_slice() else {
            return Err(WorkflowError::AmbiguousPrevReference {
                step_id: step.step_id.clone(),
                dependency_count: step.dependencies.len(),
            });
        };

        let producer = if workflow.trigger_step.as_ref() == Some(dependency) {
            TRIGGER_REF.to_string()
        } else {
            dependency.to_string()
        };

        for value in step.input_mapping.values_mut() {
            rewrite(value, &producer);
        }
        if let Some(Value::Object(params)) = step.config.get_mut(PARAM_MAPPING_KEY) {
            for value in params.values_mut() {
                rewrite(value, &producer);
            }
        }

        tracing::debug!("Expanded $prev for step {} to {}", step.step_id, producer);
    }

    Ok(expanded)
}

fn is_prev(value: &Value) -> bool {
    match value {
        Value::String(s) => s == PREV_REF || s.starts_with("$prev."),
        _ => false,
    }
}

fn uses_prev(step: &StepDeclaration) -> bool {
    step.input_mapping.values().any(is_prev)
        || matches!(
            step.config.get(PARAM_MAPPING_KEY),
            Some(Value::Object(params)) if params.values().any(is_prev)
        )
}

fn rewrite(value: &mut Value, producer: &str) {
    let Value::String(reference) = value else {
        return;
    };
    if reference == PREV_REF {
        *reference = producer.to_string();
    } else if let Some(field) = reference.strip_prefix("$prev.") {
        *reference = format!("{producer}.{field}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExecutionPattern, StepId};
    use serde_json::json;

    fn chain() -> WorkflowConfig {
        WorkflowConfig::new(
            "chain",
            ExecutionPattern::Sequential,
            vec![
                StepDeclaration::new("agent", "agent_execution"),
                StepDeclaration::new("tool1", "tool_execution")
                    .depends_on(["agent"])
                    .map_input("response", "$prev"),
                StepDeclaration::new("tool2", "tool_execution")
                    .depends_on(["tool1"])
                    .map_input("response", "$prev")
                    .map_input("city", "$prev.city")
                    .with_config(PARAM_MAPPING_KEY, json!({"q": "$prev.query", "limit": 3})),
            ],
        )
    }

    #[test]
    fn test_expands_to_unique_dependency() {
        let expanded = expand_prev(&chain()).unwrap();
        let tool2 = expanded.step(&StepId::new("tool2")).unwrap();

        assert_eq!(tool2.input_mapping["response"], json!("tool1"));
        assert_eq!(tool2.input_mapping["city"], json!("tool1.city"));
        assert_eq!(
            tool2.config[PARAM_MAPPING_KEY],
            json!({"q": "tool1.query", "limit": 3})
        );
    }

    #[test]
    fn test_trigger_step_dependency_becomes_trigger_reference() {
        let mut workflow = chain();
        workflow.trigger_step = Some(StepId::new("agent"));

        let expanded = expand_prev(&workflow).unwrap();
        let tool1 = expanded.step(&StepId::new("tool1")).unwrap();
        assert_eq!(tool1.input_mapping["response"], json!("trigger"));

        let tool2 = expanded.step(&StepId::new("tool2")).unwrap();
        assert_eq!(tool2.input_mapping["response"], json!("tool1"));
    }

    #[test]
    fn test_prev_with_several_dependencies_is_rejected() {
        let workflow = WorkflowConfig::new(
            "fan_in",
            ExecutionPattern::Dag,
            vec![
                StepDeclaration::new("a", "data_input"),
                StepDeclaration::new("b", "data_input"),
                StepDeclaration::new("c", "transformation")
                    .depends_on(["a", "b"])
                    .map_input("x", "$prev"),
            ],
        );

        match expand_prev(&workflow) {
            Err(WorkflowError::AmbiguousPrevReference {
                step_id,
                dependency_count,
            }) => {
                assert_eq!(step_id, StepId::new("c"));
                assert_eq!(dependency_count, 2);
            }
            other => panic!("expected ambiguous $prev, got {other:?}"),
        }
    }

    #[test]
    fn test_prev_without_dependencies_is_rejected() {
        let workflow = WorkflowConfig::new(
            "lonely",
            ExecutionPattern::Sequential,
            vec![StepDeclaration::new("a", "data_input").map_input("x", "$prev")],
        );
        assert!(matches!(
            expand_prev(&workflow),
            Err(WorkflowError::AmbiguousPrevReference {
                dependency_count: 0,
                ..
            })
        ));
    }

    #[test]
    fn test_other_values_are_untouched() {
        let workflow = WorkflowConfig::new(
            "plain",
            ExecutionPattern::Sequential,
            vec![
                StepDeclaration::new("a", "data_input"),
                StepDeclaration::new("b", "data_input")
                    .depends_on(["a"])
                    .map_input("x", "a.y")
                    .map_input("literal", "$previous"),
            ],
        );

        let expanded = expand_prev(&workflow).unwrap();
        let b = expanded.step(&StepId::new("b")).unwrap();
        assert_eq!(b.input_mapping["x"], json!("a.y"));
        assert_eq!(b.input_mapping["literal"], json!("$previous"));
    }
}
