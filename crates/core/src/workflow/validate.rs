use super::dag::DependencyGraph;
use super::input::TRIGGER_REF;
use crate::error::{Result, WorkflowError};
use crate::registry::StepRegistry;
use crate::types::{ExecutionPattern, StepId, WorkflowConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// All configuration problems found in a workflow, collected in one pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Turn errors into `InvalidWorkflow`, keeping warnings on success
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.errors.is_empty() {
            Ok(self.warnings)
        } else {
            Err(WorkflowError::InvalidWorkflow {
                errors: self.errors,
            })
        }
    }
}

/// Validate a workflow (with `$prev` already expanded) against a registry.
///
/// Cycles are reported as warnings: the scheduler detects them when a run
/// stalls, after any steps ahead of the cycle have executed.
pub fn validate_workflow(workflow: &WorkflowConfig, registry: &StepRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();
    let mut positions: HashMap<&StepId, usize> = HashMap::new();

    for (position, step) in workflow.steps.iter().enumerate() {
        if step.step_id.as_str() == TRIGGER_REF {
            report
                .errors
                .push(format!("Step id '{TRIGGER_REF}' is reserved for the trigger payload"));
        }
        if positions.insert(&step.step_id, position).is_some() {
            report
                .errors
                .push(format!("Duplicate step id '{}'", step.step_id));
        }
    }

    for (position, step) in workflow.steps.iter().enumerate() {
        let id = &step.step_id;

        for dep in &step.dependencies {
            match positions.get(dep) {
                None => report
                    .errors
                    .push(format!("Step '{id}' depends on unknown step '{dep}'")),
                Some(dep_position)
                    if *dep_position > position
                        && workflow.execution_pattern != ExecutionPattern::Dag =>
                {
                    report.warnings.push(format!(
                        "Step '{id}' is declared before its dependency '{dep}' and cannot run under the {:?} pattern",
                        workflow.execution_pattern
                    ));
                }
                Some(_) => {}
            }
        }

        if step.batch_size == Some(0) {
            report
                .errors
                .push(format!("Step '{id}' has a batch_size of 0"));
        }

        match registry.resolve(&step.step_type, step) {
            None => report.errors.push(format!(
                "No implementation registered for step type '{}' (step '{id}')",
                step.step_type
            )),
            Some(implementation) => {
                let result = implementation.validate_config(step);
                report
                    .errors
                    .extend(result.errors.into_iter().map(|e| format!("Step '{id}': {e}")));
                report
                    .warnings
                    .extend(result.warnings.into_iter().map(|w| format!("Step '{id}': {w}")));
            }
        }

        let declared: HashSet<&StepId> = step.dependencies.iter().collect();
        for (key, source) in &step.input_mapping {
            let Some(producer) = referenced_step(source, &positions) else {
                continue;
            };
            if producer != *id && !declared.contains(&producer) {
                report.warnings.push(format!(
                    "Step '{id}' maps input '{key}' from '{producer}' which is not one of its dependencies"
                ));
            }
        }

        if let Some(rollback) = &step.rollback {
            if !registry.contains_rollback(&rollback.rollback_type) {
                report.warnings.push(format!(
                    "Step '{id}' declares rollback type '{}' which is not registered",
                    rollback.rollback_type
                ));
            }
        }
    }

    // Cycle check only makes sense on a structurally sound graph
    if report.is_valid() {
        if let Ok(graph) = DependencyGraph::build(&workflow.steps) {
            for cycle in graph.cycles() {
                let ids: Vec<&str> = cycle.iter().map(StepId::as_str).collect();
                report
                    .warnings
                    .push(format!("Circular dependency among steps: {}", ids.join(", ")));
            }
        }
    }

    report
}

/// Step id a mapping value refers to, if it is a reference at all
fn referenced_step(source: &Value, positions: &HashMap<&StepId, usize>) -> Option<StepId> {
    let Value::String(reference) = source else {
        return None;
    };

    let bare = StepId::new(reference.as_str());
    if positions.contains_key(&bare) {
        return Some(bare);
    }

    let (producer, _) = reference.split_once('.')?;
    let producer = StepId::new(producer);
    positions.contains_key(&producer).then_some(producer)
}
