//! Per-run mutable state.

use crate::types::{ExecutionId, Payload, RollbackSpec, StepId};
use crate::workflow::dag::DependencyGraph;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Progress and outputs of one workflow run.
///
/// Owned by the scheduler for the lifetime of the run; only the step executor
/// writes to it, and each step only ever writes its own entry.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    execution_id: ExecutionId,
    trigger: Payload,
    step_data: HashMap<StepId, Value>,
    completed_steps: HashSet<StepId>,
    completion_order: Vec<StepId>,
    failed_steps: HashSet<StepId>,
    failure_order: Vec<StepId>,
    errors: HashMap<StepId, String>,
    rollback_data: HashMap<StepId, RollbackSpec>,
}

impl ExecutionContext {
    pub fn new(execution_id: ExecutionId, trigger: Payload) -> Self {
        Self {
            execution_id,
            trigger,
            step_data: HashMap::new(),
            completed_steps: HashSet::new(),
            completion_order: Vec::new(),
            failed_steps: HashSet::new(),
            failure_order: Vec::new(),
            errors: HashMap::new(),
            rollback_data: HashMap::new(),
        }
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    /// Initial payload the run was triggered with
    pub fn trigger(&self) -> &Payload {
        &self.trigger
    }

    /// Record a successful step. Each step is recorded at most once per run.
    pub fn mark_completed(&mut self, step_id: &StepId, result: Value) {
        debug_assert!(
            !self.step_data.contains_key(step_id),
            "step {step_id} recorded twice"
        );
        self.step_data.insert(step_id.clone(), result);
        if self.completed_steps.insert(step_id.clone()) {
            self.completion_order.push(step_id.clone());
        }
    }

    /// Record a failed step, keeping its rollback descriptor if it has one
    pub fn mark_failed(
        &mut self,
        step_id: &StepId,
        error: impl Into<String>,
        rollback: Option<RollbackSpec>,
    ) {
        if self.failed_steps.insert(step_id.clone()) {
            self.failure_order.push(step_id.clone());
        }
        self.errors.insert(step_id.clone(), error.into());
        if let Some(rollback) = rollback {
            self.rollback_data.insert(step_id.clone(), rollback);
        }
    }

    /// Remember the compensating action for a completed step
    pub fn register_rollback(&mut self, step_id: &StepId, rollback: RollbackSpec) {
        self.rollback_data.insert(step_id.clone(), rollback);
    }

    pub fn dependencies_satisfied(&self, graph: &DependencyGraph, step_id: &StepId) -> bool {
        graph.is_ready(step_id, &self.completed_steps)
    }

    pub fn is_completed(&self, step_id: &StepId) -> bool {
        self.completed_steps.contains(step_id)
    }

    pub fn is_failed(&self, step_id: &StepId) -> bool {
        self.failed_steps.contains(step_id)
    }

    pub fn step_output(&self, step_id: &StepId) -> Option<&Value> {
        self.step_data.get(step_id)
    }

    pub fn step_data(&self) -> &HashMap<StepId, Value> {
        &self.step_data
    }

    pub fn completed_steps(&self) -> &HashSet<StepId> {
        &self.completed_steps
    }

    /// Completed steps in the order they finished
    pub fn completion_order(&self) -> &[StepId] {
        &self.completion_order
    }

    /// Failed steps in the order they failed
    pub fn failed_steps(&self) -> &[StepId] {
        &self.failure_order
    }

    pub fn step_error(&self, step_id: &StepId) -> Option<&str> {
        self.errors.get(step_id).map(String::as_str)
    }

    pub fn rollback_descriptor(&self, step_id: &StepId) -> Option<&RollbackSpec> {
        self.rollback_data.get(step_id)
    }

    /// Fraction of `total_steps` that completed, between 0 and 1
    pub fn progress(&self, total_steps: usize) -> f64 {
        if total_steps == 0 {
            return 1.0;
        }
        self.completed_steps.len() as f64 / total_steps as f64
    }

    /// Snapshot of step outputs with stable ordering for run records
    pub fn step_data_snapshot(&self) -> BTreeMap<StepId, Value> {
        self.step_data
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
