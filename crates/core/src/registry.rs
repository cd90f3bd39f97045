// Step and rollback implementation lookup

use crate::step::{Rollback, Step};
use crate::types::{StepDeclaration, StepType};
use std::collections::HashMap;
use std::sync::Arc;

/// Config key naming an alternate implementation for a single step
pub const IMPLEMENTATION_HINT_KEY: &str = "implementation";

/// Registry mapping step types to implementations.
///
/// Populated at startup and shared read-only (behind an `Arc`) by every run.
pub struct StepRegistry {
    steps: HashMap<StepType, Arc<dyn Step>>,
    named: HashMap<String, Arc<dyn Step>>,
    rollbacks: HashMap<String, Arc<dyn Rollback>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self {
            steps: HashMap::new(),
            named: HashMap::new(),
            rollbacks: HashMap::new(),
        }
    }

    /// Register the default implementation for a step type. Last one wins.
    pub fn register(&mut self, step_type: impl Into<StepType>, step: Arc<dyn Step>) {
        let step_type = step_type.into();
        if self.steps.insert(step_type.clone(), step).is_some() {
            tracing::debug!("Replaced implementation for step type {}", step_type);
        }
    }

    /// Register an implementation selectable through the `implementation` config hint
    pub fn register_named(&mut self, name: impl Into<String>, step: Arc<dyn Step>) {
        self.named.insert(name.into(), step);
    }

    /// Register a compensating action for a rollback type. Last one wins.
    pub fn register_rollback(&mut self, rollback_type: impl Into<String>, rollback: Arc<dyn Rollback>) {
        self.rollbacks.insert(rollback_type.into(), rollback);
    }

    /// Resolve the implementation for a step.
    ///
    /// A registered `implementation` hint in the step config takes precedence
    /// over the default for the step type.
    pub fn resolve(&self, step_type: &StepType, step: &StepDeclaration) -> Option<Arc<dyn Step>> {
        if let Some(hint) = step
            .config
            .get(IMPLEMENTATION_HINT_KEY)
            .and_then(|v| v.as_str())
        {
            if let Some(found) = self
                .named
                .get(hint)
                .or_else(|| self.steps.get(&StepType::from(hint)))
            {
                return Some(found.clone());
            }
            tracing::debug!(
                "Implementation hint {} for step {} is not registered, using default",
                hint,
                step.step_id
            );
        }

        self.steps.get(step_type).cloned()
    }

    pub fn resolve_rollback(&self, rollback_type: &str) -> Option<Arc<dyn Rollback>> {
        self.rollbacks.get(rollback_type).cloned()
    }

    pub fn contains(&self, step_type: &StepType) -> bool {
        self.steps.contains_key(step_type)
    }

    pub fn contains_rollback(&self, rollback_type: &str) -> bool {
        self.rollbacks.contains_key(rollback_type)
    }

    /// Registered step types, sorted by name
    pub fn step_types(&self) -> Vec<StepType> {
        let mut types: Vec<StepType> = self.steps.keys().cloned().collect();
        types.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        types
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::new()
    }
}
