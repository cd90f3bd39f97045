//! Best-effort compensation after a failed run.

use super::context::ExecutionContext;
use crate::registry::StepRegistry;
use crate::step::RollbackRequest;
use crate::types::StepId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// A rollback that was attempted and returned an error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackFailure {
    pub step_id: StepId,
    pub error: String,
}

/// What the coordinator did, in attempt order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollbackReport {
    pub attempted: Vec<StepId>,
    pub succeeded: Vec<StepId>,
    pub failed: Vec<RollbackFailure>,
    /// Steps whose rollback type has no registered implementation
    pub skipped: Vec<StepId>,
}

/// Walks completed steps in reverse completion order and invokes their
/// compensating actions. Errors are logged and never escalate.
pub struct RollbackCoordinator {
    registry: Arc<StepRegistry>,
}

impl RollbackCoordinator {
    pub fn new(registry: Arc<StepRegistry>) -> Self {
        Self { registry }
    }

    pub async fn rollback(&self, ctx: &ExecutionContext) -> RollbackReport {
        let mut report = RollbackReport::default();

        for step_id in ctx.completion_order().iter().rev() {
            let Some(descriptor) = ctx.rollback_descriptor(step_id) else {
                continue;
            };

            let Some(rollback) = self.registry.resolve_rollback(&descriptor.rollback_type) else {
                tracing::warn!(
                    "No rollback registered for type {} (step {})",
                    descriptor.rollback_type,
                    step_id
                );
                report.skipped.push(step_id.clone());
                continue;
            };

            let request = RollbackRequest {
                execution_id: ctx.execution_id(),
                step_id: step_id.clone(),
                parameters: descriptor.parameters.clone(),
                output: ctx.step_output(step_id).cloned().unwrap_or(Value::Null),
            };

            tracing::info!(
                "Rolling back step {} ({}) for execution {}",
                step_id,
                descriptor.rollback_type,
                ctx.execution_id()
            );
            report.attempted.push(step_id.clone());

            match rollback.rollback(&request).await {
                Ok(()) => report.succeeded.push(step_id.clone()),
                Err(e) => {
                    tracing::warn!("Rollback of step {} failed: {:#}", step_id, e);
                    report.failed.push(RollbackFailure {
                        step_id: step_id.clone(),
                        error: format!("{e:#}"),
                    });
                }
            }
        }

        report
    }
}
