// Workflow scheduling and execution

pub mod batch;
pub mod context;
pub mod dag;
pub mod executor;
pub mod input;
pub mod prepare;
pub mod rollback;
pub mod step_executor;
pub mod validate;

pub use batch::BatchProgress;
pub use context::ExecutionContext;
pub use dag::DependencyGraph;
pub use executor::WorkflowExecutor;
pub use input::{InputCollector, TRIGGER_REF};
pub use prepare::expand_prev;
pub use rollback::{RollbackCoordinator, RollbackFailure, RollbackReport};
pub use step_executor::StepExecutor;
pub use validate::{validate_workflow, ValidationReport};
