// Core engine for deterministic step-based workflow execution

pub mod analytics;
pub mod builtin;
pub mod config;
pub mod error;
pub mod registry;
pub mod step;
pub mod storage;
pub mod types;
pub mod workflow;

pub use error::{Result, WorkflowError};
pub use types::*;
