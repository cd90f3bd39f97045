use anyhow::{bail, Context, Result};
use detflow_core::analytics::NoopAnalytics;
use detflow_core::builtin::register_builtins;
use detflow_core::config::EngineConfig;
use detflow_core::registry::StepRegistry;
use detflow_core::storage::JsonlRunLog;
use detflow_core::workflow::WorkflowExecutor;
use detflow_core::{Payload, RunRequest, WorkflowConfig};
use std::path::Path;
use std::sync::Arc;

/// Executor with the builtin steps and, if configured, a run log
pub fn build_executor(config: &EngineConfig) -> Result<WorkflowExecutor> {
    let mut registry = StepRegistry::new();
    register_builtins(&mut registry);

    let mut executor = WorkflowExecutor::new(
        Arc::new(registry),
        Arc::new(NoopAnalytics),
        config.clone(),
    );

    if let Some(path) = &config.storage.run_log {
        tracing::info!("Appending run records to {}", path.display());
        let run_log = JsonlRunLog::new(path).context("Failed to open run log")?;
        executor = executor.with_run_log(Arc::new(run_log));
    }

    Ok(executor)
}

pub fn load_workflow(path: &Path) -> Result<WorkflowConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read workflow file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse workflow file {}", path.display()))
}

pub fn run_request(
    trigger: Option<&str>,
    session_id: Option<String>,
    user_id: Option<String>,
) -> Result<RunRequest> {
    let trigger = match trigger {
        Some(raw) => parse_trigger(raw)?,
        None => Payload::new(),
    };
    Ok(RunRequest {
        trigger,
        session_id,
        user_id,
    })
}

fn parse_trigger(raw: &str) -> Result<Payload> {
    match serde_json::from_str::<serde_json::Value>(raw).context("Trigger is not valid JSON")? {
        serde_json::Value::Object(map) => Ok(map),
        other => bail!("Trigger must be a JSON object, got {}", other),
    }
}
