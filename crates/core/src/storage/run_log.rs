use crate::types::{ExecutionId, RunRecord};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Persistence for terminal run records
#[async_trait::async_trait]
pub trait RunLog: Send + Sync {
    /// Append a terminal run record
    async fn append(&self, record: &RunRecord) -> Result<()>;

    /// Get the record of a run
    async fn get_run(&self, execution_id: ExecutionId) -> Result<Option<RunRecord>>;

    /// All records of a workflow, oldest first
    async fn list_runs(&self, workflow_id: &str) -> Result<Vec<RunRecord>>;
}

/// Run log stored as a single JSON Lines file, one record per line
pub struct JsonlRunLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlRunLog {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).context("Failed to create run log directory")?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Vec<RunRecord>> {
        if !tokio::fs::try_exists(&self.path)
            .await
            .context("Failed to check run log")?
        {
            return Ok(Vec::new());
        }

        let content = tokio::fs::read_to_string(&self.path)
            .await
            .context("Failed to read run log")?;

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(n, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("Failed to parse run record on line {}", n + 1))
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl RunLog for JsonlRunLog {
    async fn append(&self, record: &RunRecord) -> Result<()> {
        let mut line = serde_json::to_string(record).context("Failed to serialize run record")?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .context("Failed to open run log")?;
        file.write_all(line.as_bytes())
            .await
            .context("Failed to write run record")?;
        file.flush().await.context("Failed to flush run log")?;

        Ok(())
    }

    async fn get_run(&self, execution_id: ExecutionId) -> Result<Option<RunRecord>> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .find(|r| r.execution_id == execution_id))
    }

    async fn list_runs(&self, workflow_id: &str) -> Result<Vec<RunRecord>> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .filter(|r| r.workflow_id == workflow_id)
            .collect())
    }
}
