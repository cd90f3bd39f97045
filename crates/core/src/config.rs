use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Engine configuration, loaded from TOML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub input: InputConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputConfig {
    /// Fail the step when a mapping references a producer with no data
    #[serde(default)]
    pub strict_mapping: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_true")]
    pub enforce_timeouts: bool,

    /// Run the steps of each DAG wave concurrently
    #[serde(default)]
    pub concurrent_waves: bool,

    #[serde(default = "default_true")]
    pub rollback_on_failure: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            enforce_timeouts: default_true(),
            concurrent_waves: false,
            rollback_on_failure: default_true(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// JSON-lines file terminal run records are appended to
    #[serde(default)]
    pub run_log: Option<PathBuf>,
}

impl EngineConfig {
    /// Load the config file, falling back to defaults when it does not exist
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            tracing::info!("Configuration file not found, using defaults");
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(config_path).context("Failed to read configuration file")?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse configuration file")
    }
}
