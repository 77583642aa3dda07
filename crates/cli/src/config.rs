use anyhow::{Context, Result};
use pipeflow_core::{PipelineConfig, StateManager};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub events: EventsConfig,

    #[serde(default)]
    pub pipeline: PipelineDefaults,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    File,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    #[serde(default = "default_state_dir")]
    pub state_dir: String,
}

fn default_state_dir() -> String {
    "state".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            state_dir: default_state_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

fn default_event_capacity() -> usize {
    256
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

/// Settings applied to every pipeline the binary builds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefaults {
    #[serde(default = "default_persist_state")]
    pub persist_state: bool,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default)]
    pub wait_timeout_ms: Option<u64>,
}

fn default_persist_state() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    50
}

impl Default for PipelineDefaults {
    fn default() -> Self {
        Self {
            persist_state: default_persist_state(),
            poll_interval_ms: default_poll_interval_ms(),
            wait_timeout_ms: None,
        }
    }
}

impl CliConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::debug!("Configuration file not found, using defaults");
            Self::default()
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    /// Directory holding persisted state files
    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.state_dir)
    }

    pub fn state_manager(&self) -> Result<StateManager> {
        match self.storage.backend {
            StorageBackend::File => StateManager::file(self.state_path())
                .context("Failed to open state directory"),
            StorageBackend::Memory => Ok(StateManager::memory()),
        }
    }

    pub fn pipeline_config(&self, id: &str) -> PipelineConfig {
        let mut config = PipelineConfig::new(id).with_persist_state(self.pipeline.persist_state);
        config.poll_interval_ms = self.pipeline.poll_interval_ms;
        config.wait_timeout_ms = self.pipeline.wait_timeout_ms;
        config
    }
}
