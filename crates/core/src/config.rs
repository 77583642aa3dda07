use crate::error::{EngineError, Result};
use crate::types::PipelineId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Run-time configuration of a pipeline.
///
/// `max_concurrency`, `timeout_ms` and `auto_retry` are advisory: they are
/// carried for collaborators and logged, but the execution loop neither caps
/// concurrency, enforces a deadline, nor retries on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub id: PipelineId,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub max_concurrency: Option<usize>,

    #[serde(default)]
    pub timeout_ms: Option<u64>,

    #[serde(default)]
    pub auto_retry: bool,

    #[serde(default)]
    pub persist_state: bool,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default)]
    pub wait_timeout_ms: Option<u64>,
}

fn default_poll_interval_ms() -> u64 {
    50
}

/// Whole milliseconds, saturating at `u64::MAX`
fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl PipelineConfig {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id: PipelineId(id),
            description: None,
            max_concurrency: None,
            timeout_ms: None,
            auto_retry: false,
            persist_state: false,
            poll_interval_ms: default_poll_interval_ms(),
            wait_timeout_ms: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_persist_state(mut self, persist: bool) -> Self {
        self.persist_state = persist;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = duration_ms(interval);
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout_ms = Some(duration_ms(timeout));
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_ms.map(Duration::from_millis)
    }

    /// Key under which the pipeline state is persisted
    pub fn state_key(&self) -> String {
        format!("pipeline_{}", self.id)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.0.trim().is_empty() {
            return Err(EngineError::control("Pipeline id is required"));
        }
        if self.max_concurrency == Some(0) {
            return Err(EngineError::control("max_concurrency must be at least 1"));
        }
        Ok(())
    }
}
