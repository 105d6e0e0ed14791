use std::path::Path;
use std::thread;

use serde::{Deserialize, Serialize};

use crate::queue::QueueOrdering;

const DEFAULT_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_PREWARM: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid scheduler config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid scheduler config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub worker_count: Option<usize>,
    pub pending_capacity: usize,
    pub waiting_capacity: usize,
    pub completed_capacity: usize,
    pub ordering: QueueOrdering,
    pub prewarm_jobs: usize,
    pub prewarm_links: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: None,
            pending_capacity: DEFAULT_QUEUE_CAPACITY,
            waiting_capacity: DEFAULT_QUEUE_CAPACITY,
            completed_capacity: DEFAULT_QUEUE_CAPACITY,
            ordering: QueueOrdering::Priority,
            prewarm_jobs: DEFAULT_PREWARM,
            prewarm_links: DEFAULT_PREWARM,
        }
    }
}

impl SchedulerConfig {
    pub fn with_workers(worker_count: usize) -> Self {
        Self {
            worker_count: Some(worker_count),
            ..Self::default()
        }
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.pending_capacity = capacity;
        self.waiting_capacity = capacity;
        self.completed_capacity = capacity;
        self
    }

    pub fn parse_toml(text: &str) -> Result<Self, ConfigError> {
        let config: SchedulerConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse_toml(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let capacities = [
            ("pending_capacity", self.pending_capacity),
            ("waiting_capacity", self.waiting_capacity),
            ("completed_capacity", self.completed_capacity),
        ];
        for (name, value) in capacities {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be > 0", name)));
            }
        }
        Ok(())
    }

    pub fn resolved_worker_count(&self) -> usize {
        match self.worker_count {
            Some(count) if count > 0 => count,
            _ => default_worker_count(),
        }
    }
}

pub fn default_worker_count() -> usize {
    thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}
