use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use xxhash_rust::xxh3::xxh3_64;

use refscope_ingest::RuntimeConfig;

use crate::error::Result;
use crate::storage::CompactionPolicy;

pub const DEFAULT_INDEX_DIR: &str = ".refscope/indices";

/// Engine settings. Every field falls back to its default when missing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub index_dir: PathBuf,
    pub batch_size: usize,
    pub worker_threads: usize,
    pub idle_wait_ms: u64,
    pub intake_capacity: usize,
    pub compaction: CompactionPolicy,
    pub oplog_max_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let runtime = RuntimeConfig::default();
        Self {
            index_dir: get_base_index_dir().join("default"),
            batch_size: runtime.batch_size,
            worker_threads: runtime.worker_threads,
            idle_wait_ms: runtime.idle_wait_ms,
            intake_capacity: runtime.intake_capacity,
            compaction: CompactionPolicy::default(),
            oplog_max_bytes: 8 * 1024 * 1024,
        }
    }
}

impl EngineConfig {
    /// Default settings with the index stored under the project's hashed root.
    pub fn for_project(project_root: &Path) -> Self {
        Self {
            index_dir: index_dir_for(project_root),
            ..Self::default()
        }
    }

    /// Reads settings from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn with_index_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.index_dir = dir.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            batch_size: self.batch_size,
            worker_threads: self.worker_threads,
            idle_wait_ms: self.idle_wait_ms,
            intake_capacity: self.intake_capacity,
        }
    }
}

/// Gets the base directory for storing indices, supporting REFSCOPE_INDEX_DIR env var.
pub fn get_base_index_dir() -> PathBuf {
    if let Ok(env_dir) = std::env::var("REFSCOPE_INDEX_DIR") {
        return PathBuf::from(env_dir);
    }

    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DEFAULT_INDEX_DIR)
}

/// Index directory for a project root.
pub fn index_dir_for(project_root: &Path) -> PathBuf {
    let abs_path = project_root
        .canonicalize()
        .unwrap_or_else(|_| project_root.to_path_buf());
    let hash = xxh3_64(abs_path.to_string_lossy().as_bytes());
    get_base_index_dir().join(format!("{:016x}", hash))
}
