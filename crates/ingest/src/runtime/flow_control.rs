use std::sync::Arc;
use std::time::Duration;

use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::IngestError;
use crate::types::RuntimeConfig;

#[derive(Debug, Clone)]
pub struct FlowControlConfig {
    pub batch_size: usize,
    pub worker_threads: usize,
    pub idle_wait_ms: u64,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        FlowControlConfig::from(&RuntimeConfig::default())
    }
}

impl From<&RuntimeConfig> for FlowControlConfig {
    fn from(value: &RuntimeConfig) -> Self {
        Self {
            batch_size: value.batch_size,
            worker_threads: value.worker_threads,
            idle_wait_ms: value.idle_wait_ms,
        }
    }
}

/// Bounds how much work a batch may claim and how many units run at once.
#[derive(Clone)]
pub struct FlowController {
    pool: Arc<ThreadPool>,
    batch_size: usize,
    idle_wait: Duration,
}

impl FlowController {
    pub fn new(config: &FlowControlConfig) -> Result<Self, IngestError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.worker_threads.max(1))
            .thread_name(|i| format!("refscope-worker-{i}"))
            .build()
            .map_err(|e| IngestError::Pool(e.to_string()))?;

        Ok(Self {
            pool: Arc::new(pool),
            batch_size: config.batch_size.max(1),
            idle_wait: Duration::from_millis(config.idle_wait_ms.max(1)),
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn idle_wait(&self) -> Duration {
        self.idle_wait
    }

    pub fn worker_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Runs `op` inside the bounded worker pool.
    pub fn install<R, F>(&self, op: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }
}
