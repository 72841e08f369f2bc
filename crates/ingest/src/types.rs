pub type Epoch = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Output is ready to be committed.
    Done,
    /// Transient failure; the caller should schedule the key again.
    Retry,
    /// Unexpected failure; the key is discarded for this run.
    Dropped,
}

#[derive(Debug, Clone)]
pub struct ExecutionResult<K, Out> {
    pub key: K,
    pub status: ExecutionStatus,
    pub output: Option<Out>,
    pub error: Option<String>,
}

impl<K, Out> ExecutionResult<K, Out> {
    pub fn done(key: K, output: Out) -> Self {
        Self {
            key,
            status: ExecutionStatus::Done,
            output: Some(output),
            error: None,
        }
    }

    pub fn retry(key: K) -> Self {
        Self {
            key,
            status: ExecutionStatus::Retry,
            output: None,
            error: None,
        }
    }

    pub fn dropped(key: K, error: impl Into<String>) -> Self {
        Self {
            key,
            status: ExecutionStatus::Dropped,
            output: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub batch_size: usize,
    pub worker_threads: usize,
    pub idle_wait_ms: u64,
    pub intake_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            batch_size: 256,
            worker_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            idle_wait_ms: 500,
            intake_capacity: 1024,
        }
    }
}
