use tokio_util::sync::CancellationToken;

use crate::error::IngestError;
use crate::types::{Epoch, ExecutionResult};

/// Computes the output for a single key. Called concurrently from the worker pool.
pub trait Executor<K, Out>: Send + Sync {
    fn execute(&self, key: K, cancel: &CancellationToken) -> ExecutionResult<K, Out>;
}

/// Applies the successful outputs of one batch. Called from a single thread.
pub trait CommitSink<K, Out>: Send + Sync {
    fn commit_batch(&self, epoch: Epoch, outputs: Vec<(K, Out)>) -> Result<usize, IngestError>;
}

pub trait RuntimeMetrics: Send + Sync {
    fn observe_queue_depth(&self, queue: &'static str, depth: usize);
    fn observe_throughput(&self, stage: &'static str, count: usize);
    fn observe_latency_ms(&self, stage: &'static str, millis: u64);
}

#[derive(Debug, Default)]
pub struct NoopRuntimeMetrics;

impl RuntimeMetrics for NoopRuntimeMetrics {
    fn observe_queue_depth(&self, _queue: &'static str, _depth: usize) {}
    fn observe_throughput(&self, _stage: &'static str, _count: usize) {}
    fn observe_latency_ms(&self, _stage: &'static str, _millis: u64) {}
}
