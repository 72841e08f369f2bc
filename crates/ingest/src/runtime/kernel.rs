use std::fmt::Debug;
use std::time::Instant;

use rayon::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::IngestError;
use crate::runtime::flow_control::FlowController;
use crate::traits::{CommitSink, Executor, RuntimeMetrics};
use crate::types::{Epoch, ExecutionResult, ExecutionStatus};

#[derive(Debug)]
pub struct KernelRunStats<K> {
    pub epoch: Epoch,
    pub executed: usize,
    /// Keys whose output reached the commit sink.
    pub committed: Vec<K>,
    /// Keys that failed transiently and must be scheduled again.
    pub retry: Vec<K>,
    pub dropped: usize,
    pub execute_ms: u64,
    pub commit_ms: u64,
}

impl<K> KernelRunStats<K> {
    fn new(epoch: Epoch) -> Self {
        Self {
            epoch,
            executed: 0,
            committed: Vec::new(),
            retry: Vec::new(),
            dropped: 0,
            execute_ms: 0,
            commit_ms: 0,
        }
    }
}

/// Executes one batch on the worker pool and hands the successful outputs to
/// the sink in a single call on the current thread.
///
/// A sink error is returned as-is; the caller owns every key of the batch in
/// that case.
pub fn run_batch<K, Out, EX, C, RM>(
    epoch: Epoch,
    keys: Vec<K>,
    executor: &EX,
    sink: &C,
    metrics: &RM,
    controller: &FlowController,
    cancel: &CancellationToken,
) -> Result<KernelRunStats<K>, IngestError>
where
    K: Clone + Debug + Send,
    Out: Send,
    EX: Executor<K, Out> + ?Sized,
    C: CommitSink<K, Out> + ?Sized,
    RM: RuntimeMetrics + ?Sized,
{
    let mut stats = KernelRunStats::new(epoch);
    if keys.is_empty() {
        return Ok(stats);
    }

    metrics.observe_queue_depth("kernel_batch", keys.len());

    let started = Instant::now();
    let results: Vec<ExecutionResult<K, Out>> = controller.install(|| {
        keys.into_par_iter()
            .map(|key| executor.execute(key, cancel))
            .collect()
    });
    stats.execute_ms = started.elapsed().as_millis() as u64;
    stats.executed = results.len();
    metrics.observe_latency_ms("kernel_execute", stats.execute_ms);

    let mut outputs = Vec::with_capacity(results.len());
    for result in results {
        match (result.status, result.output) {
            (ExecutionStatus::Done, Some(output)) => outputs.push((result.key, output)),
            (ExecutionStatus::Done, None) => {
                warn!("executor reported done without output for {:?}", result.key);
                stats.dropped += 1;
            }
            (ExecutionStatus::Retry, _) => stats.retry.push(result.key),
            (ExecutionStatus::Dropped, _) => {
                let emsg = result
                    .error
                    .unwrap_or_else(|| "unknown execution error".to_string());
                warn!("dropping {:?} from epoch {epoch}: {emsg}", result.key);
                stats.dropped += 1;
            }
        }
    }

    if !outputs.is_empty() {
        let committed_keys: Vec<K> = outputs.iter().map(|(key, _)| key.clone()).collect();
        let started = Instant::now();
        sink.commit_batch(epoch, outputs)?;
        stats.commit_ms = started.elapsed().as_millis() as u64;
        stats.committed = committed_keys;
        metrics.observe_latency_ms("kernel_commit", stats.commit_ms);
    }

    metrics.observe_throughput("kernel_committed", stats.committed.len());
    metrics.observe_queue_depth("kernel_retry", stats.retry.len());
    debug!(
        "epoch {epoch}: executed={}, committed={}, retry={}, dropped={}",
        stats.executed,
        stats.committed.len(),
        stats.retry.len(),
        stats.dropped
    );

    Ok(stats)
}
