//! Single-writer loop that recomputes dirty files in batches.
//!
//! Per-file resolution fans out to the ingest worker pool; inversion and the
//! store commit run on the scheduler thread only.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use refscope_ingest::{
    CommitSink, Epoch, ExecutionResult, Executor, FlowController, IngestError, RuntimeMetrics,
    run_batch,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::Result;
use crate::host::PauseSignal;
use crate::model::{FileId, FileIdSet};
use crate::queue::WorkQueue;
use crate::resolver::{ResolveContext, ResolveError, Resolver};
use crate::storage::{CommitStats, CompactionPolicy, GraphStore, OperationLog};

/// Pause state shared by the engine, the scheduler loop and worker units.
pub struct SchedulerState {
    disabled: AtomicBool,
    signal: Option<Arc<dyn PauseSignal>>,
    batch: Mutex<Option<CancellationToken>>,
}

impl SchedulerState {
    pub fn new(signal: Option<Arc<dyn PauseSignal>>) -> Self {
        Self {
            disabled: AtomicBool::new(false),
            signal,
            batch: Mutex::new(None),
        }
    }

    /// Stops new batches and cancels the units of the running one.
    pub fn disable(&self) {
        self.disabled.store(true, Ordering::SeqCst);
        let batch = self.batch.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(token) = batch.as_ref() {
            token.cancel();
        }
    }

    pub fn enable(&self) {
        self.disabled.store(false, Ordering::SeqCst);
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.is_disabled() || self.signal.as_ref().is_some_and(|s| s.is_paused())
    }

    fn begin_batch(&self, parent: &CancellationToken) -> CancellationToken {
        let token = parent.child_token();
        *self.batch.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
        if self.is_disabled() {
            token.cancel();
        }
        token
    }

    fn end_batch(&self) {
        *self.batch.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Runs the resolver for one file inside a worker unit.
pub struct ResolveExecutor {
    resolver: Arc<dyn Resolver>,
    state: Arc<SchedulerState>,
}

impl ResolveExecutor {
    pub fn new(resolver: Arc<dyn Resolver>, state: Arc<SchedulerState>) -> Self {
        Self { resolver, state }
    }
}

impl Executor<FileId, FileIdSet> for ResolveExecutor {
    fn execute(
        &self,
        file: FileId,
        cancel: &CancellationToken,
    ) -> ExecutionResult<FileId, FileIdSet> {
        let ctx = ResolveContext::with_state(cancel, &self.state);
        if ctx.is_cancelled() {
            return ExecutionResult::retry(file);
        }

        let outcome = catch_unwind(AssertUnwindSafe(|| self.resolver.resolve(file, &ctx)));
        match outcome {
            Ok(Ok(mut forward)) => {
                if ctx.is_cancelled() {
                    return ExecutionResult::retry(file);
                }
                forward.remove(&file);
                ExecutionResult::done(file, forward)
            }
            Ok(Err(ResolveError::NotReady)) => {
                trace!("Resolver not ready for {file}");
                ExecutionResult::retry(file)
            }
            Ok(Err(ResolveError::Cancelled)) => ExecutionResult::retry(file),
            Ok(Err(ResolveError::Fatal(msg))) => ExecutionResult::dropped(file, msg),
            Err(payload) => {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                ExecutionResult::dropped(file, format!("resolver panicked: {msg}"))
            }
        }
    }
}

/// Inverts a batch of forward sets into the backward store.
pub struct BackwardCommitSink {
    graph: Arc<GraphStore>,
    last: Mutex<Option<CommitStats>>,
}

impl BackwardCommitSink {
    pub fn new(graph: Arc<GraphStore>) -> Self {
        Self {
            graph,
            last: Mutex::new(None),
        }
    }

    fn take_last(&self) -> Option<CommitStats> {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl CommitSink<FileId, FileIdSet> for BackwardCommitSink {
    fn commit_batch(
        &self,
        epoch: Epoch,
        outputs: Vec<(FileId, FileIdSet)>,
    ) -> std::result::Result<usize, IngestError> {
        let stats = self.graph.commit(outputs)?;
        trace!("epoch {epoch}: {stats:?}");
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(stats);
        Ok(stats.files)
    }
}

/// Reports kernel measurements as trace events.
#[derive(Debug, Default)]
pub struct TracingMetrics;

impl RuntimeMetrics for TracingMetrics {
    fn observe_queue_depth(&self, queue: &'static str, depth: usize) {
        trace!(queue, depth, "queue depth");
    }

    fn observe_throughput(&self, stage: &'static str, count: usize) {
        trace!(stage, count, "throughput");
    }

    fn observe_latency_ms(&self, stage: &'static str, millis: u64) {
        trace!(stage, millis, "latency");
    }
}

/// Outcome of one processed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub epoch: Epoch,
    pub claimed: usize,
    pub committed: Vec<FileId>,
    pub retried: Vec<FileId>,
    pub dropped: usize,
    pub commit: CommitStats,
    pub compacted: bool,
    pub execute_ms: u64,
    pub commit_ms: u64,
}

pub struct IndexingScheduler {
    queue: Arc<WorkQueue>,
    graph: Arc<GraphStore>,
    state: Arc<SchedulerState>,
    executor: ResolveExecutor,
    sink: BackwardCommitSink,
    controller: FlowController,
    metrics: TracingMetrics,
    oplog: Arc<OperationLog>,
    compaction: CompactionPolicy,
    shutdown: CancellationToken,
    epoch: AtomicU64,
    running: Mutex<()>,
}

impl IndexingScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<WorkQueue>,
        graph: Arc<GraphStore>,
        state: Arc<SchedulerState>,
        resolver: Arc<dyn Resolver>,
        controller: FlowController,
        oplog: Arc<OperationLog>,
        compaction: CompactionPolicy,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            executor: ResolveExecutor::new(resolver, Arc::clone(&state)),
            sink: BackwardCommitSink::new(Arc::clone(&graph)),
            queue,
            graph,
            state,
            controller,
            metrics: TracingMetrics,
            oplog,
            compaction,
            shutdown,
            epoch: AtomicU64::new(0),
            running: Mutex::new(()),
        }
    }

    pub fn state(&self) -> &Arc<SchedulerState> {
        &self.state
    }

    /// Claims and processes one batch. Returns `None` when paused or idle.
    ///
    /// On a failed commit or compaction the whole batch is queued again and
    /// the error is returned. Files forgotten meanwhile are left out.
    pub fn run_one_batch(&self) -> Result<Option<BatchReport>> {
        let _running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if self.state.is_paused() {
            return Ok(None);
        }
        let files = self.queue.claim_batch(self.controller.batch_size());
        if files.is_empty() {
            return Ok(None);
        }

        let claimed = files.len();
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = self.state.begin_batch(&self.shutdown);
        let outcome = run_batch(
            epoch,
            files.clone(),
            &self.executor,
            &self.sink,
            &self.metrics,
            &self.controller,
            &cancel,
        );
        self.state.end_batch();

        let stats = match outcome {
            Ok(stats) => stats,
            Err(e) => {
                error!("Commit of epoch {epoch} failed, re-queueing {claimed} file(s): {e}");
                self.oplog
                    .line(format!("epoch={epoch} commit_failed files={claimed} error={e}"));
                self.queue.requeue_retries(&files);
                self.queue.finish_batch(claimed, &[]);
                return Err(e.into());
            }
        };

        let commit = self.sink.take_last().unwrap_or_default();
        let compacted = match self.compact_if_needed(epoch) {
            Ok(compacted) => compacted,
            Err(e) => {
                error!("Compaction after epoch {epoch} failed, re-queueing {claimed} file(s): {e}");
                self.oplog.line(format!("epoch={epoch} compaction_failed error={e}"));
                self.queue.requeue_retries(&files);
                self.queue.finish_batch(claimed, &[]);
                return Err(e);
            }
        };

        self.queue.requeue_retries(&stats.retry);
        self.queue.finish_batch(claimed, &stats.committed);

        let gap = self.graph.gap_bytes().unwrap_or(0);

        self.oplog.line(format!(
            "epoch={epoch} claimed={claimed} committed={} retry={} dropped={} added={} removed={} execute_ms={} commit_ms={} gap={gap}",
            stats.committed.len(),
            stats.retry.len(),
            stats.dropped,
            commit.edges_added,
            commit.edges_removed,
            stats.execute_ms,
            stats.commit_ms,
        ));
        debug!(
            "Batch {epoch}: {} committed, {} retried, {} dropped",
            stats.committed.len(),
            stats.retry.len(),
            stats.dropped
        );

        Ok(Some(BatchReport {
            epoch,
            claimed,
            committed: stats.committed,
            retried: stats.retry,
            dropped: stats.dropped,
            commit,
            compacted,
            execute_ms: stats.execute_ms,
            commit_ms: stats.commit_ms,
        }))
    }

    /// Runs the compaction policy. Returns true if any store was rewritten.
    fn compact_if_needed(&self, epoch: Epoch) -> Result<bool> {
        let done = self.graph.maybe_compact(&self.compaction)?;
        for stats in &done {
            info!(
                "Compacted store to generation {}: reclaimed {} bytes",
                stats.generation, stats.reclaimed_bytes
            );
            self.oplog.line(format!(
                "epoch={epoch} compaction generation={} reclaimed={} live={}",
                stats.generation, stats.reclaimed_bytes, stats.live_bytes
            ));
        }
        Ok(!done.is_empty())
    }

    /// Processes batches until the queue is drained or the scheduler is paused.
    /// Stops early when a batch only produced retries, so a resolver that
    /// keeps reporting `NotReady` cannot spin the caller.
    pub fn drain(&self) -> Result<Vec<BatchReport>> {
        let mut reports = Vec::new();
        while let Some(report) = self.run_one_batch()? {
            let stalled = report.committed.is_empty() && report.dropped == 0;
            reports.push(report);
            if stalled {
                break;
            }
        }
        Ok(reports)
    }

    fn run(&self) {
        info!(
            "Indexer started with {} worker(s), batch size {}",
            self.controller.worker_threads(),
            self.controller.batch_size()
        );
        let idle_wait = self.controller.idle_wait();

        while !self.shutdown.is_cancelled() && !self.queue.is_closed() {
            if self.state.is_paused() {
                self.queue.park(idle_wait);
                continue;
            }
            if self.queue.is_empty() {
                self.queue.wait_for_work(idle_wait);
                continue;
            }
            if let Err(e) = self.run_one_batch() {
                warn!("Indexer backing off after failed batch: {e}");
                self.queue.park(idle_wait);
            }
        }
        info!("Indexer stopped");
    }

    /// Starts the loop on its own thread.
    pub fn spawn(self: Arc<Self>) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("refscope-indexer".to_string())
            .spawn(move || self.run())
    }
}
