//! Reference graph engine
//!
//! Wires the persisted graph, the work queue and the indexing scheduler
//! together and exposes the host-facing operations:
//! - `queue`/`forget` feed file changes in
//! - `backward_ids_of`/`restrict_scope` answer scope queries
//! - `start`/`shutdown` own the background threads and the checkpoint

use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use refscope_ingest::{FlowControlConfig, FlowController, IntakeHandle, IntakeReceiver, intake_channel};

use crate::config::EngineConfig;
use crate::error::{RefScopeError, Result};
use crate::host::{FileChangeSource, FileTree, PauseSignal};
use crate::model::{FileEvent, FileId};
use crate::queue::WorkQueue;
use crate::resolver::Resolver;
use crate::scheduler::{BatchReport, IndexingScheduler, SchedulerState};
use crate::scope::{ScopeQueryService, ScopeRestriction};
use crate::storage::{GraphStore, LivenessCheckpoint, OpenReport, OperationLog, StoreLayout};

/// Counters reported by [`RefGraphEngine::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub index_dir: PathBuf,
    pub queued: usize,
    pub in_flight: usize,
    pub resolved: usize,
    pub targets: usize,
    pub data_bytes: u64,
    pub gap_bytes: u64,
    pub up_to_date: bool,
    pub paused: bool,
}

/// How `open` brought the index into a usable state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub store: OpenReport,
    /// The stores could not be trusted and were emptied; every file is recomputed.
    pub discarded: bool,
    /// A valid liveness checkpoint was found and applied.
    pub checkpoint_loaded: bool,
    pub requeued: usize,
}

pub struct EngineBuilder {
    config: EngineConfig,
    resolver: Arc<dyn Resolver>,
    tree: Arc<dyn FileTree>,
    pause: Option<Arc<dyn PauseSignal>>,
}

impl EngineBuilder {
    pub fn with_pause_signal(mut self, signal: Arc<dyn PauseSignal>) -> Self {
        self.pause = Some(signal);
        self
    }

    pub fn open(self) -> Result<RefGraphEngine> {
        RefGraphEngine::open_inner(self)
    }
}

pub struct RefGraphEngine {
    config: EngineConfig,
    layout: StoreLayout,

    /// Dirty files plus the liveness bits
    queue: Arc<WorkQueue>,

    /// Backward edges and forward records
    graph: Arc<GraphStore>,

    state: Arc<SchedulerState>,
    scheduler: Arc<IndexingScheduler>,
    scope: ScopeQueryService,
    tree: Arc<dyn FileTree>,
    oplog: Arc<OperationLog>,

    /// Cancels the scheduler loop, the intake pump and any running batch
    shutdown: CancellationToken,

    intake: IntakeHandle<FileEvent>,
    /// Taken by `start`; drained synchronously by `process_pending` until then
    intake_rx: Mutex<Option<IntakeReceiver<FileEvent>>>,

    threads: Mutex<Vec<JoinHandle<()>>>,
    recovery: RecoveryReport,
    closed: AtomicBool,
}

impl RefGraphEngine {
    pub fn builder(
        config: EngineConfig,
        resolver: Arc<dyn Resolver>,
        tree: Arc<dyn FileTree>,
    ) -> EngineBuilder {
        EngineBuilder {
            config,
            resolver,
            tree,
            pause: None,
        }
    }

    pub fn open(
        config: EngineConfig,
        resolver: Arc<dyn Resolver>,
        tree: Arc<dyn FileTree>,
    ) -> Result<Self> {
        Self::builder(config, resolver, tree).open()
    }

    fn open_inner(builder: EngineBuilder) -> Result<Self> {
        let EngineBuilder {
            config,
            resolver,
            tree,
            pause,
        } = builder;

        fs::create_dir_all(&config.index_dir)?;
        let layout = StoreLayout::new(&config.index_dir);
        let oplog = Arc::new(OperationLog::open(&layout.oplog(), config.oplog_max_bytes)?);

        let (mut graph, store_report, mut discarded) = match GraphStore::open(&layout) {
            Ok((graph, report)) => (graph, report, false),
            Err(e @ RefScopeError::Corrupted { .. }) => {
                warn!("Discarding unreadable index at {}: {e}", layout.root().display());
                oplog.line(format!("discard reason={e}"));
                Self::remove_graph_files(&layout)?;
                let (graph, report) = GraphStore::open(&layout)?;
                (graph, report, true)
            }
            Err(e) => return Err(e),
        };

        // Forward records are only trustworthy together with a checkpoint from
        // a clean shutdown; otherwise everything is rebuilt from scratch.
        let checkpoint = LivenessCheckpoint::load(&layout.liveness())?;
        let reason = if store_report.repaired > 0 {
            Some("damaged records")
        } else if checkpoint.is_none() && !store_report.created && !discarded {
            Some("no clean shutdown checkpoint")
        } else {
            None
        };
        if let Some(reason) = reason {
            warn!(
                "Rebuilding index at {} from scratch: {reason}",
                layout.root().display()
            );
            oplog.line(format!("discard reason={reason}"));
            graph.close()?;
            Self::remove_graph_files(&layout)?;
            graph = GraphStore::open(&layout)?.0;
            discarded = true;
        }

        let queue = Arc::new(WorkQueue::new());
        let checkpoint_loaded = match checkpoint {
            Some(resolved) if !discarded => {
                queue.load_resolved(resolved);
                true
            }
            _ => false,
        };

        let resolved = queue.snapshot_resolved();
        let requeued = queue.mark_dirty_all(
            tree.file_ids()
                .into_iter()
                .filter(|id| !resolved.get(*id)),
        );

        let graph = Arc::new(graph);
        let state = Arc::new(SchedulerState::new(pause));
        let shutdown = CancellationToken::new();
        let controller = FlowController::new(&FlowControlConfig::from(&config.runtime_config()))?;
        let scheduler = Arc::new(IndexingScheduler::new(
            Arc::clone(&queue),
            Arc::clone(&graph),
            Arc::clone(&state),
            resolver,
            controller,
            Arc::clone(&oplog),
            config.compaction,
            shutdown.clone(),
        ));
        let scope = ScopeQueryService::new(Arc::clone(&queue), Arc::clone(&graph), Arc::clone(&tree));
        let (intake, intake_rx) = intake_channel(config.intake_capacity);

        let recovery = RecoveryReport {
            store: store_report,
            discarded,
            checkpoint_loaded,
            requeued,
        };
        oplog.line(format!(
            "open discarded={} repaired={} rolled_forward={} checkpoint={} requeued={requeued}",
            discarded, recovery.store.repaired, recovery.store.rolled_forward, checkpoint_loaded
        ));
        info!(
            "Opened reference graph at {} ({} file(s) queued)",
            layout.root().display(),
            requeued
        );

        Ok(Self {
            config,
            layout,
            queue,
            graph,
            state,
            scheduler,
            scope,
            tree,
            oplog,
            shutdown,
            intake,
            intake_rx: Mutex::new(Some(intake_rx)),
            threads: Mutex::new(Vec::new()),
            recovery,
            closed: AtomicBool::new(false),
        })
    }

    fn remove_graph_files(layout: &StoreLayout) -> Result<()> {
        for path in layout.graph_files() {
            match fs::remove_file(&path) {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RefScopeError::StorageUnavailable(
                "engine has been shut down".to_string(),
            ));
        }
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Marks files dirty. Returns true if at least one was newly queued.
    pub fn queue(&self, files: &[FileId], reason: &str) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let added = self.queue.mark_dirty_all(files.iter().copied());
        if added > 0 {
            debug!("Queued {added} file(s): {reason}");
        }
        added > 0
    }

    /// Stops tracking deleted or out-of-scope files.
    pub fn forget(&self, files: &[FileId], reason: &str) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.queue.force_resolved(files);
        debug!("Forgot {} file(s): {reason}", files.len());
    }

    pub fn is_up_to_date(&self) -> bool {
        self.queue.is_up_to_date()
    }

    pub fn backward_ids_of(&self, file: FileId) -> Option<Vec<FileId>> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        self.scope.backward_ids_of(file)
    }

    pub fn restrict_scope(&self, file: FileId) -> ScopeRestriction {
        if self.closed.load(Ordering::SeqCst) {
            return ScopeRestriction::Unrestricted;
        }
        self.scope.restrict(file)
    }

    /// Producer handle for file change events.
    pub fn intake(&self) -> IntakeHandle<FileEvent> {
        self.intake.clone()
    }

    pub fn subscribe(&self, source: &mut dyn FileChangeSource) {
        source.attach(self.intake());
    }

    /// Starts the scheduler thread and the intake pump. Calling it again is a no-op.
    pub fn start(&self) -> Result<()> {
        self.ensure_open()?;
        let Some(mut rx) = self
            .intake_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Ok(());
        };

        let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
        threads.push(Arc::clone(&self.scheduler).spawn()?);

        let queue = Arc::clone(&self.queue);
        let shutdown = self.shutdown.clone();
        let pump = thread::Builder::new()
            .name("refscope-intake".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        warn!("Intake pump could not start: {e}");
                        return;
                    }
                };
                runtime.block_on(async move {
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            event = rx.recv() => match event {
                                Some(event) => apply_event(&queue, event),
                                None => break,
                            },
                        }
                    }
                });
                debug!("Intake pump stopped");
            })?;
        threads.push(pump);
        Ok(())
    }

    /// Runs batches on the calling thread until the queue is drained, the
    /// scheduler is paused or only retries remain.
    pub fn process_pending(&self) -> Result<Vec<BatchReport>> {
        self.ensure_open()?;
        self.drain_intake();
        self.scheduler.drain()
    }

    fn drain_intake(&self) {
        let mut guard = self.intake_rx.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(rx) = guard.as_mut() {
            while let Some(event) = rx.try_recv() {
                apply_event(&self.queue, event);
            }
        }
    }

    pub fn pause(&self) {
        self.state.disable();
        self.oplog.line("pause");
        info!("Indexing paused");
    }

    pub fn resume(&self) {
        self.state.enable();
        self.queue.wake();
        self.oplog.line("resume");
        info!("Indexing resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.state.is_paused()
    }

    pub fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        self.graph.flush()
    }

    pub fn stats(&self) -> Result<EngineStats> {
        self.ensure_open()?;
        let queue = self.queue.stats();
        Ok(EngineStats {
            index_dir: self.layout.root().to_path_buf(),
            queued: queue.queued,
            in_flight: queue.in_flight,
            resolved: queue.resolved,
            targets: self.graph.target_count()?,
            data_bytes: self.graph.data_len()?,
            gap_bytes: self.graph.gap_bytes()?,
            up_to_date: self.queue.is_up_to_date(),
            paused: self.state.is_paused(),
        })
    }

    /// Stops background work, flushes the stores and writes the liveness
    /// checkpoint. Later calls are no-ops.
    pub fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.cancel();
        self.queue.close();
        // Producers see a closed intake even if `start` never took the receiver.
        drop(
            self.intake_rx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        let threads: Vec<_> = self
            .threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in threads {
            if handle.join().is_err() {
                warn!("Background thread panicked during shutdown");
            }
        }

        self.graph.flush()?;
        let resolved = self.queue.snapshot_resolved();
        let unresolved = self
            .tree
            .file_ids()
            .into_iter()
            .filter(|id| !resolved.get(*id))
            .count();
        LivenessCheckpoint::save(&self.layout.liveness(), &resolved)?;
        self.graph.close()?;

        self.oplog.line(format!(
            "shutdown resolved={} unresolved={unresolved}",
            resolved.count_ones()
        ));
        info!("Reference graph closed ({unresolved} file(s) left unresolved)");
        Ok(())
    }
}

impl Drop for RefGraphEngine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("Failed to shut down reference graph cleanly: {e}");
        }
    }
}

fn apply_event(queue: &WorkQueue, event: FileEvent) {
    match event {
        FileEvent::Changed(id) => {
            queue.mark_dirty(id);
        }
        FileEvent::Removed(id) => queue.force_resolved(&[id]),
    }
}
