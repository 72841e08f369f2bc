use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use refscope_core::{FileChangeSource, FileEvent, FileTree};
use refscope_ingest::IntakeHandle;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::project::{ProjectFiles, is_relevant_path};
use crate::session::{Session, SessionOptions};

const DEBOUNCE: Duration = Duration::from_millis(500);

/// Turns file system notifications into [`FileEvent`]s for the engine.
pub struct ProjectWatcher {
    files: Arc<ProjectFiles>,
    cancel: CancellationToken,
    _watcher: RecommendedWatcher,
    rx: Option<mpsc::UnboundedReceiver<notify::Result<Event>>>,
    task: Option<JoinHandle<()>>,
}

impl ProjectWatcher {
    pub fn new(files: Arc<ProjectFiles>, cancel: CancellationToken) -> notify::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            Config::default(),
        )?;
        watcher.watch(files.root(), RecursiveMode::Recursive)?;
        Ok(Self {
            files,
            cancel,
            _watcher: watcher,
            rx: Some(rx),
            task: None,
        })
    }

    /// Waits for the forwarding task to end after the token was cancelled.
    pub async fn stopped(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Watch task failed: {e}");
            }
        }
    }
}

/// Registry updates for a debounced set of paths. A file appearing or
/// disappearing changes which stems resolve, so every file is re-queued.
pub fn collect_events(files: &ProjectFiles, paths: impl IntoIterator<Item = PathBuf>) -> Vec<FileEvent> {
    let mut events = Vec::new();
    let mut file_set_changed = false;
    for path in paths {
        let known = files.id_of(&path).is_some();
        match files.refresh_path(&path) {
            Some(event @ FileEvent::Changed(_)) => {
                file_set_changed |= !known;
                events.push(event);
            }
            Some(event @ FileEvent::Removed(_)) => {
                file_set_changed = true;
                events.push(event);
            }
            None => {}
        }
    }
    if file_set_changed {
        events.extend(files.file_ids().into_iter().map(FileEvent::Changed));
    }
    events
}

impl FileChangeSource for ProjectWatcher {
    fn attach(&mut self, intake: IntakeHandle<FileEvent>) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        let files = Arc::clone(&self.files);
        let cancel = self.cancel.clone();

        self.task = Some(tokio::spawn(async move {
            info!("Started watching {}", files.root().display());
            let mut pending: HashSet<PathBuf> = HashSet::new();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(Ok(event)) => {
                            pending.extend(event.paths.into_iter().filter(|p| is_relevant_path(p)));
                        }
                        Some(Err(e)) => warn!("Watch error: {e}"),
                        None => break,
                    },
                    _ = tokio::time::sleep(DEBOUNCE), if !pending.is_empty() => {
                        let events = collect_events(&files, pending.drain());
                        if events.is_empty() {
                            continue;
                        }
                        info!("Detected {} change(s). Updating...", events.len());
                        for event in events {
                            if let Err(e) = intake.submit(event).await {
                                error!("Failed to submit file change: {e}");
                                return;
                            }
                        }
                    }
                }
            }
            debug!("File watcher task ended for {}", files.root().display());
        }));
    }
}

pub async fn run(path: PathBuf, options: SessionOptions) -> Result<(), Box<dyn std::error::Error>> {
    let session = Session::open(&path, &options)?;
    session.engine.start()?;

    let cancel = CancellationToken::new();
    let mut watcher = ProjectWatcher::new(Arc::clone(&session.files), cancel.clone())?;
    session.engine.subscribe(&mut watcher);
    info!("File watcher started. Ready for changes.");
    info!("Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    cancel.cancel();
    watcher.stopped().await;
    drop(watcher);
    info!("Watcher stopped.");

    session.close()
}
