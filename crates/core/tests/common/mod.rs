use refscope_core::{
    EngineConfig, FileId, FileIdSet, FileTree, RefGraphEngine, ResolveContext, ResolveError,
    Resolver,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

pub fn id(raw: u32) -> FileId {
    FileId::new(raw)
}

pub fn ids(raw: &[u32]) -> Vec<FileId> {
    raw.iter().copied().map(FileId::new).collect()
}

#[allow(dead_code)]
pub fn sorted(list: Option<Vec<FileId>>) -> Option<Vec<FileId>> {
    list.map(|mut list| {
        list.sort();
        list
    })
}

/// Resolver backed by an editable table, with scripted failures.
#[derive(Default)]
pub struct MapResolver {
    edges: RwLock<HashMap<FileId, FileIdSet>>,
    not_ready: Mutex<HashMap<FileId, usize>>,
    fatal: RwLock<HashSet<FileId>>,
    panics: RwLock<HashSet<FileId>>,
    calls: AtomicUsize,
}

#[allow(dead_code)]
impl MapResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, file: u32, targets: &[u32]) {
        self.edges
            .write()
            .unwrap()
            .insert(id(file), targets.iter().copied().map(FileId::new).collect());
    }

    pub fn fail_not_ready(&self, file: u32, times: usize) {
        self.not_ready.lock().unwrap().insert(id(file), times);
    }

    pub fn fail_fatal(&self, file: u32) {
        self.fatal.write().unwrap().insert(id(file));
    }

    pub fn panic_on(&self, file: u32) {
        self.panics.write().unwrap().insert(id(file));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Resolver for MapResolver {
    fn resolve(&self, file: FileId, ctx: &ResolveContext<'_>) -> Result<FileIdSet, ResolveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ctx.check_cancelled()?;

        if let Some(remaining) = self.not_ready.lock().unwrap().get_mut(&file) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ResolveError::NotReady);
            }
        }
        if self.fatal.read().unwrap().contains(&file) {
            return Err(ResolveError::Fatal(format!("cannot parse {file}")));
        }
        let should_panic = self.panics.read().unwrap().contains(&file);
        if should_panic {
            panic!("resolver bug on {file}");
        }
        Ok(self
            .edges
            .read()
            .unwrap()
            .get(&file)
            .cloned()
            .unwrap_or_default())
    }
}

/// File tree whose membership tests can edit.
#[derive(Default)]
pub struct StaticTree {
    files: RwLock<BTreeSet<FileId>>,
}

#[allow(dead_code)]
impl StaticTree {
    pub fn with_files(raw: &[u32]) -> Arc<Self> {
        let tree = Self::default();
        tree.files.write().unwrap().extend(ids(raw));
        Arc::new(tree)
    }

    pub fn remove(&self, file: u32) {
        self.files.write().unwrap().remove(&id(file));
    }
}

impl FileTree for StaticTree {
    fn file_ids(&self) -> Vec<FileId> {
        self.files.read().unwrap().iter().copied().collect()
    }

    fn is_live(&self, file: FileId) -> bool {
        self.files.read().unwrap().contains(&file)
    }
}

pub fn test_config(dir: &Path) -> EngineConfig {
    EngineConfig::default()
        .with_index_dir(dir)
        .with_batch_size(2)
        .with_worker_threads(2)
}

#[allow(dead_code)]
pub fn open_engine(
    dir: &Path,
    resolver: Arc<MapResolver>,
    tree: Arc<StaticTree>,
) -> RefGraphEngine {
    RefGraphEngine::open(test_config(dir), resolver, tree).expect("engine should open")
}

/// Runs batches until the engine is up to date or `rounds` is exhausted.
#[allow(dead_code)]
pub fn settle(engine: &RefGraphEngine, rounds: usize) -> bool {
    for _ in 0..rounds {
        engine.process_pending().expect("batch should commit");
        if engine.is_up_to_date() {
            return true;
        }
    }
    engine.is_up_to_date()
}

#[allow(dead_code)]
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
