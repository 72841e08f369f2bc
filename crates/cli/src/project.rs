//! Path registry that gives every project file a stable [`FileId`].

use ignore::WalkBuilder;
use refscope_core::{FileEvent, FileId, FileTree};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

const REGISTRY_FILE: &str = "files.bin";
const REGISTRY_VERSION: u32 = 1;

/// Skips hidden entries and build output directories.
pub fn is_relevant_path(path: &Path) -> bool {
    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
        if name.starts_with('.') {
            return false;
        }
        if name == "target" || name == "build" || name == "node_modules" {
            return false;
        }
    }
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileEntry {
    path: PathBuf,
    content_hash: u64,
}

/// Persisted form of the registry.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Registry {
    version: u32,
    /// Indexed by file id; `None` marks a free slot.
    entries: Vec<Option<FileEntry>>,
    /// Ids that may be handed out again.
    free: Vec<u32>,
    /// Ids freed during the current session; reusable from the next scan on.
    released: Vec<u32>,
}

#[derive(Default)]
struct RegistryState {
    registry: Registry,
    by_path: HashMap<PathBuf, FileId>,
    by_stem: HashMap<String, Vec<FileId>>,
}

impl RegistryState {
    fn from_registry(registry: Registry) -> Self {
        let mut state = Self {
            registry,
            ..Self::default()
        };
        let entries: Vec<(FileId, PathBuf)> = state
            .registry
            .entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|e| (FileId::new(i as u32), e.path.clone())))
            .collect();
        for (id, path) in entries {
            state.index(id, path);
        }
        state
    }

    fn index(&mut self, id: FileId, path: PathBuf) {
        if let Some(stem) = stem_of(&path) {
            self.by_stem.entry(stem).or_default().push(id);
        }
        self.by_path.insert(path, id);
    }

    fn allocate(&mut self, path: PathBuf, content_hash: u64) -> FileId {
        let entry = FileEntry {
            path: path.clone(),
            content_hash,
        };
        let id = match self.registry.free.pop() {
            Some(raw) => {
                self.registry.entries[raw as usize] = Some(entry);
                FileId::new(raw)
            }
            None => {
                self.registry.entries.push(Some(entry));
                FileId::new((self.registry.entries.len() - 1) as u32)
            }
        };
        self.index(id, path);
        id
    }

    fn release(&mut self, id: FileId) {
        let Some(entry) = self
            .registry
            .entries
            .get_mut(id.index())
            .and_then(Option::take)
        else {
            return;
        };
        self.by_path.remove(&entry.path);
        if let Some(stem) = stem_of(&entry.path) {
            if let Some(ids) = self.by_stem.get_mut(&stem) {
                ids.retain(|other| *other != id);
                if ids.is_empty() {
                    self.by_stem.remove(&stem);
                }
            }
        }
        self.registry.released.push(id.as_u32());
    }

    fn entry_mut(&mut self, id: FileId) -> Option<&mut FileEntry> {
        self.registry.entries.get_mut(id.index())?.as_mut()
    }
}

fn stem_of(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.to_string())
}

fn hash_file(path: &Path) -> Option<u64> {
    fs::read(path).ok().map(|bytes| xxh3_64(&bytes))
}

/// Files that changed on disk since the registry last saw them.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanDelta {
    /// New or modified files, including everything in `added`.
    pub changed: Vec<FileId>,
    pub added: Vec<FileId>,
    pub removed: Vec<FileId>,
    pub total: usize,
}

pub struct ProjectFiles {
    root: PathBuf,
    state: RwLock<RegistryState>,
    scanning: AtomicBool,
}

impl ProjectFiles {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.canonicalize().unwrap_or_else(|_| root.to_path_buf()),
            state: RwLock::new(RegistryState::default()),
            scanning: AtomicBool::new(false),
        }
    }

    /// Loads the registry saved in `index_dir`, starting empty when it is
    /// missing or unreadable.
    pub fn load(root: &Path, index_dir: &Path) -> Self {
        let files = Self::new(root);
        let path = index_dir.join(REGISTRY_FILE);
        let registry = match fs::read(&path) {
            Ok(bytes) => match rmp_serde::from_slice::<Registry>(&bytes) {
                Ok(registry) if registry.version == REGISTRY_VERSION => Some(registry),
                Ok(registry) => {
                    warn!(
                        "File registry version mismatch at {} (found {}, expected {}). Will rebuild.",
                        path.display(),
                        registry.version,
                        REGISTRY_VERSION
                    );
                    None
                }
                Err(e) => {
                    warn!("Failed to read file registry {}: {e}", path.display());
                    None
                }
            },
            Err(_) => None,
        };
        if let Some(registry) = registry {
            *files.write() = RegistryState::from_registry(registry);
        }
        files
    }

    pub fn save(&self, index_dir: &Path) -> std::io::Result<()> {
        fs::create_dir_all(index_dir)?;
        let bytes = {
            let state = self.read();
            let mut registry = Registry {
                version: REGISTRY_VERSION,
                entries: state.registry.entries.clone(),
                free: state.registry.free.clone(),
                released: Vec::new(),
            };
            registry.free.extend(state.registry.released.iter().copied());
            rmp_serde::to_vec(&registry)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?
        };
        let path = index_dir.join(REGISTRY_FILE);
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, bytes)?;
        fs::rename(temp_path, path)
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.read().by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn relative(&self, path: &Path) -> Option<PathBuf> {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir().ok()?.join(path)
        };
        let absolute = absolute.canonicalize().unwrap_or(absolute);
        absolute
            .strip_prefix(&self.root)
            .ok()
            .map(Path::to_path_buf)
            .or_else(|| (!path.is_absolute()).then(|| path.to_path_buf()))
    }

    /// Looks a file up by absolute path or path relative to the root.
    pub fn id_of(&self, path: &Path) -> Option<FileId> {
        let state = self.read();
        if let Some(id) = state.by_path.get(path) {
            return Some(*id);
        }
        let relative = self.relative(path)?;
        state.by_path.get(&relative).copied()
    }

    pub fn path_of(&self, id: FileId) -> Option<PathBuf> {
        self.read()
            .registry
            .entries
            .get(id.index())?
            .as_ref()
            .map(|e| e.path.clone())
    }

    pub fn absolute_path_of(&self, id: FileId) -> Option<PathBuf> {
        self.path_of(id).map(|p| self.root.join(p))
    }

    pub fn ids_with_stem(&self, stem: &str) -> Vec<FileId> {
        self.read().by_stem.get(stem).cloned().unwrap_or_default()
    }

    /// Walks the project and reconciles the registry with what is on disk.
    pub fn scan(&self) -> ScanDelta {
        self.scanning.store(true, Ordering::SeqCst);
        let found: Vec<(PathBuf, u64)> = WalkBuilder::new(&self.root)
            .filter_entry(|entry| entry.depth() == 0 || is_relevant_path(entry.path()))
            .build()
            .filter_map(|entry| {
                let entry = entry.ok()?;
                let path = entry.path();
                if !path.is_file() || path.extension().is_none() {
                    return None;
                }
                let hash = hash_file(path)?;
                let relative = path.strip_prefix(&self.root).ok()?.to_path_buf();
                Some((relative, hash))
            })
            .collect();

        let mut delta = ScanDelta {
            total: found.len(),
            ..ScanDelta::default()
        };
        {
            let mut state = self.write();
            let released = std::mem::take(&mut state.registry.released);
            state.registry.free.extend(released);

            let mut seen = HashSet::with_capacity(found.len());
            for (path, hash) in found {
                let id = match state.by_path.get(&path).copied() {
                    Some(id) => {
                        let entry = state.entry_mut(id);
                        if entry.as_ref().is_some_and(|e| e.content_hash == hash) {
                            seen.insert(id);
                            continue;
                        }
                        if let Some(entry) = entry {
                            entry.content_hash = hash;
                        }
                        id
                    }
                    None => {
                        let id = state.allocate(path, hash);
                        delta.added.push(id);
                        id
                    }
                };
                seen.insert(id);
                delta.changed.push(id);
            }

            let stale: Vec<FileId> = state
                .by_path
                .values()
                .copied()
                .filter(|id| !seen.contains(id))
                .collect();
            for id in stale {
                state.release(id);
                delta.removed.push(id);
            }
        }
        self.scanning.store(false, Ordering::SeqCst);

        debug!(
            "Scanned {}: {} file(s), {} changed, {} removed",
            self.root.display(),
            delta.total,
            delta.changed.len(),
            delta.removed.len()
        );
        delta
    }

    /// Re-examines one path after a file system notification.
    pub fn refresh_path(&self, path: &Path) -> Option<FileEvent> {
        if !path.starts_with(&self.root) || !is_relevant_path(path) {
            return None;
        }
        let relative = path.strip_prefix(&self.root).ok()?.to_path_buf();
        if relative.components().any(|c| !is_relevant_path(Path::new(c.as_os_str()))) {
            return None;
        }

        let mut state = self.write();
        let known = state.by_path.get(&relative).copied();
        let hash = if path.is_file() && path.extension().is_some() {
            hash_file(path)
        } else {
            None
        };

        match (known, hash) {
            (Some(id), None) => {
                state.release(id);
                Some(FileEvent::Removed(id))
            }
            (Some(id), Some(hash)) => {
                let entry = state.entry_mut(id)?;
                if entry.content_hash == hash {
                    return None;
                }
                entry.content_hash = hash;
                Some(FileEvent::Changed(id))
            }
            (None, Some(hash)) => Some(FileEvent::Changed(state.allocate(relative, hash))),
            (None, None) => None,
        }
    }
}

impl FileTree for ProjectFiles {
    fn file_ids(&self) -> Vec<FileId> {
        let mut ids: Vec<FileId> = self.read().by_path.values().copied().collect();
        ids.sort();
        ids
    }

    fn is_live(&self, file: FileId) -> bool {
        self.read()
            .registry
            .entries
            .get(file.index())
            .is_some_and(Option::is_some)
    }
}
