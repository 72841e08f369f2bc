//! Opens a project: registry scan, engine recovery and initial queueing.

use refscope_core::config::index_dir_for;
use refscope_core::{EngineConfig, FileTree, RefGraphEngine, Resolver, SupertypeClosure};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::project::ProjectFiles;
use crate::resolver::{DeclaredSupertypes, MentionResolver};

/// Stem of the type every declared hierarchy implicitly ends in.
const HIERARCHY_ROOT: &str = "Object";

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub config: Option<PathBuf>,
    /// Adds declared supertypes to every file's references.
    pub supertypes: bool,
}

pub struct Session {
    pub files: Arc<ProjectFiles>,
    pub engine: RefGraphEngine,
}

pub fn engine_config(root: &Path, config: Option<&Path>) -> Result<EngineConfig, Box<dyn Error>> {
    let Some(path) = config else {
        return Ok(EngineConfig::for_project(root));
    };
    let mut config = EngineConfig::load(path)?;
    if config.index_dir == EngineConfig::default().index_dir {
        config.index_dir = index_dir_for(root);
    }
    Ok(config)
}

impl Session {
    pub fn open(root: &Path, options: &SessionOptions) -> Result<Self, Box<dyn Error>> {
        let config = engine_config(root, options.config.as_deref())?;
        let files = Arc::new(ProjectFiles::load(root, &config.index_dir));
        let delta = files.scan();

        let mentions = MentionResolver::new(Arc::clone(&files));
        let resolver: Arc<dyn Resolver> = if options.supertypes {
            Arc::new(SupertypeClosure::new(
                mentions,
                DeclaredSupertypes::new(Arc::clone(&files), Some(HIERARCHY_ROOT.to_string())),
            ))
        } else {
            Arc::new(mentions)
        };

        let tree: Arc<dyn FileTree> = files.clone();
        let engine = RefGraphEngine::open(config, resolver, tree)?;
        let recovery = engine.recovery();
        if recovery.discarded {
            warn!("Previous index was discarded; rebuilding every file");
        }

        engine.forget(&delta.removed, "removed on disk");
        // Mentions are matched by stem, so a new or vanished file can change
        // what any other file refers to.
        if !delta.added.is_empty() || !delta.removed.is_empty() {
            engine.queue(&files.file_ids(), "file set changed");
        } else {
            engine.queue(&delta.changed, "changed on disk");
        }
        info!(
            "Project {}: {} file(s), {} changed, {} removed",
            files.root().display(),
            delta.total,
            delta.changed.len(),
            delta.removed.len()
        );

        Ok(Self { files, engine })
    }

    /// Persists the registry and shuts the engine down.
    pub fn close(self) -> Result<(), Box<dyn Error>> {
        self.files.save(&self.engine.config().index_dir)?;
        self.engine.shutdown()?;
        Ok(())
    }
}
