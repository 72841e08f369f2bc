//! Narrowing search scopes with backward edges.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::host::FileTree;
use crate::model::FileId;
use crate::queue::WorkQueue;
use crate::storage::GraphStore;

/// Files that may reference a given file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackwardScope {
    file: FileId,
    sources: HashSet<FileId>,
}

impl BackwardScope {
    pub fn file(&self) -> FileId {
        self.file
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Candidates without a stable id are always accepted.
    pub fn accepts(&self, candidate: Option<FileId>) -> bool {
        match candidate {
            None => true,
            Some(id) => id == self.file || self.sources.contains(&id),
        }
    }

    pub fn filter<'a, I>(&'a self, candidates: I) -> impl Iterator<Item = I::Item> + 'a
    where
        I: IntoIterator,
        I::IntoIter: 'a,
        I::Item: Into<Option<FileId>> + Copy,
    {
        candidates
            .into_iter()
            .filter(move |candidate| self.accepts((*candidate).into()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeRestriction {
    /// The graph is stale or unavailable; search everything.
    Unrestricted,
    Restricted(BackwardScope),
}

impl ScopeRestriction {
    pub fn accepts(&self, candidate: Option<FileId>) -> bool {
        match self {
            ScopeRestriction::Unrestricted => true,
            ScopeRestriction::Restricted(scope) => scope.accepts(candidate),
        }
    }

    pub fn is_restricted(&self) -> bool {
        matches!(self, ScopeRestriction::Restricted(_))
    }
}

pub struct ScopeQueryService {
    queue: Arc<WorkQueue>,
    graph: Arc<GraphStore>,
    tree: Arc<dyn FileTree>,
}

impl ScopeQueryService {
    pub fn new(queue: Arc<WorkQueue>, graph: Arc<GraphStore>, tree: Arc<dyn FileTree>) -> Self {
        Self { queue, graph, tree }
    }

    /// Files whose last computed forward set contained `file`.
    ///
    /// `None` while any file is queued or being processed, or when the store
    /// cannot be read. Files the host no longer considers live are skipped.
    pub fn backward_ids_of(&self, file: FileId) -> Option<Vec<FileId>> {
        if !self.queue.is_up_to_date() {
            return None;
        }
        let stored = match self.graph.backward_ids(file) {
            Ok(stored) => stored.unwrap_or_default(),
            Err(e) => {
                debug!("Backward lookup for {file} unavailable: {e}");
                return None;
            }
        };
        // A commit retried after a storage failure may have appended twice.
        let mut seen = HashSet::with_capacity(stored.len());
        Some(
            stored
                .into_iter()
                .filter(|id| *id != file && self.tree.is_live(*id) && seen.insert(*id))
                .collect(),
        )
    }

    pub fn restrict(&self, file: FileId) -> ScopeRestriction {
        match self.backward_ids_of(file) {
            Some(sources) => ScopeRestriction::Restricted(BackwardScope {
                file,
                sources: sources.into_iter().collect(),
            }),
            None => ScopeRestriction::Unrestricted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(file: u32, sources: &[u32]) -> BackwardScope {
        BackwardScope {
            file: FileId::new(file),
            sources: sources.iter().copied().map(FileId::new).collect(),
        }
    }

    #[test]
    fn test_scope_accepts_itself_sources_and_unknown_files() {
        let scope = scope(1, &[2, 3]);
        assert!(scope.accepts(Some(FileId::new(1))));
        assert!(scope.accepts(Some(FileId::new(3))));
        assert!(scope.accepts(None));
        assert!(!scope.accepts(Some(FileId::new(4))));
    }

    #[test]
    fn test_filter_keeps_accepted_candidates() {
        let scope = scope(1, &[2]);
        let candidates = vec![
            Some(FileId::new(1)),
            Some(FileId::new(2)),
            Some(FileId::new(5)),
            None,
        ];
        let kept: Vec<_> = scope.filter(candidates).collect();
        assert_eq!(kept, vec![Some(FileId::new(1)), Some(FileId::new(2)), None]);
    }

    #[test]
    fn test_unrestricted_accepts_everything() {
        assert!(ScopeRestriction::Unrestricted.accepts(Some(FileId::new(99))));
        assert!(!ScopeRestriction::Unrestricted.is_restricted());
    }
}
