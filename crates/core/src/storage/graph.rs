//! Backward edges plus the forward records needed to retract them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use tracing::{debug, warn};

use super::adjacency::{AdjacencyStore, CompactionPolicy, CompactionStats, OpenReport};
use super::StoreLayout;
use crate::error::{RefScopeError, Result};
use crate::model::{FileId, FileIdSet};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitStats {
    pub files: usize,
    pub targets_touched: usize,
    pub edges_added: usize,
    pub edges_removed: usize,
}

/// Delta for a single target accumulated while inverting a batch.
#[derive(Debug, Default)]
struct TargetDelta {
    added: Vec<FileId>,
    removed: BTreeSet<FileId>,
}

pub struct GraphStore {
    backward: AdjacencyStore,
    forward: AdjacencyStore,
    commit_lock: Mutex<()>,
}

impl GraphStore {
    /// Opens both stores. The returned report merges what each store had to do.
    pub fn open(layout: &StoreLayout) -> Result<(Self, OpenReport)> {
        let (backward, backward_report) =
            AdjacencyStore::open(&layout.backward_index(), &layout.backward_data())?;
        let (forward, forward_report) =
            AdjacencyStore::open(&layout.forward_index(), &layout.forward_data())?;

        // A store whose partner had to be created from nothing counts as damaged.
        let lost_partner = backward_report.created != forward_report.created;
        let report = OpenReport {
            created: backward_report.created && forward_report.created,
            rolled_forward: backward_report.rolled_forward || forward_report.rolled_forward,
            repaired: backward_report.repaired
                + forward_report.repaired
                + usize::from(lost_partner),
        };
        Ok((
            Self {
                backward,
                forward,
                commit_lock: Mutex::new(()),
            },
            report,
        ))
    }

    pub fn backward_ids(&self, target: FileId) -> Result<Option<Vec<FileId>>> {
        self.backward.get(target)
    }

    pub fn forward_ids(&self, source: FileId) -> Result<Option<Vec<FileId>>> {
        self.forward.get(source)
    }

    /// Inverts freshly computed forward sets and applies the resulting deltas.
    ///
    /// Each `(file, forward)` pair replaces the file's previous forward set:
    /// `file` is added to the backward list of every new target and removed
    /// from every target it no longer references. Self references are dropped.
    pub fn commit(&self, batch: Vec<(FileId, FileIdSet)>) -> Result<CommitStats> {
        let _guard = self
            .commit_lock
            .lock()
            .map_err(|_| RefScopeError::Internal("graph commit lock poisoned".to_string()))?;

        let mut stats = CommitStats {
            files: batch.len(),
            ..CommitStats::default()
        };
        let mut deltas: BTreeMap<FileId, TargetDelta> = BTreeMap::new();
        let mut records = Vec::with_capacity(batch.len());

        for (file, mut forward) in batch {
            forward.remove(&file);
            let previous: FileIdSet = self
                .forward
                .get(file)?
                .unwrap_or_default()
                .into_iter()
                .collect();

            for target in forward.difference(&previous) {
                deltas.entry(*target).or_default().added.push(file);
            }
            for target in previous.difference(&forward) {
                deltas.entry(*target).or_default().removed.insert(file);
            }

            records.push((file, forward.into_iter().collect::<Vec<FileId>>()));
        }

        stats.targets_touched = deltas.len();
        for (target, delta) in deltas {
            if delta.removed.is_empty() {
                stats.edges_added += delta.added.len();
                self.backward.append(target, &delta.added)?;
                continue;
            }

            let current = self.backward.get(target)?.unwrap_or_default();
            let before = current.len();
            let mut next: Vec<FileId> = current
                .into_iter()
                .filter(|source| !delta.removed.contains(source))
                .collect();
            stats.edges_removed += before - next.len();
            for source in delta.added {
                if !next.contains(&source) {
                    next.push(source);
                    stats.edges_added += 1;
                }
            }
            self.backward.put(target, &next)?;
        }

        // Forward records go last: after a failed commit they still describe
        // the edges the backward store may hold, so a recompute retracts them.
        for (file, record) in records {
            self.forward.put(file, &record)?;
        }

        debug!(
            "Committed {} file(s): {} target(s), +{} / -{} edge(s)",
            stats.files, stats.targets_touched, stats.edges_added, stats.edges_removed
        );
        Ok(stats)
    }

    /// Compacts each store whose gap crossed the policy threshold.
    pub fn maybe_compact(&self, policy: &CompactionPolicy) -> Result<Vec<CompactionStats>> {
        let _guard = self
            .commit_lock
            .lock()
            .map_err(|_| RefScopeError::Internal("graph commit lock poisoned".to_string()))?;

        let mut compacted = Vec::new();
        for store in [&self.backward, &self.forward] {
            if store.needs_compaction(policy)? {
                compacted.push(store.compact()?);
            }
        }
        Ok(compacted)
    }

    pub fn gap_bytes(&self) -> Result<u64> {
        Ok(self.backward.gap_bytes()? + self.forward.gap_bytes()?)
    }

    pub fn data_len(&self) -> Result<u64> {
        Ok(self.backward.data_len()? + self.forward.data_len()?)
    }

    pub fn target_count(&self) -> Result<usize> {
        self.backward.len()
    }

    pub fn flush(&self) -> Result<()> {
        self.backward.flush()?;
        self.forward.flush()
    }

    pub fn close(&self) -> Result<()> {
        let backward = self.backward.close();
        let forward = self.forward.close();
        if let Err(ref e) = forward {
            warn!("Failed to close forward store: {e}");
        }
        backward.and(forward)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn id(raw: u32) -> FileId {
        FileId::new(raw)
    }

    fn set(raw: &[u32]) -> FileIdSet {
        raw.iter().copied().map(FileId::new).collect()
    }

    fn sorted(list: Option<Vec<FileId>>) -> Vec<FileId> {
        let mut list = list.unwrap_or_default();
        list.sort();
        list
    }

    #[test]
    fn test_commit_inverts_forward_sets() {
        let dir = TempDir::new().unwrap();
        let (graph, _) = GraphStore::open(&StoreLayout::new(dir.path())).unwrap();

        let stats = graph
            .commit(vec![(id(1), set(&[2, 3])), (id(4), set(&[2]))])
            .unwrap();
        assert_eq!(stats.edges_added, 3);
        assert_eq!(sorted(graph.backward_ids(id(2)).unwrap()), vec![id(1), id(4)]);
        assert_eq!(sorted(graph.backward_ids(id(3)).unwrap()), vec![id(1)]);
        assert_eq!(graph.backward_ids(id(1)).unwrap(), None);
        assert_eq!(graph.forward_ids(id(1)).unwrap(), Some(vec![id(2), id(3)]));
    }

    #[test]
    fn test_recommit_retracts_dropped_targets() {
        let dir = TempDir::new().unwrap();
        let (graph, _) = GraphStore::open(&StoreLayout::new(dir.path())).unwrap();
        graph.commit(vec![(id(1), set(&[2, 3]))]).unwrap();

        let stats = graph.commit(vec![(id(1), set(&[3, 5]))]).unwrap();
        assert_eq!(stats.edges_removed, 1);
        assert_eq!(stats.edges_added, 1);
        assert_eq!(sorted(graph.backward_ids(id(2)).unwrap()), Vec::<FileId>::new());
        assert_eq!(sorted(graph.backward_ids(id(3)).unwrap()), vec![id(1)]);
        assert_eq!(sorted(graph.backward_ids(id(5)).unwrap()), vec![id(1)]);
    }

    #[test]
    fn test_self_references_never_reach_the_store() {
        let dir = TempDir::new().unwrap();
        let (graph, _) = GraphStore::open(&StoreLayout::new(dir.path())).unwrap();
        graph.commit(vec![(id(7), set(&[7, 8]))]).unwrap();

        assert_eq!(graph.backward_ids(id(7)).unwrap(), None);
        assert_eq!(graph.forward_ids(id(7)).unwrap(), Some(vec![id(8)]));
    }

    #[test]
    fn test_unchanged_forward_set_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let (graph, _) = GraphStore::open(&StoreLayout::new(dir.path())).unwrap();
        graph.commit(vec![(id(1), set(&[2]))]).unwrap();
        let stats = graph.commit(vec![(id(1), set(&[2]))]).unwrap();

        assert_eq!(stats.targets_touched, 0);
        assert_eq!(sorted(graph.backward_ids(id(2)).unwrap()), vec![id(1)]);
    }

    #[test]
    fn test_compaction_follows_policy() {
        let dir = TempDir::new().unwrap();
        let (graph, _) = GraphStore::open(&StoreLayout::new(dir.path())).unwrap();
        for round in 0..10u32 {
            let targets: Vec<u32> = (0..round + 1).map(|t| t + 100).collect();
            graph.commit(vec![(id(1), set(&targets))]).unwrap();
        }
        assert!(graph.gap_bytes().unwrap() > 0);

        let never = CompactionPolicy {
            min_gap_bytes: u64::MAX,
            gap_ratio: 1.0,
        };
        assert!(graph.maybe_compact(&never).unwrap().is_empty());

        let eager = CompactionPolicy {
            min_gap_bytes: 1,
            gap_ratio: 0.0,
        };
        assert!(!graph.maybe_compact(&eager).unwrap().is_empty());
        assert_eq!(graph.gap_bytes().unwrap(), 0);
        assert_eq!(sorted(graph.backward_ids(id(105)).unwrap()), vec![id(1)]);
    }
}
