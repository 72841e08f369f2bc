//! Boundary to the language-specific resolver.

use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::model::{FileId, FileIdSet};
use crate::scheduler::SchedulerState;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// A dependency of the resolver is not available yet; the file is retried.
    #[error("resolver not ready")]
    NotReady,

    #[error("resolution cancelled")]
    Cancelled,

    /// Unexpected failure; the file is dropped from the batch.
    #[error("resolution failed: {0}")]
    Fatal(String),
}

/// Cooperative cancellation seen by a resolver while it works on one file.
pub struct ResolveContext<'a> {
    cancel: &'a CancellationToken,
    state: Option<&'a SchedulerState>,
}

impl<'a> ResolveContext<'a> {
    pub fn new(cancel: &'a CancellationToken) -> Self {
        Self {
            cancel,
            state: None,
        }
    }

    pub fn with_state(cancel: &'a CancellationToken, state: &'a SchedulerState) -> Self {
        Self {
            cancel,
            state: Some(state),
        }
    }

    /// True once the batch was cancelled or the scheduler got paused.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.state.is_some_and(|s| s.is_paused())
    }

    pub fn check_cancelled(&self) -> Result<(), ResolveError> {
        if self.is_cancelled() {
            Err(ResolveError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Computes the set of files a file refers to.
///
/// Called concurrently from the worker pool. Long-running implementations
/// should poll [`ResolveContext::check_cancelled`].
pub trait Resolver: Send + Sync {
    fn resolve(&self, file: FileId, ctx: &ResolveContext<'_>) -> Result<FileIdSet, ResolveError>;
}

impl<R: Resolver + ?Sized> Resolver for Arc<R> {
    fn resolve(&self, file: FileId, ctx: &ResolveContext<'_>) -> Result<FileIdSet, ResolveError> {
        (**self).resolve(file, ctx)
    }
}

impl<R: Resolver + ?Sized> Resolver for Box<R> {
    fn resolve(&self, file: FileId, ctx: &ResolveContext<'_>) -> Result<FileIdSet, ResolveError> {
        (**self).resolve(file, ctx)
    }
}

/// Supertype relation between files, as known to the host language.
pub trait SupertypeIndex: Send + Sync {
    /// Files declaring the direct supertypes of the types declared in `file`.
    fn supertypes(&self, file: FileId) -> Vec<FileId>;

    /// File of the language root type, which every type extends implicitly.
    fn root(&self) -> Option<FileId> {
        None
    }
}

/// Resolver policy that folds supertypes of referenced files into the result.
///
/// The closure is transitive up to `max_depth` levels (unbounded by default)
/// and never contains the root type.
pub struct SupertypeClosure<R, S> {
    inner: R,
    index: S,
    max_depth: Option<usize>,
}

impl<R, S> SupertypeClosure<R, S>
where
    R: Resolver,
    S: SupertypeIndex,
{
    pub fn new(inner: R, index: S) -> Self {
        Self {
            inner,
            index,
            max_depth: None,
        }
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }
}

impl<R, S> Resolver for SupertypeClosure<R, S>
where
    R: Resolver,
    S: SupertypeIndex,
{
    fn resolve(&self, file: FileId, ctx: &ResolveContext<'_>) -> Result<FileIdSet, ResolveError> {
        let mut result = self.inner.resolve(file, ctx)?;
        let root = self.index.root();

        let mut frontier: VecDeque<(FileId, usize)> = result.iter().map(|id| (*id, 0)).collect();
        while let Some((current, depth)) = frontier.pop_front() {
            if self.max_depth.is_some_and(|max| depth >= max) {
                continue;
            }
            ctx.check_cancelled()?;
            for parent in self.index.supertypes(current) {
                if Some(parent) != root && result.insert(parent) {
                    frontier.push_back((parent, depth + 1));
                }
            }
        }

        if let Some(root) = root {
            result.remove(&root);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Fixed(HashMap<u32, Vec<u32>>);

    impl Resolver for Fixed {
        fn resolve(&self, file: FileId, _ctx: &ResolveContext<'_>) -> Result<FileIdSet, ResolveError> {
            Ok(self
                .0
                .get(&file.as_u32())
                .into_iter()
                .flatten()
                .copied()
                .map(FileId::new)
                .collect())
        }
    }

    struct Hierarchy {
        parents: HashMap<u32, Vec<u32>>,
        root: Option<u32>,
    }

    impl SupertypeIndex for Hierarchy {
        fn supertypes(&self, file: FileId) -> Vec<FileId> {
            self.parents
                .get(&file.as_u32())
                .into_iter()
                .flatten()
                .copied()
                .map(FileId::new)
                .collect()
        }

        fn root(&self) -> Option<FileId> {
            self.root.map(FileId::new)
        }
    }

    fn ids(raw: &[u32]) -> FileIdSet {
        raw.iter().copied().map(FileId::new).collect()
    }

    fn fixture() -> (Fixed, Hierarchy) {
        // 1 -> 2; 2 extends 3 extends 4 extends 0 (root); 4 extends 3 again
        let resolver = Fixed(HashMap::from([(1, vec![2]), (5, vec![0])]));
        let hierarchy = Hierarchy {
            parents: HashMap::from([(2, vec![3]), (3, vec![4, 0]), (4, vec![3, 0])]),
            root: Some(0),
        };
        (resolver, hierarchy)
    }

    #[test]
    fn test_closure_is_transitive_and_cycle_safe() {
        let (resolver, hierarchy) = fixture();
        let closure = SupertypeClosure::new(resolver, hierarchy);
        let cancel = CancellationToken::new();
        let ctx = ResolveContext::new(&cancel);

        assert_eq!(closure.resolve(FileId::new(1), &ctx).unwrap(), ids(&[2, 3, 4]));
    }

    #[test]
    fn test_depth_limit_stops_the_walk() {
        let (resolver, hierarchy) = fixture();
        let closure = SupertypeClosure::new(resolver, hierarchy).with_max_depth(1);
        let cancel = CancellationToken::new();
        let ctx = ResolveContext::new(&cancel);

        assert_eq!(closure.resolve(FileId::new(1), &ctx).unwrap(), ids(&[2, 3]));
    }

    #[test]
    fn test_root_type_is_never_reported() {
        let (resolver, hierarchy) = fixture();
        let closure = SupertypeClosure::new(resolver, hierarchy);
        let cancel = CancellationToken::new();
        let ctx = ResolveContext::new(&cancel);

        assert!(closure.resolve(FileId::new(5), &ctx).unwrap().is_empty());
    }

    #[test]
    fn test_cancelled_context_aborts_the_closure() {
        let (resolver, hierarchy) = fixture();
        let closure = SupertypeClosure::new(resolver, hierarchy);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ctx = ResolveContext::new(&cancel);

        assert_eq!(
            closure.resolve(FileId::new(1), &ctx),
            Err(ResolveError::Cancelled)
        );
    }
}
