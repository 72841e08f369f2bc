//! Identity types shared by every layer of the graph.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Dense identifier of a file in the host's file-identity space.
///
/// Stable for the lifetime of the file; the graph never stores paths.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct FileId(u32);

impl FileId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for FileId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<FileId> for u32 {
    fn from(id: FileId) -> Self {
        id.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Ordered set of file ids, used for forward edge sets and deltas.
pub type FileIdSet = BTreeSet<FileId>;

/// Host notification about a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEvent {
    Changed(FileId),
    Removed(FileId),
}

pub(crate) fn to_raw(ids: &[FileId]) -> Vec<u32> {
    ids.iter().map(|id| id.as_u32()).collect()
}

pub(crate) fn from_raw(raw: &[u32]) -> Vec<FileId> {
    raw.iter().copied().map(FileId::new).collect()
}
