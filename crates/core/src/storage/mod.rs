//! On-disk state of an indexed corpus.
//!
//! One directory holds the backward store (`index`, `data`), the forward
//! records (`forward.index`, `forward.data`), the `liveness` checkpoint and
//! the `log.txt` trace.

pub mod adjacency;
pub mod graph;
pub mod liveness;
pub mod oplog;

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

pub use adjacency::{AdjacencyStore, CompactionPolicy, CompactionStats, OpenReport};
pub use graph::{CommitStats, GraphStore};
pub use liveness::{IdBitSet, LivenessCheckpoint};
pub use oplog::OperationLog;

#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn backward_index(&self) -> PathBuf {
        self.root.join("index")
    }

    pub fn backward_data(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn forward_index(&self) -> PathBuf {
        self.root.join("forward.index")
    }

    pub fn forward_data(&self) -> PathBuf {
        self.root.join("forward.data")
    }

    pub fn liveness(&self) -> PathBuf {
        self.root.join("liveness")
    }

    pub fn oplog(&self) -> PathBuf {
        self.root.join("log.txt")
    }

    /// Files that make up the graph itself; removing them discards the index.
    pub fn graph_files(&self) -> Vec<PathBuf> {
        let mut files = vec![
            self.backward_index(),
            self.backward_data(),
            self.forward_index(),
            self.forward_data(),
            self.liveness(),
        ];
        let compact: Vec<PathBuf> = files.iter().take(4).map(|p| compact_path(p)).collect();
        files.extend(compact);
        files
    }
}

/// Sibling path used while a file is being rewritten.
pub(crate) fn compact_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".compact");
    path.with_file_name(name)
}

#[cfg(unix)]
pub(crate) fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
pub(crate) fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
pub(crate) fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset)? {
            0 => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ));
            }
            n => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(windows)]
pub(crate) fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset)? {
            0 => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write whole buffer",
                ));
            }
            n => {
                buf = &buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}
