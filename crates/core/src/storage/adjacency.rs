//! Log-structured `FileId -> [FileId]` map.
//!
//! Two files back a store:
//! - the index: a 16-byte header followed by one `(offset: u64, length: u32)`
//!   record per id, the id being the record position. `(0, 0)` is absent.
//! - the data file: a 16-byte header followed by chunks
//!   `{capacity: u32, ids: [u32; capacity]}` addressed by the index.
//!
//! Appends fill a chunk in place until its capacity is exhausted, then the list
//! moves to the end of the data file with doubled capacity. Bytes left behind
//! are the gap; `compact` rewrites the data file densely.
//!
//! Both headers carry a generation that compaction bumps. New files are synced
//! and renamed data first, index second, so an interrupted compaction always
//! leaves either matching generations or a `.compact` file that completes the
//! pair on the next open.

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, info, warn};

use super::{compact_path, read_exact_at, write_all_at};
use crate::error::{RefScopeError, Result};
use crate::model::{FileId, from_raw, to_raw};

const INDEX_MAGIC: [u8; 4] = *b"RSIX";
const DATA_MAGIC: [u8; 4] = *b"RSDT";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: u64 = 16;
const RECORD_LEN: u64 = 12;
const ID_LEN: u64 = 4;
const CHUNK_HEADER_LEN: u64 = 4;
const MIN_CAPACITY: u32 = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Slot {
    offset: u64,
    length: u32,
}

impl Slot {
    const ABSENT: Slot = Slot {
        offset: 0,
        length: 0,
    };

    fn is_absent(&self) -> bool {
        self.offset == 0
    }

    fn encode(&self) -> [u8; RECORD_LEN as usize] {
        let mut buf = [0u8; RECORD_LEN as usize];
        buf[..8].copy_from_slice(&self.offset.to_le_bytes());
        buf[8..].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Self {
        let mut offset = [0u8; 8];
        offset.copy_from_slice(&buf[..8]);
        let mut length = [0u8; 4];
        length.copy_from_slice(&buf[8..12]);
        Self {
            offset: u64::from_le_bytes(offset),
            length: u32::from_le_bytes(length),
        }
    }
}

fn chunk_size(capacity: u32) -> u64 {
    CHUNK_HEADER_LEN + capacity as u64 * ID_LEN
}

fn grown_capacity(required: u32) -> u32 {
    required
        .checked_next_power_of_two()
        .unwrap_or(u32::MAX)
        .max(MIN_CAPACITY)
}

fn encode_header(magic: [u8; 4], generation: u64) -> [u8; HEADER_LEN as usize] {
    let mut buf = [0u8; HEADER_LEN as usize];
    buf[..4].copy_from_slice(&magic);
    buf[4..8].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    buf[8..].copy_from_slice(&generation.to_le_bytes());
    buf
}

fn corrupted(path: &Path, reason: impl Into<String>) -> RefScopeError {
    RefScopeError::Corrupted {
        path: path.display().to_string(),
        reason: reason.into(),
    }
}

/// Reads the generation from a header. `Ok(None)` if the file does not exist.
fn read_generation(path: &Path, magic: [u8; 4]) -> Result<Option<u64>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut buf = [0u8; HEADER_LEN as usize];
    read_exact_at(&file, &mut buf, 0).map_err(|_| corrupted(path, "truncated header"))?;
    if buf[..4] != magic {
        return Err(corrupted(path, "bad magic"));
    }
    let mut version = [0u8; 4];
    version.copy_from_slice(&buf[4..8]);
    if u32::from_le_bytes(version) != FORMAT_VERSION {
        return Err(corrupted(path, "unsupported format version"));
    }
    let mut generation = [0u8; 8];
    generation.copy_from_slice(&buf[8..]);
    Ok(Some(u64::from_le_bytes(generation)))
}

fn encode_ids(ids: &[u32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ids.len() * ID_LEN as usize);
    for id in ids {
        buf.extend_from_slice(&id.to_le_bytes());
    }
    buf
}

fn decode_ids(buf: &[u8]) -> Vec<u32> {
    buf.chunks_exact(ID_LEN as usize)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn open_rw(path: &Path) -> Result<File> {
    Ok(OpenOptions::new().read(true).write(true).open(path)?)
}

/// When to rewrite the data file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionPolicy {
    /// Gap below this size never triggers compaction.
    pub min_gap_bytes: u64,
    /// Fraction of the data file that must be gap.
    pub gap_ratio: f64,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            min_gap_bytes: 1 << 20,
            gap_ratio: 0.5,
        }
    }
}

impl CompactionPolicy {
    pub fn should_compact(&self, gap_bytes: u64, data_len: u64) -> bool {
        let ratio_threshold = (data_len as f64 * self.gap_ratio.clamp(0.0, 1.0)) as u64;
        gap_bytes > 0 && gap_bytes >= self.min_gap_bytes.max(ratio_threshold)
    }
}

/// What `open` had to do to bring the files into a usable state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenReport {
    pub created: bool,
    pub rolled_forward: bool,
    /// Records dropped because they did not fit the data file.
    pub repaired: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub reclaimed_bytes: u64,
    pub live_bytes: u64,
    pub generation: u64,
}

#[cfg_attr(not(test), allow(dead_code))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompactionHalt {
    AfterDataWritten,
    AfterIndexWritten,
    AfterDataRenamed,
}

/// Layout of a compaction whose files are written but not yet renamed.
struct Compacted {
    slots: Vec<Slot>,
    capacities: Vec<u32>,
    data_len: u64,
    generation: u64,
}

struct StoreInner {
    index: File,
    data: File,
    slots: Vec<Slot>,
    capacities: Vec<u32>,
    data_len: u64,
    gap: u64,
    generation: u64,
}

pub struct AdjacencyStore {
    index_path: PathBuf,
    data_path: PathBuf,
    inner: RwLock<Option<StoreInner>>,
}

impl AdjacencyStore {
    pub fn open(index_path: &Path, data_path: &Path) -> Result<(Self, OpenReport)> {
        for path in [index_path, data_path] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut report = OpenReport::default();
        let index_gen = read_generation(index_path, INDEX_MAGIC)?;
        let data_gen = read_generation(data_path, DATA_MAGIC)?;

        match (index_gen, data_gen) {
            (None, None) => {
                fs::write(index_path, encode_header(INDEX_MAGIC, 0))?;
                fs::write(data_path, encode_header(DATA_MAGIC, 0))?;
                report.created = true;
            }
            (Some(i), Some(d)) if i == d => {}
            (Some(i), Some(d)) => {
                report.rolled_forward = Self::roll_forward(index_path, data_path, i, d)?;
                if !report.rolled_forward {
                    return Err(corrupted(
                        index_path,
                        format!("generation mismatch (index {i}, data {d})"),
                    ));
                }
            }
            (None, Some(_)) => return Err(corrupted(index_path, "index file missing")),
            (Some(_), None) => return Err(corrupted(data_path, "data file missing")),
        }

        for stray in [compact_path(index_path), compact_path(data_path)] {
            if stray.exists() {
                debug!("Removing stale compaction file {}", stray.display());
                let _ = fs::remove_file(stray);
            }
        }

        let index = open_rw(index_path)?;
        let data = open_rw(data_path)?;
        let generation = read_generation(index_path, INDEX_MAGIC)?
            .ok_or_else(|| corrupted(index_path, "index file missing"))?;

        let mut inner = StoreInner {
            index,
            data,
            slots: Vec::new(),
            capacities: Vec::new(),
            data_len: 0,
            gap: 0,
            generation,
        };
        report.repaired = inner.load_and_validate()?;
        if report.repaired > 0 {
            warn!(
                "Repaired {} record(s) in {} that pointed past {}",
                report.repaired,
                index_path.display(),
                data_path.display()
            );
        }

        Ok((
            Self {
                index_path: index_path.to_path_buf(),
                data_path: data_path.to_path_buf(),
                inner: RwLock::new(Some(inner)),
            },
            report,
        ))
    }

    /// Completes a compaction that stopped between the two renames.
    fn roll_forward(
        index_path: &Path,
        data_path: &Path,
        index_gen: u64,
        data_gen: u64,
    ) -> Result<bool> {
        let pending_data = compact_path(data_path);
        if read_generation(&pending_data, DATA_MAGIC).ok().flatten() == Some(index_gen) {
            info!("Completing interrupted compaction of {}", data_path.display());
            fs::rename(&pending_data, data_path)?;
            return Ok(true);
        }
        let pending_index = compact_path(index_path);
        if read_generation(&pending_index, INDEX_MAGIC).ok().flatten() == Some(data_gen) {
            info!("Completing interrupted compaction of {}", index_path.display());
            fs::rename(&pending_index, index_path)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn read_inner(&self) -> Result<RwLockReadGuard<'_, Option<StoreInner>>> {
        self.inner
            .read()
            .map_err(|_| RefScopeError::Internal("adjacency store lock poisoned".to_string()))
    }

    fn write_inner(&self) -> Result<RwLockWriteGuard<'_, Option<StoreInner>>> {
        self.inner
            .write()
            .map_err(|_| RefScopeError::Internal("adjacency store lock poisoned".to_string()))
    }

    fn unavailable(&self) -> RefScopeError {
        RefScopeError::StorageUnavailable(format!("{} is closed", self.index_path.display()))
    }

    /// Appends `sources` to the list of `target`, creating it if absent.
    pub fn append(&self, target: FileId, sources: &[FileId]) -> Result<()> {
        let mut guard = self.write_inner()?;
        let inner = guard.as_mut().ok_or_else(|| self.unavailable())?;
        inner.append(target.index(), &to_raw(sources))
    }

    /// Replaces the list of `target`.
    pub fn put(&self, target: FileId, ids: &[FileId]) -> Result<()> {
        let mut guard = self.write_inner()?;
        let inner = guard.as_mut().ok_or_else(|| self.unavailable())?;
        inner.put(target.index(), &to_raw(ids))
    }

    pub fn get(&self, target: FileId) -> Result<Option<Vec<FileId>>> {
        let guard = self.read_inner()?;
        let inner = guard.as_ref().ok_or_else(|| self.unavailable())?;
        Ok(inner.get(target.index())?.map(|raw| from_raw(&raw)))
    }

    pub fn contains(&self, target: FileId) -> Result<bool> {
        let guard = self.read_inner()?;
        let inner = guard.as_ref().ok_or_else(|| self.unavailable())?;
        Ok(inner
            .slots
            .get(target.index())
            .is_some_and(|slot| !slot.is_absent()))
    }

    pub fn flush(&self) -> Result<()> {
        let guard = self.read_inner()?;
        let inner = guard.as_ref().ok_or_else(|| self.unavailable())?;
        inner.data.sync_all()?;
        inner.index.sync_all()?;
        Ok(())
    }

    pub fn gap_bytes(&self) -> Result<u64> {
        let guard = self.read_inner()?;
        Ok(guard.as_ref().ok_or_else(|| self.unavailable())?.gap)
    }

    pub fn data_len(&self) -> Result<u64> {
        let guard = self.read_inner()?;
        Ok(guard.as_ref().ok_or_else(|| self.unavailable())?.data_len)
    }

    /// Number of ids that currently have a list.
    pub fn len(&self) -> Result<usize> {
        let guard = self.read_inner()?;
        let inner = guard.as_ref().ok_or_else(|| self.unavailable())?;
        Ok(inner.slots.iter().filter(|s| !s.is_absent()).count())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn generation(&self) -> Result<u64> {
        let guard = self.read_inner()?;
        Ok(guard.as_ref().ok_or_else(|| self.unavailable())?.generation)
    }

    pub fn needs_compaction(&self, policy: &CompactionPolicy) -> Result<bool> {
        let guard = self.read_inner()?;
        let inner = guard.as_ref().ok_or_else(|| self.unavailable())?;
        Ok(policy.should_compact(inner.gap, inner.data_len))
    }

    pub fn compact(&self) -> Result<CompactionStats> {
        self.compact_until(None)
    }

    fn compact_until(&self, halt: Option<CompactionHalt>) -> Result<CompactionStats> {
        let mut guard = self.write_inner()?;
        let inner = guard.as_mut().ok_or_else(|| self.unavailable())?;
        let Some(compacted) = inner.write_compacted(&self.index_path, &self.data_path, halt)? else {
            return Ok(CompactionStats::default());
        };

        fs::rename(compact_path(&self.data_path), &self.data_path)?;
        let installed = match halt {
            Some(CompactionHalt::AfterDataRenamed) => Err(RefScopeError::Internal(
                "compaction halted between renames".to_string(),
            )),
            _ => inner.install(compacted, &self.index_path, &self.data_path),
        };
        let stats = match installed {
            Ok(stats) => stats,
            Err(e) => {
                // The open handles still address the replaced data file; the
                // next open completes the rename.
                error!(
                    "Compaction of {} stopped after the data rename, closing store: {e}",
                    self.data_path.display()
                );
                guard.take();
                return Err(e);
            }
        };
        info!(
            "Compacted {}: reclaimed {} bytes, {} live bytes, generation {}",
            self.data_path.display(),
            stats.reclaimed_bytes,
            stats.live_bytes,
            stats.generation
        );
        Ok(stats)
    }

    /// Flushes and releases the files; later calls fail with `StorageUnavailable`.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.write_inner()?;
        if let Some(inner) = guard.take() {
            inner.data.sync_all()?;
            inner.index.sync_all()?;
        }
        Ok(())
    }
}

impl StoreInner {
    /// Loads all records and drops the ones that do not fit the data file.
    fn load_and_validate(&mut self) -> Result<usize> {
        self.data_len = self.data.metadata()?.len();
        let index_len = self.index.metadata()?.len();
        let count = (index_len.saturating_sub(HEADER_LEN) / RECORD_LEN) as usize;

        let mut raw = vec![0u8; count * RECORD_LEN as usize];
        read_exact_at(&self.index, &mut raw, HEADER_LEN)?;
        if index_len != HEADER_LEN + raw.len() as u64 {
            // A torn trailing record.
            self.index.set_len(HEADER_LEN + raw.len() as u64)?;
        }

        self.slots = Vec::with_capacity(count);
        self.capacities = Vec::with_capacity(count);
        let mut repaired = 0usize;
        let mut live_bytes = 0u64;

        for (position, record) in raw.chunks_exact(RECORD_LEN as usize).enumerate() {
            let slot = Slot::decode(record);
            if slot.is_absent() {
                if slot.length != 0 {
                    repaired += 1;
                    self.write_record(position, Slot::ABSENT)?;
                }
                self.slots.push(Slot::ABSENT);
                self.capacities.push(0);
                continue;
            }
            match self.validate(slot) {
                Some(capacity) => {
                    live_bytes += chunk_size(capacity);
                    self.slots.push(slot);
                    self.capacities.push(capacity);
                }
                None => {
                    repaired += 1;
                    self.write_record(position, Slot::ABSENT)?;
                    self.slots.push(Slot::ABSENT);
                    self.capacities.push(0);
                }
            }
        }

        self.gap = self
            .data_len
            .saturating_sub(HEADER_LEN)
            .saturating_sub(live_bytes);
        Ok(repaired)
    }

    /// Returns the chunk capacity if `slot` addresses a complete chunk.
    fn validate(&self, slot: Slot) -> Option<u32> {
        if slot.offset < HEADER_LEN || slot.offset + CHUNK_HEADER_LEN > self.data_len {
            return None;
        }
        let mut buf = [0u8; CHUNK_HEADER_LEN as usize];
        read_exact_at(&self.data, &mut buf, slot.offset).ok()?;
        let capacity = u32::from_le_bytes(buf);
        if capacity < slot.length || slot.offset + chunk_size(capacity) > self.data_len {
            return None;
        }
        Some(capacity)
    }

    fn ensure_slot(&mut self, position: usize) {
        if position >= self.slots.len() {
            self.slots.resize(position + 1, Slot::ABSENT);
            self.capacities.resize(position + 1, 0);
        }
    }

    fn write_record(&self, position: usize, slot: Slot) -> Result<()> {
        let offset = HEADER_LEN + position as u64 * RECORD_LEN;
        write_all_at(&self.index, &slot.encode(), offset)?;
        Ok(())
    }

    fn get(&self, position: usize) -> Result<Option<Vec<u32>>> {
        let Some(slot) = self.slots.get(position).copied() else {
            return Ok(None);
        };
        if slot.is_absent() {
            return Ok(None);
        }
        let mut buf = vec![0u8; slot.length as usize * ID_LEN as usize];
        read_exact_at(&self.data, &mut buf, slot.offset + CHUNK_HEADER_LEN)?;
        Ok(Some(decode_ids(&buf)))
    }

    fn append(&mut self, position: usize, sources: &[u32]) -> Result<()> {
        self.ensure_slot(position);
        let slot = self.slots[position];
        let capacity = self.capacities[position];

        if slot.is_absent() {
            return self.relocate(position, sources, grown_capacity(sources.len() as u32));
        }
        if sources.is_empty() {
            return Ok(());
        }

        let required = slot.length as u64 + sources.len() as u64;
        if required <= capacity as u64 {
            let at = slot.offset + CHUNK_HEADER_LEN + slot.length as u64 * ID_LEN;
            write_all_at(&self.data, &encode_ids(sources), at)?;
            let updated = Slot {
                offset: slot.offset,
                length: required as u32,
            };
            self.write_record(position, updated)?;
            self.slots[position] = updated;
            return Ok(());
        }

        let mut combined = self.get(position)?.unwrap_or_default();
        combined.extend_from_slice(sources);
        let required = u32::try_from(combined.len())
            .map_err(|_| RefScopeError::Internal("adjacency list too long".to_string()))?;
        self.relocate(position, &combined, grown_capacity(required))?;
        self.gap += chunk_size(capacity);
        Ok(())
    }

    fn put(&mut self, position: usize, ids: &[u32]) -> Result<()> {
        self.ensure_slot(position);
        let slot = self.slots[position];
        let capacity = self.capacities[position];

        if !slot.is_absent() && ids.len() as u64 <= capacity as u64 {
            write_all_at(&self.data, &encode_ids(ids), slot.offset + CHUNK_HEADER_LEN)?;
            let updated = Slot {
                offset: slot.offset,
                length: ids.len() as u32,
            };
            self.write_record(position, updated)?;
            self.slots[position] = updated;
            return Ok(());
        }

        let required = u32::try_from(ids.len())
            .map_err(|_| RefScopeError::Internal("adjacency list too long".to_string()))?;
        self.relocate(position, ids, grown_capacity(required))?;
        if !slot.is_absent() {
            self.gap += chunk_size(capacity);
        }
        Ok(())
    }

    /// Writes a fresh chunk at the end of the data file, then points the record at it.
    fn relocate(&mut self, position: usize, ids: &[u32], capacity: u32) -> Result<()> {
        let offset = self.data_len;
        let mut chunk = Vec::with_capacity(chunk_size(capacity) as usize);
        chunk.extend_from_slice(&capacity.to_le_bytes());
        chunk.extend_from_slice(&encode_ids(ids));
        chunk.resize(chunk_size(capacity) as usize, 0);
        write_all_at(&self.data, &chunk, offset)?;
        self.data_len += chunk.len() as u64;

        let slot = Slot {
            offset,
            length: ids.len() as u32,
        };
        self.write_record(position, slot)?;
        self.slots[position] = slot;
        self.capacities[position] = capacity;
        Ok(())
    }

    /// Writes the dense `.compact` siblings of both files. Returns `None` when
    /// a test halt stopped it early.
    fn write_compacted(
        &self,
        index_path: &Path,
        data_path: &Path,
        halt: Option<CompactionHalt>,
    ) -> Result<Option<Compacted>> {
        let generation = self.generation + 1;
        let pending_data = compact_path(data_path);
        let pending_index = compact_path(index_path);

        let mut slots = Vec::with_capacity(self.slots.len());
        let mut capacities = Vec::with_capacity(self.slots.len());
        let mut offset = HEADER_LEN;
        {
            let mut out = BufWriter::new(File::create(&pending_data)?);
            out.write_all(&encode_header(DATA_MAGIC, generation))?;
            for position in 0..self.slots.len() {
                let Some(ids) = self.get(position)? else {
                    slots.push(Slot::ABSENT);
                    capacities.push(0);
                    continue;
                };
                let capacity = ids.len() as u32;
                out.write_all(&capacity.to_le_bytes())?;
                out.write_all(&encode_ids(&ids))?;
                slots.push(Slot {
                    offset,
                    length: capacity,
                });
                capacities.push(capacity);
                offset += chunk_size(capacity);
            }
            let file = out.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
        }
        if halt == Some(CompactionHalt::AfterDataWritten) {
            return Ok(None);
        }

        {
            let mut out = BufWriter::new(File::create(&pending_index)?);
            out.write_all(&encode_header(INDEX_MAGIC, generation))?;
            for slot in &slots {
                out.write_all(&slot.encode())?;
            }
            let file = out.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
        }
        if halt == Some(CompactionHalt::AfterIndexWritten) {
            return Ok(None);
        }

        Ok(Some(Compacted {
            slots,
            capacities,
            data_len: offset,
            generation,
        }))
    }

    /// Moves the compacted index into place and switches to the new files.
    /// Called once the data file has been renamed.
    fn install(
        &mut self,
        compacted: Compacted,
        index_path: &Path,
        data_path: &Path,
    ) -> Result<CompactionStats> {
        fs::rename(compact_path(index_path), index_path)?;

        let reclaimed = self.data_len.saturating_sub(compacted.data_len);
        self.data = open_rw(data_path)?;
        self.index = open_rw(index_path)?;
        self.slots = compacted.slots;
        self.capacities = compacted.capacities;
        self.data_len = compacted.data_len;
        self.gap = 0;
        self.generation = compacted.generation;

        Ok(CompactionStats {
            reclaimed_bytes: reclaimed,
            live_bytes: compacted.data_len - HEADER_LEN,
            generation: compacted.generation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn ids(raw: &[u32]) -> Vec<FileId> {
        raw.iter().copied().map(FileId::new).collect()
    }

    fn open(dir: &TempDir) -> (AdjacencyStore, OpenReport) {
        AdjacencyStore::open(&dir.path().join("index"), &dir.path().join("data"))
            .expect("store should open")
    }

    fn as_set(list: Option<Vec<FileId>>) -> BTreeSet<FileId> {
        list.unwrap_or_default().into_iter().collect()
    }

    #[test]
    fn test_fresh_store_reports_created() {
        let dir = TempDir::new().unwrap();
        let (store, report) = open(&dir);
        assert!(report.created);
        assert_eq!(store.get(FileId::new(3)).unwrap(), None);
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_append_extends_in_place_until_capacity() {
        let dir = TempDir::new().unwrap();
        let (store, _) = open(&dir);
        let target = FileId::new(5);

        store.append(target, &ids(&[1])).unwrap();
        let len_after_first = store.data_len().unwrap();
        store.append(target, &ids(&[2, 3, 4])).unwrap();
        assert_eq!(store.data_len().unwrap(), len_after_first);
        assert_eq!(store.gap_bytes().unwrap(), 0);

        store.append(target, &ids(&[6])).unwrap();
        assert!(store.gap_bytes().unwrap() > 0);
        assert_eq!(store.get(target).unwrap(), Some(ids(&[1, 2, 3, 4, 6])));
    }

    #[test]
    fn test_empty_list_is_present_not_absent() {
        let dir = TempDir::new().unwrap();
        let (store, _) = open(&dir);
        store.put(FileId::new(0), &[]).unwrap();
        assert_eq!(store.get(FileId::new(0)).unwrap(), Some(Vec::new()));
        assert!(store.contains(FileId::new(0)).unwrap());
        assert!(!store.contains(FileId::new(1)).unwrap());
    }

    #[test]
    fn test_put_replaces_and_shrinks_in_place() {
        let dir = TempDir::new().unwrap();
        let (store, _) = open(&dir);
        let target = FileId::new(2);
        store.append(target, &ids(&[7, 8, 9])).unwrap();
        let len = store.data_len().unwrap();

        store.put(target, &ids(&[8])).unwrap();
        assert_eq!(store.get(target).unwrap(), Some(ids(&[8])));
        assert_eq!(store.data_len().unwrap(), len);

        store.put(target, &ids(&[1, 2, 3, 4, 5, 6])).unwrap();
        assert_eq!(store.get(target).unwrap(), Some(ids(&[1, 2, 3, 4, 5, 6])));
        assert!(store.gap_bytes().unwrap() > 0);
    }

    #[test]
    fn test_contents_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let (store, _) = open(&dir);
            store.append(FileId::new(1), &ids(&[2, 3])).unwrap();
            store.append(FileId::new(10), &ids(&[4])).unwrap();
            store.flush().unwrap();
        }
        let (store, report) = open(&dir);
        assert_eq!(report, OpenReport::default());
        assert_eq!(store.get(FileId::new(1)).unwrap(), Some(ids(&[2, 3])));
        assert_eq!(store.get(FileId::new(10)).unwrap(), Some(ids(&[4])));
        assert_eq!(store.get(FileId::new(5)).unwrap(), None);
        assert_eq!(store.len().unwrap(), 2);
    }

    #[test]
    fn test_compaction_removes_gap_and_keeps_contents() {
        let dir = TempDir::new().unwrap();
        let (store, _) = open(&dir);
        for round in 0..20u32 {
            for target in 0..8u32 {
                store.append(FileId::new(target), &ids(&[round])).unwrap();
            }
        }
        store.put(FileId::new(3), &[]).unwrap();
        let before: Vec<_> = (0..8).map(|t| store.get(FileId::new(t)).unwrap()).collect();
        assert!(store.gap_bytes().unwrap() > 0);

        let stats = store.compact().unwrap();
        assert!(stats.reclaimed_bytes > 0);
        assert_eq!(store.gap_bytes().unwrap(), 0);
        assert_eq!(store.generation().unwrap(), 1);
        let after: Vec<_> = (0..8).map(|t| store.get(FileId::new(t)).unwrap()).collect();
        assert_eq!(before, after);

        // Appending after compaction relocates the dense chunk.
        store.append(FileId::new(0), &ids(&[99])).unwrap();
        assert_eq!(store.get(FileId::new(0)).unwrap().unwrap().last(), Some(&FileId::new(99)));
        drop(store);

        let (store, report) = open(&dir);
        assert_eq!(report.repaired, 0);
        assert_eq!(store.get(FileId::new(5)).unwrap(), before[5]);
    }

    #[test]
    fn test_compaction_policy_thresholds() {
        let policy = CompactionPolicy {
            min_gap_bytes: 100,
            gap_ratio: 0.5,
        };
        assert!(!policy.should_compact(0, 0));
        assert!(!policy.should_compact(99, 100));
        assert!(!policy.should_compact(400, 1000));
        assert!(policy.should_compact(500, 1000));
        assert!(policy.should_compact(100, 150));
    }

    #[test]
    fn test_truncated_data_file_is_repaired_without_fabrication() {
        let dir = TempDir::new().unwrap();
        {
            let (store, _) = open(&dir);
            store.append(FileId::new(0), &ids(&[1, 2])).unwrap();
            store.append(FileId::new(1), &ids(&[3])).unwrap();
            store.flush().unwrap();
        }
        let data = dir.path().join("data");
        let len = fs::metadata(&data).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(&data)
            .unwrap()
            .set_len(len - 4)
            .unwrap();

        let (store, report) = open(&dir);
        assert_eq!(report.repaired, 1);
        assert_eq!(store.get(FileId::new(0)).unwrap(), Some(ids(&[1, 2])));
        assert_eq!(store.get(FileId::new(1)).unwrap(), None);
    }

    fn crash_during_compaction(halt: CompactionHalt) {
        let dir = TempDir::new().unwrap();
        let mut committed = Vec::new();
        {
            let (store, _) = open(&dir);
            for round in 0..12u32 {
                for target in 0..6u32 {
                    store
                        .append(FileId::new(target), &ids(&[round * 10 + target]))
                        .unwrap();
                }
            }
            store.put(FileId::new(2), &ids(&[1])).unwrap();
            store.flush().unwrap();
            for target in 0..6u32 {
                committed.push(as_set(store.get(FileId::new(target)).unwrap()));
            }
            let result = store.compact_until(Some(halt));
            assert_eq!(result.is_err(), halt == CompactionHalt::AfterDataRenamed);
        }

        let (store, report) = open(&dir);
        assert_eq!(report.repaired, 0);
        for (target, before) in committed.iter().enumerate() {
            let after = as_set(store.get(FileId::new(target as u32)).unwrap());
            assert!(after.is_subset(before), "target {target}: {after:?} ⊄ {before:?}");
        }
        assert!(!compact_path(&dir.path().join("data")).exists());
        assert!(!compact_path(&dir.path().join("index")).exists());
    }

    #[test]
    fn test_crash_after_data_written_keeps_old_generation() {
        crash_during_compaction(CompactionHalt::AfterDataWritten);
    }

    #[test]
    fn test_crash_after_index_written_keeps_old_generation() {
        crash_during_compaction(CompactionHalt::AfterIndexWritten);
    }

    #[test]
    fn test_crash_between_renames_rolls_forward() {
        crash_during_compaction(CompactionHalt::AfterDataRenamed);
    }

    #[test]
    fn test_store_stopped_between_renames_refuses_writes() {
        let dir = TempDir::new().unwrap();
        let (store, _) = open(&dir);
        store.append(FileId::new(0), &ids(&[1, 2])).unwrap();
        store.put(FileId::new(0), &ids(&[3])).unwrap();
        assert!(store.compact_until(Some(CompactionHalt::AfterDataRenamed)).is_err());

        assert!(matches!(
            store.append(FileId::new(1), &ids(&[4])),
            Err(RefScopeError::StorageUnavailable(_))
        ));
        assert!(matches!(
            store.get(FileId::new(0)),
            Err(RefScopeError::StorageUnavailable(_))
        ));
        drop(store);

        let (store, report) = open(&dir);
        assert!(report.rolled_forward);
        assert_eq!(store.get(FileId::new(0)).unwrap(), Some(ids(&[3])));
        assert_eq!(store.get(FileId::new(1)).unwrap(), None);
    }

    #[test]
    fn test_unrecoverable_generation_mismatch_is_corruption() {
        let dir = TempDir::new().unwrap();
        {
            let (store, _) = open(&dir);
            store.append(FileId::new(0), &ids(&[1])).unwrap();
            assert!(store.compact_until(Some(CompactionHalt::AfterDataRenamed)).is_err());
        }
        fs::remove_file(compact_path(&dir.path().join("index"))).unwrap();

        let result = AdjacencyStore::open(&dir.path().join("index"), &dir.path().join("data"));
        assert!(matches!(result, Err(RefScopeError::Corrupted { .. })));
    }

    #[test]
    fn test_closed_store_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let (store, _) = open(&dir);
        store.close().unwrap();
        assert!(matches!(
            store.get(FileId::new(0)),
            Err(RefScopeError::StorageUnavailable(_))
        ));
        assert!(matches!(
            store.append(FileId::new(0), &ids(&[1])),
            Err(RefScopeError::StorageUnavailable(_))
        ));
    }
}
