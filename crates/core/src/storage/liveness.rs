//! Bit-per-file sets and the `resolved` checkpoint.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::error::Result;
use crate::model::FileId;

const MAGIC: [u8; 4] = *b"RSLV";
const VERSION: u32 = 1;
const HEADER_LEN: usize = 16;
const CHECKSUM_LEN: usize = 8;

/// Growable bit set indexed by [`FileId`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdBitSet {
    words: Vec<u64>,
}

impl IdBitSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: FileId) -> bool {
        let (word, bit) = Self::locate(id);
        self.words.get(word).is_some_and(|w| w & (1 << bit) != 0)
    }

    /// Sets the bit and returns its previous value.
    pub fn set(&mut self, id: FileId) -> bool {
        let (word, bit) = Self::locate(id);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        let previous = self.words[word] & (1 << bit) != 0;
        self.words[word] |= 1 << bit;
        previous
    }

    /// Clears the bit and returns its previous value.
    pub fn clear(&mut self, id: FileId) -> bool {
        let (word, bit) = Self::locate(id);
        match self.words.get_mut(word) {
            Some(w) => {
                let previous = *w & (1 << bit) != 0;
                *w &= !(1 << bit);
                previous
            }
            None => false,
        }
    }

    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn iter_ones(&self) -> impl Iterator<Item = FileId> + '_ {
        self.words.iter().enumerate().flat_map(|(word, bits)| {
            (0..64u32)
                .filter(move |bit| bits & (1 << bit) != 0)
                .map(move |bit| FileId::new(word as u32 * 64 + bit))
        })
    }

    fn locate(id: FileId) -> (usize, u32) {
        (id.index() / 64, id.as_u32() % 64)
    }
}

/// Snapshot of the `resolved` bits.
///
/// Layout: `{magic "RSLV", version u32, word count u64}`, the words, and an
/// xxh3 checksum of everything before it.
pub struct LivenessCheckpoint;

impl LivenessCheckpoint {
    pub fn save(path: &Path, resolved: &IdBitSet) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut bytes = Vec::with_capacity(HEADER_LEN + resolved.words.len() * 8 + CHECKSUM_LEN);
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&VERSION.to_le_bytes());
        bytes.extend_from_slice(&(resolved.words.len() as u64).to_le_bytes());
        for word in &resolved.words {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        let checksum = xxh3_64(&bytes);
        bytes.extend_from_slice(&checksum.to_le_bytes());

        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, bytes)?;
        fs::rename(temp_path, path)?;
        debug!(
            "Saved liveness checkpoint with {} resolved file(s) to {}",
            resolved.count_ones(),
            path.display()
        );
        Ok(())
    }

    /// Loads and removes the checkpoint. Returns `None` when it is missing or
    /// does not verify, which means every file must be recomputed.
    pub fn load(path: &Path) -> Result<Option<IdBitSet>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        fs::remove_file(path)?;

        let decoded = Self::decode(&bytes);
        if decoded.is_none() {
            warn!("Ignoring unreadable liveness checkpoint at {}", path.display());
        }
        Ok(decoded)
    }

    fn decode(bytes: &[u8]) -> Option<IdBitSet> {
        if bytes.len() < HEADER_LEN + CHECKSUM_LEN || bytes[..4] != MAGIC {
            return None;
        }
        let (payload, checksum) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
        if xxh3_64(payload).to_le_bytes() != checksum {
            return None;
        }
        if u32::from_le_bytes(payload[4..8].try_into().ok()?) != VERSION {
            return None;
        }
        let count = u64::from_le_bytes(payload[8..16].try_into().ok()?) as usize;
        let body = &payload[HEADER_LEN..];
        if body.len() != count.checked_mul(8)? {
            return None;
        }
        let words = body
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect();
        Some(IdBitSet { words })
    }
}
