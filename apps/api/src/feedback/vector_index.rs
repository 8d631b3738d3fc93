//! Exact (flat) cosine-distance index over record embeddings, keyed by `sequence_no`.
//!
//! Vectors are L2-normalised on insert, so cosine distance is `1 - dot`, in [0, 2].
//! A linear scan is exact and fast enough for feedback-sized corpora; the
//! `query` contract (ascending distance, ties by ascending `sequence_no`, `k`
//! clamped to the index size) holds for any replacement structure.
//!
//! # Artifact layout
//!
//! ```text
//! magic       b"FBVI"        4
//! version     u16 LE         2
//! dimension   u32 LE         4
//! count       u64 LE         8
//! entries     count × (sequence_no u64 LE, dimension × f32 LE)
//! crc32       u32 LE         4   (over everything above)
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::embedder::l2_normalize;

const MAGIC: [u8; 4] = *b"FBVI";
const VERSION: u16 = 1;
const HEADER_LEN: usize = 4 + 2 + 4 + 8;
const CRC_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Vector has {got} dimensions, index expects {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Index artifact {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Index I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexHit {
    pub sequence_no: u64,
    pub distance: f32,
}

pub struct VectorIndex {
    path: PathBuf,
    dimension: usize,
    entries: RwLock<BTreeMap<u64, Vec<f32>>>,
    /// Inserts since the artifact was last written.
    dirty: AtomicBool,
    /// Serialises artifact writes so an older snapshot never replaces a newer one.
    flush_lock: Mutex<()>,
}

impl VectorIndex {
    /// An empty index that will persist to `path`.
    pub fn create(path: impl Into<PathBuf>, dimension: usize) -> Self {
        Self {
            path: path.into(),
            dimension,
            entries: RwLock::new(BTreeMap::new()),
            dirty: AtomicBool::new(true),
            flush_lock: Mutex::new(()),
        }
    }

    /// Loads and verifies the artifact at `path`.
    pub async fn load(path: impl Into<PathBuf>, dimension: usize) -> Result<Self, IndexError> {
        let path = path.into();
        let data = tokio::fs::read(&path).await?;
        let entries = decode(&data, dimension).map_err(|reason| IndexError::Corrupt {
            path: path.clone(),
            reason,
        })?;
        debug!(path = %path.display(), entries = entries.len(), "Vector index loaded");
        Ok(Self {
            path,
            dimension,
            entries: RwLock::new(entries),
            dirty: AtomicBool::new(false),
            flush_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn max_sequence_no(&self) -> Option<u64> {
        self.read().keys().next_back().copied()
    }

    /// Inserts `vector` under `sequence_no`. Returns `false` if the key was
    /// already present, in which case the stored vector is kept.
    pub fn insert(&self, sequence_no: u64, mut vector: Vec<f32>) -> Result<bool, IndexError> {
        self.check_dimension(vector.len())?;
        l2_normalize(&mut vector);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(&sequence_no) {
            return Ok(false);
        }
        entries.insert(sequence_no, vector);
        self.dirty.store(true, Ordering::Release);
        Ok(true)
    }

    /// The `k` nearest entries to `vector`, nearest first.
    pub fn query(&self, vector: &[f32], k: usize) -> Result<Vec<IndexHit>, IndexError> {
        self.check_dimension(vector.len())?;
        let mut probe = vector.to_vec();
        l2_normalize(&mut probe);

        let entries = self.read();
        let k = k.min(entries.len());
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut hits: Vec<IndexHit> = entries
            .iter()
            .map(|(&sequence_no, stored)| IndexHit {
                sequence_no,
                distance: cosine_distance(&probe, stored),
            })
            .collect();

        hits.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.sequence_no.cmp(&b.sequence_no))
        });
        hits.truncate(k);
        Ok(hits)
    }

    pub fn contains(&self, sequence_no: u64) -> bool {
        self.read().contains_key(&sequence_no)
    }

    /// True when entries exist that the artifact on disk does not hold yet.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Writes the current contents to the artifact path atomically.
    pub async fn flush(&self) -> Result<(), IndexError> {
        let _flush = self.flush_lock.lock().await;
        // Cleared before the snapshot: an insert racing the write re-marks it.
        self.dirty.store(false, Ordering::Release);
        let encoded = encode(&self.read(), self.dimension);
        let path = self.path.clone();

        let written = tokio::task::spawn_blocking(move || write_atomically(&path, &encoded))
            .await
            .map_err(|e| IndexError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))
            .and_then(|r| r.map_err(IndexError::from));
        if written.is_err() {
            self.dirty.store(true, Ordering::Release);
        }
        written
    }

    /// Flushes only if something changed since the last write. Returns whether it wrote.
    pub async fn flush_if_dirty(&self) -> Result<bool, IndexError> {
        if !self.is_dirty() {
            return Ok(false);
        }
        self.flush().await?;
        Ok(true)
    }

    fn check_dimension(&self, got: usize) -> Result<(), IndexError> {
        if got != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                got,
            });
        }
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<u64, Vec<f32>>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> Vec<(u64, Vec<f32>)> {
        self.read().iter().map(|(k, v)| (*k, v.clone())).collect()
    }
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    (1.0 - dot).clamp(0.0, 2.0)
}

fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn encode(entries: &BTreeMap<u64, Vec<f32>>, dimension: usize) -> Bytes {
    let mut buf =
        BytesMut::with_capacity(HEADER_LEN + entries.len() * (8 + 4 * dimension) + CRC_LEN);
    buf.put_slice(&MAGIC);
    buf.put_u16_le(VERSION);
    buf.put_u32_le(dimension as u32);
    buf.put_u64_le(entries.len() as u64);
    for (sequence_no, vector) in entries {
        buf.put_u64_le(*sequence_no);
        for x in vector {
            buf.put_f32_le(*x);
        }
    }
    let crc = crc32fast::hash(&buf);
    buf.put_u32_le(crc);
    buf.freeze()
}

fn decode(data: &[u8], expected_dimension: usize) -> Result<BTreeMap<u64, Vec<f32>>, String> {
    if data.len() < HEADER_LEN + CRC_LEN {
        return Err(format!("artifact too small ({} bytes)", data.len()));
    }
    let (body, mut crc_bytes) = data.split_at(data.len() - CRC_LEN);
    let stored_crc = crc_bytes.get_u32_le();
    if crc32fast::hash(body) != stored_crc {
        return Err("CRC mismatch".to_string());
    }

    let mut cursor = body;
    if cursor[..4] != MAGIC {
        return Err("bad magic bytes".to_string());
    }
    cursor.advance(4);
    let version = cursor.get_u16_le();
    if version != VERSION {
        return Err(format!("version mismatch: expected {VERSION}, got {version}"));
    }
    let dimension = cursor.get_u32_le() as usize;
    if dimension != expected_dimension {
        return Err(format!(
            "dimension mismatch: expected {expected_dimension}, got {dimension}"
        ));
    }
    let count = cursor.get_u64_le() as usize;
    let entry_len = 8 + 4 * dimension;
    if cursor.remaining() != count.saturating_mul(entry_len) {
        return Err(format!(
            "length mismatch: {count} entries need {} bytes, found {}",
            count.saturating_mul(entry_len),
            cursor.remaining()
        ));
    }

    let mut entries = BTreeMap::new();
    for _ in 0..count {
        let sequence_no = cursor.get_u64_le();
        let vector = (0..dimension).map(|_| cursor.get_f32_le()).collect();
        if entries.insert(sequence_no, vector).is_some() {
            return Err(format!("duplicate sequence_no {sequence_no}"));
        }
    }
    Ok(entries)
}
