//! Derived stores (vector index + metadata + aggregator) and their on-disk generations.
//!
//! Each rebuild writes a complete new generation directory and then flips the
//! `CURRENT` pointer file. In memory, the live generation is one
//! `Arc<DerivedStores>` behind `DerivedHandle`; readers clone the `Arc`, so a
//! swap is observed either entirely or not at all.

use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::feedback::aggregator::Aggregator;
use crate::feedback::metadata::{MetadataError, MetadataStore};
use crate::feedback::vector_index::{IndexError, VectorIndex};

const LEDGER_FILE: &str = "interactions.jsonl";
const DERIVED_DIR: &str = "derived";
const CURRENT_FILE: &str = "CURRENT";
const GENERATION_PREFIX: &str = "gen-";
const METADATA_FILE: &str = "metadata.db";
const INDEX_FILE: &str = "vectors.idx";

/// Derived stores disagree with the ledger or cannot be read.
#[derive(Debug, Error)]
#[error("Store corruption: {0}")]
pub struct StoreCorruption(pub String);

/// Paths under the feedback data directory.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.root.join(LEDGER_FILE)
    }

    fn derived_dir(&self) -> PathBuf {
        self.root.join(DERIVED_DIR)
    }

    pub fn generation_dir(&self, generation: u64) -> PathBuf {
        self.derived_dir()
            .join(format!("{GENERATION_PREFIX}{generation:06}"))
    }

    /// The generation `CURRENT` points at, if any.
    pub fn read_current(&self) -> std::io::Result<Option<u64>> {
        match std::fs::read_to_string(self.derived_dir().join(CURRENT_FILE)) {
            Ok(text) => text.trim().parse::<u64>().map(Some).map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("CURRENT is not a generation number: {e}"),
                )
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Atomically points `CURRENT` at `generation`.
    pub fn write_current(&self, generation: u64) -> std::io::Result<()> {
        use std::io::Write;

        let dir = self.derived_dir();
        std::fs::create_dir_all(&dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        writeln!(tmp, "{generation}")?;
        tmp.as_file().sync_all()?;
        tmp.persist(dir.join(CURRENT_FILE)).map_err(|e| e.error)?;
        Ok(())
    }

    /// Generation numbers with a directory on disk, ascending.
    pub fn generations(&self) -> std::io::Result<Vec<u64>> {
        let dir = self.derived_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut generations: Vec<u64> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .and_then(|name| name.strip_prefix(GENERATION_PREFIX))
                    .and_then(|n| n.parse().ok())
            })
            .collect();
        generations.sort_unstable();
        Ok(generations)
    }

    /// First generation number not used on disk or by `CURRENT`.
    pub fn next_generation(&self) -> std::io::Result<u64> {
        let on_disk = self.generations()?.last().copied().unwrap_or(0);
        let current = self.read_current().ok().flatten().unwrap_or(0);
        Ok(on_disk.max(current) + 1)
    }

    /// Deletes every generation directory except `keep`. Failures are logged.
    pub fn remove_stale_generations(&self, keep: u64) {
        let generations = match self.generations() {
            Ok(g) => g,
            Err(e) => {
                warn!(error = %e, "Could not list derived generations");
                return;
            }
        };
        for generation in generations.into_iter().filter(|&g| g != keep) {
            self.remove_generation(generation);
        }
    }

    /// Deletes one generation directory. Failures are logged.
    pub fn remove_generation(&self, generation: u64) {
        match std::fs::remove_dir_all(self.generation_dir(generation)) {
            Ok(()) => debug!(generation, "Removed derived generation"),
            Err(e) => warn!(generation, error = %e, "Failed to remove derived generation"),
        }
    }
}

/// One generation of derived state.
pub struct DerivedStores {
    pub generation: u64,
    pub index: VectorIndex,
    pub metadata: MetadataStore,
    pub aggregator: Aggregator,
}

impl DerivedStores {
    /// Creates an empty generation, replacing any leftover directory of the same number.
    pub async fn create(
        layout: &StoreLayout,
        generation: u64,
        dimension: usize,
    ) -> Result<Self, StoreCorruption> {
        let dir = layout.generation_dir(generation);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await.map_err(io_corruption)?;
        }
        tokio::fs::create_dir_all(&dir).await.map_err(io_corruption)?;

        let metadata = MetadataStore::create(&dir.join(METADATA_FILE))
            .await
            .map_err(metadata_corruption)?;

        Ok(Self {
            generation,
            index: VectorIndex::create(dir.join(INDEX_FILE), dimension),
            metadata,
            aggregator: Aggregator::new(),
        })
    }

    /// Opens an existing generation. Anything missing or unreadable is corruption.
    pub async fn open(
        layout: &StoreLayout,
        generation: u64,
        dimension: usize,
    ) -> Result<Self, StoreCorruption> {
        let dir = layout.generation_dir(generation);
        if !dir.is_dir() {
            return Err(StoreCorruption(format!(
                "generation {generation} missing at {}",
                dir.display()
            )));
        }

        let index = VectorIndex::load(dir.join(INDEX_FILE), dimension)
            .await
            .map_err(index_corruption)?;
        let metadata = MetadataStore::open_existing(&dir.join(METADATA_FILE))
            .await
            .map_err(metadata_corruption)?;

        Ok(Self {
            generation,
            index,
            metadata,
            aggregator: Aggregator::new(),
        })
    }

    /// Compares this generation against a ledger of `ledger_len` records.
    ///
    /// The vector index may legitimately trail the ledger (embedding lag); that
    /// is logged, not rejected. Everything else must line up exactly.
    pub async fn check_integrity(&self, ledger_len: u64) -> Result<(), StoreCorruption> {
        let metadata_count = self.metadata.count().await.map_err(metadata_corruption)?;
        if metadata_count != ledger_len {
            return Err(StoreCorruption(format!(
                "metadata holds {metadata_count} records, ledger holds {ledger_len}"
            )));
        }
        if let Some(max) = self
            .metadata
            .max_sequence_no()
            .await
            .map_err(metadata_corruption)?
        {
            if max >= ledger_len {
                return Err(StoreCorruption(format!(
                    "metadata references sequence_no {max} beyond ledger length {ledger_len}"
                )));
            }
        }

        let index_count = self.index.len() as u64;
        if index_count > ledger_len {
            return Err(StoreCorruption(format!(
                "vector index holds {index_count} entries, ledger holds {ledger_len}"
            )));
        }
        if let Some(max) = self.index.max_sequence_no() {
            if max >= ledger_len {
                return Err(StoreCorruption(format!(
                    "vector index references sequence_no {max} beyond ledger length {ledger_len}"
                )));
            }
        }
        if index_count < ledger_len {
            warn!(
                generation = self.generation,
                index_count,
                ledger_len,
                "Vector index trails the ledger; some records are not searchable"
            );
        }
        Ok(())
    }

    /// Persists the index artifact and closes the metadata pool.
    pub async fn close(&self) {
        if let Err(e) = self.index.flush().await {
            warn!(generation = self.generation, error = %e, "Failed to flush vector index");
        }
        self.metadata.close().await;
    }
}

/// The live generation, swappable as a unit.
pub struct DerivedHandle {
    current: RwLock<Arc<DerivedStores>>,
}

impl DerivedHandle {
    pub fn new(stores: DerivedStores) -> Self {
        Self {
            current: RwLock::new(Arc::new(stores)),
        }
    }

    pub fn current(&self) -> Arc<DerivedStores> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Publishes `stores` and returns the generation it replaced.
    pub fn swap(&self, stores: DerivedStores) -> Arc<DerivedStores> {
        let next = Arc::new(stores);
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        info!(
            from = current.generation,
            to = next.generation,
            "Derived stores swapped"
        );
        std::mem::replace(&mut *current, next)
    }
}

fn io_corruption(e: std::io::Error) -> StoreCorruption {
    StoreCorruption(format!("derived store I/O: {e}"))
}

fn index_corruption(e: IndexError) -> StoreCorruption {
    StoreCorruption(e.to_string())
}

fn metadata_corruption(e: MetadataError) -> StoreCorruption {
    StoreCorruption(e.to_string())
}
