//! Rebuild: replay the ledger into a fresh generation of derived stores.
//!
//! Used at startup when the live generation is missing or disagrees with the
//! ledger, and on operator demand. The shadow generation is filled from a ledger
//! snapshot while ingestion continues; appends are then frozen just long enough
//! to replay the tail and swap.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::embedder::Embedder;
use crate::feedback::derived::{DerivedHandle, DerivedStores, StoreCorruption, StoreLayout};
use crate::feedback::ledger::{Ledger, LedgerError};
use crate::feedback::metadata::MetadataError;
use crate::feedback::models::FeedbackRecord;
use crate::feedback::vector_index::IndexError;

#[derive(Debug, Error)]
pub enum RebuildError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Store(#[from] StoreCorruption),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error("Rebuild I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Swapping in the shadow generation would have lost searchable vectors.
    #[error("Embedder unavailable during rebuild: {failures} records unembedded, {indexed} indexed vs {live} live")]
    EmbedderUnavailable { failures: u64, indexed: u64, live: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    pub generation: u64,
    pub replayed: u64,
    pub indexed: u64,
    pub embed_failures: u64,
}

impl RebuildReport {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            replayed: 0,
            indexed: 0,
            embed_failures: 0,
        }
    }
}

/// Opens the live generation, rebuilding it first if it is missing or fails
/// the integrity check. Must run before any reads are served.
pub async fn open_derived(
    layout: &StoreLayout,
    ledger: &Ledger,
    embedder: &dyn Embedder,
) -> Result<DerivedStores, RebuildError> {
    let dimension = embedder.dimension();

    match layout.read_current() {
        Ok(Some(generation)) => match DerivedStores::open(layout, generation, dimension).await {
            Ok(stores) => match stores.check_integrity(ledger.len()).await {
                Ok(()) => {
                    if (stores.index.len() as u64) < ledger.len() {
                        backfill_index(&stores, ledger, embedder).await?;
                    }
                    layout.remove_stale_generations(generation);
                    info!(
                        generation,
                        records = ledger.len(),
                        indexed = stores.index.len(),
                        "Derived stores opened"
                    );
                    return Ok(stores);
                }
                Err(corruption) => {
                    warn!(generation, %corruption, "Derived stores inconsistent; rebuilding");
                    stores.metadata.close().await;
                }
            },
            Err(corruption) => {
                warn!(generation, %corruption, "Derived stores unreadable; rebuilding");
            }
        },
        Ok(None) => info!("No derived stores yet; building from ledger"),
        Err(e) => warn!(error = %e, "Unreadable CURRENT pointer; rebuilding"),
    }

    let started = Instant::now();
    let generation = layout.next_generation()?;
    let stores = DerivedStores::create(layout, generation, dimension).await?;
    let mut report = RebuildReport::new(generation);

    let records = ledger.replay(0, ledger.len()).await?;
    replay_records(&stores, &records, embedder, &mut report).await?;
    stores.index.flush().await?;
    layout.write_current(generation)?;
    layout.remove_stale_generations(generation);

    info!(
        generation,
        replayed = report.replayed,
        indexed = report.indexed,
        embed_failures = report.embed_failures,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Derived stores rebuilt at startup"
    );
    Ok(stores)
}

pub struct RebuildTool {
    layout: StoreLayout,
    ledger: Arc<Ledger>,
    derived: Arc<DerivedHandle>,
    embedder: Arc<dyn Embedder>,
    running: Mutex<()>,
}

impl RebuildTool {
    pub fn new(
        layout: StoreLayout,
        ledger: Arc<Ledger>,
        derived: Arc<DerivedHandle>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            layout,
            ledger,
            derived,
            embedder,
            running: Mutex::new(()),
        }
    }

    /// Rebuilds every derived store from the ledger and swaps them in.
    /// Concurrent calls run one after another.
    pub async fn rebuild(&self) -> Result<RebuildReport, RebuildError> {
        let _running = self.running.lock().await;
        let started = Instant::now();

        let generation = self.layout.next_generation()?;
        let shadow =
            DerivedStores::create(&self.layout, generation, self.embedder.dimension()).await?;
        let mut report = RebuildReport::new(generation);

        let snapshot_len = self.ledger.len();
        info!(generation, snapshot_len, "Rebuild started");
        let records = self.ledger.replay(0, snapshot_len).await?;
        replay_records(&shadow, &records, self.embedder.as_ref(), &mut report).await?;
        if let Err(e) = self.refuse_degraded(&shadow, &report) {
            self.discard(shadow).await;
            return Err(e);
        }

        let previous = {
            let freeze = self.ledger.freeze().await;
            let tail = self.ledger.replay(snapshot_len, freeze.len()).await?;
            if !tail.is_empty() {
                debug!(tail = tail.len(), "Replaying records appended during rebuild");
            }
            replay_records(&shadow, &tail, self.embedder.as_ref(), &mut report).await?;
            if let Err(e) = self.refuse_degraded(&shadow, &report) {
                drop(freeze);
                self.discard(shadow).await;
                return Err(e);
            }
            shadow.index.flush().await?;
            self.layout.write_current(generation)?;
            self.derived.swap(shadow)
        };

        match Arc::try_unwrap(previous) {
            Ok(old) => {
                old.metadata.close().await;
                self.layout.remove_generation(old.generation);
            }
            Err(_) => debug!("Previous generation still in use; removal deferred to next startup"),
        }

        info!(
            generation,
            replayed = report.replayed,
            indexed = report.indexed,
            embed_failures = report.embed_failures,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Rebuild complete"
        );
        Ok(report)
    }
}

impl RebuildTool {
    /// A rebuild that failed to embed records must not leave fewer vectors
    /// searchable than the live generation has.
    fn refuse_degraded(
        &self,
        shadow: &DerivedStores,
        report: &RebuildReport,
    ) -> Result<(), RebuildError> {
        let indexed = shadow.index.len() as u64;
        let live = self.derived.current().index.len() as u64;
        if report.embed_failures > 0 && indexed < live {
            warn!(
                generation = shadow.generation,
                embed_failures = report.embed_failures,
                indexed,
                live,
                "Rebuild would shrink the vector index; keeping the live generation"
            );
            return Err(RebuildError::EmbedderUnavailable {
                failures: report.embed_failures,
                indexed,
                live,
            });
        }
        Ok(())
    }

    async fn discard(&self, shadow: DerivedStores) {
        shadow.metadata.close().await;
        self.layout.remove_generation(shadow.generation);
    }
}

/// Embeds ledger records the index is missing, e.g. inserts that were never
/// flushed before a crash. Metadata already matches the ledger at this point.
async fn backfill_index(
    stores: &DerivedStores,
    ledger: &Ledger,
    embedder: &dyn Embedder,
) -> Result<(), RebuildError> {
    let records = ledger.replay(0, ledger.len()).await?;
    let mut filled = 0u64;
    let mut failed = 0u64;
    for record in records
        .iter()
        .filter(|r| !stores.index.contains(r.sequence_no))
    {
        let inserted = match embedder.embed(&record.embedding_text()).await {
            Ok(vector) => stores
                .index
                .insert(record.sequence_no, vector)
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match inserted {
            Ok(_) => filled += 1,
            Err(message) => {
                failed += 1;
                debug!(sequence_no = record.sequence_no, %message, "Backfill skipped record");
            }
        }
    }
    if filled > 0 {
        stores.index.flush().await?;
    }
    info!(
        generation = stores.generation,
        filled,
        failed,
        "Vector index caught up with the ledger"
    );
    Ok(())
}

async fn replay_records(
    stores: &DerivedStores,
    records: &[FeedbackRecord],
    embedder: &dyn Embedder,
    report: &mut RebuildReport,
) -> Result<(), RebuildError> {
    for record in records {
        stores.metadata.put(record).await?;

        let indexed = match embedder.embed(&record.embedding_text()).await {
            Ok(vector) => stores
                .index
                .insert(record.sequence_no, vector)
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match indexed {
            Ok(_) => report.indexed += 1,
            Err(message) => {
                report.embed_failures += 1;
                warn!(
                    sequence_no = record.sequence_no,
                    %message,
                    "Record replayed without a vector"
                );
            }
        }
        report.replayed += 1;
    }
    stores.aggregator.signal();
    Ok(())
}
