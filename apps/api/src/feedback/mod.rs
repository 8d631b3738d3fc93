//! Feedback ledger and similarity retrieval.
//!
//! The append-only ledger is the source of truth. The vector index, metadata
//! store and aggregator are projections of it: disposable, and rebuilt from the
//! ledger whenever they are lost or disagree with it.

pub mod aggregator;
pub mod derived;
pub mod export;
pub mod handlers;
pub mod ingest;
pub mod ledger;
pub mod metadata;
pub mod models;
pub mod rebuild;
pub mod retrieval;
pub mod vector_index;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::embedder::Embedder;
use crate::feedback::derived::{DerivedHandle, StoreLayout};
use crate::feedback::export::ExportService;
use crate::feedback::ingest::IngestionService;
use crate::feedback::ledger::Ledger;
use crate::feedback::metadata::MetadataError;
use crate::feedback::models::{FeedbackRecord, FeedbackStatistics};
use crate::feedback::rebuild::{open_derived, RebuildError, RebuildTool};
use crate::feedback::retrieval::RetrievalService;
use crate::feedback::vector_index::IndexError;

/// Every feedback store handle and service, wired together once at startup.
#[derive(Clone)]
pub struct FeedbackServices {
    pub ledger: Arc<Ledger>,
    pub derived: Arc<DerivedHandle>,
    pub ingestion: Arc<IngestionService>,
    pub retrieval: Arc<RetrievalService>,
    pub export: Arc<ExportService>,
    pub rebuild: Arc<RebuildTool>,
}

impl FeedbackServices {
    /// Opens (or creates) the ledger under `data_dir` and brings the derived
    /// stores in line with it, rebuilding them if necessary.
    pub async fn open(
        data_dir: &Path,
        embedder: Arc<dyn Embedder>,
        fsync_ledger: bool,
    ) -> Result<Self, RebuildError> {
        let layout = StoreLayout::new(data_dir);
        let ledger = Arc::new(Ledger::open(layout.ledger_path(), fsync_ledger).await?);
        let stores = open_derived(&layout, &ledger, embedder.as_ref()).await?;
        let derived = Arc::new(DerivedHandle::new(stores));

        Ok(Self {
            ingestion: Arc::new(IngestionService::new(
                ledger.clone(),
                derived.clone(),
                embedder.clone(),
            )),
            retrieval: Arc::new(RetrievalService::new(derived.clone(), embedder.clone())),
            export: Arc::new(ExportService::new(derived.clone())),
            rebuild: Arc::new(RebuildTool::new(
                layout,
                ledger.clone(),
                derived.clone(),
                embedder,
            )),
            ledger,
            derived,
        })
    }

    pub async fn statistics(&self) -> Result<FeedbackStatistics, MetadataError> {
        let stores = self.derived.current();
        stores
            .aggregator
            .statistics(&stores.metadata, &stores.index, self.ledger.len())
            .await
    }

    /// Records rated at least `min_rating`, oldest first, for fine-tuning sets.
    pub async fn high_quality(
        &self,
        min_rating: u8,
        limit: u32,
    ) -> Result<Vec<FeedbackRecord>, MetadataError> {
        self.derived
            .current()
            .metadata
            .with_min_rating(min_rating, limit)
            .await
    }

    /// Writes the live index artifact if inserts happened since the last write.
    pub async fn flush_index(&self) -> Result<bool, IndexError> {
        self.derived.current().index.flush_if_dirty().await
    }

    /// Periodically persists the live index. Ingestion only updates it in
    /// memory; vectors lost in a crash are re-embedded at the next startup.
    pub fn spawn_index_flusher(&self, period: Duration) -> JoinHandle<()> {
        let services = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match services.flush_index().await {
                    Ok(true) => debug!("Vector index flushed"),
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "Periodic vector index flush failed"),
                }
            }
        })
    }

    /// Flushes the vector index and closes the metadata store.
    pub async fn shutdown(&self) {
        self.derived.current().close().await;
        info!(records = self.ledger.len(), "Feedback stores closed");
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{open_services, submission};
    use super::*;
    use crate::feedback::vector_index::VectorIndex;

    #[tokio::test]
    async fn test_ingest_defers_index_write_to_flush() {
        let dir = tempfile::tempdir().unwrap();
        let services = open_services(&dir).await;
        assert!(!services.flush_index().await.unwrap());

        services
            .ingestion
            .ingest(submission("int-1", "Strong Python background", 5))
            .await
            .unwrap();
        let stores = services.derived.current();
        let on_disk = VectorIndex::load(stores.index.path(), stores.index.dimension())
            .await
            .unwrap();
        assert_eq!(on_disk.len(), 0);

        assert!(services.flush_index().await.unwrap());
        assert!(!services.flush_index().await.unwrap());
    }

    #[tokio::test]
    async fn test_flusher_persists_in_background() {
        let dir = tempfile::tempdir().unwrap();
        let services = open_services(&dir).await;
        let flusher = services.spawn_index_flusher(Duration::from_millis(20));

        services
            .ingestion
            .ingest(submission("int-1", "Strong Python background", 5))
            .await
            .unwrap();
        for _ in 0..100 {
            if !services.derived.current().index.is_dirty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!services.derived.current().index.is_dirty());
        flusher.abort();
    }
}
