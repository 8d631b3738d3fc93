//! Feedback statistics, derived from the metadata store.
//!
//! Nothing here is authoritative. Totals are cached and invalidated by a write
//! counter: ingestion calls `signal` after each metadata put, and the next read
//! recomputes from the store. A write racing a recompute only causes one extra
//! recompute; it can never be double counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::feedback::metadata::{MetadataError, MetadataStore};
use crate::feedback::models::FeedbackStatistics;
use crate::feedback::vector_index::VectorIndex;

#[derive(Debug, Clone, Copy)]
struct CachedTotals {
    at_writes: u64,
    count: u64,
    rating_sum: u64,
}

#[derive(Debug, Default)]
pub struct Aggregator {
    writes: AtomicU64,
    cache: Mutex<Option<CachedTotals>>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks cached totals stale.
    pub fn signal(&self) {
        self.writes.fetch_add(1, Ordering::AcqRel);
    }

    /// `(count, rating_sum)` over the metadata store.
    pub async fn totals(&self, metadata: &MetadataStore) -> Result<(u64, u64), MetadataError> {
        let writes = self.writes.load(Ordering::Acquire);
        let cached = *self.lock();
        if let Some(cached) = cached {
            if cached.at_writes == writes {
                return Ok((cached.count, cached.rating_sum));
            }
        }

        let (count, rating_sum) = metadata.rating_totals().await?;

        let mut cache = self.lock();
        if cache.map_or(true, |c| c.at_writes <= writes) {
            *cache = Some(CachedTotals {
                at_writes: writes,
                count,
                rating_sum,
            });
        }
        Ok((count, rating_sum))
    }

    pub async fn statistics(
        &self,
        metadata: &MetadataStore,
        index: &VectorIndex,
        ledger_count: u64,
    ) -> Result<FeedbackStatistics, MetadataError> {
        let (count, rating_sum) = self.totals(metadata).await?;
        Ok(FeedbackStatistics {
            total_feedback: count,
            average_rating: average_rating(rating_sum, count),
            vector_index_count: index.len() as u64,
            metadata_count: count,
            ledger_count,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<CachedTotals>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Arithmetic mean; `0.0` when there is nothing to average.
pub fn average_rating(rating_sum: u64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        rating_sum as f64 / count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedback::test_support::record;

    #[test]
    fn test_average_of_nothing_is_zero() {
        assert_eq!(average_rating(0, 0), 0.0);
    }

    #[test]
    fn test_average_five_five_two() {
        assert_eq!(average_rating(12, 3), 4.0);
    }

    #[tokio::test]
    async fn test_statistics_follow_signals() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = MetadataStore::create(&dir.path().join("metadata.db"))
            .await
            .unwrap();
        let index = VectorIndex::create(dir.path().join("vectors.idx"), 4);
        let aggregator = Aggregator::new();

        let empty = aggregator.statistics(&metadata, &index, 0).await.unwrap();
        assert_eq!(empty.total_feedback, 0);
        assert_eq!(empty.average_rating, 0.0);

        for (seq, rating) in [(0, 5), (1, 5), (2, 2)] {
            metadata.put(&record(seq, "i", "r", rating)).await.unwrap();
            aggregator.signal();
        }
        index.insert(0, vec![1.0, 0.0, 0.0, 0.0]).unwrap();

        let stats = aggregator.statistics(&metadata, &index, 4).await.unwrap();
        assert_eq!(stats.total_feedback, 3);
        assert_eq!(stats.metadata_count, 3);
        assert_eq!(stats.average_rating, 4.0);
        assert_eq!(stats.vector_index_count, 1);
        assert_eq!(stats.ledger_count, 4);
    }

    #[tokio::test]
    async fn test_cached_totals_reused_without_signal() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = MetadataStore::create(&dir.path().join("metadata.db"))
            .await
            .unwrap();
        let aggregator = Aggregator::new();

        metadata.put(&record(0, "i", "r", 5)).await.unwrap();
        aggregator.signal();
        assert_eq!(aggregator.totals(&metadata).await.unwrap(), (1, 5));

        // Unsignalled write: cache is still considered fresh.
        metadata.put(&record(1, "i", "r", 1)).await.unwrap();
        assert_eq!(aggregator.totals(&metadata).await.unwrap(), (1, 5));

        aggregator.signal();
        assert_eq!(aggregator.totals(&metadata).await.unwrap(), (2, 6));
    }
}
