//! Similarity search: embed the query, take nearest index entries, join metadata.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::embedder::{Embedder, EmbedderError};
use crate::feedback::derived::DerivedHandle;
use crate::feedback::metadata::MetadataError;
use crate::feedback::models::SearchHit;
use crate::feedback::vector_index::IndexError;

#[derive(Debug, Error)]
pub enum SearchError {
    /// Retryable; nothing was read.
    #[error(transparent)]
    EmbedderUnavailable(#[from] EmbedderError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

pub struct RetrievalService {
    derived: Arc<DerivedHandle>,
    embedder: Arc<dyn Embedder>,
}

impl RetrievalService {
    pub fn new(derived: Arc<DerivedHandle>, embedder: Arc<dyn Embedder>) -> Self {
        Self { derived, embedder }
    }

    /// At most `k` records nearest to `query`, most similar first.
    ///
    /// With `min_rating`, lower-rated records are skipped after the join and the
    /// next-nearest ones fill their places.
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        min_rating: Option<u8>,
    ) -> Result<Vec<SearchHit>, SearchError> {
        let stores = self.derived.current();
        if k == 0 || stores.index.is_empty() {
            return Ok(Vec::new());
        }

        let vector = self.embedder.embed(query).await?;
        let candidates = match min_rating {
            Some(_) => stores.index.len(),
            None => k,
        };
        let hits = stores.index.query(&vector, candidates)?;

        let mut results = Vec::with_capacity(k.min(hits.len()));
        for hit in hits {
            let record = match stores.metadata.get(hit.sequence_no).await {
                Ok(record) => record,
                Err(MetadataError::NotFound(sequence_no)) => {
                    warn!(
                        sequence_no,
                        generation = stores.generation,
                        "Index hit has no metadata; dropping from results"
                    );
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if min_rating.is_some_and(|min| record.rating < min) {
                continue;
            }
            results.push(SearchHit::new(record, hit.distance));
            if results.len() == k {
                break;
            }
        }

        debug!(k, returned = results.len(), "Feedback search complete");
        Ok(results)
    }
}
