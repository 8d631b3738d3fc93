//! Ingestion: validate, append to the ledger, then index and store the record.
//!
//! The ledger append is the commit point. After it, nothing fails the call:
//! indexing and metadata problems come back as `PartialIndexError` warnings and
//! are repaired by the next rebuild.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::embedder::Embedder;
use crate::feedback::derived::{DerivedHandle, DerivedStores};
use crate::feedback::ledger::{Ledger, LedgerError};
use crate::feedback::models::{FeedbackRecord, FeedbackSubmission, NewFeedback};

pub const MIN_RATING: i64 = 1;
pub const MAX_RATING: i64 = 5;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexStage {
    Embedding,
    VectorIndex,
    Metadata,
}

/// A post-commit step that did not complete. The record is safe in the ledger.
#[derive(Debug, Clone, Serialize)]
pub struct PartialIndexError {
    pub stage: IndexStage,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub record: FeedbackRecord,
    pub warnings: Vec<PartialIndexError>,
}

impl IngestOutcome {
    pub fn fully_indexed(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Checks a submission and fills defaults. Nothing is persisted on rejection.
pub fn validate(submission: FeedbackSubmission) -> Result<NewFeedback, IngestError> {
    if !(MIN_RATING..=MAX_RATING).contains(&submission.rating) {
        return Err(IngestError::Validation(format!(
            "rating must be between {MIN_RATING} and {MAX_RATING}, got {}",
            submission.rating
        )));
    }
    if submission.response.trim().is_empty() {
        return Err(IngestError::Validation(
            "response cannot be empty".to_string(),
        ));
    }

    let ideal_response = submission
        .ideal_response
        .filter(|ideal| !ideal.trim().is_empty())
        .unwrap_or_else(|| submission.response.clone());

    Ok(NewFeedback {
        interaction_id: submission.interaction_id,
        query: submission.query,
        context: submission.context,
        response: submission.response,
        rating: submission.rating as u8,
        correct_points: submission.correct_points,
        incorrect_points: submission.incorrect_points,
        missing_points: submission.missing_points,
        ideal_response,
        analysis_id: submission.analysis_id.filter(|id| !id.is_empty()),
        job_id: submission.job_id.filter(|id| !id.is_empty()),
    })
}

pub struct IngestionService {
    ledger: Arc<Ledger>,
    derived: Arc<DerivedHandle>,
    embedder: Arc<dyn Embedder>,
}

impl IngestionService {
    pub fn new(ledger: Arc<Ledger>, derived: Arc<DerivedHandle>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            ledger,
            derived,
            embedder,
        }
    }

    pub async fn ingest(&self, submission: FeedbackSubmission) -> Result<IngestOutcome, IngestError> {
        let feedback = validate(submission)?;
        let record = self.ledger.append(feedback).await?;

        info!(
            sequence_no = record.sequence_no,
            interaction_id = %record.interaction_id,
            rating = record.rating,
            "Feedback appended to ledger"
        );

        let stores = self.derived.current();

        // Disjoint keys: the index insert and the metadata put can run together.
        let (indexed, stored) = tokio::join!(
            self.index_record(&stores, &record),
            stores.metadata.put(&record)
        );

        let mut warnings = Vec::new();
        if let Err(partial) = indexed {
            warnings.push(partial);
        }
        if let Err(e) = stored {
            warnings.push(PartialIndexError {
                stage: IndexStage::Metadata,
                message: e.to_string(),
            });
        }
        stores.aggregator.signal();

        for warning in &warnings {
            warn!(
                sequence_no = record.sequence_no,
                stage = ?warning.stage,
                message = %warning.message,
                "Feedback durable but not fully indexed; deferred to rebuild"
            );
        }

        Ok(IngestOutcome { record, warnings })
    }

    async fn index_record(
        &self,
        stores: &DerivedStores,
        record: &FeedbackRecord,
    ) -> Result<(), PartialIndexError> {
        let vector = self
            .embedder
            .embed(&record.embedding_text())
            .await
            .map_err(|e| PartialIndexError {
                stage: IndexStage::Embedding,
                message: e.to_string(),
            })?;

        // In memory only; the artifact is written by the background flusher.
        stores
            .index
            .insert(record.sequence_no, vector)
            .map_err(|e| PartialIndexError {
                stage: IndexStage::VectorIndex,
                message: e.to_string(),
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedback::test_support::{
        open_services, open_services_with, submission, FailingEmbedder, TEST_DIM,
    };

    #[test]
    fn test_rating_out_of_range_rejected() {
        for rating in [0, 6, -1] {
            let mut s = submission("int-1", "Strong Python background", 3);
            s.rating = rating;
            assert!(matches!(validate(s), Err(IngestError::Validation(_))));
        }
    }

    #[test]
    fn test_blank_response_rejected() {
        let s = submission("int-1", "   ", 3);
        assert!(matches!(validate(s), Err(IngestError::Validation(_))));
    }

    #[test]
    fn test_ideal_response_defaults_to_response() {
        let mut s = submission("int-1", "Strong Python background", 4);
        s.ideal_response = None;
        assert_eq!(validate(s.clone()).unwrap().ideal_response, "Strong Python background");

        s.ideal_response = Some("  ".into());
        assert_eq!(validate(s).unwrap().ideal_response, "Strong Python background");
    }

    #[tokio::test]
    async fn test_rejected_submission_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let services = open_services(&dir).await;

        let mut s = submission("int-1", "Strong Python background", 3);
        s.rating = 9;
        assert!(services.ingestion.ingest(s).await.is_err());
        assert_eq!(services.ledger.len(), 0);
    }

    #[tokio::test]
    async fn test_round_trip_through_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let services = open_services(&dir).await;

        let mut s = submission("int-7", "Strong Python background", 4);
        s.query = "Python experience?".into();
        s.context = vec!["Resume section: Skills".into()];
        s.correct_points = vec!["Django".into()];
        s.incorrect_points = vec!["Claims 10 years".into()];
        s.missing_points = vec!["Testing".into()];
        s.ideal_response = None;
        s.job_id = Some("job-3".into());

        let outcome = services.ingestion.ingest(s.clone()).await.unwrap();
        assert!(outcome.fully_indexed());

        let stored = services
            .derived
            .current()
            .metadata
            .get(outcome.record.sequence_no)
            .await
            .unwrap();
        assert_eq!(stored, outcome.record);
        assert_eq!(stored.interaction_id, s.interaction_id);
        assert_eq!(stored.query, s.query);
        assert_eq!(stored.context, s.context);
        assert_eq!(stored.response, s.response);
        assert_eq!(stored.rating, 4);
        assert_eq!(stored.correct_points, s.correct_points);
        assert_eq!(stored.incorrect_points, s.incorrect_points);
        assert_eq!(stored.missing_points, s.missing_points);
        assert_eq!(stored.ideal_response, "Strong Python background");
        assert_eq!(stored.job_id.as_deref(), Some("job-3"));
    }

    #[tokio::test]
    async fn test_same_interaction_twice_gives_two_records() {
        let dir = tempfile::tempdir().unwrap();
        let services = open_services(&dir).await;

        let first = services
            .ingestion
            .ingest(submission("int-1", "Strong Python background", 5))
            .await
            .unwrap();
        let second = services
            .ingestion
            .ingest(submission("int-1", "Strong Python background", 2))
            .await
            .unwrap();
        assert_ne!(first.record.sequence_no, second.record.sequence_no);

        let stats = services.statistics().await.unwrap();
        assert_eq!(stats.total_feedback, 2);
        assert_eq!(stats.average_rating, 3.5);
        assert_eq!(stats.vector_index_count, 2);
    }

    #[tokio::test]
    async fn test_embedder_outage_is_soft() {
        let dir = tempfile::tempdir().unwrap();
        let services = open_services_with(&dir, Arc::new(FailingEmbedder::new(TEST_DIM))).await;

        let outcome = services
            .ingestion
            .ingest(submission("int-1", "Strong Python background", 5))
            .await
            .unwrap();
        assert!(!outcome.fully_indexed());
        assert_eq!(outcome.warnings[0].stage, IndexStage::Embedding);

        let stats = services.statistics().await.unwrap();
        assert_eq!(stats.ledger_count, 1);
        assert_eq!(stats.metadata_count, 1);
        assert_eq!(stats.vector_index_count, 0);
    }
}
