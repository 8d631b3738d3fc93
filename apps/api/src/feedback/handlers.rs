use axum::{
    body::Body,
    extract::{rejection::JsonRejection, rejection::QueryRejection, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::AppError;
use crate::feedback::ingest::{PartialIndexError, MAX_RATING, MIN_RATING};
use crate::feedback::models::{FeedbackRecord, FeedbackSubmission, SearchHit};
use crate::feedback::rebuild::RebuildReport;
use crate::state::AppState;

pub const EXPORT_FILENAME: &str = "feedback_export.csv";

#[derive(Serialize)]
pub struct SubmitResponse {
    pub status: &'static str,
    pub sequence_no: u64,
    pub interaction_id: String,
    pub analysis_id: Option<String>,
    pub job_id: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub indexed: bool,
    pub warnings: Vec<PartialIndexError>,
}

/// POST /api/feedback/submit
///
/// Answers 202 once the record is durable in the ledger, even when indexing
/// only partly succeeded.
pub async fn handle_submit(
    State(state): State<AppState>,
    payload: Result<Json<FeedbackSubmission>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitResponse>), AppError> {
    let Json(submission) = payload.map_err(|e| AppError::Validation(e.body_text()))?;

    // Detached so a dropped connection cannot cut ingestion off between the
    // ledger append and the index writes.
    let ingestion = state.feedback.ingestion.clone();
    let outcome = tokio::spawn(async move { ingestion.ingest(submission).await })
        .await
        .map_err(|e| AppError::Internal(e.into()))??;

    let indexed = outcome.fully_indexed();
    let record = outcome.record;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            status: "accepted",
            sequence_no: record.sequence_no,
            interaction_id: record.interaction_id,
            analysis_id: record.analysis_id,
            job_id: record.job_id,
            submitted_at: record.submitted_at,
            indexed,
            warnings: outcome.warnings,
        }),
    ))
}

#[derive(Serialize)]
pub struct StatisticsResponse {
    pub total_feedback: u64,
    pub average_rating: f64,
    pub chromadb_count: u64,
    pub faiss_count: u64,
    pub ledger_count: u64,
}

/// GET /api/feedback/statistics
pub async fn handle_statistics(
    State(state): State<AppState>,
) -> Result<Json<StatisticsResponse>, AppError> {
    let stats = state.feedback.statistics().await?;
    Ok(Json(StatisticsResponse {
        total_feedback: stats.total_feedback,
        average_rating: stats.average_rating,
        chromadb_count: stats.metadata_count,
        faiss_count: stats.vector_index_count,
        ledger_count: stats.ledger_count,
    }))
}

fn default_n_results() -> usize {
    5
}

#[derive(Deserialize)]
pub struct SearchParams {
    pub query: String,
    #[serde(default = "default_n_results")]
    pub n_results: usize,
    pub min_rating: Option<i64>,
}

#[derive(Serialize)]
pub struct SearchResult {
    pub sequence_no: u64,
    pub document: String,
    pub metadata: FeedbackRecord,
    pub distance: f32,
    pub similarity: f32,
}

impl From<SearchHit> for SearchResult {
    fn from(hit: SearchHit) -> Self {
        Self {
            sequence_no: hit.record.sequence_no,
            document: hit.record.embedding_text(),
            metadata: hit.record,
            distance: hit.distance,
            similarity: hit.similarity,
        }
    }
}

#[derive(Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
}

/// GET /api/feedback/search?query=...&n_results=5&min_rating=4
pub async fn handle_search(
    State(state): State<AppState>,
    params: Result<Query<SearchParams>, QueryRejection>,
) -> Result<Json<SearchResponse>, AppError> {
    let Query(params) = params.map_err(|e| AppError::Validation(e.body_text()))?;
    if params.query.trim().is_empty() {
        return Err(AppError::Validation("query cannot be empty".to_string()));
    }
    let min_rating = params.min_rating.map(rating_filter).transpose()?;

    let hits = state
        .feedback
        .retrieval
        .search(&params.query, params.n_results, min_rating)
        .await?;
    Ok(Json(SearchResponse {
        results: hits.into_iter().map(SearchResult::from).collect(),
    }))
}

fn default_high_quality_rating() -> i64 {
    4
}

fn default_high_quality_limit() -> u32 {
    100
}

#[derive(Deserialize)]
pub struct HighQualityParams {
    #[serde(default = "default_high_quality_rating")]
    pub min_rating: i64,
    #[serde(default = "default_high_quality_limit")]
    pub limit: u32,
}

#[derive(Serialize)]
pub struct HighQualityResponse {
    pub samples: Vec<FeedbackRecord>,
    pub count: usize,
}

/// GET /api/feedback/high-quality
pub async fn handle_high_quality(
    State(state): State<AppState>,
    params: Result<Query<HighQualityParams>, QueryRejection>,
) -> Result<Json<HighQualityResponse>, AppError> {
    let Query(params) = params.map_err(|e| AppError::Validation(e.body_text()))?;
    let min_rating = rating_filter(params.min_rating)?;

    let samples = state
        .feedback
        .high_quality(min_rating, params.limit)
        .await?;
    Ok(Json(HighQualityResponse {
        count: samples.len(),
        samples,
    }))
}

/// GET /api/feedback/export-csv
///
/// Streams pages out of the metadata store instead of building the file in memory.
pub async fn handle_export_csv(State(state): State<AppState>) -> Response {
    let stream = state.feedback.export.export();
    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={EXPORT_FILENAME}"),
            ),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

/// POST /api/feedback/rebuild
pub async fn handle_rebuild(
    State(state): State<AppState>,
) -> Result<Json<RebuildReport>, AppError> {
    info!("Rebuild requested over HTTP");
    let report = state.feedback.rebuild.rebuild().await?;
    Ok(Json(report))
}

fn rating_filter(rating: i64) -> Result<u8, AppError> {
    if (MIN_RATING..=MAX_RATING).contains(&rating) {
        Ok(rating as u8)
    } else {
        Err(AppError::Validation(format!(
            "min_rating must be between {MIN_RATING} and {MAX_RATING}, got {rating}"
        )))
    }
}
