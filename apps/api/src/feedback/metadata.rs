//! SQLite-backed metadata store: full feedback records keyed by `sequence_no`.
//!
//! Serves statistics, CSV export, high-quality sample queries and the join from
//! vector-index hits back to record content. Writes are insert-if-absent so that
//! replaying a record (rebuild catch-up racing ingestion) never changes it.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use thiserror::Error;
use tracing::debug;

use crate::feedback::models::FeedbackRecord;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Feedback record {0} not found")]
    NotFound(u64),

    #[error("Metadata store error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Stored record {sequence_no} is malformed: {reason}")]
    Malformed { sequence_no: i64, reason: String },
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS feedback (
        sequence_no      INTEGER PRIMARY KEY,
        submitted_at     TEXT    NOT NULL,
        interaction_id   TEXT    NOT NULL,
        query            TEXT    NOT NULL,
        context          TEXT    NOT NULL,
        response         TEXT    NOT NULL,
        rating           INTEGER NOT NULL,
        correct_points   TEXT    NOT NULL,
        incorrect_points TEXT    NOT NULL,
        missing_points   TEXT    NOT NULL,
        ideal_response   TEXT    NOT NULL,
        analysis_id      TEXT,
        job_id           TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_feedback_rating ON feedback(rating)",
    "CREATE INDEX IF NOT EXISTS idx_feedback_interaction ON feedback(interaction_id)",
];

/// Row shape as stored; list fields are JSON arrays in TEXT columns.
#[derive(Debug, FromRow)]
struct FeedbackRow {
    sequence_no: i64,
    submitted_at: String,
    interaction_id: String,
    query: String,
    context: String,
    response: String,
    rating: i64,
    correct_points: String,
    incorrect_points: String,
    missing_points: String,
    ideal_response: String,
    analysis_id: Option<String>,
    job_id: Option<String>,
}

impl TryFrom<FeedbackRow> for FeedbackRecord {
    type Error = MetadataError;

    fn try_from(row: FeedbackRow) -> Result<Self, Self::Error> {
        let malformed = |reason: String| MetadataError::Malformed {
            sequence_no: row.sequence_no,
            reason,
        };
        let list = |column: &str, raw: &str| -> Result<Vec<String>, MetadataError> {
            serde_json::from_str(raw).map_err(|e| malformed(format!("{column}: {e}")))
        };

        Ok(FeedbackRecord {
            sequence_no: u64::try_from(row.sequence_no)
                .map_err(|_| malformed("negative sequence_no".into()))?,
            submitted_at: DateTime::parse_from_rfc3339(&row.submitted_at)
                .map_err(|e| malformed(format!("submitted_at: {e}")))?
                .with_timezone(&Utc),
            context: list("context", &row.context)?,
            correct_points: list("correct_points", &row.correct_points)?,
            incorrect_points: list("incorrect_points", &row.incorrect_points)?,
            missing_points: list("missing_points", &row.missing_points)?,
            rating: u8::try_from(row.rating)
                .map_err(|_| malformed(format!("rating {} out of range", row.rating)))?,
            interaction_id: row.interaction_id,
            query: row.query,
            response: row.response,
            ideal_response: row.ideal_response,
            analysis_id: row.analysis_id,
            job_id: row.job_id,
        })
    }
}

#[derive(Debug, Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    /// Opens the store at `path`, creating the file and schema if needed.
    pub async fn create(path: &Path) -> Result<Self, MetadataError> {
        Self::connect(path, true).await
    }

    /// Opens an existing store; a missing file is an error.
    pub async fn open_existing(path: &Path) -> Result<Self, MetadataError> {
        Self::connect(path, false).await
    }

    async fn connect(path: &Path, create: bool) -> Result<Self, MetadataError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(create)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        for statement in SCHEMA {
            sqlx::query(*statement).execute(&pool).await?;
        }

        debug!(path = %path.display(), "Metadata store opened");
        Ok(Self { pool })
    }

    /// Inserts `record` unless its `sequence_no` is already present.
    /// Returns whether a row was written.
    pub async fn put(&self, record: &FeedbackRecord) -> Result<bool, MetadataError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO feedback
                (sequence_no, submitted_at, interaction_id, query, context, response,
                 rating, correct_points, incorrect_points, missing_points,
                 ideal_response, analysis_id, job_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.sequence_no as i64)
        .bind(record.submitted_at.to_rfc3339())
        .bind(&record.interaction_id)
        .bind(&record.query)
        .bind(to_json(&record.context))
        .bind(&record.response)
        .bind(i64::from(record.rating))
        .bind(to_json(&record.correct_points))
        .bind(to_json(&record.incorrect_points))
        .bind(to_json(&record.missing_points))
        .bind(&record.ideal_response)
        .bind(&record.analysis_id)
        .bind(&record.job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn get(&self, sequence_no: u64) -> Result<FeedbackRecord, MetadataError> {
        let row: Option<FeedbackRow> =
            sqlx::query_as("SELECT * FROM feedback WHERE sequence_no = ?")
                .bind(sequence_no as i64)
                .fetch_optional(&self.pool)
                .await?;

        row.ok_or(MetadataError::NotFound(sequence_no))?
            .try_into()
    }

    pub async fn count(&self) -> Result<u64, MetadataError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM feedback")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// `(count, sum of ratings)` in one pass.
    pub async fn rating_totals(&self) -> Result<(u64, u64), MetadataError> {
        let (count, sum): (i64, i64) =
            sqlx::query_as("SELECT COUNT(*), COALESCE(SUM(rating), 0) FROM feedback")
                .fetch_one(&self.pool)
                .await?;
        Ok((count as u64, sum as u64))
    }

    pub async fn max_sequence_no(&self) -> Result<Option<u64>, MetadataError> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(sequence_no) FROM feedback")
            .fetch_one(&self.pool)
            .await?;
        Ok(max.map(|m| m as u64))
    }

    /// Records with `after < sequence_no <= until`, ascending, at most `limit`.
    pub async fn page(
        &self,
        after: Option<u64>,
        until: u64,
        limit: u32,
    ) -> Result<Vec<FeedbackRecord>, MetadataError> {
        let rows: Vec<FeedbackRow> = sqlx::query_as(
            "SELECT * FROM feedback WHERE sequence_no > ? AND sequence_no <= ? ORDER BY sequence_no LIMIT ?",
        )
        .bind(after.map_or(-1, |a| a as i64))
        .bind(until as i64)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(FeedbackRecord::try_from).collect()
    }

    /// Records rated at least `min_rating`, oldest first.
    pub async fn with_min_rating(
        &self,
        min_rating: u8,
        limit: u32,
    ) -> Result<Vec<FeedbackRecord>, MetadataError> {
        let rows: Vec<FeedbackRow> = sqlx::query_as(
            "SELECT * FROM feedback WHERE rating >= ? ORDER BY sequence_no LIMIT ?",
        )
        .bind(i64::from(min_rating))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(FeedbackRecord::try_from).collect()
    }

    /// A finite, lazily paged scan in `sequence_no` order over the records
    /// present right now. Call again to restart.
    pub async fn scan(&self, page_size: u32) -> Result<MetadataScan, MetadataError> {
        let until = self.max_sequence_no().await?;
        Ok(MetadataScan {
            store: self.clone(),
            cursor: None,
            until,
            page_size,
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Cursor over a point-in-time range of the metadata store.
pub struct MetadataScan {
    store: MetadataStore,
    cursor: Option<u64>,
    /// Highest `sequence_no` at scan start; `None` for an empty store.
    until: Option<u64>,
    page_size: u32,
}

impl MetadataScan {
    /// Next page of records, or `None` once the range is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<FeedbackRecord>>, MetadataError> {
        let Some(until) = self.until else {
            return Ok(None);
        };
        let page = self.store.page(self.cursor, until, self.page_size).await?;
        match page.last() {
            Some(last) => {
                self.cursor = Some(last.sequence_no);
                Ok(Some(page))
            }
            None => {
                self.until = None;
                Ok(None)
            }
        }
    }

    /// Drains the scan into one vector.
    pub async fn collect_all(mut self) -> Result<Vec<FeedbackRecord>, MetadataError> {
        let mut all = Vec::new();
        while let Some(page) = self.next_page().await? {
            all.extend(page);
        }
        Ok(all)
    }
}

fn to_json(list: &[String]) -> String {
    serde_json::to_string(list).unwrap_or_else(|_| "[]".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedback::test_support::record;

    async fn store(dir: &tempfile::TempDir) -> MetadataStore {
        MetadataStore::create(&dir.path().join("metadata.db"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let mut original = record(0, "int-1", "Strong Python background", 5);
        original.context = vec!["resume.pdf p1".into(), "job: backend".into()];
        original.correct_points = vec!["Python".into()];
        original.missing_points = vec!["Kubernetes, Helm".into()];
        original.analysis_id = Some("an-42".into());

        assert!(store.put(&original).await.unwrap());
        assert_eq!(store.get(0).await.unwrap(), original);
    }

    #[tokio::test]
    async fn test_put_is_insert_if_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let first = record(3, "int-1", "first", 5);
        let mut second = first.clone();
        second.response = "second".into();

        assert!(store.put(&first).await.unwrap());
        assert!(!store.put(&second).await.unwrap());
        assert_eq!(store.get(3).await.unwrap().response, "first");
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        assert!(matches!(
            store.get(9).await.unwrap_err(),
            MetadataError::NotFound(9)
        ));
    }

    #[tokio::test]
    async fn test_scan_pages_in_order_and_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        for seq in [4, 0, 2, 1, 3] {
            store.put(&record(seq, "i", "r", 3)).await.unwrap();
        }

        let mut scan = store.scan(2).await.unwrap();
        let mut sizes = Vec::new();
        let mut seqs = Vec::new();
        while let Some(page) = scan.next_page().await.unwrap() {
            sizes.push(page.len());
            seqs.extend(page.iter().map(|r| r.sequence_no));
        }
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
        assert!(scan.next_page().await.unwrap().is_none());

        let again = store.scan(10).await.unwrap().collect_all().await.unwrap();
        assert_eq!(again.len(), 5);
    }

    #[tokio::test]
    async fn test_scan_is_point_in_time() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        store.put(&record(0, "i", "r", 3)).await.unwrap();

        let scan = store.scan(10).await.unwrap();
        store.put(&record(1, "i", "late", 3)).await.unwrap();

        assert_eq!(scan.collect_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_scan_finishes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let mut scan = store.scan(10).await.unwrap();
        assert!(scan.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_min_rating_filter() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        for (seq, rating) in [(0, 5), (1, 2), (2, 4), (3, 3)] {
            store.put(&record(seq, "i", "r", rating)).await.unwrap();
        }
        let high = store.with_min_rating(4, 100).await.unwrap();
        assert_eq!(
            high.iter().map(|r| r.sequence_no).collect::<Vec<_>>(),
            vec![0, 2]
        );
        assert_eq!(store.rating_totals().await.unwrap(), (4, 14));
    }

    #[tokio::test]
    async fn test_open_existing_requires_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(MetadataStore::open_existing(&dir.path().join("absent.db"))
            .await
            .is_err());
    }
}
