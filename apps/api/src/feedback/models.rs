use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Feedback as submitted by a client: un-validated and un-sequenced.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedbackSubmission {
    pub interaction_id: String,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub context: Vec<String>,
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub rating: i64,
    #[serde(default)]
    pub correct_points: Vec<String>,
    #[serde(default)]
    pub incorrect_points: Vec<String>,
    #[serde(default)]
    pub missing_points: Vec<String>,
    #[serde(default)]
    pub ideal_response: Option<String>,
    #[serde(default)]
    pub analysis_id: Option<String>,
    #[serde(default)]
    pub job_id: Option<String>,
}

/// Validated feedback waiting for the ledger to assign its position.
#[derive(Debug, Clone, PartialEq)]
pub struct NewFeedback {
    pub interaction_id: String,
    pub query: String,
    pub context: Vec<String>,
    pub response: String,
    pub rating: u8,
    pub correct_points: Vec<String>,
    pub incorrect_points: Vec<String>,
    pub missing_points: Vec<String>,
    pub ideal_response: String,
    pub analysis_id: Option<String>,
    pub job_id: Option<String>,
}

/// One immutable line of the ledger.
///
/// `sequence_no` is the only unique key. `interaction_id` is a correlation tag:
/// the same interaction may collect several records over time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub sequence_no: u64,
    pub submitted_at: DateTime<Utc>,
    pub interaction_id: String,
    pub query: String,
    pub context: Vec<String>,
    pub response: String,
    pub rating: u8,
    pub correct_points: Vec<String>,
    pub incorrect_points: Vec<String>,
    pub missing_points: Vec<String>,
    pub ideal_response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

impl FeedbackRecord {
    pub fn sequenced(sequence_no: u64, submitted_at: DateTime<Utc>, new: NewFeedback) -> Self {
        Self {
            sequence_no,
            submitted_at,
            interaction_id: new.interaction_id,
            query: new.query,
            context: new.context,
            response: new.response,
            rating: new.rating,
            correct_points: new.correct_points,
            incorrect_points: new.incorrect_points,
            missing_points: new.missing_points,
            ideal_response: new.ideal_response,
            analysis_id: new.analysis_id,
            job_id: new.job_id,
        }
    }

    /// Text handed to the embedder for this record.
    ///
    /// The ideal response is appended only when it says something the judged
    /// response does not (ignoring whitespace differences).
    pub fn embedding_text(&self) -> String {
        let mut text = format!("Query: {}\nResponse: {}", self.query, self.response);
        if collapse_whitespace(&self.ideal_response) != collapse_whitespace(&self.response) {
            text.push_str("\nIdeal response: ");
            text.push_str(&self.ideal_response);
        }
        text
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// A search result: the joined record plus how close it was to the query.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub record: FeedbackRecord,
    /// Cosine distance in [0, 2].
    pub distance: f32,
    /// `(1 - distance) * 100`, clamped to [0, 100]. Higher is more similar.
    pub similarity: f32,
}

impl SearchHit {
    pub fn new(record: FeedbackRecord, distance: f32) -> Self {
        Self {
            record,
            distance,
            similarity: similarity_from_distance(distance),
        }
    }
}

pub fn similarity_from_distance(distance: f32) -> f32 {
    ((1.0 - distance) * 100.0).clamp(0.0, 100.0)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedbackStatistics {
    /// Records visible in the metadata store.
    pub total_feedback: u64,
    pub average_rating: f64,
    pub vector_index_count: u64,
    pub metadata_count: u64,
    /// Records durable in the ledger. Exceeds `metadata_count` while indexing lags.
    pub ledger_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(response: &str, ideal: &str) -> FeedbackRecord {
        FeedbackRecord {
            sequence_no: 0,
            submitted_at: Utc::now(),
            interaction_id: "int-1".into(),
            query: "Does the candidate know Python?".into(),
            context: vec![],
            response: response.into(),
            rating: 4,
            correct_points: vec![],
            incorrect_points: vec![],
            missing_points: vec![],
            ideal_response: ideal.into(),
            analysis_id: None,
            job_id: None,
        }
    }

    #[test]
    fn test_embedding_text_skips_identical_ideal() {
        let r = record("Strong Python background", "Strong  Python\nbackground ");
        assert_eq!(
            r.embedding_text(),
            "Query: Does the candidate know Python?\nResponse: Strong Python background"
        );
    }

    #[test]
    fn test_embedding_text_includes_different_ideal() {
        let r = record("Strong Python background", "Five years of Django in production");
        assert!(r
            .embedding_text()
            .ends_with("\nIdeal response: Five years of Django in production"));
    }

    #[test]
    fn test_similarity_scale() {
        assert_eq!(similarity_from_distance(0.0), 100.0);
        assert_eq!(similarity_from_distance(1.0), 0.0);
        assert_eq!(similarity_from_distance(1.7), 0.0);
        assert!((similarity_from_distance(0.25) - 75.0).abs() < 1e-4);
    }

    #[test]
    fn test_optional_ids_omitted_from_json() {
        let json = serde_json::to_value(record("a", "a")).unwrap();
        assert!(json.get("analysis_id").is_none());
        assert!(json.get("job_id").is_none());
    }
}
