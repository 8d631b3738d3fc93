//! CSV export of the metadata store.
//!
//! The stream reads a point-in-time scan page by page; ingestion keeps running
//! while it is consumed. Column order is fixed; list fields are joined with ", ".

use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, Stream};

use crate::feedback::derived::{DerivedHandle, DerivedStores};
use crate::feedback::metadata::{MetadataError, MetadataScan};
use crate::feedback::models::FeedbackRecord;

pub const CSV_COLUMNS: [&str; 13] = [
    "sequence_no",
    "interaction_id",
    "submitted_at",
    "rating",
    "query",
    "context",
    "response",
    "correct_points",
    "incorrect_points",
    "missing_points",
    "ideal_response",
    "analysis_id",
    "job_id",
];

const LIST_DELIMITER: &str = ", ";
const PAGE_SIZE: u32 = 500;

enum ExportState {
    Start(Arc<DerivedStores>),
    /// The generation is held until the last page so a rebuild cannot close it underneath.
    Rows(Arc<DerivedStores>, MetadataScan),
    Done,
}

pub struct ExportService {
    derived: Arc<DerivedHandle>,
}

impl ExportService {
    pub fn new(derived: Arc<DerivedHandle>) -> Self {
        Self { derived }
    }

    /// Header row, then one row per record in `sequence_no` order.
    pub fn export(&self) -> impl Stream<Item = Result<Bytes, MetadataError>> + Send + 'static {
        self.export_paged(PAGE_SIZE)
    }

    fn export_paged(
        &self,
        page_size: u32,
    ) -> impl Stream<Item = Result<Bytes, MetadataError>> + Send + 'static {
        let stores = self.derived.current();

        stream::unfold(ExportState::Start(stores), move |state| async move {
            match state {
                ExportState::Start(stores) => match stores.metadata.scan(page_size).await {
                    Ok(scan) => Some((Ok(header_row()), ExportState::Rows(stores, scan))),
                    Err(e) => Some((Err(e), ExportState::Done)),
                },
                ExportState::Rows(stores, mut scan) => match scan.next_page().await {
                    Ok(Some(page)) => {
                        Some((Ok(encode_rows(&page)), ExportState::Rows(stores, scan)))
                    }
                    Ok(None) => None,
                    Err(e) => Some((Err(e), ExportState::Done)),
                },
                ExportState::Done => None,
            }
        })
    }
}

fn header_row() -> Bytes {
    let mut out = String::new();
    write_row(&mut out, CSV_COLUMNS.iter().copied());
    Bytes::from(out)
}

fn encode_rows(records: &[FeedbackRecord]) -> Bytes {
    let mut out = String::new();
    for record in records {
        let sequence_no = record.sequence_no.to_string();
        let submitted_at = record.submitted_at.to_rfc3339();
        let rating = record.rating.to_string();
        let context = record.context.join(LIST_DELIMITER);
        let correct = record.correct_points.join(LIST_DELIMITER);
        let incorrect = record.incorrect_points.join(LIST_DELIMITER);
        let missing = record.missing_points.join(LIST_DELIMITER);

        let fields: [&str; 13] = [
            sequence_no.as_str(),
            &record.interaction_id,
            &submitted_at,
            &rating,
            &record.query,
            &context,
            &record.response,
            &correct,
            &incorrect,
            &missing,
            &record.ideal_response,
            record.analysis_id.as_deref().unwrap_or(""),
            record.job_id.as_deref().unwrap_or(""),
        ];
        write_row(&mut out, fields);
    }
    Bytes::from(out)
}

fn write_row<'a>(out: &mut String, fields: impl IntoIterator<Item = &'a str>) {
    for (i, field) in fields.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_field(out, field);
    }
    out.push_str("\r\n");
}

/// RFC 4180: quote when the field holds a comma, quote, CR or LF; double inner quotes.
fn write_field(out: &mut String, field: &str) {
    if field.contains([',', '"', '\r', '\n']) {
        out.push('"');
        out.push_str(&field.replace('"', "\"\""));
        out.push('"');
    } else {
        out.push_str(field);
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use super::*;
    use crate::feedback::test_support::{open_services, record, submission};

    async fn export_text(service: &ExportService) -> String {
        let chunks: Vec<Bytes> = service.export().try_collect().await.unwrap();
        chunks
            .iter()
            .map(|c| std::str::from_utf8(c).unwrap())
            .collect()
    }

    #[test]
    fn test_field_quoting() {
        let mut out = String::new();
        write_field(&mut out, "plain");
        assert_eq!(out, "plain");

        let mut out = String::new();
        write_field(&mut out, "Python, Django");
        assert_eq!(out, "\"Python, Django\"");

        let mut out = String::new();
        write_field(&mut out, "said \"expert\"\nthen left");
        assert_eq!(out, "\"said \"\"expert\"\"\nthen left\"");
    }

    #[test]
    fn test_row_layout() {
        let mut r = record(2, "int-9", "Strong Python background", 4);
        r.correct_points = vec!["Python".into(), "Django".into()];
        r.job_id = Some("job-1".into());
        let row = String::from_utf8(encode_rows(&[r]).to_vec()).unwrap();

        assert!(row.starts_with("2,int-9,"));
        assert!(row.contains(",\"Python, Django\","));
        assert!(row.ends_with(",,job-1\r\n"));
    }

    #[tokio::test]
    async fn test_empty_store_exports_header_only() {
        let dir = tempfile::tempdir().unwrap();
        let services = open_services(&dir).await;
        let csv = export_text(&services.export).await;
        assert_eq!(csv, format!("{}\r\n", CSV_COLUMNS.join(",")));
    }

    #[tokio::test]
    async fn test_rows_in_sequence_order() {
        let dir = tempfile::tempdir().unwrap();
        let services = open_services(&dir).await;
        for (id, rating) in [("a", 5), ("b", 2), ("c", 4)] {
            services
                .ingestion
                .ingest(submission(id, "Strong Python background", rating))
                .await
                .unwrap();
        }

        let csv = export_text(&services.export).await;
        let lines: Vec<&str> = csv.split_terminator("\r\n").collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[1].starts_with("0,a,"));
        assert!(lines[2].starts_with("1,b,"));
        assert!(lines[3].starts_with("2,c,"));
    }

    #[tokio::test]
    async fn test_rebuild_mid_export_keeps_stream_whole() {
        let dir = tempfile::tempdir().unwrap();
        let services = open_services(&dir).await;
        for i in 0..5 {
            services
                .ingestion
                .ingest(submission(&format!("int-{i}"), "Strong Python background", 4))
                .await
                .unwrap();
        }
        let generation = services.derived.current().generation;

        let mut stream = Box::pin(services.export.export_paged(2));
        let mut csv = String::new();
        for _ in 0..2 {
            let chunk = stream.try_next().await.unwrap().unwrap();
            csv.push_str(std::str::from_utf8(&chunk).unwrap());
        }

        services.rebuild.rebuild().await.unwrap();
        assert!(services.derived.current().generation > generation);

        let rest: Vec<Bytes> = stream.try_collect().await.unwrap();
        for chunk in &rest {
            csv.push_str(std::str::from_utf8(chunk).unwrap());
        }
        let lines: Vec<&str> = csv.split_terminator("\r\n").collect();
        assert_eq!(lines.len(), 6);
        assert!(lines[5].starts_with("4,int-4,"));
    }
}
