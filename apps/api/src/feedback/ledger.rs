//! Append-only feedback ledger: the single source of truth.
//!
//! One JSON `FeedbackRecord` per line. A line's position is its `sequence_no`;
//! appends are serialized behind one async mutex, so sequence numbers are
//! gap-free and strictly increasing. A record counts as durable once its full
//! line (including the trailing newline) has been written and, unless disabled,
//! fsynced. An unterminated final line is a torn write from a crash and is
//! truncated on open.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::feedback::models::{FeedbackRecord, NewFeedback};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Ledger I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ledger encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Ledger corrupt at line {line}: {reason}")]
    Corrupt { line: u64, reason: String },

    /// A failed append could not be cut back; writing on would bury a partial line.
    #[error("Ledger refuses appends until a partial write is removed: {0}")]
    Poisoned(String),
}

struct LedgerWriter {
    file: File,
    next_sequence_no: u64,
    /// Byte length of the durable prefix; a failed append is cut back to this.
    durable_bytes: u64,
    last_submitted_at: Option<DateTime<Utc>>,
    /// Set when a failed append left bytes past `durable_bytes` that could not
    /// be truncated. Cleared once a later truncation succeeds.
    pending_truncate: bool,
}

pub struct Ledger {
    path: PathBuf,
    fsync: bool,
    writer: Mutex<LedgerWriter>,
    len: AtomicU64,
}

impl Ledger {
    /// Opens the ledger at `path`, creating it if absent, and recovers the next
    /// sequence number by scanning every line.
    pub async fn open(path: impl Into<PathBuf>, fsync: bool) -> Result<Self, LedgerError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut next_sequence_no = 0u64;
        let mut last_submitted_at = None;
        let mut durable_bytes = 0usize;
        let mut rest = &bytes[..];

        while let Some(newline) = rest.iter().position(|&b| b == b'\n') {
            let record: FeedbackRecord =
                serde_json::from_slice(&rest[..newline]).map_err(|e| LedgerError::Corrupt {
                    line: next_sequence_no,
                    reason: e.to_string(),
                })?;
            if record.sequence_no != next_sequence_no {
                return Err(LedgerError::Corrupt {
                    line: next_sequence_no,
                    reason: format!(
                        "expected sequence_no {next_sequence_no}, found {}",
                        record.sequence_no
                    ),
                });
            }
            last_submitted_at = Some(record.submitted_at);
            next_sequence_no += 1;
            durable_bytes += newline + 1;
            rest = &rest[newline + 1..];
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        if !rest.is_empty() {
            warn!(
                path = %path.display(),
                torn_bytes = rest.len(),
                "Ledger ends with a torn write, truncating"
            );
            file.set_len(durable_bytes as u64).await?;
            file.sync_all().await?;
        }

        info!(
            path = %path.display(),
            records = next_sequence_no,
            "Ledger opened"
        );

        Ok(Self {
            path,
            fsync,
            writer: Mutex::new(LedgerWriter {
                file,
                next_sequence_no,
                durable_bytes: durable_bytes as u64,
                last_submitted_at,
                pending_truncate: false,
            }),
            len: AtomicU64::new(next_sequence_no),
        })
    }

    /// Number of durable records. Never blocks on the append lock.
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends `feedback`, assigning its `sequence_no` and `submitted_at`.
    ///
    /// `submitted_at` never goes backwards within this ledger, even if the wall
    /// clock does.
    pub async fn append(&self, feedback: NewFeedback) -> Result<FeedbackRecord, LedgerError> {
        let mut writer = self.writer.lock().await;

        if writer.pending_truncate {
            let durable = writer.durable_bytes;
            writer
                .file
                .set_len(durable)
                .await
                .map_err(|e| LedgerError::Poisoned(e.to_string()))?;
            writer.pending_truncate = false;
            info!(durable_bytes = durable, "Partial ledger write removed, appends resumed");
        }

        let now = Utc::now();
        let submitted_at = match writer.last_submitted_at {
            Some(last) if last > now => last,
            _ => now,
        };
        let record = FeedbackRecord::sequenced(writer.next_sequence_no, submitted_at, feedback);

        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        if let Err(e) = self.write_line(&mut writer.file, &line).await {
            warn!(
                sequence_no = record.sequence_no,
                error = %e,
                "Ledger append failed, cutting back to durable prefix"
            );
            let durable = writer.durable_bytes;
            if let Err(trunc) = writer.file.set_len(durable).await {
                error!(error = %trunc, "Failed to truncate ledger after failed append; appends blocked");
                writer.pending_truncate = true;
            }
            return Err(e.into());
        }

        writer.next_sequence_no += 1;
        writer.durable_bytes += line.len() as u64;
        writer.last_submitted_at = Some(submitted_at);
        self.len.store(writer.next_sequence_no, Ordering::Release);

        Ok(record)
    }

    async fn write_line(&self, file: &mut File, line: &[u8]) -> std::io::Result<()> {
        file.write_all(line).await?;
        file.flush().await?;
        if self.fsync {
            file.sync_data().await?;
        }
        Ok(())
    }

    /// Reads records with `from <= sequence_no < until`, in order.
    ///
    /// Safe to call while appends are in flight: lines at or beyond `until` are
    /// never parsed.
    pub async fn replay(&self, from: u64, until: u64) -> Result<Vec<FeedbackRecord>, LedgerError> {
        let file = File::open(&self.path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut records = Vec::with_capacity(until.saturating_sub(from) as usize);
        let mut position = 0u64;

        while position < until {
            let Some(line) = lines.next_line().await? else {
                return Err(LedgerError::Corrupt {
                    line: position,
                    reason: format!("ledger ends before expected length {until}"),
                });
            };
            if position >= from {
                let record: FeedbackRecord =
                    serde_json::from_str(&line).map_err(|e| LedgerError::Corrupt {
                        line: position,
                        reason: e.to_string(),
                    })?;
                records.push(record);
            }
            position += 1;
        }

        Ok(records)
    }

    /// Blocks all appends until the returned guard is dropped.
    pub async fn freeze(&self) -> LedgerFreeze<'_> {
        LedgerFreeze {
            guard: self.writer.lock().await,
        }
    }
}

/// Holds the append lock. The ledger length cannot change while this is alive.
pub struct LedgerFreeze<'a> {
    guard: MutexGuard<'a, LedgerWriter>,
}

impl LedgerFreeze<'_> {
    pub fn len(&self) -> u64 {
        self.guard.next_sequence_no
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::feedback::test_support::new_feedback;

    #[tokio::test]
    async fn test_sequence_numbers_are_gap_free() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path().join("ledger.jsonl"), false)
            .await
            .unwrap();

        for expected in 0..5u64 {
            let record = ledger
                .append(new_feedback("int-1", "Strong Python background", 4))
                .await
                .unwrap();
            assert_eq!(record.sequence_no, expected);
        }
        assert_eq!(ledger.len(), 5);
    }

    #[tokio::test]
    async fn test_concurrent_appends_unique_and_increasing() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(
            Ledger::open(dir.path().join("ledger.jsonl"), false)
                .await
                .unwrap(),
        );

        let mut handles = Vec::new();
        for i in 0..20 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .append(new_feedback(&format!("int-{i}"), "response", 3))
                    .await
                    .unwrap()
            }));
        }
        let mut seqs = Vec::new();
        for h in handles {
            seqs.push(h.await.unwrap().sequence_no);
        }
        seqs.sort_unstable();
        assert_eq!(seqs, (0..20).collect::<Vec<_>>());

        let replayed = ledger.replay(0, ledger.len()).await.unwrap();
        for pair in replayed.windows(2) {
            assert!(pair[0].sequence_no < pair[1].sequence_no);
            assert!(pair[0].submitted_at <= pair[1].submitted_at);
        }
    }

    #[tokio::test]
    async fn test_failed_truncation_blocks_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let ledger = Ledger::open(&path, false).await.unwrap();
        ledger.append(new_feedback("a", "one", 5)).await.unwrap();

        // A read-only handle fails both the write and the cut-back.
        ledger.writer.lock().await.file = File::open(&path).await.unwrap();
        assert!(ledger.append(new_feedback("b", "two", 4)).await.is_err());
        assert!(matches!(
            ledger.append(new_feedback("c", "three", 3)).await,
            Err(LedgerError::Poisoned(_))
        ));
        assert_eq!(ledger.len(), 1);

        ledger.writer.lock().await.file = OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .unwrap();
        let next = ledger.append(new_feedback("d", "four", 2)).await.unwrap();
        assert_eq!(next.sequence_no, 1);
        let records = ledger.replay(0, 2).await.unwrap();
        assert_eq!(records[1].interaction_id, "d");
    }

    #[tokio::test]
    async fn test_reopen_continues_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        {
            let ledger = Ledger::open(&path, true).await.unwrap();
            ledger.append(new_feedback("a", "one", 5)).await.unwrap();
            ledger.append(new_feedback("b", "two", 2)).await.unwrap();
        }
        let ledger = Ledger::open(&path, true).await.unwrap();
        assert_eq!(ledger.len(), 2);
        let third = ledger.append(new_feedback("c", "three", 1)).await.unwrap();
        assert_eq!(third.sequence_no, 2);
    }

    #[tokio::test]
    async fn test_torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        {
            let ledger = Ledger::open(&path, false).await.unwrap();
            ledger.append(new_feedback("a", "one", 5)).await.unwrap();
        }
        let mut bytes = std::fs::read(&path).unwrap();
        let intact = bytes.len();
        bytes.extend_from_slice(b"{\"sequence_no\":1,\"submitted_at\":\"20");
        std::fs::write(&path, &bytes).unwrap();

        let ledger = Ledger::open(&path, false).await.unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), intact as u64);

        let next = ledger.append(new_feedback("b", "two", 4)).await.unwrap();
        assert_eq!(next.sequence_no, 1);
        assert_eq!(ledger.replay(0, 2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_garbage_mid_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        std::fs::write(&path, b"not json\n").unwrap();

        let err = Ledger::open(&path, false).await.err().unwrap();
        assert!(matches!(err, LedgerError::Corrupt { line: 0, .. }));
    }

    #[tokio::test]
    async fn test_replay_range() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path().join("ledger.jsonl"), false)
            .await
            .unwrap();
        for i in 0..4 {
            ledger
                .append(new_feedback(&format!("int-{i}"), "r", 3))
                .await
                .unwrap();
        }
        let tail = ledger.replay(2, 4).await.unwrap();
        assert_eq!(
            tail.iter().map(|r| r.sequence_no).collect::<Vec<_>>(),
            vec![2, 3]
        );
    }
}
