//! The enrichment queue.
//!
//! Durable FIFO by `queued_at` (ties broken by id) with states
//! pending -> processing -> complete | failed. Claiming flips exactly
//! one pending row to processing inside a single guarded UPDATE, so two
//! workers can never claim the same job.

use anyhow::Result;
use rusqlite::{params, OptionalExtension};

use super::{now_utc, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Pending,
    Processing,
    Complete,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Complete => "complete",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(QueueStatus::Pending),
            "processing" => Some(QueueStatus::Processing),
            "complete" => Some(QueueStatus::Complete),
            "failed" => Some(QueueStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: i64,
    pub file_id: i64,
    pub status: QueueStatus,
    pub queued_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub error: Option<String>,
    pub retry_count: i64,
    pub current_stage: Option<String>,
    pub current_stage_num: Option<i64>,
    pub total_stages: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueCounts {
    pub pending: i64,
    pub processing: i64,
    pub complete: i64,
    pub failed: i64,
}

const QUEUE_COLUMNS: &str = "id, file_id, status, queued_at, started_at, completed_at, error, \
     retry_count, current_stage, current_stage_num, total_stages";

fn row_to_item(row: &rusqlite::Row) -> rusqlite::Result<QueueItem> {
    let status_str: String = row.get(2)?;
    Ok(QueueItem {
        id: row.get(0)?,
        file_id: row.get(1)?,
        status: QueueStatus::from_str(&status_str).unwrap_or(QueueStatus::Pending),
        queued_at: row.get(3)?,
        started_at: row.get(4)?,
        completed_at: row.get(5)?,
        error: row.get(6)?,
        retry_count: row.get(7)?,
        current_stage: row.get(8)?,
        current_stage_num: row.get(9)?,
        total_stages: row.get(10)?,
    })
}

impl Store {
    /// Queue a file for enrichment. Any previous job for the file is
    /// replaced so a modified file starts with fresh stage fields.
    pub fn enqueue_file(&self, file_id: i64) -> Result<i64> {
        self.conn
            .execute("DELETE FROM enrichment_queue WHERE file_id = ?", [file_id])?;
        self.conn.execute(
            "INSERT INTO enrichment_queue (file_id, status, queued_at) VALUES (?, 'pending', ?)",
            params![file_id, now_utc()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Atomically claim the oldest pending job, flipping it to
    /// processing. Returns None when nothing is pending.
    pub fn claim_next_job(&self, total_stages: i64) -> Result<Option<QueueItem>> {
        let sql = format!(
            r#"
            UPDATE enrichment_queue
            SET status = 'processing', started_at = ?, error = NULL,
                current_stage = 'starting', current_stage_num = 0, total_stages = ?
            WHERE id = (
                SELECT id FROM enrichment_queue
                WHERE status = 'pending'
                ORDER BY queued_at, id
                LIMIT 1
            ) AND status = 'pending'
            RETURNING {QUEUE_COLUMNS}
            "#
        );
        let item = self
            .conn
            .query_row(&sql, params![now_utc(), total_stages], row_to_item)
            .optional()?;
        Ok(item)
    }

    pub fn set_job_stage(&self, job_id: i64, stage: &str, stage_num: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE enrichment_queue SET current_stage = ?, current_stage_num = ? \
             WHERE id = ? AND status = 'processing'",
            params![stage, stage_num, job_id],
        )?;
        Ok(())
    }

    pub fn complete_job(&self, job_id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE enrichment_queue SET status = 'complete', completed_at = ? WHERE id = ?",
            params![now_utc(), job_id],
        )?;
        Ok(())
    }

    pub fn fail_job(&self, job_id: i64, error: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE enrichment_queue \
             SET status = 'failed', error = ?, retry_count = retry_count + 1, completed_at = ? \
             WHERE id = ?",
            params![error, now_utc(), job_id],
        )?;
        Ok(())
    }

    /// Put a claimed job back to pending without recording a failure.
    /// Used when a model host could not load.
    pub fn release_job(&self, job_id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE enrichment_queue SET status = 'pending', started_at = NULL WHERE id = ?",
            [job_id],
        )?;
        Ok(())
    }

    pub fn reset_failed_jobs(&self) -> Result<usize> {
        let n = self.conn.execute(
            "UPDATE enrichment_queue SET status = 'pending', error = NULL WHERE status = 'failed'",
            [],
        )?;
        Ok(n)
    }

    /// Recover every processing row back to pending. Run at startup to
    /// reclaim jobs orphaned by a crash, and by the admin action.
    pub fn reset_processing_jobs(&self) -> Result<usize> {
        let n = self.conn.execute(
            "UPDATE enrichment_queue SET status = 'pending', started_at = NULL \
             WHERE status = 'processing'",
            [],
        )?;
        Ok(n)
    }

    /// Recover processing rows older than `timeout_minutes`.
    pub fn reset_stuck_jobs(&self, timeout_minutes: i64) -> Result<usize> {
        let cutoff =
            (chrono::Utc::now() - chrono::Duration::minutes(timeout_minutes)).to_rfc3339();
        let n = self.conn.execute(
            "UPDATE enrichment_queue SET status = 'pending', started_at = NULL \
             WHERE status = 'processing' AND started_at < ?",
            [cutoff],
        )?;
        Ok(n)
    }

    pub fn queue_counts(&self) -> Result<QueueCounts> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM enrichment_queue GROUP BY status")?;
        let rows: Vec<(String, i64)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .filter_map(|r| r.ok())
            .collect();

        let mut counts = QueueCounts::default();
        for (status, count) in rows {
            match status.as_str() {
                "pending" => counts.pending = count,
                "processing" => counts.processing = count,
                "complete" => counts.complete = count,
                "failed" => counts.failed = count,
                _ => {}
            }
        }
        Ok(counts)
    }

    /// The in-flight job, if any (single-claim pipeline keeps this to
    /// at most one row).
    pub fn current_job(&self) -> Result<Option<QueueItem>> {
        let sql = format!(
            "SELECT {QUEUE_COLUMNS} FROM enrichment_queue \
             WHERE status = 'processing' ORDER BY started_at DESC LIMIT 1"
        );
        let item = self.conn.query_row(&sql, [], row_to_item).optional()?;
        Ok(item)
    }

    pub fn get_queue_item_for_file(&self, file_id: i64) -> Result<Option<QueueItem>> {
        let sql = format!("SELECT {QUEUE_COLUMNS} FROM enrichment_queue WHERE file_id = ?");
        let item = self
            .conn
            .query_row(&sql, [file_id], row_to_item)
            .optional()?;
        Ok(item)
    }

    pub fn count_pending_jobs(&self) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM enrichment_queue WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FsMeta;

    fn store_with_files(n: usize) -> (Store, Vec<i64>) {
        let s = Store::open_in_memory().unwrap();
        let ids = (0..n)
            .map(|i| {
                s.insert_file(&format!("/media/{i}.mp4"), &format!("{i}.mp4"), &FsMeta::default())
                    .unwrap()
            })
            .collect();
        (s, ids)
    }

    #[test]
    fn test_claim_is_fifo() {
        let (s, files) = store_with_files(3);
        // Distinct queued_at values so ordering is unambiguous.
        for (i, file_id) in files.iter().enumerate() {
            s.conn
                .execute(
                    "INSERT INTO enrichment_queue (file_id, status, queued_at) \
                     VALUES (?, 'pending', ?)",
                    params![file_id, format!("2024-06-01T00:00:0{i}Z")],
                )
                .unwrap();
        }

        let first = s.claim_next_job(5).unwrap().unwrap();
        assert_eq!(first.file_id, files[0]);
        assert_eq!(first.status, QueueStatus::Processing);
        assert_eq!(first.total_stages, Some(5));

        // The claimed row is no longer claimable; next claim gets #2.
        let second = s.claim_next_job(5).unwrap().unwrap();
        assert_eq!(second.file_id, files[1]);
    }

    #[test]
    fn test_claim_empty_queue() {
        let (s, _) = store_with_files(1);
        assert!(s.claim_next_job(5).unwrap().is_none());
    }

    #[test]
    fn test_fail_and_reset() {
        let (s, files) = store_with_files(1);
        s.enqueue_file(files[0]).unwrap();

        let job = s.claim_next_job(3).unwrap().unwrap();
        s.fail_job(job.id, "decoder exploded").unwrap();

        let item = s.get_queue_item_for_file(files[0]).unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Failed);
        assert_eq!(item.retry_count, 1);
        assert_eq!(item.error.as_deref(), Some("decoder exploded"));

        assert_eq!(s.reset_failed_jobs().unwrap(), 1);
        let item = s.get_queue_item_for_file(files[0]).unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Pending);
        assert!(item.error.is_none());
        // Retry count survives the reset.
        assert_eq!(item.retry_count, 1);
    }

    #[test]
    fn test_reset_processing_leaves_none_in_flight() {
        let (s, files) = store_with_files(2);
        s.enqueue_file(files[0]).unwrap();
        s.enqueue_file(files[1]).unwrap();
        s.claim_next_job(3).unwrap().unwrap();

        assert_eq!(s.reset_processing_jobs().unwrap(), 1);
        assert_eq!(s.queue_counts().unwrap().processing, 0);
        assert_eq!(s.queue_counts().unwrap().pending, 2);
    }

    #[test]
    fn test_release_keeps_retry_count() {
        let (s, files) = store_with_files(1);
        s.enqueue_file(files[0]).unwrap();
        let job = s.claim_next_job(3).unwrap().unwrap();

        s.release_job(job.id).unwrap();
        let item = s.get_queue_item_for_file(files[0]).unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Pending);
        assert_eq!(item.retry_count, 0);
        assert!(item.started_at.is_none());
    }

    #[test]
    fn test_stage_updates_and_snapshot() {
        let (s, files) = store_with_files(1);
        s.enqueue_file(files[0]).unwrap();
        let job = s.claim_next_job(6).unwrap().unwrap();

        s.set_job_stage(job.id, "scene_detection", 2).unwrap();
        let current = s.current_job().unwrap().unwrap();
        assert_eq!(current.current_stage.as_deref(), Some("scene_detection"));
        assert_eq!(current.current_stage_num, Some(2));
        assert_eq!(current.total_stages, Some(6));

        s.complete_job(job.id).unwrap();
        assert!(s.current_job().unwrap().is_none());
        let counts = s.queue_counts().unwrap();
        assert_eq!(counts.complete, 1);
    }

    #[test]
    fn test_enqueue_replaces_old_job() {
        let (s, files) = store_with_files(1);
        s.enqueue_file(files[0]).unwrap();
        let job = s.claim_next_job(3).unwrap().unwrap();
        s.complete_job(job.id).unwrap();

        s.enqueue_file(files[0]).unwrap();
        let item = s.get_queue_item_for_file(files[0]).unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Pending);
        assert!(item.completed_at.is_none());
    }
}
