//! File rows: insert, change detection, soft delete, listing.

use anyhow::Result;
use rusqlite::{params, OptionalExtension};

use super::{now_utc, Store};

/// A file row as read back from the store.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub id: i64,
    pub path: String,
    pub filename: String,
    pub parent_folder: Option<String>,
    pub duration_seconds: Option<f64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub fps: Option<f64>,
    pub codec: Option<String>,
    pub audio_tracks: Option<i64>,
    pub pix_fmt: Option<String>,
    pub color_space: Option<String>,
    pub color_transfer: Option<String>,
    pub color_primaries: Option<String>,
    pub file_size_bytes: Option<i64>,
    pub file_created_at: Option<String>,
    pub file_modified_at: Option<String>,
    pub tags: Vec<String>,
    pub created_at: String,
    pub indexed_at: Option<String>,
    pub deleted_at: Option<String>,
}

/// Filesystem metadata captured during scan (no decoder involved).
#[derive(Debug, Clone, Default)]
pub struct FsMeta {
    pub file_size_bytes: i64,
    pub file_created_at: Option<String>,
    pub file_modified_at: Option<String>,
    pub parent_folder: Option<String>,
}

/// Probed video metadata (ffprobe output, deferred to enrichment).
#[derive(Debug, Clone, Default)]
pub struct VideoMeta {
    pub duration_seconds: Option<f64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub fps: Option<f64>,
    pub codec: Option<String>,
    pub audio_tracks: Option<i64>,
    pub pix_fmt: Option<String>,
    pub color_space: Option<String>,
    pub color_transfer: Option<String>,
    pub color_primaries: Option<String>,
}

const FILE_COLUMNS: &str = "id, path, filename, parent_folder, duration_seconds, width, height, \
     fps, codec, audio_tracks, pix_fmt, color_space, color_transfer, color_primaries, \
     file_size_bytes, file_created_at, file_modified_at, tags, created_at, indexed_at, deleted_at";

fn row_to_file(row: &rusqlite::Row) -> rusqlite::Result<FileRecord> {
    let tags_json: Option<String> = row.get(17)?;
    let tags = tags_json
        .and_then(|json| serde_json::from_str::<Vec<String>>(&json).ok())
        .unwrap_or_default();
    Ok(FileRecord {
        id: row.get(0)?,
        path: row.get(1)?,
        filename: row.get(2)?,
        parent_folder: row.get(3)?,
        duration_seconds: row.get(4)?,
        width: row.get(5)?,
        height: row.get(6)?,
        fps: row.get(7)?,
        codec: row.get(8)?,
        audio_tracks: row.get(9)?,
        pix_fmt: row.get(10)?,
        color_space: row.get(11)?,
        color_transfer: row.get(12)?,
        color_primaries: row.get(13)?,
        file_size_bytes: row.get(14)?,
        file_created_at: row.get(15)?,
        file_modified_at: row.get(16)?,
        tags,
        created_at: row.get(18)?,
        indexed_at: row.get(19)?,
        deleted_at: row.get(20)?,
    })
}

impl Store {
    pub fn get_file(&self, file_id: i64) -> Result<Option<FileRecord>> {
        let sql = format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?");
        let row = self
            .conn
            .query_row(&sql, [file_id], row_to_file)
            .optional()?;
        Ok(row)
    }

    pub fn get_file_by_path(&self, path: &str) -> Result<Option<FileRecord>> {
        let sql = format!("SELECT {FILE_COLUMNS} FROM files WHERE path = ?");
        let row = self.conn.query_row(&sql, [path], row_to_file).optional()?;
        Ok(row)
    }

    /// Insert a new file row with filesystem metadata only; the decoder
    /// probe happens during the metadata stage.
    pub fn insert_file(&self, path: &str, filename: &str, fs: &FsMeta) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO files (path, filename, parent_folder, file_size_bytes,
                               file_created_at, file_modified_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
            params![
                path,
                filename,
                fs.parent_folder,
                fs.file_size_bytes,
                fs.file_created_at,
                fs.file_modified_at,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Refresh filesystem metadata for a modified file and clear probed
    /// video metadata + indexed_at so enrichment starts over.
    pub fn mark_file_updated(&self, file_id: i64, fs: &FsMeta) -> Result<()> {
        self.conn.execute(
            r#"
            UPDATE files SET
                file_modified_at = ?,
                file_created_at = ?,
                file_size_bytes = ?,
                parent_folder = ?,
                indexed_at = NULL,
                duration_seconds = NULL,
                width = NULL,
                height = NULL,
                fps = NULL,
                codec = NULL,
                audio_tracks = NULL,
                pix_fmt = NULL,
                color_space = NULL,
                color_transfer = NULL,
                color_primaries = NULL
            WHERE id = ?
            "#,
            params![
                fs.file_modified_at,
                fs.file_created_at,
                fs.file_size_bytes,
                fs.parent_folder,
                file_id,
            ],
        )?;
        Ok(())
    }

    /// Write probed video metadata onto an existing row.
    pub fn set_video_meta(&self, file_id: i64, meta: &VideoMeta) -> Result<()> {
        self.conn.execute(
            r#"
            UPDATE files SET
                duration_seconds = ?, width = ?, height = ?, fps = ?, codec = ?,
                audio_tracks = ?, pix_fmt = ?, color_space = ?, color_transfer = ?,
                color_primaries = ?
            WHERE id = ?
            "#,
            params![
                meta.duration_seconds,
                meta.width,
                meta.height,
                meta.fps,
                meta.codec,
                meta.audio_tracks,
                meta.pix_fmt,
                meta.color_space,
                meta.color_transfer,
                meta.color_primaries,
                file_id,
            ],
        )?;
        Ok(())
    }

    /// Clear the soft-delete marker on a file that reappeared on disk.
    pub fn resurrect_file(&self, file_id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE files SET deleted_at = NULL WHERE id = ?",
            [file_id],
        )?;
        Ok(())
    }

    pub fn set_file_indexed(&self, file_id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE files SET indexed_at = ? WHERE id = ?",
            params![now_utc(), file_id],
        )?;
        Ok(())
    }

    /// Soft-delete every non-deleted file whose path is not in `seen`,
    /// clearing its queue item. Returns the ids marked.
    pub fn mark_missing_files(
        &self,
        seen: &std::collections::HashSet<String>,
    ) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, path FROM files WHERE deleted_at IS NULL")?;
        let rows: Vec<(i64, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);

        let now = now_utc();
        let mut marked = Vec::new();
        for (file_id, path) in rows {
            if !seen.contains(&path) {
                self.conn.execute(
                    "UPDATE files SET deleted_at = ? WHERE id = ?",
                    params![now, file_id],
                )?;
                self.conn
                    .execute("DELETE FROM enrichment_queue WHERE file_id = ?", [file_id])?;
                marked.push(file_id);
            }
        }
        Ok(marked)
    }

    /// Delete a file's enrichment artifacts (scenes cascade to faces and
    /// embeddings). Used when a file changed on disk.
    pub fn clear_enrichment(&self, file_id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM scenes WHERE file_id = ?", [file_id])?;
        Ok(())
    }

    /// Paginated listing, newest indexed first.
    pub fn list_files(
        &self,
        limit: usize,
        offset: usize,
        completed_only: bool,
    ) -> Result<Vec<FileRecord>> {
        let sql = if completed_only {
            format!(
                "SELECT {FILE_COLUMNS} FROM files f \
                 WHERE f.deleted_at IS NULL \
                 AND EXISTS (SELECT 1 FROM enrichment_queue eq \
                             WHERE eq.file_id = f.id AND eq.status = 'complete') \
                 ORDER BY f.indexed_at DESC LIMIT ? OFFSET ?"
            )
        } else {
            format!(
                "SELECT {FILE_COLUMNS} FROM files \
                 WHERE deleted_at IS NULL \
                 ORDER BY indexed_at IS NULL, indexed_at DESC LIMIT ? OFFSET ?"
            )
        };
        let mut stmt = self.conn.prepare(&sql)?;
        let files = stmt
            .query_map(params![limit as i64, offset as i64], row_to_file)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(files)
    }

    pub fn count_files(&self) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM files WHERE deleted_at IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn total_duration_seconds(&self) -> Result<f64> {
        let total = self.conn.query_row(
            "SELECT COALESCE(SUM(duration_seconds), 0) FROM files WHERE deleted_at IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    pub fn total_file_size_bytes(&self) -> Result<i64> {
        let total = self.conn.query_row(
            "SELECT COALESCE(SUM(file_size_bytes), 0) FROM files WHERE deleted_at IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    pub fn set_file_tags(&self, file_id: i64, tags: &[String]) -> Result<()> {
        let json = serde_json::to_string(tags)?;
        self.conn.execute(
            "UPDATE files SET tags = ? WHERE id = ?",
            params![json, file_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    fn fs_meta(size: i64, mtime: &str) -> FsMeta {
        FsMeta {
            file_size_bytes: size,
            file_created_at: Some("2024-01-01T00:00:00Z".into()),
            file_modified_at: Some(mtime.into()),
            parent_folder: Some("clips".into()),
        }
    }

    #[test]
    fn test_insert_and_lookup() {
        let s = store();
        let id = s
            .insert_file("/media/clips/a.mp4", "a.mp4", &fs_meta(100, "2024-06-01T00:00:00Z"))
            .unwrap();

        let by_path = s.get_file_by_path("/media/clips/a.mp4").unwrap().unwrap();
        assert_eq!(by_path.id, id);
        assert_eq!(by_path.filename, "a.mp4");
        assert!(by_path.duration_seconds.is_none());
        assert!(by_path.deleted_at.is_none());
    }

    #[test]
    fn test_mark_updated_clears_probe() {
        let s = store();
        let id = s
            .insert_file("/media/clips/a.mp4", "a.mp4", &fs_meta(100, "2024-06-01T00:00:00Z"))
            .unwrap();
        s.set_video_meta(
            id,
            &VideoMeta {
                duration_seconds: Some(60.0),
                width: Some(1920),
                ..Default::default()
            },
        )
        .unwrap();
        s.set_file_indexed(id).unwrap();

        s.mark_file_updated(id, &fs_meta(200, "2024-06-02T00:00:00Z"))
            .unwrap();

        let file = s.get_file(id).unwrap().unwrap();
        assert!(file.duration_seconds.is_none());
        assert!(file.indexed_at.is_none());
        assert_eq!(file.file_size_bytes, Some(200));
    }

    #[test]
    fn test_mark_missing() {
        let s = store();
        let kept = s
            .insert_file("/media/a.mp4", "a.mp4", &fs_meta(1, "2024-06-01T00:00:00Z"))
            .unwrap();
        let gone = s
            .insert_file("/media/b.mp4", "b.mp4", &fs_meta(1, "2024-06-01T00:00:00Z"))
            .unwrap();
        s.enqueue_file(gone).unwrap();

        let mut seen = std::collections::HashSet::new();
        seen.insert("/media/a.mp4".to_string());
        let marked = s.mark_missing_files(&seen).unwrap();

        assert_eq!(marked, vec![gone]);
        assert!(s.get_file(kept).unwrap().unwrap().deleted_at.is_none());
        assert!(s.get_file(gone).unwrap().unwrap().deleted_at.is_some());
        // Soft delete clears the queue item.
        assert!(s.get_queue_item_for_file(gone).unwrap().is_none());
    }
}
