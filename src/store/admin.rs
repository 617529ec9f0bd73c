//! Destructive maintenance operations.

use anyhow::Result;

use super::Store;

/// Counts reported by a wipe.
#[derive(Debug, Clone, Copy)]
pub struct WipeCounts {
    pub files: i64,
    pub scenes: i64,
    pub faces: i64,
}

impl Store {
    /// Permanently remove soft-deleted files; scenes, faces, embeddings
    /// and queue items go with them via cascade.
    pub fn purge_deleted_files(&self) -> Result<usize> {
        let n = self
            .conn
            .execute("DELETE FROM files WHERE deleted_at IS NOT NULL", [])?;
        Ok(n)
    }

    /// Remove files whose paths fall outside every current watch root.
    pub fn purge_orphan_files(&self, watch_folders: &[String]) -> Result<usize> {
        if watch_folders.is_empty() {
            return Ok(0);
        }

        let conditions = watch_folders
            .iter()
            .map(|_| "path NOT LIKE ?")
            .collect::<Vec<_>>()
            .join(" AND ");
        let sql = format!("DELETE FROM files WHERE {conditions}");
        let params: Vec<String> = watch_folders.iter().map(|f| format!("{f}%")).collect();
        let n = self.conn.execute(
            &sql,
            rusqlite::params_from_iter(params.iter().map(|s| s.as_str())),
        )?;
        Ok(n)
    }

    /// Delete every file, scene, face, embedding and queue row. Config
    /// is preserved. Confirmation is the caller's job.
    pub fn wipe(&self) -> Result<WipeCounts> {
        let counts = WipeCounts {
            files: self
                .conn
                .query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))?,
            scenes: self.count_scenes()?,
            faces: self.count_faces()?,
        };

        self.conn.execute_batch(
            r#"
            DELETE FROM enrichment_queue;
            DELETE FROM faces;
            DELETE FROM embeddings;
            DELETE FROM scenes;
            DELETE FROM files;
            DELETE FROM sqlite_sequence
              WHERE name IN ('files', 'scenes', 'faces', 'embeddings', 'enrichment_queue');
            "#,
        )?;

        Ok(counts)
    }
}
