//! Scene rows: bulk insert per file, listing, cluster assignment.

use anyhow::Result;
use rusqlite::{params, OptionalExtension};

use super::{now_utc, Store};

#[derive(Debug, Clone)]
pub struct SceneRecord {
    pub id: i64,
    pub file_id: i64,
    pub scene_index: i64,
    pub start_tc: f64,
    pub end_tc: f64,
    pub poster_frame_path: Option<String>,
    pub transcript: Option<String>,
    pub face_scanned_at: Option<String>,
    pub clip_cluster_id: Option<i64>,
    pub clip_cluster_order: Option<f64>,
}

/// A scene interval as produced by the detector, before it has a row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NewScene {
    pub start_tc: f64,
    pub end_tc: f64,
}

fn row_to_scene(row: &rusqlite::Row) -> rusqlite::Result<SceneRecord> {
    Ok(SceneRecord {
        id: row.get(0)?,
        file_id: row.get(1)?,
        scene_index: row.get(2)?,
        start_tc: row.get(3)?,
        end_tc: row.get(4)?,
        poster_frame_path: row.get(5)?,
        transcript: row.get(6)?,
        face_scanned_at: row.get(7)?,
        clip_cluster_id: row.get(8)?,
        clip_cluster_order: row.get(9)?,
    })
}

const SCENE_COLUMNS: &str = "id, file_id, scene_index, start_tc, end_tc, poster_frame_path, \
     transcript, face_scanned_at, clip_cluster_id, clip_cluster_order";

impl Store {
    /// Replace a file's scenes with `scenes`, in time order, assigning
    /// dense 0-based indexes. One transaction; scene detection is the
    /// only writer of scene rows.
    pub fn replace_scenes(&mut self, file_id: i64, scenes: &[NewScene]) -> Result<Vec<i64>> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM scenes WHERE file_id = ?", [file_id])?;

        let mut ids = Vec::with_capacity(scenes.len());
        {
            let mut stmt = tx.prepare(
                "INSERT INTO scenes (file_id, scene_index, start_tc, end_tc) VALUES (?, ?, ?, ?)",
            )?;
            for (i, scene) in scenes.iter().enumerate() {
                stmt.execute(params![file_id, i as i64, scene.start_tc, scene.end_tc])?;
                ids.push(tx.last_insert_rowid());
            }
        }
        tx.commit()?;
        Ok(ids)
    }

    pub fn get_scene(&self, scene_id: i64) -> Result<Option<SceneRecord>> {
        let sql = format!("SELECT {SCENE_COLUMNS} FROM scenes WHERE id = ?");
        let row = self
            .conn
            .query_row(&sql, [scene_id], row_to_scene)
            .optional()?;
        Ok(row)
    }

    pub fn get_scene_by_index(&self, file_id: i64, scene_index: i64) -> Result<Option<SceneRecord>> {
        let sql =
            format!("SELECT {SCENE_COLUMNS} FROM scenes WHERE file_id = ? AND scene_index = ?");
        let row = self
            .conn
            .query_row(&sql, params![file_id, scene_index], row_to_scene)
            .optional()?;
        Ok(row)
    }

    /// Scenes of a file in time order.
    pub fn scenes_for_file(&self, file_id: i64) -> Result<Vec<SceneRecord>> {
        let sql =
            format!("SELECT {SCENE_COLUMNS} FROM scenes WHERE file_id = ? ORDER BY scene_index");
        let mut stmt = self.conn.prepare(&sql)?;
        let scenes = stmt
            .query_map([file_id], row_to_scene)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(scenes)
    }

    pub fn count_scenes_for_file(&self, file_id: i64) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM scenes WHERE file_id = ?",
            [file_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn count_scenes(&self) -> Result<i64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM scenes", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn set_scene_poster(&self, scene_id: i64, poster_path: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE scenes SET poster_frame_path = ? WHERE id = ?",
            params![poster_path, scene_id],
        )?;
        Ok(())
    }

    pub fn set_scene_transcript(&self, scene_id: i64, transcript: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE scenes SET transcript = ? WHERE id = ?",
            params![transcript, scene_id],
        )?;
        Ok(())
    }

    /// Stamp the scene as covered by a face-detection run.
    pub fn mark_scene_face_scanned(&self, scene_id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE scenes SET face_scanned_at = ? WHERE id = ?",
            params![now_utc(), scene_id],
        )?;
        Ok(())
    }

    pub fn set_scene_cluster(
        &self,
        scene_id: i64,
        cluster_id: i64,
        cluster_order: f64,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE scenes SET clip_cluster_id = ?, clip_cluster_order = ? WHERE id = ?",
            params![cluster_id, cluster_order, scene_id],
        )?;
        Ok(())
    }

    /// Scenes of non-deleted files that still need work in a stage,
    /// keyed by which artifact is absent.
    pub fn scenes_without_poster(&self, file_id: i64) -> Result<Vec<SceneRecord>> {
        let sql = format!(
            "SELECT {SCENE_COLUMNS} FROM scenes \
             WHERE file_id = ? AND poster_frame_path IS NULL ORDER BY scene_index"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let scenes = stmt
            .query_map([file_id], row_to_scene)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(scenes)
    }

    pub fn scenes_without_transcript(&self, file_id: i64) -> Result<Vec<SceneRecord>> {
        let sql = format!(
            "SELECT {SCENE_COLUMNS} FROM scenes \
             WHERE file_id = ? AND transcript IS NULL ORDER BY scene_index"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let scenes = stmt
            .query_map([file_id], row_to_scene)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(scenes)
    }

    pub fn scenes_without_face_scan(&self, file_id: i64) -> Result<Vec<SceneRecord>> {
        let sql = format!(
            "SELECT {SCENE_COLUMNS} FROM scenes \
             WHERE file_id = ? AND face_scanned_at IS NULL ORDER BY scene_index"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let scenes = stmt
            .query_map([file_id], row_to_scene)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(scenes)
    }

    /// Count of scenes whose file finished enrichment ("scanned" in
    /// vector-coverage terms).
    pub fn count_scenes_indexed(&self) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM scenes s JOIN files f ON s.file_id = f.id \
             WHERE f.indexed_at IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Scenes transcribed but with no speech (empty transcript).
    pub fn count_scenes_empty_transcript(&self) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM scenes WHERE transcript = ''",
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

    fn store_with_file() -> (Store, i64) {
        let s = Store::open_in_memory().unwrap();
        let id = s
            .insert_file("/media/a.mp4", "a.mp4", &FsMeta::default())
            .unwrap();
        (s, id)
    }

    #[test]
    fn test_replace_scenes_assigns_dense_indexes() {
        let (mut s, file_id) = store_with_file();
        let ids = s
            .replace_scenes(
                file_id,
                &[
                    NewScene { start_tc: 0.0, end_tc: 10.0 },
                    NewScene { start_tc: 10.0, end_tc: 25.5 },
                ],
            )
            .unwrap();
        assert_eq!(ids.len(), 2);

        let scenes = s.scenes_for_file(file_id).unwrap();
        assert_eq!(scenes.len(), 2);
        assert_eq!(scenes[0].scene_index, 0);
        assert_eq!(scenes[1].scene_index, 1);
        assert_eq!(scenes[1].start_tc, 10.0);

        // Replacing drops the old rows.
        let ids2 = s
            .replace_scenes(file_id, &[NewScene { start_tc: 0.0, end_tc: 25.5 }])
            .unwrap();
        assert_eq!(ids2.len(), 1);
        assert_eq!(s.count_scenes_for_file(file_id).unwrap(), 1);
    }

    #[test]
    fn test_cascade_delete_from_file() {
        let (mut s, file_id) = store_with_file();
        s.replace_scenes(file_id, &[NewScene { start_tc: 0.0, end_tc: 5.0 }])
            .unwrap();
        s.conn
            .execute("DELETE FROM files WHERE id = ?", [file_id])
            .unwrap();
        assert_eq!(s.count_scenes().unwrap(), 0);
    }

    #[test]
    fn test_stage_resume_queries() {
        let (mut s, file_id) = store_with_file();
        let ids = s
            .replace_scenes(
                file_id,
                &[
                    NewScene { start_tc: 0.0, end_tc: 5.0 },
                    NewScene { start_tc: 5.0, end_tc: 9.0 },
                ],
            )
            .unwrap();

        s.set_scene_poster(ids[0], "/posters/scene_1.webp").unwrap();
        assert_eq!(s.scenes_without_poster(file_id).unwrap().len(), 1);

        s.set_scene_transcript(ids[0], "hello").unwrap();
        s.set_scene_transcript(ids[1], "").unwrap();
        assert!(s.scenes_without_transcript(file_id).unwrap().is_empty());
        assert_eq!(s.count_scenes_empty_transcript().unwrap(), 1);

        s.mark_scene_face_scanned(ids[0]).unwrap();
        let pending = s.scenes_without_face_scan(file_id).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, ids[1]);
    }
}
