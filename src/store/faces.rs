//! Face rows: bounding boxes plus their embeddings.

use anyhow::Result;
use rusqlite::{params, OptionalExtension};

use super::embeddings::{bytes_to_embedding, cosine_similarity, embedding_to_bytes};
use super::Store;

/// Bounding box in source-image pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

#[derive(Debug, Clone)]
pub struct FaceRecord {
    pub id: i64,
    pub scene_id: i64,
    pub bbox: BoundingBox,
    pub embedding: Vec<f32>,
    pub cluster_id: Option<i64>,
    pub cluster_order: Option<f64>,
}

fn row_to_face(row: &rusqlite::Row) -> rusqlite::Result<FaceRecord> {
    let bytes: Vec<u8> = row.get(6)?;
    Ok(FaceRecord {
        id: row.get(0)?,
        scene_id: row.get(1)?,
        bbox: BoundingBox {
            x: row.get(2)?,
            y: row.get(3)?,
            w: row.get(4)?,
            h: row.get(5)?,
        },
        embedding: bytes_to_embedding(&bytes),
        cluster_id: row.get(7)?,
        cluster_order: row.get(8)?,
    })
}

const FACE_COLUMNS: &str =
    "id, scene_id, bbox_x, bbox_y, bbox_w, bbox_h, embedding, cluster_id, cluster_order";

impl Store {
    pub fn insert_face(
        &self,
        scene_id: i64,
        bbox: &BoundingBox,
        embedding: &[f32],
    ) -> Result<i64> {
        let bytes = embedding_to_bytes(embedding);
        self.conn.execute(
            r#"
            INSERT INTO faces (scene_id, bbox_x, bbox_y, bbox_w, bbox_h, embedding, embedding_dim)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                scene_id,
                bbox.x,
                bbox.y,
                bbox.w,
                bbox.h,
                bytes,
                embedding.len() as i64
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_face(&self, face_id: i64) -> Result<Option<FaceRecord>> {
        let sql = format!("SELECT {FACE_COLUMNS} FROM faces WHERE id = ?");
        let row = self
            .conn
            .query_row(&sql, [face_id], row_to_face)
            .optional()?;
        Ok(row)
    }

    pub fn faces_for_scene(&self, scene_id: i64) -> Result<Vec<FaceRecord>> {
        let sql = format!("SELECT {FACE_COLUMNS} FROM faces WHERE scene_id = ? ORDER BY id");
        let mut stmt = self.conn.prepare(&sql)?;
        let faces = stmt
            .query_map([scene_id], row_to_face)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(faces)
    }

    pub fn faces_for_cluster(&self, cluster_id: i64) -> Result<Vec<FaceRecord>> {
        let sql = format!(
            "SELECT {FACE_COLUMNS} FROM faces WHERE cluster_id = ? ORDER BY cluster_order"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let faces = stmt
            .query_map([cluster_id], row_to_face)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(faces)
    }

    /// Delete a scene's faces ahead of a fresh detection run.
    pub fn delete_faces_for_scene(&self, scene_id: i64) -> Result<usize> {
        let n = self
            .conn
            .execute("DELETE FROM faces WHERE scene_id = ?", [scene_id])?;
        Ok(n)
    }

    /// All face vectors, for clustering. Ordered by id so cluster runs
    /// are deterministic for a given population.
    pub fn all_face_embeddings(&self) -> Result<Vec<(i64, Vec<f32>)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, embedding FROM faces ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| {
                let bytes: Vec<u8> = row.get(1)?;
                Ok((row.get::<_, i64>(0)?, bytes_to_embedding(&bytes)))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Best face similarity per scene against `query`, keeping scenes at
    /// or above `threshold`.
    pub fn nearest_faces(
        &self,
        query: &[f32],
        threshold: f32,
    ) -> Result<Vec<(i64, f32)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT scene_id, embedding FROM faces")?;
        let rows: Vec<(i64, Vec<f32>)> = stmt
            .query_map([], |row| {
                let bytes: Vec<u8> = row.get(1)?;
                Ok((row.get::<_, i64>(0)?, bytes_to_embedding(&bytes)))
            })?
            .filter_map(|r| r.ok())
            .collect();

        let mut best: std::collections::HashMap<i64, f32> = std::collections::HashMap::new();
        for (scene_id, embedding) in rows {
            let similarity = cosine_similarity(query, &embedding);
            let entry = best.entry(scene_id).or_insert(f32::MIN);
            if similarity > *entry {
                *entry = similarity;
            }
        }

        let mut matches: Vec<(i64, f32)> = best
            .into_iter()
            .filter(|(_, sim)| *sim >= threshold)
            .collect();
        matches.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(matches)
    }

    pub fn set_face_cluster(&self, face_id: i64, cluster_id: i64, cluster_order: f64) -> Result<()> {
        self.conn.execute(
            "UPDATE faces SET cluster_id = ?, cluster_order = ? WHERE id = ?",
            params![cluster_id, cluster_order, face_id],
        )?;
        Ok(())
    }

    pub fn count_faces(&self) -> Result<i64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM faces", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn count_scenes_with_faces(&self) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(DISTINCT scene_id) FROM faces",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Scenes covered by a face run that found nothing.
    pub fn count_scenes_face_scanned_empty(&self) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM scenes s \
             WHERE s.face_scanned_at IS NOT NULL \
             AND NOT EXISTS (SELECT 1 FROM faces f WHERE f.scene_id = s.id)",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FsMeta, NewScene};

    fn store_with_scene() -> (Store, i64) {
        let mut s = Store::open_in_memory().unwrap();
        let file_id = s
            .insert_file("/media/a.mp4", "a.mp4", &FsMeta::default())
            .unwrap();
        let ids = s
            .replace_scenes(file_id, &[NewScene { start_tc: 0.0, end_tc: 5.0 }])
            .unwrap();
        (s, ids[0])
    }

    #[test]
    fn test_insert_and_fetch() {
        let (s, scene_id) = store_with_scene();
        let bbox = BoundingBox { x: 10.0, y: 20.0, w: 64.0, h: 64.0 };
        let id = s.insert_face(scene_id, &bbox, &[0.6, 0.8]).unwrap();

        let face = s.get_face(id).unwrap().unwrap();
        assert_eq!(face.scene_id, scene_id);
        assert_eq!(face.bbox, bbox);
        assert_eq!(face.embedding, vec![0.6, 0.8]);
        assert!(face.cluster_id.is_none());
    }

    #[test]
    fn test_nearest_faces_best_per_scene() {
        let (s, scene_id) = store_with_scene();
        let bbox = BoundingBox { x: 0.0, y: 0.0, w: 1.0, h: 1.0 };
        // Two faces in the same scene; only the best similarity counts.
        s.insert_face(scene_id, &bbox, &[1.0, 0.0]).unwrap();
        s.insert_face(scene_id, &bbox, &[0.0, 1.0]).unwrap();

        let hits = s.nearest_faces(&[1.0, 0.0], 0.5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, scene_id);
        assert!((hits[0].1 - 1.0).abs() < 0.0001);

        // Raise the threshold past the best match and the scene drops out.
        let none = s.nearest_faces(&[1.0, 0.0], 1.0001).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_delete_for_scene() {
        let (s, scene_id) = store_with_scene();
        let bbox = BoundingBox { x: 0.0, y: 0.0, w: 1.0, h: 1.0 };
        s.insert_face(scene_id, &bbox, &[1.0]).unwrap();
        s.insert_face(scene_id, &bbox, &[0.5]).unwrap();

        assert_eq!(s.delete_faces_for_scene(scene_id).unwrap(), 2);
        assert_eq!(s.count_faces().unwrap(), 0);
    }
}
