//! Embedding storage and similarity search.
//!
//! Vectors are little-endian f32 blobs tagged with the model that
//! produced them. Cosine search is a linear scan restricted to one
//! model name; dimensions differ between models, so the restriction is
//! what keeps the dot products well-formed.

use anyhow::Result;
use rusqlite::{params, OptionalExtension};

use super::Store;

#[derive(Debug, Clone)]
pub struct EmbeddingRecord {
    pub id: i64,
    pub scene_id: i64,
    pub model_name: String,
    pub model_version: String,
    pub dimension: i64,
    pub embedding: Vec<f32>,
}

/// A nearest-neighbour hit.
#[derive(Debug, Clone, Copy)]
pub struct SceneMatch {
    pub scene_id: i64,
    pub similarity: f32,
}

/// Per-model coverage used by the vector stats view.
#[derive(Debug, Clone)]
pub struct ModelCoverage {
    pub model_name: String,
    pub model_version: String,
    pub dimension: i64,
    pub count: i64,
    pub last_updated: Option<String>,
}

impl Store {
    /// Insert or overwrite the vector for `(scene_id, model_name)`. A
    /// newer model version replaces the older row.
    pub fn upsert_embedding(
        &self,
        scene_id: i64,
        model_name: &str,
        model_version: &str,
        embedding: &[f32],
    ) -> Result<()> {
        let bytes = embedding_to_bytes(embedding);
        self.conn.execute(
            r#"
            INSERT INTO embeddings (scene_id, model_name, model_version, dimension, embedding, created_at)
            VALUES (?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(scene_id, model_name) DO UPDATE SET
                model_version = excluded.model_version,
                dimension = excluded.dimension,
                embedding = excluded.embedding,
                created_at = CURRENT_TIMESTAMP
            "#,
            params![scene_id, model_name, model_version, embedding.len() as i64, bytes],
        )?;
        Ok(())
    }

    pub fn get_embedding(&self, scene_id: i64, model_name: &str) -> Result<Option<EmbeddingRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, scene_id, model_name, model_version, dimension, embedding \
                 FROM embeddings WHERE scene_id = ? AND model_name = ?",
                params![scene_id, model_name],
                row_to_embedding,
            )
            .optional()?;
        Ok(row)
    }

    /// Model summaries for one scene (name, version, dimension), no vectors.
    pub fn embeddings_for_scene(&self, scene_id: i64) -> Result<Vec<(String, String, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT model_name, model_version, dimension FROM embeddings \
             WHERE scene_id = ? ORDER BY model_name",
        )?;
        let rows = stmt
            .query_map([scene_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// All vectors for one model, excluding soft-deleted files. Feeds
    /// both nearest-neighbour search and clustering.
    pub fn embeddings_for_model(&self, model_name: &str) -> Result<Vec<(i64, Vec<f32>)>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT e.scene_id, e.embedding
            FROM embeddings e
            JOIN scenes s ON e.scene_id = s.id
            JOIN files f ON s.file_id = f.id
            WHERE e.model_name = ? AND f.deleted_at IS NULL
            ORDER BY e.scene_id
            "#,
        )?;
        let rows = stmt
            .query_map([model_name], |row| {
                let bytes: Vec<u8> = row.get(1)?;
                Ok((row.get::<_, i64>(0)?, bytes_to_embedding(&bytes)))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Nearest neighbours to `query` among one model's vectors, keeping
    /// hits with cosine similarity >= `threshold`, best first.
    pub fn nearest_scenes(
        &self,
        model_name: &str,
        query: &[f32],
        threshold: f32,
        exclude_scene: Option<i64>,
    ) -> Result<Vec<SceneMatch>> {
        let rows = self.embeddings_for_model(model_name)?;
        let mut matches: Vec<SceneMatch> = rows
            .iter()
            .filter(|(scene_id, _)| Some(*scene_id) != exclude_scene)
            .map(|(scene_id, embedding)| SceneMatch {
                scene_id: *scene_id,
                similarity: cosine_similarity(query, embedding),
            })
            .filter(|m| m.similarity >= threshold)
            .collect();
        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(matches)
    }

    /// Per-model row counts for the vector stats view.
    pub fn model_coverage(&self) -> Result<Vec<ModelCoverage>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT model_name, model_version, dimension, COUNT(*), MAX(created_at)
            FROM embeddings
            GROUP BY model_name, model_version, dimension
            ORDER BY model_name
            "#,
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ModelCoverage {
                    model_name: row.get(0)?,
                    model_version: row.get(1)?,
                    dimension: row.get(2)?,
                    count: row.get(3)?,
                    last_updated: row.get(4)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn count_embeddings(&self) -> Result<i64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn row_to_embedding(row: &rusqlite::Row) -> rusqlite::Result<EmbeddingRecord> {
    let bytes: Vec<u8> = row.get(5)?;
    Ok(EmbeddingRecord {
        id: row.get(0)?,
        scene_id: row.get(1)?,
        model_name: row.get(2)?,
        model_version: row.get(3)?,
        dimension: row.get(4)?,
        embedding: bytes_to_embedding(&bytes),
    })
}

/// Convert f32 slice to bytes for storage
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for &val in embedding {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

/// Convert bytes back to f32 vector
pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| {
            let arr: [u8; 4] = chunk.try_into().unwrap();
            f32::from_le_bytes(arr)
        })
        .collect()
}

/// Cosine similarity; 0.0 for mismatched or empty inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FsMeta, NewScene};

    fn store_with_scenes(n: usize) -> (Store, Vec<i64>) {
        let mut s = Store::open_in_memory().unwrap();
        let file_id = s
            .insert_file("/media/a.mp4", "a.mp4", &FsMeta::default())
            .unwrap();
        let scenes: Vec<NewScene> = (0..n)
            .map(|i| NewScene {
                start_tc: i as f64,
                end_tc: (i + 1) as f64,
            })
            .collect();
        let ids = s.replace_scenes(file_id, &scenes).unwrap();
        (s, ids)
    }

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.0001);

        let c = vec![0.0, 1.0, 0.0];
        assert!((cosine_similarity(&a, &c) - 0.0).abs() < 0.0001);

        let d = vec![-1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &d) - (-1.0)).abs() < 0.0001);
    }

    #[test]
    fn test_embedding_conversion() {
        let original = vec![1.5, -2.3, 0.0, 100.0];
        let bytes = embedding_to_bytes(&original);
        let recovered = bytes_to_embedding(&bytes);
        assert_eq!(original, recovered);
    }

    #[test]
    fn test_upsert_overwrites_same_model() {
        let (s, ids) = store_with_scenes(1);
        s.upsert_embedding(ids[0], "clip", "v1", &[1.0, 0.0]).unwrap();
        s.upsert_embedding(ids[0], "clip", "v2", &[0.0, 1.0]).unwrap();

        let record = s.get_embedding(ids[0], "clip").unwrap().unwrap();
        assert_eq!(record.model_version, "v2");
        assert_eq!(record.embedding, vec![0.0, 1.0]);
        assert_eq!(s.count_embeddings().unwrap(), 1);

        // A second model on the same scene is a separate row.
        s.upsert_embedding(ids[0], "transcript", "v1", &[0.5, 0.5, 0.5])
            .unwrap();
        assert_eq!(s.count_embeddings().unwrap(), 2);
    }

    #[test]
    fn test_nearest_is_model_partitioned() {
        let (s, ids) = store_with_scenes(2);
        s.upsert_embedding(ids[0], "clip", "v1", &[1.0, 0.0]).unwrap();
        s.upsert_embedding(ids[1], "transcript", "v1", &[1.0, 0.0, 0.0])
            .unwrap();

        let hits = s.nearest_scenes("clip", &[1.0, 0.0], 0.5, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].scene_id, ids[0]);
        assert!((hits[0].similarity - 1.0).abs() < 0.0001);
    }

    #[test]
    fn test_nearest_threshold_and_exclusion() {
        let (s, ids) = store_with_scenes(3);
        s.upsert_embedding(ids[0], "clip", "v1", &[1.0, 0.0]).unwrap();
        s.upsert_embedding(ids[1], "clip", "v1", &[0.9, 0.4358899]).unwrap();
        s.upsert_embedding(ids[2], "clip", "v1", &[0.0, 1.0]).unwrap();

        let hits = s
            .nearest_scenes("clip", &[1.0, 0.0], 0.5, Some(ids[0]))
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].scene_id, ids[1]);

        // Threshold 0 admits everything with a vector.
        let all = s.nearest_scenes("clip", &[1.0, 0.0], 0.0, None).unwrap();
        assert_eq!(all.len(), 3);
        // Sorted best-first.
        assert_eq!(all[0].scene_id, ids[0]);
    }
}
