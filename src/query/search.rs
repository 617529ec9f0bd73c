//! Combined scene search.
//!
//! A search is a set of typed filter clauses combined by intersection
//! on scene id. Metadata clauses compile to SQL predicates; similarity
//! clauses run nearest-neighbour passes over the store's vectors and
//! annotate their scores. When several similarity clauses are present,
//! results order by the first-added clause's score, descending.

use rusqlite::types::Value as SqlValue;

use crate::error::IngestError;
use crate::models::clip::ClipModel;
use crate::models::sentence::SentenceModel;
use crate::pipeline::{MODEL_CLIP, MODEL_TRANSCRIPT};
use crate::store::settings::SearchThresholds;
use crate::store::Store;

use super::SceneView;

/// Handle for the face-similarity clause: a stable face id, or the
/// human-facing (scene, index-within-scene) label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaceRef {
    Id(i64),
    SceneFace { scene_id: i64, face_index: usize },
}

/// One search clause. Absent bounds in range clauses are open-ended.
#[derive(Debug, Clone)]
pub enum SearchFilter {
    VisualText { query: String, threshold: Option<f32> },
    DialogKeyword { query: String },
    DialogSemantic { query: String, threshold: Option<f32> },
    Face { face: FaceRef, threshold: Option<f32> },
    VisualMatch { scene_id: i64, threshold: Option<f32> },
    Path { substring: String },
    Codec { substring: String },
    FpsRange { min: Option<f64>, max: Option<f64> },
    DurationRange { min: Option<f64>, max: Option<f64> },
    ResolutionMin { width: Option<i64>, height: Option<i64> },
    TimecodeRange { min: Option<f64>, max: Option<f64> },
}

/// Which score annotation a similarity clause writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScoreKind {
    Visual,
    Face,
    Transcript,
}

pub(super) struct SearchContext<'a> {
    pub store: &'a Store,
    pub clip: &'a ClipModel,
    pub sentence: &'a SentenceModel,
    pub thresholds: SearchThresholds,
}

/// Run a combined search. Validation errors surface as `BadRequest`;
/// missing referenced ids as `NotFound`.
pub(super) fn run_search(
    ctx: &SearchContext,
    filters: &[SearchFilter],
    limit: usize,
) -> Result<Vec<SceneView>, IngestError> {
    validate(filters)?;

    // Base set: completed, non-deleted scenes passing every metadata
    // predicate, in browse order.
    let mut results = base_scenes(ctx.store, filters)?;
    let mut primary_score: Option<ScoreKind> = None;

    for filter in filters {
        match filter {
            SearchFilter::VisualText { query, threshold } => {
                let threshold = threshold.unwrap_or(ctx.thresholds.visual);
                let Ok(vector) = embed_visual_query(ctx, query) else {
                    // Encoder not loaded yet: degrade to no-op rather
                    // than failing the whole search.
                    tracing::warn!("Visual encoder unavailable, skipping visual clause");
                    continue;
                };
                let hits = ctx
                    .store
                    .nearest_scenes(MODEL_CLIP, &vector, threshold, None)
                    .map_err(to_transient)?;
                apply_similarity(&mut results, &hits, ScoreKind::Visual);
                primary_score.get_or_insert(ScoreKind::Visual);
            }
            SearchFilter::VisualMatch { scene_id, threshold } => {
                let threshold = threshold.unwrap_or(ctx.thresholds.visual_match);
                let reference = ctx
                    .store
                    .get_embedding(*scene_id, MODEL_CLIP)
                    .map_err(to_transient)?
                    .ok_or_else(|| {
                        IngestError::NotFound(format!("scene {scene_id} has no visual vector"))
                    })?;
                let hits = ctx
                    .store
                    .nearest_scenes(MODEL_CLIP, &reference.embedding, threshold, Some(*scene_id))
                    .map_err(to_transient)?;
                apply_similarity(&mut results, &hits, ScoreKind::Visual);
                primary_score.get_or_insert(ScoreKind::Visual);
            }
            SearchFilter::Face { face, threshold } => {
                let threshold = threshold.unwrap_or(ctx.thresholds.face);
                let vector = resolve_face(ctx.store, *face)?;
                let hits: Vec<crate::store::SceneMatch> = ctx
                    .store
                    .nearest_faces(&vector, threshold)
                    .map_err(to_transient)?
                    .into_iter()
                    .map(|(scene_id, similarity)| crate::store::SceneMatch {
                        scene_id,
                        similarity,
                    })
                    .collect();
                apply_similarity(&mut results, &hits, ScoreKind::Face);
                primary_score.get_or_insert(ScoreKind::Face);
            }
            SearchFilter::DialogKeyword { query } => {
                let needle = query.to_lowercase();
                results.retain(|scene| {
                    scene
                        .transcript
                        .as_deref()
                        .map(|t| t.to_lowercase().contains(&needle))
                        .unwrap_or(false)
                });
            }
            SearchFilter::DialogSemantic { query, threshold } => {
                let threshold = threshold.unwrap_or(ctx.thresholds.transcript);
                match embed_semantic_query(ctx, query) {
                    Ok(vector) => {
                        let hits = ctx
                            .store
                            .nearest_scenes(MODEL_TRANSCRIPT, &vector, threshold, None)
                            .map_err(to_transient)?;
                        apply_similarity(&mut results, &hits, ScoreKind::Transcript);
                        primary_score.get_or_insert(ScoreKind::Transcript);
                    }
                    Err(_) => {
                        // Sentence encoder not ready: fall back to the
                        // keyword match so the search still answers.
                        tracing::warn!(
                            "Sentence encoder unavailable, falling back to keyword match"
                        );
                        let needle = query.to_lowercase();
                        results.retain(|scene| {
                            scene
                                .transcript
                                .as_deref()
                                .map(|t| t.to_lowercase().contains(&needle))
                                .unwrap_or(false)
                        });
                    }
                }
            }
            // Metadata clauses were folded into the base query.
            _ => {}
        }
    }

    if let Some(kind) = primary_score {
        results.sort_by(|a, b| {
            let sa = score_of(a, kind);
            let sb = score_of(b, kind);
            sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
        });
    }

    results.truncate(limit);
    Ok(results)
}

fn validate(filters: &[SearchFilter]) -> Result<(), IngestError> {
    for filter in filters {
        let threshold = match filter {
            SearchFilter::VisualText { threshold, .. }
            | SearchFilter::DialogSemantic { threshold, .. }
            | SearchFilter::Face { threshold, .. }
            | SearchFilter::VisualMatch { threshold, .. } => *threshold,
            SearchFilter::FpsRange { min, max } | SearchFilter::DurationRange { min, max } => {
                if let (Some(min), Some(max)) = (min, max) {
                    if min > max {
                        return Err(IngestError::BadRequest(
                            "range minimum exceeds maximum".into(),
                        ));
                    }
                }
                None
            }
            SearchFilter::TimecodeRange { min, max } => {
                if let (Some(min), Some(max)) = (min, max) {
                    if min > max {
                        return Err(IngestError::BadRequest(
                            "timecode minimum exceeds maximum".into(),
                        ));
                    }
                }
                None
            }
            _ => None,
        };
        if let Some(t) = threshold {
            if !(0.0..=1.0).contains(&t) {
                return Err(IngestError::BadRequest(format!(
                    "similarity threshold {t} outside [0, 1]"
                )));
            }
        }
    }
    Ok(())
}

/// Compile the metadata clauses into one SQL pass over scenes + files.
fn base_scenes(store: &Store, filters: &[SearchFilter]) -> Result<Vec<SceneView>, IngestError> {
    let mut sql = String::from(
        r#"
        SELECT s.id, s.scene_index, s.start_tc, s.end_tc, s.transcript, s.poster_frame_path,
               f.id, f.filename, f.path, f.duration_seconds, f.width, f.height, f.fps,
               f.codec, f.audio_tracks, f.file_size_bytes, f.file_modified_at
        FROM scenes s
        JOIN files f ON s.file_id = f.id
        WHERE f.deleted_at IS NULL
        AND EXISTS (
            SELECT 1 FROM enrichment_queue eq
            WHERE eq.file_id = f.id AND eq.status = 'complete'
        )
        "#,
    );
    let mut params: Vec<SqlValue> = Vec::new();

    for filter in filters {
        match filter {
            SearchFilter::Path { substring } => {
                sql.push_str(" AND LOWER(f.path) LIKE ?");
                params.push(SqlValue::Text(format!("%{}%", substring.to_lowercase())));
            }
            SearchFilter::Codec { substring } => {
                sql.push_str(" AND LOWER(f.codec) LIKE ?");
                params.push(SqlValue::Text(format!("%{}%", substring.to_lowercase())));
            }
            SearchFilter::FpsRange { min, max } => {
                if let Some(min) = min {
                    sql.push_str(" AND f.fps >= ?");
                    params.push(SqlValue::Real(*min));
                }
                if let Some(max) = max {
                    sql.push_str(" AND f.fps <= ?");
                    params.push(SqlValue::Real(*max));
                }
            }
            SearchFilter::DurationRange { min, max } => {
                if let Some(min) = min {
                    sql.push_str(" AND f.duration_seconds >= ?");
                    params.push(SqlValue::Real(*min));
                }
                if let Some(max) = max {
                    sql.push_str(" AND f.duration_seconds <= ?");
                    params.push(SqlValue::Real(*max));
                }
            }
            SearchFilter::ResolutionMin { width, height } => {
                if let Some(width) = width {
                    sql.push_str(" AND f.width >= ?");
                    params.push(SqlValue::Integer(*width));
                }
                if let Some(height) = height {
                    sql.push_str(" AND f.height >= ?");
                    params.push(SqlValue::Integer(*height));
                }
            }
            SearchFilter::TimecodeRange { min, max } => {
                if let Some(min) = min {
                    sql.push_str(" AND s.start_tc >= ?");
                    params.push(SqlValue::Real(*min));
                }
                if let Some(max) = max {
                    sql.push_str(" AND s.end_tc <= ?");
                    params.push(SqlValue::Real(*max));
                }
            }
            _ => {}
        }
    }

    sql.push_str(" ORDER BY f.id, s.scene_index");

    let mut stmt = store.conn().prepare(&sql).map_err(IngestError::Store)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params), SceneView::from_row)
        .map_err(IngestError::Store)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

/// Intersect the working set with `hits` and annotate their scores.
fn apply_similarity(
    results: &mut Vec<SceneView>,
    hits: &[crate::store::SceneMatch],
    kind: ScoreKind,
) {
    let scores: std::collections::HashMap<i64, f32> = hits
        .iter()
        .map(|m| (m.scene_id, m.similarity))
        .collect();

    results.retain_mut(|scene| match scores.get(&scene.id) {
        Some(&similarity) => {
            match kind {
                ScoreKind::Visual => scene.similarity = Some(similarity),
                ScoreKind::Face => scene.face_similarity = Some(similarity),
                ScoreKind::Transcript => scene.transcript_similarity = Some(similarity),
            }
            true
        }
        None => false,
    });
}

fn score_of(scene: &SceneView, kind: ScoreKind) -> f32 {
    match kind {
        ScoreKind::Visual => scene.similarity.unwrap_or(0.0),
        ScoreKind::Face => scene.face_similarity.unwrap_or(0.0),
        ScoreKind::Transcript => scene.transcript_similarity.unwrap_or(0.0),
    }
}

fn resolve_face(store: &Store, face: FaceRef) -> Result<Vec<f32>, IngestError> {
    match face {
        FaceRef::Id(face_id) => {
            let record = store
                .get_face(face_id)
                .map_err(to_transient)?
                .ok_or_else(|| IngestError::NotFound(format!("face {face_id}")))?;
            Ok(record.embedding)
        }
        FaceRef::SceneFace { scene_id, face_index } => {
            let faces = store.faces_for_scene(scene_id).map_err(to_transient)?;
            faces
                .into_iter()
                .nth(face_index)
                .map(|f| f.embedding)
                .ok_or_else(|| {
                    IngestError::NotFound(format!("face {face_index} in scene {scene_id}"))
                })
        }
    }
}

fn embed_visual_query(ctx: &SearchContext, query: &str) -> anyhow::Result<Vec<f32>> {
    ctx.clip.embed_text(query)
}

fn embed_semantic_query(ctx: &SearchContext, query: &str) -> anyhow::Result<Vec<f32>> {
    if !ctx.sentence.is_ready() {
        anyhow::bail!("sentence encoder not loaded");
    }
    ctx.sentence.embed_text(query)
}

fn to_transient(e: anyhow::Error) -> IngestError {
    IngestError::StageTransient(e.to_string())
}
