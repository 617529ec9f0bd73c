//! The read surface consumed by the API server.
//!
//! `QueryService` wraps a store handle plus the query-side model hosts
//! (its own visual and sentence encoders, independent of the ingest
//! process's copies). Responses are plain serializable records named
//! after the entity attributes.

pub mod edl;
pub mod search;

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::error::IngestError;
use crate::models::clip::ClipModel;
use crate::models::sentence::SentenceModel;
use crate::models::Readiness;
use crate::scanner::progress::{self, ScanProgress};
use crate::store::{QueueCounts, Store};

pub use edl::EdlClip;
pub use search::{FaceRef, SearchFilter};

/// A face shown on a scene card: id plus bbox `[x, y, w, h]`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FaceBox {
    pub id: i64,
    pub bbox: [f64; 4],
}

/// One scene as rendered in browse/search results.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SceneView {
    pub id: i64,
    pub scene_index: i64,
    pub start_time: f64,
    pub end_time: f64,
    pub transcript: Option<String>,
    pub poster_frame_path: Option<String>,
    pub file_id: i64,
    pub filename: String,
    pub path: String,
    pub duration_seconds: Option<f64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub fps: Option<f64>,
    pub codec: Option<String>,
    pub audio_tracks: Option<i64>,
    pub file_size_bytes: Option<i64>,
    pub file_modified_at: Option<String>,
    pub faces: Vec<FaceBox>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub face_similarity: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript_similarity: Option<f32>,
}

impl SceneView {
    pub(crate) fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(SceneView {
            id: row.get(0)?,
            scene_index: row.get(1)?,
            start_time: row.get(2)?,
            end_time: row.get(3)?,
            transcript: row.get(4)?,
            poster_frame_path: row.get(5)?,
            file_id: row.get(6)?,
            filename: row.get(7)?,
            path: row.get(8)?,
            duration_seconds: row.get(9)?,
            width: row.get(10)?,
            height: row.get(11)?,
            fps: row.get(12)?,
            codec: row.get(13)?,
            audio_tracks: row.get(14)?,
            file_size_bytes: row.get(15)?,
            file_modified_at: row.get(16)?,
            faces: Vec::new(),
            similarity: None,
            face_similarity: None,
            transcript_similarity: None,
        })
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SceneList {
    pub scenes: Vec<SceneView>,
    pub total: i64,
}

/// Per-model presence summary on a scene detail view.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VectorSummary {
    pub model: String,
    pub version: String,
    pub dimension: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<i64>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SceneDetail {
    #[serde(flatten)]
    pub scene: SceneView,
    pub vectors: Vec<VectorSummary>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct FaceListItem {
    pub id: i64,
    pub scene_id: i64,
    pub scene_index: i64,
    pub filename: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct FaceDetail {
    pub id: i64,
    pub scene_id: i64,
    pub scene_index: i64,
    pub bbox: [f64; 4],
    pub poster_path: Option<String>,
    pub start_tc: f64,
    pub end_tc: f64,
    pub file_id: i64,
    pub filename: String,
    pub path: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Stats {
    pub files: i64,
    pub scenes: i64,
    pub faces: i64,
    pub total_duration: f64,
    pub total_file_size_bytes: i64,
    pub last_scan_at: Option<String>,
    pub last_scan_duration_ms: Option<u64>,
    pub indexer_state: String,
    pub poll_interval_seconds: u64,
}

/// One model's coverage in the vector stats view. `found` counts scenes
/// carrying the artifact; `empty` counts scenes scanned that produced
/// none (silent scenes, posters without faces).
#[derive(Debug, Clone, serde::Serialize)]
pub struct ModelStats {
    pub name: String,
    pub model: String,
    pub version: String,
    pub dimension: i64,
    pub scanned: i64,
    pub found: i64,
    pub coverage: f64,
    pub partial_expected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub empty: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_detected: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct VectorStats {
    pub total_scenes: i64,
    pub models: Vec<ModelStats>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueCurrent {
    pub id: i64,
    pub current_stage: Option<String>,
    pub current_stage_num: Option<i64>,
    pub total_stages: Option<i64>,
    pub started_at: Option<String>,
    pub filename: String,
    pub path: String,
    pub duration_seconds: Option<f64>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueSnapshot {
    pub pending: i64,
    pub processing: i64,
    pub complete: i64,
    pub failed: i64,
    pub current: Option<QueueCurrent>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct WatchFolderStatus {
    pub path: String,
    pub accessible: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ReadyStatus {
    pub models_ready: bool,
    pub clip_loaded: bool,
    pub sentence_loaded: bool,
    pub indexer_state: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AdminStatus {
    pub demo_mode: bool,
    pub admin_enabled: bool,
}

pub struct QueryService {
    store: Store,
    clip: ClipModel,
    sentence: SentenceModel,
    /// Pass-through admin gate: when set, mutating admin actions refuse.
    demo_mode: bool,
}

impl QueryService {
    pub fn open(db_path: &Path) -> Result<Self> {
        let store = Store::open(db_path)?;
        store.initialize()?;
        Ok(Self {
            store,
            clip: ClipModel::new(),
            sentence: SentenceModel::new(),
            demo_mode: false,
        })
    }

    pub fn with_demo_mode(mut self, demo_mode: bool) -> Self {
        self.demo_mode = demo_mode;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Load the query-side encoders up front. Errors are logged, not
    /// fatal: searches degrade until the hosts come up.
    pub fn preload_models(&self) {
        if let Err(e) = self.clip.load() {
            tracing::warn!(error = %e, "Could not load visual encoder");
        }
        if let Err(e) = self.sentence.load() {
            tracing::warn!(error = %e, "Could not load sentence encoder");
        }
    }

    // ---- status ----

    pub fn ready(&self) -> Result<ReadyStatus> {
        let readiness = Readiness::current();
        Ok(ReadyStatus {
            models_ready: readiness.models_ready(),
            clip_loaded: readiness.clip_loaded,
            sentence_loaded: readiness.sentence_loaded,
            indexer_state: self.store.indexer_state()?,
        })
    }

    pub fn admin_status(&self) -> AdminStatus {
        AdminStatus {
            demo_mode: self.demo_mode,
            admin_enabled: !self.demo_mode,
        }
    }

    // ---- scenes ----

    /// Paginated browse over scenes of completed files, ordered by file
    /// id then scene index.
    pub fn browse_scenes(&self, limit: usize, offset: usize) -> Result<SceneList> {
        let mut stmt = self.store.conn().prepare(
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
            ORDER BY f.id, s.scene_index
            LIMIT ? OFFSET ?
            "#,
        )?;
        let mut scenes: Vec<SceneView> = stmt
            .query_map(
                rusqlite::params![limit as i64, offset as i64],
                SceneView::from_row,
            )?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);

        for scene in &mut scenes {
            scene.faces = self.face_boxes(scene.id)?;
        }

        let total: i64 = self.store.conn().query_row(
            r#"
            SELECT COUNT(*) FROM scenes s
            JOIN files f ON s.file_id = f.id
            WHERE f.deleted_at IS NULL
            AND EXISTS (
                SELECT 1 FROM enrichment_queue eq
                WHERE eq.file_id = f.id AND eq.status = 'complete'
            )
            "#,
            [],
            |row| row.get(0),
        )?;

        Ok(SceneList { scenes, total })
    }

    /// Full scene detail by global scene id.
    pub fn scene_detail(&self, scene_id: i64) -> Result<SceneDetail, IngestError> {
        let scene = self
            .store
            .get_scene(scene_id)
            .map_err(to_transient)?
            .ok_or_else(|| IngestError::NotFound(format!("scene {scene_id}")))?;
        let file = self
            .store
            .get_file(scene.file_id)
            .map_err(to_transient)?
            .filter(|f| f.deleted_at.is_none())
            .ok_or_else(|| IngestError::NotFound(format!("file {}", scene.file_id)))?;

        let faces = self.face_boxes(scene_id).map_err(to_transient)?;

        let mut vectors: Vec<VectorSummary> = self
            .store
            .embeddings_for_scene(scene_id)
            .map_err(to_transient)?
            .into_iter()
            .map(|(model, version, dimension)| VectorSummary {
                model,
                version,
                dimension,
                count: None,
            })
            .collect();

        // Face vectors live on the face rows, not the embeddings table.
        if !faces.is_empty() {
            let registry = self.store.model_versions().map_err(to_transient)?;
            let arcface = registry.get("arcface");
            vectors.push(VectorSummary {
                model: "arcface".to_string(),
                version: arcface.map(|m| m.version.clone()).unwrap_or_default(),
                dimension: arcface.and_then(|m| m.dimension).unwrap_or(512),
                count: Some(faces.len() as i64),
            });
        }

        let view = SceneView {
            id: scene.id,
            scene_index: scene.scene_index,
            start_time: scene.start_tc,
            end_time: scene.end_tc,
            transcript: scene.transcript,
            poster_frame_path: scene.poster_frame_path,
            file_id: file.id,
            filename: file.filename,
            path: file.path,
            duration_seconds: file.duration_seconds,
            width: file.width,
            height: file.height,
            fps: file.fps,
            codec: file.codec,
            audio_tracks: file.audio_tracks,
            file_size_bytes: file.file_size_bytes,
            file_modified_at: file.file_modified_at,
            faces,
            similarity: None,
            face_similarity: None,
            transcript_similarity: None,
        };

        Ok(SceneDetail { scene: view, vectors })
    }

    /// Combined filter search; clauses intersect on scene id.
    pub fn search(
        &self,
        filters: &[SearchFilter],
        limit: usize,
    ) -> Result<Vec<SceneView>, IngestError> {
        let ctx = search::SearchContext {
            store: &self.store,
            clip: &self.clip,
            sentence: &self.sentence,
            thresholds: self.store.search_thresholds().map_err(to_transient)?,
        };
        let mut results = search::run_search(&ctx, filters, limit)?;
        for scene in &mut results {
            scene.faces = self.face_boxes(scene.id).map_err(to_transient)?;
        }
        Ok(results)
    }

    fn face_boxes(&self, scene_id: i64) -> Result<Vec<FaceBox>> {
        Ok(self
            .store
            .faces_for_scene(scene_id)?
            .into_iter()
            .map(|f| FaceBox {
                id: f.id,
                bbox: [f.bbox.x, f.bbox.y, f.bbox.w, f.bbox.h],
            })
            .collect())
    }

    // ---- files ----

    pub fn list_files(
        &self,
        limit: usize,
        offset: usize,
        completed_only: bool,
    ) -> Result<Vec<crate::store::FileRecord>> {
        self.store.list_files(limit, offset, completed_only)
    }

    pub fn get_file(
        &self,
        file_id: i64,
    ) -> Result<(crate::store::FileRecord, Vec<crate::store::SceneRecord>), IngestError> {
        let file = self
            .store
            .get_file(file_id)
            .map_err(to_transient)?
            .filter(|f| f.deleted_at.is_none())
            .ok_or_else(|| IngestError::NotFound(format!("file {file_id}")))?;
        let scenes = self.store.scenes_for_file(file_id).map_err(to_transient)?;
        Ok((file, scenes))
    }

    // ---- faces ----

    /// Recent faces with their scene and file context, newest first.
    pub fn list_faces(&self, limit: usize) -> Result<Vec<FaceListItem>> {
        let mut stmt = self.store.conn().prepare(
            r#"
            SELECT f.id, f.scene_id, s.scene_index, fi.filename
            FROM faces f
            JOIN scenes s ON f.scene_id = s.id
            JOIN files fi ON s.file_id = fi.id
            ORDER BY f.id DESC
            LIMIT ?
            "#,
        )?;
        let faces = stmt
            .query_map([limit as i64], |row| {
                Ok(FaceListItem {
                    id: row.get(0)?,
                    scene_id: row.get(1)?,
                    scene_index: row.get(2)?,
                    filename: row.get(3)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(faces)
    }

    pub fn get_face(&self, face_id: i64) -> Result<FaceDetail, IngestError> {
        let face = self
            .store
            .get_face(face_id)
            .map_err(to_transient)?
            .ok_or_else(|| IngestError::NotFound(format!("face {face_id}")))?;
        let scene = self
            .store
            .get_scene(face.scene_id)
            .map_err(to_transient)?
            .ok_or_else(|| IngestError::NotFound(format!("scene {}", face.scene_id)))?;
        let file = self
            .store
            .get_file(scene.file_id)
            .map_err(to_transient)?
            .ok_or_else(|| IngestError::NotFound(format!("file {}", scene.file_id)))?;

        Ok(FaceDetail {
            id: face.id,
            scene_id: face.scene_id,
            scene_index: scene.scene_index,
            bbox: [face.bbox.x, face.bbox.y, face.bbox.w, face.bbox.h],
            poster_path: scene.poster_frame_path,
            start_tc: scene.start_tc,
            end_tc: scene.end_tc,
            file_id: file.id,
            filename: file.filename,
            path: file.path,
        })
    }

    // ---- stats ----

    pub fn stats(&self) -> Result<Stats> {
        Ok(Stats {
            files: self.store.count_files()?,
            scenes: self.store.count_scenes()?,
            faces: self.store.count_faces()?,
            total_duration: self.store.total_duration_seconds()?,
            total_file_size_bytes: self.store.total_file_size_bytes()?,
            last_scan_at: self
                .store
                .get_config_or(crate::store::settings::KEY_LAST_SCAN_AT, None)?,
            last_scan_duration_ms: self
                .store
                .get_config_or(crate::store::settings::KEY_LAST_SCAN_DURATION_MS, None)?,
            indexer_state: self.store.indexer_state()?,
            poll_interval_seconds: self.store.poll_interval_seconds()?,
        })
    }

    pub fn vector_stats(&self) -> Result<VectorStats> {
        let total = self.store.count_scenes()?;
        let scanned = self.store.count_scenes_indexed()?;
        let coverage_of = |count: i64| {
            if total > 0 {
                (count as f64 / total as f64 * 1000.0).round() / 10.0
            } else {
                0.0
            }
        };

        let mut models = Vec::new();
        for m in self.store.model_coverage()? {
            let (name, partial, empty) = match m.model_name.as_str() {
                "clip" => ("Visual".to_string(), false, None),
                "transcript" => (
                    "Transcript".to_string(),
                    true,
                    Some(self.store.count_scenes_empty_transcript()?),
                ),
                other => (other.to_string(), false, None),
            };
            models.push(ModelStats {
                name,
                model: m.model_name,
                version: m.model_version,
                dimension: m.dimension,
                scanned,
                found: m.count,
                coverage: coverage_of(m.count),
                partial_expected: partial,
                empty,
                total_detected: None,
                last_updated: m.last_updated,
            });
        }

        // Faces: coverage counts scenes with at least one face.
        let scenes_with_faces = self.store.count_scenes_with_faces()?;
        let total_faces = self.store.count_faces()?;
        if scenes_with_faces > 0 || total_faces > 0 || scanned > 0 {
            let registry = self.store.model_versions()?;
            let arcface = registry.get("arcface");
            models.push(ModelStats {
                name: "Faces".to_string(),
                model: "arcface".to_string(),
                version: arcface.map(|m| m.version.clone()).unwrap_or_default(),
                dimension: arcface.and_then(|m| m.dimension).unwrap_or(512),
                scanned,
                found: scenes_with_faces,
                coverage: coverage_of(scenes_with_faces),
                partial_expected: true,
                empty: Some(self.store.count_scenes_face_scanned_empty()?),
                total_detected: Some(total_faces),
                last_updated: None,
            });
        }

        Ok(VectorStats {
            total_scenes: total,
            models,
        })
    }

    // ---- queue & scan ----

    pub fn queue(&self) -> Result<QueueSnapshot> {
        let QueueCounts {
            pending,
            processing,
            complete,
            failed,
        } = self.store.queue_counts()?;

        let current = match self.store.current_job()? {
            Some(item) => {
                let file = self.store.get_file(item.file_id)?;
                file.map(|file| QueueCurrent {
                    id: item.id,
                    current_stage: item.current_stage,
                    current_stage_num: item.current_stage_num,
                    total_stages: item.total_stages,
                    started_at: item.started_at,
                    filename: file.filename,
                    path: file.path,
                    duration_seconds: file.duration_seconds,
                })
            }
            None => None,
        };

        Ok(QueueSnapshot {
            pending,
            processing,
            complete,
            failed,
            current,
        })
    }

    pub fn scan_progress(&self) -> Result<ScanProgress> {
        progress::read(&self.store)
    }

    // ---- config ----

    pub fn get_config(&self, key: &str) -> Result<serde_json::Value, IngestError> {
        self.store
            .get_config(key)
            .map_err(to_transient)?
            .ok_or_else(|| IngestError::NotFound(format!("config key '{key}'")))
    }

    pub fn set_config(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        self.store.set_config(key, value)
    }

    pub fn watch_folders(&self) -> Result<Vec<WatchFolderStatus>> {
        Ok(self
            .store
            .watch_folders()?
            .into_iter()
            .map(|path| {
                let accessible = PathBuf::from(&path).is_dir();
                WatchFolderStatus { path, accessible }
            })
            .collect())
    }

    // ---- admin ----

    pub fn reset_failed_jobs(&self) -> Result<usize, IngestError> {
        self.check_admin()?;
        self.store.reset_failed_jobs().map_err(to_transient)
    }

    pub fn reset_processing_jobs(&self) -> Result<usize, IngestError> {
        self.check_admin()?;
        self.store.reset_processing_jobs().map_err(to_transient)
    }

    pub fn purge_deleted_files(&self) -> Result<usize, IngestError> {
        self.check_admin()?;
        self.store.purge_deleted_files().map_err(to_transient)
    }

    pub fn purge_orphan_files(&self) -> Result<usize, IngestError> {
        self.check_admin()?;
        let watch_folders = self.store.watch_folders().map_err(to_transient)?;
        self.store
            .purge_orphan_files(&watch_folders)
            .map_err(to_transient)
    }

    /// Wipe all enrichment data, keeping config. The caller is expected
    /// to have confirmed with the operator first.
    pub fn wipe(&self) -> Result<crate::store::admin::WipeCounts, IngestError> {
        self.check_admin()?;
        self.store.wipe().map_err(to_transient)
    }

    /// Acknowledge a restart request. Exiting (so the supervisor brings
    /// the process back up with fresh mounts) is the embedding server's
    /// job once the response is flushed.
    pub fn request_restart(&self) -> Result<(), IngestError> {
        self.check_admin()?;
        tracing::info!("Restart requested by admin action");
        Ok(())
    }

    pub fn export_edl(&self, clips: &[EdlClip], title: &str) -> Result<String, IngestError> {
        edl::generate(&self.store, clips, title)
    }

    fn check_admin(&self) -> Result<(), IngestError> {
        if self.demo_mode {
            return Err(IngestError::BadRequest(
                "admin actions disabled in demo mode".into(),
            ));
        }
        Ok(())
    }
}

fn to_transient(e: anyhow::Error) -> IngestError {
    IngestError::StageTransient(e.to_string())
}
