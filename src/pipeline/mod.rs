//! The enrichment pipeline.
//!
//! A stage machine driven by a single loop: claim one job, run the
//! enabled stages in order, commit each stage's artifacts before moving
//! on, then mark the job complete. Every stage is individually durable
//! and idempotent under re-run, so a crashed or failed job re-enters at
//! the first incomplete stage.

pub mod audio;
pub mod posters;
pub mod scene_detect;

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::error::{IngestError, IngestResult};
use crate::models::arcface::FaceModel;
use crate::models::clip::ClipModel;
use crate::models::sentence::SentenceModel;
use crate::models::whisper::{TranscriptSegment, WhisperModel};
use crate::scanner::probe;
use crate::store::settings::EnabledModels;
use crate::store::{QueueItem, Store};

use posters::PosterSettings;

/// Embedding-table model names.
pub const MODEL_CLIP: &str = "clip";
pub const MODEL_TRANSCRIPT: &str = "transcript";

/// The fixed stage order. Which stages actually run depends on the
/// model toggles; metadata, scene detection and posters always do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Metadata,
    SceneDetection,
    PosterExtraction,
    VisualEmbedding,
    Transcription,
    TranscriptEmbedding,
    FaceDetection,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Metadata => "metadata",
            Stage::SceneDetection => "scene_detection",
            Stage::PosterExtraction => "poster_extraction",
            Stage::VisualEmbedding => "visual_embedding",
            Stage::Transcription => "transcription",
            Stage::TranscriptEmbedding => "transcript_embedding",
            Stage::FaceDetection => "face_detection",
        }
    }
}

/// Stages enabled by the current model toggles, in execution order.
pub fn enabled_stages(models: &EnabledModels) -> Vec<Stage> {
    let mut stages = vec![Stage::Metadata, Stage::SceneDetection, Stage::PosterExtraction];
    if models.clip {
        stages.push(Stage::VisualEmbedding);
    }
    if models.whisper {
        stages.push(Stage::Transcription);
        stages.push(Stage::TranscriptEmbedding);
    }
    if models.arcface {
        stages.push(Stage::FaceDetection);
    }
    stages
}

pub fn total_stages(models: &EnabledModels) -> i64 {
    enabled_stages(models).len() as i64
}

/// What happened to one claim attempt.
#[derive(Debug)]
pub enum JobOutcome {
    /// Job ran to completion.
    Processed { file_id: i64 },
    /// Job failed and was recorded as such.
    Failed { file_id: i64, error: String },
    /// File lives under an unmounted watch root; job re-queued at the
    /// back without a failure mark.
    Deferred { job_id: i64 },
    /// A model host would not load; job returned to pending, caller
    /// should back off.
    ModelNotReady { error: String },
}

pub struct Pipeline<'a> {
    store: &'a mut Store,
    posters_dir: PathBuf,
    clip: ClipModel,
    whisper: WhisperModel,
    sentence: SentenceModel,
    faces: FaceModel,
}

impl<'a> Pipeline<'a> {
    pub fn new(store: &'a mut Store, posters_dir: PathBuf) -> Self {
        Self {
            store,
            posters_dir,
            clip: ClipModel::new(),
            whisper: WhisperModel::new(),
            sentence: SentenceModel::new(),
            faces: FaceModel::new(),
        }
    }

    /// Claim and process the oldest pending job. `Ok(None)` means the
    /// queue has nothing pending.
    pub fn process_next(&mut self) -> Result<Option<JobOutcome>> {
        let models = self.store.enabled_models()?;
        let stages = enabled_stages(&models);

        let Some(job) = self.store.claim_next_job(stages.len() as i64)? else {
            return Ok(None);
        };

        let file = match self.store.get_file(job.file_id)? {
            Some(file) => file,
            None => {
                // Row vanished under us; nothing left to enrich.
                self.store.fail_job(job.id, "file row missing")?;
                return Ok(Some(JobOutcome::Failed {
                    file_id: job.file_id,
                    error: "file row missing".into(),
                }));
            }
        };

        let video_path = PathBuf::from(&file.path);

        // A file under an unmounted watch root is not a failure; put the
        // job at the back of the queue and let a later cycle retry.
        let accessible = accessible_watch_folders(&self.store.watch_folders()?);
        if !is_under_any(&file.path, &accessible) {
            tracing::info!(path = %file.path, "Watch folder unmounted, deferring job");
            self.store.release_job(job.id)?;
            self.store.enqueue_file(job.file_id)?;
            return Ok(Some(JobOutcome::Deferred { job_id: job.id }));
        }

        if !video_path.exists() {
            self.store.fail_job(job.id, "File not found")?;
            return Ok(Some(JobOutcome::Failed {
                file_id: job.file_id,
                error: "File not found".into(),
            }));
        }

        tracing::info!(path = %file.path, job = job.id, "Enriching");

        for (i, stage) in stages.iter().enumerate() {
            // Pause is observed between stages: hold at the boundary
            // until the indexer is resumed.
            while self.store.indexer_state()? == "paused" {
                std::thread::sleep(std::time::Duration::from_secs(5));
            }

            let stage_num = (i + 1) as i64;
            self.store.set_job_stage(job.id, stage.name(), stage_num)?;
            tracing::debug!(stage = stage.name(), num = stage_num, "Stage start");

            match self.run_stage(*stage, &job, &video_path) {
                Ok(()) => {}
                Err(e) if e.keeps_job_pending() => {
                    tracing::warn!(stage = stage.name(), error = %e, "Model not ready, releasing job");
                    self.store.release_job(job.id)?;
                    return Ok(Some(JobOutcome::ModelNotReady { error: e.to_string() }));
                }
                Err(e) => {
                    tracing::error!(stage = stage.name(), path = %file.path, error = %e, "Stage failed");
                    self.store.fail_job(job.id, &e.to_string())?;
                    return Ok(Some(JobOutcome::Failed {
                        file_id: job.file_id,
                        error: e.to_string(),
                    }));
                }
            }
        }

        self.store.complete_job(job.id)?;
        self.store.set_file_indexed(job.file_id)?;
        tracing::info!(path = %file.path, "Enrichment complete");

        Ok(Some(JobOutcome::Processed { file_id: job.file_id }))
    }

    fn run_stage(&mut self, stage: Stage, job: &QueueItem, video_path: &Path) -> IngestResult<()> {
        match stage {
            Stage::Metadata => self.stage_metadata(job.file_id, video_path),
            Stage::SceneDetection => self.stage_scene_detection(job.file_id, video_path),
            Stage::PosterExtraction => self.stage_posters(job.file_id, video_path),
            Stage::VisualEmbedding => self.stage_visual_embedding(job.file_id),
            Stage::Transcription => self.stage_transcription(job.file_id, video_path),
            Stage::TranscriptEmbedding => self.stage_transcript_embedding(job.file_id),
            Stage::FaceDetection => self.stage_face_detection(job.file_id),
        }
    }

    /// Probe the file if its metadata is still missing (the scan defers
    /// probing so scans stay fast). No duration means the decoder cannot
    /// read the file at all.
    fn stage_metadata(&mut self, file_id: i64, video_path: &Path) -> IngestResult<()> {
        let file = self
            .store
            .get_file(file_id)
            .map_err(to_transient)?
            .ok_or_else(|| IngestError::NotFound(format!("file {file_id}")))?;

        if file.duration_seconds.is_some() {
            return Ok(());
        }

        let meta = probe::probe_video(video_path)?;
        if meta.duration_seconds.is_none() {
            return Err(IngestError::UnreadableMedia(
                "probe failed - file may be corrupted or an unsupported format".into(),
            ));
        }
        self.store.set_video_meta(file_id, &meta).map_err(to_transient)
    }

    /// Detect scene boundaries. Skipped when scene rows already exist
    /// (crash recovery re-enters here without re-detecting).
    fn stage_scene_detection(&mut self, file_id: i64, video_path: &Path) -> IngestResult<()> {
        if self.store.count_scenes_for_file(file_id).map_err(to_transient)? > 0 {
            return Ok(());
        }

        let file = self
            .store
            .get_file(file_id)
            .map_err(to_transient)?
            .ok_or_else(|| IngestError::NotFound(format!("file {file_id}")))?;
        let duration = file
            .duration_seconds
            .ok_or_else(|| IngestError::UnreadableMedia("no duration".into()))?;

        let threshold = self.store.scene_threshold().map_err(to_transient)?;
        let scenes = scene_detect::detect_scenes(video_path, duration, threshold)?;
        let count = scenes.len();
        self.store
            .replace_scenes(file_id, &scenes)
            .map_err(to_transient)?;
        tracing::info!(file = file_id, scenes = count, "Scenes detected");
        Ok(())
    }

    /// Extract the midpoint frame for every scene still missing one.
    fn stage_posters(&mut self, file_id: i64, video_path: &Path) -> IngestResult<()> {
        let pending = self
            .store
            .scenes_without_poster(file_id)
            .map_err(to_transient)?;
        if pending.is_empty() {
            return Ok(());
        }

        let file = self
            .store
            .get_file(file_id)
            .map_err(to_transient)?
            .ok_or_else(|| IngestError::NotFound(format!("file {file_id}")))?;
        let fps = file.fps.unwrap_or(0.0);

        let settings = PosterSettings {
            width: self.store.poster_width().map_err(to_transient)?,
            quality: self.store.poster_quality().map_err(to_transient)?,
            format: self.store.poster_format().map_err(to_transient)?,
        };

        for scene in &pending {
            let timecode = posters::midpoint(scene.start_tc, scene.end_tc, fps);
            let output = posters::poster_path(&self.posters_dir, scene.id, &settings.format);
            posters::extract_frame(video_path, timecode, &output, &settings)?;
            self.store
                .set_scene_poster(scene.id, &output.to_string_lossy())
                .map_err(to_transient)?;
        }
        tracing::info!(file = file_id, posters = pending.len(), "Posters extracted");
        Ok(())
    }

    /// CLIP-embed each scene's poster, skipping scenes whose stored
    /// vector already matches the registry version.
    fn stage_visual_embedding(&mut self, file_id: i64) -> IngestResult<()> {
        let registry = self.store.model_versions().map_err(to_transient)?;
        let version = registry
            .get(MODEL_CLIP)
            .map(|m| m.version.clone())
            .unwrap_or_default();

        let scenes = self.store.scenes_for_file(file_id).map_err(to_transient)?;
        let mut embedded = 0usize;

        for scene in &scenes {
            let Some(poster) = scene.poster_frame_path.as_deref() else {
                continue;
            };
            if self.embedding_is_current(scene.id, MODEL_CLIP, &version)? {
                continue;
            }

            if !self.clip.is_ready() {
                self.clip
                    .load()
                    .map_err(|e| IngestError::ModelNotReady(e.to_string()))?;
            }

            match self.clip.embed_image_file(Path::new(poster)) {
                Ok(vector) => {
                    self.store
                        .upsert_embedding(scene.id, MODEL_CLIP, &version, &vector)
                        .map_err(to_transient)?;
                    embedded += 1;
                }
                Err(e) => {
                    // One bad poster shouldn't sink the whole file.
                    tracing::warn!(scene = scene.id, error = %e, "Visual embedding failed");
                }
            }
        }

        if embedded > 0 {
            tracing::info!(file = file_id, embedded, "Visual embeddings written");
        }
        Ok(())
    }

    /// Transcribe the audio track and write per-scene text. Scenes with
    /// no overlapping speech get an empty string so retries can tell
    /// "transcribed, silent" from "not transcribed yet".
    fn stage_transcription(&mut self, file_id: i64, video_path: &Path) -> IngestResult<()> {
        let pending = self
            .store
            .scenes_without_transcript(file_id)
            .map_err(to_transient)?;
        if pending.is_empty() {
            return Ok(());
        }

        let file = self
            .store
            .get_file(file_id)
            .map_err(to_transient)?
            .ok_or_else(|| IngestError::NotFound(format!("file {file_id}")))?;

        let segments = if file.audio_tracks == Some(0) {
            tracing::info!(file = file_id, "No audio tracks, skipping transcription");
            Vec::new()
        } else {
            if !self.whisper.is_ready() {
                self.whisper
                    .load()
                    .map_err(|e| IngestError::ModelNotReady(e.to_string()))?;
            }
            let samples = audio::extract_samples(video_path)?;
            self.whisper
                .transcribe(&samples)
                .map_err(|e| IngestError::StageTransient(e.to_string()))?
        };

        for scene in &pending {
            let text = transcript_for_scene(&segments, scene.start_tc, scene.end_tc);
            self.store
                .set_scene_transcript(scene.id, &text)
                .map_err(to_transient)?;
        }
        tracing::info!(file = file_id, segments = segments.len(), "Transcription written");
        Ok(())
    }

    /// Sentence-embed every non-empty transcript whose stored vector is
    /// missing or from another model version.
    fn stage_transcript_embedding(&mut self, file_id: i64) -> IngestResult<()> {
        let registry = self.store.model_versions().map_err(to_transient)?;
        let version = registry
            .get(MODEL_TRANSCRIPT)
            .map(|m| m.version.clone())
            .unwrap_or_default();

        let scenes = self.store.scenes_for_file(file_id).map_err(to_transient)?;
        let mut embedded = 0usize;

        for scene in &scenes {
            let Some(transcript) = scene.transcript.as_deref() else {
                continue;
            };
            if transcript.trim().is_empty() {
                continue;
            }
            if self.embedding_is_current(scene.id, MODEL_TRANSCRIPT, &version)? {
                continue;
            }

            if !self.sentence.is_ready() {
                self.sentence
                    .load()
                    .map_err(|e| IngestError::ModelNotReady(e.to_string()))?;
            }

            let vector = self
                .sentence
                .embed_text(transcript)
                .map_err(|e| IngestError::StageTransient(e.to_string()))?;
            self.store
                .upsert_embedding(scene.id, MODEL_TRANSCRIPT, &version, &vector)
                .map_err(to_transient)?;
            embedded += 1;
        }

        if embedded > 0 {
            tracing::info!(file = file_id, embedded, "Transcript embeddings written");
        }
        Ok(())
    }

    /// Detect faces on each poster not yet covered by a detection run.
    /// Per scene: drop stale rows, detect, insert, stamp the marker, so
    /// a retry never duplicates faces.
    fn stage_face_detection(&mut self, file_id: i64) -> IngestResult<()> {
        let pending = self
            .store
            .scenes_without_face_scan(file_id)
            .map_err(to_transient)?;
        if pending.is_empty() {
            return Ok(());
        }

        let mut total = 0usize;
        for scene in &pending {
            let Some(poster) = scene.poster_frame_path.as_deref() else {
                continue;
            };

            if !self.faces.is_ready() {
                self.faces
                    .load()
                    .map_err(|e| IngestError::ModelNotReady(e.to_string()))?;
            }

            match self.faces.detect_file(Path::new(poster)) {
                Ok(detected) => {
                    self.store
                        .delete_faces_for_scene(scene.id)
                        .map_err(to_transient)?;
                    for face in &detected {
                        self.store
                            .insert_face(scene.id, &face.bbox, &face.embedding)
                            .map_err(to_transient)?;
                    }
                    self.store
                        .mark_scene_face_scanned(scene.id)
                        .map_err(to_transient)?;
                    total += detected.len();
                }
                Err(e) => {
                    // Left unmarked so a retry revisits this scene.
                    tracing::warn!(scene = scene.id, error = %e, "Face detection failed");
                }
            }
        }

        tracing::info!(file = file_id, faces = total, "Face detection complete");
        Ok(())
    }

    fn embedding_is_current(
        &self,
        scene_id: i64,
        model: &str,
        version: &str,
    ) -> IngestResult<bool> {
        let existing = self
            .store
            .get_embedding(scene_id, model)
            .map_err(to_transient)?;
        Ok(matches!(existing, Some(e) if e.model_version == version))
    }
}

fn to_transient(e: anyhow::Error) -> IngestError {
    IngestError::StageTransient(e.to_string())
}

/// Watch folders that are currently readable directories.
pub fn accessible_watch_folders(watch_folders: &[String]) -> Vec<String> {
    watch_folders
        .iter()
        .filter(|f| Path::new(f).is_dir())
        .cloned()
        .collect()
}

fn is_under_any(path: &str, folders: &[String]) -> bool {
    folders.iter().any(|f| path.starts_with(f.as_str()))
}

/// Join the text of all segments overlapping `[start, end)`. Empty
/// string when nothing overlaps.
fn transcript_for_scene(segments: &[TranscriptSegment], start: f64, end: f64) -> String {
    let parts: Vec<&str> = segments
        .iter()
        .filter(|seg| seg.start < end && seg.end > start)
        .map(|seg| seg.text.as_str())
        .collect();
    parts.join(" ")
}
