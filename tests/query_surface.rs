//! Query surface behavior over a seeded store: browse, combined
//! search, stats, queue snapshot, admin actions.

use std::path::PathBuf;

use tempfile::TempDir;

use fennec::error::IngestError;
use fennec::query::{FaceRef, QueryService, SearchFilter};
use fennec::store::{BoundingBox, NewScene, Store, VideoMeta};

struct Fixture {
    _dir: TempDir,
    db_path: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("fennec.db");
        let store = Store::open(&db_path).unwrap();
        store.initialize().unwrap();
        Self { _dir: dir, db_path }
    }

    fn store(&self) -> Store {
        Store::open(&self.db_path).unwrap()
    }

    fn query(&self) -> QueryService {
        QueryService::open(&self.db_path).unwrap()
    }
}

/// Insert a completed file with the given scenes, returning scene ids.
fn seed_file(store: &mut Store, path: &str, meta: VideoMeta, scenes: &[NewScene]) -> (i64, Vec<i64>) {
    let filename = path.rsplit('/').next().unwrap().to_string();
    let file_id = store
        .insert_file(path, &filename, &Default::default())
        .unwrap();
    store.set_video_meta(file_id, &meta).unwrap();
    let scene_ids = store.replace_scenes(file_id, scenes).unwrap();

    store.enqueue_file(file_id).unwrap();
    let job = store.claim_next_job(1).unwrap().unwrap();
    store.complete_job(job.id).unwrap();
    store.set_file_indexed(file_id).unwrap();

    (file_id, scene_ids)
}

fn meta(duration: f64, codec: &str, fps: f64, width: i64, height: i64) -> VideoMeta {
    VideoMeta {
        duration_seconds: Some(duration),
        width: Some(width),
        height: Some(height),
        fps: Some(fps),
        codec: Some(codec.to_string()),
        audio_tracks: Some(1),
        ..Default::default()
    }
}

#[test]
fn empty_library_browse_and_stats() {
    let fx = Fixture::new();
    let q = fx.query();

    let list = q.browse_scenes(40, 0).unwrap();
    assert!(list.scenes.is_empty());
    assert_eq!(list.total, 0);

    let stats = q.stats().unwrap();
    assert_eq!(stats.files, 0);
    assert_eq!(stats.scenes, 0);
    assert_eq!(stats.faces, 0);
    assert_eq!(stats.total_duration, 0.0);
    assert_eq!(stats.indexer_state, "running");
}

#[test]
fn browse_orders_by_file_then_scene_index() {
    let fx = Fixture::new();
    let mut store = fx.store();
    seed_file(
        &mut store,
        "/media/b.mp4",
        meta(20.0, "h264", 25.0, 1920, 1080),
        &[
            NewScene { start_tc: 0.0, end_tc: 10.0 },
            NewScene { start_tc: 10.0, end_tc: 20.0 },
        ],
    );
    seed_file(
        &mut store,
        "/media/a.mp4",
        meta(5.0, "h264", 25.0, 1280, 720),
        &[NewScene { start_tc: 0.0, end_tc: 5.0 }],
    );

    let q = fx.query();
    let list = q.browse_scenes(40, 0).unwrap();
    assert_eq!(list.total, 3);
    let order: Vec<(i64, i64)> = list
        .scenes
        .iter()
        .map(|s| (s.file_id, s.scene_index))
        .collect();
    let mut sorted = order.clone();
    sorted.sort();
    assert_eq!(order, sorted);

    // Pagination slices the same ordering.
    let page = q.browse_scenes(2, 2).unwrap();
    assert_eq!(page.scenes.len(), 1);
    assert_eq!(page.total, 3);
}

#[test]
fn incomplete_files_are_hidden_from_browse() {
    let fx = Fixture::new();
    let mut store = fx.store();

    // File with scenes but no completed queue entry.
    let file_id = store
        .insert_file("/media/pending.mp4", "pending.mp4", &Default::default())
        .unwrap();
    store
        .replace_scenes(file_id, &[NewScene { start_tc: 0.0, end_tc: 5.0 }])
        .unwrap();
    store.enqueue_file(file_id).unwrap();

    let q = fx.query();
    let list = q.browse_scenes(40, 0).unwrap();
    assert_eq!(list.total, 0);
}

#[test]
fn scene_detail_carries_vectors_and_faces() {
    let fx = Fixture::new();
    let mut store = fx.store();
    let (_, scene_ids) = seed_file(
        &mut store,
        "/media/a.mp4",
        meta(10.0, "h264", 25.0, 1920, 1080),
        &[NewScene { start_tc: 0.0, end_tc: 10.0 }],
    );
    store
        .upsert_embedding(scene_ids[0], "clip", "ViT-B-32", &[1.0, 0.0])
        .unwrap();
    store
        .insert_face(
            scene_ids[0],
            &BoundingBox { x: 10.0, y: 20.0, w: 50.0, h: 60.0 },
            &[0.6, 0.8],
        )
        .unwrap();

    let q = fx.query();
    let detail = q.scene_detail(scene_ids[0]).unwrap();
    assert_eq!(detail.scene.id, scene_ids[0]);
    assert_eq!(detail.scene.faces.len(), 1);
    assert_eq!(detail.scene.faces[0].bbox, [10.0, 20.0, 50.0, 60.0]);

    let models: Vec<&str> = detail.vectors.iter().map(|v| v.model.as_str()).collect();
    assert!(models.contains(&"clip"));
    assert!(models.contains(&"arcface"));

    // Unknown ids surface as NotFound.
    assert!(matches!(
        q.scene_detail(9999),
        Err(IngestError::NotFound(_))
    ));
}

#[test]
fn visual_match_respects_threshold_and_excludes_reference() {
    let fx = Fixture::new();
    let mut store = fx.store();
    let (_, scenes_a) = seed_file(
        &mut store,
        "/media/a.mp4",
        meta(10.0, "h264", 25.0, 1920, 1080),
        &[NewScene { start_tc: 0.0, end_tc: 10.0 }],
    );
    let (_, scenes_b) = seed_file(
        &mut store,
        "/media/b.mp4",
        meta(10.0, "h264", 25.0, 1920, 1080),
        &[NewScene { start_tc: 0.0, end_tc: 10.0 }],
    );
    let (_, scenes_c) = seed_file(
        &mut store,
        "/media/c.mp4",
        meta(10.0, "h264", 25.0, 1920, 1080),
        &[NewScene { start_tc: 0.0, end_tc: 10.0 }],
    );

    // cos(ref, b) = 0.9; cos(ref, c) = 0.4.
    store
        .upsert_embedding(scenes_a[0], "clip", "v1", &[1.0, 0.0])
        .unwrap();
    store
        .upsert_embedding(scenes_b[0], "clip", "v1", &[0.9, 0.43588989])
        .unwrap();
    store
        .upsert_embedding(scenes_c[0], "clip", "v1", &[0.4, 0.91651514])
        .unwrap();

    let q = fx.query();
    let results = q
        .search(
            &[SearchFilter::VisualMatch {
                scene_id: scenes_a[0],
                threshold: Some(0.5),
            }],
            200,
        )
        .unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, scenes_b[0]);
    let similarity = results[0].similarity.unwrap();
    assert!((similarity - 0.9).abs() < 0.001);

    // Threshold 0 admits every scene with a vector except the reference.
    let all = q
        .search(
            &[SearchFilter::VisualMatch {
                scene_id: scenes_a[0],
                threshold: Some(0.0),
            }],
            200,
        )
        .unwrap();
    assert_eq!(all.len(), 2);
    // Best match first.
    assert_eq!(all[0].id, scenes_b[0]);
}

#[test]
fn face_filter_projects_to_scenes() {
    let fx = Fixture::new();
    let mut store = fx.store();
    let (_, scenes_a) = seed_file(
        &mut store,
        "/media/a.mp4",
        meta(10.0, "h264", 25.0, 1920, 1080),
        &[NewScene { start_tc: 0.0, end_tc: 10.0 }],
    );
    let (_, scenes_b) = seed_file(
        &mut store,
        "/media/b.mp4",
        meta(10.0, "h264", 25.0, 1920, 1080),
        &[NewScene { start_tc: 0.0, end_tc: 10.0 }],
    );

    let bbox = BoundingBox { x: 0.0, y: 0.0, w: 10.0, h: 10.0 };
    // cos(fa, fb) = 0.3.
    let fa = store
        .insert_face(scenes_a[0], &bbox, &[1.0, 0.0])
        .unwrap();
    store
        .insert_face(scenes_b[0], &bbox, &[0.3, 0.9539392])
        .unwrap();

    let q = fx.query();

    // Threshold 0.25 keeps both scenes.
    let both = q
        .search(
            &[SearchFilter::Face {
                face: FaceRef::Id(fa),
                threshold: Some(0.25),
            }],
            200,
        )
        .unwrap();
    assert_eq!(both.len(), 2);

    // Threshold 0.5 keeps only the scene holding the query face.
    let only_a = q
        .search(
            &[SearchFilter::Face {
                face: FaceRef::Id(fa),
                threshold: Some(0.5),
            }],
            200,
        )
        .unwrap();
    assert_eq!(only_a.len(), 1);
    assert_eq!(only_a[0].id, scenes_a[0]);

    // The (scene, face-index) form resolves to the same face.
    let by_index = q
        .search(
            &[SearchFilter::Face {
                face: FaceRef::SceneFace { scene_id: scenes_a[0], face_index: 0 },
                threshold: Some(0.5),
            }],
            200,
        )
        .unwrap();
    assert_eq!(by_index.len(), 1);

    // A dangling face id is NotFound.
    assert!(matches!(
        q.search(
            &[SearchFilter::Face { face: FaceRef::Id(424242), threshold: None }],
            200
        ),
        Err(IngestError::NotFound(_))
    ));
}

#[test]
fn metadata_clauses_intersect() {
    let fx = Fixture::new();
    let mut store = fx.store();
    seed_file(
        &mut store,
        "/media/films/slow.mp4",
        meta(3600.0, "h264", 24.0, 3840, 2160),
        &[NewScene { start_tc: 0.0, end_tc: 3600.0 }],
    );
    seed_file(
        &mut store,
        "/media/clips/fast.mp4",
        meta(30.0, "prores", 60.0, 1920, 1080),
        &[NewScene { start_tc: 0.0, end_tc: 30.0 }],
    );

    let q = fx.query();

    let by_codec = q
        .search(&[SearchFilter::Codec { substring: "PRORES".into() }], 200)
        .unwrap();
    assert_eq!(by_codec.len(), 1);
    assert_eq!(by_codec[0].codec.as_deref(), Some("prores"));

    let by_path_and_fps = q
        .search(
            &[
                SearchFilter::Path { substring: "films".into() },
                SearchFilter::FpsRange { min: Some(23.0), max: Some(30.0) },
            ],
            200,
        )
        .unwrap();
    assert_eq!(by_path_and_fps.len(), 1);

    let nothing = q
        .search(
            &[
                SearchFilter::Path { substring: "films".into() },
                SearchFilter::Codec { substring: "prores".into() },
            ],
            200,
        )
        .unwrap();
    assert!(nothing.is_empty());

    let by_resolution = q
        .search(
            &[SearchFilter::ResolutionMin { width: Some(2000), height: None }],
            200,
        )
        .unwrap();
    assert_eq!(by_resolution.len(), 1);

    let by_duration = q
        .search(
            &[SearchFilter::DurationRange { min: None, max: Some(60.0) }],
            200,
        )
        .unwrap();
    assert_eq!(by_duration.len(), 1);
}

#[test]
fn dialog_keyword_is_case_insensitive_substring() {
    let fx = Fixture::new();
    let mut store = fx.store();
    let (_, scenes) = seed_file(
        &mut store,
        "/media/a.mp4",
        meta(20.0, "h264", 25.0, 1920, 1080),
        &[
            NewScene { start_tc: 0.0, end_tc: 10.0 },
            NewScene { start_tc: 10.0, end_tc: 20.0 },
        ],
    );
    store
        .set_scene_transcript(scenes[0], "We should head to the HARBOR now")
        .unwrap();
    store.set_scene_transcript(scenes[1], "nothing here").unwrap();

    let q = fx.query();
    let hits = q
        .search(&[SearchFilter::DialogKeyword { query: "harbor".into() }], 200)
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, scenes[0]);
}

#[test]
fn semantic_dialog_falls_back_to_keyword_when_encoder_cold() {
    let fx = Fixture::new();
    let mut store = fx.store();
    let (_, scenes) = seed_file(
        &mut store,
        "/media/a.mp4",
        meta(10.0, "h264", 25.0, 1920, 1080),
        &[NewScene { start_tc: 0.0, end_tc: 10.0 }],
    );
    store
        .set_scene_transcript(scenes[0], "take the harbor road")
        .unwrap();

    // The sentence encoder was never loaded in this process, so the
    // clause degrades to the keyword match.
    let q = fx.query();
    let hits = q
        .search(
            &[SearchFilter::DialogSemantic { query: "harbor".into(), threshold: None }],
            200,
        )
        .unwrap();
    assert_eq!(hits.len(), 1);
}

#[test]
fn bad_thresholds_and_ranges_are_rejected() {
    let fx = Fixture::new();
    let q = fx.query();

    assert!(matches!(
        q.search(
            &[SearchFilter::VisualMatch { scene_id: 1, threshold: Some(1.5) }],
            200
        ),
        Err(IngestError::BadRequest(_))
    ));
    assert!(matches!(
        q.search(
            &[SearchFilter::DurationRange { min: Some(100.0), max: Some(1.0) }],
            200
        ),
        Err(IngestError::BadRequest(_))
    ));
}

#[test]
fn stats_and_vector_stats_report_coverage() {
    let fx = Fixture::new();
    let mut store = fx.store();
    let (_, scenes) = seed_file(
        &mut store,
        "/media/a.mp4",
        meta(60.0, "h264", 25.0, 1920, 1080),
        &[NewScene { start_tc: 0.0, end_tc: 60.0 }],
    );
    store
        .upsert_embedding(scenes[0], "clip", "ViT-B-32", &[1.0, 0.0])
        .unwrap();

    let q = fx.query();
    let stats = q.stats().unwrap();
    assert_eq!(stats.files, 1);
    assert_eq!(stats.scenes, 1);
    assert_eq!(stats.faces, 0);
    assert_eq!(stats.total_duration, 60.0);

    let vectors = q.vector_stats().unwrap();
    assert_eq!(vectors.total_scenes, 1);
    let clip = vectors
        .models
        .iter()
        .find(|m| m.model == "clip")
        .expect("clip coverage entry");
    assert_eq!(clip.found, 1);
    assert_eq!(clip.coverage, 100.0);
    assert_eq!(clip.scanned, 1);
}

#[test]
fn silent_scenes_count_as_scanned_but_empty() {
    let fx = Fixture::new();
    let mut store = fx.store();
    let (_, scenes) = seed_file(
        &mut store,
        "/media/a.mp4",
        meta(20.0, "h264", 25.0, 1920, 1080),
        &[
            NewScene { start_tc: 0.0, end_tc: 10.0 },
            NewScene { start_tc: 10.0, end_tc: 20.0 },
        ],
    );
    // One spoken scene, one silent; both were transcribed.
    store.set_scene_transcript(scenes[0], "hello world").unwrap();
    store.set_scene_transcript(scenes[1], "").unwrap();
    store
        .upsert_embedding(scenes[0], "transcript", "all-MiniLM-L6-v2", &[0.5; 4])
        .unwrap();
    // Both scenes face-scanned, neither produced faces.
    store.mark_scene_face_scanned(scenes[0]).unwrap();
    store.mark_scene_face_scanned(scenes[1]).unwrap();

    let q = fx.query();
    let vectors = q.vector_stats().unwrap();

    let transcript = vectors
        .models
        .iter()
        .find(|m| m.model == "transcript")
        .expect("transcript coverage entry");
    assert!(transcript.partial_expected);
    assert_eq!(transcript.found, 1);
    assert_eq!(transcript.empty, Some(1));

    let faces = vectors
        .models
        .iter()
        .find(|m| m.model == "arcface")
        .expect("faces coverage entry");
    assert_eq!(faces.found, 0);
    assert_eq!(faces.empty, Some(2));
}

#[test]
fn queue_snapshot_shows_current_job_stage() {
    let fx = Fixture::new();
    let store = fx.store();
    let file_id = store
        .insert_file("/media/a.mp4", "a.mp4", &Default::default())
        .unwrap();
    store.enqueue_file(file_id).unwrap();
    let job = store.claim_next_job(7).unwrap().unwrap();
    store.set_job_stage(job.id, "transcription", 5).unwrap();

    let q = fx.query();
    let snapshot = q.queue().unwrap();
    assert_eq!(snapshot.processing, 1);
    let current = snapshot.current.unwrap();
    assert_eq!(current.filename, "a.mp4");
    assert_eq!(current.current_stage.as_deref(), Some("transcription"));
    assert_eq!(current.current_stage_num, Some(5));
    assert_eq!(current.total_stages, Some(7));
}

#[test]
fn soft_deleted_files_vanish_from_results_until_purged() {
    let fx = Fixture::new();
    let mut store = fx.store();
    let (file_id, scenes) = seed_file(
        &mut store,
        "/media/a.mp4",
        meta(10.0, "h264", 25.0, 1920, 1080),
        &[NewScene { start_tc: 0.0, end_tc: 10.0 }],
    );
    store
        .upsert_embedding(scenes[0], "clip", "v1", &[1.0, 0.0])
        .unwrap();

    // Soft-delete via the missing-file pass.
    store
        .mark_missing_files(&std::collections::HashSet::new())
        .unwrap();

    let q = fx.query();
    assert_eq!(q.browse_scenes(40, 0).unwrap().total, 0);
    assert!(q
        .search(
            &[SearchFilter::VisualMatch { scene_id: scenes[0], threshold: Some(0.0) }],
            200
        )
        .unwrap()
        .is_empty());

    // Scenes are retained until purge, then cascade away.
    assert_eq!(store.count_scenes().unwrap(), 1);
    assert_eq!(q.purge_deleted_files().unwrap(), 1);
    assert_eq!(store.count_scenes().unwrap(), 0);
    assert!(store.get_file(file_id).unwrap().is_none());
}

#[test]
fn demo_mode_blocks_admin_actions() {
    let fx = Fixture::new();
    let q = QueryService::open(&fx.db_path).unwrap().with_demo_mode(true);

    assert!(!q.admin_status().admin_enabled);
    assert!(matches!(
        q.reset_failed_jobs(),
        Err(IngestError::BadRequest(_))
    ));
    assert!(matches!(q.wipe(), Err(IngestError::BadRequest(_))));

    // Reads still work.
    assert!(q.stats().is_ok());
}

#[test]
fn config_get_set_round_trip() {
    let fx = Fixture::new();
    let q = fx.query();

    assert!(matches!(
        q.get_config("poster_width"),
        Err(IngestError::NotFound(_))
    ));

    q.set_config("poster_width", &serde_json::json!(960)).unwrap();
    assert_eq!(q.get_config("poster_width").unwrap(), serde_json::json!(960));

    // The typed accessor sees the same value.
    assert_eq!(fx.store().poster_width().unwrap(), 960);
}
