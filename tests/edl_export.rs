//! EDL export: structure and timecode round-trip.

use tempfile::TempDir;

use fennec::error::IngestError;
use fennec::query::edl::{smpte_to_seconds, EdlClip};
use fennec::query::QueryService;
use fennec::store::{NewScene, Store, VideoMeta};

fn seeded() -> (TempDir, QueryService, Vec<i64>, f64) {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("fennec.db");
    let mut store = Store::open(&db_path).unwrap();
    store.initialize().unwrap();

    let fps = 25.0;
    let file_id = store
        .insert_file("/media/feature.mp4", "feature.mp4", &Default::default())
        .unwrap();
    store
        .set_video_meta(
            file_id,
            &VideoMeta {
                duration_seconds: Some(120.0),
                fps: Some(fps),
                ..Default::default()
            },
        )
        .unwrap();
    let scene_ids = store
        .replace_scenes(
            file_id,
            &[
                NewScene { start_tc: 0.0, end_tc: 40.0 },
                NewScene { start_tc: 40.0, end_tc: 90.5 },
                NewScene { start_tc: 90.5, end_tc: 120.0 },
            ],
        )
        .unwrap();
    drop(store);

    let q = QueryService::open(&db_path).unwrap();
    (dir, q, scene_ids, fps)
}

#[test]
fn export_structure() {
    let (_dir, q, scene_ids, _) = seeded();
    let clips = vec![
        EdlClip { scene_id: scene_ids[0], in_tc: 0.0, out_tc: 40.0 },
        EdlClip { scene_id: scene_ids[1], in_tc: 40.0, out_tc: 90.5 },
    ];

    let edl = q.export_edl(&clips, "Fennec Export").unwrap();

    assert!(edl.starts_with("TITLE: Fennec Export"));
    assert!(edl.contains("FCM: NON-DROP FRAME"));
    assert!(edl.contains("001  AX       V     C        "));
    assert!(edl.contains("002  AX       V     C        "));
    assert!(edl.contains("* FROM CLIP NAME: feature.mp4"));
}

#[test]
fn record_track_is_contiguous() {
    let (_dir, q, scene_ids, fps) = seeded();
    let clips = vec![
        EdlClip { scene_id: scene_ids[0], in_tc: 10.0, out_tc: 20.0 },
        EdlClip { scene_id: scene_ids[1], in_tc: 50.0, out_tc: 65.0 },
    ];

    let edl = q.export_edl(&clips, "Test").unwrap();
    let events: Vec<Vec<&str>> = edl
        .lines()
        .filter(|l| l.contains("AX"))
        .map(|l| l.split_whitespace().collect())
        .collect();

    // Event line tail: src_in src_out rec_in rec_out.
    let first_rec_out = events[0][events[0].len() - 1];
    let second_rec_in = events[1][events[1].len() - 2];
    assert_eq!(first_rec_out, second_rec_in);

    // First record-in is zero.
    let first_rec_in = events[0][events[0].len() - 2];
    assert_eq!(smpte_to_seconds(first_rec_in, fps).unwrap(), 0.0);
}

#[test]
fn timecodes_round_trip_within_one_frame() {
    let (_dir, q, scene_ids, fps) = seeded();
    let clips = vec![
        EdlClip { scene_id: scene_ids[0], in_tc: 3.21, out_tc: 17.77 },
        EdlClip { scene_id: scene_ids[1], in_tc: 41.0, out_tc: 88.88 },
        EdlClip { scene_id: scene_ids[2], in_tc: 91.3, out_tc: 119.96 },
    ];

    let edl = q.export_edl(&clips, "Round Trip").unwrap();
    let events: Vec<Vec<String>> = edl
        .lines()
        .filter(|l| l.contains("AX"))
        .map(|l| l.split_whitespace().map(String::from).collect())
        .collect();
    assert_eq!(events.len(), clips.len());

    let frame = 1.0 / fps;
    for (event, clip) in events.iter().zip(&clips) {
        let src_in = smpte_to_seconds(&event[event.len() - 4], fps).unwrap();
        let src_out = smpte_to_seconds(&event[event.len() - 3], fps).unwrap();
        assert!((src_in - clip.in_tc).abs() <= frame, "{src_in} vs {}", clip.in_tc);
        assert!((src_out - clip.out_tc).abs() <= frame, "{src_out} vs {}", clip.out_tc);
    }
}

#[test]
fn invalid_requests_are_rejected() {
    let (_dir, q, scene_ids, _) = seeded();

    assert!(matches!(
        q.export_edl(&[], "Empty"),
        Err(IngestError::BadRequest(_))
    ));

    assert!(matches!(
        q.export_edl(
            &[EdlClip { scene_id: 987654, in_tc: 0.0, out_tc: 1.0 }],
            "Missing"
        ),
        Err(IngestError::NotFound(_))
    ));

    assert!(matches!(
        q.export_edl(
            &[EdlClip { scene_id: scene_ids[0], in_tc: 10.0, out_tc: 5.0 }],
            "Backwards"
        ),
        Err(IngestError::BadRequest(_))
    ));
}
