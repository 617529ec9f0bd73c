//! EDL export.
//!
//! Emits a CMX-3600-style edit list from an ordered set of scene clips,
//! with non-drop `HH:MM:SS:FF` timecodes at each clip's frame rate.

use anyhow::Result;

use crate::error::IngestError;
use crate::store::Store;

/// Frame rate assumed when a file was probed without one.
const FALLBACK_FPS: f64 = 29.97;

/// One clip in an export request: a scene with in/out points in seconds.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct EdlClip {
    pub scene_id: i64,
    pub in_tc: f64,
    pub out_tc: f64,
}

/// Convert seconds to SMPTE non-drop timecode (HH:MM:SS:FF).
pub fn seconds_to_smpte(seconds: f64, fps: f64) -> String {
    let fps_int = fps.round().max(1.0) as i64;
    let total_frames = (seconds * fps).round() as i64;
    let frames = total_frames % fps_int;
    let total_seconds = total_frames / fps_int;
    let secs = total_seconds % 60;
    let total_minutes = total_seconds / 60;
    let mins = total_minutes % 60;
    let hours = total_minutes / 60;
    format!("{hours:02}:{mins:02}:{secs:02}:{frames:02}")
}

/// Parse an SMPTE non-drop timecode back to seconds.
pub fn smpte_to_seconds(tc: &str, fps: f64) -> Option<f64> {
    let parts: Vec<&str> = tc.split(':').collect();
    if parts.len() != 4 {
        return None;
    }
    let hours: i64 = parts[0].parse().ok()?;
    let mins: i64 = parts[1].parse().ok()?;
    let secs: i64 = parts[2].parse().ok()?;
    let frames: i64 = parts[3].parse().ok()?;

    let fps_int = fps.round().max(1.0) as i64;
    let total_frames = ((hours * 3600 + mins * 60 + secs) * fps_int) + frames;
    Some(total_frames as f64 / fps)
}

/// Generate EDL text for the given clips, in order. Clips referencing
/// unknown scenes are rejected.
pub fn generate(store: &Store, clips: &[EdlClip], title: &str) -> Result<String, IngestError> {
    if clips.is_empty() {
        return Err(IngestError::BadRequest("no scenes provided".into()));
    }

    let mut lines = vec![
        format!("TITLE: {title}"),
        "FCM: NON-DROP FRAME".to_string(),
        String::new(),
    ];

    let mut record_in = 0.0f64;

    for (idx, clip) in clips.iter().enumerate() {
        let scene = store
            .get_scene(clip.scene_id)
            .map_err(|e| IngestError::StageTransient(e.to_string()))?
            .ok_or_else(|| IngestError::NotFound(format!("scene {}", clip.scene_id)))?;
        let file = store
            .get_file(scene.file_id)
            .map_err(|e| IngestError::StageTransient(e.to_string()))?
            .ok_or_else(|| IngestError::NotFound(format!("file {}", scene.file_id)))?;

        if clip.out_tc <= clip.in_tc {
            return Err(IngestError::BadRequest(format!(
                "scene {}: out point must be after in point",
                clip.scene_id
            )));
        }

        let fps = file.fps.unwrap_or(FALLBACK_FPS);
        let duration = clip.out_tc - clip.in_tc;
        let record_out = record_in + duration;

        let src_in = seconds_to_smpte(clip.in_tc, fps);
        let src_out = seconds_to_smpte(clip.out_tc, fps);
        let rec_in = seconds_to_smpte(record_in, fps);
        let rec_out = seconds_to_smpte(record_out, fps);

        // Event line: event# reel channel transition src_in src_out rec_in rec_out
        lines.push(format!(
            "{:03}  AX       V     C        {src_in} {src_out} {rec_in} {rec_out}",
            idx + 1
        ));
        lines.push(format!("* FROM CLIP NAME: {}", file.filename));
        lines.push(String::new());

        record_in = record_out;
    }

    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seconds_to_smpte() {
        assert_eq!(seconds_to_smpte(0.0, 25.0), "00:00:00:00");
        assert_eq!(seconds_to_smpte(1.0, 25.0), "00:00:01:00");
        assert_eq!(seconds_to_smpte(1.5, 24.0), "00:00:01:12");
        assert_eq!(seconds_to_smpte(3661.0, 25.0), "01:01:01:00");
    }

    #[test]
    fn test_smpte_round_trip_within_one_frame() {
        for fps in [24.0, 25.0, 29.97, 30.0] {
            for seconds in [0.0, 0.5, 1.04, 59.99, 61.3, 3599.9] {
                let tc = seconds_to_smpte(seconds, fps);
                let back = smpte_to_seconds(&tc, fps).unwrap();
                assert!(
                    (back - seconds).abs() <= 1.0 / fps + 1e-9,
                    "fps {fps}: {seconds} -> {tc} -> {back}"
                );
            }
        }
    }

    #[test]
    fn test_smpte_parse_rejects_malformed() {
        assert!(smpte_to_seconds("00:00:00", 25.0).is_none());
        assert!(smpte_to_seconds("aa:bb:cc:dd", 25.0).is_none());
    }
}
