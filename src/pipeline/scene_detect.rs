//! Content-based scene detection via ffmpeg's scdet filter.
//!
//! The filter emits a score and timestamp per candidate cut on stderr;
//! cuts at or above the threshold become scene boundaries. Boundaries
//! are turned into an ordered, non-overlapping cover of [0, duration).

use std::path::Path;
use std::process::Command;

use crate::error::{IngestError, IngestResult};
use crate::store::NewScene;

/// Detect scene intervals covering `[0, duration)`.
///
/// `threshold` is on the 0-100 sensitivity scale (lower = more cuts);
/// ffmpeg's scdet wants 0-1. A video with no detected cuts comes back
/// as a single scene spanning the whole duration.
pub fn detect_scenes(
    video_path: &Path,
    duration: f64,
    threshold: f64,
) -> IngestResult<Vec<NewScene>> {
    if !video_path.exists() {
        return Err(IngestError::MissingFile(video_path.display().to_string()));
    }

    let output = Command::new("ffmpeg")
        .arg("-i")
        .arg(video_path)
        .arg("-vf")
        .arg(format!("scdet=t={}:s=1", threshold / 100.0))
        .arg("-an")
        .arg("-f")
        .arg("null")
        .arg("-")
        .output()
        .map_err(|e| IngestError::StageTransient(format!("failed to run ffmpeg: {e}")))?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    let mut cuts: Vec<f64> = Vec::new();

    for line in stderr.lines() {
        if line.contains("lavfi.scd.score") && line.contains("lavfi.scd.time") {
            if let Some((score, time)) = parse_scdet_line(line) {
                if score >= threshold && time > 0.0 && time < duration {
                    cuts.push(time);
                }
            }
        }
    }

    cuts.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    cuts.dedup();

    Ok(boundaries_to_scenes(&cuts, duration))
}

/// Convert cut timestamps into the interval cover. End times are
/// exclusive; each boundary ends one scene and starts the next.
pub fn boundaries_to_scenes(cuts: &[f64], duration: f64) -> Vec<NewScene> {
    let mut scenes = Vec::with_capacity(cuts.len() + 1);
    let mut start = 0.0;

    for &cut in cuts {
        if cut <= start || cut >= duration {
            continue;
        }
        scenes.push(NewScene { start_tc: start, end_tc: cut });
        start = cut;
    }
    scenes.push(NewScene { start_tc: start, end_tc: duration });

    scenes
}

/// Parse one scdet stderr line:
/// `[scdet @ 0x...] lavfi.scd.score: 1.234, lavfi.scd.time: 5.678`
/// Returns `(score_on_0_100_scale, time_seconds)`.
fn parse_scdet_line(line: &str) -> Option<(f64, f64)> {
    let score_start = line.find("lavfi.scd.score: ")? + "lavfi.scd.score: ".len();
    let score_end = line[score_start..].find(',')?;
    let score: f64 = line[score_start..score_start + score_end].trim().parse().ok()?;

    let time_start = line.find("lavfi.scd.time: ")? + "lavfi.scd.time: ".len();
    let time_str = line[time_start..].split_whitespace().next()?;
    let time: f64 = time_str.parse().ok()?;

    // scdet reports scores on the 0-100 scale already.
    Some((score, time))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scdet_line() {
        let line = "[scdet @ 0x600003a3bc00] lavfi.scd.score: 34.793, lavfi.scd.time: 7.433333";
        let (score, time) = parse_scdet_line(line).unwrap();
        assert!((score - 34.793).abs() < 0.001);
        assert!((time - 7.433333).abs() < 0.001);
    }

    #[test]
    fn test_parse_scdet_line_with_trailing_text() {
        let line =
            "[scdet @ 0x1] lavfi.scd.score: 41.094, lavfi.scd.time: 8.883333 frame= 123";
        let (score, time) = parse_scdet_line(line).unwrap();
        assert!((score - 41.094).abs() < 0.001);
        assert!((time - 8.883333).abs() < 0.001);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_scdet_line("frame= 100 fps= 30").is_none());
    }

    #[test]
    fn test_no_cuts_single_scene() {
        let scenes = boundaries_to_scenes(&[], 60.0);
        assert_eq!(scenes, vec![NewScene { start_tc: 0.0, end_tc: 60.0 }]);
    }

    #[test]
    fn test_cover_is_contiguous() {
        let scenes = boundaries_to_scenes(&[10.0, 42.5], 60.0);
        assert_eq!(scenes.len(), 3);
        assert_eq!(scenes[0], NewScene { start_tc: 0.0, end_tc: 10.0 });
        assert_eq!(scenes[1], NewScene { start_tc: 10.0, end_tc: 42.5 });
        assert_eq!(scenes[2], NewScene { start_tc: 42.5, end_tc: 60.0 });

        // Strictly ordered, non-overlapping, covering [0, duration).
        for pair in scenes.windows(2) {
            assert_eq!(pair[0].end_tc, pair[1].start_tc);
            assert!(pair[0].start_tc < pair[0].end_tc);
        }
    }

    #[test]
    fn test_out_of_range_cuts_dropped() {
        let scenes = boundaries_to_scenes(&[0.0, 70.0, 30.0], 60.0);
        assert_eq!(scenes.len(), 2);
        assert_eq!(scenes[0], NewScene { start_tc: 0.0, end_tc: 30.0 });
        assert_eq!(scenes[1], NewScene { start_tc: 30.0, end_tc: 60.0 });
    }
}
