//! Poster frame extraction.
//!
//! One frame per scene, decoded at the interval midpoint, scaled to the
//! configured width (aspect preserved, even height) and written as a
//! web-quality image. Filenames derive from the global scene id and are
//! never overwritten once written.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{IngestError, IngestResult};

/// Poster output settings from config.
#[derive(Debug, Clone)]
pub struct PosterSettings {
    pub width: u32,
    pub quality: u32,
    pub format: String,
}

impl Default for PosterSettings {
    fn default() -> Self {
        Self {
            width: 1280,
            quality: 80,
            format: "webp".to_string(),
        }
    }
}

/// The poster path for a scene id under `posters_dir`.
pub fn poster_path(posters_dir: &Path, scene_id: i64, format: &str) -> PathBuf {
    posters_dir.join(format!("scene_{scene_id}.{format}"))
}

/// The midpoint of a scene interval, backed off by one frame so the
/// decoded frame can't land in the next scene.
pub fn midpoint(start_tc: f64, end_tc: f64, fps: f64) -> f64 {
    let frame_duration = if fps > 0.0 { 1.0 / fps } else { 0.0 };
    ((start_tc + end_tc - frame_duration) / 2.0).max(start_tc)
}

/// Decode the frame at `timecode` and write it as a poster. Returns the
/// output path on success.
pub fn extract_frame(
    video_path: &Path,
    timecode: f64,
    output_path: &Path,
    settings: &PosterSettings,
) -> IngestResult<()> {
    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // -2 keeps the height even, which some encoders require.
    let scale_filter = format!("scale={}:-2", settings.width);

    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-y")
        .arg("-ss")
        .arg(format!("{timecode}"))
        .arg("-i")
        .arg(video_path)
        .args(["-frames:v", "1", "-vf"])
        .arg(&scale_filter);

    if settings.format.eq_ignore_ascii_case("webp") {
        cmd.args(["-quality", &settings.quality.to_string()]);
    } else {
        cmd.args(["-q:v", "2"]);
    }

    let output = cmd
        .arg(output_path)
        .output()
        .map_err(|e| IngestError::StageTransient(format!("failed to run ffmpeg: {e}")))?;

    if !output_path.exists() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(IngestError::StageTransient(format!(
            "poster extraction produced no file: {}",
            stderr.lines().last().unwrap_or("unknown ffmpeg error")
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poster_path_from_scene_id() {
        let path = poster_path(Path::new("/posters"), 42, "webp");
        assert_eq!(path, PathBuf::from("/posters/scene_42.webp"));
    }

    #[test]
    fn test_midpoint_backs_off_one_frame() {
        // 25 fps -> frame duration 0.04s
        let mid = midpoint(0.0, 10.0, 25.0);
        assert!((mid - 4.98).abs() < 0.0001);

        // Never before the scene start, even for tiny scenes.
        assert_eq!(midpoint(5.0, 5.01, 25.0), 5.0);

        // Zero fps degrades to the plain midpoint.
        assert!((midpoint(0.0, 10.0, 0.0) - 5.0).abs() < 0.0001);
    }
}
