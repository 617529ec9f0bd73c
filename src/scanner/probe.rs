//! Media probing via ffprobe.
//!
//! The decoder is treated as a black box behind subprocess calls; this
//! module only shapes its JSON output into [`VideoMeta`] and reads the
//! filesystem metadata the scan phase needs.

use std::path::Path;
use std::process::Command;

use crate::error::{IngestError, IngestResult};
use crate::store::{FsMeta, VideoMeta};

/// Extract filesystem metadata for a file: size, timestamps, parent
/// folder name.
pub fn probe_fs(path: &Path) -> IngestResult<FsMeta> {
    let meta = std::fs::metadata(path)?;

    let to_rfc3339 = |t: std::io::Result<std::time::SystemTime>| {
        t.ok()
            .map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339())
    };

    Ok(FsMeta {
        file_size_bytes: meta.len() as i64,
        file_created_at: to_rfc3339(meta.created()),
        file_modified_at: to_rfc3339(meta.modified()),
        parent_folder: path
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string()),
    })
}

/// Probe video metadata with ffprobe. A missing duration means the
/// decoder could not make sense of the file.
pub fn probe_video(path: &Path) -> IngestResult<VideoMeta> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,r_frame_rate,codec_name,pix_fmt,color_space,color_transfer,color_primaries",
            "-show_entries",
            "format=duration",
            "-of",
            "json",
        ])
        .arg(path)
        .output()
        .map_err(|e| IngestError::StageTransient(format!("failed to run ffprobe: {e}")))?;

    let data: serde_json::Value = serde_json::from_slice(&output.stdout)
        .map_err(|e| IngestError::UnreadableMedia(format!("ffprobe output unparsable: {e}")))?;

    let mut meta = VideoMeta::default();

    if let Some(duration) = data
        .pointer("/format/duration")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<f64>().ok())
    {
        meta.duration_seconds = Some(duration);
    }

    if let Some(stream) = data.pointer("/streams/0") {
        meta.width = stream.get("width").and_then(|v| v.as_i64());
        meta.height = stream.get("height").and_then(|v| v.as_i64());
        meta.codec = stream
            .get("codec_name")
            .and_then(|v| v.as_str())
            .map(String::from);
        meta.fps = stream
            .get("r_frame_rate")
            .and_then(|v| v.as_str())
            .and_then(parse_frame_rate);
        meta.pix_fmt = stream
            .get("pix_fmt")
            .and_then(|v| v.as_str())
            .map(String::from);
        meta.color_space = stream
            .get("color_space")
            .and_then(|v| v.as_str())
            .map(String::from);
        meta.color_transfer = stream
            .get("color_transfer")
            .and_then(|v| v.as_str())
            .map(String::from);
        meta.color_primaries = stream
            .get("color_primaries")
            .and_then(|v| v.as_str())
            .map(String::from);
    }

    meta.audio_tracks = Some(count_audio_tracks(path)?);

    Ok(meta)
}

/// Count audio streams in the file.
fn count_audio_tracks(path: &Path) -> IngestResult<i64> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "a",
            "-show_entries",
            "stream=index",
            "-of",
            "csv=p=0",
        ])
        .arg(path)
        .output()
        .map_err(|e| IngestError::StageTransient(format!("failed to run ffprobe: {e}")))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().filter(|l| !l.trim().is_empty()).count() as i64)
}

/// Parse an ffprobe rational frame rate like "30000/1001" or "25/1".
fn parse_frame_rate(s: &str) -> Option<f64> {
    if let Some((num, den)) = s.split_once('/') {
        let num: f64 = num.parse().ok()?;
        let den: f64 = den.parse().ok()?;
        if den > 0.0 {
            // Three decimals matches how rates like 29.97 are displayed.
            return Some((num / den * 1000.0).round() / 1000.0);
        }
        return None;
    }
    s.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frame_rate() {
        assert_eq!(parse_frame_rate("25/1"), Some(25.0));
        assert_eq!(parse_frame_rate("30000/1001"), Some(29.97));
        assert_eq!(parse_frame_rate("24"), Some(24.0));
        assert_eq!(parse_frame_rate("30/0"), None);
        assert_eq!(parse_frame_rate("garbage"), None);
    }

    #[test]
    fn test_probe_fs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clips").join("a.mp4");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"0123456789").unwrap();

        let meta = probe_fs(&path).unwrap();
        assert_eq!(meta.file_size_bytes, 10);
        assert!(meta.file_modified_at.is_some());
        assert_eq!(meta.parent_folder.as_deref(), Some("clips"));
    }

    #[test]
    fn test_probe_fs_missing_file() {
        assert!(probe_fs(Path::new("/nonexistent/clip.mp4")).is_err());
    }
}
