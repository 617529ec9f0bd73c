//! Audio extraction for transcription.
//!
//! Decodes the file's audio track to 16 kHz mono f32 samples, the format
//! whisper.cpp consumes, streamed through ffmpeg's stdout.

use std::path::Path;
use std::process::Command;

use crate::error::{IngestError, IngestResult};

/// Extract the full audio track as 16 kHz mono f32 samples. A file with
/// no usable audio comes back as an empty vector rather than an error.
pub fn extract_samples(video_path: &Path) -> IngestResult<Vec<f32>> {
    let output = Command::new("ffmpeg")
        .arg("-i")
        .arg(video_path)
        .args([
            "-vn",
            "-acodec",
            "pcm_f32le",
            "-f",
            "f32le",
            "-ar",
            "16000",
            "-ac",
            "1",
            "-",
        ])
        .output()
        .map_err(|e| IngestError::StageTransient(format!("failed to run ffmpeg: {e}")))?;

    if !output.status.success() && output.stdout.is_empty() {
        // No audio stream decodes to nothing; that's a valid outcome.
        tracing::debug!(
            path = %video_path.display(),
            "Audio extraction produced no samples"
        );
        return Ok(Vec::new());
    }

    Ok(bytes_to_samples(&output.stdout))
}

fn bytes_to_samples(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| {
            let arr: [u8; 4] = chunk.try_into().unwrap();
            f32::from_le_bytes(arr)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_to_samples() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0.5f32.to_le_bytes());
        bytes.extend_from_slice(&(-1.0f32).to_le_bytes());
        assert_eq!(bytes_to_samples(&bytes), vec![0.5, -1.0]);
    }

    #[test]
    fn test_bytes_to_samples_drops_trailing_partial() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1.0f32.to_le_bytes());
        bytes.push(0xFF);
        assert_eq!(bytes_to_samples(&bytes), vec![1.0]);
    }
}
