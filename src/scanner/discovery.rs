//! Recursive discovery of video files under a watch root.

use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Recognized video extensions (lowercase, no dot). Only formats the
/// decoder can fully decode, not just demux; camera-raw formats that
/// need vendor SDKs are excluded.
pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mov", "m4v", "3gp", "3g2", // QuickTime/MP4
    "avi", // AVI
    "mkv", "webm", // Matroska
    "mxf", // MXF (broadcast)
    "wmv", "asf", // Windows Media
    "flv", // Flash Video
    "ts", "m2ts", "mts", // MPEG Transport Stream
    "mpg", "mpeg", "vob", // MPEG Program Stream
    "ogv", // Ogg Video
    "rm", "rmvb", // RealMedia
    "wtv", // Windows TV
    "dv", // DV
    "mj2", // Motion JPEG 2000
    "bik", "bk2", // Bink Video
];

/// Check whether a path carries a recognized video extension.
pub fn is_video_file(path: &Path) -> bool {
    match path.extension() {
        Some(ext) => {
            let ext_lower = ext.to_string_lossy().to_lowercase();
            VIDEO_EXTENSIONS.iter().any(|e| *e == ext_lower)
        }
        None => false,
    }
}

/// What discovery found under one root.
#[derive(Debug, Default)]
pub struct Discovered {
    pub videos: Vec<PathBuf>,
    pub dirs_scanned: u64,
}

/// Recursively enumerate `root`, collecting video files and counting
/// directories. Unreadable entries are skipped, never fatal. The
/// optional callback reports progress every 100 directories.
pub fn discover_videos(
    root: &Path,
    mut on_progress: Option<&mut dyn FnMut(u64, &Path)>,
) -> Discovered {
    let mut found = Discovered::default();

    if !root.exists() {
        tracing::warn!(root = %root.display(), "Watch folder not found");
        return found;
    }

    for entry in WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if entry.file_type().is_dir() {
            found.dirs_scanned += 1;
            if found.dirs_scanned % 100 == 0 {
                tracing::info!(
                    dirs = found.dirs_scanned,
                    videos = found.videos.len(),
                    "Discovery in progress"
                );
                if let Some(cb) = on_progress.as_mut() {
                    cb(found.dirs_scanned, path);
                }
            }
        } else if entry.file_type().is_file() && is_video_file(path) {
            found.videos.push(path.to_path_buf());
        }
    }

    // Stable ordering keeps scan classification deterministic.
    found.videos.sort();

    tracing::info!(
        root = %root.display(),
        dirs = found.dirs_scanned,
        videos = found.videos.len(),
        "Discovery complete"
    );
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use tempfile::tempdir;

    #[test]
    fn test_is_video_file() {
        assert!(is_video_file(Path::new("/media/clip.mp4")));
        assert!(is_video_file(Path::new("/media/CLIP.MKV")));
        assert!(is_video_file(Path::new("/media/tape.m2ts")));
        assert!(!is_video_file(Path::new("/media/readme.txt")));
        assert!(!is_video_file(Path::new("/media/image.jpg")));
        assert!(!is_video_file(Path::new("/media/noext")));
    }

    #[test]
    fn test_discover_recursive() {
        let dir = tempdir().unwrap();
        File::create(dir.path().join("a.mp4")).unwrap();
        File::create(dir.path().join("notes.txt")).unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        File::create(dir.path().join("sub/b.MOV")).unwrap();

        let found = discover_videos(dir.path(), None);
        assert_eq!(found.videos.len(), 2);
        assert!(found.dirs_scanned >= 2);
    }

    #[test]
    fn test_discover_missing_root() {
        let found = discover_videos(Path::new("/nonexistent/path"), None);
        assert!(found.videos.is_empty());
        assert_eq!(found.dirs_scanned, 0);
    }
}
