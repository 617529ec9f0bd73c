//! The scanner: reconciles the files table with the watch folders.
//!
//! A scan runs in phases (discovering, processing, checking_missing,
//! complete), publishing progress throughout. Probing with the decoder
//! is deferred to the enrichment pipeline so scans stay fast even on
//! network mounts.

pub mod discovery;
pub mod probe;
pub mod progress;

use anyhow::Result;
use std::collections::HashSet;
use std::path::Path;

use crate::store::settings::{KEY_LAST_SCAN_AT, KEY_LAST_SCAN_DURATION_MS};
use crate::store::{FsMeta, Store};

pub use discovery::{discover_videos, is_video_file, VIDEO_EXTENSIONS};
pub use progress::{ScanPhase, ScanProgress};

/// Counters for one completed scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    pub found: u64,
    pub new: u64,
    pub updated: u64,
    pub skipped: u64,
    pub missing: u64,
}

/// How one discovered file was classified against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Classification {
    New,
    Updated,
    Skipped,
}

pub struct Scanner<'a> {
    store: &'a mut Store,
}

impl<'a> Scanner<'a> {
    pub fn new(store: &'a mut Store) -> Self {
        Self { store }
    }

    /// Run a full scan of all configured watch folders.
    pub fn run_scan(&mut self) -> Result<ScanOutcome> {
        let started = std::time::Instant::now();
        let watch_folders = self.store.watch_folders()?;

        if watch_folders.is_empty() {
            tracing::warn!("No watch folders configured");
            progress::clear(self.store)?;
            return Ok(ScanOutcome::default());
        }

        // Phase 1: discover video files (no decoder involved).
        let mut all_videos = Vec::new();
        let mut dirs_scanned = 0u64;
        for folder in &watch_folders {
            tracing::info!(folder = %folder, "Discovering videos");
            let mut report = ScanProgress::idle();
            report.phase = ScanPhase::Discovering;
            report.current_folder = Some(folder.clone());
            report.dirs_scanned = dirs_scanned;
            report.files_found = all_videos.len() as u64;
            progress::publish(self.store, &report)?;

            let found = discovery::discover_videos(Path::new(folder), None);
            dirs_scanned += found.dirs_scanned;
            all_videos.extend(found.videos);
        }

        let mut outcome = ScanOutcome {
            found: all_videos.len() as u64,
            ..Default::default()
        };

        // Phase 2: classify each discovered file against the store.
        let mut seen: HashSet<String> = HashSet::with_capacity(all_videos.len());
        for (i, path) in all_videos.iter().enumerate() {
            let path_str = path.to_string_lossy().to_string();
            seen.insert(path_str.clone());

            match self.classify_and_apply(path) {
                Ok(Classification::New) => outcome.new += 1,
                Ok(Classification::Updated) => outcome.updated += 1,
                Ok(Classification::Skipped) => outcome.skipped += 1,
                Err(e) => {
                    // Per-file errors never abort the scan.
                    tracing::warn!(path = %path.display(), error = %e, "Skipping file");
                    outcome.skipped += 1;
                }
            }

            if (i + 1) % 10 == 0 || i + 1 == all_videos.len() {
                let mut report = ScanProgress::idle();
                report.phase = ScanPhase::Processing;
                report.dirs_scanned = dirs_scanned;
                report.files_found = outcome.found;
                report.files_processed = (i + 1) as u64;
                report.files_new = outcome.new;
                report.files_updated = outcome.updated;
                report.files_skipped = outcome.skipped;
                progress::publish(self.store, &report)?;
            }
        }

        // Phase 3: soft-delete rows whose paths were not seen.
        let mut report = ScanProgress::idle();
        report.phase = ScanPhase::CheckingMissing;
        report.files_found = outcome.found;
        report.files_processed = outcome.found;
        report.files_new = outcome.new;
        report.files_updated = outcome.updated;
        report.files_skipped = outcome.skipped;
        progress::publish(self.store, &report)?;

        let marked = self.store.mark_missing_files(&seen)?;
        outcome.missing = marked.len() as u64;
        if !marked.is_empty() {
            tracing::info!(count = marked.len(), "Marked missing files as deleted");
        }

        // Phase 4: record scan metadata and publish final counters.
        let duration_ms = started.elapsed().as_millis() as u64;
        self.store
            .set_config_value(KEY_LAST_SCAN_AT, &chrono::Utc::now().to_rfc3339())?;
        self.store
            .set_config_value(KEY_LAST_SCAN_DURATION_MS, &duration_ms)?;

        report.phase = ScanPhase::Complete;
        progress::publish(self.store, &report)?;

        tracing::info!(
            duration_ms,
            found = outcome.found,
            new = outcome.new,
            updated = outcome.updated,
            skipped = outcome.skipped,
            missing = outcome.missing,
            "Scan complete"
        );

        Ok(outcome)
    }

    /// Classify one on-disk file against the store and apply the result.
    fn classify_and_apply(&mut self, path: &Path) -> Result<Classification> {
        let path_str = path.to_string_lossy().to_string();
        let fs = probe::probe_fs(path)?;

        let existing = self.store.get_file_by_path(&path_str)?;
        let Some(file) = existing else {
            // Absent in store: insert with filesystem metadata, enqueue.
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path_str.clone());
            let file_id = self.store.insert_file(&path_str, &filename, &fs)?;
            self.store.enqueue_file(file_id)?;
            tracing::info!(path = %path.display(), "New file");
            return Ok(Classification::New);
        };

        let changed = file_changed(&file.file_modified_at, file.file_size_bytes, &fs);

        if file.deleted_at.is_some() {
            // Reappeared after soft delete: resurrect and re-enqueue.
            tracing::info!(path = %path.display(), "Resurrecting previously deleted file");
            self.store.resurrect_file(file.id)?;
            if changed {
                self.store.mark_file_updated(file.id, &fs)?;
                self.store.clear_enrichment(file.id)?;
                self.store.enqueue_file(file.id)?;
                return Ok(Classification::Updated);
            }
            self.store.enqueue_file(file.id)?;
            return Ok(Classification::New);
        }

        if changed {
            // Modified on disk: refresh metadata, drop stale artifacts,
            // re-queue for enrichment.
            tracing::info!(path = %path.display(), "Modified file, re-queuing");
            self.store.mark_file_updated(file.id, &fs)?;
            self.store.clear_enrichment(file.id)?;
            self.store.enqueue_file(file.id)?;
            return Ok(Classification::Updated);
        }

        Ok(Classification::Skipped)
    }
}

/// Whether the on-disk (size, mtime) differ from the stored pair. The
/// mtime comparison allows one second of filesystem precision slack.
fn file_changed(db_mtime: &Option<String>, db_size: Option<i64>, fs: &FsMeta) -> bool {
    if let Some(db_size) = db_size {
        if db_size != fs.file_size_bytes {
            return true;
        }
    }

    match (db_mtime, &fs.file_modified_at) {
        (Some(db), Some(current)) => {
            let parsed = (
                chrono::DateTime::parse_from_rfc3339(db),
                chrono::DateTime::parse_from_rfc3339(current),
            );
            match parsed {
                (Ok(db), Ok(current)) => (current - db).num_seconds().abs() > 1,
                _ => db != current,
            }
        }
        (None, Some(_)) => true,
        _ => false,
    }
}
