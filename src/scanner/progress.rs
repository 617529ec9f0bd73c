//! Scan progress published for the Reports UI.
//!
//! Progress lives in the config table so the read-side process can show
//! what the scanner is doing. It is ephemeral: reset to idle whenever
//! the ingest process starts.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::store::settings::KEY_SCAN_PROGRESS;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPhase {
    Idle,
    Discovering,
    Processing,
    CheckingMissing,
    Complete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanProgress {
    pub phase: ScanPhase,
    pub current_folder: Option<String>,
    pub dirs_scanned: u64,
    pub files_found: u64,
    pub files_processed: u64,
    pub files_new: u64,
    pub files_updated: u64,
    pub files_skipped: u64,
    pub updated_at: String,
}

impl ScanProgress {
    pub fn idle() -> Self {
        Self {
            phase: ScanPhase::Idle,
            current_folder: None,
            dirs_scanned: 0,
            files_found: 0,
            files_processed: 0,
            files_new: 0,
            files_updated: 0,
            files_skipped: 0,
            updated_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

pub fn publish(store: &Store, progress: &ScanProgress) -> Result<()> {
    let mut stamped = progress.clone();
    stamped.updated_at = chrono::Utc::now().to_rfc3339();
    store.set_config_value(KEY_SCAN_PROGRESS, &stamped)
}

pub fn clear(store: &Store) -> Result<()> {
    publish(store, &ScanProgress::idle())
}

pub fn read(store: &Store) -> Result<ScanProgress> {
    store.get_config_or(KEY_SCAN_PROGRESS, ScanProgress::idle())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_and_read() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(read(&store).unwrap().phase, ScanPhase::Idle);

        let mut progress = ScanProgress::idle();
        progress.phase = ScanPhase::Discovering;
        progress.current_folder = Some("/media".into());
        progress.dirs_scanned = 12;
        publish(&store, &progress).unwrap();

        let back = read(&store).unwrap();
        assert_eq!(back.phase, ScanPhase::Discovering);
        assert_eq!(back.dirs_scanned, 12);
        assert_eq!(back.current_folder.as_deref(), Some("/media"));

        clear(&store).unwrap();
        assert_eq!(read(&store).unwrap().phase, ScanPhase::Idle);
    }
}
