//! The ingest process loop.
//!
//! Two cooperating long-running tasks on their own threads: a scan task
//! polling the watch folders, and a pipeline task draining the queue
//! one job at a time, with a clustering pass after ingest activity.
//! The tasks share no memory; each opens its own store handle and
//! coordinates through the database alone. Pause/resume and the poll
//! interval are read from the config table so the Reports UI can flip
//! them live; sleeps happen in small ticks so changes are noticed
//! promptly.

use anyhow::Result;
use std::time::{Duration, Instant};

use crate::cluster;
use crate::config::Config;
use crate::pipeline::{JobOutcome, Pipeline};
use crate::scanner::{progress, Scanner};
use crate::store::Store;

/// Sync the WATCH_FOLDERS environment variable into config at startup.
/// A comma-separated list of absolute paths; empty means leave whatever
/// config already holds.
pub fn sync_watch_folders_from_env(store: &Store) -> Result<()> {
    let Ok(env_folders) = std::env::var("WATCH_FOLDERS") else {
        return Ok(());
    };

    let folders: Vec<String> = env_folders
        .split(',')
        .map(|f| f.trim().to_string())
        .filter(|f| !f.is_empty())
        .collect();

    if !folders.is_empty() {
        store.set_config_value(crate::store::settings::KEY_WATCH_FOLDERS, &folders)?;
        tracing::info!(folders = ?folders, "Watch folders from environment");
    }
    Ok(())
}

/// What one drain pass did.
#[derive(Debug, Default, Clone, Copy)]
pub struct DrainOutcome {
    pub processed: usize,
    pub failed: usize,
    pub deferred: usize,
}

pub struct Scheduler {
    config: Config,
    store: Store,
}

impl Scheduler {
    pub fn new(config: Config) -> Result<Self> {
        let store = Store::open(&config.db_path)?;
        store.initialize()?;
        Ok(Self { config, store })
    }

    /// Startup recovery: progress back to idle, jobs orphaned by a
    /// previous crash back to pending.
    pub fn recover(&mut self) -> Result<()> {
        progress::clear(&self.store)?;

        let stuck = self
            .store
            .reset_stuck_jobs(self.config.ingest.stuck_job_timeout_minutes as i64)?;
        let orphaned = self.store.reset_processing_jobs()?;
        if stuck + orphaned > 0 {
            tracing::info!(
                recovered = stuck + orphaned,
                "Recovered jobs from previous run"
            );
        }
        Ok(())
    }

    /// Run the ingest service: scan task and pipeline task on parallel
    /// threads, coordinating only through the store. With `once`, run a
    /// single sequential scan + drain cycle instead and return.
    pub fn run(&mut self, once: bool) -> Result<()> {
        sync_watch_folders_from_env(&self.store)?;
        self.recover()?;

        let file_count = self.store.count_files()?;
        tracing::info!(files = file_count, "Ingest service started");

        if once {
            let mut store = Store::open(&self.config.db_path)?;
            run_scan_pass(&mut store);
            let outcome = drain_queue(&self.config, &mut store);
            tracing::info!(
                processed = outcome.processed,
                failed = outcome.failed,
                deferred = outcome.deferred,
                "Single-shot cycle complete"
            );
            if outcome.processed > 0 {
                run_cluster_pass(&store);
            }
            return Ok(());
        }

        std::thread::scope(|scope| {
            let scan_config = self.config.clone();
            scope.spawn(move || scan_task(scan_config));

            let pipeline_config = self.config.clone();
            scope.spawn(move || pipeline_task(pipeline_config));
        });

        Ok(())
    }
}

/// The scan task: one full scan per poll interval while running.
fn scan_task(config: Config) {
    let mut store = match Store::open(&config.db_path) {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "Scan task could not open store");
            return;
        }
    };

    let tick = Duration::from_secs(config.ingest.tick_seconds.max(1));

    loop {
        match store.indexer_state() {
            Ok(state) if state == "paused" => {
                std::thread::sleep(tick);
                continue;
            }
            Err(e) => {
                tracing::error!(error = %e, "Scan task could not read indexer state");
                std::thread::sleep(tick);
                continue;
            }
            _ => {}
        }

        run_scan_pass(&mut store);

        let poll_interval = store.poll_interval_seconds().unwrap_or(3600);
        tracing::info!(seconds = poll_interval, "Next scan scheduled");
        sleep_responsive(&store, Duration::from_secs(poll_interval), tick);
    }
}

fn run_scan_pass(store: &mut Store) {
    tracing::info!("Scanning watch folders");
    match Scanner::new(store).run_scan() {
        Ok(scan) => {
            tracing::info!(
                found = scan.found,
                new = scan.new,
                updated = scan.updated,
                skipped = scan.skipped,
                missing = scan.missing,
                "Scan finished"
            );
        }
        Err(e) => {
            // Scan problems never take the service down.
            tracing::error!(error = %e, "Scan failed");
        }
    }
}

/// The pipeline task: drain the queue whenever jobs are pending, then
/// cluster what the drain produced.
fn pipeline_task(config: Config) {
    let mut store = match Store::open(&config.db_path) {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "Pipeline task could not open store");
            return;
        }
    };

    let tick = Duration::from_secs(config.ingest.tick_seconds.max(1));

    loop {
        match store.indexer_state() {
            Ok(state) if state == "paused" => {
                std::thread::sleep(tick);
                continue;
            }
            Err(e) => {
                tracing::error!(error = %e, "Pipeline task could not read indexer state");
                std::thread::sleep(tick);
                continue;
            }
            _ => {}
        }

        let outcome = drain_queue(&config, &mut store);
        if outcome.processed > 0 {
            run_cluster_pass(&store);
        }

        std::thread::sleep(tick);
    }
}

/// Claim and process jobs until the queue is drained, the indexer is
/// paused, or everything left is deferred/unloadable.
fn drain_queue(config: &Config, store: &mut Store) -> DrainOutcome {
    let mut outcome = DrainOutcome::default();

    let initial_pending = match store.count_pending_jobs() {
        Ok(count) => count,
        Err(e) => {
            tracing::error!(error = %e, "Could not count pending jobs");
            return outcome;
        }
    };
    if initial_pending == 0 {
        return outcome;
    }
    tracing::info!(pending = initial_pending, "Processing pending files");

    loop {
        if matches!(store.indexer_state().as_deref(), Ok("paused")) {
            tracing::info!("Indexer paused between jobs");
            return outcome;
        }
        // Deferred jobs re-queue behind everything else; once we've
        // deferred as many as were pending, the rest is unmounted.
        if outcome.deferred as i64 >= initial_pending {
            return outcome;
        }

        let result = {
            let mut pipeline = Pipeline::new(store, config.posters_dir.clone());
            pipeline.process_next()
        };

        match result {
            Ok(None) => return outcome,
            Ok(Some(JobOutcome::Processed { .. })) => outcome.processed += 1,
            Ok(Some(JobOutcome::Failed { .. })) => outcome.failed += 1,
            Ok(Some(JobOutcome::Deferred { .. })) => outcome.deferred += 1,
            Ok(Some(JobOutcome::ModelNotReady { error })) => {
                tracing::warn!(
                    error = %error,
                    backoff_seconds = config.ingest.model_backoff_seconds,
                    "Model host unavailable, backing off"
                );
                std::thread::sleep(Duration::from_secs(config.ingest.model_backoff_seconds));
                return outcome;
            }
            Err(e) => {
                // Claim-loop errors are logged and the loop continues
                // with the next tick rather than killing the task.
                tracing::error!(error = %e, "Pipeline error");
                return outcome;
            }
        }
    }
}

fn run_cluster_pass(store: &Store) {
    tracing::info!("Clustering after ingest activity");
    if let Err(e) = cluster::cluster_scenes(store) {
        tracing::error!(error = %e, "Scene clustering failed");
    }
    if let Err(e) = cluster::cluster_faces(store) {
        tracing::error!(error = %e, "Face clustering failed");
    }
}

/// Sleep up to `total`, waking early when the indexer state changes.
fn sleep_responsive(store: &Store, total: Duration, tick: Duration) {
    let state_at_start = store.indexer_state().unwrap_or_default();
    let deadline = Instant::now() + total;

    while Instant::now() < deadline {
        let remaining = deadline.saturating_duration_since(Instant::now());
        std::thread::sleep(tick.min(remaining));
        match store.indexer_state() {
            Ok(state) if state != state_at_start => {
                tracing::info!(state = %state, "Indexer state changed");
                return;
            }
            _ => {}
        }
    }
}
