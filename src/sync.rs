//! Scan loop: periodically lists the source store, feeds the bundler,
//! assembles completed bundles into the sink store, persists state and
//! schedules one-block deletions.

use crate::block_file::{BlockFile, base_name};
use crate::bundle_io::{self, CorruptBlockFile};
use crate::bundler::Bundler;
use crate::constants;
use crate::format::{format_bytes, format_count, format_duration_ms};
use crate::state;
use crate::store::BlockStore;
use anyhow::{Context, Result, anyhow, bail};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Window width in block heights
    pub bundle_size: u64,
    /// Lower bound for the first resume-point search in the sink store
    pub minimal_block_num: u64,
    /// Listed files younger than this are ignored
    pub writers_leeway: Duration,
    /// Scan cadence
    pub time_between_store_lookups: Duration,
    /// Forks reaching deeper than this below the window are reported, not retried
    pub max_fixable_fork: u64,
    /// One-block deletion worker count
    pub one_block_deletion_threads: usize,
    /// Cap on names per listing and per deletion batch
    pub max_one_block_operations_batch_size: usize,
    /// Path of the persisted bundler state, if any
    pub state_file: Option<PathBuf>,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            bundle_size: constants::DEFAULT_BUNDLE_SIZE,
            minimal_block_num: constants::DEFAULT_MINIMAL_BLOCK_NUM,
            writers_leeway: Duration::from_secs(constants::DEFAULT_WRITERS_LEEWAY_SECS),
            time_between_store_lookups: Duration::from_secs(
                constants::DEFAULT_LOOKUP_INTERVAL_SECS,
            ),
            max_fixable_fork: constants::DEFAULT_MAX_FIXABLE_FORK,
            one_block_deletion_threads: constants::DEFAULT_DELETION_THREADS,
            max_one_block_operations_batch_size: constants::DEFAULT_MAX_ONE_BLOCK_BATCH_SIZE,
            state_file: None,
        }
    }
}

impl MergeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bundle_size == 0 {
            bail!("bundle size must be greater than 0");
        }
        if self.one_block_deletion_threads < constants::MIN_DELETION_THREADS {
            bail!(
                "need at least {} one-block deletion thread",
                constants::MIN_DELETION_THREADS
            );
        }
        if self.max_one_block_operations_batch_size < constants::MIN_ONE_BLOCK_BATCH_SIZE {
            bail!(
                "minimum one-block operations batch size is {}",
                constants::MIN_ONE_BLOCK_BATCH_SIZE
            );
        }
        Ok(())
    }
}

// ============================================================================
// Health and status
// ============================================================================

/// Shared health flags read by the status server.
pub struct HealthState {
    scan_alive: AtomicBool,
    last_merge_ok: AtomicBool,
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            scan_alive: AtomicBool::new(false),
            last_merge_ok: AtomicBool::new(true),
        }
    }

    /// Serving iff the scan loop is alive and the last completion attempt
    /// did not fail.
    pub fn is_serving(&self) -> bool {
        self.scan_alive.load(Ordering::Relaxed) && self.last_merge_ok.load(Ordering::Relaxed)
    }

    fn set_scan_alive(&self, alive: bool) {
        self.scan_alive.store(alive, Ordering::Relaxed);
    }

    fn set_last_merge_ok(&self, ok: bool) {
        self.last_merge_ok.store(ok, Ordering::Relaxed);
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of the loop, published after every pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoopStatus {
    pub exclusive_highest_block_limit: u64,
    pub last_merged_block_num: Option<u64>,
    pub tracked_blocks: usize,
    pub bundles_merged: u64,
}

// ============================================================================
// Merge loop
// ============================================================================

/// Single owner of a [`Bundler`], driving the add / complete / bundle /
/// commit / purge sequence strictly in order on one task. Parallelism only
/// happens at the edges: payload fetches inside assembly and the deletion
/// worker pool.
pub struct MergeLoop {
    source: Arc<dyn BlockStore>,
    sink: Arc<dyn BlockStore>,
    bundler: Bundler,
    config: MergeConfig,
    health: Arc<HealthState>,
    status: Arc<Mutex<LoopStatus>>,
    deletion_pool: rayon::ThreadPool,
    reported_deep_forks: HashSet<String>,
    bundles_merged: u64,
}

impl MergeLoop {
    pub fn new(
        source: Arc<dyn BlockStore>,
        sink: Arc<dyn BlockStore>,
        bundler: Bundler,
        config: MergeConfig,
    ) -> Result<Self> {
        config.validate()?;
        let deletion_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.one_block_deletion_threads)
            .thread_name(|i| format!("one-block-delete-{i}"))
            .build()
            .context("building one-block deletion pool")?;
        Ok(Self {
            source,
            sink,
            bundler,
            config,
            health: Arc::new(HealthState::new()),
            status: Arc::new(Mutex::new(LoopStatus::default())),
            deletion_pool,
            reported_deep_forks: HashSet::new(),
            bundles_merged: 0,
        })
    }

    pub fn health(&self) -> Arc<HealthState> {
        Arc::clone(&self.health)
    }

    pub fn status(&self) -> Arc<Mutex<LoopStatus>> {
        Arc::clone(&self.status)
    }

    /// Run until shutdown is requested or an unrecoverable error surfaces.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        info!("merge loop starting: {}", self.bundler);
        self.health.set_scan_alive(true);
        let result = self.run_inner(&mut shutdown_rx).await;
        self.health.set_scan_alive(false);
        if result.is_err() {
            self.health.set_last_merge_ok(false);
        }
        result
    }

    async fn run_inner(&mut self, shutdown_rx: &mut watch::Receiver<bool>) -> Result<()> {
        loop {
            if *shutdown_rx.borrow() {
                info!("merge loop stopping");
                return Ok(());
            }

            self.process_one_pass(shutdown_rx).await?;
            self.publish_status();

            tokio::select! {
                _ = tokio::time::sleep(self.config.time_between_store_lookups) => {}
                _ = shutdown_rx.changed() => {}
            }
        }
    }

    async fn process_one_pass(&mut self, shutdown_rx: &mut watch::Receiver<bool>) -> Result<()> {
        let names = {
            let source = Arc::clone(&self.source);
            let max = self.config.max_one_block_operations_batch_size;
            let leeway = self.config.writers_leeway;
            retry_store("listing one-block files", move || source.list(max, leeway)).await?
        };

        self.ingest(names);

        loop {
            let (completed, highest) = self.bundler.bundle_completed();
            if !completed {
                break;
            }
            // Cancelled before the bundle is durably written: leave state
            // untouched so the next run re-produces the same bundle.
            if *shutdown_rx.borrow() {
                info!("shutdown requested, leaving the completed bundle for the next run");
                return Ok(());
            }
            match self.merge_one_bundle(highest).await {
                Ok(()) => self.health.set_last_merge_ok(true),
                Err(e) if e.downcast_ref::<CorruptBlockFile>().is_some() => {
                    // Replacement uploads may repair this on a later scan.
                    warn!("aborting bundle without committing: {e:#}");
                    self.health.set_last_merge_ok(false);
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn ingest(&mut self, names: Vec<String>) {
        let mut added = 0u64;
        let mut duplicates = 0u64;
        let mut below_horizon = Vec::new();

        for name in names {
            let file = match BlockFile::from_filename(&name) {
                Ok(file) => file,
                Err(e) => {
                    warn!("skipping malformed one-block file {name:?}: {e}");
                    continue;
                }
            };
            let Some(lib_num) = file.lib_num else {
                warn!("skipping legacy one-block file {name:?} without a lib num");
                continue;
            };
            if lib_num > file.num {
                warn!(
                    "skipping one-block file {name:?}: lib num {lib_num} above block num {}",
                    file.num
                );
                continue;
            }
            if self.bundler.is_block_too_old(file.num) {
                below_horizon.push(name);
                continue;
            }
            let low = self.bundler.inclusive_lower_block_num();
            if file.num.saturating_add(self.config.max_fixable_fork) < low {
                if self.reported_deep_forks.insert(file.canonical_name.clone()) {
                    warn!(
                        "fork block {} reaches more than {} below the bundle window, not reconciling it",
                        file.canonical_name, self.config.max_fixable_fork
                    );
                }
                continue;
            }
            if self.bundler.add_block_file(file) {
                duplicates += 1;
            } else {
                added += 1;
            }
        }

        if added > 0 || duplicates > 0 {
            debug!(
                "ingested {} new blocks, {} duplicate deliveries",
                format_count(added),
                format_count(duplicates)
            );
        }
        if !below_horizon.is_empty() {
            info!(
                "deleting {} one-block files below the horizon",
                format_count(below_horizon.len() as u64)
            );
            self.schedule_filename_deletions(below_horizon);
        }
    }

    async fn merge_one_bundle(&mut self, highest_bundle_limit: u64) -> Result<()> {
        let start = Instant::now();
        let low = self.bundler.inclusive_lower_block_num();
        let mut files = self.bundler.to_bundle(highest_bundle_limit);

        if files.is_empty() {
            // Every window block came from already written history; nothing
            // to upload, only the window advances.
            info!(
                "bundle {} already present in merged history, advancing the window",
                base_name(low)
            );
        } else {
            let bytes = {
                let source = Arc::clone(&self.source);
                let sink = Arc::clone(&self.sink);
                let files = &mut files;
                retry_store("assembling bundle", move || {
                    bundle_io::merge_and_store(
                        source.as_ref(),
                        sink.as_ref(),
                        low,
                        files.as_mut_slice(),
                    )
                })
                .await?
            };
            info!(
                "merged bundle {} ({} blocks, {}) in {}",
                base_name(low),
                format_count(files.len() as u64),
                format_bytes(bytes),
                format_duration_ms(start.elapsed())
            );
        }

        self.bundler.commit(highest_bundle_limit);
        if !files.is_empty() {
            self.bundles_merged += 1;
        }

        if let Some(path) = &self.config.state_file
            && let Err(e) = state::save(path, &self.bundler)
        {
            // The in-memory state stays authoritative; the next commit
            // re-attempts the write.
            warn!("failed to write state file {}: {e:#}", path.display());
        }

        let mut purged_filenames = Vec::new();
        self.bundler.purge(|purged| {
            purged_filenames = purged
                .iter()
                .flat_map(|file| file.filenames.iter().cloned())
                .collect();
            debug!("purged {} block files below the lib", purged.len());
        });
        self.schedule_filename_deletions(purged_filenames);
        Ok(())
    }

    fn schedule_filename_deletions(&self, filenames: Vec<String>) {
        for chunk in filenames.chunks(self.config.max_one_block_operations_batch_size) {
            let batch: Vec<String> = chunk.to_vec();
            let source = Arc::clone(&self.source);
            self.deletion_pool.spawn(move || {
                use rayon::prelude::*;
                batch.par_iter().for_each(|name| {
                    if let Err(e) = source.delete(name) {
                        warn!("failed to delete one-block file {name:?}: {e:#}");
                    }
                });
            });
        }
    }

    fn publish_status(&self) {
        let mut status = self.status.lock().unwrap();
        status.exclusive_highest_block_limit = self.bundler.exclusive_highest_block_limit();
        status.last_merged_block_num = self.bundler.last_merged().map(|file| file.num);
        status.tracked_blocks = self.bundler.fork_db().len();
        status.bundles_merged = self.bundles_merged;
    }
}

/// Restore the bundler from the state file when present, otherwise derive the
/// resume point from the sink store and reload merged history.
///
/// A sink with no bundles at all starts fresh: the first window begins at
/// `minimal_block_num` and there is no history to load.
pub fn restore_or_bootstrap(sink: &dyn BlockStore, config: &MergeConfig) -> Result<Bundler> {
    if let Some(path) = &config.state_file
        && path.exists()
    {
        match state::load(path) {
            Ok(bundler) => {
                info!("restored bundler from {}: {bundler}", path.display());
                return Ok(bundler);
            }
            Err(e) => {
                warn!(
                    "failed to load state file {}: {e:#}; rebuilding from merged history",
                    path.display()
                );
            }
        }
    }

    let next_base = bundle_io::find_next_base(sink, config.minimal_block_num, config.bundle_size)
        .context("finding where to start")?;
    let mut bundler = Bundler::new(config.bundle_size, next_base + config.bundle_size);
    if next_base == config.minimal_block_num {
        info!(
            "no merged bundles at or above {}, starting fresh: {bundler}",
            config.minimal_block_num
        );
        return Ok(bundler);
    }

    bundler.bootstrap(|low| bundle_io::read_bundle(sink, low))?;
    info!("bootstrapped bundler from merged history: {bundler}");
    Ok(bundler)
}

/// Run a fallible store operation with exponential backoff. Corrupt payloads
/// are not retried; waiting will not repair them.
async fn retry_store<T>(what: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let attempts = constants::STORE_RETRY_ATTEMPTS;
    let cap = Duration::from_secs(constants::STORE_RETRY_MAX_DELAY_SECS);
    let mut delay = Duration::from_millis(constants::STORE_RETRY_INITIAL_DELAY_MS);
    let mut last_err = None;

    for attempt in 1..=attempts {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) => {
                if e.downcast_ref::<CorruptBlockFile>().is_some() {
                    return Err(e);
                }
                if attempt < attempts {
                    warn!("{what} failed (attempt {attempt}/{attempts}), retrying: {e:#}");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(cap);
                }
                last_err = Some(e);
            }
        }
    }
    Err(anyhow!(
        "after {attempts} attempts, {what} still failing: {:#}",
        last_err.unwrap_or_else(|| anyhow!("unknown error"))
    ))
}
