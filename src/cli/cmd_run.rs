use anyhow::Result;
use blockbundle::runtime::MergerRuntime;
use blockbundle::store::{BlockStore, FsStore};
use blockbundle::sync::{self, MergeConfig, MergeLoop};
use blockbundle::constants;
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::utils::parse_duration;

#[derive(Args)]
pub struct RunCommand {
    /// Directory holding incoming one-block files
    #[arg(long, value_name = "DIR")]
    pub one_blocks_store: PathBuf,

    /// Directory receiving merged bundles
    #[arg(long, value_name = "DIR")]
    pub merged_blocks_store: PathBuf,

    /// Bundle width in block heights
    #[arg(long, default_value_t = constants::DEFAULT_BUNDLE_SIZE)]
    pub bundle_size: u64,

    /// Lower bound for the first resume-point search
    #[arg(long, default_value_t = constants::DEFAULT_MINIMAL_BLOCK_NUM)]
    pub minimal_block_num: u64,

    /// Ignore listed files younger than this (writers may still be uploading)
    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    pub writers_leeway: Duration,

    /// Time between source store listings
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    pub time_between_store_lookups: Duration,

    /// Deepest fork to reconcile; deeper ones are reported and left alone
    #[arg(long, default_value_t = constants::DEFAULT_MAX_FIXABLE_FORK)]
    pub max_fixable_fork: u64,

    /// One-block deletion worker count
    #[arg(long, default_value_t = constants::DEFAULT_DELETION_THREADS)]
    pub one_block_deletion_threads: usize,

    /// Cap on one-block files per listing or deletion batch
    #[arg(long, default_value_t = constants::DEFAULT_MAX_ONE_BLOCK_BATCH_SIZE)]
    pub max_one_block_operations_batch_size: usize,

    /// Bundler state file; when absent on start, merged history is reloaded
    #[arg(long, value_name = "FILE")]
    pub state_file: Option<PathBuf>,

    /// Health/status endpoint listen address
    #[cfg(feature = "server")]
    #[arg(long, default_value = "127.0.0.1:9102")]
    pub listen_addr: String,
}

pub fn run(cmd: RunCommand) -> Result<()> {
    tokio::runtime::Runtime::new()?.block_on(async move {
        log::info!(
            "{} v{} starting",
            constants::BINARY_NAME,
            constants::VERSION
        );
        let config = MergeConfig {
            bundle_size: cmd.bundle_size,
            minimal_block_num: cmd.minimal_block_num,
            writers_leeway: cmd.writers_leeway,
            time_between_store_lookups: cmd.time_between_store_lookups,
            max_fixable_fork: cmd.max_fixable_fork,
            one_block_deletion_threads: cmd.one_block_deletion_threads,
            max_one_block_operations_batch_size: cmd.max_one_block_operations_batch_size,
            state_file: cmd.state_file.clone(),
        };
        config.validate()?;

        let source: Arc<dyn BlockStore> = Arc::new(FsStore::open(&cmd.one_blocks_store)?);
        let sink_store = FsStore::open(&cmd.merged_blocks_store)?;
        let bundler = sync::restore_or_bootstrap(&sink_store, &config)?;
        let sink: Arc<dyn BlockStore> = Arc::new(sink_store);

        let merge_loop = MergeLoop::new(source, sink, bundler, config)?;
        let runtime = MergerRuntime::new();

        #[cfg(feature = "server")]
        {
            let health = merge_loop.health();
            let status = merge_loop.status();
            let listen_addr = cmd.listen_addr.clone();
            let server_runtime = runtime.clone();
            tokio::spawn(async move {
                if let Err(e) =
                    blockbundle::server::serve(&listen_addr, health, status, server_runtime).await
                {
                    log::error!("status server exited: {e:#}");
                }
            });
        }

        // Relay Ctrl+C into the shared shutdown flag.
        let signal_runtime = runtime.clone();
        tokio::spawn(async move {
            signal_runtime.create_shutdown_future().await;
            signal_runtime.trigger_shutdown();
        });

        let result = merge_loop.run(runtime.shutdown_signal()).await;
        if result.is_err() {
            runtime.trigger_fatal_shutdown();
        } else {
            runtime.trigger_shutdown();
        }
        result
    })
}
