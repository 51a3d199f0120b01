// Constants for version, binary identification and merge defaults

/// Binary name used in logs and metadata
pub const BINARY_NAME: &str = "blockbundle";

/// Package version from Cargo.toml (set at compile time)
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// Bundle Constants
// ============================================================================

/// Number of block heights covered by one merged bundle
pub const DEFAULT_BUNDLE_SIZE: u64 = 100;

/// Lowest block number probed when searching the sink store for a resume point
pub const DEFAULT_MINIMAL_BLOCK_NUM: u64 = 0;

// ============================================================================
// Scan Loop Constants
// ============================================================================

/// Default time between source store listings
pub const DEFAULT_LOOKUP_INTERVAL_SECS: u64 = 5;

/// Listed files younger than this are skipped (may still be uploading)
pub const DEFAULT_WRITERS_LEEWAY_SECS: u64 = 10;

/// Deepest fork the bundler will try to reconcile; deeper ones are reported once
pub const DEFAULT_MAX_FIXABLE_FORK: u64 = 10_000;

/// Default one-block deletion worker count
pub const DEFAULT_DELETION_THREADS: usize = 8;

/// Minimum allowed one-block deletion worker count
pub const MIN_DELETION_THREADS: usize = 1;

/// Default cap on one-block files handled per listing or deletion batch
pub const DEFAULT_MAX_ONE_BLOCK_BATCH_SIZE: usize = 2_000;

/// Minimum allowed listing/deletion batch cap
pub const MIN_ONE_BLOCK_BATCH_SIZE: usize = 250;

// ============================================================================
// Retry Constants
// ============================================================================

/// Store operations are attempted this many times before the loop gives up
pub const STORE_RETRY_ATTEMPTS: usize = 5;

/// First retry delay; doubles per attempt
pub const STORE_RETRY_INITIAL_DELAY_MS: u64 = 500;

/// Retry delays never grow beyond this
pub const STORE_RETRY_MAX_DELAY_SECS: u64 = 5;

// ============================================================================
// Compression Constants
// ============================================================================

/// Zstd compression level for the state file (1 = fast, 3 = balanced, 19 = maximum)
pub const STATE_COMPRESSION_LEVEL: i32 = 3;
