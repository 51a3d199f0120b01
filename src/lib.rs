// src/lib.rs
pub mod block_file;
pub mod bundle_io;
pub mod bundler;
pub mod constants;
pub mod fork_db;
pub mod format;
pub mod runtime;
#[cfg(feature = "server")]
pub mod server;
pub mod state;
pub mod store;
pub mod sync;

// Re-export main types
pub use block_file::{BlockFile, ParsedFilename, parse_filename};
pub use bundle_io::{CorruptBlockFile, find_next_base, merge_and_store, read_bundle};
pub use bundler::Bundler;
pub use fork_db::ForkDb;
pub use runtime::MergerRuntime;
pub use store::{BlockStore, FsStore};
pub use sync::{HealthState, LoopStatus, MergeConfig, MergeLoop, restore_or_bootstrap};
