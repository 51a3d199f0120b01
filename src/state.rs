//! Bundler state persistence: window bounds plus the live fork-db entries,
//! stored as a zstd-compressed JSON blob.

use crate::block_file::BlockFile;
use crate::bundler::Bundler;
use crate::constants::STATE_COMPRESSION_LEVEL;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

const STATE_VERSION: u32 = 1;

/// On-disk shape. Block files are stored through their source filenames so
/// identity re-derives from the filename codec on restore; merged history is
/// not persisted since bootstrap can always reload it from written bundles.
#[derive(Debug, Serialize, Deserialize)]
struct SavedState {
    version: u32,
    bundle_size: u64,
    exclusive_highest_block_limit: u64,
    last_merged: Option<SavedBlockFile>,
    block_files: Vec<SavedBlockFile>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SavedBlockFile {
    filenames: Vec<String>,
}

fn saved(file: &BlockFile) -> SavedBlockFile {
    SavedBlockFile {
        filenames: file.filenames.iter().cloned().collect(),
    }
}

fn restored(saved: &SavedBlockFile) -> Result<BlockFile> {
    let Some(first) = saved.filenames.first() else {
        bail!("state file holds a block without filenames");
    };
    let mut file = BlockFile::from_filename(first)?;
    file.filenames.extend(saved.filenames.iter().cloned());
    Ok(file)
}

/// Persist the bundler's window state and non-merged fork-db entries.
pub fn save(path: &Path, bundler: &Bundler) -> Result<()> {
    let mut block_files: Vec<&BlockFile> = bundler
        .fork_db()
        .entries()
        .filter(|file| !file.merged)
        .collect();
    block_files.sort_by(|a, b| (a.num, a.block_time, &a.id).cmp(&(b.num, b.block_time, &b.id)));

    let state = SavedState {
        version: STATE_VERSION,
        bundle_size: bundler.bundle_size(),
        exclusive_highest_block_limit: bundler.exclusive_highest_block_limit(),
        last_merged: bundler.last_merged().map(saved),
        block_files: block_files.into_iter().map(saved).collect(),
    };

    let json = serde_json::to_vec(&state).context("serializing bundler state")?;
    let compressed =
        zstd::encode_all(json.as_slice(), STATE_COMPRESSION_LEVEL).context("compressing state")?;

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &compressed)
        .with_context(|| format!("writing state file {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("renaming state file into {}", path.display()))?;
    Ok(())
}

/// Restore a bundler from a state file written by [`save`].
pub fn load(path: &Path) -> Result<Bundler> {
    let compressed =
        fs::read(path).with_context(|| format!("reading state file {}", path.display()))?;
    let json = zstd::decode_all(compressed.as_slice())
        .with_context(|| format!("decompressing state file {}", path.display()))?;
    let state: SavedState =
        serde_json::from_slice(&json).with_context(|| format!("parsing state file {}", path.display()))?;

    if state.version != STATE_VERSION {
        bail!(
            "state file {} has unsupported version {}",
            path.display(),
            state.version
        );
    }

    let last_merged = state.last_merged.as_ref().map(restored).transpose()?;
    let block_files = state
        .block_files
        .iter()
        .map(restored)
        .collect::<Result<Vec<_>>>()?;

    Ok(Bundler::with_restored_state(
        state.bundle_size,
        state.exclusive_highest_block_limit,
        last_merged,
        block_files,
    ))
}
