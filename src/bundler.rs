//! Bundling core: tracks the fork forest and decides when a bundle window is
//! complete, what goes into it, and how the window advances afterwards.

use crate::block_file::BlockFile;
use crate::fork_db::ForkDb;
use anyhow::{Context, Result};
use log::{debug, warn};
use std::fmt;

/// Owns a [`ForkDb`] plus the current bundle window.
///
/// The window covers `[exclusive_highest_block_limit - bundle_size,
/// exclusive_highest_block_limit)`. A bundle is produced once an irreversible
/// chain has crossed the upper bound, then the window slides up by one bundle
/// size. All operations are plain in-memory work driven by a single owner.
pub struct Bundler {
    fork_db: ForkDb,
    bundle_size: u64,
    exclusive_highest_block_limit: u64,
    last_merged: Option<BlockFile>,
}

impl Bundler {
    pub fn new(bundle_size: u64, first_exclusive_highest_block_limit: u64) -> Self {
        Self {
            fork_db: ForkDb::new(),
            bundle_size,
            exclusive_highest_block_limit: first_exclusive_highest_block_limit,
            last_merged: None,
        }
    }

    /// Rebuild a bundler from persisted window state and fork-db entries.
    pub fn with_restored_state(
        bundle_size: u64,
        exclusive_highest_block_limit: u64,
        last_merged: Option<BlockFile>,
        block_files: Vec<BlockFile>,
    ) -> Self {
        let mut bundler = Self::new(bundle_size, exclusive_highest_block_limit);
        bundler.last_merged = last_merged;
        for file in block_files {
            bundler.add_block_file(file);
        }
        bundler
    }

    pub fn bundle_size(&self) -> u64 {
        self.bundle_size
    }

    pub fn exclusive_highest_block_limit(&self) -> u64 {
        self.exclusive_highest_block_limit
    }

    pub fn inclusive_lower_block_num(&self) -> u64 {
        self.exclusive_highest_block_limit
            .saturating_sub(self.bundle_size)
    }

    pub fn last_merged(&self) -> Option<&BlockFile> {
        self.last_merged.as_ref()
    }

    pub fn fork_db(&self) -> &ForkDb {
        &self.fork_db
    }

    /// Admit a one-block file. Returns `true` when the block id was already
    /// known; its source filenames are then merged into the existing entry so
    /// duplicate uploads can be deleted later.
    ///
    /// Blocks with an unknown parent are admitted as dangling roots. The one
    /// orphan that is expected is the block extending the last merged block,
    /// whose parent was purged after the previous commit; anything else stays
    /// quarantined until connecting blocks arrive or a purge evicts it.
    pub fn add_block_file(&mut self, file: BlockFile) -> bool {
        if self.fork_db.contains(&file.id) {
            return self.fork_db.add_link(file);
        }
        if !self.fork_db.contains(&file.parent_id) && !self.fork_db.is_empty() {
            match &self.last_merged {
                Some(last) if last.id == file.parent_id => {
                    debug!(
                        "block {} extends the last merged block {}",
                        file.canonical_name, last.id
                    );
                }
                _ => debug!(
                    "quarantining dangling root {} (parent {} unknown)",
                    file.canonical_name, file.parent_id
                ),
            }
        }
        self.fork_db.add_link(file)
    }

    /// A chain that completes the window ending at `exclusive_limit`: it must
    /// reach the window's lower boundary and cross the upper one. Roots are
    /// tried lowest first, so a back-in-time fork wins over a disconnected
    /// future chain.
    fn completing_chain(&self, exclusive_limit: u64) -> Option<Vec<&BlockFile>> {
        // An ambiguous forest means two tips tie for the longest chain; wait
        // for more blocks rather than guessing.
        self.fork_db.longest_chain()?;

        let low = exclusive_limit.saturating_sub(self.bundle_size);
        for root in self.fork_db.roots().ok()? {
            // The lower boundary is reached either by starting at or below
            // it, or by extending the last merged block directly (its parent
            // was purged after the previous commit, so such a root may sit
            // just above the boundary).
            let continues_merged = self
                .last_merged
                .as_ref()
                .is_some_and(|last| last.id == root.parent_id);
            if root.num > low && !continues_merged {
                continue;
            }
            let Some(chain) = self.fork_db.chain_from(&root.id) else {
                continue;
            };
            if chain.iter().any(|file| file.num >= exclusive_limit) {
                return Some(chain);
            }
        }
        None
    }

    /// Whether the current window can be bundled. On completion the second
    /// value is the highest block num the bundle may contain (the exclusive
    /// limit minus one); it is 0 otherwise.
    pub fn bundle_completed(&self) -> (bool, u64) {
        match self.completing_chain(self.exclusive_highest_block_limit) {
            Some(_) => (true, self.exclusive_highest_block_limit.saturating_sub(1)),
            None => (false, 0),
        }
    }

    /// Every admitted, not-yet-merged block file up to `highest_bundle_limit`,
    /// across all forks, in arrival order: block time first, then height,
    /// then id. Fork siblings at one height keep their arrival order, and a
    /// back-in-time fork lands as one contiguous run. Remnants whose lineage
    /// was purged are included so nothing is stranded.
    pub fn to_bundle(&self, highest_bundle_limit: u64) -> Vec<BlockFile> {
        let mut files: Vec<BlockFile> = self
            .fork_db
            .entries()
            .filter(|file| !file.merged && file.num <= highest_bundle_limit)
            .cloned()
            .collect();
        files.sort_by(|a, b| (a.block_time, a.num, &a.id).cmp(&(b.block_time, b.num, &b.id)));
        files
    }

    /// Advance the window after the bundle up to `highest_bundle_limit` has
    /// been durably written.
    ///
    /// The tip of the completing chain inside the window becomes the last
    /// merged block, everything the bundle contained is flagged merged, and
    /// the LIB moves to the highest chain block at or below the tip's
    /// declared lib num. Eviction is left to [`Self::purge`] so callers can
    /// persist state in between.
    pub fn commit(&mut self, highest_bundle_limit: u64) {
        let (tip, lib_anchor) = {
            let Some(chain) = self.completing_chain(highest_bundle_limit + 1) else {
                warn!("commit called without a completed bundle at {highest_bundle_limit}");
                return;
            };

            let mut tip: Option<&BlockFile> = None;
            for &file in &chain {
                if file.num <= highest_bundle_limit {
                    tip = Some(file);
                }
            }
            let Some(tip) = tip else {
                warn!("no block at or below {highest_bundle_limit} on the completing chain");
                return;
            };

            let lib_target = tip.lib_num();
            let mut anchor = None;
            for &file in &chain {
                if file.num <= lib_target {
                    anchor = Some(file.id.clone());
                } else {
                    break;
                }
            }
            (tip.clone(), anchor)
        };

        for entry in self.fork_db.entries_mut() {
            if entry.num <= highest_bundle_limit && !entry.merged {
                entry.merged = true;
            }
        }

        debug!(
            "committed bundle up to {highest_bundle_limit}, tip {}, next window ends at {}",
            tip.canonical_name,
            self.exclusive_highest_block_limit + self.bundle_size
        );
        self.last_merged = Some(tip);
        self.exclusive_highest_block_limit += self.bundle_size;
        if let Some(id) = lib_anchor {
            self.fork_db.set_lib(&id);
        }
    }

    /// Evict everything at or below the LIB height (except the LIB block) and
    /// hand the batch to `callback` so source files can be deleted.
    pub fn purge(&mut self, callback: impl FnOnce(&[BlockFile])) {
        self.fork_db.purge_below_lib(callback);
    }

    /// Cheap ingress filter: a block strictly below the lowest root cannot
    /// attach to anything we still track.
    pub fn is_block_too_old(&self, block_num: u64) -> bool {
        match self.fork_db.roots() {
            Ok(roots) => roots.first().is_some_and(|root| block_num < root.num),
            Err(_) => false,
        }
    }

    pub fn longest_chain(&self) -> Option<Vec<String>> {
        self.fork_db
            .longest_chain()
            .map(|chain| chain.iter().map(|file| file.id.clone()).collect())
    }

    pub fn longest_block_file_chain(&self) -> Option<Vec<BlockFile>> {
        self.fork_db
            .longest_chain()
            .map(|chain| chain.into_iter().cloned().collect())
    }

    pub fn longest_chain_first_block_num(&self) -> Result<u64> {
        self.fork_db
            .longest_chain()
            .and_then(|chain| chain.first().map(|file| file.num))
            .context("no longest chain available")
    }

    /// Load merged history until the fork db reaches back to the last
    /// irreversible block of the most recently written bundle.
    ///
    /// `fetch` takes a bundle's low block num and returns its block files.
    /// A missing bundle is fatal: there is either a hole in the written
    /// history or, at low block num 0, no history at all.
    pub fn bootstrap(
        &mut self,
        mut fetch: impl FnMut(u64) -> Result<Vec<BlockFile>>,
    ) -> Result<()> {
        let last_written_low = self
            .exclusive_highest_block_limit
            .saturating_sub(2 * self.bundle_size);

        let newest = fetch_merged(&mut fetch, last_written_low).context("loading one block files")?;
        let tail = newest
            .iter()
            .max_by(|a, b| (a.num, a.block_time, &a.id).cmp(&(b.num, b.block_time, &b.id)))
            .with_context(|| format!("merged bundle at {last_written_low} is empty"))?;
        let required_lib = tail.lib_num.with_context(|| {
            format!("merged block {} carries no lib num", tail.canonical_name)
        })?;

        let mut low = (required_lib / self.bundle_size) * self.bundle_size;
        low = low.min(last_written_low);
        loop {
            let files = fetch_merged(&mut fetch, low).context("loading one block files")?;
            for mut file in files {
                file.merged = true;
                self.add_block_file(file);
            }
            if low == last_written_low {
                break;
            }
            low += self.bundle_size;
        }

        let first = self
            .longest_chain_first_block_num()
            .context("bootstrap did not produce an unambiguous chain")?;
        debug!(
            "bootstrapped from merged history: chain starts at {first}, required lib {required_lib}"
        );
        Ok(())
    }
}

fn fetch_merged(
    fetch: &mut impl FnMut(u64) -> Result<Vec<BlockFile>>,
    low_block_num: u64,
) -> Result<Vec<BlockFile>> {
    fetch(low_block_num).with_context(|| {
        if low_block_num == 0 {
            "no initial merged bundle at low block num 0".to_string()
        } else {
            format!("gap in merged bundles: failed to fetch merged file for low block num: {low_block_num}")
        }
    })
}

impl fmt::Display for Bundler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bundle_size: {}, last_merged_block_num: {}, inclusive_lower_block_num: {}, exclusive_highest_block_limit: {}",
            self.bundle_size,
            self.last_merged.as_ref().map(|file| file.num).unwrap_or(0),
            self.inclusive_lower_block_num(),
            self.exclusive_highest_block_limit,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str) -> BlockFile {
        BlockFile::from_filename(name).unwrap()
    }

    #[test]
    fn display_exposes_window_state() {
        let mut bundler = Bundler::new(5, 105);
        bundler.add_block_file(file(
            "0000000100-20210728T105016.0-00000100a-00000099a-90-w1",
        ));
        let rendered = bundler.to_string();
        assert!(rendered.contains("bundle_size: 5"));
        assert!(rendered.contains("last_merged_block_num: 0"));
        assert!(rendered.contains("inclusive_lower_block_num: 100"));
        assert!(rendered.contains("exclusive_highest_block_limit: 105"));
    }

    #[test]
    fn add_block_file_is_idempotent() {
        let mut bundler = Bundler::new(2, 105);
        let name = "0000000100-20210728T105016.0-00000100a-00000099a-90-w1";
        assert!(!bundler.add_block_file(file(name)));
        assert!(bundler.add_block_file(file(name)));
        assert_eq!(bundler.fork_db().len(), 1);
    }

    #[test]
    fn restored_state_keeps_last_merged_anchor() {
        let last = file("0000000099-20210728T105015.9-00000099a-00000098a-94-w1");
        let bundler = Bundler::with_restored_state(
            5,
            105,
            Some(last),
            vec![file("0000000100-20210728T105016.0-00000100a-00000099a-94-w1")],
        );
        assert_eq!(bundler.last_merged().unwrap().id, "00000099a");
        assert_eq!(bundler.exclusive_highest_block_limit(), 105);
        assert_eq!(bundler.fork_db().len(), 1);
    }
}
