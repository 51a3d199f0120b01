//! In-memory fork database: a forest of block files linked by parent id

use crate::block_file::BlockFile;
use anyhow::{Result, bail};
use std::collections::HashMap;

/// Block files indexed by id, with implicit parent edges.
///
/// Parents may be absent; blocks whose parent is unknown anchor roots. Cycles
/// are impossible by construction since a parent always has a lower height
/// and ids are unique.
#[derive(Debug, Default)]
pub struct ForkDb {
    links: HashMap<String, BlockFile>,
    children: HashMap<String, Vec<String>>,
    lib_id: Option<String>,
}

impl ForkDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a block file, keyed by block id. Idempotent: when the id is
    /// already known the incoming source filenames are merged into the
    /// existing entry and `true` is returned.
    pub fn add_link(&mut self, file: BlockFile) -> bool {
        if let Some(existing) = self.links.get_mut(&file.id) {
            existing.filenames.extend(file.filenames);
            return true;
        }
        self.children
            .entry(file.parent_id.clone())
            .or_default()
            .push(file.id.clone());
        self.links.insert(file.id.clone(), file);
        false
    }

    pub fn get(&self, id: &str) -> Option<&BlockFile> {
        self.links.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.links.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &BlockFile> {
        self.links.values()
    }

    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut BlockFile> {
        self.links.values_mut()
    }

    /// Blocks whose parent is not in the db, lowest height first.
    pub fn roots(&self) -> Result<Vec<&BlockFile>> {
        if self.links.is_empty() {
            bail!("no link");
        }
        let mut roots: Vec<&BlockFile> = self
            .links
            .values()
            .filter(|file| !self.links.contains_key(&file.parent_id))
            .collect();
        roots.sort_by(|a, b| (a.num, &a.id).cmp(&(b.num, &b.id)));
        Ok(roots)
    }

    /// Length of the longest path starting at `id`.
    fn depth(&self, id: &str) -> usize {
        let deepest_child = self
            .present_children(id)
            .map(|child| self.depth(&child.id))
            .max()
            .unwrap_or(0);
        1 + deepest_child
    }

    fn present_children(&self, id: &str) -> impl Iterator<Item = &BlockFile> {
        self.children
            .get(id)
            .into_iter()
            .flatten()
            .filter_map(|child_id| self.links.get(child_id))
    }

    /// Walk forward from `from_id` to a tip, always taking the child with the
    /// deepest subtree. Equal depths are resolved by greatest block time;
    /// equal depth and time is ambiguous and yields `None`.
    pub fn chain_from(&self, from_id: &str) -> Option<Vec<&BlockFile>> {
        let mut current = self.links.get(from_id)?;
        let mut chain = vec![current];
        loop {
            let mut scored: Vec<(usize, &BlockFile)> = self
                .present_children(&current.id)
                .map(|child| (self.depth(&child.id), child))
                .collect();
            if scored.is_empty() {
                return Some(chain);
            }
            scored.sort_by(|a, b| {
                (b.0, b.1.block_time, &b.1.id).cmp(&(a.0, a.1.block_time, &a.1.id))
            });
            if scored.len() > 1
                && scored[0].0 == scored[1].0
                && scored[0].1.block_time == scored[1].1.block_time
            {
                return None;
            }
            current = scored[0].1;
            chain.push(current);
        }
    }

    /// The longest root-to-tip path over the whole forest.
    ///
    /// `None` when the db is empty, when two roots tie for the maximum chain
    /// length, or when the winning root's own walk is ambiguous. The caller
    /// treats that as "wait for more blocks".
    pub fn longest_chain(&self) -> Option<Vec<&BlockFile>> {
        let roots = self.roots().ok()?;
        let mut scored: Vec<(usize, &BlockFile)> = roots
            .into_iter()
            .map(|root| (self.depth(&root.id), root))
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.id.cmp(&b.1.id)));
        if scored.len() > 1 && scored[0].0 == scored[1].0 {
            return None;
        }
        self.chain_from(&scored[0].1.id)
    }

    /// Mark `id` as the last irreversible block. Idempotent; unknown ids are
    /// ignored with a warning since the caller derives them from chain walks.
    pub fn set_lib(&mut self, id: &str) {
        if !self.links.contains_key(id) {
            log::warn!("set_lib called with unknown block id {id}");
            return;
        }
        self.lib_id = Some(id.to_string());
    }

    pub fn lib_id(&self) -> Option<&str> {
        self.lib_id.as_deref()
    }

    /// Evict every entry at or below the LIB height, except the LIB block
    /// itself, and hand the batch to `callback`. This is the only operation
    /// that shrinks the db.
    pub fn purge_below_lib(&mut self, callback: impl FnOnce(&[BlockFile])) {
        let lib_num = match self.lib_id.as_deref().and_then(|id| self.links.get(id)) {
            Some(lib) => lib.num,
            None => {
                callback(&[]);
                return;
            }
        };

        let purged_ids: Vec<String> = self
            .links
            .values()
            .filter(|file| file.num <= lib_num && Some(file.id.as_str()) != self.lib_id.as_deref())
            .map(|file| file.id.clone())
            .collect();

        let mut purged = Vec::with_capacity(purged_ids.len());
        for id in &purged_ids {
            if let Some(file) = self.links.remove(id) {
                if let Some(siblings) = self.children.get_mut(&file.parent_id) {
                    siblings.retain(|sibling| sibling != id);
                    if siblings.is_empty() {
                        self.children.remove(&file.parent_id);
                    }
                }
                purged.push(file);
            }
        }
        purged.sort_by(|a, b| (a.num, a.block_time, &a.id).cmp(&(b.num, b.block_time, &b.id)));
        callback(&purged);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str) -> BlockFile {
        BlockFile::from_filename(name).unwrap()
    }

    #[test]
    fn add_link_deduplicates_by_id() {
        let mut db = ForkDb::new();
        assert!(!db.add_link(file("0000000100-20210728T105016.0-00000100a-00000099a-90-w1")));
        assert!(db.add_link(file("0000000100-20210728T105016.0-00000100a-00000099a-90-w2")));
        assert_eq!(db.len(), 1);
        assert_eq!(db.get("00000100a").unwrap().filenames.len(), 2);
    }

    #[test]
    fn roots_fails_on_empty_db() {
        let db = ForkDb::new();
        assert!(db.roots().is_err());
    }

    #[test]
    fn orphans_become_roots() {
        let mut db = ForkDb::new();
        db.add_link(file("0000000100-20210728T105016.0-00000100a-00000099a-90-w1"));
        db.add_link(file("0000000101-20210728T105016.0-00000101a-00000100a-100-w1"));
        db.add_link(file("0000000300-20210728T105016.0-00000300a-00000299a-290-w1"));
        let roots = db.roots().unwrap();
        let ids: Vec<&str> = roots.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["00000100a", "00000300a"]);
    }

    #[test]
    fn chain_prefers_deepest_branch_over_block_time() {
        let mut db = ForkDb::new();
        // Fork at 102: the b branch has the later block time but the a branch
        // is deeper, so the walk must stay on a.
        db.add_link(file("0000000100-20210728T105016.01-00000100a-00000099a-90-w1"));
        db.add_link(file("0000000101-20210728T105016.02-00000101a-00000100a-100-w1"));
        db.add_link(file("0000000102-20210728T105016.03-00000102a-00000101a-100-w1"));
        db.add_link(file("0000000102-20210728T105016.04-00000102b-00000101a-100-w1"));
        db.add_link(file("0000000103-20210728T105016.05-00000103b-00000102b-100-w1"));
        db.add_link(file("0000000103-20210728T105016.06-00000103a-00000102a-100-w1"));
        db.add_link(file("0000000104-20210728T105016.07-00000104a-00000103a-100-w1"));

        let chain = db.longest_chain().unwrap();
        let ids: Vec<&str> = chain.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["00000100a", "00000101a", "00000102a", "00000103a", "00000104a"]
        );
    }

    #[test]
    fn equal_length_tips_are_ambiguous() {
        let mut db = ForkDb::new();
        db.add_link(file("0000000100-20210728T105016.01-00000100a-00000099a-90-w1"));
        db.add_link(file("0000000101-20210728T105016.02-00000101a-00000100a-100-w1"));
        db.add_link(file("0000000102-20210728T105016.03-00000102a-00000101a-100-w1"));
        db.add_link(file("0000000102-20210728T105016.03-00000102b-00000101a-100-w1"));
        assert!(db.longest_chain().is_none());
    }

    #[test]
    fn purge_below_lib_keeps_the_lib_block() {
        let mut db = ForkDb::new();
        db.add_link(file("0000000100-20210728T105016.01-00000100a-00000099a-90-w1"));
        db.add_link(file("0000000101-20210728T105016.02-00000101a-00000100a-100-w1"));
        db.add_link(file("0000000102-20210728T105016.03-00000102a-00000101a-100-w1"));
        db.add_link(file("0000000103-20210728T105016.04-00000103a-00000102a-101-w1"));
        db.set_lib("00000101a");

        let mut purged_ids = Vec::new();
        db.purge_below_lib(|purged| {
            purged_ids = purged.iter().map(|f| f.id.clone()).collect();
        });
        assert_eq!(purged_ids, vec!["00000100a"]);
        assert!(db.contains("00000101a"));
        assert!(db.contains("00000102a"));

        // The surviving LIB block anchors the next walk.
        let chain = db.longest_chain().unwrap();
        assert_eq!(chain[0].id, "00000101a");
    }

    #[test]
    fn purge_without_lib_is_a_noop() {
        let mut db = ForkDb::new();
        db.add_link(file("0000000100-20210728T105016.01-00000100a-00000099a-90-w1"));
        let mut called = false;
        db.purge_below_lib(|purged| {
            called = true;
            assert!(purged.is_empty());
        });
        assert!(called);
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn set_lib_requires_a_known_block() {
        let mut db = ForkDb::new();
        db.add_link(file("0000000100-20210728T105016.01-00000100a-00000099a-90-w1"));
        db.set_lib("unknown");
        assert_eq!(db.lib_id(), None);
        db.set_lib("00000100a");
        db.set_lib("00000100a");
        assert_eq!(db.lib_id(), Some("00000100a"));
    }
}
