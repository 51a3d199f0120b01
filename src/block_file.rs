//! One-block archive file identity: filename codec, replica deduplication and memoized payload

use anyhow::{Result, anyhow, bail};
use chrono::NaiveDateTime;
use std::collections::BTreeSet;

/// Timestamp layout used inside one-block filenames (fractional seconds, no zone)
pub const BLOCK_TIME_LAYOUT: &str = "%Y%m%dT%H%M%S%.f";

/// A one-block archive file as seen in the source store.
///
/// Filenames look like:
/// * `0000000100-20170701T122141.0-24a07267-e5914b39`
/// * `0000000101-20170701T122141.5-dbda3f44-24a07267-writer1`
/// * `0000000101-20170701T122141.5-dbda3f44-24a07267-100-writer1`
///
/// The same logical block may be uploaded by several writers under different
/// producer suffixes; all observed source filenames are collected so every
/// replica can be deleted once the block has been bundled.
#[derive(Debug, Clone)]
pub struct BlockFile {
    /// Producer-suffix-stripped name, the deduplication key
    pub canonical_name: String,
    /// Every source filename that parsed to this block
    pub filenames: BTreeSet<String>,
    pub block_time: NaiveDateTime,
    pub id: String,
    pub parent_id: String,
    pub num: u64,
    /// The block's own view of the last irreversible height; absent on legacy names
    pub lib_num: Option<u64>,
    /// True when the block was loaded back from an already written bundle
    pub merged: bool,
    payload: Option<Vec<u8>>,
}

impl BlockFile {
    /// Parse a source filename into a block file carrying that single filename.
    pub fn from_filename(filename: &str) -> Result<Self> {
        let parsed = parse_filename(filename)?;
        Ok(Self {
            canonical_name: parsed.canonical_name,
            filenames: BTreeSet::from([filename.to_string()]),
            block_time: parsed.block_time,
            id: parsed.id,
            parent_id: parsed.parent_id,
            num: parsed.num,
            lib_num: parsed.lib_num,
            merged: false,
            payload: None,
        })
    }

    /// Same as [`Self::from_filename`] but flagged as coming from a written bundle.
    pub fn merged_from_filename(filename: &str) -> Result<Self> {
        let mut file = Self::from_filename(filename)?;
        file.merged = true;
        Ok(file)
    }

    /// The block's declared last irreversible height.
    ///
    /// Admission rejects legacy lib-less names, so a missing value past that
    /// point is an invariant breach.
    pub fn lib_num(&self) -> u64 {
        self.lib_num
            .unwrap_or_else(|| panic!("block {} admitted without a lib num", self.canonical_name))
    }

    /// One of the source filenames, deterministically chosen, for store reads.
    pub fn preferred_filename(&self) -> &str {
        self.filenames
            .first()
            .map(String::as_str)
            .unwrap_or(&self.canonical_name)
    }

    /// Fetch the file payload through `download`, at most once per block file.
    pub fn data(&mut self, download: impl FnOnce(&BlockFile) -> Result<Vec<u8>>) -> Result<&[u8]> {
        if self.payload.is_none() {
            let data = download(&*self)?;
            self.payload = Some(data);
        }
        Ok(self.payload.as_deref().unwrap_or_default())
    }
}

/// Fields recovered from a one-block filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFilename {
    pub num: u64,
    pub block_time: NaiveDateTime,
    pub id: String,
    pub parent_id: String,
    pub lib_num: Option<u64>,
    pub canonical_name: String,
}

/// Parse the one-block filename grammar.
///
/// Four to six dash-separated fields: num, time, id and parent, optionally
/// followed by a lib num and a producer suffix. With six fields the fifth is
/// the lib num and the canonical name is the first five fields. Five fields
/// are ambiguous; a numeric fifth field is a lib num (the canonical form of a
/// six-field name round-trips through this rule), anything else is a producer
/// suffix on a legacy lib-less name.
pub fn parse_filename(filename: &str) -> Result<ParsedFilename> {
    let parts: Vec<&str> = filename.split('-').collect();
    if parts.len() < 4 || parts.len() > 6 {
        bail!("wrong filename format: {filename:?}");
    }

    let num: u64 = parts[0]
        .parse()
        .map_err(|e| anyhow!("failed parsing block num {:?}: {e}", parts[0]))?;

    let block_time = NaiveDateTime::parse_from_str(parts[1], BLOCK_TIME_LAYOUT)
        .map_err(|e| anyhow!("failed parsing block time {:?}: {e}", parts[1]))?;

    let id = parts[2].to_string();
    let parent_id = parts[3].to_string();

    let mut lib_num = None;
    let mut canonical_name = filename.to_string();
    if parts.len() == 6 {
        let lib: u64 = parts[4]
            .parse()
            .map_err(|e| anyhow!("failed parsing lib num {:?}: {e}", parts[4]))?;
        lib_num = Some(lib);
        canonical_name = parts[0..5].join("-");
    } else if parts.len() == 5
        && let Ok(lib) = parts[4].parse::<u64>()
    {
        lib_num = Some(lib);
    }

    Ok(ParsedFilename {
        num,
        block_time,
        id,
        parent_id,
        lib_num,
        canonical_name,
    })
}

/// Format a block height as the 10-digit base name used for merged bundles.
pub fn base_name(num: u64) -> String {
    format!("{num:010}")
}
