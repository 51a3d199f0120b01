//! One-block binary framing and merged-bundle assembly
//!
//! Format:
//! - Fixed 8-byte header (magic + format version), written once per bundle
//! - One record per block: name length (u32 LE), canonical name, body length
//!   (u32 LE), body
//!
//! A one-block file is a header followed by a single record; a merged bundle
//! is the first file's header followed by every included file's record with
//! its own header stripped. Embedded canonical names make written bundles
//! self-describing, which is what bootstrap relies on.

use crate::block_file::{BlockFile, base_name};
use crate::store::BlockStore;
use anyhow::{Result, bail};
use log::debug;
use std::fmt;

/// A one-block payload that cannot be assembled: short header or empty body.
///
/// Distinguished from plain store errors so the scan loop aborts the bundle
/// instead of retrying; only replacement uploads can repair this.
#[derive(Debug)]
pub struct CorruptBlockFile(pub String);

impl fmt::Display for CorruptBlockFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "one-block file corrupt: {}", self.0)
    }
}

impl std::error::Error for CorruptBlockFile {}

/// Fixed length of the one-block binary header
pub const BLOCK_HEADER_LEN: usize = 8;

/// First header bytes of every one-block file and merged bundle
pub const BLOCK_MAGIC: [u8; 4] = *b"BBLK";

/// Current binary format version
pub const BLOCK_FORMAT_VERSION: u16 = 1;

/// The constant header emitted at the head of every one-block file.
pub fn block_header() -> [u8; BLOCK_HEADER_LEN] {
    let mut header = [0u8; BLOCK_HEADER_LEN];
    header[0..4].copy_from_slice(&BLOCK_MAGIC);
    header[4..6].copy_from_slice(&BLOCK_FORMAT_VERSION.to_le_bytes());
    header
}

/// Encode a complete one-block file payload: header plus one record.
pub fn encode_block_payload(canonical_name: &str, body: &[u8]) -> Vec<u8> {
    let name = canonical_name.as_bytes();
    let mut payload =
        Vec::with_capacity(BLOCK_HEADER_LEN + 8 + name.len() + body.len());
    payload.extend_from_slice(&block_header());
    payload.extend_from_slice(&(name.len() as u32).to_le_bytes());
    payload.extend_from_slice(name);
    payload.extend_from_slice(&(body.len() as u32).to_le_bytes());
    payload.extend_from_slice(body);
    payload
}

fn check_bundle_header(data: &[u8], what: &str) -> Result<()> {
    if data.len() < BLOCK_HEADER_LEN {
        bail!(
            "{what} corrupt: expected header of {BLOCK_HEADER_LEN} bytes, got {} bytes",
            data.len()
        );
    }
    if data[0..4] != BLOCK_MAGIC {
        bail!("{what} corrupt: bad magic {:02x?}", &data[0..4]);
    }
    let version = u16::from_le_bytes([data[4], data[5]]);
    if version != BLOCK_FORMAT_VERSION {
        bail!("{what} has unsupported format version {version}");
    }
    Ok(())
}

fn read_u32(data: &[u8], offset: &mut usize, what: &str) -> Result<usize> {
    let end = *offset + 4;
    if end > data.len() {
        bail!("{what} truncated at offset {offset}");
    }
    let value = u32::from_le_bytes([
        data[*offset],
        data[*offset + 1],
        data[*offset + 2],
        data[*offset + 3],
    ]);
    *offset = end;
    Ok(value as usize)
}

fn read_slice<'a>(data: &'a [u8], offset: &mut usize, len: usize, what: &str) -> Result<&'a [u8]> {
    let end = *offset + len;
    if end > data.len() {
        bail!("{what} truncated at offset {offset}");
    }
    let slice = &data[*offset..end];
    *offset = end;
    Ok(slice)
}

/// Assemble the bundle starting at `low_block_num` from `files` and write it
/// to the sink store under its 10-digit base name.
///
/// Payloads are fetched from the source store, memoized on the block files.
/// The first file contributes the binary header; every file at or above
/// `low_block_num` contributes its record with the header stripped. Blocks
/// below the window (deep fork remnants) carry no archival value here and are
/// skipped. A short header or an empty record is reported as
/// [`CorruptBlockFile`] and the bundle is not written.
///
/// Returns the number of bytes written to the sink.
pub fn merge_and_store(
    source: &dyn BlockStore,
    sink: &dyn BlockStore,
    low_block_num: u64,
    files: &mut [BlockFile],
) -> Result<u64> {
    let bundle_name = base_name(low_block_num);
    if files.is_empty() {
        bail!("no block files to merge for bundle {bundle_name}");
    }

    let header = {
        let data = files[0].data(|file| source.read(file.preferred_filename()))?;
        if data.len() < BLOCK_HEADER_LEN {
            return Err(CorruptBlockFile(format!(
                "expected header of {BLOCK_HEADER_LEN} bytes, file is only {} bytes",
                data.len()
            ))
            .into());
        }
        data[..BLOCK_HEADER_LEN].to_vec()
    };

    let mut bundle = header;
    for file in files.iter_mut() {
        if file.num < low_block_num {
            debug!(
                "leaving {} out of bundle {bundle_name}: below the window",
                file.canonical_name
            );
            continue;
        }
        let name = file.preferred_filename().to_string();
        let data = file.data(|file| source.read(file.preferred_filename()))?;
        if data.len() < BLOCK_HEADER_LEN {
            return Err(CorruptBlockFile(format!(
                "expected header of {BLOCK_HEADER_LEN} bytes, {name} is only {} bytes",
                data.len()
            ))
            .into());
        }
        let body = &data[BLOCK_HEADER_LEN..];
        if body.is_empty() {
            return Err(CorruptBlockFile(format!("empty data in {name}")).into());
        }
        bundle.extend_from_slice(body);
    }

    sink.put(&bundle_name, &bundle)?;
    Ok(bundle.len() as u64)
}

/// Read the merged bundle at `low_block_num` back into block files flagged
/// merged, by parsing the canonical names embedded in each record.
pub fn read_bundle(store: &dyn BlockStore, low_block_num: u64) -> Result<Vec<BlockFile>> {
    let bundle_name = base_name(low_block_num);
    let data = store.read(&bundle_name)?;
    check_bundle_header(&data, "merged bundle")?;

    let mut offset = BLOCK_HEADER_LEN;
    let mut files = Vec::new();
    while offset < data.len() {
        let name_len = read_u32(&data, &mut offset, "merged bundle")?;
        let name_bytes = read_slice(&data, &mut offset, name_len, "merged bundle")?;
        let name = std::str::from_utf8(name_bytes)
            .map_err(|_| anyhow::anyhow!("merged bundle {bundle_name} holds a non-utf8 name"))?;
        let body_len = read_u32(&data, &mut offset, "merged bundle")?;
        read_slice(&data, &mut offset, body_len, "merged bundle")?;
        files.push(BlockFile::merged_from_filename(name)?);
    }
    Ok(files)
}

/// First bundle base at or above `minimal_block_num` that has not been
/// written yet. The next window therefore ends at the returned base plus one
/// bundle size.
pub fn find_next_base(
    sink: &dyn BlockStore,
    minimal_block_num: u64,
    bundle_size: u64,
) -> Result<u64> {
    let mut base = minimal_block_num;
    while sink.exists(&base_name(base))? {
        base += bundle_size;
    }
    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FsStore;
    use std::time::Duration;

    fn source_with(files: &[(&str, &[u8])]) -> (tempfile::TempDir, FsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).unwrap();
        for (name, body) in files {
            let parsed = crate::block_file::parse_filename(name).unwrap();
            store
                .put(name, &encode_block_payload(&parsed.canonical_name, body))
                .unwrap();
        }
        (dir, store)
    }

    #[test]
    fn merge_then_read_back_recovers_identities() {
        let (_dir, source) = source_with(&[
            ("0000000100-20210728T105016.01-00000100a-00000099a-90-w1", b"aaa"),
            ("0000000101-20210728T105016.02-00000101a-00000100a-100-w1", b"bbb"),
        ]);
        let sink_dir = tempfile::tempdir().unwrap();
        let sink = FsStore::open(sink_dir.path()).unwrap();

        let mut files: Vec<BlockFile> = source
            .list(10, Duration::ZERO)
            .unwrap()
            .iter()
            .map(|name| BlockFile::from_filename(name).unwrap())
            .collect();
        merge_and_store(&source, &sink, 100, &mut files).unwrap();

        let recovered = read_bundle(&sink, 100).unwrap();
        let ids: Vec<&str> = recovered.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["00000100a", "00000101a"]);
        assert!(recovered.iter().all(|f| f.merged));
        assert_eq!(recovered[0].lib_num, Some(90));
    }

    #[test]
    fn blocks_below_the_window_are_left_out() {
        let (_dir, source) = source_with(&[
            ("0000000098-20210728T105016.01-00000098a-00000097a-96-w1", b"old"),
            ("0000000100-20210728T105016.02-00000100a-00000099a-98-w1", b"new"),
        ]);
        let sink_dir = tempfile::tempdir().unwrap();
        let sink = FsStore::open(sink_dir.path()).unwrap();

        let mut files = vec![
            BlockFile::from_filename("0000000098-20210728T105016.01-00000098a-00000097a-96-w1")
                .unwrap(),
            BlockFile::from_filename("0000000100-20210728T105016.02-00000100a-00000099a-98-w1")
                .unwrap(),
        ];
        merge_and_store(&source, &sink, 100, &mut files).unwrap();

        let recovered = read_bundle(&sink, 100).unwrap();
        let ids: Vec<&str> = recovered.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["00000100a"]);
    }

    #[test]
    fn short_header_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let source = FsStore::open(dir.path()).unwrap();
        let name = "0000000100-20210728T105016.01-00000100a-00000099a-90-w1";
        source.put(name, b"zz").unwrap();

        let sink_dir = tempfile::tempdir().unwrap();
        let sink = FsStore::open(sink_dir.path()).unwrap();
        let mut files = vec![BlockFile::from_filename(name).unwrap()];

        let err = merge_and_store(&source, &sink, 100, &mut files).unwrap_err();
        assert!(err.to_string().contains("corrupt"), "{err:#}");
        assert!(!sink.exists("0000000100").unwrap());
    }

    #[test]
    fn empty_body_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let source = FsStore::open(dir.path()).unwrap();
        // A payload that is exactly the header carries no record bytes.
        let name = "0000000101-20210728T105016.02-00000101a-00000100a-100-w1";
        source.put(name, &block_header()).unwrap();

        let sink_dir = tempfile::tempdir().unwrap();
        let sink = FsStore::open(sink_dir.path()).unwrap();
        let mut files = vec![BlockFile::from_filename(name).unwrap()];
        let err = merge_and_store(&source, &sink, 100, &mut files).unwrap_err();
        assert!(err.to_string().contains("empty data"), "{err:#}");
    }

    #[test]
    fn merging_nothing_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = FsStore::open(dir.path()).unwrap();
        let sink = FsStore::open(dir.path().join("sink")).unwrap();
        assert!(merge_and_store(&source, &sink, 100, &mut []).is_err());
    }

    #[test]
    fn truncated_bundle_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FsStore::open(dir.path()).unwrap();
        let mut payload = encode_block_payload(
            "0000000100-20210728T105016.01-00000100a-00000099a-90",
            b"data",
        );
        payload.truncate(payload.len() - 2);
        sink.put("0000000100", &payload).unwrap();

        let err = read_bundle(&sink, 100).unwrap_err();
        assert!(err.to_string().contains("truncated"), "{err:#}");
    }

    #[test]
    fn find_next_base_walks_past_written_bundles() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FsStore::open(dir.path()).unwrap();
        assert_eq!(find_next_base(&sink, 0, 100).unwrap(), 0);

        sink.put("0000000000", b"x").unwrap();
        sink.put("0000000100", b"x").unwrap();
        assert_eq!(find_next_base(&sink, 0, 100).unwrap(), 200);
        assert_eq!(find_next_base(&sink, 100, 100).unwrap(), 200);
    }
}
