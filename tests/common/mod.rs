use blockbundle::block_file::BlockFile;
use blockbundle::bundle_io::{BLOCK_HEADER_LEN, block_header, encode_block_payload};
use blockbundle::parse_filename;
use blockbundle::store::{BlockStore, FsStore};

#[allow(dead_code)]
pub fn block(name: &str) -> BlockFile {
    BlockFile::from_filename(name).unwrap()
}

#[allow(dead_code)]
pub fn merged_block(name: &str) -> BlockFile {
    BlockFile::merged_from_filename(name).unwrap()
}

#[allow(dead_code)]
pub fn ids(files: &[BlockFile]) -> Vec<&str> {
    files.iter().map(|file| file.id.as_str()).collect()
}

/// Write a framed one-block file into a source store under `name`.
#[allow(dead_code)]
pub fn put_one_block(store: &FsStore, name: &str, body: &[u8]) {
    let canonical = parse_filename(name).unwrap().canonical_name;
    store
        .put(name, &encode_block_payload(&canonical, body))
        .unwrap();
}

/// Compose a merged bundle directly in a sink store: header once, then one
/// header-stripped record per name.
#[allow(dead_code)]
pub fn put_bundle(store: &FsStore, bundle_name: &str, names: &[&str]) {
    let mut bundle = block_header().to_vec();
    for name in names {
        let canonical = parse_filename(name).unwrap().canonical_name;
        let payload = encode_block_payload(&canonical, format!("body-of-{name}").as_bytes());
        bundle.extend_from_slice(&payload[BLOCK_HEADER_LEN..]);
    }
    store.put(bundle_name, &bundle).unwrap();
}
