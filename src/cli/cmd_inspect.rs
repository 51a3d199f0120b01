use anyhow::Result;
use blockbundle::block_file::base_name;
use blockbundle::bundle_io;
use blockbundle::format::format_bytes;
use blockbundle::store::{BlockStore, FsStore};
use clap::Args;
use std::path::PathBuf;

#[derive(Args)]
pub struct InspectCommand {
    /// Low block num of the bundle to inspect
    pub low_block_num: u64,

    /// Directory holding merged bundles
    #[arg(long, value_name = "DIR")]
    pub merged_blocks_store: PathBuf,
}

pub fn run(cmd: InspectCommand) -> Result<()> {
    let store = FsStore::open(&cmd.merged_blocks_store)?;
    let bundle_name = base_name(cmd.low_block_num);
    let size = store.read(&bundle_name)?.len() as u64;
    let files = bundle_io::read_bundle(&store, cmd.low_block_num)?;

    println!(
        "bundle {bundle_name}: {} blocks, {}",
        files.len(),
        format_bytes(size)
    );
    for file in files {
        let lib = file
            .lib_num
            .map(|n| n.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:>10}  {}  parent {}  lib {}  at {}",
            file.num, file.id, file.parent_id, lib, file.block_time
        );
    }
    Ok(())
}
