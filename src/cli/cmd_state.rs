use anyhow::Result;
use blockbundle::state;
use clap::Args;
use std::path::PathBuf;

#[derive(Args)]
pub struct StateCommand {
    /// Bundler state file to describe
    pub state_file: PathBuf,
}

pub fn run(cmd: StateCommand) -> Result<()> {
    let bundler = state::load(&cmd.state_file)?;

    println!("{bundler}");
    println!("tracked blocks: {}", bundler.fork_db().len());
    match bundler.last_merged() {
        Some(last) => println!("last merged: {}", last.canonical_name),
        None => println!("last merged: none"),
    }
    if let Some(chain) = bundler.longest_chain() {
        println!("longest chain: {} blocks", chain.len());
    } else {
        println!("longest chain: none or ambiguous");
    }
    Ok(())
}
