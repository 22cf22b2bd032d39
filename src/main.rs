mod api;
mod capture;
mod classifier;
mod command;
mod frame;
mod inspector;
mod stats;
mod storage;
mod system;
mod utils;
mod web;

use clap::Parser;
use command::{run, Opt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();
    run(opt).await?;
    Ok(())
}
