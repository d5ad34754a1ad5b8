use std::path::PathBuf;

use clap::Parser;
use mpegts_demux::{Options, run, run_file};

/// MPEG-TS demultiplexer: watches a UDP source or parses a local file and
/// prints the discovered service layout as JSON.
#[derive(Parser)]
struct Opt {
    /// UDP socket to bind + listen (IPv4)
    #[clap(long, default_value = "239.1.1.2:1234")]
    addr: String,

    /// Refresh interval for the JSON snapshot
    #[clap(long, default_value_t = 2)]
    refresh: u64,

    /// Parse a local TS file instead of listening on UDP
    #[clap(long)]
    file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let opt = Opt::parse();

    if let Some(path) = opt.file {
        let report = run_file(&path)?;
        println!("{}", report.to_json());
        return Ok(());
    }

    run(Options {
        addr: opt.addr.parse()?,
        refresh_secs: opt.refresh,
    })
    .await
}
