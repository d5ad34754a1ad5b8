//! Demux entry points wired to byte sources.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Context;
use log::info;
use tokio::net::UdpSocket;

use crate::network::create_udp_socket;
use crate::processor::Demuxer;
use crate::report::{DemuxReport, Reporter};
use crate::types::Options;

/// Main entry point for UDP socket-based demuxing. Prints a JSON snapshot
/// of the service layout every `refresh_secs`.
pub async fn run(opts: Options) -> anyhow::Result<()> {
    let socket = create_udp_socket(opts.addr)?;
    let sock = UdpSocket::from_std(socket.into())?;

    let mut demuxer = Demuxer::new(Reporter::new());
    let mut buf = [0u8; 2048];
    let mut last_print = Instant::now();

    loop {
        let n = sock.recv(&mut buf).await?;
        if n == 0 {
            continue;
        }

        demuxer.push_packets(&buf[..n]);

        if last_print.elapsed() >= Duration::from_secs(opts.refresh_secs) {
            let report = demuxer.events().report(demuxer.stats(), demuxer.pcr_map());
            println!("{}", report.to_json());
            last_print = Instant::now();
        }
    }
}

/// Entry point for TS packets arriving over a `tokio::broadcast` channel;
/// each buffer holds 188-byte aligned packets. Periodic reports are
/// delivered through `callback`. Returns when the channel closes.
pub async fn run_broadcast<F>(
    rx: &mut tokio::sync::broadcast::Receiver<Vec<u8>>,
    refresh_secs: u64,
    callback: &mut F,
) -> anyhow::Result<()>
where
    F: FnMut(DemuxReport) + Send,
{
    let mut demuxer = Demuxer::new(Reporter::new());
    let mut last_print = Instant::now();

    loop {
        let buf = rx.recv().await?;
        demuxer.push_packets(&buf);

        if last_print.elapsed() >= Duration::from_secs(refresh_secs) {
            callback(demuxer.events().report(demuxer.stats(), demuxer.pcr_map()));
            last_print = Instant::now();
        }
    }
}

/// Parses a local TS file to end of stream and returns the final snapshot.
pub fn run_file(path: &Path) -> anyhow::Result<DemuxReport> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut reader = BufReader::new(file);

    let mut demuxer = Demuxer::new(Reporter::new());
    demuxer.parse(&mut reader)?;
    info!("done");

    Ok(demuxer.events().report(demuxer.stats(), demuxer.pcr_map()))
}
