//! Shared types of the demultiplexer public surface

use serde::Serialize;

use crate::es::Es;
use crate::pes::PesPacketConsumer;

/// Consumer callback surface, fired synchronously from the thread draining
/// the byte source. Every callback has a no-op default, so consumers only
/// implement what they care about.
pub trait DemuxEvents {
    /// A complete PAT declared a program this consumer has not seen yet.
    fn on_program_added(&mut self, program_id: u16, pmt_pid: u16) {
        let _ = (program_id, pmt_pid);
    }

    /// A complete PAT no longer declares the program.
    fn on_program_removed(&mut self, program_id: u16, pmt_pid: u16) {
        let _ = (program_id, pmt_pid);
    }

    /// The program's PMT moved its PCR to another PID.
    fn on_pcr_pid_changed(&mut self, program_id: u16, pcr_pid: u16) {
        let _ = (program_id, pcr_pid);
    }

    /// A complete PMT declared a new elementary stream. Returning a consumer
    /// installs a PES reader on `pid`; `None` leaves the stream undecoded.
    fn on_stream_added(
        &mut self,
        program_id: u16,
        pid: u16,
        es: &Es,
    ) -> Option<Box<dyn PesPacketConsumer>> {
        let _ = (program_id, pid, es);
        None
    }

    /// The stream disappeared from its program's PMT (or the whole program
    /// was dropped from the PAT).
    fn on_stream_removed(&mut self, program_id: u16, pid: u16, es: &Es) {
        let _ = (program_id, pid, es);
    }

    /// The PAT carried a network PID (program number 0).
    fn on_network_pid(&mut self, network_pid: u16) {
        let _ = network_pid;
    }
}

/// Packet accounting maintained by the demuxer.
///
/// Every packet read falls in exactly one bucket:
/// `packets == corrupted_packets + null_packets + payloads + adaptation_only`.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct DemuxStats {
    /// Total 188-byte packets consumed from the source.
    pub packets: u64,
    /// Packets dropped for a set transport_error_indicator, a malformed
    /// adaptation field, or a reserved adaptation_field_control.
    pub corrupted_packets: u64,
    /// Null packets (PID 0x1FFF), discarded silently.
    pub null_packets: u64,
    /// Payloads handed to the PID dispatcher.
    pub payloads: u64,
    /// Valid packets carrying an adaptation field but no payload.
    pub adaptation_only: u64,
}

/// Configuration for the UDP entry point.
pub struct Options {
    pub addr: std::net::SocketAddr,
    pub refresh_secs: u64,
}
