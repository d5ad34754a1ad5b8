//! TS packet framing and PID dispatch.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::io::Read;

use log::{debug, trace, warn};

use crate::constants::{PID_NULL, PID_PAT, TS_PACKET_SIZE, TS_SYNC_BYTE, TICKS_PER_MS};
use crate::es::Es;
use crate::pes::PesReader;
use crate::psi::{PsiReader, pat::PatTable, pmt::PmtTable};
use crate::types::{DemuxEvents, DemuxStats};

/// Fills `buf` from `source`, looping over short reads. Returns false on a
/// clean end of stream; a truncated trailing packet is warned about and
/// also ends the stream.
fn read_full<R: Read>(source: &mut R, buf: &mut [u8]) -> anyhow::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..])?;
        if n == 0 {
            if filled > 0 {
                warn!("truncated packet at end of stream ({filled} bytes)");
            }
            return Ok(false);
        }
        filled += n;
    }
    Ok(true)
}

/// Per-PID payload reader installed in the dispatcher map.
pub trait TsPayloadReader {
    fn read_payload(
        &mut self,
        data: &[u8],
        pusi: bool,
        scrambling: u8,
        discontinuity: bool,
        ctx: &mut DemuxContext<'_>,
    );

    /// The reader is being dropped from the dispatcher map.
    fn on_unregistered(&mut self, ctx: &mut DemuxContext<'_>) {
        let _ = ctx;
    }
}

/// Registration surface handed to a reader while it holds the dispatch
/// slot for its PID. Readers use it to install or retire other readers and
/// to fire consumer callbacks; the reader's own slot is detached for the
/// duration of the call, so map mutations never alias it.
pub struct DemuxContext<'a> {
    pub(crate) readers: &'a mut HashMap<u16, Box<dyn TsPayloadReader>>,
    pub(crate) pcr_pids: &'a mut HashMap<u16, u16>,
    pub(crate) pcr_ms: &'a mut HashMap<u16, f64>,
    pub(crate) events: &'a mut dyn DemuxEvents,
}

impl DemuxContext<'_> {
    pub(crate) fn program_added(&mut self, program_id: u16, pmt_pid: u16) {
        self.events.on_program_added(program_id, pmt_pid);
        self.readers.insert(
            pmt_pid,
            Box::new(PsiReader::new(pmt_pid, PmtTable::new(pmt_pid, program_id))),
        );
    }

    pub(crate) fn program_removed(&mut self, program_id: u16, pmt_pid: u16) {
        self.events.on_program_removed(program_id, pmt_pid);
        if let Some(mut reader) = self.readers.remove(&pmt_pid) {
            reader.on_unregistered(self);
        }
        self.pcr_pids.remove(&program_id);
        self.pcr_ms.remove(&program_id);
    }

    pub(crate) fn pcr_pid_changed(&mut self, program_id: u16, pcr_pid: u16) {
        self.pcr_pids.insert(program_id, pcr_pid);
        self.pcr_ms.insert(program_id, 0.0);
        self.events.on_pcr_pid_changed(program_id, pcr_pid);
    }

    pub(crate) fn stream_added(&mut self, program_id: u16, pid: u16, es: &Es) {
        if let Some(consumer) = self.events.on_stream_added(program_id, pid, es) {
            self.readers
                .insert(pid, Box::new(PesReader::new(pid, es.clone(), consumer)));
        }
    }

    pub(crate) fn stream_removed(&mut self, program_id: u16, pid: u16, es: &Es) {
        self.events.on_stream_removed(program_id, pid, es);
        self.readers.remove(&pid);
    }

    pub(crate) fn network_pid(&mut self, pid: u16) {
        self.events.on_network_pid(pid);
    }
}

/// Pull-based MPEG-TS demultiplexer.
///
/// Routes each packet's payload to the reader registered for its PID. The
/// PAT reader on PID 0 is installed at construction; PMT readers come and
/// go with PAT versions, PES readers with PMT versions (when the
/// [`DemuxEvents`] consumer asks for them).
pub struct Demuxer<E: DemuxEvents> {
    continuity: HashMap<u16, u8>,
    readers: HashMap<u16, Box<dyn TsPayloadReader>>,
    pcr_pids: HashMap<u16, u16>,
    pcr_ms: HashMap<u16, f64>,
    stats: DemuxStats,
    events: E,
}

impl<E: DemuxEvents> Demuxer<E> {
    pub fn new(events: E) -> Self {
        let mut readers: HashMap<u16, Box<dyn TsPayloadReader>> = HashMap::new();
        readers.insert(PID_PAT, Box::new(PsiReader::new(PID_PAT, PatTable::new())));
        Demuxer {
            continuity: HashMap::new(),
            readers,
            pcr_pids: HashMap::new(),
            pcr_ms: HashMap::new(),
            stats: DemuxStats::default(),
            events,
        }
    }

    pub fn events(&self) -> &E {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut E {
        &mut self.events
    }

    pub fn stats(&self) -> DemuxStats {
        self.stats
    }

    /// Latest PCR of `program_id` in milliseconds, if any was seen.
    pub fn pcr_ms(&self, program_id: u16) -> Option<f64> {
        self.pcr_ms.get(&program_id).copied()
    }

    /// PCR PID declared by the program's PMT.
    pub fn pcr_pid(&self, program_id: u16) -> Option<u16> {
        self.pcr_pids.get(&program_id).copied()
    }

    pub fn pcr_map(&self) -> &HashMap<u16, f64> {
        &self.pcr_ms
    }

    /// Drains `source` to end of stream, resynchronising on the sync byte.
    /// Every resync step shifts by one byte and emits a warning.
    pub fn parse<R: Read>(&mut self, source: &mut R) -> anyhow::Result<()> {
        let mut pkt = [0u8; TS_PACKET_SIZE];
        'outer: loop {
            if !read_full(source, &mut pkt)? {
                break;
            }

            while pkt[0] != TS_SYNC_BYTE {
                warn!("need resync: 0x{:02x} vs 0x{TS_SYNC_BYTE:02x}", pkt[0]);
                let mut extra = [0u8; 1];
                if source.read(&mut extra)? == 0 {
                    break 'outer;
                }
                pkt.copy_within(1.., 0);
                pkt[TS_PACKET_SIZE - 1] = extra[0];
            }

            self.push_packet(&pkt);
        }
        debug!("end of stream after {} packets", self.stats.packets);
        Ok(())
    }

    /// Feeds a buffer of 188-byte aligned packets (e.g. one UDP datagram).
    /// Chunks not starting with the sync byte are skipped with a warning;
    /// there is no cross-buffer resynchronisation on this path.
    pub fn push_packets(&mut self, data: &[u8]) {
        for chunk in data.chunks_exact(TS_PACKET_SIZE) {
            if chunk[0] != TS_SYNC_BYTE {
                warn!("skipping misaligned chunk: 0x{:02x} vs 0x{TS_SYNC_BYTE:02x}", chunk[0]);
                continue;
            }
            let mut pkt = [0u8; TS_PACKET_SIZE];
            pkt.copy_from_slice(chunk);
            self.push_packet(&pkt);
        }
    }

    /// Processes a single 188-byte packet.
    pub fn push_packet(&mut self, pkt: &[u8; TS_PACKET_SIZE]) {
        self.stats.packets += 1;

        let transport_error = pkt[1] & 0x80 != 0;
        let pusi = pkt[1] & 0x40 != 0;
        let pid = u16::from_be_bytes([pkt[1] & 0x1F, pkt[2]]);
        let scrambling = pkt[3] >> 6;
        let afield_ctrl = (pkt[3] >> 4) & 0x3;
        let continuity_counter = pkt[3] & 0x0F;

        if pid == PID_NULL {
            self.stats.null_packets += 1;
            return;
        }

        if transport_error {
            self.stats.corrupted_packets += 1;
            warn!("transport_error_indicator set (pid 0x{pid:04x})");
            return;
        }

        trace!(
            "TS PKT [{:06}|pid:0x{pid:04x}{}]",
            self.stats.packets,
            if pusi { "|PUSI" } else { "" }
        );

        let mut offset = 4usize;
        match afield_ctrl {
            0b00 => {
                // reserved
                self.stats.corrupted_packets += 1;
                warn!("reserved adaptation_field_control (pid 0x{pid:04x})");
                return;
            }
            0b10 | 0b11 => {
                let afield_len = pkt[4] as usize;
                if afield_len > 183 || (afield_len == 183 && afield_ctrl != 0b10) {
                    self.stats.corrupted_packets += 1;
                    warn!("invalid adaptation field length {afield_len} (pid 0x{pid:04x})");
                    return;
                }
                self.decode_adaptation_field(pid, &pkt[5..5 + afield_len]);
                offset = 5 + afield_len;
                if afield_ctrl == 0b10 {
                    self.stats.adaptation_only += 1;
                    return;
                }
            }
            _ => {} // 0b01: payload only
        }

        // continuity is only tracked for packets that carry payload
        let mut discontinuity = false;
        match self.continuity.entry(pid) {
            Entry::Vacant(entry) => {
                // first observation seeds the counter
                entry.insert(continuity_counter);
            }
            Entry::Occupied(mut entry) => {
                let expected = (*entry.get() + 1) & 0x0F;
                if expected != continuity_counter {
                    warn!(
                        "continuity check failed for pid 0x{pid:04x} ({continuity_counter} vs {expected})"
                    );
                    discontinuity = true;
                }
                entry.insert(continuity_counter);
            }
        }

        self.stats.payloads += 1;
        let payload = &pkt[offset..];

        if let Some(mut reader) = self.readers.remove(&pid) {
            let mut ctx = DemuxContext {
                readers: &mut self.readers,
                pcr_pids: &mut self.pcr_pids,
                pcr_ms: &mut self.pcr_ms,
                events: &mut self.events,
            };
            reader.read_payload(payload, pusi, scrambling, discontinuity, &mut ctx);
            // a reader may have been installed on this PID while ours was
            // detached; the newer one wins
            self.readers.entry(pid).or_insert(reader);
        }
    }

    fn decode_adaptation_field(&mut self, pid: u16, body: &[u8]) {
        if body.is_empty() {
            // length 0: a single stuffing byte
            return;
        }
        let flags = body[0];
        if flags & 0x80 != 0 {
            trace!("discontinuity_indicator (pid 0x{pid:04x})");
        }
        if flags & 0x10 != 0 {
            if body.len() < 7 {
                warn!("truncated PCR in adaptation field (pid 0x{pid:04x})");
                return;
            }
            let p = &body[1..7];
            let base = ((p[0] as u64) << 25)
                | ((p[1] as u64) << 17)
                | ((p[2] as u64) << 9)
                | ((p[3] as u64) << 1)
                | ((p[4] as u64) >> 7);
            let pcr = base as f64 / TICKS_PER_MS;
            let programs: Vec<u16> = self
                .pcr_pids
                .iter()
                .filter(|&(_, &pcr_pid)| pcr_pid == pid)
                .map(|(&program_id, _)| program_id)
                .collect();
            for program_id in programs {
                trace!("program {program_id} pcr: {pcr}");
                self.pcr_ms.insert(program_id, pcr);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::es::MediaKind;
    use crate::pes::PesPacketConsumer;

    pub(crate) struct NullEvents;

    impl DemuxEvents for NullEvents {}

    /// Runs `f` with a context backed by throwaway maps.
    pub(crate) fn with_ctx<R>(
        events: &mut dyn DemuxEvents,
        f: impl FnOnce(&mut DemuxContext<'_>) -> R,
    ) -> R {
        let mut harness = CtxHarness::new();
        let mut ctx = harness.ctx(events);
        f(&mut ctx)
    }

    /// Context backing whose maps outlive the call, for assertions.
    pub(crate) struct CtxHarness {
        pub readers: HashMap<u16, Box<dyn TsPayloadReader>>,
        pub pcr_pids: HashMap<u16, u16>,
        pub pcr_ms: HashMap<u16, f64>,
    }

    impl CtxHarness {
        pub fn new() -> Self {
            CtxHarness {
                readers: HashMap::new(),
                pcr_pids: HashMap::new(),
                pcr_ms: HashMap::new(),
            }
        }

        pub fn ctx<'a>(&'a mut self, events: &'a mut dyn DemuxEvents) -> DemuxContext<'a> {
            DemuxContext {
                readers: &mut self.readers,
                pcr_pids: &mut self.pcr_pids,
                pcr_ms: &mut self.pcr_ms,
                events,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum RecordedEvent {
        ProgramAdded(u16, u16),
        ProgramRemoved(u16, u16),
        PcrPidChanged(u16, u16),
        StreamAdded(u16, u16, MediaKind, Vec<String>),
        StreamRemoved(u16, u16),
        NetworkPid(u16),
    }

    #[derive(Default)]
    pub(crate) struct Recorder {
        pub events: Vec<RecordedEvent>,
    }

    impl DemuxEvents for Recorder {
        fn on_program_added(&mut self, program_id: u16, pmt_pid: u16) {
            self.events.push(RecordedEvent::ProgramAdded(program_id, pmt_pid));
        }

        fn on_program_removed(&mut self, program_id: u16, pmt_pid: u16) {
            self.events
                .push(RecordedEvent::ProgramRemoved(program_id, pmt_pid));
        }

        fn on_pcr_pid_changed(&mut self, program_id: u16, pcr_pid: u16) {
            self.events
                .push(RecordedEvent::PcrPidChanged(program_id, pcr_pid));
        }

        fn on_stream_added(
            &mut self,
            program_id: u16,
            pid: u16,
            es: &Es,
        ) -> Option<Box<dyn PesPacketConsumer>> {
            self.events.push(RecordedEvent::StreamAdded(
                program_id,
                pid,
                es.media_kind,
                es.langs.clone(),
            ));
            None
        }

        fn on_stream_removed(&mut self, program_id: u16, pid: u16, _es: &Es) {
            self.events.push(RecordedEvent::StreamRemoved(program_id, pid));
        }

        fn on_network_pid(&mut self, network_pid: u16) {
            self.events.push(RecordedEvent::NetworkPid(network_pid));
        }
    }
}
