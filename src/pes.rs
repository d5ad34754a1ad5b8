//! PES packet reassembly.

use bytes::{Bytes, BytesMut};
use log::{debug, trace, warn};

use crate::constants::{PES_START_CODE, TICKS_PER_MS};
use crate::es::Es;
use crate::processor::{DemuxContext, TsPayloadReader};

/// A contiguous run of PES payload bytes sharing one scrambling control
/// value. Crossing a scrambling boundary mid-packet closes the section.
#[derive(Debug, Clone, PartialEq)]
pub struct PesSection {
    pub data: Bytes,
    pub scrambling: u8,
}

/// One reassembled PES packet.
#[derive(Debug, Clone, PartialEq)]
pub struct PesPacket {
    pub pid: u16,
    pub stream_id: u8,
    pub pts_ms: Option<f64>,
    pub dts_ms: Option<f64>,
    /// Scrambling-homogeneous payload runs, in source order.
    pub sections: Vec<PesSection>,
}

impl PesPacket {
    /// Concatenation of all section bytes, ignoring scrambling grouping.
    pub fn payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload_len());
        for section in &self.sections {
            out.extend_from_slice(&section.data);
        }
        out
    }

    pub fn payload_len(&self) -> usize {
        self.sections.iter().map(|s| s.data.len()).sum()
    }
}

/// Consumer of reassembled PES packets for one elementary stream.
pub trait PesPacketConsumer {
    fn on_pes_packet_complete(&mut self, packet: &PesPacket);
}

/// Decodes a 33-bit PTS/DTS from its 5-byte packing and scales to
/// milliseconds.
pub fn read_timestamp(p: &[u8]) -> f64 {
    let high = ((p[0] & 0x0E) as u64) >> 1;
    let mid = (((p[1] as u64) << 8) | p[2] as u64) >> 1;
    let low = (((p[3] as u64) << 8) | p[4] as u64) >> 1;
    let ticks = (high << 30) | (mid << 15) | low;
    ticks as f64 / TICKS_PER_MS
}

/// Accumulates PES packet payload across TS packets for one PID and hands
/// complete packets to a [`PesPacketConsumer`].
pub struct PesReader {
    pid: u16,
    es: Es,
    consumer: Box<dyn PesPacketConsumer>,
    /// Declared PES packet length; 0 means unbounded.
    packet_len: usize,
    data_left: usize,
    stream_id: u8,
    pts_ms: Option<f64>,
    dts_ms: Option<f64>,
    cur_section: Option<(BytesMut, u8)>,
    sections: Vec<PesSection>,
    assembling: bool,
}

impl PesReader {
    pub fn new(pid: u16, es: Es, consumer: Box<dyn PesPacketConsumer>) -> Self {
        PesReader {
            pid,
            es,
            consumer,
            packet_len: 0,
            data_left: 0,
            stream_id: 0,
            pts_ms: None,
            dts_ms: None,
            cur_section: None,
            sections: Vec::new(),
            assembling: false,
        }
    }

    fn append_data(&mut self, data: &[u8], scrambling: u8) {
        if data.is_empty() {
            return;
        }
        if self.cur_section.is_none() {
            trace!("[PES:0x{:04x}] dropping {} bytes outside packet", self.pid, data.len());
            return;
        }
        if self.packet_len > 0 && self.data_left == 0 {
            warn!(
                "[PES:0x{:04x}] dropping {} bytes past declared length",
                self.pid,
                data.len()
            );
            return;
        }

        let section_scrambling = self.cur_section.as_ref().map(|(_, sc)| *sc);
        if section_scrambling != Some(scrambling) {
            trace!(
                "[PES:0x{:04x}] scrambling changed {section_scrambling:?} => {scrambling}",
                self.pid
            );
            if let Some((buf, sc)) = self.cur_section.take()
                && !buf.is_empty()
            {
                self.sections.push(PesSection {
                    data: buf.freeze(),
                    scrambling: sc,
                });
            }
            self.cur_section = Some((BytesMut::new(), scrambling));
        }
        if let Some((buf, _)) = self.cur_section.as_mut() {
            buf.extend_from_slice(data);
        }

        if self.packet_len > 0 {
            if data.len() >= self.data_left {
                if data.len() > self.data_left {
                    warn!(
                        "[PES:0x{:04x}] adding too much data: {} vs {}",
                        self.pid,
                        data.len(),
                        self.data_left
                    );
                }
                self.data_left = 0;
                self.finish_packet();
            } else {
                self.data_left -= data.len();
            }
        }
    }

    fn finish_packet(&mut self) {
        if !self.assembling {
            self.cur_section = None;
            return;
        }

        if let Some((buf, sc)) = self.cur_section.take()
            && !buf.is_empty()
        {
            self.sections.push(PesSection {
                data: buf.freeze(),
                scrambling: sc,
            });
        }

        let sections = std::mem::take(&mut self.sections);
        self.assembling = false;
        self.packet_len = 0;
        self.data_left = 0;

        if sections.is_empty() {
            debug!("[PES:0x{:04x}] discarding empty pes packet", self.pid);
            return;
        }

        let packet = PesPacket {
            pid: self.pid,
            stream_id: self.stream_id,
            pts_ms: self.pts_ms,
            dts_ms: self.dts_ms,
            sections,
        };
        trace!(
            "[PES:0x{:04x}] {} complete: {} bytes, pts {:?}, dts {:?}",
            self.pid,
            self.es.name,
            packet.payload_len(),
            packet.pts_ms,
            packet.dts_ms
        );
        self.consumer.on_pes_packet_complete(&packet);
    }
}

impl TsPayloadReader for PesReader {
    fn read_payload(
        &mut self,
        data: &[u8],
        pusi: bool,
        scrambling: u8,
        _discontinuity: bool,
        _ctx: &mut DemuxContext<'_>,
    ) {
        if !pusi {
            self.append_data(data, scrambling);
            return;
        }

        if self.assembling && self.packet_len > 0 && self.data_left > 0 {
            warn!(
                "[PES:0x{:04x}] missing end of pes packet: {} bytes",
                self.pid, self.data_left
            );
        }

        // flush the previous packet, complete or not
        self.finish_packet();

        if data.len() < 9 || data[..3] != PES_START_CODE {
            warn!(
                "[PES:0x{:04x}] bad start code or truncated header ({} bytes)",
                self.pid,
                data.len()
            );
            return;
        }

        let stream_id = data[3];
        let packet_len = u16::from_be_bytes([data[4], data[5]]) as usize;

        if data[6] & 0xC0 != 0x80 {
            warn!("[PES:0x{:04x}] invalid marker bits", self.pid);
        }
        let has_pts = data[7] & 0x80 != 0;
        let has_dts = data[7] & 0x40 != 0;
        let header_len = data[8] as usize;

        let body_offset = 9 + header_len;
        if body_offset > data.len() {
            warn!(
                "[PES:0x{:04x}] header length past payload end ({header_len})",
                self.pid
            );
            return;
        }

        self.pts_ms = None;
        self.dts_ms = None;
        if has_pts {
            if header_len >= 5 {
                self.pts_ms = Some(read_timestamp(&data[9..14]));
            } else {
                warn!("[PES:0x{:04x}] pts flagged but header too short", self.pid);
            }
        }
        if has_dts {
            if header_len >= 10 {
                self.dts_ms = Some(read_timestamp(&data[14..19]));
            } else {
                warn!("[PES:0x{:04x}] dts flagged but header too short", self.pid);
            }
        }

        trace!(
            "[PES:0x{:04x}] stream_id: 0x{stream_id:02x}, packet_len: {packet_len}, pts: {:?}",
            self.pid, self.pts_ms
        );

        self.assembling = true;
        self.stream_id = stream_id;
        self.packet_len = packet_len;
        self.data_left = if packet_len > 0 {
            packet_len.saturating_sub(3 + header_len)
        } else {
            0
        };
        self.sections = Vec::new();
        self.cur_section = Some((BytesMut::new(), scrambling));

        self.append_data(&data[body_offset..], scrambling);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::test_support::{NullEvents, with_ctx};
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn encode_timestamp(prefix: u8, value: u64) -> [u8; 5] {
        [
            (prefix << 4) | ((((value >> 30) as u8) & 0x07) << 1) | 1,
            (value >> 22) as u8,
            (((value >> 15) as u8) << 1) | 1,
            (value >> 7) as u8,
            ((value as u8) << 1) | 1,
        ]
    }

    fn pes_header(stream_id: u8, packet_len: u16, pts: Option<u64>) -> Vec<u8> {
        let mut v = vec![
            0x00,
            0x00,
            0x01,
            stream_id,
            (packet_len >> 8) as u8,
            packet_len as u8,
            0x80,
        ];
        match pts {
            Some(pts) => {
                v.push(0x80);
                v.push(5);
                v.extend_from_slice(&encode_timestamp(0b0010, pts));
            }
            None => {
                v.push(0x00);
                v.push(0);
            }
        }
        v
    }

    #[derive(Default)]
    struct Capture {
        packets: Rc<RefCell<Vec<PesPacket>>>,
    }

    impl PesPacketConsumer for Capture {
        fn on_pes_packet_complete(&mut self, packet: &PesPacket) {
            self.packets.borrow_mut().push(packet.clone());
        }
    }

    fn reader_with_capture() -> (PesReader, Rc<RefCell<Vec<PesPacket>>>) {
        let capture = Capture::default();
        let packets = capture.packets.clone();
        let es = Es::new(0x0201, 0x1B, &[]);
        (PesReader::new(0x0201, es, Box::new(capture)), packets)
    }

    #[test]
    fn timestamp_round_trip() {
        let value = 0x1_2345_6789u64 & 0x1_FFFF_FFFF;
        let encoded = encode_timestamp(0b0010, value);
        assert_eq!(read_timestamp(&encoded), value as f64 / 90.0);
    }

    #[test]
    fn timestamp_of_90000_ticks_is_one_second() {
        let encoded = encode_timestamp(0b0010, 90_000);
        assert_eq!(read_timestamp(&encoded), 1000.0);
    }

    #[test]
    fn bounded_packet_completes_at_declared_length() {
        let (mut reader, packets) = reader_with_capture();
        let body = [0xAA; 20];
        let mut data = pes_header(0xE0, (3 + 5 + 20) as u16, Some(90_000));
        data.extend_from_slice(&body);
        with_ctx(&mut NullEvents, |ctx| {
            reader.read_payload(&data, true, 0, false, ctx);
        });
        let packets = packets.borrow();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].payload(), body.to_vec());
        assert_eq!(packets[0].pts_ms, Some(1000.0));
        assert_eq!(packets[0].stream_id, 0xE0);
    }

    #[test]
    fn dts_without_pts_is_still_decoded() {
        let (mut reader, packets) = reader_with_capture();
        let body = [0x11u8; 4];
        let mut data = vec![0x00, 0x00, 0x01, 0xE0];
        data.extend_from_slice(&((3 + 10 + body.len()) as u16).to_be_bytes());
        data.push(0x80);
        data.push(0x40); // dts flagged alone
        data.push(10);
        data.extend_from_slice(&[0xFF; 5]);
        data.extend_from_slice(&encode_timestamp(0b0001, 180_000));
        data.extend_from_slice(&body);
        with_ctx(&mut NullEvents, |ctx| {
            reader.read_payload(&data, true, 0, false, ctx);
        });
        let packets = packets.borrow();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].pts_ms, None);
        assert_eq!(packets[0].dts_ms, Some(2000.0));
        assert_eq!(packets[0].payload(), body.to_vec());
    }

    #[test]
    fn unbounded_packet_flushes_on_next_pusi() {
        let (mut reader, packets) = reader_with_capture();
        let mut data = pes_header(0xE0, 0, None);
        data.extend_from_slice(&[1, 2, 3]);
        with_ctx(&mut NullEvents, |ctx| {
            reader.read_payload(&data, true, 0, false, ctx);
            reader.read_payload(&[4, 5, 6], false, 0, false, ctx);
            assert_eq!(packets.borrow().len(), 0);
            let next = pes_header(0xE0, 0, None);
            reader.read_payload(&next, true, 0, false, ctx);
        });
        let packets = packets.borrow();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].payload(), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(packets[0].pts_ms, None);
    }

    #[test]
    fn scrambling_change_splits_sections() {
        let (mut reader, packets) = reader_with_capture();
        let mut data = pes_header(0xE0, (3 + 0 + 8) as u16, None);
        data.extend_from_slice(&[1, 2, 3, 4]);
        with_ctx(&mut NullEvents, |ctx| {
            reader.read_payload(&data, true, 0, false, ctx);
            reader.read_payload(&[5, 6, 7, 8], false, 2, false, ctx);
        });
        let packets = packets.borrow();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].sections.len(), 2);
        assert_eq!(&packets[0].sections[0].data[..], &[1, 2, 3, 4]);
        assert_eq!(packets[0].sections[0].scrambling, 0);
        assert_eq!(&packets[0].sections[1].data[..], &[5, 6, 7, 8]);
        assert_eq!(packets[0].sections[1].scrambling, 2);
        assert_eq!(packets[0].payload(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn bad_start_code_drops_assembly() {
        let (mut reader, packets) = reader_with_capture();
        with_ctx(&mut NullEvents, |ctx| {
            reader.read_payload(&[0xDE, 0xAD, 0xBE, 0xEF, 0, 0, 0, 0, 0], true, 0, false, ctx);
            reader.read_payload(&[1, 2, 3], false, 0, false, ctx);
        });
        assert_eq!(packets.borrow().len(), 0);
    }

    #[test]
    fn unfinished_packet_is_flushed_with_partial_content() {
        let (mut reader, packets) = reader_with_capture();
        let mut data = pes_header(0xE0, (3 + 0 + 100) as u16, None);
        data.extend_from_slice(&[9; 10]);
        with_ctx(&mut NullEvents, |ctx| {
            reader.read_payload(&data, true, 0, false, ctx);
            let next = pes_header(0xE0, 0, None);
            reader.read_payload(&next, true, 0, false, ctx);
        });
        let packets = packets.borrow();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].payload(), vec![9; 10]);
    }

    #[test]
    fn overflow_past_declared_length_is_dropped() {
        let (mut reader, packets) = reader_with_capture();
        let mut data = pes_header(0xE0, (3 + 0 + 4) as u16, None);
        data.extend_from_slice(&[1, 2, 3, 4]);
        with_ctx(&mut NullEvents, |ctx| {
            reader.read_payload(&data, true, 0, false, ctx);
            // the packet already completed; trailing data has nowhere to go
            reader.read_payload(&[5, 6], false, 0, false, ctx);
        });
        let packets = packets.borrow();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].payload(), vec![1, 2, 3, 4]);
    }
}
