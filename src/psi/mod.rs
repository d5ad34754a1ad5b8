//! PSI section reassembly across TS packets.

pub mod pat;
pub mod pmt;

use std::collections::HashMap;

use bytes::{Buf, BytesMut};
use log::{debug, trace, warn};

use crate::constants::MAX_TABLE_SIZE;
use crate::crc32;
use crate::processor::{DemuxContext, TsPayloadReader};

/// Table-specific hooks driven by [`PsiReader`].
pub trait PsiTable {
    /// Expected table_id; sections carrying any other id are skipped.
    fn table_id(&self) -> u8;

    /// Extra sanity checks on a section header. Failing sections are
    /// dropped, parsing continues with the next section.
    fn check_section_headers(&self, section_length: usize, ext_id: u16) -> bool {
        let _ = (section_length, ext_id);
        true
    }

    /// A new table version was observed; prior contents are void.
    fn on_new_version(&mut self, version: u8);

    /// One CRC-valid section body (common header and trailing CRC removed).
    /// Returns true when the section was accepted.
    fn on_section(&mut self, section_number: u8, data: &[u8]) -> bool;

    /// All sections 0..=last_section of the current version are present.
    /// Invoked exactly once per version.
    fn on_table_complete(&mut self, ctx: &mut DemuxContext<'_>);

    /// The reader is being dropped from the dispatcher map.
    fn on_unregistered(&mut self, ctx: &mut DemuxContext<'_>) {
        let _ = ctx;
    }
}

/// Reassembles PSI sections for one PID using the pointer-field protocol
/// and feeds CRC-valid sections to a [`PsiTable`].
pub struct PsiReader<T> {
    pid: u16,
    payload: Option<BytesMut>,
    current_version: Option<u8>,
    last_section: Option<u8>,
    sections_crc: HashMap<u8, u32>,
    table_complete: bool,
    table: T,
}

impl<T: PsiTable> PsiReader<T> {
    pub fn new(pid: u16, table: T) -> Self {
        PsiReader {
            pid,
            payload: None,
            current_version: None,
            last_section: None,
            sections_crc: HashMap::new(),
            table_complete: false,
            table,
        }
    }

    fn reset(&mut self) {
        self.payload = None;
        self.current_version = None;
        self.last_section = None;
        self.sections_crc.clear();
        self.table_complete = false;
    }

    fn handle_new_version(&mut self, version: u8) {
        self.table.on_new_version(version);
        self.current_version = Some(version);
        self.last_section = None;
        self.sections_crc.clear();
        self.table_complete = false;
    }

    /// Accumulate data in the section payload buffer, bounded by
    /// MAX_TABLE_SIZE.
    fn push_data(&mut self, data: &[u8]) {
        let Some(buf) = self.payload.as_mut() else {
            trace!(
                "[PSI:0x{:04x}:{:#04x}] drop data, pusi not seen yet",
                self.pid,
                self.table.table_id()
            );
            return;
        };
        if buf.len() + data.len() >= MAX_TABLE_SIZE {
            warn!(
                "[PSI:0x{:04x}:{:#04x}] section buffer overflow, resetting",
                self.pid,
                self.table.table_id()
            );
            self.reset();
            return;
        }
        buf.extend_from_slice(data);
    }

    /// Extracts every complete section from the accumulated buffer.
    /// Residual bytes (a partial section, or a partial 3-byte section
    /// header) are retained for the next packet.
    fn parse_sections(&mut self, ctx: &mut DemuxContext<'_>) {
        let Some(mut buf) = self.payload.take() else {
            return;
        };
        let mut offset = 0;
        let mut left = buf.len();
        let mut first = true;

        while left > 3 {
            if !first && buf[offset] == 0xFF {
                // stuffing after the last section
                left = 0;
                break;
            }

            let section_length =
                (((buf[offset + 1] as usize) << 8) | buf[offset + 2] as usize) & 0xFFF;
            if left - 3 < section_length {
                trace!(
                    "[PSI:0x{:04x}:{:#04x}] section not complete ({} vs {section_length})",
                    self.pid,
                    self.table.table_id(),
                    left - 3
                );
                break;
            }

            self.parse_section(&buf[offset..offset + section_length + 3], section_length, ctx);
            offset += section_length + 3;
            left -= section_length + 3;
            first = false;
        }

        buf.advance(offset);
        buf.truncate(left);
        self.payload = Some(buf);
    }

    /// Validates and delivers one section. `section` spans the 3-byte
    /// header through the trailing CRC.
    fn parse_section(&mut self, section: &[u8], section_length: usize, ctx: &mut DemuxContext<'_>) {
        let table_id = section[0];
        let syntax_indicator = section[1] & 0x80 != 0;
        let private_indicator = section[1] & 0x40 != 0;

        if table_id != self.table.table_id() {
            warn!(
                "[PSI:0x{:04x}:{:#04x}] unexpected table id {table_id:#04x}",
                self.pid,
                self.table.table_id()
            );
            return;
        }
        if !syntax_indicator {
            debug!(
                "[PSI:0x{:04x}:{:#04x}] section without common syntax, skipping",
                self.pid, table_id
            );
            return;
        }
        if private_indicator {
            debug!(
                "[PSI:0x{:04x}:{:#04x}] private section, skipping",
                self.pid, table_id
            );
            return;
        }
        if section_length < 9 {
            warn!(
                "[PSI:0x{:04x}:{:#04x}] section too short for common syntax ({section_length})",
                self.pid, table_id
            );
            return;
        }

        let ext_id = u16::from_be_bytes([section[3], section[4]]);
        let version = (section[5] >> 1) & 0x1F;
        let current = section[5] & 0x01 != 0;
        let section_number = section[6];
        let last_section = section[7];

        if !crc32::section_is_valid(section) {
            warn!(
                "[PSI:0x{:04x}:{:#04x}] invalid crc, dropping section {section_number}",
                self.pid, table_id
            );
            return;
        }

        if !self.table.check_section_headers(section_length, ext_id) {
            warn!(
                "[PSI:0x{:04x}:{:#04x}] dropping section {section_number} with invalid headers",
                self.pid, table_id
            );
            return;
        }

        let crc_offset = section.len() - 4;
        let crc = u32::from_be_bytes([
            section[crc_offset],
            section[crc_offset + 1],
            section[crc_offset + 2],
            section[crc_offset + 3],
        ]);

        // only consider the current table
        if !current {
            return;
        }

        if self.current_version != Some(version) {
            debug!(
                "[PSI:0x{:04x}:{:#04x}] received a new version ({version} was {:?})",
                self.pid, table_id, self.current_version
            );
            self.handle_new_version(version);
        }

        if section_number > last_section {
            warn!(
                "[PSI:0x{:04x}:{:#04x}] invalid section number {section_number} (last: {last_section})",
                self.pid, table_id
            );
            return;
        }

        if let Some(prev_last) = self.last_section
            && prev_last != last_section
        {
            warn!(
                "[PSI:0x{:04x}:{:#04x}] unexpected last section number change {prev_last} => {last_section}",
                self.pid, table_id
            );
            self.handle_new_version(version);
        }

        if let Some(&prev_crc) = self.sections_crc.get(&section_number) {
            if prev_crc != crc {
                warn!(
                    "[PSI:0x{:04x}:{:#04x}] section {section_number} crc changed without version change",
                    self.pid, table_id
                );
                self.handle_new_version(version);
            } else {
                // same section as before
                return;
            }
        }

        self.last_section = Some(last_section);

        let body = &section[8..crc_offset];
        debug!(
            "[PSI:0x{:04x}:{:#04x}] received section {section_number} / {last_section}",
            self.pid, table_id
        );

        if self.table.on_section(section_number, body) {
            self.sections_crc.insert(section_number, crc);
        }

        let complete = (0..=last_section).all(|n| self.sections_crc.contains_key(&n));
        if !self.table_complete && complete {
            debug!("[PSI:0x{:04x}:{:#04x}] table is complete", self.pid, table_id);
            self.table.on_table_complete(ctx);
            self.table_complete = true;
        }
    }

    #[cfg(test)]
    pub(crate) fn table(&self) -> &T {
        &self.table
    }
}

impl<T: PsiTable> TsPayloadReader for PsiReader<T> {
    fn read_payload(
        &mut self,
        data: &[u8],
        pusi: bool,
        _scrambling: u8,
        discontinuity: bool,
        ctx: &mut DemuxContext<'_>,
    ) {
        if discontinuity {
            debug!(
                "[PSI:0x{:04x}:{:#04x}] resetting after discontinuity",
                self.pid,
                self.table.table_id()
            );
            self.reset();
        }

        if !pusi {
            // append data to the pending buffer
            self.push_data(data);
            self.parse_sections(ctx);
            return;
        }

        if data.is_empty() {
            warn!(
                "[PSI:0x{:04x}:{:#04x}] empty payload with pusi set",
                self.pid,
                self.table.table_id()
            );
            return;
        }

        let pointer_field = data[0] as usize;
        if 1 + pointer_field > data.len() {
            warn!(
                "[PSI:0x{:04x}:{:#04x}] pointer_field out of packet ({pointer_field} vs {})",
                self.pid,
                self.table.table_id(),
                data.len()
            );
            self.reset();
            return;
        }

        if pointer_field > 0 {
            // complete any section that ended mid-packet
            self.push_data(&data[1..1 + pointer_field]);
            self.parse_sections(ctx);
        }

        // start a new table buffer
        self.payload = Some(BytesMut::new());

        let rest = &data[1 + pointer_field..];
        if rest.first() == Some(&0xFF) {
            debug!(
                "[PSI:0x{:04x}:{:#04x}] only padding found in table",
                self.pid,
                self.table.table_id()
            );
            return;
        }

        self.push_data(rest);
        self.parse_sections(ctx);
    }

    fn on_unregistered(&mut self, ctx: &mut DemuxContext<'_>) {
        self.table.on_unregistered(ctx);
    }
}
