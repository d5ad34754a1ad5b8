//! Program Map Table reader.

use std::collections::BTreeMap;

use log::{debug, info, warn};

use crate::constants::{MAX_SECTION_LENGTH, TABLE_ID_PMT};
use crate::es::Es;
use crate::processor::DemuxContext;
use crate::psi::PsiTable;

/// Decodes one program's PCR PID and elementary streams, and diffs each
/// complete table version against the previous one.
pub struct PmtTable {
    pid: u16,
    program_id: u16,
    streams: BTreeMap<u16, Es>,
    prev_streams: BTreeMap<u16, Es>,
    pcr_pid: Option<u16>,
    announced_pcr_pid: Option<u16>,
}

impl PmtTable {
    pub fn new(pid: u16, program_id: u16) -> Self {
        PmtTable {
            pid,
            program_id,
            streams: BTreeMap::new(),
            prev_streams: BTreeMap::new(),
            pcr_pid: None,
            announced_pcr_pid: None,
        }
    }
}

impl PsiTable for PmtTable {
    fn table_id(&self) -> u8 {
        TABLE_ID_PMT
    }

    fn check_section_headers(&self, section_length: usize, ext_id: u16) -> bool {
        if (section_length >> 10) & 0x3 != 0 {
            warn!(
                "[PMT:0x{:04x}] section length upper bits should be 0, got {section_length}",
                self.pid
            );
            return false;
        }
        if section_length > MAX_SECTION_LENGTH {
            warn!(
                "[PMT:0x{:04x}] section length is too long: {section_length}",
                self.pid
            );
            return false;
        }
        if ext_id != self.program_id {
            warn!(
                "[PMT:0x{:04x}] program_id mismatch: {ext_id} vs {}",
                self.pid, self.program_id
            );
            return false;
        }
        true
    }

    fn on_new_version(&mut self, _version: u8) {
        self.streams.clear();
    }

    fn on_section(&mut self, section_number: u8, data: &[u8]) -> bool {
        if section_number != 0 {
            warn!(
                "[PMT:0x{:04x}] section number should be 0, got {section_number}",
                self.pid
            );
            return false;
        }
        if data.len() < 4 {
            warn!(
                "[PMT:0x{:04x}] section body too short: {}",
                self.pid,
                data.len()
            );
            return false;
        }

        self.pcr_pid = Some(u16::from_be_bytes([data[0] & 0x1F, data[1]]));

        let program_info_len = (((data[2] & 0x0F) as usize) << 8) | data[3] as usize;
        if (program_info_len >> 10) & 0x3 != 0 {
            warn!(
                "[PMT:0x{:04x}] program info length upper bits should be 0",
                self.pid
            );
            return false;
        }
        if program_info_len > data.len() - 4 {
            warn!(
                "[PMT:0x{:04x}] program info length out of bounds: {program_info_len} vs {}",
                self.pid,
                data.len() - 4
            );
            return false;
        }

        // program-level descriptors are not interpreted here
        let mut offset = 4 + program_info_len;

        while data.len() - offset >= 5 {
            let stream_type = data[offset];
            let es_pid = u16::from_be_bytes([data[offset + 1] & 0x1F, data[offset + 2]]);
            let info_len = (((data[offset + 3] & 0x0F) as usize) << 8) | data[offset + 4] as usize;
            if (info_len >> 10) & 0x3 != 0 {
                warn!(
                    "[PMT:0x{:04x}] es info length upper bits should be 0",
                    self.pid
                );
                return false;
            }
            offset += 5;
            if info_len > data.len() - offset {
                warn!(
                    "[PMT:0x{:04x}] es info length out of bounds: {info_len} vs {}",
                    self.pid,
                    data.len() - offset
                );
                return false;
            }

            let es = Es::new(es_pid, stream_type, &data[offset..offset + info_len]);
            debug!("[PMT:0x{:04x}] {es}", self.pid);
            self.streams.insert(es_pid, es);
            offset += info_len;
        }

        if offset != data.len() {
            warn!(
                "[PMT:0x{:04x}] {} bytes left after reading entries",
                self.pid,
                data.len() - offset
            );
        }
        true
    }

    fn on_table_complete(&mut self, ctx: &mut DemuxContext<'_>) {
        if let Some(pcr_pid) = self.pcr_pid
            && self.announced_pcr_pid != Some(pcr_pid)
        {
            info!(
                "[PMT:0x{:04x}] pcr pid is now 0x{pcr_pid:04x}",
                self.pid
            );
            self.announced_pcr_pid = Some(pcr_pid);
            ctx.pcr_pid_changed(self.program_id, pcr_pid);
        }

        for (&pid, es) in &self.streams {
            if !self.prev_streams.contains_key(&pid) {
                info!("[PMT:0x{:04x}]   [+] {es}", self.pid);
                ctx.stream_added(self.program_id, pid, es);
            }
        }

        for (&pid, es) in &self.prev_streams {
            if !self.streams.contains_key(&pid) {
                info!("[PMT:0x{:04x}]   [-] {es}", self.pid);
                ctx.stream_removed(self.program_id, pid, es);
            }
        }

        for (&pid, es) in &self.streams {
            if let Some(prev_es) = self.prev_streams.get(&pid)
                && prev_es != es
            {
                info!("[PMT:0x{:04x}]   [U] {prev_es} => {es}", self.pid);
                ctx.stream_removed(self.program_id, pid, prev_es);
                ctx.stream_added(self.program_id, pid, es);
            }
        }

        self.prev_streams = self.streams.clone();
    }

    fn on_unregistered(&mut self, ctx: &mut DemuxContext<'_>) {
        // the program disappeared from the PAT; retire its streams
        for (&pid, es) in &self.prev_streams {
            ctx.stream_removed(self.program_id, pid, es);
        }
    }
}
