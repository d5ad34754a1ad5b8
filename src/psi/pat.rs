//! Program Association Table reader.

use std::collections::BTreeMap;

use log::{info, warn};

use crate::constants::{MAX_SECTION_LENGTH, TABLE_ID_PAT};
use crate::processor::DemuxContext;
use crate::psi::PsiTable;

/// Decodes program/PID mappings and diffs each complete table version
/// against the previous one.
#[derive(Default)]
pub struct PatTable {
    programs: BTreeMap<u16, u16>,
    prev_programs: BTreeMap<u16, u16>,
    network_pid: Option<u16>,
}

impl PatTable {
    pub fn new() -> Self {
        PatTable::default()
    }
}

impl PsiTable for PatTable {
    fn table_id(&self) -> u8 {
        TABLE_ID_PAT
    }

    fn check_section_headers(&self, section_length: usize, _ext_id: u16) -> bool {
        if (section_length >> 10) & 0x3 != 0 {
            warn!("[PAT] section length upper bits should be 0, got {section_length}");
            return false;
        }
        if section_length > MAX_SECTION_LENGTH {
            warn!("[PAT] section length is too long: {section_length}");
            return false;
        }
        true
    }

    fn on_new_version(&mut self, _version: u8) {
        self.programs.clear();
    }

    fn on_section(&mut self, section_number: u8, data: &[u8]) -> bool {
        if data.len() % 4 != 0 {
            warn!(
                "[PAT] invalid section {section_number} length: {}",
                data.len()
            );
            return false;
        }

        for entry in data.chunks_exact(4) {
            let program_number = u16::from_be_bytes([entry[0], entry[1]]);
            let pid = u16::from_be_bytes([entry[2], entry[3]]) & 0x1FFF;
            if program_number == 0 {
                info!("[PAT] network pid: 0x{pid:04x}");
                self.network_pid = Some(pid);
            } else {
                self.programs.insert(program_number, pid);
            }
        }
        true
    }

    fn on_table_complete(&mut self, ctx: &mut DemuxContext<'_>) {
        for (&program, &pid) in &self.programs {
            info!("[PAT] program {program} ==> pid 0x{pid:04x}");
        }

        if let Some(network_pid) = self.network_pid {
            ctx.network_pid(network_pid);
        }

        for (&program, &pid) in &self.programs {
            if !self.prev_programs.contains_key(&program) {
                info!("[PAT]   [+] program {program} => pmt 0x{pid:04x}");
                ctx.program_added(program, pid);
            }
        }

        for (&program, &prev_pid) in &self.prev_programs {
            if !self.programs.contains_key(&program) {
                info!("[PAT]   [-] program {program} => pmt 0x{prev_pid:04x}");
                ctx.program_removed(program, prev_pid);
            }
        }

        for (&program, &pid) in &self.programs {
            if let Some(&prev_pid) = self.prev_programs.get(&program)
                && prev_pid != pid
            {
                info!("[PAT]   [U] program {program} => pmt moved 0x{prev_pid:04x} -> 0x{pid:04x}");
                ctx.program_removed(program, prev_pid);
                ctx.program_added(program, pid);
            }
        }

        self.prev_programs = self.programs.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc32;
    use crate::processor::test_support::{CtxHarness, Recorder, RecordedEvent};
    use crate::psi::PsiReader;
    use pretty_assertions::assert_eq;

    fn pat_section(version: u8, entries: &[(u16, u16)]) -> Vec<u8> {
        let mut body = Vec::new();
        for &(program, pid) in entries {
            body.extend_from_slice(&program.to_be_bytes());
            body.extend_from_slice(&(0xE000 | pid).to_be_bytes());
        }
        let len = body.len() + 5 + 4;
        let mut sec = vec![
            TABLE_ID_PAT,
            0xB0 | ((len >> 8) as u8 & 0x0F),
            len as u8,
        ];
        sec.extend_from_slice(&0x0001u16.to_be_bytes());
        sec.push(0xC1 | (version << 1));
        sec.push(0);
        sec.push(0);
        sec.extend_from_slice(&body);
        let crc = crc32::checksum(&sec);
        sec.extend_from_slice(&crc.to_be_bytes());
        sec
    }

    fn payload(section: &[u8]) -> Vec<u8> {
        let mut data = vec![0x00];
        data.extend_from_slice(section);
        data
    }

    #[test]
    fn complete_pat_registers_pmt_readers() {
        let mut harness = CtxHarness::new();
        let mut recorder = Recorder::default();
        let mut reader = PsiReader::new(0, PatTable::new());
        let sec = pat_section(0, &[(1, 0x0100), (2, 0x0200)]);
        {
            let mut ctx = harness.ctx(&mut recorder);
            use crate::processor::TsPayloadReader;
            reader.read_payload(&payload(&sec), true, 0, false, &mut ctx);
        }
        assert_eq!(
            recorder.events,
            vec![
                RecordedEvent::ProgramAdded(1, 0x0100),
                RecordedEvent::ProgramAdded(2, 0x0200),
            ]
        );
        assert!(harness.readers.contains_key(&0x0100));
        assert!(harness.readers.contains_key(&0x0200));
    }

    #[test]
    fn network_pid_is_not_a_program() {
        let mut harness = CtxHarness::new();
        let mut recorder = Recorder::default();
        let mut reader = PsiReader::new(0, PatTable::new());
        let sec = pat_section(0, &[(0, 0x0010), (1, 0x0100)]);
        {
            let mut ctx = harness.ctx(&mut recorder);
            use crate::processor::TsPayloadReader;
            reader.read_payload(&payload(&sec), true, 0, false, &mut ctx);
        }
        assert_eq!(
            recorder.events,
            vec![
                RecordedEvent::NetworkPid(0x0010),
                RecordedEvent::ProgramAdded(1, 0x0100),
            ]
        );
        assert!(!harness.readers.contains_key(&0x0010));
    }

    #[test]
    fn version_change_diffs_programs() {
        let mut harness = CtxHarness::new();
        let mut recorder = Recorder::default();
        let mut reader = PsiReader::new(0, PatTable::new());
        let v1 = pat_section(1, &[(1, 0x0100)]);
        let v2 = pat_section(2, &[(2, 0x0101)]);
        {
            let mut ctx = harness.ctx(&mut recorder);
            use crate::processor::TsPayloadReader;
            reader.read_payload(&payload(&v1), true, 0, false, &mut ctx);
            reader.read_payload(&payload(&v2), true, 0, false, &mut ctx);
        }
        assert_eq!(
            recorder.events,
            vec![
                RecordedEvent::ProgramAdded(1, 0x0100),
                RecordedEvent::ProgramAdded(2, 0x0101),
                RecordedEvent::ProgramRemoved(1, 0x0100),
            ]
        );
        assert!(!harness.readers.contains_key(&0x0100));
        assert!(harness.readers.contains_key(&0x0101));
    }

    #[test]
    fn moved_pmt_pid_is_remove_then_add() {
        let mut harness = CtxHarness::new();
        let mut recorder = Recorder::default();
        let mut reader = PsiReader::new(0, PatTable::new());
        let v1 = pat_section(1, &[(1, 0x0100)]);
        let v2 = pat_section(2, &[(1, 0x0180)]);
        {
            let mut ctx = harness.ctx(&mut recorder);
            use crate::processor::TsPayloadReader;
            reader.read_payload(&payload(&v1), true, 0, false, &mut ctx);
            reader.read_payload(&payload(&v2), true, 0, false, &mut ctx);
        }
        assert_eq!(
            recorder.events,
            vec![
                RecordedEvent::ProgramAdded(1, 0x0100),
                RecordedEvent::ProgramRemoved(1, 0x0100),
                RecordedEvent::ProgramAdded(1, 0x0180),
            ]
        );
        assert!(harness.readers.contains_key(&0x0180));
    }

    #[test]
    fn misaligned_section_is_rejected() {
        let mut table = PatTable::new();
        assert!(!table.on_section(0, &[0x00, 0x01, 0xE1]));
        assert!(table.programs.is_empty());
    }
}
