//! Snapshot reports of the demuxed service layout.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::es::{Es, MediaKind};
use crate::pes::PesPacketConsumer;
use crate::types::{DemuxEvents, DemuxStats};

#[derive(Debug, Clone, Serialize)]
pub struct StreamReport {
    pub pid: u16,
    pub stream_type: u8,
    pub kind: MediaKind,
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub langs: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgramReport {
    pub program: u16,
    pub pmt_pid: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pcr_pid: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pcr_ms: Option<f64>,
    pub streams: Vec<StreamReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DemuxReport {
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_pid: Option<u16>,
    pub programs: Vec<ProgramReport>,
    pub stats: DemuxStats,
}

impl DemuxReport {
    /// Pretty-printed JSON for CLI output.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self)
            .unwrap_or_else(|_| "{\"error\": \"JSON serialization failed\"}".to_string())
    }
}

struct ProgramEntry {
    pmt_pid: u16,
    pcr_pid: Option<u16>,
    streams: BTreeMap<u16, Es>,
}

/// A [`DemuxEvents`] consumer that mirrors the service layout announced by
/// PAT/PMT diffs and renders timestamped snapshots of it.
#[derive(Default)]
pub struct Reporter {
    programs: BTreeMap<u16, ProgramEntry>,
    network_pid: Option<u16>,
}

impl Reporter {
    pub fn new() -> Self {
        Reporter::default()
    }

    /// Builds a snapshot; `pcr_ms` supplies each program's latest clock
    /// value (see [`crate::Demuxer::pcr_map`]).
    pub fn report(&self, stats: DemuxStats, pcr_ms: &HashMap<u16, f64>) -> DemuxReport {
        let programs = self
            .programs
            .iter()
            .map(|(&program, entry)| ProgramReport {
                program,
                pmt_pid: entry.pmt_pid,
                pcr_pid: entry.pcr_pid,
                pcr_ms: pcr_ms.get(&program).copied(),
                streams: entry
                    .streams
                    .values()
                    .map(|es| StreamReport {
                        pid: es.pid,
                        stream_type: es.stream_type,
                        kind: es.media_kind,
                        name: es.name.clone(),
                        langs: es.langs.clone(),
                    })
                    .collect(),
            })
            .collect();

        DemuxReport {
            timestamp: chrono::Utc::now().to_rfc3339(),
            network_pid: self.network_pid,
            programs,
            stats,
        }
    }
}

impl DemuxEvents for Reporter {
    fn on_program_added(&mut self, program_id: u16, pmt_pid: u16) {
        self.programs.insert(
            program_id,
            ProgramEntry {
                pmt_pid,
                pcr_pid: None,
                streams: BTreeMap::new(),
            },
        );
    }

    fn on_program_removed(&mut self, program_id: u16, _pmt_pid: u16) {
        self.programs.remove(&program_id);
    }

    fn on_pcr_pid_changed(&mut self, program_id: u16, pcr_pid: u16) {
        if let Some(entry) = self.programs.get_mut(&program_id) {
            entry.pcr_pid = Some(pcr_pid);
        }
    }

    fn on_stream_added(
        &mut self,
        program_id: u16,
        pid: u16,
        es: &Es,
    ) -> Option<Box<dyn PesPacketConsumer>> {
        if let Some(entry) = self.programs.get_mut(&program_id) {
            entry.streams.insert(pid, es.clone());
        }
        None
    }

    fn on_stream_removed(&mut self, program_id: u16, pid: u16, _es: &Es) {
        if let Some(entry) = self.programs.get_mut(&program_id) {
            entry.streams.remove(&pid);
        }
    }

    fn on_network_pid(&mut self, network_pid: u16) {
        self.network_pid = Some(network_pid);
    }
}
