//! Elementary stream records and PMT descriptor decoding.

use std::collections::HashMap;

use anyhow::{Context, bail};
use log::warn;
use serde::Serialize;

pub const DESCRIPTOR_TAG_CA: u8 = 0x09;
pub const DESCRIPTOR_TAG_LANGUAGE: u8 = 0x0A;
pub const DESCRIPTOR_TAG_STREAM_IDENTIFIER: u8 = 0x52;
pub const DESCRIPTOR_TAG_TELETEXT: u8 = 0x56;
pub const DESCRIPTOR_TAG_DVB_SUBTITLE: u8 = 0x59;
pub const DESCRIPTOR_TAG_AC3: u8 = 0x6A;
pub const DESCRIPTOR_TAG_ENHANCED_AC3: u8 = 0x7A;
pub const DESCRIPTOR_TAG_DTS: u8 = 0x7B;
pub const DESCRIPTOR_TAG_SCTE35_CUE: u8 = 0x8A;

/// Broad media category derived from the stream type and refined by
/// private-stream descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
    Subtitle,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeletextEntry {
    pub lang: String,
    pub teletext_type: u8,
    pub magazine_number: u8,
    pub page_number: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DvbSubtitleEntry {
    pub lang: String,
    pub subtitling_type: u8,
    pub composition_page_id: u16,
    pub ancillary_page_id: u16,
}

/// A PMT descriptor, dispatched on its one-byte tag. Tags this crate does
/// not interpret are retained opaque.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Descriptor {
    Ca { system_id: u16, ca_pid: u16 },
    Language { code: String, audio_type: u8 },
    StreamIdentifier(Vec<u8>),
    Teletext(Vec<TeletextEntry>),
    DvbSubtitle(Vec<DvbSubtitleEntry>),
    Ac3,
    EnhancedAc3,
    Dts,
    Scte35Cue { cue_stream_type: u8 },
    Other { tag: u8, data: Vec<u8> },
}

fn lang_code(data: &[u8]) -> anyhow::Result<String> {
    let code = std::str::from_utf8(&data[..3]).context("language code is not ASCII")?;
    Ok(code.to_string())
}

/// Decodes a single descriptor body. `data` holds exactly the declared
/// descriptor length.
pub fn parse_descriptor(tag: u8, data: &[u8]) -> anyhow::Result<Descriptor> {
    match tag {
        DESCRIPTOR_TAG_CA => {
            if data.len() < 4 {
                bail!("too short ca_descriptor: {}", data.len());
            }
            let system_id = u16::from_be_bytes([data[0], data[1]]);
            let ca_pid = u16::from_be_bytes([data[2] & 0x1F, data[3]]);
            Ok(Descriptor::Ca { system_id, ca_pid })
        }
        DESCRIPTOR_TAG_LANGUAGE => {
            if data.len() != 4 {
                bail!("unexpected language descriptor length: {}", data.len());
            }
            Ok(Descriptor::Language {
                code: lang_code(data)?,
                audio_type: data[3],
            })
        }
        DESCRIPTOR_TAG_STREAM_IDENTIFIER => Ok(Descriptor::StreamIdentifier(data.to_vec())),
        DESCRIPTOR_TAG_TELETEXT => {
            if data.len() < 5 {
                bail!("missing teletext information");
            }
            let mut entries = Vec::new();
            for entry in data.chunks_exact(5) {
                entries.push(TeletextEntry {
                    lang: lang_code(entry)?,
                    teletext_type: entry[3] >> 3,
                    magazine_number: entry[3] & 0x07,
                    page_number: entry[4],
                });
            }
            Ok(Descriptor::Teletext(entries))
        }
        DESCRIPTOR_TAG_DVB_SUBTITLE => {
            if data.len() < 8 {
                bail!("missing subtitle information");
            }
            let mut entries = Vec::new();
            for entry in data.chunks_exact(8) {
                entries.push(DvbSubtitleEntry {
                    lang: lang_code(entry)?,
                    subtitling_type: entry[3],
                    composition_page_id: u16::from_be_bytes([entry[4], entry[5]]),
                    ancillary_page_id: u16::from_be_bytes([entry[6], entry[7]]),
                });
            }
            Ok(Descriptor::DvbSubtitle(entries))
        }
        DESCRIPTOR_TAG_AC3 => Ok(Descriptor::Ac3),
        DESCRIPTOR_TAG_ENHANCED_AC3 => Ok(Descriptor::EnhancedAc3),
        DESCRIPTOR_TAG_DTS => Ok(Descriptor::Dts),
        DESCRIPTOR_TAG_SCTE35_CUE => {
            if data.is_empty() {
                bail!("empty SCTE-35 cue descriptor");
            }
            Ok(Descriptor::Scte35Cue {
                cue_stream_type: data[0],
            })
        }
        _ => Ok(Descriptor::Other {
            tag,
            data: data.to_vec(),
        }),
    }
}

fn stream_type_info(stream_type: u8) -> (&'static str, MediaKind) {
    match stream_type {
        0x01 => ("MPEG1 video", MediaKind::Video),
        0x02 => ("MPEG2 video", MediaKind::Video),
        0x10 => ("MPEG4 video", MediaKind::Video),
        0x1B => ("H264", MediaKind::Video),
        0x80 => ("MPEG2 video (2)", MediaKind::Video),
        0x03 => ("MPEG1 audio", MediaKind::Audio),
        0x04 => ("MPEG2 audio", MediaKind::Audio),
        0x0F => ("ADTS", MediaKind::Audio),
        0x11 => ("AAC", MediaKind::Audio),
        0x81 => ("AC3", MediaKind::Audio),
        0x83 => ("PCM", MediaKind::Audio),
        0x06 => ("Private stream", MediaKind::Unknown),
        0x15 => ("Metadata", MediaKind::Unknown),
        0x86 => ("SCTE-35", MediaKind::Unknown),
        _ => ("", MediaKind::Unknown),
    }
}

/// One elementary stream as declared by a PMT entry. Immutable once built;
/// a new PMT version replaces the record wholesale.
#[derive(Debug, Clone, PartialEq)]
pub struct Es {
    pub pid: u16,
    pub stream_type: u8,
    pub media_kind: MediaKind,
    pub name: String,
    pub langs: Vec<String>,
    pub ca_pid: Option<u16>,
    pub ca_system_id: Option<u16>,
    /// Tag of the private-stream descriptor that refined this record
    /// (teletext, DVB subtitle, AC-3/E-AC-3/DTS).
    pub priv_stream_type: Option<u8>,
    pub descriptors: HashMap<u8, Descriptor>,
}

impl Es {
    pub fn new(pid: u16, stream_type: u8, descriptor_data: &[u8]) -> Self {
        let (codec_name, media_kind) = stream_type_info(stream_type);
        let name = match media_kind {
            MediaKind::Video => format!("[VID] {codec_name}"),
            MediaKind::Audio => format!("[AUD] {codec_name}"),
            MediaKind::Subtitle => format!("[SUB] {codec_name}"),
            MediaKind::Unknown => format!("unknown (stream_type: 0x{stream_type:02x})"),
        };
        let mut es = Es {
            pid,
            stream_type,
            media_kind,
            name,
            langs: Vec::new(),
            ca_pid: None,
            ca_system_id: None,
            priv_stream_type: None,
            descriptors: HashMap::new(),
        };
        es.process_descriptors(descriptor_data);
        es
    }

    fn process_descriptors(&mut self, data: &[u8]) {
        let mut offset = 0;
        while offset + 2 <= data.len() {
            let tag = data[offset];
            let len = data[offset + 1] as usize;
            offset += 2;
            if offset + len > data.len() {
                warn!(
                    "[ES:0x{:04x}] descriptor 0x{tag:02x} overruns info block ({len} vs {})",
                    self.pid,
                    data.len() - offset
                );
                break;
            }
            match parse_descriptor(tag, &data[offset..offset + len]) {
                Ok(desc) => {
                    self.apply(tag, &desc);
                    self.descriptors.insert(tag, desc);
                }
                Err(err) => {
                    warn!("[ES:0x{:04x}] dropping descriptor 0x{tag:02x}: {err:#}", self.pid)
                }
            }
            offset += len;
        }
    }

    fn apply(&mut self, tag: u8, desc: &Descriptor) {
        match desc {
            Descriptor::Ca { system_id, ca_pid } => {
                if let Some(prev) = self.ca_pid {
                    warn!(
                        "[ES:0x{:04x}] es already has a ca pid defined: {prev} vs {ca_pid}",
                        self.pid
                    );
                } else {
                    self.ca_pid = Some(*ca_pid);
                    self.ca_system_id = Some(*system_id);
                }
            }
            Descriptor::Language { code, .. } => {
                self.langs = vec![code.clone()];
                self.name.push_str(&format!(" | {code}"));
            }
            Descriptor::Teletext(entries) => {
                self.priv_stream_type = Some(tag);
                self.media_kind = MediaKind::Subtitle;
                self.name = "[SUB] Teletext subtitle".to_string();
                self.langs = entries.iter().map(|e| e.lang.clone()).collect();
                for lang in &self.langs {
                    self.name.push_str(&format!(" | {lang}"));
                }
            }
            Descriptor::DvbSubtitle(entries) => {
                self.priv_stream_type = Some(tag);
                self.media_kind = MediaKind::Subtitle;
                self.name = "[SUB] DVB subtitle".to_string();
                self.langs = entries.iter().map(|e| e.lang.clone()).collect();
                for lang in &self.langs {
                    self.name.push_str(&format!(" | {lang}"));
                }
            }
            Descriptor::Ac3 | Descriptor::EnhancedAc3 | Descriptor::Dts => {
                self.priv_stream_type = Some(tag);
                self.media_kind = MediaKind::Audio;
                self.name = format!("[AUD] AC3 or DTS (0x{tag:02x})");
            }
            _ => {}
        }
    }
}

impl std::fmt::Display for Es {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[ES:{}|0x{:04x}] (stream_type: 0x{:02x}) {}",
            self.pid, self.pid, self.stream_type, self.name
        )?;
        if let Some(ca_pid) = self.ca_pid {
            write!(f, " | ECM pid: {ca_pid}")?;
        }
        Ok(())
    }
}
