//! Constants for MPEG-TS demultiplexing

/// MPEG-TS packet constants
pub const TS_PACKET_SIZE: usize = 188;
pub const TS_SYNC_BYTE: u8 = 0x47;

/// Well-known PIDs
pub const PID_PAT: u16 = 0x0000;
pub const PID_NULL: u16 = 0x1FFF;

/// PSI table ids handled by this crate
pub const TABLE_ID_PAT: u8 = 0x00;
pub const TABLE_ID_PMT: u8 = 0x02;

/// Section accumulation ceiling: 4096 (the largest SI table) plus one
/// full TS payload
pub const MAX_TABLE_SIZE: usize = 4096 + 184;

/// PAT/PMT sections may not declare more than this many bytes past the
/// 3-byte section header
pub const MAX_SECTION_LENGTH: usize = 1021;

/// PES packet start code prefix
pub const PES_START_CODE: [u8; 3] = [0x00, 0x00, 0x01];

/// 90 kHz clock ticks per millisecond, for PCR/PTS/DTS conversion
pub const TICKS_PER_MS: f64 = 90.0;
