//! Pull-based MPEG-2 transport stream demultiplexer.
//!
//! Consumes a byte stream of fixed 188-byte TS packets and emits, through
//! the [`DemuxEvents`] callback surface, the program table (PAT), program
//! maps (PMT), elementary stream descriptors, adaptation-field timing
//! (PCR) and reassembled PES payloads segmented by scrambling state.
//!
//! The pipeline is strictly synchronous and single-threaded: the source is
//! drained packet by packet and callbacks fire inline. See [`Demuxer`] for
//! the pull loop and [`run`]/[`run_file`] for ready-made source wiring.

pub mod constants;
pub mod crc32;
mod core;
mod es;
mod network;
mod pes;
mod processor;
mod psi;
mod report;
mod types;

pub use crate::core::{run, run_broadcast, run_file};
pub use crate::es::{Descriptor, DvbSubtitleEntry, Es, MediaKind, TeletextEntry};
pub use crate::network::create_udp_socket;
pub use crate::pes::{PesPacket, PesPacketConsumer, PesSection, read_timestamp};
pub use crate::processor::{Demuxer, DemuxContext, TsPayloadReader};
pub use crate::report::{DemuxReport, ProgramReport, Reporter, StreamReport};
pub use crate::types::{DemuxEvents, DemuxStats, Options};
