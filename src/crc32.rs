//! MPEG-2 CRC-32 over PSI sections.

use crc::{CRC_32_MPEG_2, Crc};

const CRC_MPEG: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// Computes the MPEG-2 CRC-32 (poly 0x04C11DB7, init 0xFFFFFFFF, no final
/// xor, MSB first) of `data`.
pub fn checksum(data: &[u8]) -> u32 {
    CRC_MPEG.checksum(data)
}

/// A section is valid iff the CRC over the whole section, trailing CRC-32
/// field included, is zero.
pub fn section_is_valid(section: &[u8]) -> bool {
    checksum(section) == 0
}
