//! CRC-32 validation for SCTE-35 messages (MPEG-2 polynomial, non-reflected).

use crc::{Crc, CRC_32_MPEG_2};

pub const MPEG_2: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// Validates the trailing CRC-32 of a complete splice_info_section.
///
/// The last 4 bytes are the big-endian stored CRC; the checksum is computed
/// over everything before them. Returns `false` for buffers too short to
/// carry a CRC at all.
pub fn validate_message_crc(buffer: &[u8]) -> bool {
    if buffer.len() < 4 {
        return false;
    }
    let split = buffer.len() - 4;
    let stored = u32::from_be_bytes([
        buffer[split],
        buffer[split + 1],
        buffer[split + 2],
        buffer[split + 3],
    ]);
    MPEG_2.checksum(&buffer[..split]) == stored
}

/// Computes the CRC-32 over `data` (used by test fixtures to build valid
/// payloads).
pub fn checksum(data: &[u8]) -> u32 {
    MPEG_2.checksum(data)
}
