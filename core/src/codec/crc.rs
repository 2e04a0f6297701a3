//! CRC-16/ARC (reflected, polynomial 0xA001) for SM segment integrity

use ::crc::{Crc, CRC_16_ARC};

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_ARC);

/// Fold `bytes` into a running CRC.
///
/// Start with `0` for a fresh computation. Feeding a buffer in pieces gives the
/// same result as feeding it whole, which lets the header codec skip over its
/// own CRC field without copying the segment.
pub fn crc16(running_crc: u16, bytes: &[u8]) -> u16 {
    // A reflected algorithm reflects the seed it is given
    let mut digest = CRC16.digest_with_initial(running_crc.reverse_bits());
    digest.update(bytes);
    digest.finalize()
}
