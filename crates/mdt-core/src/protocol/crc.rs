//! CRC-16/CCITT (poly 0x1021, seed 0xFFFF) computed a nibble at a time.

/// Initial CRC register value.
pub const CRC_SEED: u16 = 0xFFFF;

/// Compute the frame checksum over `data`.
///
/// Matches the MCU side byte for byte, so it must not be swapped for a
/// table-driven variant with different reflection settings.
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(CRC_SEED, |crc, &byte| {
        let mut x = ((crc >> 8) as u8) ^ byte;
        x ^= x >> 4;
        let x = x as u16;
        (crc << 8) ^ (x << 12) ^ (x << 5) ^ x
    })
}
