//! Table-driven CRCs used by both wire formats.
//!
//! Both are MSB-first with a zero initial value and no final xor, so running
//! the CRC over a message followed by its own checksum (big-endian for the
//! 16-bit form) yields zero.

/// Polynomial of the per-register shared-bus checksum.
pub const CRC8_POLY: u8 = 0x7F;

/// Polynomial of the serial frame checksum.
pub const CRC16_POLY: u16 = 0x1FB7;

const CRC8_TABLE: [u8; 256] = crc8_table(CRC8_POLY);
const CRC16_TABLE: [u16; 256] = crc16_table(CRC16_POLY);

const fn crc8_table(poly: u8) -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ poly
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

const fn crc16_table(poly: u16) -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ poly
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Continues a CRC-8 over `data`.
#[inline]
pub fn crc8_update(mut crc: u8, data: &[u8]) -> u8 {
    for &byte in data {
        crc = CRC8_TABLE[(byte ^ crc) as usize];
    }
    crc
}

#[inline]
pub fn crc8(data: &[u8]) -> u8 {
    crc8_update(0, data)
}

/// Continues a CRC-16 over `data`.
#[inline]
pub fn crc16_update(mut crc: u16, data: &[u8]) -> u16 {
    for &byte in data {
        crc = (crc << 8) ^ CRC16_TABLE[((crc >> 8) as u8 ^ byte) as usize];
    }
    crc
}

#[inline]
pub fn crc16(data: &[u8]) -> u16 {
    crc16_update(0, data)
}
