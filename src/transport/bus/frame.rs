//! Register framing on the shared bus.
//!
//! Each register in a transfer is followed by one CRC-8 byte. The first
//! register's CRC also covers the addressing prefix the device sees on the
//! wire; later registers cover only their own bytes.
//!
//! ```text
//! write: [dev<<1, reg] data0 crc0 data1 crc1 ...
//!        crc0 = crc8([dev<<1, reg] ++ data0), crcN = crc8(dataN)
//! read:  [dev<<1, reg, dev<<1|1] data0 crc0 data1 crc1 ...
//! ```
//!
//! Without CRC the wire carries the payload bytes only.

use heapless::Vec;

use crate::transport::{
    LinkError,
    config::BUS_WIRE_CAPACITY,
    crc::{crc8, crc8_update},
    queue::Payload,
};

/// Bytes of one transfer as they go over the bus.
pub type WireBuffer = Vec<u8, BUS_WIRE_CAPACITY>;

fn write_prefix(device: u8, register: u8) -> [u8; 2] {
    [device << 1, register]
}

fn read_prefix(device: u8, register: u8) -> [u8; 3] {
    [device << 1, register, (device << 1) | 1]
}

fn total(sizes: &[u16]) -> usize {
    sizes.iter().map(|&s| s as usize).sum()
}

fn chunk_crc(index: usize, prefix: &[u8], chunk: &[u8]) -> u8 {
    if index == 0 {
        crc8_update(crc8(prefix), chunk)
    } else {
        crc8(chunk)
    }
}

/// Wire length of a read of `sizes`.
pub fn read_len(sizes: &[u16], use_crc: bool) -> usize {
    total(sizes) + if use_crc { sizes.len() } else { 0 }
}

fn frame_with(prefix: &[u8], sizes: &[u16], payload: &[u8], use_crc: bool) -> Result<WireBuffer, LinkError> {
    if payload.len() != total(sizes) {
        return Err(LinkError::Format);
    }
    if !use_crc {
        return Vec::from_slice(payload).map_err(|_| LinkError::TooLong);
    }

    let mut wire = WireBuffer::new();
    let mut offset = 0;
    for (i, &size) in sizes.iter().enumerate() {
        let chunk = &payload[offset..offset + size as usize];
        offset += size as usize;
        wire.extend_from_slice(chunk)
            .map_err(|_| LinkError::TooLong)?;
        wire.push(chunk_crc(i, prefix, chunk))
            .map_err(|_| LinkError::TooLong)?;
    }
    Ok(wire)
}

fn split_checked(prefix: &[u8], sizes: &[u16], wire: &[u8], use_crc: bool) -> Result<Payload, LinkError> {
    if wire.len() != read_len(sizes, use_crc) {
        return Err(LinkError::Format);
    }
    if !use_crc {
        return Vec::from_slice(wire).map_err(|_| LinkError::TooLong);
    }

    let mut payload = Payload::new();
    let mut offset = 0;
    for (i, &size) in sizes.iter().enumerate() {
        let end = offset + size as usize + 1;
        let chunk = &wire[offset..end];
        if chunk_crc(i, prefix, chunk) != 0 {
            return Err(LinkError::Checksum);
        }
        payload
            .extend_from_slice(&chunk[..size as usize])
            .map_err(|_| LinkError::TooLong)?;
        offset = end;
    }
    Ok(payload)
}

/// Frames `payload` for a write of consecutive registers starting at `register`.
///
/// # Errors
/// * [`LinkError::Format`] - `payload` length differs from the sum of `sizes`
/// * [`LinkError::TooLong`] - framed bytes exceed [`BUS_WIRE_CAPACITY`]
pub fn encode_write(
    device: u8,
    register: u8,
    sizes: &[u16],
    payload: &[u8],
    use_crc: bool,
) -> Result<WireBuffer, LinkError> {
    frame_with(&write_prefix(device, register), sizes, payload, use_crc)
}

/// Device-side check of a write frame. Returns the payload.
pub fn decode_write(
    device: u8,
    register: u8,
    sizes: &[u16],
    wire: &[u8],
    use_crc: bool,
) -> Result<Payload, LinkError> {
    split_checked(&write_prefix(device, register), sizes, wire, use_crc)
}

/// Device-side framing of a read response.
pub fn encode_read_response(
    device: u8,
    register: u8,
    sizes: &[u16],
    payload: &[u8],
    use_crc: bool,
) -> Result<WireBuffer, LinkError> {
    frame_with(&read_prefix(device, register), sizes, payload, use_crc)
}

/// Verifies a read response and strips its CRC bytes.
///
/// # Errors
/// * [`LinkError::Format`] - wrong number of bytes
/// * [`LinkError::Checksum`] - a register's CRC does not match
pub fn decode_read(
    device: u8,
    register: u8,
    sizes: &[u16],
    wire: &[u8],
    use_crc: bool,
) -> Result<Payload, LinkError> {
    split_checked(&read_prefix(device, register), sizes, wire, use_crc)
}
