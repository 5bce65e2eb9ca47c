//! Byte-stuffed frames on a point-to-point serial line.
//!
//! ```text
//! START  esc(type addr payload.. crc_hi crc_lo)  END
//! ```
//!
//! The CRC-16 covers the unescaped body and is appended big-endian, so the
//! CRC of a whole valid body is zero. Escaping runs over the body after the
//! CRC was appended: every reserved byte is sent as `ESCAPE` followed by the
//! byte itself.

use heapless::Vec;

use crate::transport::{
    LinkError,
    config::{SERIAL_BODY_CAPACITY, SERIAL_FRAME_CAPACITY},
    crc::crc16,
    queue::Payload,
};

pub const START: u8 = 0xF1;
pub const END: u8 = 0xFA;
pub const ESCAPE: u8 = 0xFF;

/// Controller to device message types.
pub mod request {
    pub const READ: u8 = 0x00;
    pub const WRITE: u8 = 0x01;
}

/// Device to controller message types.
pub mod inbound {
    pub const EVENT: u8 = 0x00;
    pub const CHANGE: u8 = 0x01;
    pub const READ_DATA: u8 = 0x02;
}

/// Subtypes of an inbound event, carried in the address byte.
pub mod event {
    pub const DEVICE_RESET: u8 = 0x00;
    /// Followed by the acknowledged register address.
    pub const WRITE_ACK: u8 = 0x01;
    /// Followed by a little-endian [`ErrorCode`](super::ErrorCode).
    pub const ERROR: u8 = 0x02;
}

/// Unescaped frame body.
pub type Body = Vec<u8, SERIAL_BODY_CAPACITY>;

/// Escaped frame including start and end bytes.
pub type FrameBuffer = Vec<u8, SERIAL_FRAME_CAPACITY>;

/// Error categories shared with the remote device.
///
/// Remote codes are reported by the device about frames it received; local
/// codes describe frames this side failed to accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    Unknown = 0x0000,
    RemoteFormat = 0x8001,
    RemoteInternal = 0x8002,
    NotAllowed = 0x8003,
    RemoteCrc = 0x8004,
    LocalFormat = 0xFFF0,
    LocalCrc = 0xFFF1,
}

impl ErrorCode {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0x8001 => Self::RemoteFormat,
            0x8002 => Self::RemoteInternal,
            0x8003 => Self::NotAllowed,
            0x8004 => Self::RemoteCrc,
            0xFFF0 => Self::LocalFormat,
            0xFFF1 => Self::LocalCrc,
            _ => Self::Unknown,
        }
    }

    pub fn raw(self) -> u16 {
        self as u16
    }

    /// Whether the request may be repeated. The device rejected a request it
    /// considered malformed or forbidden, and would reject it again.
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::NotAllowed | Self::RemoteFormat)
    }

    pub fn is_local(self) -> bool {
        matches!(self, Self::LocalFormat | Self::LocalCrc)
    }
}

fn is_reserved(byte: u8) -> bool {
    matches!(byte, START | END | ESCAPE)
}

/// Builds a complete frame of message type `kind`.
///
/// # Errors
/// * [`LinkError::TooLong`] - payload does not fit [`SERIAL_BODY_CAPACITY`]
pub fn encode(kind: u8, addr: u8, payload: &[u8], use_crc: bool) -> Result<FrameBuffer, LinkError> {
    let mut body = Body::new();
    body.push(kind).map_err(|_| LinkError::TooLong)?;
    body.push(addr).map_err(|_| LinkError::TooLong)?;
    body.extend_from_slice(payload)
        .map_err(|_| LinkError::TooLong)?;
    if use_crc {
        let crc = crc16(&body);
        body.extend_from_slice(&crc.to_be_bytes())
            .map_err(|_| LinkError::TooLong)?;
    }

    let mut frame = FrameBuffer::new();
    frame.push(START).map_err(|_| LinkError::TooLong)?;
    for &byte in body.iter() {
        if is_reserved(byte) {
            frame.push(ESCAPE).map_err(|_| LinkError::TooLong)?;
        }
        frame.push(byte).map_err(|_| LinkError::TooLong)?;
    }
    frame.push(END).map_err(|_| LinkError::TooLong)?;
    Ok(frame)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Skipping bytes until the next start byte.
    Idle,
    InFrame,
    Escaped,
}

/// Byte accumulator that splits a received stream into frame bodies.
///
/// Any framing break (bad escape, overflow, a frame too short to carry type
/// and address) is reported once and decoding resumes at the next start byte.
/// A start byte inside a frame silently restarts it.
pub struct FrameDecoder {
    state: DecodeState,
    body: Body,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub const fn new() -> Self {
        Self {
            state: DecodeState::Idle,
            body: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.state = DecodeState::Idle;
        self.body.clear();
    }

    /// Feeds one byte. Returns a body when `byte` completed a frame.
    pub fn push(&mut self, byte: u8) -> Option<Result<Body, LinkError>> {
        match (self.state, byte) {
            (_, START) if self.state != DecodeState::Escaped => {
                if self.state == DecodeState::InFrame {
                    log::debug!("frame restarted after {} bytes", self.body.len());
                }
                self.body.clear();
                self.state = DecodeState::InFrame;
                None
            }
            (DecodeState::Idle, _) => None,
            (DecodeState::InFrame, END) => {
                self.state = DecodeState::Idle;
                if self.body.len() < 2 {
                    return Some(Err(LinkError::Format));
                }
                Some(Ok(core::mem::take(&mut self.body)))
            }
            (DecodeState::InFrame, ESCAPE) => {
                self.state = DecodeState::Escaped;
                None
            }
            (DecodeState::Escaped, b) if !is_reserved(b) => {
                self.reset();
                Some(Err(LinkError::Format))
            }
            (_, b) => {
                self.state = DecodeState::InFrame;
                if self.body.push(b).is_err() {
                    self.reset();
                    return Some(Err(LinkError::Format));
                }
                None
            }
        }
    }
}

/// A decoded device to controller message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    ReadData { register: u8, data: Payload },
    Change { register: u8, data: Payload },
    WriteAck { register: u8 },
    DeviceReset,
    Error(ErrorCode),
}

/// Checks and strips the CRC of `body`, then interprets it.
///
/// # Errors
/// * [`LinkError::Checksum`] - CRC mismatch
/// * [`LinkError::Format`] - truncated body or unknown message type
pub fn parse(body: &[u8], use_crc: bool) -> Result<Inbound, LinkError> {
    let body = if use_crc {
        if body.len() < 4 {
            return Err(LinkError::Format);
        }
        if crc16(body) != 0 {
            return Err(LinkError::Checksum);
        }
        &body[..body.len() - 2]
    } else {
        body
    };
    let [kind, addr, payload @ ..] = body else {
        return Err(LinkError::Format);
    };
    let data = || Payload::from_slice(payload).map_err(|_| LinkError::TooLong);

    match *kind {
        inbound::READ_DATA => Ok(Inbound::ReadData {
            register: *addr,
            data: data()?,
        }),
        inbound::CHANGE => Ok(Inbound::Change {
            register: *addr,
            data: data()?,
        }),
        inbound::EVENT => match *addr {
            event::DEVICE_RESET => Ok(Inbound::DeviceReset),
            event::WRITE_ACK => payload
                .first()
                .map(|&register| Inbound::WriteAck { register })
                .ok_or(LinkError::Format),
            event::ERROR => match payload {
                [lo, hi, ..] => Ok(Inbound::Error(ErrorCode::from_raw(u16::from_le_bytes([*lo, *hi])))),
                _ => Err(LinkError::Format),
            },
            _ => Err(LinkError::Format),
        },
        _ => Err(LinkError::Format),
    }
}
