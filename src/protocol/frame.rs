//! VICP frame codec.
//!
//! Every command and response travels as one or more frames. A frame is an
//! 8-byte header followed by the payload:
//!
//! ```text
//! +-------+---------+----------+----------+------------------------+
//! | flags | version | sequence | reserved | payload length (u32 BE)|
//! +-------+---------+----------+----------+------------------------+
//!    0        1          2          3            4..8
//! ```
//!
//! The flags byte alone decides message boundaries: the final frame of a
//! logical message carries `EOI`. There is no frame count.
//!
//! Pure transforms only; the sequence counter lives in the link session.

use crate::error::{AppResult, VicpError};
use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 8;

/// Only protocol revision in the wild.
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest payload representable in the 32-bit length field.
pub const MAX_PAYLOAD: usize = u32::MAX as usize;

bitflags! {
    /// Control byte of a frame header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ControlFlags: u8 {
        /// Payload carries data.
        const DATA = 0x80;
        /// Put the instrument in remote mode.
        const REMOTE = 0x40;
        /// Lock out the front panel.
        const LOCKOUT = 0x20;
        /// Device clear.
        const CLEAR = 0x10;
        /// Service request raised by the instrument.
        const SRQ = 0x08;
        /// Remote request raised by the instrument.
        const REQ = 0x04;
        /// End of indication: last frame of a logical message.
        const EOI = 0x01;
    }
}

impl ControlFlags {
    /// Flags for an outbound command frame.
    pub fn command(is_final_frame: bool) -> Self {
        let mut flags = ControlFlags::DATA | ControlFlags::REMOTE;
        flags.set(ControlFlags::EOI, is_final_frame);
        flags
    }

    /// True if this frame closes a logical message.
    pub fn is_eoi(self) -> bool {
        self.contains(ControlFlags::EOI)
    }
}

/// Unpack a control byte. Never fails: undefined bits (0x02) are kept as-is.
pub fn decode_flags(byte: u8) -> ControlFlags {
    ControlFlags::from_bits_retain(byte)
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Control flags
    pub flags: ControlFlags,
    /// Protocol version byte
    pub version: u8,
    /// Sequence number
    pub sequence: u8,
    /// Number of payload bytes following the header
    pub length: u32,
}

impl FrameHeader {
    /// Header for a payload of `length` bytes.
    pub fn new(flags: ControlFlags, sequence: u8, length: u32) -> Self {
        Self {
            flags,
            version: PROTOCOL_VERSION,
            sequence,
            length,
        }
    }

    /// Serialize to wire order.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = self.flags.bits();
        out[1] = self.version;
        out[2] = self.sequence;
        out[3] = 0;
        out[4..].copy_from_slice(&self.length.to_be_bytes());
        out
    }

    /// Parse a header, rejecting unknown protocol versions.
    pub fn decode(raw: &[u8; HEADER_LEN]) -> AppResult<Self> {
        let mut buf = &raw[..];
        let flags = decode_flags(buf.get_u8());
        let version = buf.get_u8();
        let sequence = buf.get_u8();
        let _reserved = buf.get_u8();
        let length = buf.get_u32();

        if version != PROTOCOL_VERSION {
            return Err(VicpError::Protocol(format!(
                "unsupported VICP header version {} (flags {:#04x}, length {})",
                version,
                flags.bits(),
                length
            )));
        }

        Ok(Self {
            flags,
            version,
            sequence,
            length,
        })
    }
}

/// Build one command frame: header with DATA|REMOTE (and EOI when final) followed by `payload`.
///
/// Fails with `Encoding` if the payload does not fit the length field. Splitting
/// long commands across frames is the session's job.
pub fn encode_command(payload: &[u8], is_final_frame: bool, sequence: u8) -> AppResult<Vec<u8>> {
    encode_frame(ControlFlags::command(is_final_frame), sequence, payload)
}

/// Build a frame with arbitrary flags.
pub fn encode_frame(flags: ControlFlags, sequence: u8, payload: &[u8]) -> AppResult<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD {
        return Err(VicpError::Encoding(format!(
            "payload of {} bytes exceeds the {} byte frame limit",
            payload.len(),
            MAX_PAYLOAD
        )));
    }

    let header = FrameHeader::new(flags, sequence, payload.len() as u32);
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    out.put_slice(&header.encode());
    out.put_slice(payload);
    Ok(out.to_vec())
}

/// Next sequence number after a frame: EOI advances, wrapping past 255 to 1.
pub fn next_sequence(current: u8, eoi: bool) -> u8 {
    if !eoi {
        return current;
    }
    match current.wrapping_add(1) {
        0 => 1,
        n => n,
    }
}
