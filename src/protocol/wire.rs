//! Wire format primitives.
//!
//! Every frame is a 4-byte Big Endian length prefix followed by a body of
//! `[type:1][type-specific fields][payload]`. Strings are UTF-8 with a u16
//! BE length prefix. Channel ids are u32 and message ids are u16; the high
//! bit of each marks ids allocated by the acceptor side of the connection,
//! so both peers can allocate without coordination.

use bytes::{Buf, BufMut, Bytes};

use crate::error::{Error, Result};

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Negotiated protocol version carried in greeting and capabilities.
pub const PROTOCOL_VERSION: u8 = 1;

/// Hard cap on a single frame body, prefix excluded.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// High bit marking a channel id allocated by the acceptor side.
pub const CHANNEL_ID_ACCEPTOR_BIT: u32 = 0x8000_0000;

/// High bit marking a message id opened by the remote peer.
pub const MESSAGE_ID_REMOTE_BIT: u16 = 0x8000;

/// Frame type bytes.
pub mod frame_type {
    pub const GREETING: u8 = 0x01;
    pub const CAPABILITIES: u8 = 0x02;
    pub const START_TLS: u8 = 0x03;
    pub const AUTH_REQUEST: u8 = 0x04;
    pub const AUTH_CHALLENGE: u8 = 0x05;
    pub const AUTH_RESPONSE: u8 = 0x06;
    pub const AUTH_COMPLETE: u8 = 0x07;
    pub const AUTH_REJECTED: u8 = 0x08;
    pub const CHANNEL_OPEN_REQUEST: u8 = 0x10;
    pub const CHANNEL_OPEN_ACK: u8 = 0x11;
    pub const CHANNEL_OPEN_REFUSE: u8 = 0x12;
    pub const CHANNEL_CLOSED: u8 = 0x13;
    pub const MESSAGE_DATA: u8 = 0x20;
    pub const MESSAGE_WINDOW_OPEN: u8 = 0x21;
    pub const MESSAGE_ASYNC_CLOSE: u8 = 0x22;
    pub const CONNECTION_ALIVE: u8 = 0x30;
    pub const CONNECTION_CLOSE: u8 = 0x31;
}

/// Flag bits carried by `MessageData` frames.
pub mod msg_flags {
    /// Final fragment of the message.
    pub const EOF: u8 = 0x01;
    /// First fragment of the message; opens the message id.
    pub const NEW: u8 = 0x02;
    /// The sender cancelled the message; implies EOF.
    pub const CANCELLED: u8 = 0x04;

    /// Bits that must be zero.
    pub const RESERVED_MASK: u8 = 0xF8;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }
}

/// Flag bits carried by `Capabilities` frames.
pub mod cap_flags {
    /// The sender offers a transport-security upgrade.
    pub const STARTTLS: u8 = 0x01;
}

fn truncated(what: &str) -> Error {
    Error::Protocol(format!("truncated frame: missing {what}"))
}

/// Read a u8, failing on underflow.
pub fn get_u8(buf: &mut Bytes, what: &str) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(truncated(what));
    }
    Ok(buf.get_u8())
}

/// Read a u16 BE, failing on underflow.
pub fn get_u16(buf: &mut Bytes, what: &str) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(truncated(what));
    }
    Ok(buf.get_u16())
}

/// Read a u32 BE, failing on underflow.
pub fn get_u32(buf: &mut Bytes, what: &str) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(truncated(what));
    }
    Ok(buf.get_u32())
}

/// Read a u64 BE, failing on underflow.
pub fn get_u64(buf: &mut Bytes, what: &str) -> Result<u64> {
    if buf.remaining() < 8 {
        return Err(truncated(what));
    }
    Ok(buf.get_u64())
}

/// Read a u16-length-prefixed UTF-8 string.
pub fn get_string(buf: &mut Bytes, what: &str) -> Result<String> {
    let len = get_u16(buf, what)? as usize;
    if buf.remaining() < len {
        return Err(truncated(what));
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| Error::Protocol(format!("invalid UTF-8 in {what}")))
}

/// Write a u16-length-prefixed UTF-8 string.
///
/// Strings longer than `u16::MAX` bytes are a caller bug; they are
/// truncated at a char boundary rather than corrupting the frame.
pub fn put_string(buf: &mut impl BufMut, s: &str) {
    let mut bytes = s.as_bytes();
    if bytes.len() > u16::MAX as usize {
        let mut end = u16::MAX as usize;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        bytes = &bytes[..end];
    }
    buf.put_u16(bytes.len() as u16);
    buf.put_slice(bytes);
}

/// Reject trailing bytes after a fixed-layout frame body.
pub fn expect_empty(buf: &Bytes, kind: &str) -> Result<()> {
    if buf.has_remaining() {
        return Err(Error::Protocol(format!(
            "{} bytes of trailing garbage after {kind} frame",
            buf.remaining()
        )));
    }
    Ok(())
}
