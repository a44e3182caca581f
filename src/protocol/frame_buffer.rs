//! Decode buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management and a two-state
//! machine for fragmented frames:
//! - `WaitingForLength`: need the 4-byte length word
//! - `WaitingForBody`: length known, need that many more bytes

use bytes::BytesMut;

use super::frame::{validate_frame_length, Frame};
use super::wire::LENGTH_PREFIX_SIZE;
use crate::error::Result;

#[derive(Debug, Clone, Copy)]
enum State {
    WaitingForLength,
    WaitingForBody { len: usize },
}

/// Buffer that turns a byte stream into decoded [`Frame`] values.
///
/// All data is staged in a single `BytesMut`; frame bodies are split off
/// and decoded without re-copying payload bytes.
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
}

impl FrameBuffer {
    /// Create an empty frame buffer.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForLength,
        }
    }

    /// Push raw bytes and extract every complete frame.
    ///
    /// Partial data stays buffered for the next push. A malformed length
    /// word or body is a protocol violation and poisons the connection;
    /// the caller must close it.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        loop {
            match self.state {
                State::WaitingForLength => {
                    if self.buffer.len() < LENGTH_PREFIX_SIZE {
                        return Ok(None);
                    }
                    let len = u32::from_be_bytes(
                        self.buffer[..LENGTH_PREFIX_SIZE].try_into().expect("4 bytes"),
                    );
                    validate_frame_length(len)?;
                    let _ = self.buffer.split_to(LENGTH_PREFIX_SIZE);
                    self.state = State::WaitingForBody { len: len as usize };
                }
                State::WaitingForBody { len } => {
                    if self.buffer.len() < len {
                        return Ok(None);
                    }
                    let body = self.buffer.split_to(len).freeze();
                    self.state = State::WaitingForLength;
                    return Frame::decode(body).map(Some);
                }
            }
        }
    }

    /// Number of buffered bytes awaiting a complete frame.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the buffer holds no partial data.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && matches!(self.state, State::WaitingForLength)
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire::msg_flags;
    use bytes::Bytes;

    fn data_frame(channel_id: u32, payload: &'static [u8]) -> Frame {
        Frame::MessageData {
            channel_id,
            message_id: 1,
            flags: msg_flags::NEW,
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn test_single_complete_frame() {
        let mut buffer = FrameBuffer::new();
        let frame = data_frame(1, b"hello");
        let frames = buffer.push(&frame.encode()).unwrap();
        assert_eq!(frames, vec![frame]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut buffer = FrameBuffer::new();
        let mut bytes = Vec::new();
        for id in 1..=3 {
            bytes.extend_from_slice(&data_frame(id, b"x").encode());
        }
        let frames = buffer.push(&bytes).unwrap();
        assert_eq!(frames.len(), 3);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fragmented_length_prefix() {
        let mut buffer = FrameBuffer::new();
        let encoded = Frame::ConnectionAlive.encode();

        assert!(buffer.push(&encoded[..2]).unwrap().is_empty());
        let frames = buffer.push(&encoded[2..]).unwrap();
        assert_eq!(frames, vec![Frame::ConnectionAlive]);
    }

    #[test]
    fn test_fragmented_body() {
        let mut buffer = FrameBuffer::new();
        let frame = data_frame(7, b"a somewhat longer payload");
        let encoded = frame.encode();
        let split = LENGTH_PREFIX_SIZE + 9;

        assert!(buffer.push(&encoded[..split]).unwrap().is_empty());
        assert!(!buffer.is_empty());
        let frames = buffer.push(&encoded[split..]).unwrap();
        assert_eq!(frames, vec![frame]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buffer = FrameBuffer::new();
        let frame = data_frame(2, b"hi");
        let encoded = frame.encode();

        let mut collected = Vec::new();
        for byte in encoded.iter() {
            collected.extend(buffer.push(&[*byte]).unwrap());
        }
        assert_eq!(collected, vec![frame]);
    }

    #[test]
    fn test_mixed_complete_and_partial() {
        let mut buffer = FrameBuffer::new();
        let first = data_frame(1, b"first");
        let second = data_frame(2, b"second");
        let second_bytes = second.encode();

        let mut push = first.encode().to_vec();
        push.extend_from_slice(&second_bytes[..5]);

        let frames = buffer.push(&push).unwrap();
        assert_eq!(frames, vec![first]);

        let frames = buffer.push(&second_bytes[5..]).unwrap();
        assert_eq!(frames, vec![second]);
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut buffer = FrameBuffer::new();
        let result = buffer.push(&u32::MAX.to_be_bytes());
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_length_rejected() {
        let mut buffer = FrameBuffer::new();
        assert!(buffer.push(&0u32.to_be_bytes()).is_err());
    }

    #[test]
    fn test_malformed_body_rejected() {
        let mut buffer = FrameBuffer::new();
        // length 1, unknown type byte
        let mut bytes = 1u32.to_be_bytes().to_vec();
        bytes.push(0xEE);
        assert!(buffer.push(&bytes).is_err());
    }
}
