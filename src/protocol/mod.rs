//! Protocol module - wire format, frame types, and the decode buffer.
//!
//! Frames are a closed tagged enum ([`Frame`]) decoded once into typed
//! values before dispatch. The wire shape is a 4-byte length prefix plus
//! `[type:1][fields][payload]`.

mod frame;
mod frame_buffer;
pub mod wire;

pub use frame::{validate_frame_length, Frame};
pub use frame_buffer::FrameBuffer;
pub use wire::{
    cap_flags, frame_type, msg_flags, CHANNEL_ID_ACCEPTOR_BIT, LENGTH_PREFIX_SIZE,
    MAX_FRAME_SIZE, MESSAGE_ID_REMOTE_BIT, PROTOCOL_VERSION,
};
