//! Codec module - payload marshalling for application data.
//!
//! The transport core never inspects payload contents; these codecs live
//! above it and turn application values into the opaque bytes an
//! invocation or message carries:
//!
//! - [`RawCodec`] - pass-through for raw bytes (zero-copy)
//! - [`MsgPackCodec`] - MessagePack via `rmp-serde`
//!
//! Codecs are marker structs with static methods rather than trait
//! objects, so codec selection is a compile-time decision. Every call
//! receives its input explicitly; there is no ambient serialization
//! context.

mod msgpack;
mod raw;

pub use msgpack::MsgPackCodec;
pub use raw::RawCodec;
