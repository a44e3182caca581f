//! Raw codec - pass-through for binary data.
//!
//! Used when the payload is already serialized or is inherently raw bytes.
//!
//! # Example
//!
//! ```
//! use remlink::codec::RawCodec;
//! use bytes::Bytes;
//!
//! let data = b"binary payload";
//! let marshalled = RawCodec::marshal(data);
//! assert_eq!(&marshalled[..], data);
//!
//! let bytes = Bytes::from_static(b"zero copy");
//! let passed = RawCodec::marshal_bytes(bytes.clone());
//! assert_eq!(passed.as_ptr(), bytes.as_ptr());
//! ```

use bytes::Bytes;

/// Codec that passes bytes through without transformation.
pub struct RawCodec;

impl RawCodec {
    /// Marshal raw bytes (copies data into `Bytes`).
    ///
    /// For true zero-copy, use `marshal_bytes` with an existing `Bytes`.
    #[inline]
    pub fn marshal(data: &[u8]) -> Bytes {
        Bytes::copy_from_slice(data)
    }

    /// Marshal `Bytes` (zero-copy, returns the input).
    #[inline]
    pub fn marshal_bytes(data: Bytes) -> Bytes {
        data
    }

    /// Unmarshal - a reference to the input (zero-copy).
    #[inline]
    pub fn unmarshal(data: &[u8]) -> &[u8] {
        data
    }
}
