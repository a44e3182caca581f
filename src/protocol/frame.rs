//! Protocol frames as a closed tagged enum.
//!
//! Every frame kind is decoded once into a typed [`Frame`] value before
//! dispatch, so byte-offset arithmetic lives here and nowhere else. Payload
//! bytes ride as `bytes::Bytes` for zero-copy sharing.

use bytes::{BufMut, Bytes, BytesMut};

use super::wire::{
    self, cap_flags, frame_type, msg_flags, LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE,
};
use crate::error::{Error, Result};

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Acceptor's opening move; optionally names the endpoint.
    Greeting {
        version: u8,
        endpoint_name: Option<String>,
    },
    /// Capability advertisement; sent by both sides during negotiation.
    Capabilities {
        version: u8,
        starttls: bool,
        mechanisms: Vec<String>,
    },
    /// Request (initiator) or confirmation (acceptor) of the
    /// transport-security upgrade.
    StartTls,
    /// Select a mechanism and carry its initial response.
    AuthRequest {
        mechanism: String,
        initial_response: Bytes,
    },
    /// Server-to-client mechanism challenge.
    AuthChallenge { challenge: Bytes },
    /// Client-to-server mechanism response.
    AuthResponse { response: Bytes },
    /// Authentication succeeded; carries the mechanism's final data.
    AuthComplete { challenge: Bytes },
    /// The mechanism attempt failed; negotiation may retry.
    AuthRejected { reason: String },
    /// Open a channel for a named service. Window fields are from the
    /// sender's perspective.
    ChannelOpenRequest {
        channel_id: u32,
        service: String,
        inbound_window: u32,
        outbound_window: u32,
        inbound_messages: u16,
        outbound_messages: u16,
    },
    /// Accept a channel open; carries the negotiated windows from the
    /// acceptor's perspective.
    ChannelOpenAck {
        channel_id: u32,
        inbound_window: u32,
        outbound_window: u32,
        inbound_messages: u16,
        outbound_messages: u16,
    },
    /// Refuse a channel open.
    ChannelOpenRefuse { channel_id: u32, reason: String },
    /// The sender has closed its side of the channel.
    ChannelClosed { channel_id: u32 },
    /// One fragment of a message.
    MessageData {
        channel_id: u32,
        message_id: u16,
        flags: u8,
        payload: Bytes,
    },
    /// Cumulative credit grant: total bytes consumed for the message.
    MessageWindowOpen {
        channel_id: u32,
        message_id: u16,
        consumed: u64,
    },
    /// The receiver abandoned the message; the sender may reclaim its
    /// window immediately.
    MessageAsyncClose { channel_id: u32, message_id: u16 },
    /// Heartbeat.
    ConnectionAlive,
    /// Graceful connection shutdown.
    ConnectionClose,
}

impl Frame {
    /// The wire type byte for this frame.
    pub fn type_byte(&self) -> u8 {
        match self {
            Frame::Greeting { .. } => frame_type::GREETING,
            Frame::Capabilities { .. } => frame_type::CAPABILITIES,
            Frame::StartTls => frame_type::START_TLS,
            Frame::AuthRequest { .. } => frame_type::AUTH_REQUEST,
            Frame::AuthChallenge { .. } => frame_type::AUTH_CHALLENGE,
            Frame::AuthResponse { .. } => frame_type::AUTH_RESPONSE,
            Frame::AuthComplete { .. } => frame_type::AUTH_COMPLETE,
            Frame::AuthRejected { .. } => frame_type::AUTH_REJECTED,
            Frame::ChannelOpenRequest { .. } => frame_type::CHANNEL_OPEN_REQUEST,
            Frame::ChannelOpenAck { .. } => frame_type::CHANNEL_OPEN_ACK,
            Frame::ChannelOpenRefuse { .. } => frame_type::CHANNEL_OPEN_REFUSE,
            Frame::ChannelClosed { .. } => frame_type::CHANNEL_CLOSED,
            Frame::MessageData { .. } => frame_type::MESSAGE_DATA,
            Frame::MessageWindowOpen { .. } => frame_type::MESSAGE_WINDOW_OPEN,
            Frame::MessageAsyncClose { .. } => frame_type::MESSAGE_ASYNC_CLOSE,
            Frame::ConnectionAlive => frame_type::CONNECTION_ALIVE,
            Frame::ConnectionClose => frame_type::CONNECTION_CLOSE,
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Greeting { .. } => "greeting",
            Frame::Capabilities { .. } => "capabilities",
            Frame::StartTls => "start-tls",
            Frame::AuthRequest { .. } => "auth-request",
            Frame::AuthChallenge { .. } => "auth-challenge",
            Frame::AuthResponse { .. } => "auth-response",
            Frame::AuthComplete { .. } => "auth-complete",
            Frame::AuthRejected { .. } => "auth-rejected",
            Frame::ChannelOpenRequest { .. } => "channel-open-request",
            Frame::ChannelOpenAck { .. } => "channel-open-ack",
            Frame::ChannelOpenRefuse { .. } => "channel-open-refuse",
            Frame::ChannelClosed { .. } => "channel-closed",
            Frame::MessageData { .. } => "message-data",
            Frame::MessageWindowOpen { .. } => "message-window-open",
            Frame::MessageAsyncClose { .. } => "message-async-close",
            Frame::ConnectionAlive => "connection-alive",
            Frame::ConnectionClose => "connection-close",
        }
    }

    /// Encode as `(prefix, payload)` for scatter/gather writes.
    ///
    /// The prefix holds the length word, type byte, and all fixed fields;
    /// the payload is non-empty only for frames that carry opaque bytes.
    /// Header fields are paid once per frame here, never per call site.
    pub fn encode_parts(&self) -> (Bytes, Bytes) {
        let mut head = BytesMut::with_capacity(64);
        head.put_u32(0); // patched below
        head.put_u8(self.type_byte());
        let payload = match self {
            Frame::Greeting {
                version,
                endpoint_name,
            } => {
                head.put_u8(*version);
                wire::put_string(&mut head, endpoint_name.as_deref().unwrap_or(""));
                Bytes::new()
            }
            Frame::Capabilities {
                version,
                starttls,
                mechanisms,
            } => {
                head.put_u8(*version);
                head.put_u8(if *starttls { cap_flags::STARTTLS } else { 0 });
                head.put_u8(mechanisms.len().min(u8::MAX as usize) as u8);
                for mech in mechanisms.iter().take(u8::MAX as usize) {
                    wire::put_string(&mut head, mech);
                }
                Bytes::new()
            }
            Frame::StartTls | Frame::ConnectionAlive | Frame::ConnectionClose => Bytes::new(),
            Frame::AuthRequest {
                mechanism,
                initial_response,
            } => {
                wire::put_string(&mut head, mechanism);
                initial_response.clone()
            }
            Frame::AuthChallenge { challenge } => challenge.clone(),
            Frame::AuthResponse { response } => response.clone(),
            Frame::AuthComplete { challenge } => challenge.clone(),
            Frame::AuthRejected { reason } => {
                wire::put_string(&mut head, reason);
                Bytes::new()
            }
            Frame::ChannelOpenRequest {
                channel_id,
                service,
                inbound_window,
                outbound_window,
                inbound_messages,
                outbound_messages,
            } => {
                head.put_u32(*channel_id);
                wire::put_string(&mut head, service);
                head.put_u32(*inbound_window);
                head.put_u32(*outbound_window);
                head.put_u16(*inbound_messages);
                head.put_u16(*outbound_messages);
                Bytes::new()
            }
            Frame::ChannelOpenAck {
                channel_id,
                inbound_window,
                outbound_window,
                inbound_messages,
                outbound_messages,
            } => {
                head.put_u32(*channel_id);
                head.put_u32(*inbound_window);
                head.put_u32(*outbound_window);
                head.put_u16(*inbound_messages);
                head.put_u16(*outbound_messages);
                Bytes::new()
            }
            Frame::ChannelOpenRefuse { channel_id, reason } => {
                head.put_u32(*channel_id);
                wire::put_string(&mut head, reason);
                Bytes::new()
            }
            Frame::ChannelClosed { channel_id } => {
                head.put_u32(*channel_id);
                Bytes::new()
            }
            Frame::MessageData {
                channel_id,
                message_id,
                flags,
                payload,
            } => {
                head.put_u32(*channel_id);
                head.put_u16(*message_id);
                head.put_u8(*flags);
                payload.clone()
            }
            Frame::MessageWindowOpen {
                channel_id,
                message_id,
                consumed,
            } => {
                head.put_u32(*channel_id);
                head.put_u16(*message_id);
                head.put_u64(*consumed);
                Bytes::new()
            }
            Frame::MessageAsyncClose {
                channel_id,
                message_id,
            } => {
                head.put_u32(*channel_id);
                head.put_u16(*message_id);
                Bytes::new()
            }
        };
        let body_len = head.len() - LENGTH_PREFIX_SIZE + payload.len();
        head[0..4].copy_from_slice(&(body_len as u32).to_be_bytes());
        (head.freeze(), payload)
    }

    /// Encode into a single contiguous buffer, length prefix included.
    pub fn encode(&self) -> Bytes {
        let (prefix, payload) = self.encode_parts();
        if payload.is_empty() {
            return prefix;
        }
        let mut buf = BytesMut::with_capacity(prefix.len() + payload.len());
        buf.put_slice(&prefix);
        buf.put_slice(&payload);
        buf.freeze()
    }

    /// Decode one frame body (length prefix already stripped).
    pub fn decode(mut body: Bytes) -> Result<Frame> {
        let kind = wire::get_u8(&mut body, "frame type")?;
        let frame = match kind {
            frame_type::GREETING => {
                let version = wire::get_u8(&mut body, "greeting version")?;
                let name = wire::get_string(&mut body, "greeting endpoint name")?;
                wire::expect_empty(&body, "greeting")?;
                Frame::Greeting {
                    version,
                    endpoint_name: if name.is_empty() { None } else { Some(name) },
                }
            }
            frame_type::CAPABILITIES => {
                let version = wire::get_u8(&mut body, "capabilities version")?;
                let flags = wire::get_u8(&mut body, "capabilities flags")?;
                let count = wire::get_u8(&mut body, "mechanism count")?;
                let mut mechanisms = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    mechanisms.push(wire::get_string(&mut body, "mechanism name")?);
                }
                wire::expect_empty(&body, "capabilities")?;
                Frame::Capabilities {
                    version,
                    starttls: flags & cap_flags::STARTTLS != 0,
                    mechanisms,
                }
            }
            frame_type::START_TLS => {
                wire::expect_empty(&body, "start-tls")?;
                Frame::StartTls
            }
            frame_type::AUTH_REQUEST => {
                let mechanism = wire::get_string(&mut body, "auth mechanism")?;
                Frame::AuthRequest {
                    mechanism,
                    initial_response: body,
                }
            }
            frame_type::AUTH_CHALLENGE => Frame::AuthChallenge { challenge: body },
            frame_type::AUTH_RESPONSE => Frame::AuthResponse { response: body },
            frame_type::AUTH_COMPLETE => Frame::AuthComplete { challenge: body },
            frame_type::AUTH_REJECTED => {
                let reason = wire::get_string(&mut body, "rejection reason")?;
                wire::expect_empty(&body, "auth-rejected")?;
                Frame::AuthRejected { reason }
            }
            frame_type::CHANNEL_OPEN_REQUEST => {
                let channel_id = wire::get_u32(&mut body, "channel id")?;
                let service = wire::get_string(&mut body, "service name")?;
                let inbound_window = wire::get_u32(&mut body, "inbound window")?;
                let outbound_window = wire::get_u32(&mut body, "outbound window")?;
                let inbound_messages = wire::get_u16(&mut body, "inbound message count")?;
                let outbound_messages = wire::get_u16(&mut body, "outbound message count")?;
                wire::expect_empty(&body, "channel-open-request")?;
                Frame::ChannelOpenRequest {
                    channel_id,
                    service,
                    inbound_window,
                    outbound_window,
                    inbound_messages,
                    outbound_messages,
                }
            }
            frame_type::CHANNEL_OPEN_ACK => {
                let channel_id = wire::get_u32(&mut body, "channel id")?;
                let inbound_window = wire::get_u32(&mut body, "inbound window")?;
                let outbound_window = wire::get_u32(&mut body, "outbound window")?;
                let inbound_messages = wire::get_u16(&mut body, "inbound message count")?;
                let outbound_messages = wire::get_u16(&mut body, "outbound message count")?;
                wire::expect_empty(&body, "channel-open-ack")?;
                Frame::ChannelOpenAck {
                    channel_id,
                    inbound_window,
                    outbound_window,
                    inbound_messages,
                    outbound_messages,
                }
            }
            frame_type::CHANNEL_OPEN_REFUSE => {
                let channel_id = wire::get_u32(&mut body, "channel id")?;
                let reason = wire::get_string(&mut body, "refusal reason")?;
                wire::expect_empty(&body, "channel-open-refuse")?;
                Frame::ChannelOpenRefuse { channel_id, reason }
            }
            frame_type::CHANNEL_CLOSED => {
                let channel_id = wire::get_u32(&mut body, "channel id")?;
                wire::expect_empty(&body, "channel-closed")?;
                Frame::ChannelClosed { channel_id }
            }
            frame_type::MESSAGE_DATA => {
                let channel_id = wire::get_u32(&mut body, "channel id")?;
                let message_id = wire::get_u16(&mut body, "message id")?;
                let flags = wire::get_u8(&mut body, "message flags")?;
                if flags & msg_flags::RESERVED_MASK != 0 {
                    return Err(Error::Protocol(format!(
                        "reserved message flag bits set: {flags:#04x}"
                    )));
                }
                Frame::MessageData {
                    channel_id,
                    message_id,
                    flags,
                    payload: body,
                }
            }
            frame_type::MESSAGE_WINDOW_OPEN => {
                let channel_id = wire::get_u32(&mut body, "channel id")?;
                let message_id = wire::get_u16(&mut body, "message id")?;
                let consumed = wire::get_u64(&mut body, "consumed byte count")?;
                wire::expect_empty(&body, "message-window-open")?;
                Frame::MessageWindowOpen {
                    channel_id,
                    message_id,
                    consumed,
                }
            }
            frame_type::MESSAGE_ASYNC_CLOSE => {
                let channel_id = wire::get_u32(&mut body, "channel id")?;
                let message_id = wire::get_u16(&mut body, "message id")?;
                wire::expect_empty(&body, "message-async-close")?;
                Frame::MessageAsyncClose {
                    channel_id,
                    message_id,
                }
            }
            frame_type::CONNECTION_ALIVE => {
                wire::expect_empty(&body, "connection-alive")?;
                Frame::ConnectionAlive
            }
            frame_type::CONNECTION_CLOSE => {
                wire::expect_empty(&body, "connection-close")?;
                Frame::ConnectionClose
            }
            other => {
                return Err(Error::Protocol(format!(
                    "unknown frame type {other:#04x}"
                )))
            }
        };
        Ok(frame)
    }
}

/// Validate a length word read off the wire.
pub fn validate_frame_length(len: u32) -> Result<()> {
    if len == 0 {
        return Err(Error::Protocol("zero-length frame".into()));
    }
    if len > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "frame length {len} exceeds maximum {MAX_FRAME_SIZE}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: Frame) -> Frame {
        let encoded = frame.encode();
        let body = encoded.slice(LENGTH_PREFIX_SIZE..);
        Frame::decode(body).unwrap()
    }

    #[test]
    fn test_length_prefix_matches_body() {
        let frame = Frame::MessageData {
            channel_id: 9,
            message_id: 3,
            flags: msg_flags::NEW,
            payload: Bytes::from_static(b"hello"),
        };
        let encoded = frame.encode();
        let len = u32::from_be_bytes(encoded[0..4].try_into().unwrap()) as usize;
        assert_eq!(len, encoded.len() - LENGTH_PREFIX_SIZE);
    }

    #[test]
    fn test_greeting_round_trip() {
        let frame = Frame::Greeting {
            version: 1,
            endpoint_name: Some("node-b".into()),
        };
        assert_eq!(round_trip(frame.clone()), frame);

        let anonymous = Frame::Greeting {
            version: 1,
            endpoint_name: None,
        };
        assert_eq!(round_trip(anonymous.clone()), anonymous);
    }

    #[test]
    fn test_capabilities_round_trip() {
        let frame = Frame::Capabilities {
            version: 1,
            starttls: true,
            mechanisms: vec!["HMAC-SHA256".into(), "ANONYMOUS".into()],
        };
        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn test_auth_frames_round_trip() {
        let request = Frame::AuthRequest {
            mechanism: "HMAC-SHA256".into(),
            initial_response: Bytes::from_static(b"alice"),
        };
        assert_eq!(round_trip(request.clone()), request);

        let rejected = Frame::AuthRejected {
            reason: "bad signature".into(),
        };
        assert_eq!(round_trip(rejected.clone()), rejected);
    }

    #[test]
    fn test_channel_open_round_trip() {
        let frame = Frame::ChannelOpenRequest {
            channel_id: 42,
            service: "echo".into(),
            inbound_window: 65536,
            outbound_window: 32768,
            inbound_messages: 16,
            outbound_messages: 8,
        };
        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn test_window_open_round_trip() {
        let frame = Frame::MessageWindowOpen {
            channel_id: 0x8000_0001,
            message_id: 0x8002,
            consumed: u64::from(u32::MAX) + 17,
        };
        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn test_empty_frames_round_trip() {
        for frame in [Frame::StartTls, Frame::ConnectionAlive, Frame::ConnectionClose] {
            assert_eq!(round_trip(frame.clone()), frame);
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = Frame::decode(Bytes::from_static(&[0xEE])).unwrap_err();
        assert!(err.to_string().contains("unknown frame type"));
    }

    #[test]
    fn test_truncated_body_rejected() {
        // channel-closed missing its channel id
        let err = Frame::decode(Bytes::from_static(&[frame_type::CHANNEL_CLOSED])).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        let mut encoded = BytesMut::new();
        encoded.put_u8(frame_type::CONNECTION_ALIVE);
        encoded.put_u8(0xAA);
        let err = Frame::decode(encoded.freeze()).unwrap_err();
        assert!(err.to_string().contains("trailing garbage"));
    }

    #[test]
    fn test_reserved_message_flags_rejected() {
        let frame = Frame::MessageData {
            channel_id: 1,
            message_id: 1,
            flags: 0x40,
            payload: Bytes::new(),
        };
        let encoded = frame.encode();
        let err = Frame::decode(encoded.slice(LENGTH_PREFIX_SIZE..)).unwrap_err();
        assert!(err.to_string().contains("reserved message flag"));
    }

    #[test]
    fn test_validate_frame_length() {
        assert!(validate_frame_length(0).is_err());
        assert!(validate_frame_length(1).is_ok());
        assert!(validate_frame_length(MAX_FRAME_SIZE).is_ok());
        assert!(validate_frame_length(MAX_FRAME_SIZE + 1).is_err());
    }

    #[test]
    fn test_encode_parts_payload_zero_copy() {
        let payload = Bytes::from_static(b"fragment bytes");
        let frame = Frame::MessageData {
            channel_id: 1,
            message_id: 2,
            flags: msg_flags::NEW | msg_flags::EOF,
            payload: payload.clone(),
        };
        let (_, out_payload) = frame.encode_parts();
        assert_eq!(out_payload.as_ptr(), payload.as_ptr());
    }
}
