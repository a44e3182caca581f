//! Message streams: fragmentation and lazy reassembly within a channel.
//!
//! An outbound message fragments its payload against the message's window
//! budget and the frame payload limit; the first fragment opens the
//! message id on the peer, the last carries EOF. An inbound message is a
//! lazy byte stream: fragments are buffered as they arrive and handed out
//! in order, and every consumed byte is reported back as a cumulative
//! window grant so the sender regains credit.
//!
//! Abandoning an inbound message before EOF (explicit [`InboundMessage::cancel`]
//! or drop) always notifies the peer with `MessageAsyncClose`, so window
//! accounting survives silently dropped data.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;

use crate::channel::ChannelShared;
use crate::error::{Error, Result};
use crate::flow::{InboundWindow, OutboundWindow};
use crate::protocol::{msg_flags, Frame};

/// One inbound fragment, or a terminal marker.
#[derive(Debug)]
pub(crate) enum Fragment {
    Data(Bytes),
    Eof,
    /// The sender cancelled the message.
    Cancelled,
    /// The connection or channel died mid-message.
    Broken,
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

pub(crate) struct OutboundMessageShared {
    pub id: u16,
    pub window: OutboundWindow,
}

/// Writer for one outbound message.
///
/// Obtained from [`Channel::send_message`](crate::Channel::send_message).
/// Dropping the writer without [`finish`](Self::finish) cancels the
/// message on the peer.
pub struct MessageWriter {
    channel: Arc<ChannelShared>,
    shared: Arc<OutboundMessageShared>,
    _permit: OwnedSemaphorePermit,
    started: bool,
    finished: bool,
}

impl MessageWriter {
    pub(crate) fn new(
        channel: Arc<ChannelShared>,
        shared: Arc<OutboundMessageShared>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            channel,
            shared,
            _permit: permit,
            started: false,
            finished: false,
        }
    }

    /// Message id on the wire.
    pub fn id(&self) -> u16 {
        self.shared.id
    }

    fn take_flags(&mut self, terminal: u8) -> u8 {
        let mut flags = terminal;
        if !self.started {
            flags |= msg_flags::NEW;
            self.started = true;
        }
        flags
    }

    /// Append bytes to the message.
    ///
    /// Consumes window credit; waits (async) while the window is exhausted
    /// rather than dropping data. Fails with [`Error::MessageCancelled`]
    /// once the receiver has abandoned the message.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.write_bytes(Bytes::copy_from_slice(data)).await
    }

    /// Append bytes without copying.
    pub async fn write_bytes(&mut self, mut data: Bytes) -> Result<()> {
        if self.finished {
            return Err(Error::AlreadyResolved);
        }
        let limit = self.channel.max_frame_payload;
        while !data.is_empty() {
            let want = data.len().min(limit);
            let granted = self.shared.window.acquire(want).await?;
            let payload = data.split_to(granted);
            let flags = self.take_flags(0);
            self.channel
                .writer
                .send(&Frame::MessageData {
                    channel_id: self.channel.id,
                    message_id: self.shared.id,
                    flags,
                    payload,
                })
                .await?;
        }
        Ok(())
    }

    /// Complete the message, sending the EOF fragment.
    pub async fn finish(mut self) -> Result<()> {
        self.finished = true;
        let flags = self.take_flags(msg_flags::EOF);
        let frame = Frame::MessageData {
            channel_id: self.channel.id,
            message_id: self.shared.id,
            flags,
            payload: Bytes::new(),
        };
        let result = self.channel.writer.send(&frame).await;
        self.channel.remove_outbound(self.shared.id);
        result
    }

    /// Cancel the message mid-transfer. The receiver observes a
    /// distinguished "message cancelled" signal instead of data.
    pub async fn cancel(mut self) -> Result<()> {
        self.finished = true;
        let flags = self.take_flags(msg_flags::EOF | msg_flags::CANCELLED);
        let frame = Frame::MessageData {
            channel_id: self.channel.id,
            message_id: self.shared.id,
            flags,
            payload: Bytes::new(),
        };
        let result = self.channel.writer.send(&frame).await;
        self.channel.remove_outbound(self.shared.id);
        result
    }
}

impl Drop for MessageWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Abandoned without finish(): cancel toward the peer, best effort.
        let flags = self.take_flags(msg_flags::EOF | msg_flags::CANCELLED);
        let frame = Frame::MessageData {
            channel_id: self.channel.id,
            message_id: self.shared.id,
            flags,
            payload: Bytes::new(),
        };
        if self.channel.writer.try_send(&frame).is_err() {
            tracing::debug!(
                channel_id = self.channel.id,
                message_id = self.shared.id,
                "dropped message writer could not notify peer"
            );
        }
        self.channel.remove_outbound(self.shared.id);
    }
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

pub(crate) struct InboundMessageShared {
    pub id: u16,
    pub window: InboundWindow,
    pub tx: mpsc::UnboundedSender<Fragment>,
}

impl InboundMessageShared {
    pub fn push(&self, fragment: Fragment) {
        let _ = self.tx.send(fragment);
    }
}

/// Lazy reader for one inbound message.
///
/// Obtained from [`Channel::next_message`](crate::Channel::next_message).
/// Dropping the reader before EOF notifies the peer so its window
/// accounting stays consistent.
pub struct InboundMessage {
    channel: Arc<ChannelShared>,
    shared: Arc<InboundMessageShared>,
    rx: mpsc::UnboundedReceiver<Fragment>,
    done: bool,
}

impl InboundMessage {
    pub(crate) fn new(
        channel: Arc<ChannelShared>,
        shared: Arc<InboundMessageShared>,
        rx: mpsc::UnboundedReceiver<Fragment>,
    ) -> Self {
        Self {
            channel,
            shared,
            rx,
            done: false,
        }
    }

    /// Message id on the wire.
    pub fn id(&self) -> u16 {
        self.shared.id
    }

    /// Read the next fragment, in order.
    ///
    /// Returns `Ok(None)` at end of message, [`Error::MessageCancelled`]
    /// if the sender cancelled, and [`Error::Indeterminate`] if the
    /// connection died mid-message. Consumed bytes are granted back to the
    /// sender as window credit.
    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.done {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(Fragment::Data(data)) => {
                let consumed = self.shared.window.note_consumed(data.len());
                self.channel
                    .writer
                    .send(&Frame::MessageWindowOpen {
                        channel_id: self.channel.id,
                        message_id: self.shared.id,
                        consumed,
                    })
                    .await?;
                Ok(Some(data))
            }
            Some(Fragment::Eof) => {
                self.done = true;
                Ok(None)
            }
            Some(Fragment::Cancelled) => {
                self.done = true;
                Err(Error::MessageCancelled)
            }
            Some(Fragment::Broken) | None => {
                self.done = true;
                Err(Error::Indeterminate(
                    "connection lost before end of message".into(),
                ))
            }
        }
    }

    /// Read every remaining fragment into one buffer.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Abandon the message before full consumption.
    ///
    /// Idempotent. Notifies the peer with `MessageAsyncClose` so the
    /// sender reclaims its window immediately; credit granted so far
    /// reflects only what was actually consumed.
    pub fn cancel(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        let frame = Frame::MessageAsyncClose {
            channel_id: self.channel.id,
            message_id: self.shared.id,
        };
        if self.channel.writer.try_send(&frame).is_err() {
            tracing::debug!(
                channel_id = self.channel.id,
                message_id = self.shared.id,
                "could not send async-close for abandoned message"
            );
        }
        self.channel.remove_inbound(self.shared.id);
    }
}

impl Drop for InboundMessage {
    fn drop(&mut self) {
        self.cancel();
    }
}
