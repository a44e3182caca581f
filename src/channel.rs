//! Logical channels multiplexed over one connection.
//!
//! A channel is a bidirectional, flow-controlled sub-stream owned by its
//! connection. The connection's read loop routes `MessageData`,
//! `MessageWindowOpen`, and `MessageAsyncClose` frames here; everything
//! else about a channel (id allocation, open/ack bookkeeping) lives in the
//! connection module.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Semaphore};

use crate::config::ChannelOptions;
use crate::error::{Error, Result};
use crate::flow::{InboundWindow, OutboundWindow};
use crate::message::{
    Fragment, InboundMessage, InboundMessageShared, MessageWriter, OutboundMessageShared,
};
use crate::protocol::{msg_flags, Frame, MESSAGE_ID_REMOTE_BIT};
use crate::writer::WriterHandle;

/// Lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    Open,
    Closing,
    Closed,
}

/// Negotiated per-channel settings, from the local perspective.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NegotiatedWindows {
    pub inbound_window: u32,
    pub outbound_window: u32,
    pub max_inbound_messages: u16,
    pub max_outbound_messages: u16,
}

impl NegotiatedWindows {
    /// Acceptor-side negotiation: the peer's request capped by local
    /// defaults. Window fields in the request are from the opener's
    /// perspective, so inbound/outbound swap here.
    pub fn accept(requested_in: u32, requested_out: u32, req_in_msgs: u16, req_out_msgs: u16, local: &ChannelOptions) -> Self {
        Self {
            inbound_window: requested_out.min(local.inbound_window),
            outbound_window: requested_in.min(local.outbound_window),
            max_inbound_messages: req_out_msgs.min(local.max_inbound_messages),
            max_outbound_messages: req_in_msgs.min(local.max_outbound_messages),
        }
    }
}

pub(crate) struct ChannelShared {
    pub id: u32,
    pub service: String,
    pub writer: WriterHandle,
    pub max_frame_payload: usize,
    /// True when this side opened the channel; decides message id parity.
    locally_opened: bool,
    outbound_window_size: u32,
    inbound_window_size: u32,
    max_inbound_messages: u16,
    max_outbound_messages: u16,
    out_semaphore: Arc<Semaphore>,
    next_message_id: AtomicU16,
    outbound: Mutex<HashMap<u16, Arc<OutboundMessageShared>>>,
    inbound: Mutex<HashMap<u16, Arc<InboundMessageShared>>>,
    incoming_tx: Mutex<Option<mpsc::UnboundedSender<InboundMessage>>>,
    incoming_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundMessage>>,
    state: Mutex<ChannelState>,
    closed: AtomicBool,
    /// Removes this channel from the connection's table on terminal events.
    on_remove: Mutex<Option<Box<dyn FnOnce(u32) + Send>>>,
}

impl ChannelShared {
    pub(crate) fn new(
        id: u32,
        service: String,
        writer: WriterHandle,
        max_frame_payload: usize,
        locally_opened: bool,
        windows: NegotiatedWindows,
        on_remove: Box<dyn FnOnce(u32) + Send>,
    ) -> Arc<Self> {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id,
            service,
            writer,
            max_frame_payload,
            locally_opened,
            outbound_window_size: windows.outbound_window,
            inbound_window_size: windows.inbound_window,
            max_inbound_messages: windows.max_inbound_messages,
            max_outbound_messages: windows.max_outbound_messages,
            out_semaphore: Arc::new(Semaphore::new(windows.max_outbound_messages as usize)),
            next_message_id: AtomicU16::new(0),
            outbound: Mutex::new(HashMap::new()),
            inbound: Mutex::new(HashMap::new()),
            incoming_tx: Mutex::new(Some(incoming_tx)),
            incoming_rx: tokio::sync::Mutex::new(incoming_rx),
            state: Mutex::new(ChannelState::Open),
            closed: AtomicBool::new(false),
            on_remove: Mutex::new(Some(on_remove)),
        })
    }

    fn message_id_parity(&self) -> u16 {
        if self.locally_opened {
            0
        } else {
            MESSAGE_ID_REMOTE_BIT
        }
    }

    /// Allocate an outbound message id unused by any live message.
    fn allocate_message_id(&self) -> u16 {
        let outbound = self.outbound.lock().expect("outbound lock");
        loop {
            let raw = self.next_message_id.fetch_add(1, Ordering::AcqRel);
            let id = (raw & !MESSAGE_ID_REMOTE_BIT) | self.message_id_parity();
            if !outbound.contains_key(&id) {
                return id;
            }
        }
    }

    pub(crate) fn remove_outbound(&self, id: u16) {
        self.outbound.lock().expect("outbound lock").remove(&id);
    }

    pub(crate) fn remove_inbound(&self, id: u16) {
        self.inbound.lock().expect("inbound lock").remove(&id);
    }

    // -- frame handlers, called from the connection read loop --------------

    /// Route one `MessageData` fragment. Errors are connection-fatal.
    pub(crate) fn handle_data(
        self: &Arc<Self>,
        message_id: u16,
        flags: u8,
        payload: bytes::Bytes,
    ) -> Result<()> {
        let is_new = msg_flags::has_flag(flags, msg_flags::NEW);
        let is_eof = msg_flags::has_flag(flags, msg_flags::EOF);
        let is_cancelled = msg_flags::has_flag(flags, msg_flags::CANCELLED);

        // The reader is delivered outside the map lock: its drop path
        // (cancel -> remove_inbound) takes the same lock.
        let mut new_reader = None;
        let shared = {
            let mut inbound = self.inbound.lock().expect("inbound lock");
            if is_new {
                if inbound.contains_key(&message_id) {
                    return Err(Error::Protocol(format!(
                        "duplicate message id {message_id:#06x} on channel {}",
                        self.id
                    )));
                }
                if inbound.len() >= self.max_inbound_messages as usize {
                    return Err(Error::Protocol(format!(
                        "peer exceeded {} concurrent inbound messages on channel {}",
                        self.max_inbound_messages, self.id
                    )));
                }
                let (tx, rx) = mpsc::unbounded_channel();
                let shared = Arc::new(InboundMessageShared {
                    id: message_id,
                    window: InboundWindow::new(self.inbound_window_size),
                    tx,
                });
                inbound.insert(message_id, shared.clone());
                new_reader = Some(InboundMessage::new(self.clone(), shared.clone(), rx));
                shared
            } else {
                match inbound.get(&message_id) {
                    Some(shared) => shared.clone(),
                    None => {
                        // Likely racing our own async-close; the peer had
                        // fragments in flight. Nothing to account.
                        tracing::debug!(
                            channel_id = self.id,
                            message_id,
                            "data for unknown message id dropped"
                        );
                        return Ok(());
                    }
                }
            }
        };
        if let Some(reader) = new_reader {
            let tx = self
                .incoming_tx
                .lock()
                .expect("incoming lock")
                .as_ref()
                .cloned();
            match tx {
                // An unconsumed reader (queue gone) drops here, which
                // notifies the peer via async-close.
                Some(tx) => drop(tx.send(reader)),
                None => drop(reader),
            }
        }

        if !payload.is_empty() {
            shared.window.note_received(payload.len(), self.id)?;
            shared.push(Fragment::Data(payload));
        }
        if is_cancelled {
            shared.push(Fragment::Cancelled);
            self.remove_inbound(message_id);
        } else if is_eof {
            shared.push(Fragment::Eof);
            self.remove_inbound(message_id);
        }
        Ok(())
    }

    /// Apply a cumulative window grant to an outbound message.
    pub(crate) fn handle_window_open(&self, message_id: u16, consumed: u64) {
        let outbound = self.outbound.lock().expect("outbound lock");
        match outbound.get(&message_id) {
            Some(shared) => shared.window.grant(consumed),
            None => {
                // Grant raced message completion; cumulative grants make
                // this safe to drop.
                tracing::trace!(
                    channel_id = self.id,
                    message_id,
                    "window grant for unknown message id ignored"
                );
            }
        }
    }

    /// The peer abandoned one of our outbound messages.
    pub(crate) fn handle_async_close(&self, message_id: u16) {
        let shared = {
            let outbound = self.outbound.lock().expect("outbound lock");
            outbound.get(&message_id).cloned()
        };
        if let Some(shared) = shared {
            shared.window.brk();
        }
    }

    /// The peer closed the channel entirely.
    pub(crate) fn handle_remote_closed(&self) {
        self.fail_all("channel closed by peer");
        self.finish_close(false);
    }

    /// Break every in-flight message, both directions.
    pub(crate) fn fail_all(&self, reason: &str) {
        tracing::debug!(channel_id = self.id, reason, "failing channel resources");
        let outbound: Vec<_> = {
            let map = self.outbound.lock().expect("outbound lock");
            map.values().cloned().collect()
        };
        for message in outbound {
            message.window.brk();
        }
        let inbound: Vec<_> = {
            let mut map = self.inbound.lock().expect("inbound lock");
            map.drain().map(|(_, v)| v).collect()
        };
        for message in inbound {
            message.push(Fragment::Broken);
        }
        // Close the incoming queue so next_message() observes the end.
        self.incoming_tx.lock().expect("incoming lock").take();
    }

    /// Transition to closed, optionally notifying the peer, and remove
    /// this channel from the connection's table.
    pub(crate) fn finish_close(&self, notify_peer: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.state.lock().expect("state lock") = ChannelState::Closed;
        self.incoming_tx.lock().expect("incoming lock").take();
        if notify_peer {
            let frame = Frame::ChannelClosed { channel_id: self.id };
            if self.writer.try_send(&frame).is_err() {
                tracing::debug!(channel_id = self.id, "close notification not sent");
            }
        }
        if let Some(on_remove) = self.on_remove.lock().expect("remove lock").take() {
            on_remove(self.id);
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// A logical, bidirectional, flow-controlled sub-stream of a connection.
///
/// Cheaply cloneable handle. A channel never outlives its connection: when
/// the connection fails or closes, every in-flight message on the channel
/// is failed and the channel transitions to closed.
#[derive(Clone)]
pub struct Channel {
    pub(crate) shared: Arc<ChannelShared>,
}

impl Channel {
    /// Channel id on the wire.
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    /// Service name this channel was opened for.
    pub fn service(&self) -> &str {
        &self.shared.service
    }

    /// Whether the channel has fully closed.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Start an outbound message.
    ///
    /// Waits while the channel is at its concurrent outbound message
    /// bound. Fails once the channel is closing or closed.
    pub async fn send_message(&self) -> Result<MessageWriter> {
        if *self.shared.state.lock().expect("state lock") != ChannelState::Open {
            return Err(Error::Closed);
        }
        let permit = self
            .shared
            .out_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Closed)?;
        if *self.shared.state.lock().expect("state lock") != ChannelState::Open {
            return Err(Error::Closed);
        }
        let id = self.shared.allocate_message_id();
        let message = Arc::new(OutboundMessageShared {
            id,
            window: OutboundWindow::new(self.shared.outbound_window_size),
        });
        self.shared
            .outbound
            .lock()
            .expect("outbound lock")
            .insert(id, message.clone());
        Ok(MessageWriter::new(self.shared.clone(), message, permit))
    }

    /// Receive the next inbound message, in arrival order.
    ///
    /// Returns [`Error::Closed`] once the channel is closed and all
    /// buffered messages have been handed out.
    pub async fn next_message(&self) -> Result<InboundMessage> {
        let mut rx = self.shared.incoming_rx.lock().await;
        rx.recv().await.ok_or(Error::Closed)
    }

    /// Close the channel gracefully: drain in-flight outbound messages,
    /// then notify the peer.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock().expect("state lock");
            if *state != ChannelState::Open {
                return Ok(());
            }
            *state = ChannelState::Closing;
        }
        // Draining: every outbound message holds a semaphore permit until
        // it finishes; taking the full complement waits for in-flight
        // writers and blocks new ones.
        let _drained = self
            .shared
            .out_semaphore
            .acquire_many(u32::from(self.shared.max_outbound_messages))
            .await
            .map_err(|_| Error::Closed)?;
        self.shared.fail_all("channel closed locally");
        self.shared.finish_close(true);
        Ok(())
    }

    /// Close the channel abruptly: discard buffered state and notify the
    /// peer asynchronously, without draining in-flight messages.
    pub fn close_abrupt(&self) {
        {
            let mut state = self.shared.state.lock().expect("state lock");
            if *state == ChannelState::Closed {
                return;
            }
            *state = ChannelState::Closing;
        }
        self.shared.fail_all("channel closed abruptly");
        self.shared.finish_close(true);
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.shared.id)
            .field("service", &self.shared.service)
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}

// Kept internal: connections construct channels.
pub(crate) fn channel_from_shared(shared: Arc<ChannelShared>) -> Channel {
    Channel { shared }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::{spawn_writer_task, WriterConfig};
    use bytes::Bytes;

    fn test_channel(locally_opened: bool) -> (Channel, tokio::io::DuplexStream) {
        let (transport, peer) = tokio::io::duplex(1024 * 1024);
        let (writer, _task) = spawn_writer_task(transport, WriterConfig::default());
        let windows = NegotiatedWindows {
            inbound_window: 1024,
            outbound_window: 1024,
            max_inbound_messages: 4,
            max_outbound_messages: 4,
        };
        let shared = ChannelShared::new(
            1,
            "test".into(),
            writer,
            256,
            locally_opened,
            windows,
            Box::new(|_| {}),
        );
        (channel_from_shared(shared), peer)
    }

    #[tokio::test]
    async fn test_message_id_parity() {
        let (local, _peer) = test_channel(true);
        let writer = local.send_message().await.unwrap();
        assert_eq!(writer.id() & MESSAGE_ID_REMOTE_BIT, 0);
        drop(writer);

        let (remote, _peer) = test_channel(false);
        let writer = remote.send_message().await.unwrap();
        assert_eq!(writer.id() & MESSAGE_ID_REMOTE_BIT, MESSAGE_ID_REMOTE_BIT);
    }

    #[tokio::test]
    async fn test_inbound_message_delivery() {
        let (channel, _peer) = test_channel(true);

        channel
            .shared
            .handle_data(
                MESSAGE_ID_REMOTE_BIT,
                msg_flags::NEW,
                Bytes::from_static(b"part one "),
            )
            .unwrap();
        channel
            .shared
            .handle_data(
                MESSAGE_ID_REMOTE_BIT,
                msg_flags::EOF,
                Bytes::from_static(b"part two"),
            )
            .unwrap();

        let mut message = channel.next_message().await.unwrap();
        let body = message.read_to_end().await.unwrap();
        assert_eq!(body, b"part one part two");
    }

    #[tokio::test]
    async fn test_cancelled_inbound_message() {
        let (channel, _peer) = test_channel(true);

        channel
            .shared
            .handle_data(7, msg_flags::NEW, Bytes::from_static(b"partial"))
            .unwrap();
        channel
            .shared
            .handle_data(7, msg_flags::EOF | msg_flags::CANCELLED, Bytes::new())
            .unwrap();

        let mut message = channel.next_message().await.unwrap();
        let first = message.read_chunk().await.unwrap().unwrap();
        assert_eq!(&first[..], b"partial");
        assert!(matches!(
            message.read_chunk().await,
            Err(Error::MessageCancelled)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_new_message_id_is_fatal() {
        let (channel, _peer) = test_channel(true);
        channel
            .shared
            .handle_data(3, msg_flags::NEW, Bytes::from_static(b"x"))
            .unwrap();
        let err = channel
            .shared
            .handle_data(3, msg_flags::NEW, Bytes::from_static(b"y"))
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_inbound_window_overrun_is_fatal() {
        let (channel, _peer) = test_channel(true);
        // window is 1024
        channel
            .shared
            .handle_data(3, msg_flags::NEW, Bytes::from(vec![0u8; 1024]))
            .unwrap();
        let err = channel
            .shared
            .handle_data(3, 0, Bytes::from_static(b"!"))
            .unwrap_err();
        assert!(matches!(err, Error::WindowOverrun { channel_id: 1 }));
    }

    #[tokio::test]
    async fn test_too_many_concurrent_inbound_messages() {
        let (channel, _peer) = test_channel(true);
        for id in 0..4 {
            channel
                .shared
                .handle_data(id, msg_flags::NEW, Bytes::from_static(b"x"))
                .unwrap();
        }
        let err = channel
            .shared
            .handle_data(9, msg_flags::NEW, Bytes::from_static(b"x"))
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_data_for_unknown_message_ignored() {
        let (channel, _peer) = test_channel(true);
        // No NEW flag, unknown id: dropped quietly.
        channel
            .shared
            .handle_data(42, 0, Bytes::from_static(b"stray"))
            .unwrap();
    }

    #[tokio::test]
    async fn test_async_close_breaks_outbound_window() {
        let (channel, _peer) = test_channel(true);
        let mut writer = channel.send_message().await.unwrap();
        writer.write(b"first").await.unwrap();

        channel.shared.handle_async_close(writer.id());
        let err = writer.write(b"more").await.unwrap_err();
        assert!(matches!(err, Error::MessageCancelled));
    }

    #[tokio::test]
    async fn test_fail_all_unblocks_readers() {
        let (channel, _peer) = test_channel(true);
        channel
            .shared
            .handle_data(5, msg_flags::NEW, Bytes::from_static(b"start"))
            .unwrap();
        let mut message = channel.next_message().await.unwrap();
        assert!(message.read_chunk().await.unwrap().is_some());

        channel.shared.fail_all("test teardown");
        assert!(matches!(
            message.read_chunk().await,
            Err(Error::Indeterminate(_))
        ));
        assert!(matches!(channel.next_message().await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_send_message_after_close_fails() {
        let (channel, _peer) = test_channel(true);
        channel.close().await.unwrap();
        assert!(matches!(channel.send_message().await, Err(Error::Closed)));
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (channel, _peer) = test_channel(true);
        channel.close().await.unwrap();
        channel.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_abrupt_close_discards_in_flight_messages() {
        let (channel, _peer) = test_channel(true);
        let mut writer = channel.send_message().await.unwrap();
        writer.write(b"unfinished").await.unwrap();

        channel.close_abrupt();
        assert!(channel.is_closed());
        assert!(matches!(
            writer.write(b"more").await,
            Err(Error::MessageCancelled)
        ));
    }
}
