//! The authenticated connection: frame dispatch and channel ownership.
//!
//! A connection owns its channels and their pending opens through locked
//! maps keyed by id, with explicit removal on terminal events. One read
//! task decodes frames and dispatches on the typed [`Frame`] value; one
//! writer task (see [`crate::writer`]) serializes everything outbound; a
//! heartbeat task emits `ConnectionAlive` on an interval. Handler and
//! service code always runs on spawned tasks, never on the read path.
//!
//! Connection-fatal errors are broadcast to every owned resource (channels
//! fail, pending requests resolve indeterminate, pending opens fail)
//! before the connection transitions to closed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::io::{AsyncReadExt, ReadHalf};
use tokio::sync::{oneshot, Notify};

use crate::channel::{channel_from_shared, Channel, ChannelShared, NegotiatedWindows};
use crate::config::{ChannelOptions, EndpointConfig};
use crate::error::{Error, Result};
use crate::lifecycle::ResourceGuard;
use crate::negotiate::{NegotiatedSession, SecurityLayer};
use crate::protocol::{Frame, FrameBuffer, CHANNEL_ID_ACCEPTOR_BIT};
use crate::service::ServiceRegistry;
use crate::transport::BoxedTransport;
use crate::writer::WriterHandle;

/// Which side of the connection this endpoint played.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// This side connected.
    Initiator,
    /// This side accepted.
    Acceptor,
}

struct PendingOpen {
    service: String,
    tx: oneshot::Sender<Result<Channel>>,
}

pub(crate) struct ConnectionShared {
    role: Role,
    session: NegotiatedSession,
    config: Arc<EndpointConfig>,
    services: ServiceRegistry,
    pub(crate) writer: WriterHandle,
    channels: Mutex<HashMap<u32, Arc<ChannelShared>>>,
    pending_opens: Mutex<HashMap<u32, PendingOpen>>,
    next_channel_id: AtomicU32,
    closed: AtomicBool,
    shutdown_notify: Notify,
    alive_seen: AtomicU64,
    /// Lifecycle registration; released on shutdown so endpoint close
    /// never waits on user-held handles.
    guard: Mutex<Option<ResourceGuard>>,
    /// Removes this connection from the endpoint's table on shutdown.
    on_remove: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ConnectionShared {
    fn channel_id_parity(&self) -> u32 {
        match self.role {
            Role::Initiator => 0,
            Role::Acceptor => CHANNEL_ID_ACCEPTOR_BIT,
        }
    }

    /// Allocate a channel id not used by any live or pending channel.
    fn allocate_channel_id(&self) -> u32 {
        let channels = self.channels.lock().expect("channels lock");
        let pending = self.pending_opens.lock().expect("pending lock");
        loop {
            let raw = self.next_channel_id.fetch_add(1, Ordering::AcqRel);
            let id = (raw & !CHANNEL_ID_ACCEPTOR_BIT) | self.channel_id_parity();
            if !channels.contains_key(&id) && !pending.contains_key(&id) {
                return id;
            }
        }
    }

    fn make_channel(
        self: &Arc<Self>,
        id: u32,
        service: String,
        locally_opened: bool,
        windows: NegotiatedWindows,
    ) -> Arc<ChannelShared> {
        let weak: Weak<ConnectionShared> = Arc::downgrade(self);
        ChannelShared::new(
            id,
            service,
            self.writer.clone(),
            self.config.max_frame_payload as usize,
            locally_opened,
            windows,
            Box::new(move |id| {
                if let Some(conn) = weak.upgrade() {
                    conn.channels.lock().expect("channels lock").remove(&id);
                }
            }),
        )
    }

    /// Broadcast a terminal condition to every owned resource, then close.
    fn shutdown(&self, reason: &str, notify_peer: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(role = ?self.role, reason, "connection shutting down");

        let channels: Vec<_> = {
            let mut map = self.channels.lock().expect("channels lock");
            map.drain().map(|(_, v)| v).collect()
        };
        for channel in channels {
            channel.fail_all(reason);
            channel.finish_close(false);
        }

        let opens: Vec<_> = {
            let mut map = self.pending_opens.lock().expect("pending lock");
            map.drain().map(|(_, v)| v).collect()
        };
        for open in opens {
            let _ = open
                .tx
                .send(Err(Error::Indeterminate(format!(
                    "connection closed while opening channel for {}",
                    open.service
                ))));
        }

        if notify_peer && self.writer.try_send(&Frame::ConnectionClose).is_err() {
            tracing::debug!("connection-close notification not sent");
        }

        if let Some(on_remove) = self.on_remove.lock().expect("remove lock").take() {
            on_remove();
        }
        self.guard.lock().expect("guard lock").take();
        self.shutdown_notify.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // -- post-authentication frame dispatch --------------------------------

    /// Handle one frame. An `Err` return is connection-fatal.
    fn handle_frame(self: &Arc<Self>, frame: Frame) -> Result<()> {
        match frame {
            Frame::MessageData {
                channel_id,
                message_id,
                flags,
                payload,
            } => {
                let channel = self.lookup_channel(channel_id);
                match channel {
                    Some(ch) => ch.handle_data(message_id, flags, payload)?,
                    None => tracing::debug!(channel_id, "data for unknown channel dropped"),
                }
            }
            Frame::MessageWindowOpen {
                channel_id,
                message_id,
                consumed,
            } => {
                if let Some(ch) = self.lookup_channel(channel_id) {
                    ch.handle_window_open(message_id, consumed);
                }
            }
            Frame::MessageAsyncClose {
                channel_id,
                message_id,
            } => {
                if let Some(ch) = self.lookup_channel(channel_id) {
                    ch.handle_async_close(message_id);
                }
            }
            Frame::ChannelOpenRequest {
                channel_id,
                service,
                inbound_window,
                outbound_window,
                inbound_messages,
                outbound_messages,
            } => self.handle_open_request(
                channel_id,
                service,
                inbound_window,
                outbound_window,
                inbound_messages,
                outbound_messages,
            )?,
            Frame::ChannelOpenAck {
                channel_id,
                inbound_window,
                outbound_window,
                inbound_messages,
                outbound_messages,
            } => {
                let pending = self
                    .pending_opens
                    .lock()
                    .expect("pending lock")
                    .remove(&channel_id);
                match pending {
                    Some(open) => {
                        // Ack fields are from the acceptor's perspective;
                        // flip them into ours.
                        let windows = NegotiatedWindows {
                            inbound_window: outbound_window,
                            outbound_window: inbound_window,
                            max_inbound_messages: outbound_messages,
                            max_outbound_messages: inbound_messages,
                        };
                        let shared =
                            self.make_channel(channel_id, open.service, true, windows);
                        self.channels
                            .lock()
                            .expect("channels lock")
                            .insert(channel_id, shared.clone());
                        let _ = open.tx.send(Ok(channel_from_shared(shared)));
                    }
                    None => {
                        return Err(Error::Protocol(format!(
                            "channel-open-ack for unknown channel {channel_id:#010x}"
                        )))
                    }
                }
            }
            Frame::ChannelOpenRefuse { channel_id, reason } => {
                let pending = self
                    .pending_opens
                    .lock()
                    .expect("pending lock")
                    .remove(&channel_id);
                match pending {
                    Some(open) => {
                        let _ = open.tx.send(Err(Error::Refused(reason)));
                    }
                    None => {
                        return Err(Error::Protocol(format!(
                            "channel-open-refuse for unknown channel {channel_id:#010x}"
                        )))
                    }
                }
            }
            Frame::ChannelClosed { channel_id } => {
                let channel = {
                    let mut map = self.channels.lock().expect("channels lock");
                    map.remove(&channel_id)
                };
                match channel {
                    Some(ch) => ch.handle_remote_closed(),
                    // May be a release for an id already freed locally.
                    None => tracing::debug!(channel_id, "close for unknown channel ignored"),
                }
            }
            Frame::ConnectionAlive => {
                self.alive_seen.fetch_add(1, Ordering::Relaxed);
            }
            Frame::ConnectionClose => {
                self.shutdown("closed by peer", false);
            }
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected {} frame after authentication",
                    other.kind()
                )))
            }
        }
        Ok(())
    }

    fn lookup_channel(&self, channel_id: u32) -> Option<Arc<ChannelShared>> {
        self.channels
            .lock()
            .expect("channels lock")
            .get(&channel_id)
            .cloned()
    }

    fn refuse(&self, channel_id: u32, reason: &str) {
        let frame = Frame::ChannelOpenRefuse {
            channel_id,
            reason: reason.to_string(),
        };
        if self.writer.try_send(&frame).is_err() {
            tracing::debug!(channel_id, "channel refusal not sent");
        }
    }

    fn handle_open_request(
        self: &Arc<Self>,
        channel_id: u32,
        service: String,
        inbound_window: u32,
        outbound_window: u32,
        inbound_messages: u16,
        outbound_messages: u16,
    ) -> Result<()> {
        // Both peers never legitimately reuse a live id: force-close the
        // stale channel and admit the new open.
        let stale = {
            let mut map = self.channels.lock().expect("channels lock");
            map.remove(&channel_id)
        };
        if let Some(stale) = stale {
            tracing::warn!(
                channel_id,
                service = %stale.service,
                "duplicate channel id on open; force-closing stale channel"
            );
            stale.fail_all("superseded by duplicate channel open");
            stale.finish_close(false);
        }

        if self.is_closed() {
            self.refuse(channel_id, "endpoint shutting down");
            return Ok(());
        }
        let listener = match self.services.lookup(&service) {
            Some(listener) => listener,
            None => {
                tracing::debug!(channel_id, service = %service, "open for unregistered service");
                self.refuse(channel_id, &format!("no such service: {service}"));
                return Ok(());
            }
        };

        let windows = NegotiatedWindows::accept(
            inbound_window,
            outbound_window,
            inbound_messages,
            outbound_messages,
            &self.config.channel,
        );
        let shared = self.make_channel(channel_id, service, false, windows);
        self.channels
            .lock()
            .expect("channels lock")
            .insert(channel_id, shared.clone());

        let ack = Frame::ChannelOpenAck {
            channel_id,
            inbound_window: windows.inbound_window,
            outbound_window: windows.outbound_window,
            inbound_messages: windows.max_inbound_messages,
            outbound_messages: windows.max_outbound_messages,
        };
        if let Err(e) = self.writer.try_send(&ack) {
            return Err(Error::Protocol(format!(
                "could not acknowledge channel open: {e}"
            )));
        }

        // Service setup runs off the read path; a slow open listener never
        // blocks other channels.
        let channel = channel_from_shared(shared);
        tokio::spawn(async move {
            listener.channel_opened(channel);
        });
        Ok(())
    }
}

/// An authenticated connection between two peers.
///
/// Cheaply cloneable handle; the connection itself lives until it fails,
/// the peer disconnects, or [`close`](Self::close) is called.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<ConnectionShared>,
}

impl Connection {
    /// This side's role.
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Authenticated authorization id of the peer (acceptor side) or the
    /// id this side authenticated as (initiator side).
    pub fn principal(&self) -> &str {
        &self.shared.session.principal
    }

    /// Mechanism that authenticated the connection.
    pub fn mechanism(&self) -> &str {
        &self.shared.session.mechanism
    }

    /// Negotiated protocol version.
    pub fn protocol_version(&self) -> u8 {
        self.shared.session.version
    }

    /// Name the peer advertised in its greeting, if any.
    pub fn peer_name(&self) -> Option<&str> {
        self.shared.session.peer_name.as_deref()
    }

    /// Security layer in effect.
    pub fn security(&self) -> SecurityLayer {
        self.shared.session.security
    }

    /// Whether the connection has closed.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Heartbeats received from the peer.
    pub fn heartbeats_seen(&self) -> u64 {
        self.shared.alive_seen.load(Ordering::Relaxed)
    }

    /// Frames queued on the writer and not yet flushed.
    pub fn pending_frames(&self) -> usize {
        self.shared.writer.pending_count()
    }

    /// Open a channel for a named service.
    ///
    /// Resolves when the peer acknowledges (with negotiated window sizes)
    /// or refuses. Concurrent opens proceed independently; no ordering is
    /// guaranteed between them.
    pub async fn open_channel(
        &self,
        service: impl Into<String>,
        options: ChannelOptions,
    ) -> Result<Channel> {
        let service = service.into();
        if self.shared.is_closed() {
            return Err(Error::Closed);
        }
        let id = self.shared.allocate_channel_id();
        let (tx, rx) = oneshot::channel();
        self.shared.pending_opens.lock().expect("pending lock").insert(
            id,
            PendingOpen {
                service: service.clone(),
                tx,
            },
        );

        let request = Frame::ChannelOpenRequest {
            channel_id: id,
            service,
            inbound_window: options.inbound_window,
            outbound_window: options.outbound_window,
            inbound_messages: options.max_inbound_messages,
            outbound_messages: options.max_outbound_messages,
        };
        if let Err(e) = self.shared.writer.send(&request).await {
            self.shared.pending_opens.lock().expect("pending lock").remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Indeterminate(
                "connection closed while opening channel".into(),
            )),
        }
    }

    /// Close the connection: notify the peer, fail outstanding work as
    /// indeterminate, and quiesce the connection's tasks.
    pub async fn close(&self) {
        self.shared.shutdown("closed locally", true);
        // Let the writer drain the close notification.
        tokio::task::yield_now().await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.shared.role)
            .field("principal", &self.shared.session.principal)
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}

/// Assemble a connection from a completed negotiation and spawn its tasks.
pub(crate) fn start_connection(
    role: Role,
    session: NegotiatedSession,
    config: Arc<EndpointConfig>,
    services: ServiceRegistry,
    writer: WriterHandle,
    reader: ReadHalf<BoxedTransport>,
    buffer: FrameBuffer,
    leftover: Vec<Frame>,
    guard: ResourceGuard,
    on_remove: Box<dyn FnOnce() + Send>,
) -> Connection {
    let shared = Arc::new(ConnectionShared {
        role,
        session,
        config,
        services,
        writer,
        channels: Mutex::new(HashMap::new()),
        pending_opens: Mutex::new(HashMap::new()),
        next_channel_id: AtomicU32::new(1),
        closed: AtomicBool::new(false),
        shutdown_notify: Notify::new(),
        alive_seen: AtomicU64::new(0),
        guard: Mutex::new(Some(guard)),
        on_remove: Mutex::new(Some(on_remove)),
    });

    tokio::spawn(read_loop(shared.clone(), reader, buffer, leftover));
    tokio::spawn(heartbeat_loop(shared.clone()));

    Connection { shared }
}

async fn read_loop(
    shared: Arc<ConnectionShared>,
    mut reader: ReadHalf<BoxedTransport>,
    mut buffer: FrameBuffer,
    leftover: Vec<Frame>,
) {
    let result = async {
        // Frames that arrived piggybacked on the tail of negotiation.
        for frame in leftover {
            shared.handle_frame(frame)?;
        }
        let mut read_buf = vec![0u8; 64 * 1024];
        loop {
            if shared.is_closed() {
                return Ok(());
            }
            let n = tokio::select! {
                read = reader.read(&mut read_buf) => read?,
                _ = shared.shutdown_notify.notified() => return Ok(()),
            };
            if n == 0 {
                // EOF without connection-close: the peer vanished.
                return Err(Error::Indeterminate("peer disconnected".into()));
            }
            for frame in buffer.push(&read_buf[..n])? {
                shared.handle_frame(frame)?;
            }
        }
    }
    .await;

    match result {
        Ok(()) => shared.shutdown("connection closed", false),
        Err(e) => {
            let fatal = e.is_fatal();
            if fatal {
                tracing::error!(error = %e, "connection failed");
            } else {
                tracing::debug!(error = %e, "connection ended");
            }
            // A protocol violation notifies the peer before closing.
            shared.shutdown(&e.to_string(), fatal);
        }
    }
}

async fn heartbeat_loop(shared: Arc<ConnectionShared>) {
    let mut interval = tokio::time::interval(shared.config.heartbeat_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The immediate first tick is not a heartbeat.
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if shared.is_closed() {
                    return;
                }
                if shared.writer.try_send(&Frame::ConnectionAlive).is_err() {
                    tracing::trace!("heartbeat skipped, writer saturated or gone");
                }
            }
            _ = shared.shutdown_notify.notified() => return,
        }
    }
}
