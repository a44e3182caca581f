//! Request/reply invocation semantics over channel messages.
//!
//! Invocations ride inside messages as `[kind:1][correlation_id:u32][body]`
//! with kinds request / reply / failure / indeterminate / cancel /
//! cancel-ack, decoded once into [`InvocationFrame`]. The correlator maps
//! outbound requests to pending resolution slots and inbound requests to a
//! handler, enforcing exactly one terminal outcome per request in both
//! directions.
//!
//! Local dispatch ([`local_invoker`]) runs a handler in-process without
//! wire framing under the identical single-outcome and cancellation
//! contract, so application code is transport-agnostic.

mod context;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::sync::{oneshot, watch};

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::protocol::wire;

pub use context::{CancellationObserver, RequestContext};
pub(crate) use context::OutcomeSink;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Handler for inbound invocations.
///
/// The handler must eventually invoke exactly one terminal action on the
/// context; returning an error counts as a failure outcome, and returning
/// without resolving (once every clone of the context is gone) resolves
/// the request as indeterminate automatically.
pub trait InvocationHandler: Send + Sync + 'static {
    /// Handle one request.
    fn handle(&self, payload: Bytes, ctx: RequestContext) -> BoxFuture<'static, Result<()>>;
}

/// Wrap an async closure as an [`InvocationHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn InvocationHandler>
where
    F: Fn(Bytes, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    struct FnHandler<F>(F);
    impl<F, Fut> InvocationHandler for FnHandler<F>
    where
        F: Fn(Bytes, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        fn handle(&self, payload: Bytes, ctx: RequestContext) -> BoxFuture<'static, Result<()>> {
            Box::pin((self.0)(payload, ctx))
        }
    }
    Arc::new(FnHandler(f))
}

// ---------------------------------------------------------------------------
// Invocation wire frames (carried as message payloads)
// ---------------------------------------------------------------------------

mod invocation_kind {
    pub const REQUEST: u8 = 0x01;
    pub const REPLY: u8 = 0x02;
    pub const FAILURE: u8 = 0x03;
    pub const INDETERMINATE: u8 = 0x04;
    pub const CANCEL: u8 = 0x05;
    pub const CANCEL_ACK: u8 = 0x06;
}

/// One invocation-layer frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InvocationFrame {
    Request { id: u32, payload: Bytes },
    Reply { id: u32, payload: Bytes },
    Failure { id: u32, message: String, cause: String },
    Indeterminate { id: u32, message: String },
    Cancel { id: u32 },
    CancelAck { id: u32 },
}

impl InvocationFrame {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        match self {
            InvocationFrame::Request { id, payload } => {
                buf.put_u8(invocation_kind::REQUEST);
                buf.put_u32(*id);
                buf.put_slice(payload);
            }
            InvocationFrame::Reply { id, payload } => {
                buf.put_u8(invocation_kind::REPLY);
                buf.put_u32(*id);
                buf.put_slice(payload);
            }
            InvocationFrame::Failure { id, message, cause } => {
                buf.put_u8(invocation_kind::FAILURE);
                buf.put_u32(*id);
                wire::put_string(&mut buf, message);
                wire::put_string(&mut buf, cause);
            }
            InvocationFrame::Indeterminate { id, message } => {
                buf.put_u8(invocation_kind::INDETERMINATE);
                buf.put_u32(*id);
                wire::put_string(&mut buf, message);
            }
            InvocationFrame::Cancel { id } => {
                buf.put_u8(invocation_kind::CANCEL);
                buf.put_u32(*id);
            }
            InvocationFrame::CancelAck { id } => {
                buf.put_u8(invocation_kind::CANCEL_ACK);
                buf.put_u32(*id);
            }
        }
        buf.freeze()
    }

    pub fn decode(mut body: Bytes) -> Result<Self> {
        let kind = wire::get_u8(&mut body, "invocation kind")?;
        let id = wire::get_u32(&mut body, "correlation id")?;
        Ok(match kind {
            invocation_kind::REQUEST => InvocationFrame::Request { id, payload: body },
            invocation_kind::REPLY => InvocationFrame::Reply { id, payload: body },
            invocation_kind::FAILURE => {
                let message = wire::get_string(&mut body, "failure message")?;
                let cause = wire::get_string(&mut body, "failure cause")?;
                InvocationFrame::Failure { id, message, cause }
            }
            invocation_kind::INDETERMINATE => {
                let message = wire::get_string(&mut body, "indeterminate message")?;
                InvocationFrame::Indeterminate { id, message }
            }
            invocation_kind::CANCEL => {
                if body.has_remaining() {
                    return Err(Error::Protocol("trailing bytes after cancel".into()));
                }
                InvocationFrame::Cancel { id }
            }
            invocation_kind::CANCEL_ACK => {
                if body.has_remaining() {
                    return Err(Error::Protocol("trailing bytes after cancel-ack".into()));
                }
                InvocationFrame::CancelAck { id }
            }
            other => {
                return Err(Error::Protocol(format!(
                    "unknown invocation kind {other:#04x}"
                )))
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Pending-request table
// ---------------------------------------------------------------------------

struct PendingEntry {
    tx: oneshot::Sender<Result<Bytes>>,
    cancel_requested: bool,
}

/// Table of outstanding invocations awaiting exactly one outcome.
pub(crate) struct Correlator {
    next_id: AtomicU32,
    pending: Mutex<HashMap<u32, PendingEntry>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a correlation id and register its resolution slot.
    pub fn allocate(&self) -> (u32, oneshot::Receiver<Result<Bytes>>) {
        let mut pending = self.pending.lock().expect("pending lock");
        loop {
            let id = self.next_id.fetch_add(1, Ordering::AcqRel);
            if id == 0 || pending.contains_key(&id) {
                continue;
            }
            let (tx, rx) = oneshot::channel();
            pending.insert(
                id,
                PendingEntry {
                    tx,
                    cancel_requested: false,
                },
            );
            return (id, rx);
        }
    }

    /// Deliver the terminal outcome for `id`.
    ///
    /// The first outcome wins; later attempts find the slot gone and are
    /// reported as `false` (callers log and move on).
    pub fn resolve(&self, id: u32, outcome: Result<Bytes>) -> bool {
        let entry = self.pending.lock().expect("pending lock").remove(&id);
        match entry {
            Some(entry) => {
                // The caller may have abandoned the receiver; either way
                // the outcome is consumed.
                let _ = entry.tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Flag an entry as cancel-requested. Returns false when the request
    /// has already resolved. Does not itself resolve anything.
    pub fn mark_cancel_requested(&self, id: u32) -> bool {
        let mut pending = self.pending.lock().expect("pending lock");
        match pending.get_mut(&id) {
            Some(entry) => {
                let first = !entry.cancel_requested;
                entry.cancel_requested = true;
                first
            }
            None => false,
        }
    }

    /// Resolve every outstanding request as indeterminate (connection
    /// loss, shutdown).
    pub fn fail_all(&self, reason: &str) {
        let entries: Vec<PendingEntry> = {
            let mut pending = self.pending.lock().expect("pending lock");
            pending.drain().map(|(_, v)| v).collect()
        };
        for entry in entries {
            let _ = entry.tx.send(Err(Error::Indeterminate(reason.to_string())));
        }
    }

    pub fn outstanding(&self) -> usize {
        self.pending.lock().expect("pending lock").len()
    }
}

// ---------------------------------------------------------------------------
// Pending call handle
// ---------------------------------------------------------------------------

/// Handle to one outstanding invocation.
///
/// Await [`outcome`](Self::outcome) for the terminal result. Dropping the
/// handle (or the `outcome` future) before resolution requests best-effort
/// cancellation; the outcome is then indeterminate from this caller's
/// point of view.
pub struct PendingCall {
    id: u32,
    rx: Option<oneshot::Receiver<Result<Bytes>>>,
    cancel_on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl PendingCall {
    /// Correlation id of this invocation.
    pub fn correlation_id(&self) -> u32 {
        self.id
    }

    /// Wait for the terminal outcome: the reply payload, a typed remote
    /// failure, a cancellation acknowledgement ([`Error::Cancelled`]), or
    /// an indeterminate-outcome failure on connection loss.
    pub async fn outcome(mut self) -> Result<Bytes> {
        let rx = self.rx.take().expect("outcome awaited once");
        let result = match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Indeterminate("connection closed".into())),
        };
        self.cancel_on_drop = None;
        result
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel_on_drop.take() {
            cancel();
        }
    }
}

// ---------------------------------------------------------------------------
// Wire client
// ---------------------------------------------------------------------------

struct ClientShared {
    channel: Channel,
    correlator: Correlator,
}

impl ClientShared {
    async fn transmit(&self, frame: &InvocationFrame) -> Result<()> {
        let mut writer = self.channel.send_message().await?;
        writer.write_bytes(frame.encode()).await?;
        writer.finish().await
    }
}

/// Invocation client bound to one channel.
///
/// Cheaply cloneable; invocations multiplex over the channel's messages.
#[derive(Clone)]
pub struct InvocationClient {
    inner: Arc<ClientShared>,
}

impl InvocationClient {
    /// Bind a client to a channel and spawn its reply dispatcher.
    pub fn new(channel: Channel) -> Self {
        let inner = Arc::new(ClientShared {
            channel,
            correlator: Correlator::new(),
        });
        tokio::spawn(reply_loop(inner.clone()));
        Self { inner }
    }

    /// Send a request and return a handle to its pending outcome.
    pub async fn call(&self, payload: Bytes) -> Result<PendingCall> {
        let (id, rx) = self.inner.correlator.allocate();
        let frame = InvocationFrame::Request { id, payload };
        if let Err(e) = self.inner.transmit(&frame).await {
            self.inner.correlator.resolve(id, Err(Error::Closed));
            // Drain our own just-failed slot.
            let _ = rx;
            return Err(e);
        }
        let cancel_inner = self.inner.clone();
        Ok(PendingCall {
            id,
            rx: Some(rx),
            cancel_on_drop: Some(Box::new(move || {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        let _ = try_cancel_inner(&cancel_inner, id).await;
                    });
                }
            })),
        })
    }

    /// Send a request and wait for its outcome.
    pub async fn invoke(&self, payload: Bytes) -> Result<Bytes> {
        self.call(payload).await?.outcome().await
    }

    /// Request cancellation of an outstanding invocation.
    ///
    /// Best effort: sends a cancel frame but does not resolve the pending
    /// request. The remote side answers with a cancellation
    /// acknowledgement or with a normal reply/failure, whichever it
    /// reaches first.
    pub async fn try_cancel(&self, correlation_id: u32) -> Result<()> {
        try_cancel_inner(&self.inner, correlation_id).await
    }

    /// Number of invocations awaiting an outcome.
    pub fn outstanding(&self) -> usize {
        self.inner.correlator.outstanding()
    }
}

async fn try_cancel_inner(inner: &Arc<ClientShared>, id: u32) -> Result<()> {
    if !inner.correlator.mark_cancel_requested(id) {
        // Already resolved or already cancel-requested; nothing to send.
        return Ok(());
    }
    inner.transmit(&InvocationFrame::Cancel { id }).await
}

/// Dispatch replies, failures, and cancel-acks to pending slots.
async fn reply_loop(inner: Arc<ClientShared>) {
    loop {
        let mut message = match inner.channel.next_message().await {
            Ok(m) => m,
            Err(_) => break,
        };
        let body = match message.read_to_end().await {
            Ok(body) => Bytes::from(body),
            Err(Error::MessageCancelled) => continue,
            Err(_) => break,
        };
        let frame = match InvocationFrame::decode(body) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(channel_id = inner.channel.id(), error = %e, "bad invocation frame");
                continue;
            }
        };
        let (id, outcome) = match frame {
            InvocationFrame::Reply { id, payload } => (id, Ok(payload)),
            InvocationFrame::Failure { id, message, cause } => {
                let text = if cause.is_empty() {
                    message
                } else {
                    format!("{message}: {cause}")
                };
                (id, Err(Error::Remote(text)))
            }
            InvocationFrame::Indeterminate { id, message } => {
                (id, Err(Error::Indeterminate(message)))
            }
            InvocationFrame::CancelAck { id } => (id, Err(Error::Cancelled)),
            other => {
                tracing::warn!(
                    channel_id = inner.channel.id(),
                    frame = ?other,
                    "unexpected invocation frame on client channel"
                );
                continue;
            }
        };
        if !inner.correlator.resolve(id, outcome) {
            // Lost the cancel/reply race; the first outcome already won.
            tracing::trace!(correlation_id = id, "duplicate outcome ignored");
        }
    }
    inner.correlator.fail_all("connection closed");
}

// ---------------------------------------------------------------------------
// Server dispatch
// ---------------------------------------------------------------------------

/// Serve inbound invocations on a channel until it closes.
///
/// Each request runs on its own task; slow handlers never block the
/// channel's dispatch. Cancellation frames are broadcast to the matching
/// request's observers.
pub async fn serve(channel: Channel, handler: Arc<dyn InvocationHandler>) -> Result<()> {
    let inflight: Arc<Mutex<HashMap<u32, watch::Sender<bool>>>> =
        Arc::new(Mutex::new(HashMap::new()));

    loop {
        let mut message = match channel.next_message().await {
            Ok(m) => m,
            Err(_) => break,
        };
        let body = match message.read_to_end().await {
            Ok(body) => Bytes::from(body),
            Err(Error::MessageCancelled) => continue,
            Err(_) => break,
        };
        let frame = match InvocationFrame::decode(body) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(channel_id = channel.id(), error = %e, "bad invocation frame");
                continue;
            }
        };
        match frame {
            InvocationFrame::Request { id, payload } => {
                let (cancel_tx, cancel_rx) = watch::channel(false);
                inflight.lock().expect("inflight lock").insert(id, cancel_tx);

                let ctx = RequestContext::new(
                    id,
                    OutcomeSink::Wire {
                        channel: channel.clone(),
                    },
                    cancel_rx,
                    {
                        let inflight = inflight.clone();
                        Box::new(move || {
                            inflight.lock().expect("inflight lock").remove(&id);
                        })
                    },
                );
                let handler = handler.clone();
                tokio::spawn(async move {
                    let result = handler.handle(payload, ctx.clone()).await;
                    if let Err(e) = result {
                        // A handler error is an application failure, not a
                        // transport problem; surface it to the caller if
                        // the handler did not already resolve.
                        match ctx.failure(e.to_string()).await {
                            Ok(()) | Err(Error::AlreadyResolved) => {}
                            Err(send_err) => tracing::debug!(
                                correlation_id = id,
                                error = %send_err,
                                "failed to deliver handler failure"
                            ),
                        }
                    }
                });
            }
            InvocationFrame::Cancel { id } => {
                let signalled = {
                    let inflight = inflight.lock().expect("inflight lock");
                    match inflight.get(&id) {
                        Some(tx) => tx.send(true).is_ok(),
                        None => false,
                    }
                };
                if !signalled {
                    // Request already resolved; the earlier outcome wins
                    // the race and this cancel is a no-op.
                    tracing::trace!(correlation_id = id, "cancel for resolved request ignored");
                }
            }
            other => {
                tracing::warn!(
                    channel_id = channel.id(),
                    frame = ?other,
                    "unexpected invocation frame on server channel"
                );
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Local dispatch
// ---------------------------------------------------------------------------

struct LocalShared {
    correlator: Arc<Correlator>,
    handler: Arc<dyn InvocationHandler>,
    inflight: Mutex<HashMap<u32, watch::Sender<bool>>>,
}

/// In-process invoker: requests dispatch straight to a handler with no
/// wire framing, under the same single-outcome and cancellation contract.
#[derive(Clone)]
pub struct LocalInvoker {
    inner: Arc<LocalShared>,
}

/// Create a [`LocalInvoker`] over `handler`.
pub fn local_invoker(handler: Arc<dyn InvocationHandler>) -> LocalInvoker {
    LocalInvoker {
        inner: Arc::new(LocalShared {
            correlator: Arc::new(Correlator::new()),
            handler,
            inflight: Mutex::new(HashMap::new()),
        }),
    }
}

impl LocalInvoker {
    /// Dispatch a request to the local handler.
    pub async fn call(&self, payload: Bytes) -> Result<PendingCall> {
        let (id, rx) = self.inner.correlator.allocate();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.inner
            .inflight
            .lock()
            .expect("inflight lock")
            .insert(id, cancel_tx);

        let ctx = RequestContext::new(
            id,
            OutcomeSink::Local {
                correlator: self.inner.correlator.clone(),
            },
            cancel_rx,
            {
                let inner = self.inner.clone();
                Box::new(move || {
                    inner.inflight.lock().expect("inflight lock").remove(&id);
                })
            },
        );
        let handler = self.inner.handler.clone();
        tokio::spawn(async move {
            if let Err(e) = handler.handle(payload, ctx.clone()).await {
                let _ = ctx.failure(e.to_string()).await;
            }
        });

        let cancel_inner = self.inner.clone();
        Ok(PendingCall {
            id,
            rx: Some(rx),
            cancel_on_drop: Some(Box::new(move || {
                cancel_inner.signal_cancel(id);
            })),
        })
    }

    /// Dispatch a request and wait for its outcome.
    pub async fn invoke(&self, payload: Bytes) -> Result<Bytes> {
        self.call(payload).await?.outcome().await
    }

    /// Request cancellation of an outstanding local invocation.
    pub fn try_cancel(&self, correlation_id: u32) {
        if self.inner.correlator.mark_cancel_requested(correlation_id) {
            self.inner.signal_cancel(correlation_id);
        }
    }
}

impl LocalShared {
    fn signal_cancel(&self, id: u32) {
        let inflight = self.inflight.lock().expect("inflight lock");
        if let Some(tx) = inflight.get(&id) {
            let _ = tx.send(true);
        }
    }
}
