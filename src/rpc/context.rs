//! Inbound request context with single-outcome enforcement.
//!
//! A handler resolves its request through exactly one of three terminal
//! actions: [`reply`](RequestContext::reply),
//! [`failure`](RequestContext::failure), or
//! [`cancel_ack`](RequestContext::cancel_ack). The runtime enforces this:
//! the second terminal action fails with [`Error::AlreadyResolved`], and
//! if every clone of the context is dropped with none invoked, an
//! indeterminate-outcome failure is sent to the caller automatically so
//! the invocation is never left hanging.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::watch;

use crate::channel::Channel;
use crate::error::{Error, Result};

use super::{Correlator, InvocationFrame};

/// Where a terminal outcome goes.
pub(crate) enum OutcomeSink {
    /// Encode and transmit over the request's channel.
    Wire { channel: Channel },
    /// Resolve a local correlator slot directly.
    Local { correlator: Arc<Correlator> },
}

impl OutcomeSink {
    async fn deliver(self, frame: InvocationFrame) -> Result<()> {
        match self {
            OutcomeSink::Wire { channel } => {
                let mut writer = channel.send_message().await?;
                writer.write_bytes(frame.encode()).await?;
                writer.finish().await
            }
            OutcomeSink::Local { correlator } => {
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
                        debug_assert!(false, "non-terminal frame {other:?} in sink");
                        return Ok(());
                    }
                };
                correlator.resolve(id, outcome);
                Ok(())
            }
        }
    }
}

struct ContextInner {
    correlation_id: u32,
    sink: Mutex<Option<OutcomeSink>>,
    cancel_rx: watch::Receiver<bool>,
    on_terminal: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ContextInner {
    fn take_sink(&self) -> Result<OutcomeSink> {
        self.sink
            .lock()
            .expect("sink lock")
            .take()
            .ok_or(Error::AlreadyResolved)
    }

    fn run_terminal_hook(&self) {
        if let Some(hook) = self.on_terminal.lock().expect("hook lock").take() {
            hook();
        }
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        let sink = self.sink.lock().expect("sink lock").take();
        let Some(sink) = sink else {
            return;
        };
        // Handler finished (and all derived tasks with it) without a
        // terminal action: resolve indeterminate rather than hanging the
        // caller.
        tracing::debug!(
            correlation_id = self.correlation_id,
            "request dropped unresolved; sending indeterminate outcome"
        );
        let frame = InvocationFrame::Indeterminate {
            id: self.correlation_id,
            message: "request handler completed without resolving".into(),
        };
        if let Some(hook) = self.on_terminal.lock().expect("hook lock").take() {
            hook();
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = sink.deliver(frame).await;
            });
        }
    }
}

/// Context for one inbound request.
///
/// Cloneable; clones share the single-outcome slot, so handing the
/// context to a derived task keeps the request unresolved until that task
/// finishes or resolves it.
#[derive(Clone)]
pub struct RequestContext {
    inner: Arc<ContextInner>,
}

impl RequestContext {
    pub(crate) fn new(
        correlation_id: u32,
        sink: OutcomeSink,
        cancel_rx: watch::Receiver<bool>,
        on_terminal: Box<dyn FnOnce() + Send>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                correlation_id,
                sink: Mutex::new(Some(sink)),
                cancel_rx,
                on_terminal: Mutex::new(Some(on_terminal)),
            }),
        }
    }

    /// Correlation id of the request being handled.
    pub fn correlation_id(&self) -> u32 {
        self.inner.correlation_id
    }

    async fn finish(&self, frame: InvocationFrame) -> Result<()> {
        let sink = self.inner.take_sink()?;
        self.inner.run_terminal_hook();
        sink.deliver(frame).await
    }

    /// Terminal action: send the reply payload.
    pub async fn reply(&self, payload: Bytes) -> Result<()> {
        self.finish(InvocationFrame::Reply {
            id: self.inner.correlation_id,
            payload,
        })
        .await
    }

    /// Terminal action: send a typed failure.
    pub async fn failure(&self, message: impl Into<String>) -> Result<()> {
        self.finish(InvocationFrame::Failure {
            id: self.inner.correlation_id,
            message: message.into(),
            cause: String::new(),
        })
        .await
    }

    /// Terminal action: send a typed failure with a cause.
    pub async fn failure_with_cause(
        &self,
        message: impl Into<String>,
        cause: impl Into<String>,
    ) -> Result<()> {
        self.finish(InvocationFrame::Failure {
            id: self.inner.correlation_id,
            message: message.into(),
            cause: cause.into(),
        })
        .await
    }

    /// Terminal action: acknowledge a cancellation request.
    pub async fn cancel_ack(&self) -> Result<()> {
        self.finish(InvocationFrame::CancelAck {
            id: self.inner.correlation_id,
        })
        .await
    }

    /// Whether the caller has requested cancellation.
    ///
    /// Advisory: the handler decides how (and whether) to wind down; the
    /// runtime never terminates it forcibly.
    pub fn is_cancel_requested(&self) -> bool {
        *self.inner.cancel_rx.borrow()
    }

    /// An observer that resolves when cancellation is requested.
    pub fn cancellation(&self) -> CancellationObserver {
        CancellationObserver {
            rx: self.inner.cancel_rx.clone(),
        }
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("correlation_id", &self.inner.correlation_id)
            .field("cancel_requested", &self.is_cancel_requested())
            .finish()
    }
}

/// Waits for a cancellation request on one inbound invocation.
#[derive(Clone)]
pub struct CancellationObserver {
    rx: watch::Receiver<bool>,
}

impl CancellationObserver {
    /// Resolve once cancellation is requested. Returns immediately if it
    /// already was; never resolves if the request completes first.
    pub async fn cancelled(&mut self) {
        // wait_for returns Err only when the sender is gone, which means
        // the request resolved; park forever in that case.
        if self.rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}
