//! Dedicated writer task for frame sending.
//!
//! One task per connection receives encoded frames via an mpsc channel and
//! writes them to the transport. This keeps protocol I/O off handler tasks
//! and enables batching multiple frames into single syscalls.
//!
//! # Architecture
//!
//! ```text
//! Channel A ─┐
//! Channel B ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► Transport
//! RPC, ...  ─┘
//! ```
//!
//! Backpressure is a pending-frame gauge shared with every handle; senders
//! wait (bounded by a timeout) when the queue is saturated.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::protocol::Frame;

/// Default maximum pending frames before backpressure kicks in.
pub(crate) const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub(crate) const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub(crate) const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// An encoded frame ready to be written to the transport.
///
/// Split into prefix (length word + type + fixed fields) and payload so a
/// large `MessageData` payload is never re-copied into the prefix buffer.
#[derive(Debug)]
pub(crate) struct OutboundFrame {
    prefix: Bytes,
    payload: Bytes,
}

impl OutboundFrame {
    /// Encode a frame for transmission.
    pub fn new(frame: &Frame) -> Self {
        let (prefix, payload) = frame.encode_parts();
        Self { prefix, payload }
    }

    /// Total size of this frame on the wire.
    #[inline]
    pub fn size(&self) -> usize {
        self.prefix.len() + self.payload.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub(crate) struct WriterConfig {
    pub max_pending_frames: usize,
    pub channel_capacity: usize,
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Handle for sending frames to the writer task.
///
/// Cheaply cloneable; shared by every channel, message, and correlator on
/// the connection.
#[derive(Clone)]
pub(crate) struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    /// Send a frame, waiting out backpressure up to the configured timeout.
    pub async fn send(&self, frame: &Frame) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            self.wait_for_backpressure().await?;
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.send(OutboundFrame::new(frame)).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            Error::Closed
        })
    }

    /// Try to send without waiting. Used from `Drop` impls and other
    /// non-async paths; failure means the connection is going away anyway.
    pub fn try_send(&self, frame: &Frame) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            return Err(Error::Backpressure);
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.try_send(OutboundFrame::new(frame)).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::Release);
            match e {
                mpsc::error::TrySendError::Full(_) => Error::Backpressure,
                mpsc::error::TrySendError::Closed(_) => Error::Closed,
            }
        })
    }

    async fn wait_for_backpressure(&self) -> Result<()> {
        let start = Instant::now();
        let check_interval = Duration::from_micros(100);
        loop {
            if self.pending.load(Ordering::Acquire) < self.max_pending {
                return Ok(());
            }
            if start.elapsed() > self.timeout {
                return Err(Error::Backpressure);
            }
            tokio::time::sleep(check_interval).await;
        }
    }

    /// Current pending frame count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

/// Spawn the writer task and return a handle for sending frames.
pub(crate) fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle {
        tx,
        pending: pending.clone(),
        max_pending: config.max_pending_frames,
        timeout: config.backpressure_timeout,
    };

    let task = tokio::spawn(writer_loop(rx, writer, pending));

    (handle, task)
}

/// Main writer loop - receives frames and writes them to the transport.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(f) => f,
            None => return Ok(()), // all handles dropped, clean shutdown
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        write_batch(&mut writer, &batch).await?;
        pending.fetch_sub(batch_size, Ordering::Release);
    }
}

/// Write a batch of frames with scatter/gather I/O.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(batch.len() * 2);
    for frame in batch {
        slices.push(IoSlice::new(&frame.prefix));
        if !frame.payload.is_empty() {
            slices.push(IoSlice::new(&frame.payload));
        }
    }

    let total_size: usize = batch.iter().map(|f| f.size()).sum();

    let written = writer.write_vectored(&slices).await?;
    if written == total_size {
        writer.flush().await?;
        return Ok(());
    }
    if written == 0 {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            "write_vectored returned 0",
        )));
    }

    // Partial write: continue with the remainder.
    let mut total_written = written;
    while total_written < total_size {
        let remaining = build_remaining_slices(batch, total_written);
        if remaining.is_empty() {
            break;
        }
        let written = writer.write_vectored(&remaining).await?;
        if written == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build the IoSlice array for data remaining after a partial write.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut skipped = 0;

    for frame in batch {
        for part in [&frame.prefix, &frame.payload] {
            if part.is_empty() {
                continue;
            }
            let start = skipped;
            let end = skipped + part.len();
            if skip_bytes < end {
                let offset = skip_bytes.saturating_sub(start);
                slices.push(IoSlice::new(&part[offset..]));
            }
            skipped = end;
        }
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{msg_flags, FrameBuffer};
    use std::io::Cursor;
    use tokio::io::duplex;

    fn data_frame(payload: &'static [u8]) -> Frame {
        Frame::MessageData {
            channel_id: 1,
            message_id: 1,
            flags: msg_flags::NEW,
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn test_outbound_frame_size() {
        let frame = data_frame(b"hello");
        let outbound = OutboundFrame::new(&frame);
        assert_eq!(outbound.size(), frame.encode().len());
    }

    #[tokio::test]
    async fn test_send_and_reparse() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        let frame = data_frame(b"hello");
        handle.send(&frame).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut buf = vec![0u8; 256];
        let n = tokio::io::AsyncReadExt::read(&mut server, &mut buf)
            .await
            .unwrap();

        let mut parser = FrameBuffer::new();
        let frames = parser.push(&buf[..n]).unwrap();
        assert_eq!(frames, vec![frame]);
    }

    #[tokio::test]
    async fn test_batching_preserves_order() {
        let (client, mut server) = duplex(65536);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        for i in 0..10u32 {
            let frame = Frame::ChannelClosed { channel_id: i };
            handle.send(&frame).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut buf = vec![0u8; 4096];
        let n = tokio::io::AsyncReadExt::read(&mut server, &mut buf)
            .await
            .unwrap();

        let mut parser = FrameBuffer::new();
        let frames = parser.push(&buf[..n]).unwrap();
        assert_eq!(frames.len(), 10);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(
                frame,
                &Frame::ChannelClosed {
                    channel_id: i as u32
                }
            );
        }
    }

    #[tokio::test]
    async fn test_try_send_at_capacity() {
        let (tx, _rx) = mpsc::channel(10);
        let handle = WriterHandle {
            tx,
            pending: Arc::new(AtomicUsize::new(100)),
            max_pending: 100,
            timeout: Duration::from_secs(1),
        };

        assert!(matches!(
            handle.try_send(&Frame::ConnectionAlive),
            Err(Error::Backpressure)
        ));
    }

    #[tokio::test]
    async fn test_write_batch_mixed_payloads() {
        let mut buf = Cursor::new(Vec::new());
        let batch = vec![
            OutboundFrame::new(&Frame::ConnectionAlive),
            OutboundFrame::new(&data_frame(b"payload")),
            OutboundFrame::new(&Frame::ConnectionClose),
        ];
        let expected: usize = batch.iter().map(|f| f.size()).sum();

        write_batch(&mut buf, &batch).await.unwrap();
        assert_eq!(buf.into_inner().len(), expected);
    }

    #[test]
    fn test_build_remaining_slices_partial_prefix() {
        let batch = vec![OutboundFrame::new(&data_frame(b"hello"))];
        let prefix_len = batch[0].prefix.len();

        let slices = build_remaining_slices(&batch, 3);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), prefix_len - 3);
        assert_eq!(slices[1].len(), 5);

        let slices = build_remaining_slices(&batch, prefix_len);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].len(), 5);
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_handle_drop() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());
        drop(handle);
        assert!(task.await.unwrap().is_ok());
    }
}
