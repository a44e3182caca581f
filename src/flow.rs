//! Credit-based flow control windows.
//!
//! Each in-flight message carries a byte window in each direction,
//! initialized from the channel's negotiated window size. Counters are
//! cumulative over the life of the message:
//!
//! - the sender tracks `sent` and `acked` (the peer's cumulative consumed
//!   count); available credit is `window - (sent - acked)`;
//! - the receiver tracks `received` and `consumed`; a fragment that pushes
//!   `received - consumed` past the window is a protocol violation.
//!
//! Grants carry the cumulative consumed count, so a duplicated or
//! reordered grant is idempotent: `fetch_max` ignores anything stale.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::Notify;

use crate::error::{Error, Result};

/// Sender-side view of the receiver's credit for one message.
pub(crate) struct OutboundWindow {
    window: u64,
    sent: AtomicU64,
    acked: AtomicU64,
    broken: AtomicBool,
    credit: Notify,
}

impl OutboundWindow {
    pub fn new(window: u32) -> Self {
        Self {
            window: u64::from(window),
            sent: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            broken: AtomicBool::new(false),
            credit: Notify::new(),
        }
    }

    /// Credit currently available to send.
    pub fn available(&self) -> u64 {
        let sent = self.sent.load(Ordering::Acquire);
        let acked = self.acked.load(Ordering::Acquire);
        self.window.saturating_sub(sent.saturating_sub(acked))
    }

    /// Reserve up to `want` bytes of credit, waiting while the window is
    /// exhausted. Returns the number of bytes reserved (at least 1).
    ///
    /// Fails with [`Error::MessageCancelled`] once the window is broken
    /// (receiver abandoned the message or the channel died).
    pub async fn acquire(&self, want: usize) -> Result<usize> {
        debug_assert!(want > 0);
        loop {
            if self.broken.load(Ordering::Acquire) {
                return Err(Error::MessageCancelled);
            }
            let notified = self.credit.notified();
            let available = self.available();
            if available > 0 {
                let take = (want as u64).min(available) as usize;
                self.sent.fetch_add(take as u64, Ordering::AcqRel);
                return Ok(take);
            }
            notified.await;
        }
    }

    /// Apply a cumulative grant from the peer. Stale values are ignored.
    pub fn grant(&self, consumed_cumulative: u64) {
        let prior = self.acked.fetch_max(consumed_cumulative, Ordering::AcqRel);
        if consumed_cumulative > prior {
            self.credit.notify_waiters();
        }
    }

    /// Break the window: unblock waiters with failure. Idempotent.
    pub fn brk(&self) {
        self.broken.store(true, Ordering::Release);
        self.credit.notify_waiters();
    }

    /// Whether the window has been broken.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }
}

/// Receiver-side accounting for one message.
pub(crate) struct InboundWindow {
    window: u64,
    received: AtomicU64,
    consumed: AtomicU64,
}

impl InboundWindow {
    pub fn new(window: u32) -> Self {
        Self {
            window: u64::from(window),
            received: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
        }
    }

    /// Account an arriving fragment. Fails when the peer exceeds its
    /// granted credit; the caller must treat that as connection-fatal.
    pub fn note_received(&self, len: usize, channel_id: u32) -> Result<()> {
        let received = self.received.fetch_add(len as u64, Ordering::AcqRel) + len as u64;
        let consumed = self.consumed.load(Ordering::Acquire);
        if received.saturating_sub(consumed) > self.window {
            return Err(Error::WindowOverrun { channel_id });
        }
        Ok(())
    }

    /// Account consumed bytes; returns the new cumulative count to carry
    /// in a grant frame.
    pub fn note_consumed(&self, len: usize) -> u64 {
        self.consumed.fetch_add(len as u64, Ordering::AcqRel) + len as u64
    }

    /// Cumulative consumed count without modifying it.
    pub fn consumed_cumulative(&self) -> u64 {
        self.consumed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_within_window() {
        let win = OutboundWindow::new(100);
        assert_eq!(win.acquire(40).await.unwrap(), 40);
        assert_eq!(win.acquire(100).await.unwrap(), 60);
        assert_eq!(win.available(), 0);
    }

    #[tokio::test]
    async fn test_acquire_blocks_until_grant() {
        let win = Arc::new(OutboundWindow::new(10));
        assert_eq!(win.acquire(10).await.unwrap(), 10);

        let w = win.clone();
        let waiter = tokio::spawn(async move { w.acquire(5).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        win.grant(4); // 4 bytes consumed -> 4 bytes of credit
        assert_eq!(waiter.await.unwrap().unwrap(), 4);
    }

    #[tokio::test]
    async fn test_never_exceeds_cumulative_credit() {
        // Property: for any interleaving of grants and sends, sent minus
        // acked never exceeds the window.
        let win = Arc::new(OutboundWindow::new(64));
        let mut consumed = 0u64;
        for round in 0..50 {
            let take = win.acquire(33).await.unwrap();
            let outstanding =
                win.sent.load(Ordering::SeqCst) - win.acked.load(Ordering::SeqCst);
            assert!(outstanding <= 64, "overrun at round {round}");
            consumed += take as u64;
            if round % 3 != 0 {
                win.grant(consumed);
            }
        }
    }

    #[tokio::test]
    async fn test_duplicate_grant_is_idempotent() {
        let win = OutboundWindow::new(100);
        assert_eq!(win.acquire(100).await.unwrap(), 100);

        win.grant(30);
        assert_eq!(win.available(), 30);
        // Same and lower cumulative values change nothing.
        win.grant(30);
        assert_eq!(win.available(), 30);
        win.grant(10);
        assert_eq!(win.available(), 30);
        win.grant(45);
        assert_eq!(win.available(), 45);
    }

    #[tokio::test]
    async fn test_break_unblocks_waiter() {
        let win = Arc::new(OutboundWindow::new(1));
        assert_eq!(win.acquire(1).await.unwrap(), 1);

        let w = win.clone();
        let waiter = tokio::spawn(async move { w.acquire(1).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        win.brk();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(Error::MessageCancelled)
        ));
    }

    #[test]
    fn test_inbound_overrun_detected() {
        let win = InboundWindow::new(10);
        assert!(win.note_received(10, 5).is_ok());
        assert!(matches!(
            win.note_received(1, 5),
            Err(Error::WindowOverrun { channel_id: 5 })
        ));
    }

    #[test]
    fn test_inbound_consumption_restores_headroom() {
        let win = InboundWindow::new(10);
        win.note_received(10, 1).unwrap();
        assert_eq!(win.note_consumed(6), 6);
        assert!(win.note_received(6, 1).is_ok());
        assert!(win.note_received(1, 1).is_err());
    }
}
