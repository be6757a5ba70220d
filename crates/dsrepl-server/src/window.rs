//! Credit-based flow-control window for one connection direction.
//!
//! The sender takes one credit per change record and blocks once none is
//! left; the receiver hands credit back after it has durably consumed the
//! records. Each connection owns its own window, so a peer that stops
//! returning credit only stalls its own feed.

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::csn::ServerId;
use crate::error::ReplError;

#[derive(Debug)]
struct WindowState {
    available: u32,
    closed: bool,
}

/// Flow-control window. Invariant: `0 <= available <= capacity`.
#[derive(Debug)]
pub struct FlowControlWindow {
    peer: ServerId,
    capacity: u32,
    state: Mutex<WindowState>,
    credit_returned: Notify,
}

impl FlowControlWindow {
    /// Create a full window of `capacity` credits towards `peer`.
    pub fn new(peer: ServerId, capacity: u32) -> Self {
        Self {
            peer,
            capacity,
            state: Mutex::new(WindowState {
                available: capacity,
                closed: false,
            }),
            credit_returned: Notify::new(),
        }
    }

    /// Take one credit without waiting.
    pub fn try_acquire(&self) -> Result<(), ReplError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ReplError::PeerUnreachable {
                server_id: self.peer,
                msg: "connection closed".to_string(),
            });
        }
        if state.available == 0 {
            return Err(ReplError::WindowExhausted);
        }
        state.available -= 1;
        Ok(())
    }

    /// Take one credit, waiting for the receiver to return some if needed.
    pub async fn acquire(&self) -> Result<(), ReplError> {
        loop {
            let notified = self.credit_returned.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self.try_acquire() {
                Err(ReplError::WindowExhausted) => notified.await,
                other => return other,
            }
        }
    }

    /// Give back `n` credits, clamped to capacity. Returns the credit applied.
    pub fn return_credit(&self, n: u32) -> u32 {
        let applied = {
            let mut state = self.state.lock();
            let applied = n.min(self.capacity - state.available);
            state.available += applied;
            applied
        };
        if applied > 0 {
            self.credit_returned.notify_waiters();
        }
        applied
    }

    /// Fail current and future acquires with `PeerUnreachable`.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.credit_returned.notify_waiters();
    }

    /// Credits currently available.
    pub fn available(&self) -> u32 {
        self.state.lock().available
    }

    /// Sends not yet covered by returned credit.
    pub fn in_flight(&self) -> u32 {
        self.capacity - self.available()
    }

    /// Configured window size.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// True once [`close`](FlowControlWindow::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_try_acquire_until_exhausted() {
        let window = FlowControlWindow::new(2, 3);
        for _ in 0..3 {
            window.try_acquire().unwrap();
        }
        assert!(matches!(window.try_acquire(), Err(ReplError::WindowExhausted)));
        assert_eq!(window.in_flight(), 3);
    }

    #[test]
    fn test_return_credit_round_trip() {
        let window = FlowControlWindow::new(2, 10);
        for _ in 0..7 {
            window.try_acquire().unwrap();
        }
        assert_eq!(window.return_credit(7), 7);
        assert_eq!(window.available(), window.capacity());
    }

    #[test]
    fn test_excess_credit_is_clamped() {
        let window = FlowControlWindow::new(2, 4);
        window.try_acquire().unwrap();
        assert_eq!(window.return_credit(100), 1);
        assert_eq!(window.available(), 4);
        assert_eq!(window.return_credit(1), 0);
    }

    #[tokio::test]
    async fn test_acquire_blocks_until_credit_returned() {
        let window = Arc::new(FlowControlWindow::new(2, 1));
        window.acquire().await.unwrap();

        let sender = Arc::clone(&window);
        let blocked = tokio::spawn(async move { sender.acquire().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        window.return_credit(1);
        blocked.await.unwrap().unwrap();
        assert_eq!(window.available(), 0);
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_sender() {
        let window = Arc::new(FlowControlWindow::new(9, 1));
        window.acquire().await.unwrap();

        let sender = Arc::clone(&window);
        let blocked = tokio::spawn(async move { sender.acquire().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        window.close();

        let err = blocked.await.unwrap().unwrap_err();
        assert!(matches!(err, ReplError::PeerUnreachable { server_id: 9, .. }));
        assert!(window.is_closed());
    }

    #[tokio::test]
    async fn test_windows_are_isolated() {
        let stuck = FlowControlWindow::new(1, 1);
        let healthy = FlowControlWindow::new(2, 1);
        stuck.acquire().await.unwrap();
        assert!(stuck.try_acquire().is_err());
        healthy.acquire().await.unwrap();
        healthy.return_credit(1);
        healthy.acquire().await.unwrap();
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let window = FlowControlWindow::new(1, 5);
        let mut sent = 0;
        for round in 0..50u32 {
            while window.try_acquire().is_ok() {
                sent += 1;
                assert!(window.in_flight() <= window.capacity());
            }
            window.return_credit(round % 3 + 1);
        }
        assert!(sent > 5);
        assert!(window.available() <= window.capacity());
    }
}
