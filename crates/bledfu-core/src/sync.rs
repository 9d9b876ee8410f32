//! Notification synchronizer.
//!
//! Turns control point notifications, delivered on the transport's own
//! thread, into a blocking wait for the upload sequence. A capture window is
//! opened by `arm()` before the write that triggers an acknowledgment and
//! stays open until every expected acknowledgment has been consumed by a
//! `wait()`. Notifications that arrive while no window is open are dropped.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, trace};

use crate::protocol::hex_string;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("No acknowledgment within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Wait cancelled")]
    Cancelled,

    #[error("wait() called without a preceding arm()")]
    NotArmed,

    #[error("arm() called while a wait is in progress")]
    AlreadyWaiting,

    #[error("arm() called with {outstanding} acknowledgment(s) still outstanding")]
    AlreadyArmed { outstanding: usize },
}

#[derive(Debug, Default)]
struct Slot {
    /// Acknowledgments still owed to the open capture window.
    expected: usize,
    waiting: bool,
    cancelled: bool,
    captured: VecDeque<Vec<u8>>,
    last_payload: Option<Vec<u8>>,
    total_received: u64,
}

/// Bridges the notification callback and the upload sequence.
#[derive(Debug, Default)]
pub struct NotificationSynchronizer {
    slot: Mutex<Slot>,
    signal: Condvar,
}

impl NotificationSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a capture window for a single acknowledgment.
    pub fn arm(&self) -> Result<(), SyncError> {
        self.arm_expecting(1)
    }

    /// Open a capture window that `expected` waits will drain.
    ///
    /// Fails if the previous window still owes acknowledgments; it must be
    /// drained or closed with `disarm()` first.
    pub fn arm_expecting(&self, expected: usize) -> Result<(), SyncError> {
        let mut slot = self.lock();
        if slot.waiting {
            return Err(SyncError::AlreadyWaiting);
        }
        if slot.expected > 0 {
            return Err(SyncError::AlreadyArmed {
                outstanding: slot.expected,
            });
        }
        slot.captured.clear();
        slot.expected = expected.max(1);
        Ok(())
    }

    /// Close the capture window, forgetting any outstanding acknowledgments.
    pub fn disarm(&self) {
        let mut slot = self.lock();
        slot.expected = 0;
        slot.captured.clear();
    }

    /// Acknowledgments the open window still expects.
    pub fn outstanding(&self) -> usize {
        self.lock().expected
    }

    /// Block until a notification captured since `arm()` is available.
    ///
    /// Returns the payload, which callers treat as opaque.
    pub fn wait(&self, timeout: Duration) -> Result<Vec<u8>, SyncError> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.lock();
        if slot.expected == 0 {
            return Err(SyncError::NotArmed);
        }
        slot.waiting = true;

        let result = loop {
            if slot.cancelled {
                break Err(SyncError::Cancelled);
            }
            if let Some(payload) = slot.captured.pop_front() {
                slot.expected -= 1;
                if slot.expected == 0 && !slot.captured.is_empty() {
                    debug!(stale = slot.captured.len(), "Dropping surplus notifications");
                    slot.captured.clear();
                }
                break Ok(payload);
            }
            let now = Instant::now();
            if now >= deadline {
                break Err(SyncError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            slot = self
                .signal
                .wait_timeout(slot, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        };

        slot.waiting = false;
        result
    }

    /// Notification callback. Safe to call from any thread.
    pub fn on_notify(&self, payload: &[u8]) {
        let mut slot = self.lock();
        slot.total_received += 1;
        slot.last_payload = Some(payload.to_vec());
        if slot.expected == 0 {
            trace!(payload = %hex_string(payload), "Notification outside capture window");
            return;
        }
        slot.captured.push_back(payload.to_vec());
        drop(slot);
        self.signal.notify_one();
    }

    /// Wake any pending wait with `Cancelled`. Later waits fail immediately.
    pub fn cancel(&self) {
        self.lock().cancelled = true;
        self.signal.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// Most recent notification payload, captured or not.
    pub fn last_payload(&self) -> Option<Vec<u8>> {
        self.lock().last_payload.clone()
    }

    /// Notifications seen since creation.
    pub fn total_received(&self) -> u64 {
        self.lock().total_received
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const SHORT: Duration = Duration::from_millis(50);
    const LONG: Duration = Duration::from_secs(5);

    #[test]
    fn test_wait_requires_arm() {
        let sync = NotificationSynchronizer::new();
        assert_eq!(sync.wait(SHORT), Err(SyncError::NotArmed));
    }

    #[test]
    fn test_notification_after_arm_unblocks() {
        let sync = Arc::new(NotificationSynchronizer::new());
        sync.arm().unwrap();

        let notifier = Arc::clone(&sync);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            notifier.on_notify(&[0x10, 0x01, 0x01]);
        });

        assert_eq!(sync.wait(LONG), Ok(vec![0x10, 0x01, 0x01]));
        handle.join().unwrap();
    }

    #[test]
    fn test_notification_between_arm_and_wait_is_kept() {
        let sync = NotificationSynchronizer::new();
        sync.arm().unwrap();
        sync.on_notify(&[0x11]);
        assert_eq!(sync.wait(SHORT), Ok(vec![0x11]));
    }

    #[test]
    fn test_stale_notification_is_not_reused() {
        let sync = NotificationSynchronizer::new();

        // Arrives while disarmed.
        sync.on_notify(&[0x01]);
        sync.arm().unwrap();
        assert_eq!(sync.wait(SHORT), Err(SyncError::Timeout { timeout_ms: 50 }));
        sync.disarm();

        // Surplus from a drained window is not carried into the next one.
        sync.arm().unwrap();
        sync.on_notify(&[0x02]);
        sync.on_notify(&[0x03]);
        assert_eq!(sync.wait(SHORT), Ok(vec![0x02]));
        assert_eq!(sync.outstanding(), 0);
        sync.arm().unwrap();
        assert_eq!(sync.wait(SHORT), Err(SyncError::Timeout { timeout_ms: 50 }));
        assert_eq!(sync.total_received(), 3);
        assert_eq!(sync.last_payload(), Some(vec![0x03]));
    }

    #[test]
    fn test_each_ack_consumed_once() {
        let sync = NotificationSynchronizer::new();
        sync.arm_expecting(2).unwrap();
        sync.on_notify(&[0x11]);
        sync.on_notify(&[0x10]);
        assert_eq!(sync.wait(SHORT), Ok(vec![0x11]));
        assert_eq!(sync.outstanding(), 1);
        assert_eq!(sync.wait(SHORT), Ok(vec![0x10]));
        assert_eq!(sync.wait(SHORT), Err(SyncError::NotArmed));
    }

    #[test]
    fn test_arm_rejected_while_acks_outstanding() {
        let sync = NotificationSynchronizer::new();
        sync.arm().unwrap();
        sync.on_notify(&[0x11]);
        assert_eq!(sync.arm(), Err(SyncError::AlreadyArmed { outstanding: 1 }));

        // The rejected arm must not discard what was already captured.
        assert_eq!(sync.wait(SHORT), Ok(vec![0x11]));
        sync.arm().unwrap();
    }

    #[test]
    fn test_disarm_drops_pending() {
        let sync = NotificationSynchronizer::new();
        sync.arm().unwrap();
        sync.on_notify(&[0x10]);
        sync.disarm();
        assert_eq!(sync.wait(SHORT), Err(SyncError::NotArmed));
    }

    #[test]
    fn test_cancel_interrupts_wait() {
        let sync = Arc::new(NotificationSynchronizer::new());
        sync.arm().unwrap();

        let canceller = Arc::clone(&sync);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            canceller.cancel();
        });

        let started = Instant::now();
        assert_eq!(sync.wait(LONG), Err(SyncError::Cancelled));
        assert!(started.elapsed() < LONG);
        handle.join().unwrap();

        assert!(sync.is_cancelled());
        sync.disarm();
        sync.arm().unwrap();
        assert_eq!(sync.wait(LONG), Err(SyncError::Cancelled));
    }
}
