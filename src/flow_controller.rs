//! A single-bit cooperative pause flag plus cancellation, checked at the
//! top of every command iteration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Distinguishes why a flow was cancelled; `onFlowComplete` needs to tell
/// "ran to completion" apart from "cancelled" when deciding whether to
/// still invoke completion hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    UserRequested,
}

const POLL_GRANULARITY: Duration = Duration::from_millis(500);

pub struct FlowController {
    paused: AtomicBool,
    notify: Notify,
    cancellation: CancellationToken,
}

impl FlowController {
    pub fn new() -> Self {
        Self {
            paused: AtomicBool::new(false),
            notify: Notify::new(),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn cancel(&self, _reason: CancelReason) {
        self.cancellation.cancel();
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Suspends the caller while paused, waking at least every 500ms to
    /// re-check cancellation.
    pub async fn wait_if_paused(&self) {
        while self.is_paused() && !self.is_cancelled() {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(POLL_GRANULARITY) => {}
            }
        }
    }
}

impl Default for FlowController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_if_paused_returns_immediately_when_not_paused() {
        let controller = FlowController::new();
        tokio::time::timeout(Duration::from_millis(50), controller.wait_if_paused())
            .await
            .expect("should not block");
    }

    #[tokio::test]
    async fn resume_wakes_a_waiter() {
        let controller = std::sync::Arc::new(FlowController::new());
        controller.pause();
        let waiter = {
            let controller = controller.clone();
            tokio::spawn(async move {
                controller.wait_if_paused().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        controller.resume();
        tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("waiter should complete")
            .unwrap();
    }

    #[tokio::test]
    async fn cancellation_unblocks_a_paused_wait() {
        let controller = std::sync::Arc::new(FlowController::new());
        controller.pause();
        let waiter = {
            let controller = controller.clone();
            tokio::spawn(async move {
                controller.wait_if_paused().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        controller.cancel(CancelReason::UserRequested);
        tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("waiter should complete")
            .unwrap();
    }
}
