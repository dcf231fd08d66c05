// THEORY:
// The `FrameSlot` is the only hand-off point between the capture path and the
// background workers. It is deliberately lossy: it holds at most one item, and a
// new `put` silently replaces whatever was waiting. A consumer that falls behind
// therefore never works through a backlog of stale frames; it always wakes up to
// the freshest one.
//
// Key properties:
// 1.  **Producer never waits**: `put` only takes a short mutex and signals a
//     `Notify`, so the capture loop can call it on every frame.
// 2.  **Bounded waits**: `poll` gives up after its timeout and reports an empty
//     slot. Timeouts are the normal idle condition, not an error.
// 3.  **Interruptible**: `close` wakes every waiter so a shutting-down worker does
//     not sit out its full timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;

/// Single-capacity, overwrite-on-insert hand-off cell.
#[derive(Debug)]
pub struct FrameSlot<T> {
    cell: Mutex<Option<T>>,
    ready: Notify,
    closed: AtomicBool,
}

impl<T> Default for FrameSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FrameSlot<T> {
    pub fn new() -> Self {
        Self {
            cell: Mutex::new(None),
            ready: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Replaces the current content. Any superseded item is dropped here.
    pub fn put(&self, item: T) {
        let superseded = self.lock().replace(item);
        drop(superseded);
        self.ready.notify_one();
    }

    /// Waits up to `timeout` for content and takes it, leaving the slot empty.
    ///
    /// Returns `None` when nothing arrived in time or when the slot was closed
    /// while waiting.
    pub async fn poll(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(item) = self.try_take() {
                return Some(item);
            }
            if self.is_closed() {
                warn!("frame slot closed while a consumer was waiting");
                return None;
            }
            if tokio::time::timeout_at(deadline, self.ready.notified())
                .await
                .is_err()
            {
                return self.try_take();
            }
        }
    }

    /// Takes the content without waiting.
    pub fn try_take(&self) -> Option<T> {
        self.lock().take()
    }

    pub fn clear(&self) {
        let dropped = self.lock().take();
        drop(dropped);
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_none()
    }

    /// Wakes all waiters and makes subsequent empty polls return immediately.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.ready.notify_waiters();
        self.ready.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        self.cell.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn poll_returns_only_the_latest_put() {
        let slot = FrameSlot::new();
        for value in 1..=5 {
            slot.put(value);
        }

        assert!(!slot.is_empty());
        assert_eq!(slot.poll(Duration::from_millis(150)).await, Some(5));
        assert!(slot.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_poll_waits_out_the_timeout() {
        let slot: FrameSlot<u32> = FrameSlot::new();
        let started = Instant::now();

        assert_eq!(slot.poll(Duration::from_millis(150)).await, None);
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_consumer_wakes_on_put() {
        let slot = Arc::new(FrameSlot::new());
        let consumer = {
            let slot = Arc::clone(&slot);
            tokio::spawn(async move { slot.poll(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        slot.put("frame");

        assert_eq!(consumer.await.unwrap(), Some("frame"));
        assert!(slot.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn burst_during_slow_consumer_collapses_to_newest() {
        let slot = FrameSlot::new();
        slot.put(1);
        assert_eq!(slot.poll(Duration::from_millis(10)).await, Some(1));

        slot.put(2);
        slot.put(3);
        slot.put(4);

        assert_eq!(slot.poll(Duration::from_millis(10)).await, Some(4));
        assert_eq!(slot.poll(Duration::from_millis(10)).await, None);
    }

    #[test]
    fn clear_discards_pending_content() {
        let slot = FrameSlot::new();
        slot.put(String::from("stale"));
        slot.clear();

        assert!(slot.is_empty());
        assert_eq!(slot.try_take(), None);
    }

    #[tokio::test]
    async fn close_interrupts_a_waiting_consumer() {
        let slot: Arc<FrameSlot<u8>> = Arc::new(FrameSlot::new());
        let consumer = {
            let slot = Arc::clone(&slot);
            tokio::spawn(async move {
                let started = Instant::now();
                let item = slot.poll(Duration::from_secs(30)).await;
                (item, started.elapsed())
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        slot.close();

        let (item, waited) = consumer.await.unwrap();
        assert_eq!(item, None);
        assert!(waited < Duration::from_secs(30));
    }
}
