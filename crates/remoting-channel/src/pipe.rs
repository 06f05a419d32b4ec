use std::sync::atomic::{AtomicI64, AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Notify;

/// Events delivered to whoever registered interest in an exported pipe via
/// [`crate::Channel::open_pipe`].
#[derive(Debug, Clone)]
pub enum PipeEvent {
    Chunk(Bytes),
    Eof,
    Flush,
    /// The remote writer died; `cause` is the peer-reported diagnostic.
    DeadWriter(String),
}

/// Sliding-window flow control for a single exported pipe.
///
/// The writer calls [`PipeWindow::get`] before sending a chunk and blocks
/// until enough window is available; the reader credits window back with
/// [`PipeWindow::increase`] as it drains its local buffer. `decrease` is
/// called by the writer side once it has actually consumed window for a
/// chunk it queued.
#[derive(Clone)]
pub(crate) struct PipeWindow {
    inner: Arc<Inner>,
}

struct Inner {
    max: u32,
    available: AtomicI64,
    dead: AtomicBool,
    notify: Notify,
}

impl PipeWindow {
    pub(crate) fn new(initial: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                max: initial,
                available: AtomicI64::new(i64::from(initial)),
                dead: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// The advertised window size this pipe was opened with.
    pub(crate) fn max(&self) -> u32 {
        self.inner.max
    }

    /// Blocks until at least `amount` bytes of window are available, or the
    /// pipe is marked dead. Returns `false` in the latter case.
    pub(crate) async fn get(&self, amount: u32) -> bool {
        loop {
            let notified = self.inner.notify.notified();

            if self.inner.dead.load(Ordering::Acquire) {
                return false;
            }

            if self.inner.available.load(Ordering::Acquire) >= i64::from(amount) {
                return true;
            }

            notified.await;
        }
    }

    /// Snapshot of the currently available window, or `None` if the pipe has
    /// been killed. Used after [`PipeWindow::get`] succeeds to learn *how
    /// much* is actually available, so a writer can send more than its
    /// minimum demand without a second round trip.
    pub(crate) fn available(&self) -> Option<u32> {
        if self.inner.dead.load(Ordering::Acquire) {
            return None;
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let available = self.inner.available.load(Ordering::Acquire).clamp(0, i64::from(u32::MAX)) as u32;
        Some(available)
    }

    pub(crate) fn decrease(&self, amount: u32) {
        self.inner.available.fetch_sub(i64::from(amount), Ordering::AcqRel);
    }

    pub(crate) fn increase(&self, amount: u32) {
        self.inner.available.fetch_add(i64::from(amount), Ordering::AcqRel);
        self.inner.notify.notify_waiters();
    }

    /// Unblocks every waiter permanently. Used when the remote reports the
    /// writer as dead via `PipeNotifyDeadWriter`, or the channel closes.
    pub(crate) fn kill(&self) {
        self.inner.dead.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.inner.dead.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[tokio::test]
    async fn get_unblocks_once_window_is_available() {
        let window = PipeWindow::new(0);
        let waiter = window.clone();
        let handle = tokio::spawn(async move { waiter.get(10).await });

        tokio::task::yield_now().await;
        window.increase(10);

        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn kill_unblocks_waiters_with_false() {
        let window = PipeWindow::new(0);
        let waiter = window.clone();
        let handle = tokio::spawn(async move { waiter.get(10).await });

        tokio::task::yield_now().await;
        window.kill();

        assert!(!handle.await.unwrap());
    }

    #[tokio::test]
    async fn decrease_then_increase_nets_out() {
        let window = PipeWindow::new(100);
        window.decrease(40);
        assert!(window.get(60).await);
        window.increase(1);
        assert!(window.get(61).await);
    }
}
