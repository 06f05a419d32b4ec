use std::sync::Arc;

use parking_lot::Mutex;
use remoting_proto::IoId;
use tokio::sync::Notify;

/// Enforces the "executed-before" ordering guarantee between a request and
/// the pipe side effects that preceded it on the same wire — the channel's
/// "pipe writer".
///
/// Every side-effecting inbound command (`PipeChunk`, `PipeFlush`,
/// `PipeEof`) carries an `ioId` the sender allocated monotonically before
/// sending it. Since a single reader dispatches inbound commands strictly
/// in wire order, marking an `ioId` complete as soon as its command has been
/// handed off to its consumer is enough to make `wait_for` observe every
/// earlier `ioId` as done — no separate lock-stepped queue is needed the way
/// a blocking-I/O implementation would require one.
#[derive(Clone)]
pub(crate) struct IoSequencer {
    inner: Arc<Inner>,
}

struct Inner {
    completed: Mutex<u64>,
    notify: Notify,
}

impl Default for IoSequencer {
    fn default() -> Self {
        Self {
            inner: Arc::new(Inner {
                completed: Mutex::new(0),
                notify: Notify::new(),
            }),
        }
    }
}

impl IoSequencer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Marks `io_id` as executed. Monotonic: an out-of-order call (which
    /// shouldn't happen given a single serial reader) can only be a no-op,
    /// never a regression.
    pub(crate) fn complete(&self, io_id: IoId) {
        let mut completed = self.inner.completed.lock();
        if io_id.get() > *completed {
            *completed = io_id.get();
        }
        drop(completed);
        self.inner.notify.notify_waiters();
    }

    /// Blocks until every `ioId` up to and including `target` has been
    /// marked complete. `IoId::new(0)` means "nothing to wait for" and
    /// returns immediately, mirroring `pipeWriter.get(0)` being a no-op.
    pub(crate) async fn wait_for(&self, target: IoId) {
        if target.get() == 0 {
            return;
        }

        loop {
            let notified = self.inner.notify.notified();
            if *self.inner.completed.lock() >= target.get() {
                return;
            }
            notified.await;
        }
    }

    /// Current high-water mark, used to stamp a `last_io_id`/`response_io_id`
    /// snapshot on an outbound command.
    pub(crate) fn current(&self) -> u64 {
        *self.inner.completed.lock()
    }
}
