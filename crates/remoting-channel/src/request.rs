use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use remoting_proto::RequestId;
use tokio::sync::oneshot;

use crate::ChannelError;

/// Outcome delivered to a caller blocked in [`crate::Channel::call`] once the
/// matching `UserResponse` (or a closure/abort) arrives.
pub(crate) type CallOutcome = Result<Bytes, ChannelError>;

/// A call still awaiting its response, plus the means to cancel it.
struct Pending {
    reply: oneshot::Sender<CallOutcome>,
}

/// Correlates outbound `UserRequest`s with their `UserResponse`/`Cancel`.
/// `RequestId`s are allocated monotonically; re-use is never necessary since
/// they're 64-bit.
#[derive(Clone)]
pub(crate) struct PendingCalls {
    next_id: Arc<AtomicU64>,
    inner: Arc<Mutex<HashMap<RequestId, Pending>>>,
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self {
            next_id: Arc::new(AtomicU64::new(1)),
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl PendingCalls {
    pub(crate) fn next_request_id(&self) -> RequestId {
        RequestId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Registers a new pending call, returning the receiver half the caller
    /// awaits on.
    pub(crate) fn register(&self, id: RequestId) -> oneshot::Receiver<CallOutcome> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().insert(id, Pending { reply: tx });
        rx
    }

    /// Completes a pending call with its result. A missing `id` means the
    /// response arrived after the caller gave up (e.g. dropped the future);
    /// this is not an error.
    pub(crate) fn complete(&self, id: RequestId, outcome: CallOutcome) {
        if let Some(pending) = self.inner.lock().remove(&id) {
            let _ = pending.reply.send(outcome);
        }
    }

    /// Removes and fails every pending call with `RequestAborted`. Used when
    /// the channel closes while calls are still in flight.
    pub(crate) fn abort_all(&self) {
        let pending: Vec<_> = self.inner.lock().drain().collect();
        for (id, pending) in pending {
            let _ = pending.reply.send(Err(ChannelError::RequestAborted(id)));
        }
    }

    pub(crate) fn abort(&self, id: RequestId) {
        if let Some(pending) = self.inner.lock().remove(&id) {
            let _ = pending.reply.send(Err(ChannelError::RequestAborted(id)));
        }
    }

    /// Like [`PendingCalls::abort`], but reports cancellation rather than
    /// channel shutdown — used when the local caller explicitly cancels a
    /// call still in flight.
    pub(crate) fn cancel(&self, id: RequestId) {
        if let Some(pending) = self.inner.lock().remove(&id) {
            let _ = pending.reply.send(Err(ChannelError::Cancelled(id)));
        }
    }

    pub(crate) fn contains(&self, id: RequestId) -> bool {
        self.inner.lock().contains_key(&id)
    }
}

/// Tracks requests the *peer* sent us that are still executing locally, so a
/// `Cancel` command can be matched to the task running it.
#[derive(Clone, Default)]
pub(crate) struct ExecutingCalls {
    inner: Arc<Mutex<HashMap<RequestId, tokio_util::sync::CancellationToken>>>,
}

impl ExecutingCalls {
    pub(crate) fn begin(&self, id: RequestId) -> tokio_util::sync::CancellationToken {
        let token = tokio_util::sync::CancellationToken::new();
        self.inner.lock().insert(id, token.clone());
        token
    }

    pub(crate) fn finish(&self, id: RequestId) {
        self.inner.lock().remove(&id);
    }

    pub(crate) fn cancel(&self, id: RequestId) {
        if let Some(token) = self.inner.lock().get(&id) {
            token.cancel();
        }
    }

    pub(crate) fn cancel_all(&self) {
        for token in self.inner.lock().values() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[tokio::test]
    async fn complete_delivers_to_registered_receiver() {
        let calls = PendingCalls::default();
        let id = calls.next_request_id();
        let rx = calls.register(id);

        calls.complete(id, Ok(Bytes::from_static(b"ok")));

        assert_eq!(rx.await.unwrap().unwrap(), Bytes::from_static(b"ok"));
    }

    #[tokio::test]
    async fn abort_all_fails_every_pending_call() {
        let calls = PendingCalls::default();
        let id_a = calls.next_request_id();
        let id_b = calls.next_request_id();
        let rx_a = calls.register(id_a);
        let rx_b = calls.register(id_b);

        calls.abort_all();

        assert!(matches!(rx_a.await.unwrap(), Err(ChannelError::RequestAborted(_))));
        assert!(matches!(rx_b.await.unwrap(), Err(ChannelError::RequestAborted(_))));
    }

    #[tokio::test]
    async fn executing_calls_cancel_signals_token() {
        let executing = ExecutingCalls::default();
        let id = RequestId::new(1);
        let token = executing.begin(id);

        executing.cancel(id);

        assert!(token.is_cancelled());
    }
}
