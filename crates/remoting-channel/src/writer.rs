use remoting_proto::Command;
use tokio::sync::mpsc;

/// Single-consumer sequencer for outbound commands, the channel's "pipe
/// writer": everything that goes out on the wire funnels through here.
///
/// Every side effect a dispatched call produces — a `PipeChunk`, the
/// eventual `UserResponse`, a `PipeEOF` — goes through this queue instead of
/// writing the transport directly, so commands from concurrently executing
/// calls can never interleave mid-frame and a response is never observed by
/// the peer before the side effects that precede it.
#[derive(Clone)]
pub(crate) struct OutboundQueue {
    tx: mpsc::UnboundedSender<Command>,
}

impl OutboundQueue {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Enqueues `cmd` for writing. Fails only once the writer task has shut
    /// down, which happens exactly when the channel is closing.
    pub(crate) fn send(&self, cmd: Command) -> Result<(), Command> {
        self.tx.send(cmd).map_err(|e| e.0)
    }
}
