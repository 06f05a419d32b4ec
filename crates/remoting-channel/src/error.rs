use std::fmt;

use bytes::Bytes;
use remoting_proto::{Oid, RequestId};

use crate::export::UnexportRecord;

/// Wraps a `UserResponse` whose status was `Exception`. Carried inside
/// [`ChannelError::Serialization`] so callers that care can recover the
/// exception payload with `anyhow::Error::downcast_ref`.
#[derive(Debug)]
pub struct RemoteException(pub Bytes);

impl fmt::Display for RemoteException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "remote call raised an exception ({} byte payload)", self.0.len())
    }
}

impl std::error::Error for RemoteException {}

/// Errors surfaced to callers of a [`crate::Channel`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ChannelError {
    #[error("transport I/O error")]
    Transport(#[source] std::io::Error),

    #[error("protocol violation: {0}")]
    Protocol(#[source] remoting_proto::Error),

    #[error("channel is closed")]
    ChannelClosed,

    #[error("request {0} was aborted")]
    RequestAborted(RequestId),

    #[error("object {oid} is not exported on this channel{}", format_stale_diagnostic(diagnostic))]
    InvalidObjectId {
        oid: Oid,
        /// Filled in from the unexport log when the OID was exported at
        /// some point but has since been released.
        diagnostic: Option<UnexportRecord>,
    },

    #[error("call refused: {reason}")]
    SecurityRefused { reason: String },

    #[error("failed to (de)serialize payload")]
    Serialization(#[source] anyhow::Error),

    #[error("blocked call was interrupted")]
    Interrupted,

    #[error("request {0} was cancelled")]
    Cancelled(RequestId),
}

impl ChannelError {
    pub(crate) fn transport(err: std::io::Error) -> Self {
        Self::Transport(err)
    }

    pub(crate) fn protocol(err: remoting_proto::Error) -> Self {
        Self::Protocol(err)
    }

    /// Classifies an `io::Error` surfaced by a [`tokio_util::codec::Decoder`]
    /// as either a wire-format violation (a `remoting_proto::Error` the codec
    /// boxed via `io::Error::other`) or a genuine transport failure, so
    /// callers see spec's `ProtocolError`/`TransportError` split instead of
    /// everything collapsing into one opaque I/O error.
    pub(crate) fn from_decode_error(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::Other {
            match err.into_inner() {
                Some(inner) => match inner.downcast::<remoting_proto::Error>() {
                    Ok(proto_err) => return Self::protocol(*proto_err),
                    Err(inner) => return Self::transport(std::io::Error::other(inner)),
                },
                None => return Self::transport(std::io::Error::from(std::io::ErrorKind::Other)),
            }
        }
        Self::transport(err)
    }
}

fn format_stale_diagnostic(diagnostic: &Option<UnexportRecord>) -> String {
    match diagnostic {
        Some(record) => format!(
            " (allocated at {}, released at {}: {})",
            record.allocated_at, record.released_at, record.reason
        ),
        None => String::new(),
    }
}
