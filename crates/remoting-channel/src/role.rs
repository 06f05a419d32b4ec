//! Per-call authorization hook. Checked before a `UserRequest` is dispatched
//! to the exported callable; a refusal surfaces to the caller as
//! [`crate::ChannelError::SecurityRefused`] rather than a generic protocol
//! error, so decorators downstream can tell "not permitted" from "broken".

use remoting_proto::{Oid, RequestId};

/// Decides whether the peer may invoke a given exported object on this
/// channel. Implementations should be cheap: this runs on the dispatch path
/// for every incoming request.
pub trait RoleChecker: Send + Sync + 'static {
    /// Returns `Ok(())` if the call is permitted, or `Err(reason)` with a
    /// human-readable refusal reason otherwise.
    fn check(&self, oid: Oid, request_id: RequestId) -> Result<(), String>;
}

/// Permits everything. The conservative default would deny everything, but
/// since arbitrary-callable dispatch is already gated by
/// [`crate::ChannelConfig::arbitrary_callable_allowed`], an all-allow checker
/// is a safe baseline on top of that gate.
pub struct AllowAll;

impl RoleChecker for AllowAll {
    fn check(&self, _oid: Oid, _request_id: RequestId) -> Result<(), String> {
        Ok(())
    }
}

/// Denies everything. Useful for channels that should never receive
/// server-initiated calls.
pub struct DenyAll;

impl RoleChecker for DenyAll {
    fn check(&self, oid: Oid, _request_id: RequestId) -> Result<(), String> {
        Err(format!("calls into {oid} are not permitted on this channel"))
    }
}
