use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use remoting_proto::{Oid, RequestId};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Invoked for every `UserRequest` the peer sends.
///
/// This core treats the callable payload as opaque bytes end to end; decoding
/// `payload` into an actual invocation and re-encoding its result is the
/// embedder's job. `class_loader_oid` is handed through unexamined —
/// classloader-remoting semantics are an external collaborator here, not
/// something this crate interprets.
///
/// Returns the serialized result and whether it represents an exception,
/// carried back as `UserResponse`'s status (`Exception` vs. `Normal`).
pub trait Dispatcher: Send + Sync + 'static {
    fn invoke(&self, request_id: RequestId, class_loader_oid: Oid, payload: Bytes) -> BoxFuture<(Bytes, bool)>;
}

/// Dispatcher for channels that never execute peer-sent callables: every
/// inbound request comes back as an exception. Useful for a channel that
/// only ever calls out, never accepts calls (e.g. a pure sender endpoint).
pub struct Unimplemented;

impl Dispatcher for Unimplemented {
    fn invoke(&self, request_id: RequestId, _class_loader_oid: Oid, _payload: Bytes) -> BoxFuture<(Bytes, bool)> {
        let message = format!("no dispatcher configured to handle request {request_id}");
        Box::pin(async move { (Bytes::from(message.into_bytes()), true) })
    }
}
