//! Bidirectional, multiplexed RPC channel: handshake and capability
//! negotiation, classic/chunked command framing, request/response
//! correlation, an export table, and flow-controlled pipes — all running
//! over a single duplex byte stream between two symmetric peers.
//!
//! The wire format and `Command` sum type live in [`remoting_proto`]; this
//! crate owns everything about *running* a channel over that format:
//! dispatch, bookkeeping, concurrency.
//!
//! Start with [`ChannelBuilder`] to configure a channel, then
//! [`Channel::build`] to perform the handshake and spawn its driving task.

#[macro_use]
extern crate tracing;

mod channel;
mod codec;
mod config;
mod dispatch;
mod error;
mod export;
mod handshake;
mod id_allocator;
mod pipe;
mod request;
mod role;
mod sequencer;
mod text_mode;
mod writer;

pub use remoting_proto::{Capability, IoId, Mode, Oid, RequestId};

pub use self::channel::Channel;
pub use self::config::{ChannelBuilder, ChannelConfig};
pub use self::dispatch::{BoxFuture, Dispatcher, Unimplemented};
pub use self::error::{ChannelError, RemoteException};
pub use self::export::UnexportRecord;
pub use self::pipe::PipeEvent;
pub use self::role::{AllowAll, DenyAll, RoleChecker};
