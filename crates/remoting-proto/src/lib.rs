//! Wire format for the remoting channel protocol.
//!
//! This crate is deliberately tiny and dependency-light: it only knows how to
//! turn [`Command`] values into bytes and back, frame those bytes into
//! length-prefixed chunks, and describe the handshake preambles and
//! capability bitfield exchanged up front. Everything about running a
//! channel — transports, request/response bookkeeping, pipes, export tables —
//! lives one level up.

mod capability;
mod chunk;
mod command;
mod error;
mod ids;
mod mode;

pub use capability::Capability;
pub use chunk::{ChunkHeader, MAX_CHUNK_PAYLOAD};
pub use command::{Command, ResponseStatus};
pub use error::Error;
pub use ids::{IoId, Oid, RequestId};
pub use mode::{Mode, BINARY_MODE_PREAMBLE, CAPABILITY_PREAMBLE, TEXT_MODE_PREAMBLE};

/// Largest single command this core will attempt to decode, classic framing.
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;
