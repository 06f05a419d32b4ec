use core::fmt;

/// Wire-format level errors: malformed frames, unknown tags, oversized
/// packets. Hand-rolled rather than `thiserror`-derived to match the rest of
/// this crate, which has no dependency beyond `bytes`.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    PacketOversized {
        packet_size: usize,
        max: usize,
    },
    NotEnoughBytes {
        name: &'static str,
        received: usize,
        expected: usize,
    },
    InvalidPacket {
        name: &'static str,
        field: &'static str,
        reason: &'static str,
    },
    UnknownCommandTag(u8),
    ChunkTooLarge {
        size: usize,
        max: usize,
    },
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::PacketOversized { packet_size, max } => {
                write!(f, "packet oversized: max is {max}, got {packet_size}")
            }
            Error::NotEnoughBytes {
                name,
                received,
                expected,
            } => write!(
                f,
                "not enough bytes provided to decode {name}: received {received} bytes, expected {expected} bytes"
            ),
            Error::InvalidPacket { name, field, reason } => {
                write!(f, "invalid `{field}` in {name}: {reason}")
            }
            Error::UnknownCommandTag(tag) => write!(f, "unknown command tag: {tag}"),
            Error::ChunkTooLarge { size, max } => {
                write!(f, "chunk payload too large: max is {max}, got {size}")
            }
        }
    }
}
