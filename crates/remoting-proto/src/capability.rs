use std::fmt;

/// 64-bit feature bitfield exchanged during the handshake.
///
/// Unknown bits are preserved but otherwise ignored by this core — a peer
/// advertising a bit we don't recognize is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capability(u64);

impl Capability {
    /// Multi-classloader RPC support. Inert in this core: classloader
    /// remoting is an external collaborator, not something this crate
    /// implements.
    pub const MULTI_CLASSLOADER_RPC: Capability = Capability(1 << 0);
    /// Sender honors the receiver's advertised pipe window before sending.
    pub const PIPE_THROTTLING: Capability = Capability(1 << 1);
    /// Proxy writer protocol revision 2.35 or later.
    pub const PROXY_WRITER_2_35: Capability = Capability(1 << 2);
    /// Chunked (length-prefixed, continuation-flagged) command framing.
    pub const CHUNKING: Capability = Capability(1 << 3);

    pub const NONE: Capability = Capability(0);

    /// The capability set advertised by this implementation.
    pub const fn local() -> Self {
        Self(Self::PIPE_THROTTLING.0 | Self::CHUNKING.0)
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn supports(self, flag: Capability) -> bool {
        self.0 & flag.0 == flag.0
    }

    pub const fn with(self, flag: Capability) -> Self {
        Self(self.0 | flag.0)
    }

    /// Length-prefixed wire encoding: 2-byte big-endian length, then that
    /// many bytes of little-endian bitmask (zero-padded to 8 bytes).
    pub fn encode(self) -> Vec<u8> {
        self.0.to_le_bytes().to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Self {
        let mut buf = [0u8; 8];
        let n = bytes.len().min(8);
        buf[..n].copy_from_slice(&bytes[..n]);
        Self(u64::from_le_bytes(buf))
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Capability(0x{:016x})", self.0)
    }
}

impl std::ops::BitOr for Capability {
    type Output = Capability;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}
