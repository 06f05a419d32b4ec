use bytes::{Buf as _, BufMut as _};

use crate::error::Error;

/// Largest payload a single chunk header can carry (15 usable bits).
pub const MAX_CHUNK_PAYLOAD: usize = 0x7fff;

const CONTINUATION_BIT: u16 = 0x8000;

/// A chunk header: 2 bytes, big-endian. Bit 15 is the continuation flag (more
/// chunks follow for the same command), bits 14..0 are the payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub len: u16,
    pub more: bool,
}

impl ChunkHeader {
    pub fn new(len: usize, more: bool) -> Result<Self, Error> {
        if len > MAX_CHUNK_PAYLOAD {
            return Err(Error::ChunkTooLarge {
                size: len,
                max: MAX_CHUNK_PAYLOAD,
            });
        }

        Ok(Self {
            #[allow(clippy::cast_possible_truncation)]
            len: len as u16,
            more,
        })
    }

    pub const SIZE: usize = 2;

    pub fn encode(self, buf: &mut bytes::BytesMut) {
        let mut word = self.len;
        if self.more {
            word |= CONTINUATION_BIT;
        }
        buf.put_u16(word);
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < Self::SIZE {
            return Err(Error::NotEnoughBytes {
                name: "CHUNK_HEADER",
                received: buf.len(),
                expected: Self::SIZE,
            });
        }

        let word = buf.get_u16();
        Ok(Self {
            len: word & !CONTINUATION_BIT,
            more: word & CONTINUATION_BIT != 0,
        })
    }

    pub const fn payload_len(self) -> usize {
        self.len as usize
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use bytes::BytesMut;
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn rejects_oversized_payload() {
        assert!(matches!(
            ChunkHeader::new(MAX_CHUNK_PAYLOAD + 1, false),
            Err(Error::ChunkTooLarge { .. })
        ));
    }

    #[test]
    fn max_payload_is_accepted() {
        assert!(ChunkHeader::new(MAX_CHUNK_PAYLOAD, true).is_ok());
    }

    proptest! {
        #[test]
        fn header_round_trips(len in 0usize..=MAX_CHUNK_PAYLOAD, more: bool) {
            let header = ChunkHeader::new(len, more).unwrap();
            let mut buf = BytesMut::new();
            header.encode(&mut buf);
            prop_assert_eq!(buf.len(), ChunkHeader::SIZE);
            let decoded = ChunkHeader::decode(&buf).unwrap();
            prop_assert_eq!(decoded, header);
        }
    }
}
