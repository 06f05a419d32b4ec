use core::fmt;

use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};

use crate::error::Error;
use crate::ids::{IoId, Oid, RequestId};

macro_rules! ensure_size {
    ($buf:ident [$expected:expr] for $name:expr) => {{
        let received = $buf.len();
        let expected = $expected;
        if received < expected {
            return Err(Error::NotEnoughBytes {
                name: $name,
                received,
                expected,
            });
        }
    }};
}

/// Discriminated control messages exchanged over the channel.
#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    UserRequest {
        id: RequestId,
        last_io_id: IoId,
        class_loader_oid: Oid,
        serialized_callable: Bytes,
    },
    UserResponse {
        id: RequestId,
        response_io_id: IoId,
        status: ResponseStatus,
        serialized_result: Bytes,
    },
    Cancel {
        id: RequestId,
    },
    PipeChunk {
        io_id: IoId,
        oid: Oid,
        payload: Bytes,
    },
    PipeAck {
        oid: Oid,
        size: u32,
    },
    PipeEof {
        io_id: IoId,
        oid: Oid,
    },
    PipeFlush {
        io_id: IoId,
        oid: Oid,
    },
    PipeUnexport {
        io_id: IoId,
        oid: Oid,
    },
    PipeNotifyDeadWriter {
        oid: Oid,
        cause: String,
    },
}

/// How a `UserResponse` resolved. Distinguishing `SecurityRefused` from a
/// generic `Exception` on the wire is what lets the caller side reconstruct
/// `ChannelError::SecurityRefused` instead of collapsing every non-`Normal`
/// response into an opaque remote exception.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Normal = 0,
    Exception = 1,
    SecurityRefused = 2,
}

impl TryFrom<u8> for ResponseStatus {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self, Error> {
        match v {
            0 => Ok(ResponseStatus::Normal),
            1 => Ok(ResponseStatus::Exception),
            2 => Ok(ResponseStatus::SecurityRefused),
            _ => Err(Error::InvalidPacket {
                name: "USER_RESPONSE",
                field: "status",
                reason: "unknown response status",
            }),
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    UserRequest = 1,
    UserResponse = 2,
    Cancel = 3,
    PipeChunk = 4,
    PipeAck = 5,
    PipeEof = 6,
    PipeFlush = 7,
    PipeUnexport = 8,
    PipeNotifyDeadWriter = 9,
}

impl TryFrom<u8> for Tag {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self, Error> {
        match v {
            1 => Ok(Tag::UserRequest),
            2 => Ok(Tag::UserResponse),
            3 => Ok(Tag::Cancel),
            4 => Ok(Tag::PipeChunk),
            5 => Ok(Tag::PipeAck),
            6 => Ok(Tag::PipeEof),
            7 => Ok(Tag::PipeFlush),
            8 => Ok(Tag::PipeUnexport),
            9 => Ok(Tag::PipeNotifyDeadWriter),
            other => Err(Error::UnknownCommandTag(other)),
        }
    }
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::UserRequest { .. } => "USER_REQUEST",
            Command::UserResponse { .. } => "USER_RESPONSE",
            Command::Cancel { .. } => "CANCEL",
            Command::PipeChunk { .. } => "PIPE_CHUNK",
            Command::PipeAck { .. } => "PIPE_ACK",
            Command::PipeEof { .. } => "PIPE_EOF",
            Command::PipeFlush { .. } => "PIPE_FLUSH",
            Command::PipeUnexport { .. } => "PIPE_UNEXPORT",
            Command::PipeNotifyDeadWriter { .. } => "PIPE_NOTIFY_DEAD_WRITER",
        }
    }

    /// Encoded size in bytes, including the 1-byte tag.
    pub fn size(&self) -> usize {
        1 + match self {
            Command::UserRequest {
                serialized_callable, ..
            } => 8 + 8 + 4 + 4 + serialized_callable.len(),
            Command::UserResponse { serialized_result, .. } => 8 + 8 + 1 + 4 + serialized_result.len(),
            Command::Cancel { .. } => 8,
            Command::PipeChunk { payload, .. } => 8 + 4 + 4 + payload.len(),
            Command::PipeAck { .. } => 4 + 4,
            Command::PipeEof { .. } | Command::PipeFlush { .. } | Command::PipeUnexport { .. } => 8 + 4,
            Command::PipeNotifyDeadWriter { cause, .. } => 4 + 4 + cause.len(),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.size());

        match self {
            Command::UserRequest {
                id,
                last_io_id,
                class_loader_oid,
                serialized_callable,
            } => {
                buf.put_u8(Tag::UserRequest as u8);
                buf.put_u64(id.get());
                buf.put_u64(last_io_id.get());
                buf.put_u32(class_loader_oid.get());
                buf.put_u32(u32::try_from(serialized_callable.len()).unwrap_or(u32::MAX));
                buf.put(serialized_callable.as_ref());
            }
            Command::UserResponse {
                id,
                response_io_id,
                status,
                serialized_result,
            } => {
                buf.put_u8(Tag::UserResponse as u8);
                buf.put_u64(id.get());
                buf.put_u64(response_io_id.get());
                buf.put_u8(*status as u8);
                buf.put_u32(u32::try_from(serialized_result.len()).unwrap_or(u32::MAX));
                buf.put(serialized_result.as_ref());
            }
            Command::Cancel { id } => {
                buf.put_u8(Tag::Cancel as u8);
                buf.put_u64(id.get());
            }
            Command::PipeChunk { io_id, oid, payload } => {
                buf.put_u8(Tag::PipeChunk as u8);
                buf.put_u64(io_id.get());
                buf.put_u32(oid.get());
                buf.put_u32(u32::try_from(payload.len()).unwrap_or(u32::MAX));
                buf.put(payload.as_ref());
            }
            Command::PipeAck { oid, size } => {
                buf.put_u8(Tag::PipeAck as u8);
                buf.put_u32(oid.get());
                buf.put_u32(*size);
            }
            Command::PipeEof { io_id, oid } => {
                buf.put_u8(Tag::PipeEof as u8);
                buf.put_u64(io_id.get());
                buf.put_u32(oid.get());
            }
            Command::PipeFlush { io_id, oid } => {
                buf.put_u8(Tag::PipeFlush as u8);
                buf.put_u64(io_id.get());
                buf.put_u32(oid.get());
            }
            Command::PipeUnexport { io_id, oid } => {
                buf.put_u8(Tag::PipeUnexport as u8);
                buf.put_u64(io_id.get());
                buf.put_u32(oid.get());
            }
            Command::PipeNotifyDeadWriter { oid, cause } => {
                buf.put_u8(Tag::PipeNotifyDeadWriter as u8);
                buf.put_u32(oid.get());
                buf.put_u32(u32::try_from(cause.len()).unwrap_or(u32::MAX));
                buf.put(cause.as_bytes());
            }
        }
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, Error> {
        ensure_size!(buf[1] for "COMMAND");
        let tag = buf.get_u8();

        match Tag::try_from(tag)? {
            Tag::UserRequest => {
                ensure_size!(buf[24] for "USER_REQUEST");
                let id = RequestId::new(buf.get_u64());
                let last_io_id = IoId::new(buf.get_u64());
                let class_loader_oid = Oid::new(buf.get_u32());
                let payload_len = buf.get_u32() as usize;
                ensure_size!(buf[payload_len] for "USER_REQUEST.payload");
                let serialized_callable = buf.split_to(payload_len);
                Ok(Command::UserRequest {
                    id,
                    last_io_id,
                    class_loader_oid,
                    serialized_callable,
                })
            }
            Tag::UserResponse => {
                ensure_size!(buf[21] for "USER_RESPONSE");
                let id = RequestId::new(buf.get_u64());
                let response_io_id = IoId::new(buf.get_u64());
                let status = ResponseStatus::try_from(buf.get_u8())?;
                let payload_len = buf.get_u32() as usize;
                ensure_size!(buf[payload_len] for "USER_RESPONSE.payload");
                let serialized_result = buf.split_to(payload_len);
                Ok(Command::UserResponse {
                    id,
                    response_io_id,
                    status,
                    serialized_result,
                })
            }
            Tag::Cancel => {
                ensure_size!(buf[8] for "CANCEL");
                Ok(Command::Cancel {
                    id: RequestId::new(buf.get_u64()),
                })
            }
            Tag::PipeChunk => {
                ensure_size!(buf[16] for "PIPE_CHUNK");
                let io_id = IoId::new(buf.get_u64());
                let oid = Oid::new(buf.get_u32());
                let payload_len = buf.get_u32() as usize;
                ensure_size!(buf[payload_len] for "PIPE_CHUNK.payload");
                let payload = buf.split_to(payload_len);
                Ok(Command::PipeChunk { io_id, oid, payload })
            }
            Tag::PipeAck => {
                ensure_size!(buf[8] for "PIPE_ACK");
                Ok(Command::PipeAck {
                    oid: Oid::new(buf.get_u32()),
                    size: buf.get_u32(),
                })
            }
            Tag::PipeEof => {
                ensure_size!(buf[12] for "PIPE_EOF");
                Ok(Command::PipeEof {
                    io_id: IoId::new(buf.get_u64()),
                    oid: Oid::new(buf.get_u32()),
                })
            }
            Tag::PipeFlush => {
                ensure_size!(buf[12] for "PIPE_FLUSH");
                Ok(Command::PipeFlush {
                    io_id: IoId::new(buf.get_u64()),
                    oid: Oid::new(buf.get_u32()),
                })
            }
            Tag::PipeUnexport => {
                ensure_size!(buf[12] for "PIPE_UNEXPORT");
                Ok(Command::PipeUnexport {
                    io_id: IoId::new(buf.get_u64()),
                    oid: Oid::new(buf.get_u32()),
                })
            }
            Tag::PipeNotifyDeadWriter => {
                ensure_size!(buf[8] for "PIPE_NOTIFY_DEAD_WRITER");
                let oid = Oid::new(buf.get_u32());
                let cause_len = buf.get_u32() as usize;
                ensure_size!(buf[cause_len] for "PIPE_NOTIFY_DEAD_WRITER.cause");
                let cause = String::from_utf8(buf.split_to(cause_len).to_vec()).map_err(|_| Error::InvalidPacket {
                    name: "PIPE_NOTIFY_DEAD_WRITER",
                    field: "cause",
                    reason: "not valid UTF-8",
                })?;
                Ok(Command::PipeNotifyDeadWriter { oid, cause })
            }
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn round_trip(cmd: Command) {
        let mut buf = BytesMut::new();
        cmd.encode(&mut buf);
        assert_eq!(buf.len(), cmd.size());
        let decoded = Command::decode(buf.freeze()).expect("decode");
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn user_request_round_trips() {
        round_trip(Command::UserRequest {
            id: RequestId::new(7),
            last_io_id: IoId::new(3),
            class_loader_oid: Oid::new(1),
            serialized_callable: Bytes::from_static(b"payload"),
        });
    }

    #[test]
    fn user_response_round_trips() {
        round_trip(Command::UserResponse {
            id: RequestId::new(7),
            response_io_id: IoId::new(5),
            status: ResponseStatus::Exception,
            serialized_result: Bytes::from_static(b"boom"),
        });
    }

    #[test]
    fn user_response_security_refused_round_trips() {
        round_trip(Command::UserResponse {
            id: RequestId::new(7),
            response_io_id: IoId::new(5),
            status: ResponseStatus::SecurityRefused,
            serialized_result: Bytes::from_static(b"not permitted"),
        });
    }

    #[test]
    fn unknown_response_status_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(Tag::UserResponse as u8);
        buf.put_u64(7);
        buf.put_u64(5);
        buf.put_u8(200);
        buf.put_u32(0);
        let err = Command::decode(buf.freeze()).unwrap_err();
        assert!(matches!(err, Error::InvalidPacket { name: "USER_RESPONSE", .. }));
    }

    #[test]
    fn cancel_round_trips() {
        round_trip(Command::Cancel { id: RequestId::new(42) });
    }

    #[test]
    fn pipe_chunk_round_trips() {
        round_trip(Command::PipeChunk {
            io_id: IoId::new(1),
            oid: Oid::new(2),
            payload: Bytes::from_static(b"hello"),
        });
    }

    #[test]
    fn pipe_ack_round_trips() {
        round_trip(Command::PipeAck {
            oid: Oid::new(2),
            size: 4096,
        });
    }

    #[test]
    fn pipe_eof_flush_unexport_round_trip() {
        round_trip(Command::PipeEof {
            io_id: IoId::new(9),
            oid: Oid::new(2),
        });
        round_trip(Command::PipeFlush {
            io_id: IoId::new(9),
            oid: Oid::new(2),
        });
        round_trip(Command::PipeUnexport {
            io_id: IoId::new(9),
            oid: Oid::new(2),
        });
    }

    #[test]
    fn pipe_notify_dead_writer_round_trips() {
        round_trip(Command::PipeNotifyDeadWriter {
            oid: Oid::new(2),
            cause: "broken pipe".to_owned(),
        });
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(200);
        let err = Command::decode(buf.freeze()).unwrap_err();
        assert!(matches!(err, Error::UnknownCommandTag(200)));
    }
}
