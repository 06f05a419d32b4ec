use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::{Buf as _, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Wraps a duplex stream so every byte written is base64-encoded with
/// newline framing, and every byte read is decoded the same way — the wire
/// encoding `Mode::Text` negotiates. Sits underneath whichever
/// [`crate::codec`] framing (classic or chunked) is in use; neither framing
/// scheme needs to know this translation is happening underneath it.
pub(crate) struct TextModeStream<S> {
    inner: S,
    /// Already-encoded bytes (plus trailing newline) waiting to be written.
    write_queue: BytesMut,
    /// Raw encoded bytes read from `inner`, not yet split on a newline.
    read_raw: BytesMut,
    /// Decoded bytes ready to be handed to the caller.
    read_decoded: BytesMut,
    eof: bool,
}

impl<S> TextModeStream<S> {
    pub(crate) fn new(inner: S) -> Self {
        Self {
            inner,
            write_queue: BytesMut::new(),
            read_raw: BytesMut::new(),
            read_decoded: BytesMut::new(),
            eof: false,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TextModeStream<S> {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let this = self.get_mut();
        let encoded = STANDARD.encode(buf);
        this.write_queue.extend_from_slice(encoded.as_bytes());
        this.write_queue.extend_from_slice(b"\n");
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        while !this.write_queue.is_empty() {
            match Pin::new(&mut this.inner).poll_write(cx, &this.write_queue) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "text mode stream write returned 0",
                    )));
                }
                Poll::Ready(Ok(n)) => this.write_queue.advance(n),
                Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                Poll::Pending => return Poll::Pending,
            }
        }

        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.as_mut().poll_flush(cx) {
            Poll::Ready(Ok(())) => {}
            other => return other,
        }
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TextModeStream<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.read_decoded.is_empty() {
                let take = this.read_decoded.len().min(buf.remaining());
                let chunk = this.read_decoded.split_to(take);
                buf.put_slice(&chunk);
                return Poll::Ready(Ok(()));
            }

            if let Some(pos) = this.read_raw.iter().position(|&b| b == b'\n') {
                let line = this.read_raw.split_to(pos);
                this.read_raw.advance(1); // drop the newline itself
                if !line.is_empty() {
                    let decoded = STANDARD
                        .decode(&line)
                        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
                    this.read_decoded.extend_from_slice(&decoded);
                }
                continue;
            }

            if this.eof {
                if this.read_raw.is_empty() {
                    return Poll::Ready(Ok(()));
                }
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "text mode stream ended mid-line",
                )));
            }

            let mut tmp = [0u8; 8192];
            let mut tmp_buf = ReadBuf::new(&mut tmp);
            match Pin::new(&mut this.inner).poll_read(cx, &mut tmp_buf) {
                Poll::Ready(Ok(())) => {
                    let filled = tmp_buf.filled();
                    if filled.is_empty() {
                        this.eof = true;
                    } else {
                        this.read_raw.extend_from_slice(filled);
                    }
                }
                Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
