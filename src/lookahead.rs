//! Read-ahead wrapper used to inspect a request or response head before
//! deciding who owns the rest of the stream.
//!
//! Bytes pulled into the buffer are never lost: reads drain the buffer first
//! and then fall through to the inner stream, and [`Lookahead::into_parts`]
//! hands the leftover bytes back to the caller.

use bytes::{Bytes, BytesMut};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

const INITIAL_CAPACITY: usize = 4 * 1024;

pub struct Lookahead<S> {
    inner: S,
    buf: BytesMut,
    limit: usize,
}

impl<S: AsyncRead + Unpin> Lookahead<S> {
    pub fn new(inner: S, limit: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_CAPACITY.min(limit)),
            limit,
        }
    }

    /// Unconsumed buffered bytes.
    pub fn buffer(&self) -> &[u8] {
        &self.buf[..]
    }

    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.limit
    }

    pub fn discard(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        let _ = self.buf.split_to(n);
    }

    /// Pulls more bytes from the inner stream, up to the limit.
    /// Returns 0 on EOF or when the buffer is already full.
    pub async fn fill(&mut self) -> io::Result<usize> {
        let room = self.limit.saturating_sub(self.buf.len());
        if room == 0 {
            return Ok(0);
        }
        (&mut self.inner).take(room as u64).read_buf(&mut self.buf).await
    }

    pub fn into_parts(self) -> (Bytes, S) {
        (self.buf.freeze(), self.inner)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Lookahead<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if out.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        if !self.buf.is_empty() {
            let n = self.buf.len().min(out.remaining());
            let chunk = self.buf.split_to(n);
            out.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, out)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Lookahead<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
