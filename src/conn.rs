//! Connection wrappers for non-destructive protocol sniffing.
//!
//! [`LookAhead`] buffers bytes from a stream without consuming them, so
//! the sniffer can classify a connection the downstream handler still
//! needs byte-for-byte. [`Replay`] reinstates those bytes at the front
//! of the stream handed to whichever handler wins the dispatch.

use bytes::{Buf, BytesMut};
use pin_project::pin_project;
use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Look-ahead reader over an unclassified stream.
///
/// Everything read from the underlying stream lands in an internal
/// buffer and stays there; callers only ever peek.
#[derive(Debug)]
pub struct LookAhead<R> {
    inner: R,
    buf: BytesMut,
}

impl<R> LookAhead<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(1024),
        }
    }

    /// Returns the buffered bytes, reading from the underlying stream
    /// until at least `n` are available. Consumes nothing. Fails with
    /// [`io::ErrorKind::UnexpectedEof`] if the stream ends short of `n`.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        while self.buf.len() < n {
            let read = self.inner.read_buf(&mut self.buf).await?;
            if read == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }

        Ok(&self.buf)
    }

    /// Everything buffered so far.
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Hands back the underlying stream together with the buffered
    /// bytes, ready to be reinstated via [`Replay`].
    pub fn into_parts(self) -> (R, BytesMut) {
        (self.inner, self.buf)
    }
}

/// Stream wrapper that replays peeked bytes before passing reads
/// through.
///
/// Reads drain the peeked buffer first; once empty it is gone for good
/// and every subsequent read goes straight to the underlying stream.
/// Writes, flush and shutdown pass through unconditionally.
#[pin_project]
#[derive(Debug)]
pub struct Replay<C> {
    peeked: BytesMut,
    #[pin]
    inner: C,
}

impl<C> Replay<C> {
    pub fn new(peeked: BytesMut, inner: C) -> Self {
        Self { peeked, inner }
    }
}

impl<C> AsyncRead for Replay<C>
where
    C: AsyncRead,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        if !this.peeked.is_empty() {
            let n = this.peeked.len().min(buf.remaining());
            buf.put_slice(&this.peeked[..n]);
            this.peeked.advance(n);
            return Poll::Ready(Ok(()));
        }

        this.inner.poll_read(cx, buf)
    }
}

impl<C> AsyncWrite for Replay<C>
where
    C: AsyncWrite,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}
