// Debug-logging stream wrapper, injected through the pool's dial function.
use crate::{BoxedStream, DialFn};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, trace};

/// Delegating wrapper that logs reads, writes, and shutdowns on a dialed
/// stream. Useful when diagnosing what the proxy actually moves on the wire.
pub struct TracedStream<S> {
    inner: S,
    peer: String,
}

impl<S> TracedStream<S> {
    pub fn new(inner: S, peer: impl Into<String>) -> Self {
        Self {
            inner,
            peer: peer.into(),
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TracedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            trace!(peer = %this.peer, bytes = buf.filled().len() - before, "read");
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TracedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(written)) = &poll {
            trace!(peer = %this.peer, bytes = written, "write");
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_shutdown(cx);
        if let Poll::Ready(Ok(())) = &poll {
            debug!(peer = %this.peer, "closed");
        }
        poll
    }
}

/// Wrap a dial function so every stream it produces is traced.
pub fn traced(dial: DialFn) -> DialFn {
    Arc::new(move |endpoint| {
        let dial = Arc::clone(&dial);
        Box::pin(async move {
            let peer = endpoint.to_string();
            let stream = dial(endpoint).await?;
            debug!(%peer, "dialed");
            Ok(Box::new(TracedStream::new(stream, peer)) as BoxedStream)
        })
    })
}
