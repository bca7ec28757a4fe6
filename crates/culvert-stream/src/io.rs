// tokio AsyncRead/AsyncWrite bridge: each poll drives a stored future over
// the corresponding bus operation, so the adapter drops into code written
// against ordinary tokio streams.
use crate::BusStream;
use bytes::Bytes;
use futures::future::BoxFuture;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub(crate) type ReadInFlight = BoxFuture<'static, crate::Result<Bytes>>;
pub(crate) type WriteInFlight = BoxFuture<'static, crate::Result<usize>>;
pub(crate) type ShutdownInFlight = BoxFuture<'static, crate::Result<()>>;

impl AsyncRead for BusStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let fut = this.read_in_flight.get_or_insert_with(|| {
            let inner = Arc::clone(&this.inner);
            let len = buf.remaining();
            Box::pin(async move { inner.read_op(len).await })
        });
        match fut.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                this.read_in_flight = None;
                match result {
                    Ok(payload) => {
                        if payload.len() > buf.remaining() {
                            return Poll::Ready(Err(crate::StreamError::MessageTooLong.into()));
                        }
                        buf.put_slice(&payload);
                        Poll::Ready(Ok(()))
                    }
                    Err(err) => Poll::Ready(Err(err.into())),
                }
            }
        }
    }
}

impl AsyncWrite for BusStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let fut = this.write_in_flight.get_or_insert_with(|| {
            let inner = Arc::clone(&this.inner);
            let body = Bytes::copy_from_slice(buf);
            Box::pin(async move { inner.write_op(body).await })
        });
        match fut.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                this.write_in_flight = None;
                Poll::Ready(result.map_err(Into::into))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        // Writes complete only once the proxy has replied; nothing is buffered.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let fut = this.shutdown_in_flight.get_or_insert_with(|| {
            let inner = Arc::clone(&this.inner);
            Box::pin(async move { inner.close_op().await })
        });
        match fut.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                this.shutdown_in_flight = None;
                Poll::Ready(result.map_err(Into::into))
            }
        }
    }
}
