//! In-process connection pair.
//!
//! Each sub-stream is a [`tokio::io::DuplexStream`]; opening one on either
//! end delivers its peer half to the other end's accept queue. Closing either
//! end closes the pair, like tearing down a physical link.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::transport::{BoxSubStream, Connection, SubStream};
use crate::{Error, Result};

/// Buffer size of each in-memory sub-stream, per direction.
pub const DUPLEX_BUFFER: usize = 64 * 1024;

const ACCEPT_BACKLOG: usize = 128;

/// One end of an in-process connection.
#[derive(Debug)]
pub struct MemoryConnection {
    incoming: Mutex<mpsc::Receiver<MemorySubStream>>,
    outgoing: mpsc::Sender<MemorySubStream>,
    closed: CancellationToken,
    // Shared with the peer so ids are unique across both ends.
    next_id: Arc<AtomicU64>,
}

/// Create a connected pair of in-process connections.
pub fn pair() -> (MemoryConnection, MemoryConnection) {
    let (a_tx, a_rx) = mpsc::channel(ACCEPT_BACKLOG);
    let (b_tx, b_rx) = mpsc::channel(ACCEPT_BACKLOG);
    let closed = CancellationToken::new();
    let next_id = Arc::new(AtomicU64::new(1));

    let a = MemoryConnection {
        incoming: Mutex::new(a_rx),
        outgoing: b_tx,
        closed: closed.clone(),
        next_id: next_id.clone(),
    };
    let b = MemoryConnection {
        incoming: Mutex::new(b_rx),
        outgoing: a_tx,
        closed,
        next_id,
    };
    (a, b)
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn accept_sub_stream(&self) -> Result<BoxSubStream> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(Error::Transport("connection closed".into())),
            next = incoming.recv() => match next {
                Some(stream) => Ok(Box::new(stream)),
                None => Err(Error::Transport("connection closed".into())),
            },
        }
    }

    async fn open_sub_stream(&self) -> Result<BoxSubStream> {
        if self.closed.is_cancelled() {
            return Err(Error::Transport("connection closed".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (local, remote) = tokio::io::duplex(DUPLEX_BUFFER);
        let remote = MemorySubStream::new(id, remote, &self.closed);
        self.outgoing
            .send(remote)
            .await
            .map_err(|_| Error::Transport("peer is gone".into()))?;
        Ok(Box::new(MemorySubStream::new(id, local, &self.closed)))
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Sub-stream of a [`MemoryConnection`].
///
/// Buffered bytes stay readable after the connection closes; a read that
/// would block fails instead.
pub struct MemorySubStream {
    id: u64,
    inner: DuplexStream,
    closed: CancellationToken,
    on_close: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl MemorySubStream {
    fn new(id: u64, inner: DuplexStream, closed: &CancellationToken) -> Self {
        Self {
            id,
            inner,
            closed: closed.clone(),
            on_close: Box::pin(closed.clone().cancelled_owned()),
        }
    }

    fn aborted(&self) -> Option<io::Error> {
        self.closed
            .is_cancelled()
            .then(|| io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed"))
    }
}

impl std::fmt::Debug for MemorySubStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySubStream")
            .field("id", &self.id)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

impl SubStream for MemorySubStream {
    fn id(&self) -> u64 {
        self.id
    }
}

impl AsyncRead for MemorySubStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Poll::Ready(res) = Pin::new(&mut self.inner).poll_read(cx, buf) {
            return Poll::Ready(res);
        }
        match self.on_close.as_mut().poll(cx) {
            Poll::Ready(()) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connection closed",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for MemorySubStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if let Some(err) = self.aborted() {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
