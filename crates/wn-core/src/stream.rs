//! Named logical streams.
//!
//! A [`Stream`] wraps one accepted or opened sub-stream after its permission
//! frame has been exchanged. Reads and writes may run concurrently from
//! different tasks; [`Stream::close`] aborts both and is idempotent.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::frame::Frame;
use crate::session::Shared;
use crate::transport::BoxSubStream;
use crate::{Error, Result};

/// A named stream within a session.
///
/// Cloning yields another handle to the same stream.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    id: u64,
    name: String,
    session_id: Uuid,
    reader: Mutex<Option<ReadHalf<BoxSubStream>>>,
    writer: Mutex<Option<WriteHalf<BoxSubStream>>>,
    closed: AtomicBool,
    /// Cancelled on close so pending reads and writes return promptly.
    abort: CancellationToken,
    session: Weak<Shared>,
}

impl Stream {
    pub(crate) fn new(
        id: u64,
        name: impl Into<String>,
        session_id: Uuid,
        sub_stream: BoxSubStream,
        session: Weak<Shared>,
    ) -> Self {
        let (reader, writer) = tokio::io::split(sub_stream);
        Self {
            inner: Arc::new(StreamInner {
                id,
                name: name.into(),
                session_id,
                reader: Mutex::new(Some(reader)),
                writer: Mutex::new(Some(writer)),
                closed: AtomicBool::new(false),
                abort: CancellationToken::new(),
                session,
            }),
        }
    }

    /// Stream identifier, unique within its session.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Name the stream was requested with.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Identifier of the owning session.
    pub fn session_id(&self) -> Uuid {
        self.inner.session_id
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Read up to `buf.len()` bytes. Returns `0` once the peer finished
    /// sending.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut guard = self.inner.reader.lock().await;
        let reader = guard.as_mut().ok_or(Error::StreamClosed)?;
        tokio::select! {
            _ = self.inner.abort.cancelled() => Err(Error::StreamClosed),
            n = reader.read(buf) => Ok(n?),
        }
    }

    /// Read exactly `buf.len()` bytes.
    pub async fn read_exact(&self, buf: &mut [u8]) -> Result<()> {
        let mut guard = self.inner.reader.lock().await;
        let reader = guard.as_mut().ok_or(Error::StreamClosed)?;
        tokio::select! {
            _ = self.inner.abort.cancelled() => Err(Error::StreamClosed),
            res = reader.read_exact(buf) => res.map(|_| ()).map_err(Error::from),
        }
    }

    /// Read until the peer finishes sending, appending to `buf`.
    pub async fn read_to_end(&self, buf: &mut Vec<u8>) -> Result<usize> {
        let mut guard = self.inner.reader.lock().await;
        let reader = guard.as_mut().ok_or(Error::StreamClosed)?;
        tokio::select! {
            _ = self.inner.abort.cancelled() => Err(Error::StreamClosed),
            n = reader.read_to_end(buf) => Ok(n?),
        }
    }

    /// Write the whole buffer.
    pub async fn write_all(&self, buf: &[u8]) -> Result<()> {
        let mut guard = self.inner.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::StreamClosed)?;
        tokio::select! {
            _ = self.inner.abort.cancelled() => Err(Error::StreamClosed),
            res = writer.write_all(buf) => Ok(res?),
        }
    }

    /// Flush buffered writes.
    pub async fn flush(&self) -> Result<()> {
        let mut guard = self.inner.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::StreamClosed)?;
        tokio::select! {
            _ = self.inner.abort.cancelled() => Err(Error::StreamClosed),
            res = writer.flush() => Ok(res?),
        }
    }

    pub(crate) async fn write_frame(&self, frame: &Frame) -> Result<()> {
        let mut guard = self.inner.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::StreamClosed)?;
        frame.write_to(writer).await
    }

    /// Finish the sending direction. The peer reads EOF; reading from this
    /// side stays possible.
    pub async fn close_write(&self) -> Result<()> {
        let writer = self.inner.writer.lock().await.take();
        match writer {
            Some(mut writer) => Ok(writer.shutdown().await?),
            None => Err(Error::StreamClosed),
        }
    }

    /// Close the stream and release its sub-stream.
    ///
    /// Pending reads and writes on other handles fail with
    /// [`Error::StreamClosed`]. Calling it again is a no-op.
    ///
    /// The stream leaves its session once this future completes or is
    /// dropped, whichever comes first.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _unregister = Unregister(&self.inner);
        self.inner.abort.cancel();

        let writer = self.inner.writer.lock().await.take();
        let mut result = Ok(());
        if let Some(mut writer) = writer {
            // A reset peer makes shutdown fail; the sub-stream is released either way.
            if let Err(e) = writer.shutdown().await {
                result = Err(Error::Io(e));
            }
        }
        drop(self.inner.reader.lock().await.take());

        tracing::trace!(
            session_id = %self.inner.session_id,
            stream = %self.inner.name,
            id = self.inner.id,
            "stream closed"
        );
        result
    }
}

/// Removes the stream from its session when dropped.
struct Unregister<'a>(&'a StreamInner);

impl Drop for Unregister<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.0.session.upgrade() {
            session.unregister_stream(self.0.id);
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("session_id", &self.inner.session_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
