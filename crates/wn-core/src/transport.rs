//! Seam between sessions and the underlying multiplexing transport.
//!
//! A [`Connection`] is one physical peer connection that already provides
//! reliable, ordered, independently closable sub-streams. Backends live in
//! `wn-transport` (QUIC) and [`crate::memory`] (in-process).

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::Result;

/// One bidirectional sub-stream of a [`Connection`].
///
/// Dropping the sub-stream releases it; `poll_shutdown` finishes the send
/// side.
pub trait SubStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Transport-assigned identifier, unique within the connection.
    fn id(&self) -> u64;
}

/// Owned, type-erased sub-stream.
pub type BoxSubStream = Box<dyn SubStream>;

/// A multiplexed peer connection.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Wait for the next sub-stream opened by the peer.
    ///
    /// Fails once the connection has ended.
    async fn accept_sub_stream(&self) -> Result<BoxSubStream>;

    /// Open a new sub-stream towards the peer.
    async fn open_sub_stream(&self) -> Result<BoxSubStream>;

    /// Close the whole connection, aborting every sub-stream.
    async fn close(&self) -> Result<()>;

    /// Whether the connection has been closed by either side.
    fn is_closed(&self) -> bool;

    /// Local endpoint address, if meaningful for this transport.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Remote endpoint address, if meaningful for this transport.
    fn remote_addr(&self) -> Option<SocketAddr>;
}
