//! QUIC transport implementation.
//!
//! Maps each wn sub-stream 1:1 onto a bidirectional QUIC stream. QUIC
//! provides ordering, flow control and encryption, so sub-streams carry
//! frames and payload bytes unchanged.
//!
//! Stream IDs follow RFC 9000 §2.1:
//! - Client streams: 0, 4, 8, 12... (even, bidirectional)
//! - Server streams: 1, 5, 9, 13... (odd, bidirectional)
//!
//! Unidirectional streams are not used and are refused by configuration.

use crate::{Error, Result};
use async_trait::async_trait;
use quinn::{ClientConfig, Endpoint, IdleTimeout, ServerConfig, VarInt};
use std::io;
use std::net::{Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::Notify;
use wn_core::transport::{BoxSubStream, Connection, SubStream};

#[cfg(test)]
mod tests;

/// Application close code sent when a session closes its connection.
pub const CLOSE_CODE_SHUTDOWN: u32 = 0;

/// QUIC transport tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuicConfig {
    /// Maximum concurrent bidirectional streams the peer may open.
    pub max_concurrent_bidi_streams: u32,
    /// Close the connection after this long without traffic.
    pub idle_timeout: Option<Duration>,
    /// Send keep-alives at this interval to hold idle connections open.
    pub keep_alive_interval: Option<Duration>,
    /// Upper bound on how long closing a connection waits for the peer to
    /// acknowledge data on streams that were already finished.
    pub close_linger: Duration,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            max_concurrent_bidi_streams: 100,
            idle_timeout: Some(Duration::from_secs(30)),
            keep_alive_interval: Some(Duration::from_secs(10)),
            close_linger: Duration::from_secs(2),
        }
    }
}

impl QuicConfig {
    fn transport(&self) -> Result<quinn::TransportConfig> {
        let mut transport = quinn::TransportConfig::default();
        transport.max_concurrent_bidi_streams(VarInt::from_u32(self.max_concurrent_bidi_streams));
        transport.max_concurrent_uni_streams(VarInt::from_u32(0));
        let idle = self
            .idle_timeout
            .map(IdleTimeout::try_from)
            .transpose()
            .map_err(|e| Error::Config(format!("idle timeout out of range: {}", e)))?;
        transport.max_idle_timeout(idle);
        transport.keep_alive_interval(self.keep_alive_interval);
        Ok(transport)
    }
}

/// QUIC transport endpoint (client or server).
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use wn_core::{Options, Role, Wire};
/// use wn_transport::quic::QuicEndpoint;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let wire = Wire::new(Options::default())?;
///
/// // Server
/// let server = QuicEndpoint::server("127.0.0.1:4433").await?;
/// let conn = server.accept().await?;
/// let session = wire.establish(Arc::new(conn), Role::Server).await?;
///
/// // Client
/// let client = QuicEndpoint::client()?;
/// let conn = client.connect("127.0.0.1:4433", "localhost").await?;
/// let session = wire.establish(Arc::new(conn), Role::Client).await?;
/// # Ok(())
/// # }
/// ```
pub struct QuicEndpoint {
    endpoint: Endpoint,
    mode: EndpointMode,
    close_linger: Duration,
}

/// Endpoint mode (client or server).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndpointMode {
    Client,
    Server,
}

impl QuicEndpoint {
    /// Create a client endpoint with default tuning.
    ///
    /// # Errors
    ///
    /// Returns error if endpoint creation fails.
    pub fn client() -> Result<Self> {
        Self::client_with_config(&QuicConfig::default())
    }

    /// Create a client endpoint.
    ///
    /// # Errors
    ///
    /// Returns error if endpoint creation fails.
    pub fn client_with_config(config: &QuicConfig) -> Result<Self> {
        let bind = SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0));
        let mut endpoint = Endpoint::client(bind).map_err(|e| {
            Error::ConnectionFailed(format!("Failed to create client endpoint: {}", e))
        })?;

        let crypto = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipVerification))
            .with_no_client_auth();

        let mut client_config = ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
                .map_err(|e| Error::ConnectionFailed(format!("Crypto config error: {}", e)))?,
        ));
        client_config.transport_config(Arc::new(config.transport()?));

        endpoint.set_default_client_config(client_config);

        Ok(Self {
            endpoint,
            mode: EndpointMode::Client,
            close_linger: config.close_linger,
        })
    }

    /// Create a server endpoint with default tuning.
    ///
    /// # Errors
    ///
    /// Returns error if endpoint creation or binding fails.
    pub async fn server(addr: &str) -> Result<Self> {
        Self::server_with_config(addr, &QuicConfig::default()).await
    }

    /// Create a server endpoint bound to `addr` (e.g. `"0.0.0.0:4433"`).
    ///
    /// Uses a freshly generated self-signed certificate for `localhost`.
    ///
    /// # Errors
    ///
    /// Returns error if endpoint creation or binding fails.
    pub async fn server_with_config(addr: &str, config: &QuicConfig) -> Result<Self> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| Error::ConnectionFailed(format!("Invalid address: {}", e)))?;

        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).map_err(|e| {
            Error::ConnectionFailed(format!("Certificate generation failed: {}", e))
        })?;
        let cert_der = cert.cert.der().to_vec();
        let priv_key = cert.key_pair.serialize_der();

        let cert_chain = vec![rustls::pki_types::CertificateDer::from(cert_der)];
        let priv_key = rustls::pki_types::PrivatePkcs8KeyDer::from(priv_key);

        let mut server_crypto = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, priv_key.into())
            .map_err(|e| Error::ConnectionFailed(format!("Certificate error: {}", e)))?;
        server_crypto.max_early_data_size = 0;

        let mut server_config = ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
                .map_err(|e| Error::ConnectionFailed(format!("Crypto config error: {}", e)))?,
        ));
        server_config.transport_config(Arc::new(config.transport()?));

        let endpoint = Endpoint::server(server_config, addr)
            .map_err(|e| Error::ConnectionFailed(format!("Server bind failed: {}", e)))?;

        Ok(Self {
            endpoint,
            mode: EndpointMode::Server,
            close_linger: config.close_linger,
        })
    }

    /// Get the local address this endpoint is bound to.
    ///
    /// # Errors
    ///
    /// Returns error if the socket address cannot be queried.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint
            .local_addr()
            .map_err(|e| Error::ConnectionFailed(format!("No local address: {}", e)))
    }

    /// Connect to a remote server (client only).
    ///
    /// # Arguments
    ///
    /// * `addr` - Remote server address (e.g., "192.168.1.100:4433")
    /// * `server_name` - Server name presented in the TLS handshake
    ///
    /// # Errors
    ///
    /// Returns error if not a client or the connection fails.
    pub async fn connect(&self, addr: &str, server_name: &str) -> Result<QuicConnection> {
        if self.mode != EndpointMode::Client {
            return Err(Error::ConnectionFailed("Only client can connect".into()));
        }

        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| Error::ConnectionFailed(format!("Invalid address: {}", e)))?;

        let connecting = self
            .endpoint
            .connect(addr, server_name)
            .map_err(|e| Error::ConnectionFailed(format!("Connect failed: {}", e)))?;

        let connection = connecting
            .await
            .map_err(|e| Error::ConnectionFailed(format!("Connection handshake failed: {}", e)))?;

        tracing::debug!(remote = %connection.remote_address(), "quic connection established");
        Ok(QuicConnection::new(self.endpoint.clone(), connection, self.close_linger))
    }

    /// Accept an incoming connection (server only).
    ///
    /// # Errors
    ///
    /// Returns error if not a server or connection acceptance fails.
    pub async fn accept(&self) -> Result<QuicConnection> {
        if self.mode != EndpointMode::Server {
            return Err(Error::ConnectionFailed("Only server can accept".into()));
        }

        let incoming = self
            .endpoint
            .accept()
            .await
            .ok_or_else(|| Error::ConnectionFailed("Endpoint closed".into()))?;

        let connection = incoming
            .await
            .map_err(|e| Error::ConnectionFailed(format!("Connection handshake failed: {}", e)))?;

        tracing::debug!(remote = %connection.remote_address(), "quic connection accepted");
        Ok(QuicConnection::new(self.endpoint.clone(), connection, self.close_linger))
    }

    /// Close the endpoint and all connections.
    pub fn close(&self) {
        self.endpoint
            .close(VarInt::from_u32(CLOSE_CODE_SHUTDOWN), b"shutdown");
    }
}

/// One QUIC connection, usable as a session's [`Connection`].
pub struct QuicConnection {
    // Keeps the endpoint driver alive for as long as the connection is used.
    endpoint: Endpoint,
    connection: quinn::Connection,
    finishing: Arc<Finishing>,
    close_linger: Duration,
}

impl QuicConnection {
    fn new(endpoint: Endpoint, connection: quinn::Connection, close_linger: Duration) -> Self {
        Self {
            endpoint,
            connection,
            finishing: Arc::new(Finishing::default()),
            close_linger,
        }
    }

    fn stream(&self, send: quinn::SendStream, recv: quinn::RecvStream) -> QuicStream {
        let stream_id = u64::from(send.id());
        QuicStream {
            stream_id,
            send: Some(send),
            recv,
            finishing: self.finishing.clone(),
        }
    }

    /// Open a new bidirectional stream.
    ///
    /// The peer only learns about the stream once data is written on it.
    ///
    /// # Errors
    ///
    /// Returns error if stream opening fails.
    pub async fn open_stream(&self) -> Result<QuicStream> {
        let (send, recv) = self
            .connection
            .open_bi()
            .await
            .map_err(|e| Error::ConnectionFailed(format!("Failed to open stream: {}", e)))?;

        Ok(self.stream(send, recv))
    }

    /// Accept the next bidirectional stream opened by the peer.
    ///
    /// # Errors
    ///
    /// Returns error if the connection has ended.
    pub async fn accept_stream(&self) -> Result<QuicStream> {
        let (send, recv) = self
            .connection
            .accept_bi()
            .await
            .map_err(|e| Error::ConnectionFailed(format!("Failed to accept stream: {}", e)))?;

        Ok(self.stream(send, recv))
    }

    /// Remote peer address.
    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }
}

#[async_trait]
impl Connection for QuicConnection {
    async fn accept_sub_stream(&self) -> wn_core::Result<BoxSubStream> {
        let stream = self.accept_stream().await.map_err(into_core)?;
        Ok(Box::new(stream))
    }

    async fn open_sub_stream(&self) -> wn_core::Result<BoxSubStream> {
        let stream = self.open_stream().await.map_err(into_core)?;
        Ok(Box::new(stream))
    }

    async fn close(&self) -> wn_core::Result<()> {
        // Closing discards unacknowledged stream data, including data on
        // streams that were already finished.
        if !self.finishing.wait_idle(self.close_linger).await {
            tracing::warn!(
                remote = %self.connection.remote_address(),
                pending = self.finishing.pending(),
                "closing with unacknowledged stream data"
            );
        }
        self.connection
            .close(VarInt::from_u32(CLOSE_CODE_SHUTDOWN), b"session closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.connection.close_reason().is_some()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.local_addr().ok()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.connection.remote_address())
    }
}

fn into_core(err: Error) -> wn_core::Error {
    match err {
        Error::Protocol(err) => err,
        Error::Io(err) => wn_core::Error::Io(err),
        other => wn_core::Error::Transport(other.to_string()),
    }
}

/// Send halves that were finished but whose data the peer has not yet
/// acknowledged.
#[derive(Debug, Default)]
struct Finishing {
    pending: AtomicUsize,
    idle: Notify,
}

impl Finishing {
    fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Hold `send` until the peer acknowledges everything written on it.
    fn track(self: &Arc<Self>, send: quinn::SendStream) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        let finishing = self.clone();
        tokio::spawn(async move {
            // Errors mean the peer stopped the stream or the connection is
            // gone; either way nothing is left to deliver.
            let _ = send.stopped().await;
            drop(send);
            if finishing.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                finishing.idle.notify_waiters();
            }
        });
    }

    /// Wait up to `limit` for every tracked send half to be acknowledged.
    /// Returns `false` if the limit ran out first.
    async fn wait_idle(&self, limit: Duration) -> bool {
        let drained = async {
            loop {
                let idle = self.idle.notified();
                if self.pending() == 0 {
                    return;
                }
                idle.await;
            }
        };
        tokio::time::timeout(limit, drained).await.is_ok()
    }
}

/// One bidirectional QUIC stream.
///
/// Shutting down the write half sends FIN. The finished send half is then
/// held by the connection until the peer acknowledges its data, so closing
/// the connection does not discard it. Dropping the stream without a
/// shutdown releases both directions.
pub struct QuicStream {
    stream_id: u64,
    send: Option<quinn::SendStream>,
    recv: quinn::RecvStream,
    finishing: Arc<Finishing>,
}

impl QuicStream {
    /// Get stream ID (the QUIC stream ID).
    pub fn id(&self) -> u64 {
        self.stream_id
    }
}

impl SubStream for QuicStream {
    fn id(&self) -> u64 {
        self.stream_id
    }
}

impl AsyncRead for QuicStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        AsyncRead::poll_read(Pin::new(&mut self.recv), cx, buf)
    }
}

impl AsyncWrite for QuicStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.send.as_mut() {
            Some(send) => AsyncWrite::poll_write(Pin::new(send), cx, buf),
            None => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.send.as_mut() {
            Some(send) => AsyncWrite::poll_flush(Pin::new(send), cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let Some(send) = self.send.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        ready!(AsyncWrite::poll_shutdown(Pin::new(send), cx))?;
        if let Some(send) = self.send.take() {
            self.finishing.track(send);
        }
        Poll::Ready(Ok(()))
    }
}

/// Skip certificate verification for development.
///
/// **WARNING:** This is insecure. Authenticate peers with the permission
/// token, or replace this with real certificate verification.
#[derive(Debug)]
struct SkipVerification;

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> core::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> core::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> core::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
