//! Unit tests for QUIC transport.

use super::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

// Install default crypto provider for tests
fn setup() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

async fn connected_pair() -> (QuicConnection, QuicConnection) {
    setup();
    let server = QuicEndpoint::server("127.0.0.1:0")
        .await
        .expect("Server creation failed");
    let addr = server
        .endpoint
        .local_addr()
        .expect("Failed to get server address");

    let client = QuicEndpoint::client().expect("Client creation failed");
    let server_task = tokio::spawn(async move { server.accept().await });

    let client_conn = client
        .connect(&addr.to_string(), "localhost")
        .await
        .expect("Client connection failed");
    let server_conn = server_task
        .await
        .expect("Server task panicked")
        .expect("Server accept failed");
    (client_conn, server_conn)
}

#[tokio::test]
async fn test_quic_endpoint_client_creation() {
    setup();
    let client = QuicEndpoint::client();
    assert!(client.is_ok(), "Client endpoint creation should succeed");
}

#[tokio::test]
async fn test_quic_endpoint_server_creation() {
    setup();
    let server = QuicEndpoint::server("127.0.0.1:0").await;
    assert!(server.is_ok(), "Server endpoint creation should succeed");
}

#[tokio::test]
async fn test_invalid_address_rejected() {
    setup();
    let server = QuicEndpoint::server("not-an-address").await;
    assert!(matches!(server, Err(Error::ConnectionFailed(_))));
}

#[tokio::test]
async fn test_role_checks() {
    setup();
    let client = QuicEndpoint::client().expect("Client creation failed");
    assert!(client.accept().await.is_err(), "Client cannot accept");

    let server = QuicEndpoint::server("127.0.0.1:0")
        .await
        .expect("Server creation failed");
    assert!(
        server.connect("127.0.0.1:1", "localhost").await.is_err(),
        "Server cannot connect"
    );
}

#[test]
fn test_config_rejects_huge_idle_timeout() {
    let config = QuicConfig {
        idle_timeout: Some(Duration::from_secs(u64::MAX / 2)),
        ..QuicConfig::default()
    };
    assert!(matches!(config.transport(), Err(Error::Config(_))));
    assert!(QuicConfig::default().transport().is_ok());
}

#[tokio::test]
async fn test_stream_id_allocation() {
    let (client_conn, server_conn) = connected_pair().await;

    let mut client_stream = client_conn
        .open_stream()
        .await
        .expect("Client open stream failed");
    // The peer sees the stream only after the first write.
    client_stream.write_all(b"x").await.unwrap();
    let server_stream = server_conn
        .accept_stream()
        .await
        .expect("Server accept stream failed");

    assert_eq!(client_stream.id() % 2, 0, "Client stream should have even ID");
    assert_eq!(server_stream.id(), client_stream.id());

    let server_opened = server_conn
        .open_stream()
        .await
        .expect("Server open stream failed");
    assert_eq!(server_opened.id() % 2, 1, "Server stream should have odd ID");
}

#[tokio::test]
async fn test_sub_stream_roundtrip() {
    let (client_conn, server_conn) = connected_pair().await;

    let mut outbound = client_conn.open_sub_stream().await.unwrap();
    outbound.write_all(b"hello").await.unwrap();
    outbound.shutdown().await.unwrap();

    let mut inbound = server_conn.accept_sub_stream().await.unwrap();
    let mut received = Vec::new();
    inbound.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, b"hello");

    inbound.write_all(b"world").await.unwrap();
    inbound.shutdown().await.unwrap();
    let mut reply = Vec::new();
    outbound.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"world");
}

#[tokio::test]
async fn test_close_marks_connection_closed() {
    let (client_conn, server_conn) = connected_pair().await;
    assert!(!client_conn.is_closed());
    assert!(client_conn.remote_addr().is_some());
    assert!(client_conn.local_addr().is_some());

    Connection::close(&client_conn).await.unwrap();
    assert!(client_conn.is_closed());
    assert!(server_conn.accept_sub_stream().await.is_err());
}

#[tokio::test]
async fn test_close_waits_for_finished_data() {
    let (client_conn, server_conn) = connected_pair().await;
    let len = 512 * 1024;

    let reader = tokio::spawn(async move {
        let mut inbound = client_conn.accept_sub_stream().await?;
        let mut received = Vec::new();
        inbound.read_to_end(&mut received).await?;
        Ok::<_, Box<dyn std::error::Error + Send + Sync>>(received)
    });

    let mut outbound = server_conn.open_sub_stream().await.unwrap();
    outbound.write_all(&vec![1u8; len]).await.unwrap();
    outbound.shutdown().await.unwrap();
    // Writing after the finish is refused.
    assert!(outbound.write_all(b"late").await.is_err());

    Connection::close(&server_conn).await.unwrap();
    assert_eq!(server_conn.finishing.pending(), 0);

    let received = reader
        .await
        .expect("Reader task panicked")
        .expect("Reader failed");
    assert_eq!(received.len(), len);
}
