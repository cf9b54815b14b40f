//! Init-frame handshake run on the first sub-stream of a connection.
//!
//! The client sends `init "hello"` with its identification and the stream
//! names it serves; the server answers `init "welcome"` with the session id
//! and its own stream names. Payloads are JSON.

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::config::Options;
use crate::frame::{Frame, FrameType};
use crate::session::{Identification, Role, SessionParams};
use crate::transport::{BoxSubStream, Connection};
use crate::{Error, Result};

/// Command of the client's init frame.
pub const HELLO: &str = "hello";
/// Command of the server's init frame.
pub const WELCOME: &str = "welcome";

#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    identification: Identification,
    stream_names: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Welcome {
    session_id: Uuid,
    stream_names: Vec<String>,
}

/// Client side: announce ourselves and learn the session id.
pub(crate) async fn client(
    conn: &dyn Connection,
    options: &Options,
    local_names: &[String],
) -> Result<SessionParams> {
    let exchange = async {
        let mut sub_stream = conn.open_sub_stream().await?;
        let hello = Hello {
            identification: options.identification.clone(),
            stream_names: local_names.to_vec(),
        };
        init_frame(HELLO, &hello)?.write_to(&mut sub_stream).await?;

        let welcome: Welcome = read_init(&mut sub_stream, options, WELCOME).await?;
        let _ = sub_stream.shutdown().await;

        Ok(SessionParams {
            id: welcome.session_id,
            identification: options.identification.clone(),
            stream_names: welcome.stream_names,
            role: Role::Client,
        })
    };
    with_timeout(options, exchange).await
}

/// Server side: accept the peer's hello and assign a session id.
pub(crate) async fn server(
    conn: &dyn Connection,
    options: &Options,
    local_names: &[String],
) -> Result<SessionParams> {
    let exchange = async {
        let mut sub_stream = conn.accept_sub_stream().await?;
        let hello: Hello = read_init(&mut sub_stream, options, HELLO).await?;

        let welcome = Welcome {
            session_id: Uuid::new_v4(),
            stream_names: local_names.to_vec(),
        };
        init_frame(WELCOME, &welcome)?.write_to(&mut sub_stream).await?;
        let _ = sub_stream.shutdown().await;

        Ok(SessionParams {
            id: welcome.session_id,
            identification: hello.identification,
            stream_names: hello.stream_names,
            role: Role::Server,
        })
    };
    with_timeout(options, exchange).await
}

async fn with_timeout<F>(options: &Options, exchange: F) -> Result<SessionParams>
where
    F: std::future::Future<Output = Result<SessionParams>>,
{
    tokio::time::timeout(options.handshake_timeout, exchange)
        .await
        .map_err(|_| Error::Handshake(format!("timed out after {:?}", options.handshake_timeout)))?
}

fn init_frame<T: Serialize>(command: &str, body: &T) -> Result<Frame> {
    let payload = serde_json::to_vec(body).map_err(|e| Error::Handshake(e.to_string()))?;
    Ok(Frame::new(FrameType::Init, command, payload))
}

async fn read_init<T>(sub_stream: &mut BoxSubStream, options: &Options, expected: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let frame = Frame::read_limited(sub_stream, options.frame_limits)
        .await?
        .ok_or_else(|| Error::Handshake(format!("connection closed before {expected}")))?;

    if frame.is_err_frame() {
        return Err(Error::Handshake(format!(
            "peer refused ({}): {}",
            frame.command(),
            String::from_utf8_lossy(frame.payload())
        )));
    }
    if !frame.is_init_frame() || frame.command() != expected {
        return Err(Error::Handshake(format!(
            "expected init {expected:?}, got {:?} {:?}",
            frame.frame_type(),
            frame.command()
        )));
    }
    serde_json::from_slice(frame.payload()).map_err(|e| Error::Handshake(e.to_string()))
}
