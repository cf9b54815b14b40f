//! Session management: stream acceptance, permission checks, dispatch and
//! graceful shutdown.
//!
//! A [`Session`] owns one peer [`Connection`]. Every sub-stream the peer opens
//! starts with a `perm` frame naming the requested stream and carrying an
//! authentication token. The session verifies the token, resolves the name
//! to a hub target or a local handler, answers with `recv` (or `err`) and
//! then either relays bytes or runs the handler.
//!
//! Closing a session drains it: open streams get `drain_timeout` to finish,
//! the stragglers are force-closed once, then the connection is closed.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Options;
use crate::error::OpError;
use crate::frame::Frame;
use crate::registry::{Handler, Registry};
use crate::stream::Stream;
use crate::transport::{BoxSubStream, Connection};
use crate::{Error, Result};

/// Opaque peer-supplied metadata, fixed for the life of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identification(Vec<u8>);

impl Identification {
    /// Wrap raw identification bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Whether no identification was supplied.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Identification {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&str> for Identification {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

/// Which side of the connection this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Dialed the connection and sent the handshake hello.
    Client,
    /// Accepted the connection and answered the handshake.
    Server,
}

/// Identity handed over by the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    /// Session identifier, shared by both ends.
    pub id: Uuid,
    /// Peer-supplied metadata.
    pub identification: Identification,
    /// Stream names the peer serves.
    pub stream_names: Vec<String>,
    /// Local role.
    pub role: Role,
}

/// One peer connection and the streams multiplexed over it.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    id: Uuid,
    identification: Identification,
    stream_names: Vec<String>,
    role: Role,
    conn: Arc<dyn Connection>,
    registry: Arc<dyn Registry>,
    options: Arc<Options>,
    state: Mutex<State>,
    /// Signalled when the last open stream unregisters.
    drained: Notify,
    /// Cancelled once the session has drained.
    shutdown: CancellationToken,
    next_stream_id: AtomicU64,
}

#[derive(Default)]
struct State {
    closed: bool,
    streams: HashMap<u64, Stream>,
}

enum Route {
    Hub(Session),
    Local(Arc<dyn Handler>),
}

impl Shared {
    /// Track a sub-stream as an open stream. Hands the sub-stream back when
    /// the session is already closed.
    fn register_stream(
        self: &Arc<Self>,
        name: &str,
        sub_stream: BoxSubStream,
    ) -> std::result::Result<Stream, BoxSubStream> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(sub_stream);
        }
        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let stream = Stream::new(id, name, self.id, sub_stream, Arc::downgrade(self));
        state.streams.insert(id, stream.clone());
        Ok(stream)
    }

    pub(crate) fn unregister_stream(&self, id: u64) {
        let mut state = self.state.lock();
        if state.streams.remove(&id).is_some() && state.streams.is_empty() {
            self.drained.notify_waiters();
        }
    }

    fn active_streams(&self) -> usize {
        self.state.lock().streams.len()
    }

    fn open_streams(&self) -> Vec<Stream> {
        self.state.lock().streams.values().cloned().collect()
    }
}

impl Session {
    /// Create a session over an established connection, register it and
    /// start accepting sub-streams.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(
        params: SessionParams,
        conn: Arc<dyn Connection>,
        registry: Arc<dyn Registry>,
        options: Arc<Options>,
    ) -> Self {
        let session = Self {
            shared: Arc::new(Shared {
                id: params.id,
                identification: params.identification,
                stream_names: params.stream_names,
                role: params.role,
                conn,
                registry,
                options,
                state: Mutex::new(State::default()),
                drained: Notify::new(),
                shutdown: CancellationToken::new(),
                next_stream_id: AtomicU64::new(1),
            }),
        };

        session.shared.registry.register_session(&session);
        if let Some(hook) = session.shared.options.hooks.on_session_open.clone() {
            let s = session.clone();
            tokio::spawn(async move { hook(s) });
        }
        tracing::debug!(
            session_id = %session.id(),
            role = ?session.role(),
            streams = ?session.stream_names(),
            "session opened"
        );

        tokio::spawn(session.clone().accept_loop());
        session
    }

    /// Session identifier.
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Peer-supplied metadata.
    pub fn identification(&self) -> &Identification {
        &self.shared.identification
    }

    /// Stream names the peer serves.
    pub fn stream_names(&self) -> &[String] {
        &self.shared.stream_names
    }

    /// Whether the peer advertises `name`.
    pub fn advertises(&self, name: &str) -> bool {
        self.shared.stream_names.iter().any(|n| n == name)
    }

    /// Local role.
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Number of open streams.
    pub fn active_streams(&self) -> usize {
        self.shared.active_streams()
    }

    /// Local endpoint address, if the transport has one.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.conn.local_addr()
    }

    /// Remote endpoint address, if the transport has one.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.conn.remote_addr()
    }

    /// Token cancelled once the session has fully drained.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shared.shutdown.clone()
    }

    fn is_hub(&self) -> bool {
        self.shared.registry.is_hub_mode() && self.shared.role == Role::Server
    }

    /// Open a named stream towards the peer.
    ///
    /// Sends a `perm` frame carrying the configured token and waits for the
    /// peer's answer.
    ///
    /// # Errors
    ///
    /// - [`Error::SessionClosed`] if the session is closed.
    /// - [`Error::StreamNotFound`] / [`Error::Unauthorized`] /
    ///   [`Error::Rejected`] if the peer refused with an `err` frame.
    /// - [`Error::UnexpectedEof`] if the peer answered anything else.
    pub async fn open_stream(&self, name: &str) -> Result<Stream> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }

        let mut sub_stream = self.shared.conn.open_sub_stream().await?;
        if let Err(err) = self.request_permission(&mut sub_stream, name).await {
            let _ = sub_stream.shutdown().await;
            return Err(err);
        }

        self.shared
            .register_stream(name, sub_stream)
            .map_err(|_| Error::SessionClosed)
    }

    async fn request_permission(&self, sub_stream: &mut BoxSubStream, name: &str) -> Result<()> {
        let options = &self.shared.options;
        Frame::perm(name, options.token.clone())
            .write_to(sub_stream)
            .await?;

        let response = Frame::read_limited(sub_stream, options.frame_limits)
            .await?
            .ok_or_else(|| Error::UnexpectedEof(format!("no answer for stream {name}")))?;

        if response.is_err_frame() {
            let (code, detail) = response.into_parts();
            return Err(Error::from_reject(
                &code,
                String::from_utf8_lossy(&detail).into_owned(),
            ));
        }
        if response.command() != name && !response.is_recv_frame() {
            return Err(Error::UnexpectedEof(format!(
                "unexpected {:?} frame {:?} for stream {name}",
                response.frame_type(),
                response.command()
            )));
        }
        Ok(())
    }

    async fn accept_loop(self) {
        loop {
            let sub_stream = match self.shared.conn.accept_sub_stream().await {
                Ok(sub_stream) => sub_stream,
                Err(err) => {
                    tracing::debug!(session_id = %self.id(), error = %err, "accept loop finished");
                    break;
                }
            };

            if self.is_closed() || self.shared.registry.is_closed() {
                drop(sub_stream);
                continue;
            }

            let session = self.clone();
            tokio::spawn(async move { session.dispatch(sub_stream).await });
        }

        match self.close().await {
            Ok(()) | Err(Error::AlreadyClosed) => {}
            Err(err) => {
                tracing::debug!(session_id = %self.id(), error = %err, "close after accept loop")
            }
        }
    }

    async fn dispatch(&self, mut sub_stream: BoxSubStream) {
        let (name, route) = match self.validate(&mut sub_stream).await {
            Ok(validated) => validated,
            Err(err) => {
                tracing::warn!(
                    session_id = %self.id(),
                    code = err.reject_code(),
                    error = %err,
                    "stream rejected"
                );
                reject(&mut sub_stream, &err).await;
                let _ = sub_stream.shutdown().await;
                self.report("validate stream", err);
                return;
            }
        };

        let result = match route {
            Route::Hub(target) => self.serve_hub(&name, target, sub_stream).await,
            Route::Local(handler) => self.serve_local(&name, handler, sub_stream).await,
        };
        if let Err(err) = result {
            self.report("serve stream", err);
        }
    }

    /// Read the permission frame, check its token and resolve its name.
    async fn validate(&self, sub_stream: &mut BoxSubStream) -> Result<(String, Route)> {
        let frame = Frame::read_limited(sub_stream, self.shared.options.frame_limits)
            .await?
            .ok_or_else(|| {
                Error::UnexpectedEof("sub-stream closed before permission frame".into())
            })?;
        if !frame.is_perm_frame() {
            return Err(Error::ProtocolViolation(format!(
                "expected perm frame, got {:?}",
                frame.frame_type()
            )));
        }

        let (name, token) = frame.into_parts();
        if let Some(verifier) = &self.shared.options.verifier {
            verifier.verify(&name, &self.shared.identification, &token)?;
        }
        let route = self.route(&name)?;
        Ok((name, route))
    }

    fn route(&self, name: &str) -> Result<Route> {
        let registry = &self.shared.registry;
        if self.is_hub() {
            if let Some(target) = registry.find_session(name, self.id()) {
                return Ok(Route::Hub(target));
            }
        }
        registry
            .find_handler(name)
            .map(Route::Local)
            .ok_or_else(|| Error::StreamNotFound(name.to_owned()))
    }

    async fn serve_hub(
        &self,
        name: &str,
        target: Session,
        mut sub_stream: BoxSubStream,
    ) -> Result<()> {
        let dst = match target.open_stream(name).await {
            Ok(dst) => dst,
            Err(err) => {
                reject(&mut sub_stream, &err).await;
                let _ = sub_stream.shutdown().await;
                return Err(err);
            }
        };

        let src = match self.accept(name, sub_stream).await {
            Ok(src) => src,
            Err(err) => {
                let _ = dst.close().await;
                return Err(err);
            }
        };

        tracing::debug!(
            session_id = %self.id(),
            target = %target.id(),
            stream = name,
            "relaying stream"
        );
        let result = relay(&src, &dst).await;
        let _ = src.close().await;
        let _ = dst.close().await;
        result
    }

    async fn serve_local(
        &self,
        name: &str,
        handler: Arc<dyn Handler>,
        sub_stream: BoxSubStream,
    ) -> Result<()> {
        let stream = self.accept(name, sub_stream).await?;
        let ctx = self.shared.shutdown.child_token();

        let task_stream = stream.clone();
        let outcome = tokio::spawn(async move { handler.serve(ctx, task_stream).await }).await;

        if !stream.is_closed() {
            let _ = stream.close().await;
        }

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(Error::Handler(err)),
            Err(join_err) if join_err.is_panic() => {
                Err(Error::HandlerPanic(panic_message(join_err.into_panic())))
            }
            Err(join_err) => Err(Error::HandlerPanic(join_err.to_string())),
        }
    }

    /// Register the sub-stream and acknowledge the permission request.
    async fn accept(&self, name: &str, sub_stream: BoxSubStream) -> Result<Stream> {
        let stream = match self.shared.register_stream(name, sub_stream) {
            Ok(stream) => stream,
            Err(mut sub_stream) => {
                let err = Error::SessionClosed;
                reject(&mut sub_stream, &err).await;
                let _ = sub_stream.shutdown().await;
                return Err(err);
            }
        };
        if let Err(err) = stream.write_frame(&Frame::recv(name)).await {
            let _ = stream.close().await;
            return Err(err);
        }
        Ok(stream)
    }

    fn report(&self, op: &'static str, err: Error) {
        let op_err = OpError {
            op,
            err,
            session_id: self.id(),
            identification: self.shared.identification.clone(),
            remote_addr: self.remote_addr(),
            local_addr: self.local_addr(),
        };
        match self.shared.options.hooks.on_error.clone() {
            Some(hook) => {
                tokio::spawn(async move { hook(op_err) });
            }
            None => tracing::error!(
                op = op_err.op,
                session_id = %op_err.session_id,
                remote = ?op_err.remote_addr,
                local = ?op_err.local_addr,
                error = %op_err.err,
                "stream dispatch failed"
            ),
        }
    }

    /// Gracefully close the session.
    ///
    /// Waits up to `drain_timeout` for open streams to finish, force-closes
    /// whatever is left, cancels the shutdown token and closes the
    /// connection. Returns the connection close error, if any.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyClosed`] if the session is already closing or closed.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(Error::AlreadyClosed);
            }
            state.closed = true;
        }
        tracing::debug!(
            session_id = %self.id(),
            active = self.active_streams(),
            "draining session"
        );

        let result = self.drain().await;

        self.shared.registry.unregister_session(self);
        if let Some(hook) = self.shared.options.hooks.on_session_close.clone() {
            let s = self.clone();
            tokio::spawn(async move { hook(s) });
        }
        tracing::debug!(session_id = %self.id(), "session closed");
        result
    }

    async fn drain(&self) -> Result<()> {
        let options = &self.shared.options;
        let deadline = Instant::now() + options.drain_timeout;
        let mut forced = false;

        loop {
            let drained = self.shared.drained.notified();
            let active = self.shared.active_streams();
            if active == 0 {
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                if forced {
                    tracing::warn!(
                        session_id = %self.id(),
                        active,
                        "streams still open after forced close"
                    );
                    break;
                }
                tracing::debug!(
                    session_id = %self.id(),
                    active,
                    "drain timeout, forcing streams closed"
                );
                self.force_close_streams().await;
                forced = true;
                continue;
            }

            let wait = (deadline - now).min(options.drain_poll_interval);
            let _ = tokio::time::timeout(wait, drained).await;
        }

        self.shared.shutdown.cancel();
        if self.shared.conn.is_closed() {
            return Ok(());
        }
        self.shared.conn.close().await
    }

    async fn force_close_streams(&self) {
        let bound = self.shared.options.drain_poll_interval;
        for stream in self.shared.open_streams() {
            let _ = tokio::time::timeout(bound, stream.close()).await;
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("role", &self.shared.role)
            .field("stream_names", &self.shared.stream_names)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wn session: {}", self.shared.id)
    }
}

/// Best-effort `err` frame telling the opener why its request failed.
async fn reject(sub_stream: &mut BoxSubStream, err: &Error) {
    let frame = Frame::err(err.reject_code(), err.to_string());
    if let Err(e) = frame.write_to(sub_stream).await {
        tracing::trace!(error = %e, "could not send rejection");
    }
}

/// Copy bytes both ways until both directions finish or either fails.
///
/// EOF in one direction is forwarded as a half-close to the other side.
async fn relay(a: &Stream, b: &Stream) -> Result<()> {
    let forward = pipe(a, b);
    let backward = pipe(b, a);
    tokio::pin!(forward, backward);

    let mut forward_done = false;
    let mut backward_done = false;
    while !(forward_done && backward_done) {
        tokio::select! {
            res = &mut forward, if !forward_done => {
                res?;
                forward_done = true;
            }
            res = &mut backward, if !backward_done => {
                res?;
                backward_done = true;
            }
        }
    }
    Ok(())
}

async fn pipe(from: &Stream, to: &Stream) -> Result<()> {
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = from.read(&mut buf).await?;
        if n == 0 {
            return to.close_write().await;
        }
        to.write_all(&buf[..n]).await?;
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
