//! Process-wide registry of sessions and stream handlers.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Options;
use crate::error::{BoxError, ShutdownError};
use crate::handshake;
use crate::session::{Role, Session, SessionParams};
use crate::stream::Stream;
use crate::transport::Connection;
use crate::{Error, Result};

/// Result returned by a [`Handler`].
pub type HandlerResult = std::result::Result<(), BoxError>;

/// Serves streams opened by peers under a mounted name.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Serve one stream. `ctx` is cancelled once the owning session has
    /// drained. The stream is closed after this returns if the handler did
    /// not close it.
    async fn serve(&self, ctx: CancellationToken, stream: Stream) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(CancellationToken, Stream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn serve(&self, ctx: CancellationToken, stream: Stream) -> HandlerResult {
        self(ctx, stream).await
    }
}

/// View of process-wide state a session needs while dispatching.
pub trait Registry: Send + Sync + 'static {
    /// A live session, other than `exclude`, whose peer advertises `name`.
    fn find_session(&self, name: &str, exclude: Uuid) -> Option<Session>;
    /// Local handler mounted under `name`.
    fn find_handler(&self, name: &str) -> Option<Arc<dyn Handler>>;
    /// Whether inbound streams may be relayed to other sessions.
    fn is_hub_mode(&self) -> bool;
    /// Whether the registry is shutting down.
    fn is_closed(&self) -> bool;
    /// Track a newly opened session.
    fn register_session(&self, session: &Session);
    /// Forget a closed session.
    fn unregister_session(&self, session: &Session);
}

/// The process-wide registry: mounted handlers, live sessions and options.
pub struct Wire {
    options: Arc<Options>,
    handlers: DashMap<String, Arc<dyn Handler>>,
    sessions: DashMap<Uuid, Session>,
    closed: AtomicBool,
}

impl Wire {
    /// Create a registry with validated options.
    pub fn new(options: Options) -> Result<Arc<Self>> {
        options.validate()?;
        Ok(Arc::new(Self {
            options: Arc::new(options),
            handlers: DashMap::new(),
            sessions: DashMap::new(),
            closed: AtomicBool::new(false),
        }))
    }

    /// Shared options.
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Mount `handler` under `name`, replacing any previous handler.
    pub fn mount(&self, name: impl Into<String>, handler: impl Handler) {
        let name = name.into();
        tracing::debug!(stream = %name, "handler mounted");
        self.handlers.insert(name, Arc::new(handler));
    }

    /// Remove the handler mounted under `name`. Returns whether one was
    /// mounted.
    pub fn unmount(&self, name: &str) -> bool {
        self.handlers.remove(name).is_some()
    }

    /// Names of all mounted handlers, sorted.
    pub fn handler_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Look up a live session by id.
    pub fn session(&self, id: Uuid) -> Option<Session> {
        self.sessions.get(&id).map(|e| e.value().clone())
    }

    /// Snapshot of all live sessions.
    pub fn sessions(&self) -> Vec<Session> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    /// Start a session over a connection whose handshake already happened.
    ///
    /// # Errors
    ///
    /// [`Error::WireClosed`] if the registry is shutting down.
    pub fn attach(
        self: &Arc<Self>,
        conn: Arc<dyn Connection>,
        params: SessionParams,
    ) -> Result<Session> {
        if self.is_closed() {
            return Err(Error::WireClosed);
        }
        let registry: Arc<dyn Registry> = self.clone();
        Ok(Session::open(params, conn, registry, self.options.clone()))
    }

    /// Run the init-frame handshake for `role` on a fresh connection, then
    /// attach it. The connection is closed if the handshake fails.
    pub async fn establish(
        self: &Arc<Self>,
        conn: Arc<dyn Connection>,
        role: Role,
    ) -> Result<Session> {
        if self.is_closed() {
            let _ = conn.close().await;
            return Err(Error::WireClosed);
        }

        let names = self.handler_names();
        let handshake = match role {
            Role::Client => handshake::client(conn.as_ref(), &self.options, &names).await,
            Role::Server => handshake::server(conn.as_ref(), &self.options, &names).await,
        };

        match handshake {
            Ok(params) => self.attach(conn, params),
            Err(err) => {
                tracing::debug!(role = ?role, error = %err, "handshake failed");
                let _ = conn.close().await;
                Err(err)
            }
        }
    }

    /// Close every live session concurrently.
    ///
    /// # Errors
    ///
    /// - [`Error::WireClosed`] on a second call.
    /// - [`Error::Shutdown`] listing every session that failed to close.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::WireClosed);
        }

        let sessions = self.sessions();
        tracing::debug!(sessions = sessions.len(), "closing wire");

        let results =
            join_all(sessions.iter().map(|s| async move { (s.id(), s.close().await) })).await;

        let mut errors = ShutdownError::new();
        for (id, result) in results {
            match result {
                Ok(()) | Err(Error::AlreadyClosed) => {}
                Err(err) => errors.add(id, err),
            }
        }
        errors.into_result().map_err(Error::from)
    }
}

impl Registry for Wire {
    fn find_session(&self, name: &str, exclude: Uuid) -> Option<Session> {
        self.sessions
            .iter()
            .find(|e| *e.key() != exclude && !e.value().is_closed() && e.value().advertises(name))
            .map(|e| e.value().clone())
    }

    fn find_handler(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(name).map(|e| e.value().clone())
    }

    fn is_hub_mode(&self) -> bool {
        self.options.hub_mode
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn register_session(&self, session: &Session) {
        self.sessions.insert(session.id(), session.clone());
    }

    fn unregister_session(&self, session: &Session) {
        self.sessions.remove(&session.id());
    }
}

impl std::fmt::Debug for Wire {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wire")
            .field("hub_mode", &self.options.hub_mode)
            .field("handlers", &self.handler_names())
            .field("sessions", &self.sessions.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
