//! Process-wide options shared by every session of a [`Wire`](crate::Wire).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::OpError;
use crate::frame::FrameLimits;
use crate::session::{Identification, Session};
use crate::{Error, Result};

/// Default grace period granted to open streams when a session closes.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Default upper bound between two active-stream checks while draining.
pub const DEFAULT_DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(300);

/// Default time allowed for the init-frame handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Validates the token carried by a permission frame.
pub trait TokenVerifier: Send + Sync + 'static {
    /// Accept or reject a request to open `stream_name` from a peer
    /// identified by `identification`.
    fn verify(
        &self,
        stream_name: &str,
        identification: &Identification,
        token: &[u8],
    ) -> Result<()>;
}

impl<F> TokenVerifier for F
where
    F: Fn(&str, &Identification, &[u8]) -> Result<()> + Send + Sync + 'static,
{
    fn verify(
        &self,
        stream_name: &str,
        identification: &Identification,
        token: &[u8],
    ) -> Result<()> {
        self(stream_name, identification, token)
    }
}

/// Callback receiving structured operation errors.
pub type ErrorHook = Arc<dyn Fn(OpError) + Send + Sync>;

/// Callback receiving a session on open or close.
pub type SessionHook = Arc<dyn Fn(Session) + Send + Sync>;

/// Lifecycle callbacks. Each runs on its own task and never blocks dispatch.
#[derive(Clone, Default)]
pub struct Hooks {
    /// Called for every failed dispatch. When unset, errors are logged.
    pub on_error: Option<ErrorHook>,
    /// Called once a session is registered.
    pub on_session_open: Option<SessionHook>,
    /// Called once a session has drained and been unregistered.
    pub on_session_close: Option<SessionHook>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_error", &self.on_error.is_some())
            .field("on_session_open", &self.on_session_open.is_some())
            .field("on_session_close", &self.on_session_close.is_some())
            .finish()
    }
}

/// Wire configuration.
#[derive(Clone)]
pub struct Options {
    /// Token sent with every outbound permission frame.
    pub token: Vec<u8>,
    /// Identification sent to servers during the handshake.
    pub identification: Identification,
    /// Verifier applied to inbound permission frames.
    pub verifier: Option<Arc<dyn TokenVerifier>>,
    /// Lifecycle callbacks.
    pub hooks: Hooks,
    /// Relay inbound streams to other sessions advertising the same name.
    pub hub_mode: bool,
    /// Grace period for open streams when a session closes.
    pub drain_timeout: Duration,
    /// Upper bound between two active-stream checks while draining.
    pub drain_poll_interval: Duration,
    /// Time allowed for the init-frame handshake.
    pub handshake_timeout: Duration,
    /// Limits applied when decoding control frames from peers.
    pub frame_limits: FrameLimits,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            token: Vec::new(),
            identification: Identification::default(),
            verifier: None,
            hooks: Hooks::default(),
            hub_mode: false,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            drain_poll_interval: DEFAULT_DRAIN_POLL_INTERVAL,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            frame_limits: FrameLimits::default(),
        }
    }
}

impl Options {
    /// Options for a hub process.
    pub fn hub() -> Self {
        Self {
            hub_mode: true,
            ..Self::default()
        }
    }

    /// Set the token sent with outbound permission frames.
    pub fn with_token(mut self, token: impl Into<Vec<u8>>) -> Self {
        self.token = token.into();
        self
    }

    /// Set the identification sent during the handshake.
    pub fn with_identification(mut self, identification: impl Into<Identification>) -> Self {
        self.identification = identification.into();
        self
    }

    /// Install a token verifier.
    pub fn with_verifier(mut self, verifier: impl TokenVerifier) -> Self {
        self.verifier = Some(Arc::new(verifier));
        self
    }

    /// Install the error hook.
    pub fn with_error_hook(mut self, hook: impl Fn(OpError) + Send + Sync + 'static) -> Self {
        self.hooks.on_error = Some(Arc::new(hook));
        self
    }

    /// Install the session-open hook.
    pub fn with_session_open_hook(
        mut self,
        hook: impl Fn(Session) + Send + Sync + 'static,
    ) -> Self {
        self.hooks.on_session_open = Some(Arc::new(hook));
        self
    }

    /// Install the session-close hook.
    pub fn with_session_close_hook(
        mut self,
        hook: impl Fn(Session) + Send + Sync + 'static,
    ) -> Self {
        self.hooks.on_session_close = Some(Arc::new(hook));
        self
    }

    /// Set the drain grace period.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Check option values for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.drain_poll_interval.is_zero() {
            return Err(Error::Config("drain_poll_interval must be non-zero".into()));
        }
        if self.handshake_timeout.is_zero() {
            return Err(Error::Config("handshake_timeout must be non-zero".into()));
        }
        if self.frame_limits.max_command_len == 0 {
            return Err(Error::Config("max_command_len must be non-zero".into()));
        }
        if self.token.len() > self.frame_limits.max_payload_len {
            return Err(Error::Config(format!(
                "token length {} exceeds max_payload_len {}",
                self.token.len(),
                self.frame_limits.max_payload_len
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("token", &format_args!("<{} bytes>", self.token.len()))
            .field("identification", &self.identification)
            .field("verifier", &self.verifier.is_some())
            .field("hooks", &self.hooks)
            .field("hub_mode", &self.hub_mode)
            .field("drain_timeout", &self.drain_timeout)
            .field("drain_poll_interval", &self.drain_poll_interval)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("frame_limits", &self.frame_limits)
            .finish()
    }
}
