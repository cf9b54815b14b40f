//! Error types for protocol and session operations.

use std::fmt;
use std::net::SocketAddr;

use thiserror::Error;
use uuid::Uuid;

use crate::session::Identification;

/// Result type alias for protocol operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Boxed error returned by stream handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Protocol and session errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed frame (unknown type tag, bad UTF-8, oversized field).
    #[error("Invalid frame format: {0}")]
    InvalidFrame(String),

    /// The stream ended before a complete frame was read.
    #[error("Insufficient data: need {0} bytes")]
    InsufficientData(usize),

    /// The peer answered a permission request with something other than an
    /// acknowledgment, or closed the sub-stream without answering.
    #[error("Unexpected EOF: {0}")]
    UnexpectedEof(String),

    /// Protocol violation that is not tied to a single frame.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Neither a hub target nor a local handler serves this stream name.
    #[error("Stream handler not found: {0}")]
    StreamNotFound(String),

    /// No live session advertises this stream name.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// The token verifier rejected a permission request.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The peer rejected a permission request with an error code this
    /// side does not map to a more specific variant.
    #[error("Rejected by peer ({code}): {detail}")]
    Rejected {
        /// Error code carried in the `err` frame command.
        code: String,
        /// Detail message carried in the `err` frame payload.
        detail: String,
    },

    /// Operation on a session that has been closed.
    #[error("Session closed")]
    SessionClosed,

    /// `close` called on a session that is already closing or closed.
    #[error("Session already closed")]
    AlreadyClosed,

    /// Read or write on a closed stream.
    #[error("Stream closed")]
    StreamClosed,

    /// The process-wide registry is shutting down.
    #[error("Wire closed")]
    WireClosed,

    /// A local handler returned an error.
    #[error("Handler failed: {0}")]
    Handler(BoxError),

    /// A local handler panicked.
    #[error("Handler panicked: {0}")]
    HandlerPanic(String),

    /// Handshake could not be completed.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// One or more sessions failed to close during a process shutdown.
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),

    /// Failure reported by the underlying multiplexing transport.
    #[error("Transport error: {0}")]
    Transport(String),

    /// I/O error on a sub-stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Error code written into an `err` frame when a permission request is
    /// rejected with this error.
    pub fn reject_code(&self) -> &'static str {
        match self {
            Error::StreamNotFound(_) | Error::SessionNotFound(_) => codes::NOT_FOUND,
            Error::Unauthorized(_) => codes::UNAUTHORIZED,
            Error::InvalidFrame(_)
            | Error::InsufficientData(_)
            | Error::UnexpectedEof(_)
            | Error::ProtocolViolation(_) => codes::PROTOCOL,
            _ => codes::UNAVAILABLE,
        }
    }

    /// Rebuild an error from an `err` frame received in answer to a
    /// permission request.
    pub fn from_reject(code: &str, detail: String) -> Self {
        match code {
            codes::NOT_FOUND => Error::StreamNotFound(detail),
            codes::UNAUTHORIZED => Error::Unauthorized(detail),
            _ => Error::Rejected {
                code: code.to_owned(),
                detail,
            },
        }
    }
}

/// Error codes carried in the command of `err` frames.
pub mod codes {
    /// No hub target and no local handler for the requested name.
    pub const NOT_FOUND: &str = "not_found";
    /// Token verification failed.
    pub const UNAUTHORIZED: &str = "unauthorized";
    /// The permission frame itself was malformed.
    pub const PROTOCOL: &str = "protocol";
    /// The request was valid but could not be served.
    pub const UNAVAILABLE: &str = "unavailable";
}

/// Structured error handed to the error hook.
///
/// Carries the failing operation together with the identity of the session
/// and both endpoint addresses.
#[derive(Debug)]
pub struct OpError {
    /// Operation name, e.g. `"validate stream"` or `"serve stream"`.
    pub op: &'static str,
    /// Underlying error.
    pub err: Error,
    /// Session the operation ran on.
    pub session_id: Uuid,
    /// Peer identification of that session.
    pub identification: Identification,
    /// Remote endpoint address, when the transport exposes one.
    pub remote_addr: Option<SocketAddr>,
    /// Local endpoint address, when the transport exposes one.
    pub local_addr: Option<SocketAddr>,
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wn: {} session={}", self.op, self.session_id)?;
        if let Some(addr) = self.remote_addr {
            write!(f, " remote={addr}")?;
        }
        if let Some(addr) = self.local_addr {
            write!(f, " local={addr}")?;
        }
        write!(f, ": {}", self.err)
    }
}

impl std::error::Error for OpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.err)
    }
}

/// Aggregated failures from closing several sessions at once.
#[derive(Debug, Default)]
pub struct ShutdownError {
    errors: Vec<(Uuid, Error)>,
}

impl ShutdownError {
    /// Create an empty aggregate.
    pub fn new() -> Self {
        Self {
            errors: Vec::with_capacity(8),
        }
    }

    /// Record the close failure of one session.
    pub fn add(&mut self, session_id: Uuid, err: Error) {
        self.errors.push((session_id, err));
    }

    /// Whether any failure was recorded.
    pub fn is_filled(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Recorded failures, in the order they were added.
    pub fn errors(&self) -> &[(Uuid, Error)] {
        &self.errors
    }

    /// `Err(self)` when any failure was recorded, `Ok(())` otherwise.
    pub fn into_result(self) -> core::result::Result<(), Self> {
        if self.is_filled() {
            Err(self)
        } else {
            Ok(())
        }
    }
}

impl fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let [(id, err)] = self.errors.as_slice() {
            return write!(f, "session {id}: {err}");
        }
        for (id, err) in &self.errors {
            writeln!(f, "session {id}: {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ShutdownError {}
