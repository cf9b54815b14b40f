//! Core protocol engine for the wn multiplexing transport.
//!
//! Two peers share one physical connection and exchange many named logical
//! streams over it. This crate implements:
//! - The frame codec used to request, acknowledge and reject streams
//! - The per-connection session: accept, authenticate, dispatch, drain
//! - Hub relaying between two other peers by shared stream name
//! - The process-wide [`Wire`] registry of handlers and sessions
//!
//! The physical connection is abstracted by [`transport::Connection`]; the
//! QUIC backend lives in `wn-transport`, and [`memory`] provides an
//! in-process pair for tests.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod memory;
pub mod registry;
pub mod session;
pub mod stream;
pub mod transport;

pub use config::{Hooks, Options, TokenVerifier};
pub use error::{BoxError, Error, OpError, Result, ShutdownError};
pub use frame::{Frame, FrameLimits, FrameType};
pub use registry::{Handler, HandlerResult, Registry, Wire};
pub use session::{Identification, Role, Session, SessionParams};
pub use stream::Stream;
pub use transport::{BoxSubStream, Connection, SubStream};
