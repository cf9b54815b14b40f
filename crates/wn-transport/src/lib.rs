//! Transport backends for wn sessions.
//!
//! A backend turns a physical link into a [`wn_core::Connection`]: one
//! connection carrying many independently closable bidirectional
//! sub-streams. Currently:
//! - QUIC over UDP (`quic` feature, default)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;

#[cfg(feature = "quic")]
pub mod quic;

pub use error::{Error, Result};
