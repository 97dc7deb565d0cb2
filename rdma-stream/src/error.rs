//! Crate-wide error taxonomy.
//!
//! The taxonomy mirrors the error handling design directly: a `Config`
//! error means abort at startup, a `Protocol` error means an invariant was
//! violated and the process should die loudly, and `Io` wraps the
//! underlying transport. `transient-again` is deliberately *not* a variant
//! here — see [`crate::fabric::FabricError::WouldBlock`] — so that a
//! caller cannot mistake "try again" for a hard failure by matching on
//! `Error`.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Fatal and non-fatal error kinds produced by the data-plane engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Capability mismatch or missing provider feature, detected at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// A malformed message, unexpected completion flags, or a head-of-queue
    /// mismatch: an invariant the protocol depends on has been violated.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Transport-level I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The payload sink observed bytes that did not match the expected
    /// pattern, or otherwise detected a session-level failure.
    #[error("session error: {0}")]
    Session(String),
}

impl Error {
    /// Shorthand for a `Config` error built from a `Display`-able value.
    pub fn config<T: std::fmt::Display>(msg: T) -> Self {
        Error::Config(msg.to_string())
    }

    /// Shorthand for a `Protocol` error built from a `Display`-able value.
    pub fn protocol<T: std::fmt::Display>(msg: T) -> Self {
        Error::Protocol(msg.to_string())
    }

    /// Shorthand for a `Session` error built from a `Display`-able value.
    pub fn session<T: std::fmt::Display>(msg: T) -> Self {
        Error::Session(msg.to_string())
    }
}
