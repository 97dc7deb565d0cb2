//! The worker-visible unit of scheduling: a personality's state machine
//! paired with the endpoint it drives.
//!
//! The source's `Session` is a single generic type parameterized over
//! personality; here the two personalities carry different per-step
//! dependencies (a receiver also needs a [`KeySource`] to mint target
//! keys), so a tagged enum is the natural Rust shape — the same
//! "polymorphism by embedded tag" pattern used for [`crate::xfc::Xfc`],
//! applied at the scheduling boundary instead of the completion boundary.

use crate::fabric::tcp::TcpEndpoint;
use crate::keysource::KeySource;
use crate::outcome::LoopOutcome;
use crate::receiver::Receiver;
use crate::transmitter::Transmitter;

/// One in-flight transfer, bound to its endpoint, held by a worker half.
pub enum Session {
    /// A `fput`-side session.
    Transmit { engine: Transmitter, endpoint: TcpEndpoint },
    /// A `fget`-side session.
    Receive { engine: Receiver, endpoint: TcpEndpoint, keysource: KeySource },
}

impl Session {
    /// Advances this session by one step.
    pub fn step(&mut self) -> LoopOutcome {
        match self {
            Session::Transmit { engine, endpoint } => engine.step(&*endpoint),
            Session::Receive { engine, endpoint, keysource } => engine.step(&*endpoint, keysource),
        }
    }

    /// Requests a graceful, cancelled shutdown of this session.
    pub fn cancel(&mut self) {
        match self {
            Session::Transmit { engine, .. } => engine.cancel(),
            Session::Receive { engine, .. } => engine.cancel(),
        }
    }
}
