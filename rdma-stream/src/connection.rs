//! Connection establishment: the listen/accept handshake for the receiver,
//! the connect handshake for the transmitter. Produces a bound endpoint
//! and a fresh key source, ready for a [`crate::session::Session`].

use std::sync::atomic::AtomicBool;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::fabric::tcp::{self, TcpEndpoint};
use crate::keysource::KeySource;
use crate::wire::{AckMessage, InitialMessage, Nonce};

/// Service name / default port used when a peer address carries none.
pub const SERVICE_NAME: &str = "4242";

/// Listens on `bind_addr`, accepts the transmitter's handshake connection,
/// validates it only requests a single-source transfer, and acks it back
/// on the same stream. Interruptible via `cancelled` while waiting.
pub fn accept(bind_addr: &str, cancelled: &AtomicBool) -> Result<(TcpEndpoint, KeySource)> {
    let listener = tcp::bind(bind_addr)?;
    let local_addr = listener.local_addr()?;
    let (mut stream, initial) = tcp::accept_initial(&listener, cancelled)?;
    if initial.nsources != 1 || initial.id != 0 {
        return Err(Error::protocol(format!(
            "rejecting transfer with nsources={}, id={}: only nsources=1, id=0 is supported",
            initial.nsources, initial.id
        )));
    }
    log::info!("accepted connection from nonce {:#x}", initial.nonce.0);
    let ack = AckMessage { addr: local_addr.to_string().into_bytes() };
    tcp::send_ack(&mut stream, &ack)?;
    let endpoint = TcpEndpoint::new(stream)?;
    Ok((endpoint, KeySource::new()))
}

/// Connects to `peer_addr`, sends the single-source initial message, and
/// awaits the ack before handing back a ready endpoint.
pub fn connect(peer_addr: &str) -> Result<(TcpEndpoint, KeySource)> {
    let initial = InitialMessage { nonce: Nonce::new(fresh_nonce()), nsources: 1, id: 0, addr: peer_addr.as_bytes().to_vec() };
    let (stream, _ack) = tcp::connect_and_handshake(peer_addr, &initial)?;
    log::info!("connected to {peer_addr}");
    let endpoint = TcpEndpoint::new(stream)?;
    Ok((endpoint, KeySource::new()))
}

/// A best-effort unique value for the initial message's opaque nonce
/// field. The core protocol never inspects it (see the open question on
/// multi-source transfers); this only needs to look distinct across
/// concurrent connections for diagnostic purposes.
fn fresh_nonce() -> u128 {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0);
    nanos ^ (std::process::id() as u128) << 64
}
