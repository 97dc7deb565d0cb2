//! End-to-end `fput`/`fget` pairs driven directly as a library, over the
//! `fabric::tcp` backend bound to an ephemeral loopback port.
//!
//! Covers the literal scenarios from the testable-properties section at a
//! scale suited to a fast test run rather than their full-size repeat
//! counts; the property under test (byte-for-byte fidelity across many
//! advertisement cycles) does not depend on the exact repeat count.

use std::sync::atomic::AtomicBool;
use std::thread;

use rdma_stream::connection;
use rdma_stream::outcome::LoopOutcome;
use rdma_stream::receiver::Receiver;
use rdma_stream::session::Session;
use rdma_stream::terminal::{PatternSink, PatternSource};
use rdma_stream::transmitter::Transmitter;

fn run_to_completion(session: &mut Session) -> Result<(), rdma_stream::error::Error> {
    loop {
        match session.step() {
            LoopOutcome::Continue => {}
            LoopOutcome::End => return Ok(()),
            LoopOutcome::Error(error) => return Err(error),
        }
    }
}

/// Runs one `fget`/`fput` pair over loopback, transferring `entirelen`
/// bytes of `pattern` repeated, and asserts both sides reach a clean close.
fn run_pair(pattern: &'static [u8], entirelen: u64, contiguous_only: bool, reregister: bool, buflen: usize, nbuffers: usize) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);

    let cancelled = AtomicBool::new(false);
    let receiver_thread = thread::Builder::new()
        .name("test-fget".into())
        .spawn(move || -> Result<(), rdma_stream::error::Error> {
            let (endpoint, keysource) = connection::accept(&addr.to_string(), &cancelled)?;
            let sink = Box::new(PatternSink::new(pattern.to_vec(), entirelen));
            let engine = Receiver::new(sink, buflen, nbuffers, 2, reregister);
            let mut session = Session::Receive { engine, endpoint, keysource };
            run_to_completion(&mut session)
        })
        .expect("spawn fget thread");

    // Give the listener a moment to be bound before the transmitter dials in.
    thread::sleep(std::time::Duration::from_millis(20));

    let (endpoint, _keysource) = connection::connect(&addr.to_string()).expect("fput connect");
    let source = Box::new(PatternSource::new(pattern.to_vec(), entirelen));
    let engine = Transmitter::new(source, contiguous_only, buflen, nbuffers, 2);
    let mut transmit_session = Session::Transmit { engine, endpoint };
    run_to_completion(&mut transmit_session).expect("fput session failed");

    receiver_thread.join().expect("fget thread panicked").expect("fget session failed");
}

#[test]
fn scenario_1_pattern_transfer_round_trips() {
    let pattern = b"If this message was received in error then please print it out and shred it.";
    run_pair(pattern, 200 * pattern.len() as u64, false, false, 512, 4);
}

#[test]
fn scenario_2_single_byte_transfer() {
    run_pair(b"x", 1, false, false, 512, 4);
}

#[test]
fn scenario_4_contiguous_writes_complete() {
    let pattern = b"contiguous-only segment test payload";
    run_pair(pattern, 64 * pattern.len() as u64, true, false, 256, 4);
}

#[test]
fn scenario_5_reregister_every_cycle_completes() {
    let pattern = b"reregister";
    run_pair(pattern, 64 * pattern.len() as u64, false, true, 256, 4);
}

#[test]
fn scenario_6_zero_byte_transfer() {
    run_pair(b"unused", 0, false, false, 512, 4);
}

#[test]
fn transfer_larger_than_one_advertised_buffer_fragments_correctly() {
    // buflen is small relative to entirelen and nbuffers, forcing several
    // advertise/release cycles and, with contiguous_only off, fragmented
    // writes that straddle more than one advertised target.
    let pattern = b"0123456789abcdef";
    run_pair(pattern, 4096, false, false, 64, 2);
}
