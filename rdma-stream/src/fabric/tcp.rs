//! A `TcpStream`-backed realization of the [`super::Endpoint`] trait.
//!
//! Structurally this follows the teacher's zero-copy networking module: a
//! dedicated writer thread drains an outbound queue and pushes the socket
//! (mirroring `send_loop`), a dedicated reader thread carves frames out of
//! the stream and hands them off (mirroring `recv_loop`), and the two
//! communicate with the engine thread purely through bounded,
//! non-blocking-to-poll channels — nobody but these two background
//! threads ever calls a blocking socket operation.
//!
//! Because a plain socket has no remote-write primitive, "posting an RDMA
//! write" here means: serialize the local bytes plus their remote
//! `(key, offset)` addressing into one frame, and let the *peer's* reader
//! thread apply the bytes into its own registered target. Once our own
//! writer thread has flushed the frame, we consider the write
//! delivery-complete. This trades strict delivery-complete semantics
//! (which would require a round trip acknowledging the copy landed) for
//! simplicity appropriate to a reference/test backend; see `DESIGN.md` for
//! the rationale.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use crossbeam_channel::{bounded, Receiver, Sender};

use super::{Capabilities, Completion, CompletionKind, Endpoint, WriteSegment};
use crate::error::{Error, Result};
use crate::wire::{AckMessage, InitialMessage};

const TAG_SEND: u8 = 0;
const TAG_WRITE: u8 = 1;

/// A pointer/length pair registered as an RDMA-write target.
///
/// Carries `Send` by hand: the pointed-to bytes belong to a `Region` that
/// outlives the registration (the engine deregisters before reclaiming
/// it), and by protocol discipline only this connection's reader thread
/// touches them while they are registered.
struct RawTarget {
    ptr: *mut u8,
    len: usize,
}
unsafe impl Send for RawTarget {}

enum OutboundFrame {
    Send { id: u64, bytes: Vec<u8> },
    Write { id: u64, segments: Vec<(u64, u64, Vec<u8>)> },
}

/// An [`Endpoint`] backed by one TCP connection.
pub struct TcpEndpoint {
    outbound: Sender<OutboundFrame>,
    completions: Receiver<Completion>,
    targets: Arc<Mutex<HashMap<u64, RawTarget>>>,
    cancelled: Arc<AtomicBool>,
    reader: Option<thread::JoinHandle<()>>,
    writer: Option<thread::JoinHandle<()>>,
}

impl TcpEndpoint {
    /// Wraps an established `TcpStream` as an endpoint, spawning its
    /// reader and writer threads.
    pub fn new(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        let reader_stream = stream.try_clone()?;
        let writer_stream = stream;

        let (outbound_tx, outbound_rx) = bounded::<OutboundFrame>(256);
        let (completion_tx, completion_rx) = bounded::<Completion>(1024);
        let targets = Arc::new(Mutex::new(HashMap::new()));
        let cancelled = Arc::new(AtomicBool::new(false));

        let writer_completions = completion_tx.clone();
        let writer_cancelled = cancelled.clone();
        let writer = thread::Builder::new()
            .name("rdma-tcp-writer".into())
            .spawn(move || writer_loop(writer_stream, outbound_rx, writer_completions, writer_cancelled))
            .map_err(Error::Io)?;

        let reader_targets = targets.clone();
        let reader = thread::Builder::new()
            .name("rdma-tcp-reader".into())
            .spawn(move || reader_loop(reader_stream, completion_tx, reader_targets))
            .map_err(Error::Io)?;

        Ok(TcpEndpoint { outbound: outbound_tx, completions: completion_rx, targets, cancelled, reader: Some(reader), writer: Some(writer) })
    }
}

impl Endpoint for TcpEndpoint {
    fn capabilities(&self) -> Capabilities {
        Capabilities::required()
    }

    fn post_send(&self, id: u64, bytes: &[u8]) -> Result<()> {
        self.outbound
            .send(OutboundFrame::Send { id, bytes: bytes.to_vec() })
            .map_err(|_| Error::protocol("endpoint writer thread has exited"))
    }

    fn post_write(&self, id: u64, segments: &[WriteSegment<'_>]) -> Result<()> {
        let segments = segments.iter().map(|s| (s.remote_key, s.remote_offset, s.bytes.to_vec())).collect();
        self.outbound
            .send(OutboundFrame::Write { id, segments })
            .map_err(|_| Error::protocol("endpoint writer thread has exited"))
    }

    unsafe fn register_target(&self, key: u64, ptr: *mut u8, len: usize) {
        self.targets.lock().expect("targets mutex poisoned").insert(key, RawTarget { ptr, len });
    }

    fn deregister_target(&self, key: u64) {
        self.targets.lock().expect("targets mutex poisoned").remove(&key);
    }

    fn poll(&self) -> Option<Completion> {
        self.completions.try_recv().ok()
    }

    fn cancel_all(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn close(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

impl Drop for TcpEndpoint {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        // Dropping `outbound`'s sender unblocks the writer thread's recv;
        // the reader thread unblocks when the peer (or our own shutdown)
        // closes the socket.
        if let Some(handle) = self.writer.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
    }
}

fn writer_loop(mut stream: TcpStream, outbound: Receiver<OutboundFrame>, completions: Sender<Completion>, cancelled: Arc<AtomicBool>) {
    for frame in outbound.iter() {
        if cancelled.load(Ordering::SeqCst) {
            let completion = cancelled_completion(&frame);
            let _ = completions.send(completion);
            continue;
        }
        match encode_and_send(&mut stream, &frame) {
            Ok(len) => {
                let completion = match frame {
                    OutboundFrame::Send { id, .. } => Completion { id, kind: CompletionKind::Send, bytes: Vec::new(), len, cancelled: false },
                    OutboundFrame::Write { id, .. } => Completion { id, kind: CompletionKind::Write, bytes: Vec::new(), len, cancelled: false },
                };
                if completions.send(completion).is_err() {
                    return;
                }
            }
            Err(error) => {
                log::error!("rdma-tcp writer failed: {error}");
                return;
            }
        }
    }
}

fn cancelled_completion(frame: &OutboundFrame) -> Completion {
    match frame {
        OutboundFrame::Send { id, .. } => Completion { id: *id, kind: CompletionKind::Send, bytes: Vec::new(), len: 0, cancelled: true },
        OutboundFrame::Write { id, .. } => Completion { id: *id, kind: CompletionKind::Write, bytes: Vec::new(), len: 0, cancelled: true },
    }
}

fn encode_and_send(stream: &mut TcpStream, frame: &OutboundFrame) -> io::Result<usize> {
    let mut body = Vec::new();
    let total_len;
    match frame {
        OutboundFrame::Send { bytes, .. } => {
            body.push(TAG_SEND);
            body.extend_from_slice(bytes);
            total_len = bytes.len();
        }
        OutboundFrame::Write { segments, .. } => {
            body.push(TAG_WRITE);
            let mut count_buf = [0u8; 4];
            LittleEndian::write_u32(&mut count_buf, segments.len() as u32);
            body.extend_from_slice(&count_buf);
            let mut written = 0;
            for (key, offset, bytes) in segments {
                let mut seg_header = [0u8; 20];
                LittleEndian::write_u64(&mut seg_header[0..8], *key);
                LittleEndian::write_u64(&mut seg_header[8..16], *offset);
                LittleEndian::write_u32(&mut seg_header[16..20], bytes.len() as u32);
                body.extend_from_slice(&seg_header);
                body.extend_from_slice(bytes);
                written += bytes.len();
            }
            total_len = written;
        }
    }
    let mut len_prefix = [0u8; 4];
    LittleEndian::write_u32(&mut len_prefix, body.len() as u32);
    stream.write_all(&len_prefix)?;
    stream.write_all(&body)?;
    stream.flush()?;
    Ok(total_len)
}

fn reader_loop(mut stream: TcpStream, completions: Sender<Completion>, targets: Arc<Mutex<HashMap<u64, RawTarget>>>) {
    loop {
        let mut len_prefix = [0u8; 4];
        if stream.read_exact(&mut len_prefix).is_err() {
            return;
        }
        let body_len = LittleEndian::read_u32(&len_prefix) as usize;
        let mut body = vec![0u8; body_len];
        if stream.read_exact(&mut body).is_err() {
            return;
        }
        if body.is_empty() {
            continue;
        }
        match body[0] {
            TAG_SEND => {
                let bytes = body[1..].to_vec();
                let len = bytes.len();
                if completions.send(Completion { id: 0, kind: CompletionKind::Recv, bytes, len, cancelled: false }).is_err() {
                    return;
                }
            }
            TAG_WRITE => {
                apply_write_frame(&body[1..], &targets);
            }
            other => {
                log::error!("rdma-tcp reader saw unknown frame tag {other}");
                return;
            }
        }
    }
}

fn apply_write_frame(mut body: &[u8], targets: &Arc<Mutex<HashMap<u64, RawTarget>>>) {
    if body.len() < 4 {
        log::error!("rdma-tcp reader: truncated write frame");
        return;
    }
    let nsegments = LittleEndian::read_u32(&body[0..4]) as usize;
    body = &body[4..];
    let table = targets.lock().expect("targets mutex poisoned");
    for _ in 0..nsegments {
        if body.len() < 20 {
            log::error!("rdma-tcp reader: truncated write segment header");
            return;
        }
        let key = LittleEndian::read_u64(&body[0..8]);
        let offset = LittleEndian::read_u64(&body[8..16]) as usize;
        let seglen = LittleEndian::read_u32(&body[16..20]) as usize;
        body = &body[20..];
        if body.len() < seglen {
            log::error!("rdma-tcp reader: truncated write segment payload");
            return;
        }
        let payload = &body[..seglen];
        body = &body[seglen..];
        match table.get(&key) {
            Some(target) if offset + seglen <= target.len => {
                // Safety: `target` was registered with a pointer valid for
                // `target.len` bytes, and the protocol's own credit
                // discipline (targets are only advertised, and therefore
                // only written, within their allocated size) keeps
                // `offset + seglen` in bounds; checked above regardless.
                unsafe {
                    std::ptr::copy_nonoverlapping(payload.as_ptr(), target.ptr.add(offset), seglen);
                }
            }
            _ => log::error!("rdma-tcp reader: write to unregistered or out-of-range key {key}"),
        }
    }
}

/// Binds a listening socket for the receiver's handshake or
/// connection-specific endpoint.
pub fn bind(addr: &str) -> Result<TcpListener> {
    Ok(TcpListener::bind(addr)?)
}

/// Blocks (interruptibly, so a signal-driven cancellation flag can still
/// take effect within bounded latency) until a handshake connection
/// arrives, then reads its [`InitialMessage`].
pub fn accept_initial(listener: &TcpListener, cancelled: &AtomicBool) -> Result<(TcpStream, InitialMessage)> {
    listener.set_nonblocking(true)?;
    loop {
        match listener.accept() {
            Ok((mut stream, _peer)) => {
                stream.set_nonblocking(false)?;
                let mut buf = vec![0u8; InitialMessage::WIRE_LEN];
                stream.read_exact(&mut buf)?;
                let initial = InitialMessage::try_read(&buf)?;
                return Ok((stream, initial));
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                if cancelled.load(Ordering::SeqCst) {
                    return Err(Error::Io(io::Error::new(io::ErrorKind::Interrupted, "cancelled while awaiting connection")));
                }
                thread::sleep(Duration::from_millis(50));
            }
            Err(error) => return Err(Error::Io(error)),
        }
    }
}

/// Sends an [`AckMessage`] back over the handshake stream.
pub fn send_ack(stream: &mut TcpStream, ack: &AckMessage) -> Result<()> {
    let mut buf = vec![0u8; AckMessage::WIRE_LEN];
    ack.write_to(&mut buf)?;
    stream.write_all(&buf)?;
    stream.flush()?;
    Ok(())
}

/// Transmitter side: connects to the receiver's listen address, sends the
/// initial message, and reads back the ack. The same stream becomes the
/// connection-specific endpoint the data plane runs on; this backend has
/// no address-vector indirection to switch over, so the ack's address
/// field is carried on the wire (matching the message layout real
/// providers use) but is not reconnected to.
pub fn connect_and_handshake(peer_addr: &str, initial: &InitialMessage) -> Result<(TcpStream, AckMessage)> {
    let mut stream = TcpStream::connect(peer_addr)?;
    stream.set_nodelay(true)?;
    let mut buf = vec![0u8; InitialMessage::WIRE_LEN];
    initial.write_to(&mut buf)?;
    stream.write_all(&buf)?;
    stream.flush()?;

    let mut ack_buf = vec![0u8; AckMessage::WIRE_LEN];
    stream.read_exact(&mut ack_buf)?;
    let ack = AckMessage::try_read(&ack_buf)?;
    Ok((stream, ack))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn send_then_write_round_trip_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        let a = TcpEndpoint::new(client).unwrap();
        let b = TcpEndpoint::new(server).unwrap();

        // `b` registers a target buffer and `a` writes into it.
        let mut target = vec![0u8; 8];
        unsafe { b.register_target(42, target.as_mut_ptr(), target.len()) };

        a.post_send(1, b"hello").unwrap();
        let write_id = 2;
        let segment_bytes = [9u8, 9, 9, 9];
        let segments = vec![WriteSegment { bytes: &segment_bytes, remote_key: 42, remote_offset: 2 }];
        a.post_write(write_id, &segments).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        let mut saw_send_complete = false;
        let mut saw_write_complete = false;
        let mut saw_recv = false;
        let counter = AtomicU64::new(0);
        let _ = &counter;
        while std::time::Instant::now() < deadline && !(saw_send_complete && saw_write_complete && saw_recv) {
            if let Some(completion) = a.poll() {
                match completion.kind {
                    CompletionKind::Send if completion.id == 1 => saw_send_complete = true,
                    CompletionKind::Write if completion.id == write_id => saw_write_complete = true,
                    _ => {}
                }
            }
            if let Some(completion) = b.poll() {
                if completion.kind == CompletionKind::Recv {
                    assert_eq!(completion.bytes, b"hello");
                    saw_recv = true;
                }
            }
            thread::sleep(Duration::from_millis(5));
        }

        assert!(saw_send_complete, "send never completed");
        assert!(saw_write_complete, "write never completed");
        assert!(saw_recv, "recv never observed");

        // Give the reader thread a moment to have applied the write.
        thread::sleep(Duration::from_millis(50));
        assert_eq!(&target[2..6], &segment_bytes[..]);
    }
}
