//! The `fget` side of the protocol: advertises RDMA target buffers,
//! receives progress acks, and drains filled buffers into the sink
//! terminal.
//!
//! Mirrors `transmitter.rs`'s shape: an explicit step function that never
//! blocks on the endpoint's completion queue, so a worker can multiplex
//! many sessions across one thread (see `worker.rs`).

use crate::buffer::{ControlBuffer, PayloadBuffer, ProgressBuffer, VectorBuffer};
use crate::error::{Error, Result};
use crate::fabric::{CompletionKind, Endpoint};
use crate::fifo::Fifo;
use crate::keysource::KeySource;
use crate::outcome::LoopOutcome;
use crate::rxctl::RxCtl;
use crate::terminal::Terminal;
use crate::txctl::TxCtl;
use crate::wire::{IovRecord, ProgressMessage, VectorMessage, MAX_IOVS};
use crate::xfc::{Xfc, XfcKind};

/// A payload buffer that has been advertised to the peer and is waiting
/// to be (fully or partially) filled by an incoming RDMA write.
struct PostedTarget {
    buf: PayloadBuffer,
    key: u64,
}

/// Receiver-side ("fget") protocol state machine.
pub struct Receiver {
    sink: Box<dyn Terminal>,
    rxbuflen: usize,

    ready_for_terminal: Fifo<PayloadBuffer>,
    ready_for_cxn: Fifo<PayloadBuffer>,
    tgtposted: Fifo<PostedTarget>,
    nfull: u64,

    progress_rx: RxCtl<ProgressBuffer>,
    initial_progress_bufs: usize,
    vec_tx: TxCtl<VectorBuffer>,

    /// When `true`, a target is registered immediately before each
    /// advertisement and deregistered immediately on release (scenario 5).
    /// When `false`, a target keeps its first-assigned key registered for
    /// the life of the connection.
    reregister: bool,

    started: bool,
    eof_local: bool,
    eof_remote: bool,
    cancelled: bool,
    sink_drained: bool,
}

impl Receiver {
    /// Builds a fresh receiver, seeding `ready_for_cxn` with `nbuffers`
    /// empty payload buffers available for advertisement.
    pub fn new(sink: Box<dyn Terminal>, rxbuflen: usize, nbuffers: usize, initial_progress_bufs: usize, reregister: bool) -> Self {
        let mut ready_for_cxn = Fifo::new(nbuffers);
        for _ in 0..nbuffers {
            ready_for_cxn.put(PayloadBuffer::new(rxbuflen, Xfc::new(XfcKind::RdmaWrite))).expect("freshly sized FIFO");
        }
        let mut vec_tx = TxCtl::new(4);
        for _ in 0..4 {
            vec_tx.pool_mut().put(VectorBuffer::new(VectorMessage::WIRE_LEN, Xfc::new(XfcKind::Vector)));
        }

        Receiver {
            sink,
            rxbuflen,
            ready_for_terminal: Fifo::new(nbuffers),
            ready_for_cxn,
            tgtposted: Fifo::new(nbuffers),
            nfull: 0,
            progress_rx: RxCtl::new(initial_progress_bufs),
            initial_progress_bufs,
            vec_tx,
            reregister,
            started: false,
            eof_local: false,
            eof_remote: false,
            cancelled: false,
            sink_drained: false,
        }
    }

    fn prime(&mut self) -> Result<()> {
        for _ in 0..self.initial_progress_bufs {
            self.progress_rx.post(ProgressBuffer::new(ProgressMessage::WIRE_LEN, Xfc::new(XfcKind::Progress)))?;
        }
        self.started = true;
        Ok(())
    }

    /// One iteration of the receiver's main loop.
    pub fn step(&mut self, endpoint: &dyn Endpoint, keysource: &mut KeySource) -> LoopOutcome {
        if !self.started {
            if let Err(error) = self.prime() {
                return LoopOutcome::Error(error);
            }
        }

        if let Some(completion) = endpoint.poll() {
            if let Err(error) = self.dispatch_completion(completion) {
                return LoopOutcome::Error(error);
            }
        }

        if self.cancelled {
            if self.progress_rx.is_empty() && self.vec_tx.is_idle() {
                endpoint.close();
                return LoopOutcome::Error(Error::session("receiver cancelled"));
            }
            return LoopOutcome::Continue;
        }

        let sink_outcome = self.sink.trade(&mut self.ready_for_terminal, &mut self.ready_for_cxn);
        if let LoopOutcome::Error(error) = sink_outcome {
            return LoopOutcome::Error(error);
        }
        self.sink_drained = matches!(sink_outcome, LoopOutcome::End);

        self.advertise_targets(endpoint, keysource);

        if let Err(error) = self.vec_tx.transmit(endpoint) {
            return LoopOutcome::Error(error);
        }

        self.release_filled_targets(endpoint);

        if self.sink_drained && self.eof_local && self.eof_remote && self.vec_tx.is_idle() {
            endpoint.close();
            return LoopOutcome::End;
        }

        LoopOutcome::Continue
    }

    /// Requests a graceful, cancelled shutdown.
    pub fn cancel(&mut self) {
        self.cancelled = true;
        self.progress_rx.cancel();
        self.vec_tx.cancel();
    }

    fn dispatch_completion(&mut self, completion: crate::fabric::Completion) -> Result<()> {
        match completion.kind {
            CompletionKind::Recv => {
                let buf = self.progress_rx.complete(completion)?;
                let msg = ProgressMessage::try_read(buf.bytes())?;
                self.nfull += msg.nfilled;
                if msg.is_eof() {
                    self.eof_remote = true;
                }
                self.progress_rx.post(buf)
            }
            CompletionKind::Send => self.vec_tx.complete(completion),
            CompletionKind::Write => Ok(()),
        }
    }

    /// Advertises up to `MAX_IOVS` fresh targets per vector message while
    /// free payload buffers and a vector-buffer slot are both available.
    /// Stops registering new targets once the peer has signalled EOF —
    /// nothing more will ever be written to them.
    fn advertise_targets(&mut self, endpoint: &dyn Endpoint, keysource: &mut KeySource) {
        while !self.eof_remote && !self.ready_for_cxn.is_empty() {
            let mut records: Vec<IovRecord> = Vec::new();
            let mut advertised: Vec<PostedTarget> = Vec::new();
            while records.len() < MAX_IOVS {
                let Some(mut buf) = self.ready_for_cxn.get() else { break };
                let len = buf.region.len() as u64;
                let key = match buf.hdr.key {
                    Some(key) => key,
                    None => {
                        let key = keysource.next();
                        // Safety: the region stays registered, and
                        // therefore untouched by the program, until this
                        // target is deregistered (or, in persistent mode,
                        // until the connection closes).
                        let (ptr, len) = unsafe { buf.region.as_raw_parts() };
                        unsafe { endpoint.register_target(key, ptr, len) };
                        buf.hdr.key = Some(key);
                        key
                    }
                };
                buf.hdr.xfc.post();
                records.push(IovRecord { addr: 0, len, key });
                advertised.push(PostedTarget { buf, key });
            }
            if records.is_empty() {
                break;
            }
            let Some(mut vecbuf) = self.vec_tx.pool_mut().get() else {
                // No vector buffer free to carry the advertisement this
                // round; put the selected targets back.
                for target in advertised.into_iter().rev() {
                    let mut buf = target.buf;
                    buf.hdr.xfc.complete();
                    if self.reregister {
                        endpoint.deregister_target(target.key);
                        buf.hdr.key = None;
                    }
                    let _ = self.ready_for_cxn.put(buf);
                }
                break;
            };
            let msg = VectorMessage { records };
            let mut wire = vec![0u8; VectorMessage::WIRE_LEN];
            if msg.write_to(&mut wire).is_err() {
                self.vec_tx.pool_mut().put(vecbuf);
                break;
            }
            vecbuf.fill(&wire);
            for target in advertised {
                let _ = self.tgtposted.put(target);
            }
            let _ = self.vec_tx.enqueue(vecbuf);
        }

        if self.eof_remote && !self.eof_local && self.tgtposted.is_empty() {
            if let Some(mut vecbuf) = self.vec_tx.pool_mut().get() {
                let mut wire = vec![0u8; VectorMessage::WIRE_LEN];
                if VectorMessage::eof().write_to(&mut wire).is_ok() {
                    vecbuf.fill(&wire);
                    if self.vec_tx.enqueue(vecbuf).is_ok() {
                        self.eof_local = true;
                    }
                    // Ready FIFO momentarily full; the buffer was already
                    // consumed from the pool, so (as elsewhere) it is lost
                    // rather than reclaimed (see transmitter's progress
                    // enqueue for the same accepted tradeoff).
                } else {
                    self.vec_tx.pool_mut().put(vecbuf);
                }
            }
        }
    }

    /// Applies accumulated write credit (`nfull`) to the head of
    /// `tgtposted`, releasing it to the sink once fully covered. On remote
    /// EOF with no further credit due, drains every remaining posted
    /// target: a partially filled tail buffer is released with its valid
    /// prefix; an untouched one returns to `ready_for_cxn` unregistered.
    fn release_filled_targets(&mut self, endpoint: &dyn Endpoint) {
        loop {
            if self.tgtposted.peek().is_none() {
                break;
            }
            if self.nfull == 0 {
                if !self.eof_remote {
                    break;
                }
                let target = self.tgtposted.get().expect("just peeked");
                let buf = self.release_target(endpoint, target);
                if buf.hdr.nused > 0 {
                    let _ = self.ready_for_terminal.put(buf);
                } else {
                    let _ = self.ready_for_cxn.put(buf);
                }
                continue;
            }
            let remaining_capacity = {
                let head = self.tgtposted.peek().expect("just checked");
                (head.buf.hdr.nallocated - head.buf.hdr.nused) as u64
            };
            let advance = self.nfull.min(remaining_capacity);
            let head = self.tgtposted.peek_mut().expect("just checked");
            head.buf.hdr.nused += advance as usize;
            self.nfull -= advance;
            if head.buf.hdr.nused == head.buf.hdr.nallocated {
                let target = self.tgtposted.get().expect("just peeked");
                let buf = self.release_target(endpoint, target);
                let _ = self.ready_for_terminal.put(buf);
            } else {
                break;
            }
        }
    }

    /// Completes a target's xfc and, in reregister mode, deregisters and
    /// clears its key; in persistent mode the key stays registered for
    /// reuse on the next advertisement.
    fn release_target(&self, endpoint: &dyn Endpoint, target: PostedTarget) -> PayloadBuffer {
        let mut buf = target.buf;
        buf.hdr.xfc.complete();
        if self.reregister {
            endpoint.deregister_target(target.key);
            buf.hdr.key = None;
        }
        buf
    }
}
