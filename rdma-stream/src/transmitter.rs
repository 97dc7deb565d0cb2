//! The `fput` side of the protocol: consumes advertised RDMA targets from
//! the receiver, pulls payload from the source terminal, and issues the
//! writes.
//!
//! See the module-level design notes in `receiver.rs` for the shared
//! shape (explicit, non-blocking step function returning a
//! [`LoopOutcome`]).

use std::collections::VecDeque;

use crate::buffer::{ControlBuffer, Fragment, PayloadBuffer, ProgressBuffer, VectorBuffer};
use crate::error::{Error, Result};
use crate::fabric::{CompletionKind, Endpoint, WriteSegment};
use crate::fifo::Fifo;
use crate::outcome::LoopOutcome;
use crate::rxctl::RxCtl;
use crate::terminal::Terminal;
use crate::txctl::TxCtl;
use crate::wire::{IovRecord, ProgressMessage, VectorMessage, MAX_IOVS};
use crate::xfc::{Xfc, XfcKind};

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_WRITE_ID: AtomicU64 = AtomicU64::new(1);

fn next_write_id() -> u64 {
    NEXT_WRITE_ID.fetch_add(1, Ordering::Relaxed)
}

/// One local gather element of an in-flight write.
enum GroupItem {
    Whole(PayloadBuffer),
    Frag(Fragment),
}

impl GroupItem {
    fn bytes(&self, start: usize, len: usize) -> &[u8] {
        match self {
            GroupItem::Whole(buf) => &buf.region[start..start + len],
            GroupItem::Frag(frag) => &frag.slice[start..start + len],
        }
    }
}

/// One posted scatter-gather RDMA write, tracked as a single FIFO entry so
/// its single fabric completion retires every local item it gathered in
/// one step — a simplification of the head-walking `wrposted`/`place`
/// design in favor of a FIFO-of-groups, since both give the same
/// per-operation-exactly-once-completion guarantee and this shape reads
/// more directly in Rust.
struct WriteGroup {
    id: u64,
    total_len: u64,
    items: Vec<GroupItem>,
}

/// Transmitter-side ("fput") protocol state machine.
pub struct Transmitter {
    source: Box<dyn Terminal>,
    contiguous_only: bool,
    txbuflen: usize,

    ready_for_terminal: Fifo<PayloadBuffer>,
    ready_for_cxn: Fifo<PayloadBuffer>,
    pending_parents: Vec<PayloadBuffer>,

    vec_rx: RxCtl<VectorBuffer>,
    vec_rcvd: Fifo<VectorBuffer>,
    riov: VecDeque<IovRecord>,
    initial_vecbufs: usize,

    progress_tx: TxCtl<ProgressBuffer>,

    wrposted: Fifo<WriteGroup>,
    bytes_progress: u64,

    started: bool,
    eof_local: bool,
    eof_remote: bool,
    cancelled: bool,
}

impl Transmitter {
    /// Builds a fresh transmitter. `payload_pool` seeds `ready_for_terminal`
    /// with empty payload buffers for the source to fill.
    pub fn new(source: Box<dyn Terminal>, contiguous_only: bool, txbuflen: usize, nbuffers: usize, initial_vecbufs: usize) -> Self {
        let mut ready_for_terminal = Fifo::new(nbuffers);
        for _ in 0..nbuffers {
            ready_for_terminal.put(PayloadBuffer::new(txbuflen, Xfc::new(XfcKind::RdmaWrite))).expect("freshly sized FIFO");
        }
        let mut progress_tx = TxCtl::new(4);
        for _ in 0..4 {
            progress_tx.pool_mut().put(ProgressBuffer::new(ProgressMessage::WIRE_LEN, Xfc::new(XfcKind::Progress)));
        }

        Transmitter {
            source,
            contiguous_only,
            txbuflen,
            ready_for_terminal,
            ready_for_cxn: Fifo::new(nbuffers),
            pending_parents: Vec::new(),
            vec_rx: RxCtl::new(initial_vecbufs),
            vec_rcvd: Fifo::new(initial_vecbufs),
            riov: VecDeque::new(),
            initial_vecbufs,
            progress_tx,
            wrposted: Fifo::new(8),
            bytes_progress: 0,
            started: false,
            eof_local: false,
            eof_remote: false,
            cancelled: false,
        }
    }

    fn prime(&mut self) -> Result<()> {
        for _ in 0..self.initial_vecbufs {
            self.vec_rx.post(VectorBuffer::new(VectorMessage::WIRE_LEN, Xfc::new(XfcKind::Vector)))?;
        }
        self.started = true;
        Ok(())
    }

    /// One iteration of the transmitter's main loop.
    pub fn step(&mut self, endpoint: &dyn Endpoint) -> LoopOutcome {
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
            if self.vec_rx.is_empty() && self.progress_tx.is_idle() && self.wrposted.is_empty() {
                endpoint.close();
                return LoopOutcome::Error(Error::session("transmitter cancelled"));
            }
            return LoopOutcome::Continue;
        }

        self.unload_vector_buffers();

        let terminal_outcome = self.source.trade(&mut self.ready_for_terminal, &mut self.ready_for_cxn);
        if let LoopOutcome::Error(error) = terminal_outcome {
            return LoopOutcome::Error(error);
        }
        let terminal_drained = matches!(terminal_outcome, LoopOutcome::End);

        if let Err(error) = self.targets_write(endpoint) {
            return LoopOutcome::Error(error);
        }

        self.progress_update(terminal_drained);

        if let Err(error) = self.progress_tx.transmit(endpoint) {
            return LoopOutcome::Error(error);
        }

        if self.eof_local
            && self.eof_remote
            && self.progress_tx.is_idle()
            && self.wrposted.is_empty()
            && self.bytes_progress == 0
            && self.ready_for_cxn.is_empty()
        {
            endpoint.close();
            return LoopOutcome::End;
        }

        LoopOutcome::Continue
    }

    /// Requests a graceful, cancelled shutdown.
    pub fn cancel(&mut self) {
        self.cancelled = true;
        self.vec_rx.cancel();
        self.progress_tx.cancel();
    }

    fn dispatch_completion(&mut self, completion: crate::fabric::Completion) -> Result<()> {
        match completion.kind {
            CompletionKind::Recv => {
                let buf = self.vec_rx.complete(completion)?;
                self.vec_rcvd.put(buf).map_err(|_| Error::protocol("vec_rcvd FIFO is full"))?;
                Ok(())
            }
            CompletionKind::Write => {
                let group = self.wrposted.get().ok_or_else(|| Error::protocol("write completion with nothing posted"))?;
                if !completion.cancelled && group.id != completion.id {
                    return Err(Error::protocol("write completion id does not match posted head"));
                }
                self.bytes_progress += group.total_len;
                for item in group.items {
                    if let GroupItem::Whole(buf) = item {
                        self.ready_for_terminal.put(buf).map_err(|_| Error::protocol("ready_for_terminal FIFO is full"))?;
                    }
                    // `Frag` items simply drop here, releasing their slice
                    // and decrementing the parent's live-fragment count.
                }
                let mut index = 0;
                while index < self.pending_parents.len() {
                    if self.pending_parents[index].outstanding_fragments() == 0 {
                        let parent = self.pending_parents.remove(index);
                        self.ready_for_terminal.put(parent).map_err(|_| Error::protocol("ready_for_terminal FIFO is full"))?;
                    } else {
                        index += 1;
                    }
                }
                Ok(())
            }
            CompletionKind::Send => self.progress_tx.complete(completion),
        }
    }

    fn unload_vector_buffers(&mut self) {
        loop {
            let decoded = match self.vec_rcvd.peek() {
                Some(vecbuf) => VectorMessage::try_read(vecbuf.bytes()),
                None => break,
            };
            let vecbuf = self.vec_rcvd.get().expect("just peeked");
            match decoded {
                Ok(msg) => {
                    if msg.is_eof() {
                        self.eof_remote = true;
                    } else {
                        self.riov.extend(msg.records);
                    }
                    let _ = self.vec_rx.post(vecbuf);
                }
                Err(_) => {
                    // Malformed control traffic; drop and move on rather
                    // than wedge the loop on a bad decode.
                }
            }
        }
    }

    fn targets_write(&mut self, endpoint: &dyn Endpoint) -> Result<()> {
        if self.ready_for_cxn.is_empty() || self.riov.is_empty() {
            return Ok(());
        }
        let max_riovs = if self.contiguous_only { 1 } else { self.riov.len().min(MAX_IOVS) };
        let riov_budget: u64 = self.riov.iter().take(max_riovs).map(|r| r.len).sum();
        if riov_budget == 0 {
            return Ok(());
        }
        let slots_maxed = self.riov.len() >= MAX_IOVS;

        let mut items: Vec<GroupItem> = Vec::new();
        let mut chunk_lens: Vec<u64> = Vec::new();
        let mut local_total: u64 = 0;

        loop {
            if local_total >= riov_budget {
                break;
            }
            let remaining = match self.ready_for_cxn.peek() {
                Some(head) => head.remaining_unsent() as u64,
                None => break,
            };
            if remaining == 0 {
                self.ready_for_cxn.get();
                continue;
            }
            let budget_left = riov_budget - local_total;
            if remaining <= budget_left {
                let mut buf = self.ready_for_cxn.get().expect("just peeked");
                let offset = buf.hdr.sent_offset;
                let len = remaining as usize;
                buf.hdr.sent_offset = buf.hdr.nused;
                if offset == 0 {
                    items.push(GroupItem::Whole(buf));
                } else {
                    let frag = buf.split_fragment(offset, len, Xfc::new(XfcKind::Fragment));
                    self.pending_parents.push(buf);
                    items.push(GroupItem::Frag(frag));
                }
                chunk_lens.push(len as u64);
                local_total += len as u64;
            } else if slots_maxed || self.contiguous_only {
                let buf = self.ready_for_cxn.peek_mut().expect("just peeked");
                let offset = buf.hdr.sent_offset;
                let len = budget_left as usize;
                buf.hdr.sent_offset += len;
                let frag = buf.split_fragment(offset, len, Xfc::new(XfcKind::Fragment));
                items.push(GroupItem::Frag(frag));
                chunk_lens.push(len as u64);
                local_total += len as u64;
                break;
            } else {
                break;
            }
        }

        if items.is_empty() {
            return Ok(());
        }

        let mut plan: Vec<(usize, usize, usize, u64, u64)> = Vec::new();
        let mut chunk_idx = 0usize;
        let mut chunk_off: u64 = 0;
        let mut remaining_in_chunk = chunk_lens[0];
        while chunk_idx < chunk_lens.len() {
            let front = match self.riov.front_mut() {
                Some(front) => front,
                None => return Err(Error::protocol("exhausted advertisements before gathered bytes were placed")),
            };
            let seg_len = remaining_in_chunk.min(front.len);
            plan.push((chunk_idx, chunk_off as usize, seg_len as usize, front.key, front.addr));
            front.addr += seg_len;
            front.len -= seg_len;
            if front.len == 0 {
                self.riov.pop_front();
            }
            chunk_off += seg_len;
            remaining_in_chunk -= seg_len;
            if remaining_in_chunk == 0 {
                chunk_idx += 1;
                if chunk_idx < chunk_lens.len() {
                    chunk_off = 0;
                    remaining_in_chunk = chunk_lens[chunk_idx];
                }
            }
        }

        let segment_bytes: Vec<&[u8]> = plan.iter().map(|&(idx, off, len, _, _)| items[idx].bytes(off, len)).collect();
        let segments: Vec<WriteSegment<'_>> = plan
            .iter()
            .zip(segment_bytes.iter())
            .map(|(&(_, _, _, key, addr), &bytes)| WriteSegment { bytes, remote_key: key, remote_offset: addr })
            .collect();

        let id = next_write_id();
        endpoint.post_write(id, &segments)?;
        let total_len = chunk_lens.iter().sum();
        self.wrposted
            .put(WriteGroup { id, total_len, items })
            .map_err(|_| Error::protocol("wrposted FIFO is full"))?;
        Ok(())
    }

    fn progress_update(&mut self, terminal_drained: bool) {
        let should_send_eof = terminal_drained
            && self.ready_for_cxn.is_empty()
            && self.pending_parents.is_empty()
            && self.wrposted.is_empty()
            && !self.eof_local;
        if self.bytes_progress == 0 && !should_send_eof {
            return;
        }
        let Some(mut buf) = self.progress_tx.pool_mut().get() else { return };
        let nleftover = if should_send_eof { 0 } else { 1 };
        let msg = ProgressMessage { nfilled: self.bytes_progress, nleftover };
        let mut wire = vec![0u8; ProgressMessage::WIRE_LEN];
        if msg.write_to(&mut wire).is_err() {
            self.progress_tx.pool_mut().put(buf);
            return;
        }
        buf.fill(&wire);
        self.bytes_progress = 0;
        if should_send_eof {
            self.eof_local = true;
        }
        if self.progress_tx.enqueue(buf).is_err() {
            // Ready FIFO momentarily full; try again next loop iteration
            // (the buffer was already consumed from the pool, so this
            // would only happen with a misconfigured capacity).
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::tcp::TcpEndpoint;
    use crate::terminal::PatternSource;
    use std::net::{TcpListener, TcpStream};
    use std::time::{Duration, Instant};

    #[test]
    fn cancel_drains_posted_fifos_without_deadlock() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        let endpoint = TcpEndpoint::new(client).unwrap();
        let _peer = TcpEndpoint::new(server).unwrap();

        let source = Box::new(PatternSource::new(b"abc".to_vec(), 1 << 20));
        let mut transmitter = Transmitter::new(source, false, 256, 4, 2);

        // Step a few times so something is posted, then cancel.
        for _ in 0..5 {
            transmitter.step(&endpoint);
        }
        transmitter.cancel();

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut drained = false;
        while Instant::now() < deadline {
            if let LoopOutcome::Error(_) = transmitter.step(&endpoint) {
                drained = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(drained, "cancelled transmitter never reached a terminal error state");
    }
}
