//! Generic send-posting, completion, and pool-return machinery for control
//! messages.
//!
//! `TxCtl` owns three collections for one buffer kind: `ready` (filled,
//! waiting to be handed to the fabric), `posted` (handed off, awaiting
//! completion), and `pool` (idle, available to be filled again). `transmit`
//! drains `ready` into `posted` as fabric credit allows; `complete` drains
//! a matching completion off the `posted` head and returns the buffer to
//! `pool`.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::buffer::ControlBuffer;
use crate::error::{Error, Result};
use crate::fabric::{Completion, CompletionKind, Endpoint};
use crate::fifo::{Fifo, Pool};

static NEXT_POST_ID: AtomicU64 = AtomicU64::new(1);

fn next_post_id() -> u64 {
    NEXT_POST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Posts ready buffers as sends and reclaims completed ones into a pool.
pub struct TxCtl<T> {
    ready: Fifo<T>,
    posted: Fifo<T>,
    pool: Pool<T>,
}

impl<T: ControlBuffer + std::fmt::Debug> TxCtl<T> {
    /// Creates a controller whose ready/posted FIFOs and pool each hold up
    /// to `capacity` buffers.
    pub fn new(capacity: usize) -> Self {
        TxCtl { ready: Fifo::new(capacity), posted: Fifo::new(capacity), pool: Pool::new(capacity) }
    }

    /// Borrows the pool, for callers that lend buffers out of it directly
    /// (e.g. the receiver filling a fresh vector message).
    pub fn pool_mut(&mut self) -> &mut Pool<T> {
        &mut self.pool
    }

    /// Enqueues a filled buffer at the tail of `ready`.
    pub fn enqueue(&mut self, buf: T) -> Result<()> {
        self.ready.put(buf).map_err(|_| Error::protocol("txctl ready FIFO is full"))
    }

    /// `true` when nothing is ready or posted.
    pub fn is_idle(&self) -> bool {
        self.ready.is_empty() && self.posted.is_empty()
    }

    /// Number of buffers currently posted (awaiting a completion).
    pub fn posted_len(&self) -> usize {
        self.posted.len()
    }

    /// Hands buffers from `ready` to the fabric as a single-IOV send
    /// addressed to the connection's peer, while `posted` has room. Stops
    /// (without error) the moment the fabric would block.
    pub fn transmit(&mut self, endpoint: &dyn Endpoint) -> Result<()> {
        while !self.ready.is_empty() && !self.posted.is_full() {
            let mut buf = self.ready.get().expect("just checked non-empty");
            let id = next_post_id();
            buf.set_post_id(id);
            endpoint.post_send(id, buf.bytes())?;
            buf.xfc_mut().post();
            self.posted.put(buf).expect("just checked not full");
        }
        Ok(())
    }

    /// Marks every posted buffer's context cancelled; they remain queued
    /// until their (cancelled) completions surface.
    pub fn cancel(&mut self) {
        for buf in self.posted.iter_mut() {
            buf.xfc_mut().cancel();
        }
    }

    /// Matches `completion` against the posted head, flips ownership back
    /// to the program, and returns the buffer to the pool.
    pub fn complete(&mut self, completion: Completion) -> Result<()> {
        let mut buf = self.posted.get().ok_or_else(|| Error::protocol("txctl completion with nothing posted"))?;
        if completion.kind != CompletionKind::Send && !completion.cancelled {
            return Err(Error::protocol("txctl completion missing send flags"));
        }
        if !completion.cancelled && buf.post_id() != completion.id {
            return Err(Error::protocol("txctl completion id does not match posted head"));
        }
        buf.xfc_mut().complete();
        self.pool.put(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ProgressBuffer;
    use crate::fabric::tcp::TcpEndpoint;
    use crate::xfc::{Xfc, XfcKind};
    use std::net::{TcpListener, TcpStream};
    use std::time::{Duration, Instant};

    fn progbuf() -> ProgressBuffer {
        let mut buf = ProgressBuffer::new(16, Xfc::new(XfcKind::Progress));
        buf.fill(&[0u8; 16]);
        buf
    }

    #[test]
    fn transmit_then_complete_returns_buffer_to_pool() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        let a = TcpEndpoint::new(client).unwrap();
        let _b = TcpEndpoint::new(server).unwrap();

        let mut ctl: TxCtl<ProgressBuffer> = TxCtl::new(4);
        ctl.enqueue(progbuf()).unwrap();
        ctl.transmit(&a).unwrap();
        assert_eq!(ctl.posted_len(), 1);

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut completion = None;
        while Instant::now() < deadline && completion.is_none() {
            completion = a.poll();
        }
        let completion = completion.expect("send completion never arrived");
        ctl.complete(completion).unwrap();
        assert_eq!(ctl.posted_len(), 0);
        assert_eq!(ctl.pool_mut().len(), 1);
    }
}
