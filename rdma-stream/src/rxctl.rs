//! Generic receive-posting and completion machinery for control messages.
//!
//! `RxCtl` posts a buffer as an incoming receive slot and holds it in a
//! posted FIFO until the matching completion arrives; order of posting is
//! order of completion (data-model invariant 4), so `complete` only ever
//! has to look at the head.
//!
//! One simplification is specific to the [`crate::fabric::tcp`] backend:
//! a real fabric provider requires a receive to be pre-posted before the
//! matching send can land, and its completion echoes back the posted
//! context directly. Plain sockets have no such pre-posting step — bytes
//! simply arrive — so `post` here does no fabric call at all, only the
//! FIFO bookkeeping, and `complete` trusts FIFO order rather than an id
//! comparison (a `Recv` completion's `id` is not meaningful on this
//! backend). The invariant this machinery exists to provide — "the head
//! of `posted` is always the next thing to complete" — holds regardless,
//! because the backend's reader thread delivers frames in the order the
//! peer's writer thread sent them.

use crate::buffer::ControlBuffer;
use crate::error::{Error, Result};
use crate::fabric::{Completion, CompletionKind};
use crate::fifo::Fifo;

/// Posts receives and tracks their completion order for one buffer kind.
pub struct RxCtl<T> {
    posted: Fifo<T>,
}

impl<T: ControlBuffer> RxCtl<T> {
    /// Creates a controller whose posted FIFO holds up to `capacity`
    /// buffers.
    pub fn new(capacity: usize) -> Self {
        RxCtl { posted: Fifo::new(capacity) }
    }

    /// Number of buffers currently posted (awaiting a completion).
    pub fn len(&self) -> usize {
        self.posted.len()
    }

    /// `true` when nothing is posted.
    pub fn is_empty(&self) -> bool {
        self.posted.is_empty()
    }

    /// Marks `buf` as an outstanding receive and enqueues it at the tail
    /// of the posted FIFO.
    pub fn post(&mut self, mut buf: T) -> Result<()> {
        buf.xfc_mut().post();
        self.posted.put(buf).map_err(|_| Error::protocol("rxctl posted FIFO is full"))
    }

    /// Marks every posted buffer's context cancelled; they remain queued
    /// until their (cancelled) completions surface.
    pub fn cancel(&mut self) {
        for buf in self.posted.iter_mut() {
            buf.xfc_mut().cancel();
        }
    }

    /// Matches `completion` against the posted head, writes its bytes
    /// into the buffer, flips ownership back to the program, and returns
    /// it to the caller.
    ///
    /// Fatal if the posted FIFO is empty (a completion arrived for
    /// nothing we posted) or the completion's kind is not `Recv` and the
    /// buffer was not cancelled.
    pub fn complete(&mut self, completion: Completion) -> Result<T> {
        let mut buf = self.posted.get().ok_or_else(|| Error::protocol("rxctl completion with nothing posted"))?;
        if completion.kind != CompletionKind::Recv && !completion.cancelled {
            return Err(Error::protocol("rxctl completion missing recv/msg flags"));
        }
        buf.xfc_mut().complete();
        if !completion.cancelled {
            buf.fill(&completion.bytes);
        }
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ProgressBuffer;
    use crate::xfc::{Xfc, XfcKind};

    fn progbuf() -> ProgressBuffer {
        ProgressBuffer::new(16, Xfc::new(XfcKind::Progress))
    }

    #[test]
    fn post_then_complete_in_fifo_order() {
        let mut ctl: RxCtl<ProgressBuffer> = RxCtl::new(4);
        ctl.post(progbuf()).unwrap();
        ctl.post(progbuf()).unwrap();
        assert_eq!(ctl.len(), 2);

        let completion = Completion { id: 0, kind: CompletionKind::Recv, bytes: vec![1, 2, 3], len: 3, cancelled: false };
        let buf = ctl.complete(completion).unwrap();
        assert_eq!(buf.bytes(), &[1, 2, 3]);
        assert_eq!(ctl.len(), 1);
    }

    #[test]
    fn complete_with_nothing_posted_is_fatal() {
        let mut ctl: RxCtl<ProgressBuffer> = RxCtl::new(4);
        let completion = Completion { id: 0, kind: CompletionKind::Recv, bytes: vec![], len: 0, cancelled: false };
        assert!(ctl.complete(completion).is_err());
    }
}
