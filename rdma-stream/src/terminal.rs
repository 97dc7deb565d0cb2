//! The payload source and sink behind the data-plane: a narrow `trade`
//! interface that moves buffers between two ring queues.
//!
//! A real deployment would back these with a file or pipe; this crate's
//! only terminal is a repeating test pattern, used both to drive `fput`
//! and to verify what `fget` receives (scenario 1 through 6 in the
//! testable-properties section all exercise this).

use crate::buffer::PayloadBuffer;
use crate::fifo::Fifo;
use crate::outcome::LoopOutcome;

/// A payload source or sink. `trade` consumes buffers from `ready`,
/// processes them, and moves the result into `completed`.
pub trait Terminal: Send {
    /// Processes whatever it can from `ready`, pushing results to
    /// `completed`. Returns `Continue` while more work remains possible,
    /// `End` once the terminal is fully drained, `Error` on a detected
    /// mismatch (sink only).
    fn trade(&mut self, ready: &mut Fifo<PayloadBuffer>, completed: &mut Fifo<PayloadBuffer>) -> LoopOutcome;
}

/// A source that fills buffers with a repeating byte pattern until
/// `entirelen` bytes have been produced.
pub struct PatternSource {
    pattern: Vec<u8>,
    entirelen: u64,
    produced: u64,
}

impl PatternSource {
    /// Creates a source that will produce exactly `entirelen` bytes of
    /// `pattern`, repeated.
    pub fn new(pattern: Vec<u8>, entirelen: u64) -> Self {
        assert!(!pattern.is_empty(), "pattern must not be empty");
        PatternSource { pattern, entirelen, produced: 0 }
    }

    fn byte_at(&self, absolute_index: u64) -> u8 {
        self.pattern[(absolute_index % self.pattern.len() as u64) as usize]
    }
}

impl Terminal for PatternSource {
    fn trade(&mut self, ready: &mut Fifo<PayloadBuffer>, completed: &mut Fifo<PayloadBuffer>) -> LoopOutcome {
        loop {
            if self.produced >= self.entirelen {
                return LoopOutcome::End;
            }
            let Some(mut buf) = ready.get() else {
                return LoopOutcome::Continue;
            };
            let remaining = self.entirelen - self.produced;
            let cap = buf.region.len() as u64;
            let n = remaining.min(cap) as usize;
            {
                let slice = buf.region.as_mut_slice().expect("freshly allocated payload buffer has no live fragments");
                for (i, byte) in slice[..n].iter_mut().enumerate() {
                    *byte = self.byte_at(self.produced + i as u64);
                }
            }
            buf.hdr.nused = n;
            self.produced += n as u64;
            if completed.put(buf).is_err() {
                return LoopOutcome::Error(crate::error::Error::protocol("ready_for_cxn FIFO is full"));
            }
        }
    }
}

/// A sink that verifies received buffers against the same repeating
/// pattern and expects exactly `entirelen` total bytes.
pub struct PatternSink {
    pattern: Vec<u8>,
    entirelen: u64,
    consumed: u64,
}

impl PatternSink {
    /// Creates a sink expecting exactly `entirelen` bytes of `pattern`,
    /// repeated.
    pub fn new(pattern: Vec<u8>, entirelen: u64) -> Self {
        assert!(!pattern.is_empty(), "pattern must not be empty");
        PatternSink { pattern, entirelen, consumed: 0 }
    }

    fn byte_at(&self, absolute_index: u64) -> u8 {
        self.pattern[(absolute_index % self.pattern.len() as u64) as usize]
    }

    /// Bytes verified so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }
}

impl Terminal for PatternSink {
    fn trade(&mut self, ready: &mut Fifo<PayloadBuffer>, completed: &mut Fifo<PayloadBuffer>) -> LoopOutcome {
        while let Some(mut buf) = ready.get() {
            if self.consumed + buf.hdr.nused as u64 > self.entirelen {
                return LoopOutcome::Error(crate::error::Error::session("sink received more bytes than entirelen"));
            }
            for i in 0..buf.hdr.nused {
                let byte = buf.region[i];
                let expected = self.byte_at(self.consumed + i as u64);
                if byte != expected {
                    return LoopOutcome::Error(crate::error::Error::session(format!(
                        "payload mismatch at byte {}: expected {:#x}, got {:#x}",
                        self.consumed + i as u64,
                        expected,
                        byte
                    )));
                }
            }
            self.consumed += buf.hdr.nused as u64;
            buf.hdr.nused = 0;
            if completed.put(buf).is_err() {
                return LoopOutcome::Error(crate::error::Error::protocol("ready_for_cxn FIFO is full"));
            }
        }
        if self.consumed >= self.entirelen {
            LoopOutcome::End
        } else {
            LoopOutcome::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xfc::{Xfc, XfcKind};

    fn fresh_buf(size: usize) -> PayloadBuffer {
        PayloadBuffer::new(size, Xfc::new(XfcKind::RdmaWrite))
    }

    #[test]
    fn source_fills_exactly_entirelen_bytes() {
        let mut source = PatternSource::new(b"ab".to_vec(), 5);
        let mut ready = Fifo::new(4);
        let mut completed = Fifo::new(4);
        ready.put(fresh_buf(3)).unwrap();
        ready.put(fresh_buf(3)).unwrap();

        let outcome = source.trade(&mut ready, &mut completed);
        assert!(outcome.is_continue());
        assert_eq!(completed.len(), 2);

        let first = completed.get().unwrap();
        assert_eq!(first.hdr.nused, 3);
        assert_eq!(&first.region[..3], b"aba");
        let second = completed.get().unwrap();
        assert_eq!(second.hdr.nused, 2);
        assert_eq!(&second.region[..2], b"ba");
    }

    #[test]
    fn sink_detects_mismatch() {
        let mut sink = PatternSink::new(b"xy".to_vec(), 4);
        let mut ready = Fifo::new(4);
        let mut completed = Fifo::new(4);
        let mut buf = fresh_buf(4);
        buf.region.as_mut_slice().unwrap().copy_from_slice(b"xyxZ");
        buf.hdr.nused = 4;
        ready.put(buf).unwrap();

        match sink.trade(&mut ready, &mut completed) {
            LoopOutcome::Error(_) => {}
            other => panic!("expected mismatch error, got {other:?}"),
        }
    }

    #[test]
    fn sink_ends_at_entirelen() {
        let mut sink = PatternSink::new(b"xy".to_vec(), 4);
        let mut ready = Fifo::new(4);
        let mut completed = Fifo::new(4);
        let mut buf = fresh_buf(4);
        buf.region.as_mut_slice().unwrap().copy_from_slice(b"xyxy");
        buf.hdr.nused = 4;
        ready.put(buf).unwrap();

        let outcome = sink.trade(&mut ready, &mut completed);
        assert!(matches!(outcome, LoopOutcome::End));
        assert_eq!(sink.consumed(), 4);
    }
}
