//! Typed buffers backed by a registered memory region.
//!
//! Every concrete buffer kind shares the same header fields (remote
//! address, used/allocated size, memory-region key, embedded transfer
//! context) and differs only in how it owns its storage: `PayloadBuffer`,
//! `ProgressBuffer` and `VectorBuffer` each own a [`rdma_bytes::Region`]
//! outright, while a `Fragment` borrows a disjoint sub-range of its
//! parent's region. Rather than track a `nchildren` counter by hand on the
//! parent, a fragment's liveness *is* the parent region's reference count
//! (see [`rdma_bytes::Region::children`]) — the reference-counted shared
//! allocation from `rdma-bytes` already gives us the invariant the data
//! model describes ("parent stays out of the idle pool until
//! `nchildren == 0`") for free.

use rdma_bytes::{Region, Slice};

use crate::xfc::Xfc;

/// Header fields common to every buffer kind.
#[derive(Debug)]
pub struct BufferHeader {
    /// Offset of this buffer's payload within its own region (non-zero
    /// only for fragments), or, once advertised, the *remote* address a
    /// peer should write to.
    pub remote_addr: u64,
    /// Bytes currently valid/used within the buffer.
    pub nused: usize,
    /// Total bytes allocated to the buffer.
    pub nallocated: usize,
    /// Memory-region key, once registered with the fabric.
    pub key: Option<u64>,
    /// The transfer context dispatched on completion.
    pub xfc: Xfc,
    /// The id an rx/tx controller assigned this buffer when it was handed
    /// to the fabric, echoed back in the completion so the controller can
    /// assert it against its posted FIFO's head.
    pub post_id: u64,
    /// Payload buffers only: how many of `nused` bytes have already been
    /// carved off into fragments and posted. The transmitter advances
    /// this instead of mutating `nused` so a partially fragmented buffer
    /// can stay at the head of `ready_for_cxn` between rounds.
    pub sent_offset: usize,
}

impl BufferHeader {
    fn new(nallocated: usize, xfc: Xfc) -> Self {
        BufferHeader { remote_addr: 0, nused: 0, nallocated, key: None, xfc, post_id: 0, sent_offset: 0 }
    }
}

/// A buffer kind that can be posted through an rx/tx controller: it has an
/// embedded transfer context, a flat byte view usable as a send/recv
/// payload, and an id slot the controller stamps at post time.
pub trait ControlBuffer {
    /// Borrows the embedded transfer context.
    fn xfc(&self) -> &Xfc;
    /// Mutably borrows the embedded transfer context.
    fn xfc_mut(&mut self) -> &mut Xfc;
    /// The id most recently stamped by a controller's `post`.
    fn post_id(&self) -> u64;
    /// Stamps the id a controller assigned at post time.
    fn set_post_id(&mut self, id: u64);
    /// The bytes to send, or the region to receive into.
    fn bytes(&self) -> &[u8];
    /// Overwrites the buffer's contents (used when a `Recv` completion
    /// delivers bytes from the wire) and records how many are valid.
    fn fill(&mut self, bytes: &[u8]);
}

impl ControlBuffer for ProgressBuffer {
    fn xfc(&self) -> &Xfc {
        &self.hdr.xfc
    }
    fn xfc_mut(&mut self) -> &mut Xfc {
        &mut self.hdr.xfc
    }
    fn post_id(&self) -> u64 {
        self.hdr.post_id
    }
    fn set_post_id(&mut self, id: u64) {
        self.hdr.post_id = id;
    }
    fn bytes(&self) -> &[u8] {
        &self.region[..self.hdr.nused]
    }
    fn fill(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(self.region.len());
        self.region.as_mut_slice().expect("no outstanding fragments")[..n].copy_from_slice(&bytes[..n]);
        self.hdr.nused = n;
    }
}

impl ControlBuffer for VectorBuffer {
    fn xfc(&self) -> &Xfc {
        &self.hdr.xfc
    }
    fn xfc_mut(&mut self) -> &mut Xfc {
        &mut self.hdr.xfc
    }
    fn post_id(&self) -> u64 {
        self.hdr.post_id
    }
    fn set_post_id(&mut self, id: u64) {
        self.hdr.post_id = id;
    }
    fn bytes(&self) -> &[u8] {
        &self.region[..self.hdr.nused]
    }
    fn fill(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(self.region.len());
        self.region.as_mut_slice().expect("no outstanding fragments")[..n].copy_from_slice(&bytes[..n]);
        self.hdr.nused = n;
    }
}

/// A flexible payload buffer carrying bytestream contents.
#[derive(Debug)]
pub struct PayloadBuffer {
    /// Common header.
    pub hdr: BufferHeader,
    /// Backing storage, registerable with the fabric as a whole.
    pub region: Region,
}

impl PayloadBuffer {
    /// Allocates a new payload buffer of `size` bytes.
    pub fn new(size: usize, xfc: Xfc) -> Self {
        PayloadBuffer { hdr: BufferHeader::new(size, xfc), region: Region::new(vec![0u8; size].into_boxed_slice()) }
    }

    /// Number of live fragments still borrowing this buffer's region.
    pub fn outstanding_fragments(&self) -> usize {
        self.region.children()
    }

    /// The valid prefix of this buffer's contents, per `hdr.nused`.
    pub fn used(&self) -> &[u8] {
        &self.region[..self.hdr.nused]
    }

    /// Bytes of `used()` not yet carved off into a fragment and posted.
    pub fn remaining_unsent(&self) -> usize {
        self.hdr.nused - self.hdr.sent_offset
    }

    /// Splits off a fragment covering `[offset, offset + len)` of this
    /// buffer's region. The parent retains ownership; the fragment is
    /// independently postable and its completion decrements the parent's
    /// live-fragment count automatically when dropped.
    pub fn split_fragment(&self, offset: usize, len: usize, xfc: Xfc) -> Fragment {
        let slice = self.region.extract_range(offset, len);
        Fragment { hdr: BufferHeader::new(len, xfc), slice, parent_key: self.hdr.key }
    }
}

/// A progress-message buffer.
#[derive(Debug)]
pub struct ProgressBuffer {
    /// Common header.
    pub hdr: BufferHeader,
    /// Backing storage for the fixed-size progress wire encoding.
    pub region: Region,
}

impl ProgressBuffer {
    /// Allocates a new progress buffer sized for the wire encoding.
    pub fn new(size: usize, xfc: Xfc) -> Self {
        ProgressBuffer { hdr: BufferHeader::new(size, xfc), region: Region::new(vec![0u8; size].into_boxed_slice()) }
    }
}

/// A vector-message buffer.
#[derive(Debug)]
pub struct VectorBuffer {
    /// Common header.
    pub hdr: BufferHeader,
    /// Backing storage for the fixed-size vector wire encoding.
    pub region: Region,
}

impl VectorBuffer {
    /// Allocates a new vector buffer sized for the wire encoding.
    pub fn new(size: usize, xfc: Xfc) -> Self {
        VectorBuffer { hdr: BufferHeader::new(size, xfc), region: Region::new(vec![0u8; size].into_boxed_slice()) }
    }
}

/// A fragment of a larger RDMA write: shares its parent's memory-region
/// key and descriptor, records only its own offset and length.
pub struct Fragment {
    /// Common header.
    pub hdr: BufferHeader,
    /// The disjoint window of the parent's region this fragment owns.
    pub slice: Slice,
    /// The parent's memory-region key, required when issuing the write.
    pub parent_key: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xfc::XfcKind;

    #[test]
    fn fragment_keeps_parent_alive_until_dropped() {
        let parent = PayloadBuffer::new(16, Xfc::new(XfcKind::RdmaWrite));
        assert_eq!(parent.outstanding_fragments(), 0);

        let frag_a = parent.split_fragment(0, 8, Xfc::new(XfcKind::Fragment));
        let frag_b = parent.split_fragment(8, 8, Xfc::new(XfcKind::Fragment));
        assert_eq!(parent.outstanding_fragments(), 2);

        drop(frag_a);
        assert_eq!(parent.outstanding_fragments(), 1);
        drop(frag_b);
        assert_eq!(parent.outstanding_fragments(), 0);
    }
}
