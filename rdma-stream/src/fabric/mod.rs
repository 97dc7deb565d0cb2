//! The fabric collaborator: a narrow trait abstracting endpoint creation,
//! memory registration, posting operations, and polling completions.
//!
//! The data-plane engine (receiver/transmitter state machines, rx/tx
//! controllers) never depends on a concrete transport — only on
//! [`Endpoint`]. This keeps the engine testable against, and honest about,
//! the actual contract it needs from "the fabric": post an operation,
//! later learn of its completion via a tagged id, and treat "would block"
//! as a distinguished, non-fatal outcome. One concrete implementation is
//! provided, [`tcp`], which realizes RDMA-write semantics over ordinary
//! TCP sockets; it is not a wire-compatible reimplementation of any real
//! fabric provider (excluded by the non-goals), only a vehicle to make the
//! protocol runnable and testable on ordinary hosts.

pub mod tcp;

use crate::error::Result;

bitflags::bitflags! {
    /// Capability bits a provider must advertise for this protocol to run.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        /// Two-sided send/receive messaging.
        const MSG = 0b0001;
        /// One-sided remote memory access.
        const RMA = 0b0010;
        /// Remote-write permission on registered regions.
        const REMOTE_WRITE = 0b0100;
        /// RDMA write operation support.
        const WRITE = 0b1000;
    }
}

impl Capabilities {
    /// The capability set this protocol requires of any provider.
    pub fn required() -> Self {
        Capabilities::MSG | Capabilities::RMA | Capabilities::REMOTE_WRITE | Capabilities::WRITE
    }
}

/// One local scatter-gather segment of an outgoing RDMA write: bytes to
/// send, and where they land in the remote target (identified by the
/// target's memory-region key plus an offset within it).
pub struct WriteSegment<'a> {
    /// Bytes to write.
    pub bytes: &'a [u8],
    /// Memory-region key of the remote target.
    pub remote_key: u64,
    /// Byte offset within the remote target's region.
    pub remote_offset: u64,
}

/// What kind of operation a [`Completion`] reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKind {
    /// A posted send has left the local side.
    Send,
    /// Bytes have arrived on the control channel.
    Recv,
    /// An RDMA write (single- or multi-segment) is delivery-complete: the
    /// bytes are visible at the remote memory, not merely sent.
    Write,
}

/// An event dequeued from an endpoint's completion queue.
pub struct Completion {
    /// Echoes the id supplied when the operation was posted, so the
    /// engine can assert it against the head of its own posted FIFO
    /// (mirrors asserting the completion's xfc pointer against the FIFO
    /// head invariant).
    pub id: u64,
    /// Which kind of operation completed.
    pub kind: CompletionKind,
    /// For `Recv`, the bytes received. Empty otherwise.
    pub bytes: Vec<u8>,
    /// Total bytes written, for `Write`.
    pub len: usize,
    /// Whether this completion reflects a cancelled operation rather
    /// than success; callers should treat this as success-equivalent.
    pub cancelled: bool,
}

/// The fabric operations the data-plane engine needs from a connection's
/// endpoint. All methods are non-blocking; `poll` returns `None` rather
/// than blocking when nothing is ready ("transient-again").
pub trait Endpoint: Send {
    /// Capabilities this endpoint's provider advertises.
    fn capabilities(&self) -> Capabilities;

    /// Posts a one-sided send of `bytes` on the control channel, tagged
    /// with `id`.
    fn post_send(&self, id: u64, bytes: &[u8]) -> Result<()>;

    /// Posts a (possibly multi-segment) RDMA write, tagged with `id`. A
    /// single completion is later delivered for the whole write, exactly
    /// as a real provider would deliver one completion per `fi_writemsg`.
    fn post_write(&self, id: u64, segments: &[WriteSegment<'_>]) -> Result<()>;

    /// Registers `len` bytes starting at `ptr` as an RDMA-writable target
    /// under `key`. The caller guarantees the referenced memory is not
    /// touched again until the buffer is deregistered or the connection
    /// closes.
    ///
    /// # Safety
    ///
    /// `ptr` must remain valid for `len` bytes until deregistration.
    unsafe fn register_target(&self, key: u64, ptr: *mut u8, len: usize);

    /// Removes a previously registered target. Safe to call on a key that
    /// was never registered (no-op).
    fn deregister_target(&self, key: u64);

    /// Polls for a single completion, returning `None` if nothing is
    /// ready yet ("transient-again" — the caller should retry on its next
    /// loop iteration, not treat this as an error).
    fn poll(&self) -> Option<Completion>;

    /// Requests cancellation of every outstanding operation. Their
    /// eventual completions will carry `cancelled = true`.
    fn cancel_all(&self);

    /// Signals a clean shutdown: no more sends/writes will be posted.
    fn close(&self);
}
