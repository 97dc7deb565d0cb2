//! The transfer-context discriminator embedded in every outstanding fabric
//! operation.
//!
//! The fabric never tells the engine what kind of operation completed —
//! only which context. So every buffer carries one of these, tagged with
//! its kind, and the completion path dispatches purely on the tag. This is
//! the "polymorphism by embedded tag" pattern: a plain tagged `enum`
//! instead of the source's inheritance-flavored struct, because Rust gives
//! us a sum type directly.

/// What kind of fabric operation this context was attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XfcKind {
    /// A progress-message send or receive.
    Progress,
    /// An RDMA write.
    RdmaWrite,
    /// A vector-message send or receive.
    Vector,
    /// A fragment of a larger RDMA write.
    Fragment,
}

/// Who currently owns the buffer this context is embedded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// The program may read or mutate the buffer.
    Program,
    /// The fabric has an outstanding operation referencing this context;
    /// the program must not touch the buffer until ownership flips back.
    Nic,
}

/// Position of a buffer within a scatter-gather RDMA write's posted
/// sequence. A single-buffer write is both `first` and `last`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Place {
    /// This is the first buffer posted for the write.
    pub first: bool,
    /// This is the last buffer posted for the write.
    pub last: bool,
}

/// The transfer context embedded in a buffer header.
#[derive(Debug, Clone, Copy)]
pub struct Xfc {
    /// Which component posted (and must field the completion of) this
    /// operation.
    pub kind: XfcKind,
    /// Program vs. NIC ownership of the buffer.
    pub owner: Owner,
    /// Scatter-gather placement, relevant only for `RdmaWrite`/`Fragment`.
    pub place: Place,
    /// Outstanding child count, relevant only to a fragment's parent.
    pub nchildren: u32,
    /// Set when this operation has been asked to cancel; a completion with
    /// error code "cancelled" on a context so marked is success-equivalent.
    pub cancelled: bool,
}

impl Xfc {
    /// Builds a fresh, program-owned context of the given kind.
    pub fn new(kind: XfcKind) -> Self {
        Xfc { kind, owner: Owner::Program, place: Place::default(), nchildren: 0, cancelled: false }
    }

    /// Hands the buffer to the fabric: flips ownership to `Nic`.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is already NIC-owned: posting an operation on
    /// a buffer that is already outstanding is a fatal invariant
    /// violation, not a recoverable condition.
    pub fn post(&mut self) {
        assert_eq!(self.owner, Owner::Program, "posting an already-outstanding buffer");
        self.owner = Owner::Nic;
    }

    /// Flips ownership back to the program on completion.
    pub fn complete(&mut self) {
        self.owner = Owner::Program;
    }

    /// Marks this context cancelled, for `fifo_cancel` to act on.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }
}
