//! On-the-wire message layouts for the four control message kinds.
//!
//! Encoding follows the same `try_read`/`write_to` shape as the teacher's
//! `MessageHeader` (a fixed-size header parsed directly out of a byte
//! slice), but uses explicit little-endian field encoding via `byteorder`
//! instead of an unsafe `Abomonation` transmute, since these messages cross
//! the wire between heterogeneous hosts and must not depend on native
//! struct layout.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

/// Maximum number of advertisement records in one vector message.
pub const MAX_IOVS: usize = 12;

/// Maximum length of an encoded address.
pub const MAX_ADDR_LEN: usize = 512;

/// A 128-bit opaque identifier reserved in the initial message.
///
/// The core protocol never inspects the nonce's value; it exists so that a
/// future multi-source design (see the open question on `nsources`/`id`)
/// has a slot to correlate sources without a wire format change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nonce(pub u128);

impl Nonce {
    /// Generates a nonce from a caller-supplied 128 bits.
    pub fn new(value: u128) -> Self {
        Nonce(value)
    }
}

/// First message sent from transmitter to receiver, over the listen
/// endpoint.
#[derive(Debug, Clone)]
pub struct InitialMessage {
    /// Opaque session identifier.
    pub nonce: Nonce,
    /// Number of sources participating (only `1` is accepted today).
    pub nsources: u32,
    /// This source's id (only `0` is accepted today).
    pub id: u32,
    /// The address the receiver should connect its reply to.
    pub addr: Vec<u8>,
}

impl InitialMessage {
    /// Size in bytes of the fixed-size wire encoding.
    pub const WIRE_LEN: usize = 16 + 4 + 4 + 4 + MAX_ADDR_LEN;

    /// Encodes the message into a fixed-size buffer.
    pub fn write_to(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < Self::WIRE_LEN {
            return Err(Error::protocol("initial message buffer too small"));
        }
        if self.addr.len() > MAX_ADDR_LEN {
            return Err(Error::protocol("address exceeds 512 bytes"));
        }
        LittleEndian::write_u128(&mut buf[0..16], self.nonce.0);
        LittleEndian::write_u32(&mut buf[16..20], self.nsources);
        LittleEndian::write_u32(&mut buf[20..24], self.id);
        LittleEndian::write_u32(&mut buf[24..28], self.addr.len() as u32);
        buf[28..28 + self.addr.len()].copy_from_slice(&self.addr);
        for b in &mut buf[28 + self.addr.len()..Self::WIRE_LEN] {
            *b = 0;
        }
        Ok(())
    }

    /// Decodes a message from a buffer of exactly [`Self::WIRE_LEN`] bytes.
    pub fn try_read(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::WIRE_LEN {
            return Err(Error::protocol("initial message truncated"));
        }
        let nonce = Nonce(LittleEndian::read_u128(&buf[0..16]));
        let nsources = LittleEndian::read_u32(&buf[16..20]);
        let id = LittleEndian::read_u32(&buf[20..24]);
        let addrlen = LittleEndian::read_u32(&buf[24..28]) as usize;
        if addrlen > MAX_ADDR_LEN {
            return Err(Error::protocol("initial message addrlen out of range"));
        }
        let addr = buf[28..28 + addrlen].to_vec();
        Ok(InitialMessage { nonce, nsources, id, addr })
    }
}

/// Receiver's reply, carrying the address of the connection-specific
/// endpoint the transmitter must send RDMA writes to.
#[derive(Debug, Clone)]
pub struct AckMessage {
    /// The connection-specific address to redirect writes to.
    pub addr: Vec<u8>,
}

impl AckMessage {
    /// Size in bytes of the fixed-size wire encoding.
    pub const WIRE_LEN: usize = 4 + MAX_ADDR_LEN;

    /// Encodes the message into a fixed-size buffer.
    pub fn write_to(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < Self::WIRE_LEN {
            return Err(Error::protocol("ack message buffer too small"));
        }
        if self.addr.len() > MAX_ADDR_LEN {
            return Err(Error::protocol("address exceeds 512 bytes"));
        }
        LittleEndian::write_u32(&mut buf[0..4], self.addr.len() as u32);
        buf[4..4 + self.addr.len()].copy_from_slice(&self.addr);
        for b in &mut buf[4 + self.addr.len()..Self::WIRE_LEN] {
            *b = 0;
        }
        Ok(())
    }

    /// Decodes a message from a buffer of exactly [`Self::WIRE_LEN`] bytes.
    pub fn try_read(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::WIRE_LEN {
            return Err(Error::protocol("ack message truncated"));
        }
        let addrlen = LittleEndian::read_u32(&buf[0..4]) as usize;
        if addrlen > MAX_ADDR_LEN {
            return Err(Error::protocol("ack message addrlen out of range"));
        }
        let addr = buf[4..4 + addrlen].to_vec();
        Ok(AckMessage { addr })
    }
}

/// One RDMA-target advertisement: where the transmitter may write, how
/// much, and with which memory-region key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IovRecord {
    /// Remote address (an offset within the advertised region, never an
    /// absolute virtual address; see capability requirements).
    pub addr: u64,
    /// Number of bytes available at `addr`.
    pub len: u64,
    /// Memory-region key the writer must present.
    pub key: u64,
}

impl IovRecord {
    /// Size in bytes of one encoded record.
    pub const WIRE_LEN: usize = 24;

    fn write_to(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(&mut buf[0..8], self.addr);
        LittleEndian::write_u64(&mut buf[8..16], self.len);
        LittleEndian::write_u64(&mut buf[16..24], self.key);
    }

    fn read_from(buf: &[u8]) -> Self {
        IovRecord {
            addr: LittleEndian::read_u64(&buf[0..8]),
            len: LittleEndian::read_u64(&buf[8..16]),
            key: LittleEndian::read_u64(&buf[16..24]),
        }
    }
}

/// A batch of up to [`MAX_IOVS`] advertisements. `count == 0` signals the
/// receiver's EOF.
#[derive(Debug, Clone)]
pub struct VectorMessage {
    /// The advertisements, `records[..count]` valid.
    pub records: Vec<IovRecord>,
}

impl VectorMessage {
    const HEADER_LEN: usize = 4;

    /// Size in bytes of the fixed-size wire encoding (always transmits the
    /// maximum number of record slots; unused slots are zeroed).
    pub const WIRE_LEN: usize = Self::HEADER_LEN + MAX_IOVS * IovRecord::WIRE_LEN;

    /// Builds an empty (EOF) vector message.
    pub fn eof() -> Self {
        VectorMessage { records: Vec::new() }
    }

    /// Encodes the message. The wire length is always [`Self::WIRE_LEN`];
    /// this is the only length the peer will accept (see
    /// [`Self::wire_len_for`]).
    pub fn write_to(&self, buf: &mut [u8]) -> Result<()> {
        if self.records.len() > MAX_IOVS {
            return Err(Error::protocol("vector message exceeds 12 records"));
        }
        if buf.len() < Self::WIRE_LEN {
            return Err(Error::protocol("vector message buffer too small"));
        }
        LittleEndian::write_u32(&mut buf[0..4], self.records.len() as u32);
        for (i, slot) in buf[Self::HEADER_LEN..].chunks_mut(IovRecord::WIRE_LEN).enumerate() {
            if i < self.records.len() {
                self.records[i].write_to(slot);
            } else {
                slot.fill(0);
            }
        }
        Ok(())
    }

    /// Decodes a message. `buf` must be exactly [`Self::WIRE_LEN`] bytes;
    /// any other length is a malformed message (see §8's quantified
    /// invariant on vector-message wire length) and is rejected.
    pub fn try_read(buf: &[u8]) -> Result<Self> {
        if buf.len() != Self::WIRE_LEN {
            return Err(Error::protocol(format!(
                "vector message has wire length {}, expected {}",
                buf.len(),
                Self::WIRE_LEN
            )));
        }
        let count = LittleEndian::read_u32(&buf[0..4]) as usize;
        if count > MAX_IOVS {
            return Err(Error::protocol("vector message declares more than 12 records"));
        }
        let mut records = Vec::with_capacity(count);
        for slot in buf[Self::HEADER_LEN..].chunks(IovRecord::WIRE_LEN).take(count) {
            records.push(IovRecord::read_from(slot));
        }
        Ok(VectorMessage { records })
    }

    /// `true` when this message is the empty-count EOF marker.
    pub fn is_eof(&self) -> bool {
        self.records.is_empty()
    }
}

/// A progress acknowledgement: bytes filled since the last progress
/// message, and bytes still expected (`0` signals transmitter's EOF).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressMessage {
    /// Bytes the sender has observed as delivery-complete since the
    /// previous progress message.
    pub nfilled: u64,
    /// Non-zero while more payload remains; `0` marks EOF.
    pub nleftover: u64,
}

impl ProgressMessage {
    /// Size in bytes of the fixed-size wire encoding.
    pub const WIRE_LEN: usize = 16;

    /// Encodes the message into a fixed-size buffer.
    pub fn write_to(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < Self::WIRE_LEN {
            return Err(Error::protocol("progress message buffer too small"));
        }
        LittleEndian::write_u64(&mut buf[0..8], self.nfilled);
        LittleEndian::write_u64(&mut buf[8..16], self.nleftover);
        Ok(())
    }

    /// Decodes a message from a buffer of exactly [`Self::WIRE_LEN`] bytes.
    pub fn try_read(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::WIRE_LEN {
            return Err(Error::protocol("progress message truncated"));
        }
        Ok(ProgressMessage {
            nfilled: LittleEndian::read_u64(&buf[0..8]),
            nleftover: LittleEndian::read_u64(&buf[8..16]),
        })
    }

    /// `true` when this message is the zero-leftover EOF marker.
    pub fn is_eof(&self) -> bool {
        self.nleftover == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_message_round_trips() {
        let msg = InitialMessage { nonce: Nonce::new(0x1122_3344_5566_7788_99aa_bbcc_ddee_ff00), nsources: 1, id: 0, addr: b"10.0.0.1:4242".to_vec() };
        let mut buf = vec![0u8; InitialMessage::WIRE_LEN];
        msg.write_to(&mut buf).unwrap();
        let back = InitialMessage::try_read(&buf).unwrap();
        assert_eq!(back.nonce, msg.nonce);
        assert_eq!(back.nsources, 1);
        assert_eq!(back.id, 0);
        assert_eq!(back.addr, msg.addr);
    }

    #[test]
    fn ack_message_round_trips() {
        let msg = AckMessage { addr: b"127.0.0.1:55001".to_vec() };
        let mut buf = vec![0u8; AckMessage::WIRE_LEN];
        msg.write_to(&mut buf).unwrap();
        let back = AckMessage::try_read(&buf).unwrap();
        assert_eq!(back.addr, msg.addr);
    }

    #[test]
    fn vector_message_round_trips_and_signals_eof() {
        let msg = VectorMessage {
            records: vec![IovRecord { addr: 10, len: 20, key: 30 }, IovRecord { addr: 40, len: 50, key: 60 }],
        };
        let mut buf = vec![0u8; VectorMessage::WIRE_LEN];
        msg.write_to(&mut buf).unwrap();
        let back = VectorMessage::try_read(&buf).unwrap();
        assert_eq!(back.records, msg.records);
        assert!(!back.is_eof());

        let eof = VectorMessage::eof();
        let mut buf = vec![0u8; VectorMessage::WIRE_LEN];
        eof.write_to(&mut buf).unwrap();
        let back = VectorMessage::try_read(&buf).unwrap();
        assert!(back.is_eof());
    }

    #[test]
    fn vector_message_rejects_wrong_wire_length() {
        let buf = vec![0u8; VectorMessage::WIRE_LEN - 1];
        assert!(VectorMessage::try_read(&buf).is_err());
        let buf = vec![0u8; VectorMessage::WIRE_LEN + 1];
        assert!(VectorMessage::try_read(&buf).is_err());
    }

    #[test]
    fn vector_message_rejects_too_many_records() {
        let records = (0..13).map(|i| IovRecord { addr: i, len: i, key: i }).collect();
        let msg = VectorMessage { records };
        let mut buf = vec![0u8; VectorMessage::WIRE_LEN];
        assert!(msg.write_to(&mut buf).is_err());
    }

    #[test]
    fn progress_message_round_trips_and_signals_eof() {
        let msg = ProgressMessage { nfilled: 128, nleftover: 0 };
        let mut buf = vec![0u8; ProgressMessage::WIRE_LEN];
        msg.write_to(&mut buf).unwrap();
        let back = ProgressMessage::try_read(&buf).unwrap();
        assert_eq!(back, msg);
        assert!(back.is_eof());
    }
}
