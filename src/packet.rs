//! Packets: the typed byte-buffer unit flowing through pipeline queues.
//!
//! A packet carries content bytes, an optional small prefix reserved for
//! framing overhead (chunk introducers, frame headers), and optionally a
//! virtual entity region that a connector materializes lazily.

use std::fmt;
use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::stream::StreamId;

/// Carries message headers.
pub(crate) const HEADER: u8 = 0x1;
/// Carries body bytes.
pub(crate) const DATA: u8 = 0x2;
/// Marks the end of a logical message.
pub(crate) const END: u8 = 0x4;
/// Must not be split or joined with neighboring packets.
pub(crate) const SOLO: u8 = 0x8;

/// Lazily materialized byte source for entity packets, typically a file
/// region handed to the connector.
pub trait EntityFill: Send + Sync {
    /// Read up to `len` bytes starting at absolute position `pos`.
    fn read_at(&self, pos: u64, len: usize) -> io::Result<Bytes>;
}

/// The unit of data flow between pipeline stages.
pub struct Packet {
    pub(crate) flags: u8,
    /// Protocol-specific subtype; the WebSocket filter stores the frame
    /// opcode here.
    pub(crate) kind: u8,
    pub(crate) prefix: BytesMut,
    pub(crate) content: BytesMut,
    /// Final packet of its logical message.
    pub(crate) last: bool,
    pub(crate) epos: u64,
    pub(crate) esize: u64,
    pub(crate) fill: Option<Arc<dyn EntityFill>>,
    /// Owning stream, stamped as the packet leaves its stream's chain.
    pub(crate) stream: Option<StreamId>,
}

impl Packet {
    fn empty(flags: u8) -> Packet {
        Packet {
            flags,
            kind: 0,
            prefix: BytesMut::new(),
            content: BytesMut::new(),
            last: false,
            epos: 0,
            esize: 0,
            fill: None,
            stream: None,
        }
    }

    /// A data packet with pre-allocated content capacity.
    pub fn with_capacity(size: usize) -> Packet {
        let mut packet = Packet::empty(DATA);
        packet.content = BytesMut::with_capacity(size);
        packet
    }

    /// A data packet owning a copy of `bytes`.
    pub fn data(bytes: &[u8]) -> Packet {
        let mut packet = Packet::empty(DATA);
        packet.content.extend_from_slice(bytes);
        packet
    }

    /// The header packet introducing a message.
    pub fn header() -> Packet {
        Packet::empty(HEADER)
    }

    /// The end-of-message packet. Always `last`.
    pub fn end() -> Packet {
        let mut packet = Packet::empty(END);
        packet.last = true;
        packet
    }

    /// A virtual packet describing `size` bytes at `pos` of an entity
    /// source. No bytes are held until a connector materializes them.
    pub fn entity(fill: Arc<dyn EntityFill>, pos: u64, size: u64) -> Packet {
        let mut packet = Packet::empty(DATA);
        packet.fill = Some(fill);
        packet.epos = pos;
        packet.esize = size;
        packet
    }

    /// Byte size of this packet excluding the prefix.
    pub fn len(&self) -> usize {
        self.content.len() + self.esize as usize
    }

    /// Byte size of this packet including the prefix.
    pub(crate) fn wire_len(&self) -> usize {
        self.prefix.len() + self.len()
    }

    /// True when the packet carries no content or entity bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn is_header(&self) -> bool {
        self.flags & HEADER != 0
    }

    pub(crate) fn is_data(&self) -> bool {
        self.flags & DATA != 0
    }

    pub(crate) fn is_end(&self) -> bool {
        self.flags & END != 0
    }

    pub(crate) fn is_solo(&self) -> bool {
        self.flags & SOLO != 0
    }

    /// Split off the bytes from `at` onward into a new packet. The tail
    /// inherits flags, kind and the `last` mark; the head keeps the prefix
    /// and loses `last`. Entity regions split positionally without
    /// materializing.
    pub fn split(&mut self, at: usize) -> Packet {
        debug_assert!(at <= self.len());
        let mut tail = Packet::empty(self.flags);
        tail.kind = self.kind;
        tail.stream = self.stream;
        tail.last = self.last;
        self.last = false;
        if at < self.content.len() {
            tail.content = self.content.split_off(at);
            tail.fill = self.fill.take();
            tail.epos = self.epos;
            tail.esize = self.esize;
            self.epos = 0;
            self.esize = 0;
        } else {
            let entity_at = (at - self.content.len()) as u64;
            if entity_at < self.esize {
                tail.fill = self.fill.clone();
                tail.epos = self.epos + entity_at;
                tail.esize = self.esize - entity_at;
                self.esize = entity_at;
            }
        }
        tail
    }

    /// Concatenate `other`'s content onto this packet. The joined packet
    /// takes over the `last` mark. Entity packets never join.
    pub fn join(&mut self, other: Packet) {
        debug_assert!(self.fill.is_none() && other.fill.is_none());
        self.content.extend_from_slice(&other.content);
        self.last = other.last;
    }
}

impl Clone for Packet {
    fn clone(&self) -> Packet {
        Packet {
            flags: self.flags,
            kind: self.kind,
            prefix: self.prefix.clone(),
            content: self.content.clone(),
            last: self.last,
            epos: self.epos,
            esize: self.esize,
            fill: self.fill.clone(),
            stream: self.stream,
        }
    }
}

// Manual Debug: `fill` is not Debug.
impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("flags", &self.flags)
            .field("len", &self.len())
            .field("prefix", &self.prefix.len())
            .field("last", &self.last)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Zeroes;

    impl EntityFill for Zeroes {
        fn read_at(&self, _pos: u64, len: usize) -> io::Result<Bytes> {
            Ok(Bytes::from(vec![0u8; len]))
        }
    }

    #[test]
    fn split_then_join_restores_bytes() {
        for at in 0..=10 {
            let mut head = Packet::data(b"0123456789");
            head.last = true;
            let tail = head.split(at);
            assert_eq!(head.len() + tail.len(), 10);
            assert!(!head.last);
            assert!(tail.last);
            head.join(tail);
            assert_eq!(&head.content[..], b"0123456789");
            assert!(head.last);
        }
    }

    #[test]
    fn entity_split_is_positional() {
        let fill: Arc<dyn EntityFill> = Arc::new(Zeroes);
        let mut head = Packet::entity(fill, 100, 50);
        let tail = head.split(20);
        assert_eq!(head.esize, 20);
        assert_eq!(head.epos, 100);
        assert_eq!(tail.esize, 30);
        assert_eq!(tail.epos, 120);
        assert_eq!(head.len(), 20);
        assert_eq!(tail.len(), 30);
    }

    #[test]
    fn mixed_split_hands_entity_to_tail() {
        let fill: Arc<dyn EntityFill> = Arc::new(Zeroes);
        let mut p = Packet::data(b"abcd");
        p.fill = Some(fill);
        p.esize = 6;
        let tail = p.split(2);
        assert_eq!(&p.content[..], b"ab");
        assert_eq!(p.esize, 0);
        assert_eq!(&tail.content[..], b"cd");
        assert_eq!(tail.esize, 6);
    }

    #[test]
    fn end_packet_is_last_and_empty() {
        let end = Packet::end();
        assert!(end.is_end());
        assert!(end.last);
        assert!(end.is_empty());
    }
}
