//! Wire protocol: message kinds and the packed 16-byte header.
//!
//! Every protocol message starts with a fixed-size little-endian header.
//! Only `SetValue` carries a trailing payload; its length is in `aux`, and
//! the payload bytes follow the header immediately on the same channel (the
//! transport's paired send keeps them contiguous).
//!
//! Layout (packed, little-endian):
//!
//! | offset | size | field                                    |
//! |-------:|-----:|------------------------------------------|
//! |      0 |    4 | kind                                     |
//! |      4 |    4 | variable or barrier site id              |
//! |      8 |    8 | aux: node id, or payload size for values |

use bytes::Buf;
use bytes::BufMut;
use thiserror::Error;

use crate::site::SiteId;

/// Size in bytes of the fixed message header.
pub const HEADER_LEN: usize = 16;

/// Discriminant of a protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MsgKind {
    /// A node wants to write a variable it does not own. `aux` is the
    /// requester's node id. Broadcast; only the current owner grants.
    ReqOwn = 1,
    /// The owner hands ownership to the requester. `aux` is the granter.
    GrantOwn = 2,
    /// A non-owner redirects a requester to its best guess of the current
    /// owner. `aux` is the hinted owner's node id.
    SetOwner = 3,
    /// A node wants the current value of a variable it holds stale. `aux`
    /// is the requester's node id.
    AskValue = 4,
    /// Carries a variable's current bytes. `aux` is the payload size; that
    /// many bytes follow the header.
    SetValue = 5,
    /// A participant has reached a barrier. `aux` is the sender's node id.
    BarrierEnter = 6,
    /// The coordinator releases a completed barrier round.
    BarrierRelease = 7,
    /// A shared-state owner tells caches to discard their copies. `aux` is
    /// the invalidating node's id.
    Invalidate = 8,
    /// Acknowledges an [`MsgKind::Invalidate`]. `aux` is the acknowledger.
    InvalAck = 9,
}

impl MsgKind {
    /// Decode a raw discriminant.
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::ReqOwn),
            2 => Some(Self::GrantOwn),
            3 => Some(Self::SetOwner),
            4 => Some(Self::AskValue),
            5 => Some(Self::SetValue),
            6 => Some(Self::BarrierEnter),
            7 => Some(Self::BarrierRelease),
            8 => Some(Self::Invalidate),
            9 => Some(Self::InvalAck),
            _ => None,
        }
    }

    /// Whether messages of this kind carry a trailing payload.
    pub fn has_payload(self) -> bool {
        matches!(self, Self::SetValue)
    }
}

/// Error produced when decoding a header off the wire.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// The kind field holds a discriminant this node does not understand.
    #[error("unrecognized message kind {kind}")]
    UnknownKind {
        /// The raw discriminant received.
        kind: u32,
    },
}

/// The fixed header that starts every protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Message discriminant.
    pub kind: MsgKind,
    /// Variable id or barrier site id the message concerns.
    pub id: SiteId,
    /// Node id or payload size, depending on `kind`.
    pub aux: u64,
}

impl Header {
    /// Build a header.
    pub fn new(kind: MsgKind, id: SiteId, aux: u64) -> Self {
        Self { kind, id, aux }
    }

    /// Encode into the packed wire representation.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        let mut cursor = &mut buf[..];
        cursor.put_u32_le(self.kind as u32);
        cursor.put_u32_le(self.id);
        cursor.put_u64_le(self.aux);
        buf
    }

    /// Decode from the packed wire representation.
    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self, WireError> {
        let mut cursor = &buf[..];
        let raw_kind = cursor.get_u32_le();
        let id = cursor.get_u32_le();
        let aux = cursor.get_u64_le();
        let kind = MsgKind::from_u32(raw_kind).ok_or(WireError::UnknownKind { kind: raw_kind })?;
        Ok(Self { kind, id, aux })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrips_every_kind() {
        for raw in 1..=9u32 {
            let kind = MsgKind::from_u32(raw).unwrap();
            let header = Header::new(kind, 0xDEAD_BEEF, 7);
            let decoded = Header::decode(&header.encode()).unwrap();
            assert_eq!(decoded, header);
        }
    }

    #[test]
    fn layout_is_packed_little_endian() {
        let header = Header::new(MsgKind::SetValue, 0x0403_0201, 0x0C0B_0A09_0807_0605);
        let bytes = header.encode();
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(&bytes[0..4], &[5, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &[1, 2, 3, 4]);
        assert_eq!(&bytes[8..16], &[5, 6, 7, 8, 9, 10, 11, 12]);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut bytes = Header::new(MsgKind::ReqOwn, 1, 1).encode();
        bytes[0] = 42;
        assert_eq!(Header::decode(&bytes), Err(WireError::UnknownKind { kind: 42 }));
    }

    #[test]
    fn only_set_value_carries_a_payload() {
        for raw in 1..=9u32 {
            let kind = MsgKind::from_u32(raw).unwrap();
            assert_eq!(kind.has_payload(), kind == MsgKind::SetValue);
        }
    }
}
