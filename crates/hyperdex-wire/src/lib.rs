//! # hyperdex-wire: Inter-server wire protocol
//!
//! Every message is a fixed [`MessageHeader`] followed by a type-specific
//! [`Payload`]. On the TCP transport, each message is additionally framed
//! with a 4-byte length prefix ([`Frame`]).
//!
//! # Layout
//!
//! ```text
//! frame:   [len:u32][message]
//! message: [type:u8][src_out_epoch:u16][dst_in_epoch:u16]
//!          [from:EntityId][to:EntityId][payload...]
//! entity:  [space:u32][subspace:u16][prefix:u8][mask:u64][number:u8]
//! slice:   [len:u32][bytes]
//! vector:  [count:u32][slice...]
//! ```
//!
//! All integers are little-endian. Payload layouts are documented on the
//! [`Payload`] variants.

mod payload;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use hyperdex_types::{EntityId, MessageType, SpaceId};
use thiserror::Error;

pub use payload::Payload;

/// Size of the length prefix on the TCP transport.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Size of the message header: tag + two epochs + two entity ids.
pub const HEADER_SIZE: usize = 1 + 2 + 2 + 2 * EntityId::SERIALIZED_SIZE;

/// Largest accepted frame. Larger frames indicate a corrupt stream.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Errors produced while decoding wire data.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("message truncated")]
    Truncated,
    #[error("unknown message type tag {0}")]
    BadTag(u8),
    #[error("unknown microop action {0}")]
    BadAction(u8),
    #[error("unknown attribute type tag {0}")]
    BadAttrType(u8),
    #[error("frame of {0} bytes exceeds the maximum")]
    Oversize(usize),
}

pub type WireResult<T> = Result<T, WireError>;

// ============================================================================
// Framing
// ============================================================================

/// One length-prefixed frame on the TCP transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Bytes,
}

impl Frame {
    pub fn new(payload: Bytes) -> Self {
        Self { payload }
    }

    /// Appends the frame to a write buffer.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(FRAME_HEADER_SIZE + self.payload.len());
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }

    /// Consumes one complete frame off the front of a read buffer.
    /// `Ok(None)` means more bytes are needed.
    pub fn decode(buf: &mut BytesMut) -> WireResult<Option<Self>> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let len = u32::from_le_bytes(buf[..4].try_into().unwrap()) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(WireError::Oversize(len));
        }
        if buf.len() < FRAME_HEADER_SIZE + len {
            return Ok(None);
        }
        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(len).freeze();
        Ok(Some(Self { payload }))
    }
}

// ============================================================================
// Message header
// ============================================================================

/// The fixed header prepended to every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub msg_type: MessageType,
    pub src_out_epoch: u16,
    pub dst_in_epoch: u16,
    pub from: EntityId,
    pub to: EntityId,
}

impl MessageHeader {
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_SIZE);
        buf.put_u8(self.msg_type.as_u8());
        buf.put_u16_le(self.src_out_epoch);
        buf.put_u16_le(self.dst_in_epoch);
        put_entity(buf, self.from);
        put_entity(buf, self.to);
    }

    pub fn decode(buf: &mut impl Buf) -> WireResult<Self> {
        if buf.remaining() < HEADER_SIZE {
            return Err(WireError::Truncated);
        }
        let tag = buf.get_u8();
        let msg_type = MessageType::from_u8(tag).ok_or(WireError::BadTag(tag))?;
        let src_out_epoch = buf.get_u16_le();
        let dst_in_epoch = buf.get_u16_le();
        let from = get_entity(buf)?;
        let to = get_entity(buf)?;
        Ok(Self { msg_type, src_out_epoch, dst_in_epoch, from, to })
    }
}

fn put_entity(buf: &mut BytesMut, e: EntityId) {
    buf.put_u32_le(e.space.0);
    buf.put_u16_le(e.subspace);
    buf.put_u8(e.prefix);
    buf.put_u64_le(e.mask);
    buf.put_u8(e.number);
}

fn get_entity(buf: &mut impl Buf) -> WireResult<EntityId> {
    if buf.remaining() < EntityId::SERIALIZED_SIZE {
        return Err(WireError::Truncated);
    }
    Ok(EntityId {
        space: SpaceId(buf.get_u32_le()),
        subspace: buf.get_u16_le(),
        prefix: buf.get_u8(),
        mask: buf.get_u64_le(),
        number: buf.get_u8(),
    })
}

// ============================================================================
// Primitives shared with the payload module
// ============================================================================

pub(crate) fn put_slice(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32_le(data.len() as u32);
    buf.put_slice(data);
}

pub(crate) fn get_slice(buf: &mut impl Buf) -> WireResult<Bytes> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated);
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(WireError::Truncated);
    }
    Ok(buf.copy_to_bytes(len))
}

pub(crate) fn put_vector(buf: &mut BytesMut, items: &[Bytes]) {
    buf.put_u32_le(items.len() as u32);
    for item in items {
        put_slice(buf, item);
    }
}

pub(crate) fn get_vector(buf: &mut impl Buf) -> WireResult<Vec<Bytes>> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated);
    }
    let count = buf.get_u32_le() as usize;
    let mut items = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        items.push(get_slice(buf)?);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_needs_complete_bytes() {
        let mut buf = BytesMut::new();
        Frame::new(Bytes::from_static(b"hello")).encode(&mut buf);

        let mut partial = BytesMut::from(&buf[..6]);
        assert_eq!(Frame::decode(&mut partial).unwrap(), None);

        let frame = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.payload.as_ref(), b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn oversize_frame_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le((MAX_FRAME_SIZE + 1) as u32);
        assert!(matches!(Frame::decode(&mut buf), Err(WireError::Oversize(_))));
    }

    #[test]
    fn header_roundtrip() {
        let hdr = MessageHeader {
            msg_type: MessageType::ChainPut,
            src_out_epoch: 3,
            dst_in_epoch: 9,
            from: EntityId::new(SpaceId(1), 0, 4, 0xa000_0000_0000_0000, 1),
            to: EntityId::client(77),
        };
        let mut buf = BytesMut::new();
        hdr.encode_into(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE);
        let decoded = MessageHeader::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, hdr);
    }

    #[test]
    fn header_bad_tag() {
        let mut buf = BytesMut::new();
        buf.put_u8(7); // not a valid tag
        buf.put_slice(&[0u8; HEADER_SIZE - 1]);
        assert_eq!(
            MessageHeader::decode(&mut buf.freeze()),
            Err(WireError::BadTag(7))
        );
    }

    #[test]
    fn header_truncation() {
        let buf = Bytes::from_static(&[64, 0, 0]);
        assert_eq!(MessageHeader::decode(&mut buf.clone()), Err(WireError::Truncated));
    }
}
