//! Type-specific message payloads.
//!
//! A payload is decoded with the message type from the header in hand;
//! encoding derives the type from the variant. Layouts follow the fixed
//! protocol:
//!
//! ```text
//! REQ_GET          <nonce u64><key slice>
//! RESP_GET         <nonce u64><code u16><value vector>
//! REQ_PUT          <nonce u64><key slice><nattrs u32>(<attr u16><value slice>)*
//! REQ_CONDPUT      <nonce u64><key slice><conds...><attrs...>
//! REQ_DEL          <nonce u64><key slice>
//! REQ_ATOMIC       <nonce u64><key slice><nops u32><microop...>
//! RESP_PUT/CONDPUT/DEL/ATOMIC   <nonce u64><code u16>
//! REQ_SEARCH_START <nonce u64><search_id u64><arity u32><nterms u32>(<attr u16><value slice>)*
//! REQ_SEARCH_NEXT  <nonce u64><search_id u64>
//! REQ_SEARCH_STOP  <nonce u64><search_id u64>
//! RESP_SEARCH_ITEM <nonce u64><key slice><value vector>
//! RESP_SEARCH_DONE <nonce u64>
//! CHAIN_PUT        <version u64><fresh u8><key slice><value vector>
//! CHAIN_DEL        <version u64><key slice>
//! CHAIN_PENDING    <version u64><key slice>
//! CHAIN_SUBSPACE   <version u64><key slice><value vector><nextpoint u64>
//! CHAIN_ACK        <version u64><key slice>
//! XFER_MORE        (empty)
//! XFER_DATA        <xfer_num u64><has_value u8><version u64><key slice><value vector>
//! XFER_DONE        (empty)
//! CONFIGMISMATCH   (empty)
//! PACKET_NOP       (empty)
//! microop:         <attr u16><type u8><action u8><arg_int i64><arg slice>
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use hyperdex_types::{
    AttributeType, MessageType, Microop, MicroopAction, ScalarType,
};

use crate::{WireError, WireResult, get_slice, get_vector, put_slice, put_vector};

/// A decoded message payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    ReqGet { nonce: u64, key: Bytes },
    RespGet { nonce: u64, code: u16, value: Vec<Bytes> },
    ReqPut { nonce: u64, key: Bytes, attrs: Vec<(u16, Bytes)> },
    RespPut { nonce: u64, code: u16 },
    ReqCondput { nonce: u64, key: Bytes, conds: Vec<(u16, Bytes)>, attrs: Vec<(u16, Bytes)> },
    RespCondput { nonce: u64, code: u16 },
    ReqDel { nonce: u64, key: Bytes },
    RespDel { nonce: u64, code: u16 },
    ReqAtomic { nonce: u64, key: Bytes, ops: Vec<Microop> },
    RespAtomic { nonce: u64, code: u16 },

    ReqSearchStart { nonce: u64, search_id: u64, arity: u32, terms: Vec<(u16, Bytes)> },
    ReqSearchNext { nonce: u64, search_id: u64 },
    ReqSearchStop { nonce: u64, search_id: u64 },
    RespSearchItem { nonce: u64, key: Bytes, value: Vec<Bytes> },
    RespSearchDone { nonce: u64 },

    ChainPut { version: u64, fresh: bool, key: Bytes, value: Vec<Bytes> },
    ChainDel { version: u64, key: Bytes },
    ChainPending { version: u64, key: Bytes },
    ChainSubspace { version: u64, key: Bytes, value: Vec<Bytes>, nextpoint: u64 },
    ChainAck { version: u64, key: Bytes },

    XferMore,
    XferData { xfer_num: u64, has_value: bool, version: u64, key: Bytes, value: Vec<Bytes> },
    XferDone,

    ConfigMismatch,
    PacketNop,
}

impl Payload {
    /// The message type this payload travels under.
    pub fn message_type(&self) -> MessageType {
        use MessageType as M;
        match self {
            Payload::ReqGet { .. } => M::ReqGet,
            Payload::RespGet { .. } => M::RespGet,
            Payload::ReqPut { .. } => M::ReqPut,
            Payload::RespPut { .. } => M::RespPut,
            Payload::ReqCondput { .. } => M::ReqCondput,
            Payload::RespCondput { .. } => M::RespCondput,
            Payload::ReqDel { .. } => M::ReqDel,
            Payload::RespDel { .. } => M::RespDel,
            Payload::ReqAtomic { .. } => M::ReqAtomic,
            Payload::RespAtomic { .. } => M::RespAtomic,
            Payload::ReqSearchStart { .. } => M::ReqSearchStart,
            Payload::ReqSearchNext { .. } => M::ReqSearchNext,
            Payload::ReqSearchStop { .. } => M::ReqSearchStop,
            Payload::RespSearchItem { .. } => M::RespSearchItem,
            Payload::RespSearchDone { .. } => M::RespSearchDone,
            Payload::ChainPut { .. } => M::ChainPut,
            Payload::ChainDel { .. } => M::ChainDel,
            Payload::ChainPending { .. } => M::ChainPending,
            Payload::ChainSubspace { .. } => M::ChainSubspace,
            Payload::ChainAck { .. } => M::ChainAck,
            Payload::XferMore => M::XferMore,
            Payload::XferData { .. } => M::XferData,
            Payload::XferDone => M::XferDone,
            Payload::ConfigMismatch => M::ConfigMismatch,
            Payload::PacketNop => M::PacketNop,
        }
    }

    /// Appends the serialized payload to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Payload::ReqGet { nonce, key }
            | Payload::ReqDel { nonce, key } => {
                buf.put_u64_le(*nonce);
                put_slice(buf, key);
            }
            Payload::RespGet { nonce, code, value } => {
                buf.put_u64_le(*nonce);
                buf.put_u16_le(*code);
                put_vector(buf, value);
            }
            Payload::ReqPut { nonce, key, attrs } => {
                buf.put_u64_le(*nonce);
                put_slice(buf, key);
                put_attrs(buf, attrs);
            }
            Payload::ReqCondput { nonce, key, conds, attrs } => {
                buf.put_u64_le(*nonce);
                put_slice(buf, key);
                put_attrs(buf, conds);
                put_attrs(buf, attrs);
            }
            Payload::RespPut { nonce, code }
            | Payload::RespCondput { nonce, code }
            | Payload::RespDel { nonce, code }
            | Payload::RespAtomic { nonce, code } => {
                buf.put_u64_le(*nonce);
                buf.put_u16_le(*code);
            }
            Payload::ReqAtomic { nonce, key, ops } => {
                buf.put_u64_le(*nonce);
                put_slice(buf, key);
                buf.put_u32_le(ops.len() as u32);
                for op in ops {
                    put_microop(buf, op);
                }
            }
            Payload::ReqSearchStart { nonce, search_id, arity, terms } => {
                buf.put_u64_le(*nonce);
                buf.put_u64_le(*search_id);
                buf.put_u32_le(*arity);
                put_attrs(buf, terms);
            }
            Payload::ReqSearchNext { nonce, search_id }
            | Payload::ReqSearchStop { nonce, search_id } => {
                buf.put_u64_le(*nonce);
                buf.put_u64_le(*search_id);
            }
            Payload::RespSearchItem { nonce, key, value } => {
                buf.put_u64_le(*nonce);
                put_slice(buf, key);
                put_vector(buf, value);
            }
            Payload::RespSearchDone { nonce } => {
                buf.put_u64_le(*nonce);
            }
            Payload::ChainPut { version, fresh, key, value } => {
                buf.put_u64_le(*version);
                buf.put_u8(u8::from(*fresh));
                put_slice(buf, key);
                put_vector(buf, value);
            }
            Payload::ChainDel { version, key }
            | Payload::ChainPending { version, key }
            | Payload::ChainAck { version, key } => {
                buf.put_u64_le(*version);
                put_slice(buf, key);
            }
            Payload::ChainSubspace { version, key, value, nextpoint } => {
                buf.put_u64_le(*version);
                put_slice(buf, key);
                put_vector(buf, value);
                buf.put_u64_le(*nextpoint);
            }
            Payload::XferData { xfer_num, has_value, version, key, value } => {
                buf.put_u64_le(*xfer_num);
                buf.put_u8(u8::from(*has_value));
                buf.put_u64_le(*version);
                put_slice(buf, key);
                put_vector(buf, value);
            }
            Payload::XferMore
            | Payload::XferDone
            | Payload::ConfigMismatch
            | Payload::PacketNop => {}
        }
    }

    /// Decodes the payload for a message of type `msg_type`.
    pub fn decode(msg_type: MessageType, buf: &mut impl Buf) -> WireResult<Self> {
        use MessageType as M;
        let payload = match msg_type {
            M::ReqGet => Payload::ReqGet { nonce: get_u64(buf)?, key: get_slice(buf)? },
            M::RespGet => Payload::RespGet {
                nonce: get_u64(buf)?,
                code: get_u16(buf)?,
                value: get_vector(buf)?,
            },
            M::ReqPut => Payload::ReqPut {
                nonce: get_u64(buf)?,
                key: get_slice(buf)?,
                attrs: get_attrs(buf)?,
            },
            M::RespPut => Payload::RespPut { nonce: get_u64(buf)?, code: get_u16(buf)? },
            M::ReqCondput => Payload::ReqCondput {
                nonce: get_u64(buf)?,
                key: get_slice(buf)?,
                conds: get_attrs(buf)?,
                attrs: get_attrs(buf)?,
            },
            M::RespCondput => Payload::RespCondput { nonce: get_u64(buf)?, code: get_u16(buf)? },
            M::ReqDel => Payload::ReqDel { nonce: get_u64(buf)?, key: get_slice(buf)? },
            M::RespDel => Payload::RespDel { nonce: get_u64(buf)?, code: get_u16(buf)? },
            M::ReqAtomic => {
                let nonce = get_u64(buf)?;
                let key = get_slice(buf)?;
                let nops = get_u32(buf)? as usize;
                let mut ops = Vec::with_capacity(nops.min(1024));
                for _ in 0..nops {
                    ops.push(get_microop(buf)?);
                }
                Payload::ReqAtomic { nonce, key, ops }
            }
            M::RespAtomic => Payload::RespAtomic { nonce: get_u64(buf)?, code: get_u16(buf)? },
            M::ReqSearchStart => Payload::ReqSearchStart {
                nonce: get_u64(buf)?,
                search_id: get_u64(buf)?,
                arity: get_u32(buf)?,
                terms: get_attrs(buf)?,
            },
            M::ReqSearchNext => Payload::ReqSearchNext {
                nonce: get_u64(buf)?,
                search_id: get_u64(buf)?,
            },
            M::ReqSearchStop => Payload::ReqSearchStop {
                nonce: get_u64(buf)?,
                search_id: get_u64(buf)?,
            },
            M::RespSearchItem => Payload::RespSearchItem {
                nonce: get_u64(buf)?,
                key: get_slice(buf)?,
                value: get_vector(buf)?,
            },
            M::RespSearchDone => Payload::RespSearchDone { nonce: get_u64(buf)? },
            M::ChainPut => Payload::ChainPut {
                version: get_u64(buf)?,
                fresh: get_u8(buf)? != 0,
                key: get_slice(buf)?,
                value: get_vector(buf)?,
            },
            M::ChainDel => Payload::ChainDel { version: get_u64(buf)?, key: get_slice(buf)? },
            M::ChainPending => {
                Payload::ChainPending { version: get_u64(buf)?, key: get_slice(buf)? }
            }
            M::ChainSubspace => Payload::ChainSubspace {
                version: get_u64(buf)?,
                key: get_slice(buf)?,
                value: get_vector(buf)?,
                nextpoint: get_u64(buf)?,
            },
            M::ChainAck => Payload::ChainAck { version: get_u64(buf)?, key: get_slice(buf)? },
            M::XferMore => Payload::XferMore,
            M::XferData => Payload::XferData {
                xfer_num: get_u64(buf)?,
                has_value: get_u8(buf)? != 0,
                version: get_u64(buf)?,
                key: get_slice(buf)?,
                value: get_vector(buf)?,
            },
            M::XferDone => Payload::XferDone,
            M::ConfigMismatch => Payload::ConfigMismatch,
            M::PacketNop => Payload::PacketNop,
        };
        Ok(payload)
    }
}

// ============================================================================
// Attribute-type and microop encoding
// ============================================================================

fn attr_type_tag(ty: AttributeType) -> u8 {
    match ty {
        AttributeType::String => 1,
        AttributeType::Int64 => 2,
        AttributeType::Float => 3,
        AttributeType::Document => 4,
        AttributeType::List(ScalarType::String) => 5,
        AttributeType::List(ScalarType::Int64) => 6,
        AttributeType::List(ScalarType::Float) => 7,
        AttributeType::Set(ScalarType::String) => 8,
        AttributeType::Set(ScalarType::Int64) => 9,
        AttributeType::Set(ScalarType::Float) => 10,
        AttributeType::Map(ScalarType::String, ScalarType::String) => 11,
        AttributeType::Map(ScalarType::String, ScalarType::Int64) => 12,
        AttributeType::Map(ScalarType::Int64, ScalarType::String) => 13,
        AttributeType::Map(ScalarType::Int64, ScalarType::Int64) => 14,
        AttributeType::Map(_, _) => 15,
    }
}

fn attr_type_from_tag(tag: u8) -> WireResult<AttributeType> {
    let ty = match tag {
        1 => AttributeType::String,
        2 => AttributeType::Int64,
        3 => AttributeType::Float,
        4 => AttributeType::Document,
        5 => AttributeType::List(ScalarType::String),
        6 => AttributeType::List(ScalarType::Int64),
        7 => AttributeType::List(ScalarType::Float),
        8 => AttributeType::Set(ScalarType::String),
        9 => AttributeType::Set(ScalarType::Int64),
        10 => AttributeType::Set(ScalarType::Float),
        11 => AttributeType::Map(ScalarType::String, ScalarType::String),
        12 => AttributeType::Map(ScalarType::String, ScalarType::Int64),
        13 => AttributeType::Map(ScalarType::Int64, ScalarType::String),
        14 => AttributeType::Map(ScalarType::Int64, ScalarType::Int64),
        other => return Err(WireError::BadAttrType(other)),
    };
    Ok(ty)
}

fn put_microop(buf: &mut BytesMut, op: &Microop) {
    buf.put_u16_le(op.attr);
    buf.put_u8(attr_type_tag(op.ty));
    buf.put_u8(op.action.as_u8());
    buf.put_i64_le(op.arg_int);
    put_slice(buf, &op.arg_bytes);
}

fn get_microop(buf: &mut impl Buf) -> WireResult<Microop> {
    let attr = get_u16(buf)?;
    let ty = attr_type_from_tag(get_u8(buf)?)?;
    let action_code = get_u8(buf)?;
    let action = MicroopAction::from_u8(action_code).ok_or(WireError::BadAction(action_code))?;
    let arg_int = get_i64(buf)?;
    let arg_bytes = get_slice(buf)?;
    Ok(Microop { attr, ty, action, arg_int, arg_bytes })
}

fn put_attrs(buf: &mut BytesMut, attrs: &[(u16, Bytes)]) {
    buf.put_u32_le(attrs.len() as u32);
    for (attr, value) in attrs {
        buf.put_u16_le(*attr);
        put_slice(buf, value);
    }
}

fn get_attrs(buf: &mut impl Buf) -> WireResult<Vec<(u16, Bytes)>> {
    let count = get_u32(buf)? as usize;
    let mut attrs = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let attr = get_u16(buf)?;
        let value = get_slice(buf)?;
        attrs.push((attr, value));
    }
    Ok(attrs)
}

// ============================================================================
// Bounds-checked integer reads
// ============================================================================

fn get_u8(buf: &mut impl Buf) -> WireResult<u8> {
    if buf.remaining() < 1 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut impl Buf) -> WireResult<u16> {
    if buf.remaining() < 2 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u16_le())
}

fn get_u32(buf: &mut impl Buf) -> WireResult<u32> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u32_le())
}

fn get_u64(buf: &mut impl Buf) -> WireResult<u64> {
    if buf.remaining() < 8 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u64_le())
}

fn get_i64(buf: &mut impl Buf) -> WireResult<i64> {
    if buf.remaining() < 8 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_i64_le())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn roundtrip(p: &Payload) -> Payload {
        let mut buf = BytesMut::new();
        p.encode_into(&mut buf);
        Payload::decode(p.message_type(), &mut buf.freeze()).unwrap()
    }

    #[test]
    fn chain_put_roundtrip() {
        let p = Payload::ChainPut {
            version: 12,
            fresh: true,
            key: b("alice"),
            value: vec![b("30"), b("")],
        };
        assert_eq!(roundtrip(&p), p);
    }

    #[test]
    fn chain_subspace_carries_nextpoint() {
        let p = Payload::ChainSubspace {
            version: 3,
            key: b("k"),
            value: vec![b("v")],
            nextpoint: 0xdead_beef_0000_0001,
        };
        assert_eq!(roundtrip(&p), p);
    }

    #[test]
    fn xfer_data_field_order() {
        let p = Payload::XferData {
            xfer_num: 9,
            has_value: false,
            version: 4,
            key: b("gone"),
            value: vec![],
        };
        let mut buf = BytesMut::new();
        p.encode_into(&mut buf);
        // xfer_num first, then the has_value flag.
        assert_eq!(&buf[..8], &9u64.to_le_bytes());
        assert_eq!(buf[8], 0);
        assert_eq!(roundtrip(&p), p);
    }

    #[test]
    fn atomic_with_microops() {
        let ops = vec![
            Microop::with_int(1, AttributeType::Int64, MicroopAction::Int64Add, -5),
            Microop::with_bytes(2, AttributeType::String, MicroopAction::StringAppend, b("!")),
        ];
        let p = Payload::ReqAtomic { nonce: 1, key: b("k"), ops };
        let Payload::ReqAtomic { ops: decoded, .. } = roundtrip(&p) else {
            panic!("wrong variant");
        };
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].arg_int, -5);
        assert_eq!(decoded[0].action, MicroopAction::Int64Add);
        assert_eq!(decoded[1].arg_bytes, b("!"));
    }

    #[test]
    fn empty_payloads() {
        for p in [Payload::XferMore, Payload::XferDone, Payload::PacketNop] {
            let mut buf = BytesMut::new();
            p.encode_into(&mut buf);
            assert!(buf.is_empty());
            assert_eq!(roundtrip(&p), p);
        }
    }

    #[test]
    fn condput_separates_conds_from_attrs() {
        let p = Payload::ReqCondput {
            nonce: 8,
            key: b("alice"),
            conds: vec![(1, b("30"))],
            attrs: vec![(1, b("31")), (2, b("x"))],
        };
        assert_eq!(roundtrip(&p), p);
    }

    #[test]
    fn truncated_payloads_error() {
        let p = Payload::ChainPut { version: 1, fresh: false, key: b("key"), value: vec![b("v")] };
        let mut buf = BytesMut::new();
        p.encode_into(&mut buf);
        for cut in [0, 5, 9, buf.len() - 1] {
            let mut short = Bytes::copy_from_slice(&buf[..cut]);
            assert_eq!(
                Payload::decode(MessageType::ChainPut, &mut short),
                Err(WireError::Truncated),
                "cut at {cut}"
            );
        }
    }

    proptest! {
        #[test]
        fn chain_ack_roundtrips(version in any::<u64>(), key in proptest::collection::vec(any::<u8>(), 0..64)) {
            let p = Payload::ChainAck { version, key: Bytes::from(key) };
            prop_assert_eq!(roundtrip(&p), p);
        }

        #[test]
        fn resp_get_roundtrips(
            nonce in any::<u64>(),
            code in any::<u16>(),
            cols in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..32), 0..4),
        ) {
            let p = Payload::RespGet {
                nonce,
                code,
                value: cols.into_iter().map(Bytes::from).collect(),
            };
            prop_assert_eq!(roundtrip(&p), p);
        }
    }
}
