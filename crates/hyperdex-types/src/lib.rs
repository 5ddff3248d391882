//! # hyperdex-types: Core types for HyperDex
//!
//! This crate contains the identifiers and shared data types used across
//! the HyperDex server:
//! - Addressing ([`SpaceId`], [`SubspaceId`], [`RegionId`], [`EntityId`],
//!   [`Instance`])
//! - Attribute types and wire-level validation ([`AttributeType`])
//! - Atomic micro-operations ([`Microop`])
//! - Network message tags ([`MessageType`]) and response codes
//!   ([`ReturnCode`])
//!
//! An object lives in a *space* (a table with typed attributes). Each
//! space is hashed onto one or more *subspaces*; subspace 0 hashes the key
//! alone. A subspace is partitioned into *regions* (prefixes of the 64-bit
//! point space), and each region is served by an ordered chain of replicas
//! addressed by [`EntityId`]s.

mod microop;
mod value;

use std::fmt::{self, Display};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

pub use microop::{Microop, MicroopAction};
pub use value::{AttributeType, ScalarType};

// ============================================================================
// Reserved spaces
// ============================================================================

/// The reserved space id that designates client endpoints.
pub const CLIENT_SPACE: SpaceId = SpaceId(u32::MAX);

/// The reserved space id that designates state-transfer endpoints.
pub const TRANSFER_SPACE: SpaceId = SpaceId(u32::MAX - 1);

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for a space (a named table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SpaceId(pub u32);

impl Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for SpaceId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<SpaceId> for u32 {
    fn from(id: SpaceId) -> Self {
        id.0
    }
}

/// A subspace within a space: one hashing of a chosen attribute subset
/// onto the 64-bit point space. Subspace 0 is the key subspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SubspaceId {
    pub space: SpaceId,
    pub subspace: u16,
}

impl SubspaceId {
    pub fn new(space: SpaceId, subspace: u16) -> Self {
        Self { space, subspace }
    }
}

impl Display for SubspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.space, self.subspace)
    }
}

/// A region: a prefix of a subspace's 64-bit point space. `mask` is
/// matched against a point's leading `prefix` bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RegionId {
    pub space: SpaceId,
    pub subspace: u16,
    pub prefix: u8,
    pub mask: u64,
}

impl RegionId {
    pub fn new(space: SpaceId, subspace: u16, prefix: u8, mask: u64) -> Self {
        Self { space, subspace, prefix, mask }
    }

    /// The subspace containing this region.
    pub fn subspace_id(&self) -> SubspaceId {
        SubspaceId::new(self.space, self.subspace)
    }

    /// Returns true if `point` falls within this region's prefix.
    pub fn contains_point(&self, point: u64) -> bool {
        let shift = 64 - u32::from(self.prefix);
        if self.prefix == 0 {
            return true;
        }
        (point >> shift) == (self.mask >> shift)
    }
}

impl Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "region({}, {}, {}, {:x})",
            self.space, self.subspace, self.prefix, self.mask
        )
    }
}

/// A position in a region's replica chain. `number` is the 0-based chain
/// index. Within the reserved [`CLIENT_SPACE`], `mask` carries the
/// fabricated client number; within [`TRANSFER_SPACE`], `subspace`
/// carries the transfer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EntityId {
    pub space: SpaceId,
    pub subspace: u16,
    pub prefix: u8,
    pub mask: u64,
    pub number: u8,
}

impl EntityId {
    /// Serialized size on the wire: u32 + u16 + u8 + u64 + u8.
    pub const SERIALIZED_SIZE: usize = 16;

    pub fn new(space: SpaceId, subspace: u16, prefix: u8, mask: u64, number: u8) -> Self {
        Self { space, subspace, prefix, mask, number }
    }

    /// An entity addressing position `number` in `region`'s chain.
    pub fn in_region(region: RegionId, number: u8) -> Self {
        Self {
            space: region.space,
            subspace: region.subspace,
            prefix: region.prefix,
            mask: region.mask,
            number,
        }
    }

    /// A client endpoint entity carrying a fabricated client number.
    pub fn client(client_num: u64) -> Self {
        Self {
            space: CLIENT_SPACE,
            subspace: 0,
            prefix: 0,
            mask: client_num,
            number: 0,
        }
    }

    /// A state-transfer endpoint entity for the given transfer id.
    pub fn transfer(xfer_id: u16) -> Self {
        Self {
            space: TRANSFER_SPACE,
            subspace: xfer_id,
            prefix: 0,
            mask: 0,
            number: 0,
        }
    }

    /// The region this entity sits in.
    pub fn region(&self) -> RegionId {
        RegionId::new(self.space, self.subspace, self.prefix, self.mask)
    }

    /// The subspace this entity sits in.
    pub fn subspace_id(&self) -> SubspaceId {
        SubspaceId::new(self.space, self.subspace)
    }

    pub fn is_client(&self) -> bool {
        self.space == CLIENT_SPACE
    }

    pub fn is_transfer(&self) -> bool {
        self.space == TRANSFER_SPACE
    }
}

impl Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "entity({}, {}, {}, {:x}, {})",
            self.space, self.subspace, self.prefix, self.mask, self.number
        )
    }
}

// ============================================================================
// Instances
// ============================================================================

/// A physical server. The inbound/outbound epoch counters change across
/// restarts so that messages addressed to a previous incarnation can be
/// rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instance {
    pub addr: IpAddr,
    pub inbound_port: u16,
    pub inbound_epoch: u16,
    pub outbound_port: u16,
    pub outbound_epoch: u16,
}

impl Instance {
    pub fn new(
        addr: IpAddr,
        inbound_port: u16,
        inbound_epoch: u16,
        outbound_port: u16,
        outbound_epoch: u16,
    ) -> Self {
        Self { addr, inbound_port, inbound_epoch, outbound_port, outbound_epoch }
    }

    /// The nil instance, used as a "no such peer" sentinel.
    pub fn nil() -> Self {
        Self::default()
    }

    pub fn is_nil(&self) -> bool {
        *self == Self::default()
    }

    /// The socket address peers connect to when sending to us.
    pub fn inbound_location(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.inbound_port)
    }

    /// The socket address our outbound connections originate from.
    pub fn outbound_location(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.outbound_port)
    }
}

impl Default for Instance {
    fn default() -> Self {
        Self {
            addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            inbound_port: 0,
            inbound_epoch: 0,
            outbound_port: 0,
            outbound_epoch: 0,
        }
    }
}

impl Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "instance({}, {}/{}, {}/{})",
            self.addr,
            self.inbound_port,
            self.inbound_epoch,
            self.outbound_port,
            self.outbound_epoch
        )
    }
}

// ============================================================================
// Message types
// ============================================================================

/// Network message type tags. The numeric values are fixed by the wire
/// protocol and shared with the client libraries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    ReqGet = 8,
    RespGet = 9,
    ReqPut = 10,
    RespPut = 11,
    ReqCondput = 12,
    RespCondput = 13,
    ReqDel = 14,
    RespDel = 15,
    ReqAtomic = 16,
    RespAtomic = 17,

    ReqSearchStart = 32,
    ReqSearchNext = 33,
    ReqSearchStop = 34,
    RespSearchItem = 35,
    RespSearchDone = 36,

    ChainPut = 64,
    ChainDel = 65,
    /// Reserved; decoded and dropped, never sent.
    ChainPending = 66,
    ChainSubspace = 67,
    ChainAck = 68,

    XferMore = 96,
    XferData = 97,
    XferDone = 98,

    ConfigMismatch = 254,
    PacketNop = 255,
}

impl MessageType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(tag: u8) -> Option<Self> {
        use MessageType as M;
        let t = match tag {
            8 => M::ReqGet,
            9 => M::RespGet,
            10 => M::ReqPut,
            11 => M::RespPut,
            12 => M::ReqCondput,
            13 => M::RespCondput,
            14 => M::ReqDel,
            15 => M::RespDel,
            16 => M::ReqAtomic,
            17 => M::RespAtomic,
            32 => M::ReqSearchStart,
            33 => M::ReqSearchNext,
            34 => M::ReqSearchStop,
            35 => M::RespSearchItem,
            36 => M::RespSearchDone,
            64 => M::ChainPut,
            65 => M::ChainDel,
            66 => M::ChainPending,
            67 => M::ChainSubspace,
            68 => M::ChainAck,
            96 => M::XferMore,
            97 => M::XferData,
            98 => M::XferDone,
            254 => M::ConfigMismatch,
            255 => M::PacketNop,
            _ => return None,
        };
        Some(t)
    }
}

impl Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

// ============================================================================
// Return codes
// ============================================================================

/// Client-visible response codes, packed after the nonce in `RESP_*`
/// messages. The numeric range is fixed by the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ReturnCode {
    Success = 8320,
    NotFound = 8321,
    BadDimSpec = 8322,
    NotUs = 8323,
    ServerError = 8324,
    CmpFail = 8325,
    BadMicros = 8326,
    ReadOnly = 8327,
    Overflow = 8328,
}

impl ReturnCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(code: u16) -> Option<Self> {
        use ReturnCode as R;
        let c = match code {
            8320 => R::Success,
            8321 => R::NotFound,
            8322 => R::BadDimSpec,
            8323 => R::NotUs,
            8324 => R::ServerError,
            8325 => R::CmpFail,
            8326 => R::BadMicros,
            8327 => R::ReadOnly,
            8328 => R::Overflow,
            _ => return None,
        };
        Some(c)
    }
}

impl Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}
