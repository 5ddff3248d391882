//! In-flight operation state.
//!
//! A [`PendingOp`] is one version of one key moving through the chain.
//! Its key and value slices are refcounted (`Bytes`), so the op shares
//! backing storage with the message it arrived in and with any reader of
//! the previous version; the backing lives exactly as long as some
//! holder needs it.

use bytes::Bytes;
use hyperdex_types::{EntityId, Instance, MessageType};

/// The originating client request, if this op was accepted locally at
/// the point leader. Holds only the recipient and nonce, never a
/// reference back into the keyholder.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ClientOp {
    pub from: EntityId,
    pub nonce: u64,
    /// The `RESP_*` message type to answer with.
    pub resp_type: MessageType,
}

/// One operation ordered into the chain.
#[derive(Debug)]
pub(crate) struct PendingOp {
    /// True for puts, false for deletes.
    pub has_value: bool,
    /// A fresh insert: no prior version existed on this replica.
    pub fresh: bool,
    /// Set once the downstream ack for this version has arrived.
    pub acked: bool,
    pub key: Bytes,
    pub value: Vec<Bytes>,
    /// Present only at the point leader, for the client response.
    pub client: Option<ClientOp>,
    /// The upstream entity we received this op from.
    pub recv: Option<(EntityId, Instance)>,
    /// The downstream entity we sent this op to.
    pub sent: Option<(EntityId, Instance)>,
    /// Adjacent subspaces, if any.
    pub subspace_prev: Option<u16>,
    pub subspace_next: Option<u16>,
    /// Points under the adjacent subspaces' hashers.
    pub point_prev: u64,
    pub point_this: u64,
    pub point_next: u64,
    /// Where the next-subspace delete goes when this op initiates an
    /// intra-subspace hop on behalf of its successor region.
    pub point_next_next: u64,
}

impl PendingOp {
    pub fn new(has_value: bool, key: Bytes, value: Vec<Bytes>) -> Self {
        Self {
            has_value,
            fresh: false,
            acked: false,
            key,
            value,
            client: None,
            recv: None,
            sent: None,
            subspace_prev: None,
            subspace_next: None,
            point_prev: 0,
            point_this: 0,
            point_next: 0,
            point_next_next: 0,
        }
    }
}

/// An operation received out of order: its predecessor version has not
/// been seen yet. Held keyed by version until the gap fills.
#[derive(Debug)]
pub(crate) struct DeferredOp {
    pub has_value: bool,
    pub key: Bytes,
    pub value: Vec<Bytes>,
    pub recv: (EntityId, Instance),
}
