//! # hyperdex-config: Coordinator configuration
//!
//! A server's entire view of the cluster comes from the coordinator as a
//! monotonically versioned configuration: hosts, spaces and their
//! attribute schemas, subspace hash participation, regions and their
//! replica chains, in-progress transfers, and the quiesce/shutdown
//! flags.
//!
//! [`Configuration`] is the parsed, queryable form. It answers every
//! topology question the daemon asks: entity/instance resolution, chain
//! adjacency and head/tail position, point-leader lookup, per-subspace
//! hashers, and transfer assignments. [`parse`] builds one from the
//! coordinator's line-oriented text; any parse failure poisons the whole
//! configuration.

mod error;
mod parser;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use hyperdex_hashing::{MaskHasher, PrefixHasher};
use hyperdex_types::{
    AttributeType, EntityId, Instance, RegionId, SpaceId, SubspaceId,
};

pub use error::ConfigParseError;
pub use parser::parse;

/// One attribute of a space: a name and a type. Attribute 0 is the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub ty: AttributeType,
}

/// Per-subspace hash participation: which attributes feed the
/// replication-layer prefix hasher and which feed the disk-layer mask
/// hasher.
#[derive(Debug, Clone, Default)]
pub struct SubspaceHashing {
    pub repl: Vec<bool>,
    pub disk: Vec<bool>,
}

/// A parsed coordinator configuration.
#[derive(Debug, Clone, Default)]
pub struct Configuration {
    pub(crate) version: u64,
    pub(crate) config_text: String,
    pub(crate) hosts: HashMap<u64, Instance>,
    pub(crate) space_ids: HashMap<String, SpaceId>,
    pub(crate) spaces: HashMap<SpaceId, Vec<Attribute>>,
    pub(crate) subspaces: HashMap<SubspaceId, SubspaceHashing>,
    pub(crate) subspace_counts: HashMap<SpaceId, u16>,
    pub(crate) regions: BTreeSet<RegionId>,
    pub(crate) entities: BTreeMap<EntityId, Instance>,
    pub(crate) transfers: HashMap<u16, (RegionId, Instance)>,
    pub(crate) quiesce_state_id: Option<String>,
    pub(crate) shutdown: bool,
}

impl Configuration {
    /// The configuration's version. Versions increase monotonically; a
    /// server never installs an older configuration over a newer one.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The raw text this configuration was parsed from, as persisted in
    /// the datalayer state file.
    pub fn config_text(&self) -> &str {
        &self.config_text
    }

    /// Whether this configuration orders a quiesce.
    pub fn quiesce(&self) -> bool {
        self.quiesce_state_id.is_some()
    }

    pub fn quiesce_state_id(&self) -> Option<&str> {
        self.quiesce_state_id.as_deref()
    }

    pub fn shutdown(&self) -> bool {
        self.shutdown
    }

    // ------------------------------------------------------------------
    // Data layout
    // ------------------------------------------------------------------

    /// Number of attributes of a space, key included. Zero for unknown
    /// spaces.
    pub fn dimensions(&self, space: SpaceId) -> usize {
        self.spaces.get(&space).map_or(0, Vec::len)
    }

    /// The attribute schema of a space, key first.
    pub fn attributes(&self, space: SpaceId) -> Option<&[Attribute]> {
        self.spaces.get(&space).map(Vec::as_slice)
    }

    /// Looks a space up by name.
    pub fn space(&self, name: &str) -> Option<SpaceId> {
        self.space_ids.get(name).copied()
    }

    /// Number of subspaces of a space, the key subspace included.
    pub fn subspaces(&self, space: SpaceId) -> u16 {
        self.subspace_counts.get(&space).copied().unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Entities and instances
    // ------------------------------------------------------------------

    /// The instance serving an entity, or nil if unknown.
    pub fn instance_for(&self, entity: EntityId) -> Instance {
        self.entities.get(&entity).copied().unwrap_or_default()
    }

    /// The entity that corresponds to `instance` in `region`, if the
    /// instance is part of the region's chain.
    pub fn entity_for(&self, instance: Instance, region: RegionId) -> Option<EntityId> {
        self.entities
            .range(EntityId::in_region(region, 0)..=EntityId::in_region(region, u8::MAX))
            .find(|&(_, i)| *i == instance)
            .map(|(e, _)| *e)
    }

    /// Every region an instance serves.
    pub fn regions_for(&self, instance: Instance) -> BTreeSet<RegionId> {
        self.entities
            .iter()
            .filter(|(e, i)| **i == instance && !e.is_client() && !e.is_transfer())
            .map(|(e, _)| e.region())
            .collect()
    }

    /// Resolves an entity whose region fields name a point rather than a
    /// configured region: finds the entity in the same subspace whose
    /// region contains `entity.mask`, preserving the chain number.
    pub fn sloppy_lookup(&self, entity: EntityId) -> Option<EntityId> {
        let point = entity.mask;
        self.entities
            .keys()
            .find(|e| {
                e.space == entity.space
                    && e.subspace == entity.subspace
                    && e.number == entity.number
                    && e.region().contains_point(point)
            })
            .copied()
    }

    /// Is the instance a member of the region's chain?
    pub fn in_region(&self, instance: Instance, region: RegionId) -> bool {
        self.entity_for(instance, region).is_some()
    }

    /// Is this entity the point leader (head of its region's chain in the
    /// key subspace)?
    pub fn is_point_leader(&self, entity: EntityId) -> bool {
        !entity.is_client() && !entity.is_transfer() && entity.subspace == 0 && entity.number == 0
    }

    /// Overwrites `instance`'s epochs with the ones this configuration
    /// assigns to a host with matching address and ports; zeroes them if
    /// no such host exists.
    pub fn instance_epochs(&self, instance: &mut Instance) {
        for host in self.hosts.values() {
            if host.addr == instance.addr
                && host.inbound_port == instance.inbound_port
                && host.outbound_port == instance.outbound_port
            {
                instance.inbound_epoch = host.inbound_epoch;
                instance.outbound_epoch = host.outbound_epoch;
                return;
            }
        }
        instance.inbound_epoch = 0;
        instance.outbound_epoch = 0;
    }

    // ------------------------------------------------------------------
    // Chains
    // ------------------------------------------------------------------

    /// Are `first` and `second` adjacent in the same chain, in order?
    pub fn chain_adjacent(&self, first: EntityId, second: EntityId) -> bool {
        first.region() == second.region() && first.number + 1 == second.number
    }

    pub fn chain_has_next(&self, entity: EntityId) -> bool {
        self.chain_next(entity).is_some()
    }

    pub fn chain_has_prev(&self, entity: EntityId) -> bool {
        entity.number > 0
            && self
                .entities
                .contains_key(&EntityId::in_region(entity.region(), entity.number - 1))
    }

    pub fn chain_next(&self, entity: EntityId) -> Option<EntityId> {
        let next = EntityId::in_region(entity.region(), entity.number.checked_add(1)?);
        self.entities.contains_key(&next).then_some(next)
    }

    pub fn chain_prev(&self, entity: EntityId) -> Option<EntityId> {
        if entity.number == 0 {
            return None;
        }
        let prev = EntityId::in_region(entity.region(), entity.number - 1);
        self.entities.contains_key(&prev).then_some(prev)
    }

    pub fn is_head(&self, entity: EntityId) -> bool {
        !self.chain_has_prev(entity)
    }

    pub fn is_tail(&self, entity: EntityId) -> bool {
        !self.chain_has_next(entity)
    }

    /// The head of a region's chain.
    pub fn head_of(&self, region: RegionId) -> Option<EntityId> {
        let head = EntityId::in_region(region, 0);
        self.entities.contains_key(&head).then_some(head)
    }

    /// The tail of a region's chain.
    pub fn tail_of(&self, region: RegionId) -> Option<EntityId> {
        self.entities
            .range(EntityId::in_region(region, 0)..=EntityId::in_region(region, u8::MAX))
            .next_back()
            .map(|(e, _)| *e)
    }

    // ------------------------------------------------------------------
    // Hashing
    // ------------------------------------------------------------------

    /// The replication-layer prefix hasher for a subspace.
    pub fn repl_hasher(&self, subspace: SubspaceId) -> Option<PrefixHasher> {
        self.subspaces
            .get(&subspace)
            .map(|h| PrefixHasher::new(h.repl.clone()))
    }

    /// The disk-layer mask hasher for a subspace.
    pub fn disk_hasher(&self, subspace: SubspaceId) -> Option<MaskHasher> {
        self.subspaces
            .get(&subspace)
            .map(|h| MaskHasher::new(h.disk.clone()))
    }

    /// The point-leader entity and instance for a key: the head of the
    /// key-subspace region containing the key's point.
    pub fn point_leader_entity(&self, space: SpaceId, key: &[u8]) -> Option<(EntityId, Instance)> {
        let hasher = self.repl_hasher(SubspaceId::new(space, 0))?;
        let point = hasher.hash(key, &vec![bytes::Bytes::new(); hasher.arity() - 1]);
        let region = self
            .regions
            .iter()
            .find(|r| r.space == space && r.subspace == 0 && r.contains_point(point))?;
        let head = self.head_of(*region)?;
        Some((head, self.instance_for(head)))
    }

    /// Every configured region.
    pub fn regions(&self) -> impl Iterator<Item = RegionId> + '_ {
        self.regions.iter().copied()
    }

    // ------------------------------------------------------------------
    // Transfers
    // ------------------------------------------------------------------

    /// Transfers whose destination is `instance` (we are joining).
    pub fn transfers_to(&self, instance: Instance) -> BTreeMap<u16, RegionId> {
        self.transfers
            .iter()
            .filter(|&(_, (_, dst))| *dst == instance)
            .map(|(&id, &(region, _))| (id, region))
            .collect()
    }

    /// Transfers of regions `instance` currently serves (we are feeding a
    /// joiner).
    pub fn transfers_from(&self, instance: Instance) -> BTreeMap<u16, RegionId> {
        self.transfers
            .iter()
            .filter(|&(_, (region, dst))| *dst != instance && self.in_region(instance, *region))
            .map(|(&id, &(region, _))| (id, region))
            .collect()
    }

    /// The transfer id for a region currently in transfer, if any.
    pub fn transfer_id(&self, region: RegionId) -> Option<u16> {
        self.transfers
            .iter()
            .find(|&(_, (r, _))| *r == region)
            .map(|(&id, _)| id)
    }
}
