//! The replication manager: value-dependent chaining with linearizable
//! per-key updates.
//!
//! Every key in every assigned region has (while active) a
//! [`KeyHolder`]: three queues ordering that key's in-flight versions.
//! Client operations enter at the point leader, are validated against
//! the newest known state, and appended to `blocked`; chain operations
//! from upstream replicas arrive in `blocked` or, when out of order, in
//! `deferred`. Promotion to `committable` dispatches the op downstream;
//! acks flow back tail-to-head, committing each version to disk and
//! finally answering the client.
//!
//! # Locking
//!
//! A fixed array of stripe locks, indexed by a seeded hash of
//! `(region, key)`, serializes all work on one key. Keyholders live in a
//! shared map behind their own short-lived lock; the stripe lock is
//! acquired after the map lookup, and the keyholder's own mutex after
//! that (always in this order). Two threads racing to create the same
//! keyholder both end up with the same entry.
//!
//! # Routing
//!
//! `prev_and_next` computes where an op came from and goes next. The
//! asymmetry is deliberate: the previous-subspace point is hashed on the
//! *new* value (the insert propagates forward), the next-subspace point
//! on the *old* value (the delete must land on whoever owns the
//! pre-image). When old and new values hash to different regions of the
//! *same* subspace, the op becomes an intra-subspace hop: the old-value
//! region orders a delete and hands the insert to the new-value region
//! with `CHAIN_SUBSPACE`.

mod keyholder;
mod pending;
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use hyperdex_config::{Attribute, Configuration};
use hyperdex_types::{
    EntityId, Instance, MessageType, Microop, RegionId, ReturnCode, SubspaceId,
};
use hyperdex_wire::Payload;
use tracing::{debug, error, info, warn};

use crate::coordinator::CoordinatorLink;
use crate::datalayer::DataLayer;
use crate::datatypes::apply_microops;
use crate::logical::Logical;
use crate::transfers::StateTransfers;

use keyholder::KeyHolder;
use pending::{ClientOp, DeferredOp, PendingOp};

/// Number of stripe locks.
const LOCK_STRIPING: usize = 1024;

/// Retransmission pass period.
const RETRANSMIT_INTERVAL: Duration = Duration::from_millis(250);

type KeyPair = (RegionId, Bytes);

/// The per-server replication subsystem.
pub struct ReplicationManager {
    cl: Arc<CoordinatorLink>,
    data: Arc<DataLayer>,
    comm: Arc<Logical>,
    ost: Arc<StateTransfers>,
    config: RwLock<Arc<Configuration>>,
    us: RwLock<Instance>,
    locks: Vec<Mutex<()>>,
    keyholders: Mutex<HashMap<KeyPair, Arc<Mutex<KeyHolder>>>>,
    quiesce: AtomicBool,
    quiesce_state_id: Mutex<String>,
    shutdown: AtomicBool,
    periodic_mutex: Arc<Mutex<()>>,
    periodic_thread: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicationManager {
    pub fn new(
        cl: Arc<CoordinatorLink>,
        data: Arc<DataLayer>,
        comm: Arc<Logical>,
        ost: Arc<StateTransfers>,
        periodic_mutex: Arc<Mutex<()>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cl,
            data,
            comm,
            ost,
            config: RwLock::new(Arc::new(Configuration::default())),
            us: RwLock::new(Instance::nil()),
            locks: (0..LOCK_STRIPING).map(|_| Mutex::new(())).collect(),
            keyholders: Mutex::new(HashMap::new()),
            quiesce: AtomicBool::new(false),
            quiesce_state_id: Mutex::new(String::new()),
            shutdown: AtomicBool::new(false),
            periodic_mutex,
            periodic_thread: Mutex::new(None),
        })
    }

    /// Starts the retransmission thread.
    pub fn start(self: &Arc<Self>) {
        let repl = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("repl-periodic".to_string())
            .spawn(move || repl.periodic())
            .expect("spawn replication periodic thread");
        *self.periodic_thread.lock().expect("periodic thread lock") = Some(handle);
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.periodic_thread.lock().expect("periodic thread lock").take() {
            let _ = handle.join();
        }
    }

    // ------------------------------------------------------------------
    // Reconfiguration
    // ------------------------------------------------------------------

    pub fn prepare(&self, _config: &Arc<Configuration>, _us: Instance) {}

    pub fn reconfigure(&self, config: &Arc<Configuration>, us: Instance) {
        // Multiple quiesce requests are fine (the newest state id wins),
        // but there is no way back to normal operation short of restart.
        if let Some(state_id) = config.quiesce_state_id() {
            *self.quiesce_state_id.lock().expect("quiesce lock") = state_id.to_string();
            self.quiesce.store(true, Ordering::SeqCst);
        }

        *self.config.write().expect("config lock") = Arc::clone(config);
        *self.us.write().expect("us lock") = us;

        // Drop keyholders for regions we no longer serve.
        self.keyholders
            .lock()
            .expect("keyholders lock")
            .retain(|(region, _), _| config.in_region(us, *region));
    }

    pub fn cleanup(&self, _config: &Arc<Configuration>, _us: Instance) {}

    // ------------------------------------------------------------------
    // Client-originated operations (point leader only)
    // ------------------------------------------------------------------

    pub fn client_put(
        &self,
        from: EntityId,
        to: EntityId,
        nonce: u64,
        key: Bytes,
        attrs: Vec<(u16, Bytes)>,
    ) {
        if self.read_only() {
            self.respond_to_client(to, from, nonce, MessageType::RespPut, ReturnCode::ReadOnly);
            return;
        }

        let config = self.current_config();
        let Some(dims) = config.attributes(to.space).map(<[Attribute]>::to_vec) else {
            self.respond_to_client(to, from, nonce, MessageType::RespPut, ReturnCode::ServerError);
            return;
        };

        if !dims[0].ty.validate(&key) {
            self.respond_to_client(to, from, nonce, MessageType::RespPut, ReturnCode::BadDimSpec);
            return;
        }
        let Some(values) = unpack_attributes(&attrs, &dims) else {
            self.respond_to_client(to, from, nonce, MessageType::RespPut, ReturnCode::BadDimSpec);
            return;
        };

        let conds = vec![None; dims.len() - 1];
        self.client_common(MessageType::RespPut, true, from, to, nonce, key, conds, values);
    }

    pub fn client_condput(
        &self,
        from: EntityId,
        to: EntityId,
        nonce: u64,
        key: Bytes,
        condattrs: Vec<(u16, Bytes)>,
        attrs: Vec<(u16, Bytes)>,
    ) {
        if self.read_only() {
            self.respond_to_client(to, from, nonce, MessageType::RespCondput, ReturnCode::ReadOnly);
            return;
        }

        let config = self.current_config();
        let Some(dims) = config.attributes(to.space).map(<[Attribute]>::to_vec) else {
            self.respond_to_client(to, from, nonce, MessageType::RespCondput, ReturnCode::ServerError);
            return;
        };

        if !dims[0].ty.validate(&key) {
            self.respond_to_client(to, from, nonce, MessageType::RespCondput, ReturnCode::BadDimSpec);
            return;
        }
        let (Some(conds), Some(values)) =
            (unpack_attributes(&condattrs, &dims), unpack_attributes(&attrs, &dims))
        else {
            self.respond_to_client(to, from, nonce, MessageType::RespCondput, ReturnCode::BadDimSpec);
            return;
        };

        self.client_common(MessageType::RespCondput, true, from, to, nonce, key, conds, values);
    }

    pub fn client_del(&self, from: EntityId, to: EntityId, nonce: u64, key: Bytes) {
        if self.read_only() {
            self.respond_to_client(to, from, nonce, MessageType::RespDel, ReturnCode::ReadOnly);
            return;
        }

        let config = self.current_config();
        let dims = config.dimensions(to.space);
        if dims == 0 {
            self.respond_to_client(to, from, nonce, MessageType::RespDel, ReturnCode::ServerError);
            return;
        }

        let conds = vec![None; dims - 1];
        let values = vec![None; dims - 1];
        self.client_common(MessageType::RespDel, false, from, to, nonce, key, conds, values);
    }

    pub fn client_atomic(
        &self,
        from: EntityId,
        to: EntityId,
        nonce: u64,
        key: Bytes,
        ops: Vec<Microop>,
    ) {
        if self.read_only() {
            self.respond_to_client(to, from, nonce, MessageType::RespAtomic, ReturnCode::ReadOnly);
            return;
        }
        if !from.is_client() {
            debug!(%from, "dropping client-only message (sender is not a client)");
            return;
        }

        let config = self.current_config();
        if !config.is_point_leader(to) {
            self.respond_to_client(to, from, nonce, MessageType::RespAtomic, ReturnCode::NotUs);
            return;
        }
        let Some(dims) = config.attributes(to.space).map(<[Attribute]>::to_vec) else {
            self.respond_to_client(to, from, nonce, MessageType::RespAtomic, ReturnCode::ServerError);
            return;
        };
        if !dims[0].ty.validate(&key) {
            self.respond_to_client(to, from, nonce, MessageType::RespAtomic, ReturnCode::BadDimSpec);
            return;
        }

        if let Err(code) = self.atomic_inner(from, to, nonce, key, ops, &dims) {
            self.respond_to_client(to, from, nonce, MessageType::RespAtomic, code);
        }
    }

    fn atomic_inner(
        &self,
        from: EntityId,
        to: EntityId,
        nonce: u64,
        key: Bytes,
        ops: Vec<Microop>,
        dims: &[Attribute],
    ) -> Result<(), ReturnCode> {
        let region = to.region();
        let _stripe = self.key_lock(region, &key);
        let kh_arc = self.get_keyholder(region, &key);
        let mut kh = kh_arc.lock().expect("keyholder lock");

        let (old_version, has_old, old_value) = self
            .latest_state(&kh, region, &key)
            .ok_or(ReturnCode::ServerError)?;

        // Atomic ops require an existing object.
        if !has_old {
            return Err(ReturnCode::NotFound);
        }

        // An empty ops list succeeds without touching the chain.
        if ops.is_empty() {
            self.respond_to_client(to, from, nonce, MessageType::RespAtomic, ReturnCode::Success);
            return Ok(());
        }

        if ops[0].attr == 0 || usize::from(ops[ops.len() - 1].attr) >= dims.len() {
            return Err(ReturnCode::BadDimSpec);
        }

        // Apply per-attribute runs; the list must be sorted by attribute
        // with at most one run each.
        let mut new_value = old_value.clone();
        let mut idx = 0;
        let mut last_attr = 0u16;
        while idx < ops.len() {
            let attr = ops[idx].attr;
            if attr <= last_attr && idx > 0 {
                return Err(ReturnCode::BadMicros);
            }
            if attr == 0 || usize::from(attr) >= dims.len() {
                return Err(ReturnCode::BadMicros);
            }

            let mut end = idx;
            while end < ops.len() && ops[end].attr == attr {
                if ops[end].ty != dims[usize::from(attr)].ty {
                    return Err(ReturnCode::BadMicros);
                }
                end += 1;
            }

            let slot = usize::from(attr) - 1;
            new_value[slot] =
                apply_microops(dims[usize::from(attr)].ty, &old_value[slot], &ops[idx..end])?;
            last_attr = attr;
            idx = end;
        }

        let mut op = PendingOp::new(true, key.clone(), new_value);
        op.client = Some(ClientOp { from, nonce, resp_type: MessageType::RespAtomic });

        if !self.prev_and_next(region, &key, true, &old_value, &mut op) {
            return Err(ReturnCode::NotUs);
        }

        kh.append_blocked(old_version + 1, op);
        self.move_operations_between_queues(to, &key, &mut kh);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn client_common(
        &self,
        resp_type: MessageType,
        has_value: bool,
        from: EntityId,
        to: EntityId,
        nonce: u64,
        key: Bytes,
        conds: Vec<Option<Bytes>>,
        values: Vec<Option<Bytes>>,
    ) {
        if !from.is_client() {
            debug!(%from, "dropping client-only message (sender is not a client)");
            return;
        }

        let config = self.current_config();
        if !config.is_point_leader(to) {
            self.respond_to_client(to, from, nonce, resp_type, ReturnCode::NotUs);
            return;
        }

        if let Err(code) =
            self.client_common_inner(resp_type, has_value, from, to, nonce, key, conds, values)
        {
            self.respond_to_client(to, from, nonce, resp_type, code);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn client_common_inner(
        &self,
        resp_type: MessageType,
        has_value: bool,
        from: EntityId,
        to: EntityId,
        nonce: u64,
        key: Bytes,
        conds: Vec<Option<Bytes>>,
        values: Vec<Option<Bytes>>,
    ) -> Result<(), ReturnCode> {
        let region = to.region();
        let _stripe = self.key_lock(region, &key);
        let kh_arc = self.get_keyholder(region, &key);
        let mut kh = kh_arc.lock().expect("keyholder lock");

        let (old_version, has_old, old_value) = self
            .latest_state(&kh, region, &key)
            .ok_or(ReturnCode::ServerError)?;

        if !has_value && !has_old {
            return Err(ReturnCode::NotFound);
        }

        let mut fresh = false;
        if has_value && !has_old {
            if resp_type == MessageType::RespCondput {
                // A conditional put on an absent object fails.
                return Err(ReturnCode::NotFound);
            }
            fresh = true;
        }

        if has_value && has_old && resp_type == MessageType::RespCondput {
            for (i, cond) in conds.iter().enumerate() {
                if let Some(expected) = cond {
                    if old_value.get(i).map(Bytes::as_ref) != Some(expected.as_ref()) {
                        return Err(ReturnCode::CmpFail);
                    }
                }
            }
        }

        // Compose the new value: caller-supplied attributes, with
        // untouched attributes carried over from the old value. Each
        // slice keeps its own backing alive for as long as the op holds
        // it.
        let new_value: Vec<Bytes> = if has_value {
            values
                .iter()
                .enumerate()
                .map(|(i, slot)| match slot {
                    Some(bytes) => bytes.clone(),
                    None if has_old => old_value.get(i).cloned().unwrap_or_default(),
                    None => Bytes::new(),
                })
                .collect()
        } else {
            Vec::new()
        };

        let mut op = PendingOp::new(has_value, key.clone(), new_value);
        op.fresh = fresh;
        op.client = Some(ClientOp { from, nonce, resp_type });

        if !self.prev_and_next(region, &key, has_old, &old_value, &mut op) {
            return Err(ReturnCode::NotUs);
        }

        debug_assert!(!kh.has_deferred_ops(), "point leader orders all versions");
        kh.append_blocked(old_version + 1, op);
        self.move_operations_between_queues(to, &key, &mut kh);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Replica-internal operations
    // ------------------------------------------------------------------

    pub fn chain_put(
        &self,
        from: EntityId,
        to: EntityId,
        version: u64,
        fresh: bool,
        key: Bytes,
        value: Vec<Bytes>,
    ) {
        self.chain_common(true, from, to, version, fresh, key, value);
    }

    pub fn chain_del(&self, from: EntityId, to: EntityId, version: u64, key: Bytes) {
        self.chain_common(false, from, to, version, false, key, Vec::new());
    }

    fn chain_common(
        &self,
        has_value: bool,
        from: EntityId,
        to: EntityId,
        version: u64,
        fresh: bool,
        key: Bytes,
        value: Vec<Bytes>,
    ) {
        if version == 0 {
            return;
        }
        let region = to.region();
        let config = self.current_config();

        if has_value && config.dimensions(to.space) != value.len() + 1 {
            warn!(%to, "dropping CHAIN_* with mismatched dimensions");
            return;
        }

        let _stripe = self.key_lock(region, &key);
        let kh_arc = self.get_keyholder(region, &key);
        let mut kh = kh_arc.lock().expect("keyholder lock");

        // Redelivery: remember the (possibly new) upstream and re-ack.
        if let Some(op) = kh.get_by_version_mut(version) {
            op.recv = Some((from, config.instance_for(from)));
            self.send_ack(to, from, version, &key);
            return;
        }

        let (old_version, has_old, old_value) = if let Some(op) = kh.get_by_version_mut(version - 1)
        {
            (version - 1, op.has_value, op.value.clone())
        } else {
            let Some((has, value, disk_version)) = self.from_disk(region, &key) else {
                warn!(%region, "dropping CHAIN_* because the disk read failed");
                return;
            };
            if disk_version >= version {
                self.send_ack(to, from, version, &key);
                return;
            }
            if disk_version < version - 1 {
                (0, false, Vec::new())
            } else {
                (disk_version, has, value)
            }
        };

        // No known predecessor and not fresh: hold for the gap to fill.
        if old_version == 0 && !fresh {
            kh.insert_deferred(
                version,
                DeferredOp {
                    has_value,
                    key: key.clone(),
                    value,
                    recv: (from, config.instance_for(from)),
                },
            );
            return;
        }

        let mut op = PendingOp::new(has_value, key.clone(), value);
        op.fresh = fresh;
        op.recv = Some((from, config.instance_for(from)));

        if !self.prev_and_next(region, &key, has_old, &old_value, &mut op) {
            debug!(%to, "dropping CHAIN_* which does not match this host");
            return;
        }

        if !chain_adjacency_ok(&config, from, to) {
            debug!(%from, %to, "dropping CHAIN_* which didn't come from the right host");
            return;
        }

        kh.append_blocked(version, op);
        self.move_operations_between_queues(to, &key, &mut kh);
    }

    pub fn chain_subspace(
        &self,
        from: EntityId,
        to: EntityId,
        version: u64,
        key: Bytes,
        value: Vec<Bytes>,
        nextpoint: u64,
    ) {
        if version == 0 {
            return;
        }
        let region = to.region();
        let config = self.current_config();

        if config.dimensions(to.space) != value.len() + 1 {
            warn!(%to, "dropping CHAIN_SUBSPACE with mismatched dimensions");
            return;
        }

        let _stripe = self.key_lock(region, &key);
        let kh_arc = self.get_keyholder(region, &key);
        let mut kh = kh_arc.lock().expect("keyholder lock");

        let (old_version, _has_old, _old_value) = match self.latest_state(&kh, region, &key) {
            Some(state) => state,
            None => return,
        };
        if old_version >= version {
            self.send_ack(to, from, version, &key);
            return;
        }

        let subspaces = config.subspaces(to.space);
        let Some(hasher) = config.repl_hasher(to.subspace_id()) else {
            return;
        };

        let mut op = PendingOp::new(true, key.clone(), value);
        op.recv = Some((from, config.instance_for(from)));
        op.subspace_prev = Some(to.subspace);
        op.subspace_next = if to.subspace < subspaces - 1 { Some(to.subspace + 1) } else { None };
        op.point_prev = from.mask;
        op.point_this = hasher.hash(&key, &op.value);
        op.point_next = nextpoint;

        // The hop comes from the tail that owned the pre-image: another
        // region of this subspace, or our own chain's predecessor when
        // the hop is being relayed down the chain. The previous
        // subspace's tail is also legal per the chain topology.
        let intra = from.subspace_id() == to.subspace_id()
            && ((from.region() == to.region() && config.chain_adjacent(from, to))
                || (from.region() != to.region()
                    && config.is_tail(from)
                    && config.is_head(to)));
        let inter = from.space == to.space
            && from.subspace + 1 == to.subspace
            && config.is_tail(from)
            && config.is_head(to);
        if !intra && !inter {
            debug!(%from, %to, "dropping CHAIN_SUBSPACE which didn't come from the right host");
            return;
        }

        if !to.region().contains_point(op.point_this) {
            debug!(%to, point = op.point_this, "dropping CHAIN_SUBSPACE which didn't come to the right host");
            return;
        }

        kh.append_blocked(version, op);
        self.move_operations_between_queues(to, &key, &mut kh);
    }

    pub fn chain_ack(&self, from: EntityId, to: EntityId, version: u64, key: Bytes) {
        let region = to.region();
        let config = self.current_config();

        let _stripe = self.key_lock(region, &key);
        let kh_arc = self.get_keyholder(region, &key);
        let mut kh = kh_arc.lock().expect("keyholder lock");

        let (client, recv) = {
            let Some(op) = kh.get_by_version_mut(version) else {
                debug!(version, "dropping CHAIN_ACK for an update we haven't seen");
                return;
            };
            match op.sent {
                None => {
                    debug!(version, "dropping CHAIN_ACK for an update we haven't sent");
                    return;
                }
                Some((sent_e, _)) if sent_e != from => {
                    debug!(%from, "dropping CHAIN_ACK that came from the wrong host");
                    return;
                }
                Some(_) => {}
            }
            op.acked = true;
            (op.client.take(), op.recv)
        };

        // If this key/version later arrives through the transfer stream,
        // the transfer knows the live pipeline already has it.
        self.ost.add_trigger(region, key.clone(), version);

        self.put_to_disk(region, &mut kh, version);

        while kh.has_committable_ops() && kh.oldest_committable_op().acked {
            kh.remove_oldest_committable_op();
        }

        self.move_operations_between_queues(to, &key, &mut kh);

        if config.is_point_leader(to) {
            if let Some(co) = client {
                self.respond_to_client(to, co.from, co.nonce, co.resp_type, ReturnCode::Success);
            }
        } else if let Some((recv_e, _)) = recv {
            self.send_ack(to, recv_e, version, &key);
        }

        if kh.empty() {
            drop(kh);
            self.erase_keyholder(region, &key);
        }
    }

    // ------------------------------------------------------------------
    // Transfer integration
    // ------------------------------------------------------------------

    /// The stripe lock guarding a key. State transfer holds this while
    /// applying a transferred op, to serialize with live replication.
    pub(crate) fn key_lock(&self, region: RegionId, key: &[u8]) -> MutexGuard<'_, ()> {
        let num = lock_num(region, key);
        self.locks[num].lock().expect("stripe lock")
    }

    /// Unblocks any op that was deferred waiting for exactly `version`,
    /// which the state transfer just wrote to disk. The caller holds the
    /// key's stripe lock.
    pub(crate) fn check_for_deferred_operations(
        &self,
        region: RegionId,
        version: u64,
        key: &Bytes,
        has_value: bool,
        value: &[Bytes],
    ) {
        let config = self.current_config();
        let us_inst = self.inst();
        // Not yet in the chain: the race this heals cannot exist.
        let Some(us) = config.entity_for(us_inst, region) else {
            return;
        };

        let kh_arc = self.get_keyholder(region, key);
        let mut kh = kh_arc.lock().expect("keyholder lock");

        if kh.has_deferred_ops() && version + 1 == kh.oldest_deferred_version() {
            let (dversion, promoted) = {
                let dop = kh.oldest_deferred_op();
                let mut op = PendingOp::new(dop.has_value, dop.key.clone(), dop.value.clone());
                op.recv = Some(dop.recv);
                (kh.oldest_deferred_version(), op)
            };
            let mut op = promoted;

            if !self.prev_and_next(region, key, has_value, value, &mut op) {
                warn!(%region, "could not route deferred operation after transfer write");
                return;
            }
            let Some((recv_e, _)) = op.recv else { return };
            if !chain_adjacency_ok(&config, recv_e, us) {
                debug!(%recv_e, "dropping deferred CHAIN_* which didn't come from the right host");
                return;
            }

            kh.remove_oldest_deferred_op();
            kh.append_blocked(dversion, op);
        }

        self.move_operations_between_queues(us, key, &mut kh);
    }

    // ------------------------------------------------------------------
    // Keyholder access
    // ------------------------------------------------------------------

    fn get_keyholder(&self, region: RegionId, key: &[u8]) -> Arc<Mutex<KeyHolder>> {
        let mut map = self.keyholders.lock().expect("keyholders lock");
        map.entry((region, Bytes::copy_from_slice(key)))
            .or_insert_with(|| Arc::new(Mutex::new(KeyHolder::new())))
            .clone()
    }

    fn erase_keyholder(&self, region: RegionId, key: &[u8]) {
        let mut map = self.keyholders.lock().expect("keyholders lock");
        map.remove(&(region, Bytes::copy_from_slice(key)));
    }

    /// The newest known state of a key: the queues, else disk. `None`
    /// means the disk failed.
    fn latest_state(
        &self,
        kh: &KeyHolder,
        region: RegionId,
        key: &[u8],
    ) -> Option<(u64, bool, Vec<Bytes>)> {
        if let Some((version, op)) = kh.latest() {
            return Some((version, op.has_value, op.value.clone()));
        }
        self.from_disk(region, key)
            .map(|(has, value, version)| (version, has, value))
    }

    fn from_disk(&self, region: RegionId, key: &[u8]) -> Option<(bool, Vec<Bytes>, u64)> {
        match self.data.get(region, key) {
            Ok((value, version)) => Some((true, value, version)),
            Err(hyperdex_disk::DiskError::NotFound) => Some((false, Vec::new(), 0)),
            Err(hyperdex_disk::DiskError::MissingDisk) => {
                error!(%region, "data layer returned MissingDisk");
                None
            }
            Err(e) => {
                warn!(%region, error = %e, "data layer returned unexpected result reading old value");
                None
            }
        }
    }

    /// Commits `version` to disk if it is newer than the watermark. A
    /// delete is issued for ops without values, and for subspace-hop
    /// deletions at the region that owns the pre-image.
    fn put_to_disk(&self, region: RegionId, kh: &mut KeyHolder, version: u64) -> bool {
        if version <= kh.version_on_disk() {
            return true;
        }
        let Some(op) = kh.get_by_version_mut(version) else {
            return false;
        };

        let delete = !op.has_value
            || (op.subspace_next == Some(region.subspace) && region.subspace != 0);
        let result = if delete {
            self.data.del(region, op.key.clone())
        } else {
            self.data.put(region, op.key.clone(), op.value.clone(), version)
        };

        let success = match result {
            Ok(()) => true,
            Err(e) => {
                error!(%region, version, error = %e, "commit caused error");
                false
            }
        };

        kh.set_version_on_disk(version);
        success
    }

    // ------------------------------------------------------------------
    // Queue movement and dispatch
    // ------------------------------------------------------------------

    /// Promotes deferred ops that have become contiguous, then moves
    /// unblocked ops to `committable`, dispatching each downstream.
    fn move_operations_between_queues(&self, us: EntityId, key: &Bytes, kh: &mut KeyHolder) {
        let config = self.current_config();

        while kh.has_deferred_ops() {
            let (old_version, has_old, old_value) = match self.latest_state(kh, us.region(), key) {
                Some(state) => state,
                None => break,
            };

            if old_version >= kh.oldest_deferred_version() {
                debug!("dropping a deferred message whose version has already been seen");
                kh.remove_oldest_deferred_op();
                continue;
            }
            if old_version + 1 != kh.oldest_deferred_version() {
                break;
            }

            let dversion = kh.oldest_deferred_version();
            let mut op = {
                let dop = kh.oldest_deferred_op();
                let mut op = PendingOp::new(dop.has_value, dop.key.clone(), dop.value.clone());
                op.recv = Some(dop.recv);
                op
            };

            if !self.prev_and_next(us.region(), key, has_old, &old_value, &mut op) {
                debug!("dropping deferred CHAIN_* which does not match this host");
                return;
            }
            let Some((recv_e, _)) = op.recv else { return };
            if !chain_adjacency_ok(&config, recv_e, us) {
                debug!(%recv_e, "dropping deferred CHAIN_* which didn't come from the right host");
                return;
            }

            kh.remove_oldest_deferred_op();
            kh.append_blocked(dversion, op);
        }

        while kh.has_blocked_ops() {
            {
                let (_, front) = kh.oldest_blocked().expect("blocked is non-empty");
                // Fresh inserts and deletes wait for every earlier
                // version to drain.
                if (front.fresh || !front.has_value) && kh.has_committable_ops() {
                    break;
                }
            }
            kh.transfer_blocked_to_committable();
            let (version, op) = kh.newest_committable_mut();
            let version = *version;
            self.send_message(us, version, op);
        }
    }

    /// Dispatches a freshly committable op to wherever it goes next:
    /// downstream in the chain, across an intra-subspace hop, into the
    /// next subspace, or (at the end of the line) back as a self-ack.
    fn send_message(&self, us: EntityId, version: u64, op: &mut PendingOp) {
        if op.sent.is_some() {
            return;
        }
        let config = self.current_config();
        let key = op.key.clone();

        let dst;
        if config.is_tail(us) {
            match op.subspace_next {
                None => {
                    // End of the line: trigger our own commit path.
                    let payload = Payload::ChainAck { version, key };
                    if self.comm.send(us, us, &payload) {
                        op.sent = Some((us, self.inst()));
                    }
                    return;
                }
                Some(next) if next == us.subspace => {
                    // Intra-subspace hop: hand the insert to the region
                    // owning the new value's point.
                    let probe = EntityId::new(us.space, us.subspace, 64, op.point_next, 0);
                    let Some(target) = config.sloppy_lookup(probe) else {
                        return;
                    };
                    let payload = Payload::ChainSubspace {
                        version,
                        key,
                        value: op.value.clone(),
                        nextpoint: op.point_next_next,
                    };
                    if self.comm.send(us, target, &payload) {
                        op.sent = Some((target, config.instance_for(target)));
                    }
                    return;
                }
                Some(next) if next == us.subspace + 1 => {
                    // Hop into the next subspace's chain.
                    let probe = EntityId::new(us.space, next, 64, op.point_next, 0);
                    match config.sloppy_lookup(probe) {
                        Some(target) => dst = target,
                        None => return,
                    }
                }
                Some(next) => {
                    error!(next, subspace = us.subspace, "op routed to an impossible subspace");
                    return;
                }
            }
        } else if op.subspace_prev == Some(us.subspace) {
            // We received this as a CHAIN_SUBSPACE; relay it down our
            // chain in the same form.
            let Some(target) = config.chain_next(us) else {
                return;
            };
            let payload = Payload::ChainSubspace {
                version,
                key,
                value: op.value.clone(),
                nextpoint: op.point_next,
            };
            if self.comm.send(us, target, &payload) {
                op.sent = Some((target, config.instance_for(target)));
            }
            return;
        } else {
            match config.chain_next(us) {
                Some(target) => dst = target,
                None => return,
            }
        }

        let payload = if op.has_value {
            Payload::ChainPut { version, fresh: op.fresh, key, value: op.value.clone() }
        } else {
            Payload::ChainDel { version, key }
        };
        if self.comm.send(us, dst, &payload) {
            op.sent = Some((dst, config.instance_for(dst)));
        }
    }

    fn send_ack(&self, from: EntityId, to: EntityId, version: u64, key: &Bytes) -> bool {
        self.comm
            .send(from, to, &Payload::ChainAck { version, key: key.clone() })
    }

    fn respond_to_client(
        &self,
        us: EntityId,
        client: EntityId,
        nonce: u64,
        resp_type: MessageType,
        code: ReturnCode,
    ) {
        let code = code.as_u16();
        let payload = match resp_type {
            MessageType::RespPut => Payload::RespPut { nonce, code },
            MessageType::RespCondput => Payload::RespCondput { nonce, code },
            MessageType::RespDel => Payload::RespDel { nonce, code },
            MessageType::RespAtomic => Payload::RespAtomic { nonce, code },
            _ => return,
        };
        self.comm.send(us, client, &payload);
    }

    // ------------------------------------------------------------------
    // Routing computation
    // ------------------------------------------------------------------

    /// Computes the op's subspace neighbors and the points used to route
    /// it. Returns false if the op does not belong on this host.
    fn prev_and_next(
        &self,
        region: RegionId,
        key: &Bytes,
        has_old: bool,
        old_value: &[Bytes],
        op: &mut PendingOp,
    ) -> bool {
        let has_new = op.has_value;
        let new_value = op.value.clone();
        let new_value: &[Bytes] = &new_value;
        let config = self.current_config();
        let subspaces = config.subspaces(region.space);
        if subspaces == 0 {
            return false;
        }

        op.subspace_prev = if region.subspace > 0 { Some(region.subspace - 1) } else { None };
        op.subspace_next =
            if region.subspace < subspaces - 1 { Some(region.subspace + 1) } else { None };

        let Some(hasher_this) = config.repl_hasher(region.subspace_id()) else {
            return false;
        };
        let (coord_old, coord_new) = match (has_old, has_new) {
            (true, true) => {
                (hasher_this.hash(key, old_value), hasher_this.hash(key, new_value))
            }
            (true, false) => {
                let c = hasher_this.hash(key, old_value);
                (c, c)
            }
            (false, true) => {
                let c = hasher_this.hash(key, new_value);
                (c, c)
            }
            (false, false) => return false,
        };

        let mut set_next = false;
        if region.contains_point(coord_old) && region.contains_point(coord_new) {
            op.point_this = coord_new;
        } else if region.contains_point(coord_old) {
            // The new value leaves this region: this op becomes the
            // delete leg of an intra-subspace hop, and carries the
            // next-subspace delete point for its successor.
            if let Some(next) = op.subspace_next {
                let Some(hasher) = config.repl_hasher(SubspaceId::new(region.space, next)) else {
                    return false;
                };
                op.point_next_next = hasher.hash(key, old_value);
            }
            op.subspace_next = Some(region.subspace);
            op.point_this = coord_old;
            op.point_next = coord_new;
            set_next = true;
        } else {
            // We never owned this op's pre-image.
            return false;
        }

        if let Some(prev) = op.subspace_prev {
            let Some(hasher) = config.repl_hasher(SubspaceId::new(region.space, prev)) else {
                return false;
            };
            // With both values present the previous-subspace point comes
            // from the new value: the insert propagates forward.
            op.point_prev = hasher.hash(key, if has_new { new_value } else { old_value });
        }

        if !set_next {
            if let Some(next) = op.subspace_next {
                let Some(hasher) = config.repl_hasher(SubspaceId::new(region.space, next)) else {
                    return false;
                };
                // The next-subspace point comes from the old value: the
                // delete must land on whoever owns the pre-image.
                op.point_next = hasher.hash(key, if has_old { old_value } else { new_value });
            }
        }

        true
    }

    // ------------------------------------------------------------------
    // Periodic work
    // ------------------------------------------------------------------

    fn periodic(&self) {
        info!("replication retransmission thread started");

        while !self.shutdown.load(Ordering::SeqCst) {
            {
                let _periodic = self.periodic_mutex.lock().expect("periodic mutex");
                let processed = self.retransmit();

                // While quiescing, an empty keyholder table means all
                // replication state has drained.
                if self.quiesce.load(Ordering::SeqCst) && processed == 0 {
                    let state_id = self.quiesce_state_id.lock().expect("quiesce lock").clone();
                    self.cl.quiesced(&state_id);
                    info!(%state_id, "replication manager quiesced; periodic thread stopping");
                    break;
                }
            }
            thread::sleep(RETRANSMIT_INTERVAL);
        }
    }

    /// One pass over every keyholder: erase the empty ones, and re-send
    /// the oldest committable op wherever the recorded destination no
    /// longer matches the configuration.
    fn retransmit(&self) -> usize {
        let pairs: Vec<(KeyPair, Arc<Mutex<KeyHolder>>)> = {
            let map = self.keyholders.lock().expect("keyholders lock");
            map.iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect()
        };

        let mut processed = 0;
        let config = self.current_config();
        let us_inst = self.inst();

        for ((region, key), kh_arc) in pairs {
            processed += 1;
            let _stripe = self.key_lock(region, &key);
            let mut kh = kh_arc.lock().expect("keyholder lock");

            if kh.empty() {
                // Only erase if the map still holds this same holder; a
                // racing thread may have replaced it.
                let mut map = self.keyholders.lock().expect("keyholders lock");
                if let Some(current) = map.get(&(region, key.clone())) {
                    if Arc::ptr_eq(current, &kh_arc) {
                        map.remove(&(region, key.clone()));
                    }
                }
                continue;
            }

            if !kh.has_committable_ops() {
                continue;
            }
            let Some(us) = config.entity_for(us_inst, region) else {
                continue;
            };

            // Only the head of the line: retransmission must not hit
            // peers with a burst of excess messages.
            let version = kh.oldest_committable_version();
            let op = kh.oldest_committable_op_mut();
            let resend = match op.sent {
                None => true,
                Some((sent_e, sent_i)) => sent_i != config.instance_for(sent_e),
            };
            if resend {
                op.sent = None;
                self.send_message(us, version, op);
            }
        }

        processed
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn current_config(&self) -> Arc<Configuration> {
        Arc::clone(&self.config.read().expect("config lock"))
    }

    fn inst(&self) -> Instance {
        *self.us.read().expect("us lock")
    }

    fn read_only(&self) -> bool {
        self.quiesce.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn keyholder_count(&self) -> usize {
        self.keyholders.lock().expect("keyholders lock").len()
    }

    #[cfg(test)]
    pub(crate) fn queue_depths(&self, region: RegionId, key: &[u8]) -> (usize, usize, usize) {
        let map = self.keyholders.lock().expect("keyholders lock");
        match map.get(&(region, Bytes::copy_from_slice(key))) {
            Some(kh_arc) => {
                let kh = kh_arc.lock().expect("keyholder lock");
                kh.queue_depths()
            }
            None => (0, 0, 0),
        }
    }
}

/// Validates `from`→`to` chain adjacency: the configured predecessor in
/// the same region, or the previous subspace's tail handing to our head.
fn chain_adjacency_ok(config: &Configuration, from: EntityId, to: EntityId) -> bool {
    (from.region() == to.region() && config.chain_adjacent(from, to))
        || (from.space == to.space
            && from.subspace + 1 == to.subspace
            && config.is_tail(from)
            && config.is_head(to))
}

/// Expands sparse `(attr, value)` pairs into per-attribute slots,
/// validating bounds and types. Attribute 0 (the key) is not assignable.
fn unpack_attributes(
    attrs: &[(u16, Bytes)],
    dims: &[Attribute],
) -> Option<Vec<Option<Bytes>>> {
    let mut slots: Vec<Option<Bytes>> = vec![None; dims.len() - 1];
    for (attr, value) in attrs {
        let idx = usize::from(*attr);
        if idx == 0 || idx >= dims.len() {
            return None;
        }
        if !dims[idx].ty.validate(value) {
            return None;
        }
        slots[idx - 1] = Some(value.clone());
    }
    Some(slots)
}

fn lock_num(region: RegionId, key: &[u8]) -> usize {
    let mut region_bytes = [0u8; 15];
    region_bytes[..4].copy_from_slice(&region.space.0.to_le_bytes());
    region_bytes[4..6].copy_from_slice(&region.subspace.to_le_bytes());
    region_bytes[6] = region.prefix;
    region_bytes[7..15].copy_from_slice(&region.mask.to_le_bytes());
    let seed = hyperdex_hashing::hash_bytes(&region_bytes);
    (hyperdex_hashing::hash_bytes_seeded(key, seed) % LOCK_STRIPING as u64) as usize
}
