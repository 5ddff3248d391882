//! Ongoing state transfers: streaming a region to a joining replica.
//!
//! An outgoing transfer walks a rolling snapshot of the region, sending
//! one object per `XFER_MORE` request. An incoming transfer applies
//! `XFER_DATA` messages in strict `xfer_num` order from a reorder
//! window, writing each object to disk unless the live replication
//! pipeline has already claimed the key.
//!
//! The synchronization point with live writes is the per-transfer
//! trigger map, filled by the replication manager's ack path under the
//! key's stripe lock. If a transferred `(key, version)` is already in
//! the map, the live pipeline got there first and the whole transfer is
//! complete; if any other version of the key is in the map, that key is
//! skipped (the pipeline owns it). Either path can win; the other backs
//! off.
//!
//! Handoff: on `XFER_DONE` the receiver reports `transfer_golive` and
//! keeps re-sending it (and `XFER_MORE`) from the periodic thread until
//! a new configuration folds it into the chain.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use hyperdex_config::Configuration;
use hyperdex_disk::RollingSnapshot;
use hyperdex_types::{EntityId, Instance, RegionId};
use hyperdex_wire::Payload;
use tracing::{debug, info, warn};

use crate::coordinator::CoordinatorLink;
use crate::datalayer::DataLayer;
use crate::logical::Logical;
use crate::replication::ReplicationManager;

/// Outstanding `XFER_MORE` requests per incoming transfer.
const TRANSFERS_IN_FLIGHT: usize = 16;

/// Reorder-window bound: more queued than this means the sender lost a
/// message (FIFO delivery would have drained the window).
const WINDOW_OVERFLOW: usize = TRANSFERS_IN_FLIGHT * 64;

const PERIODIC_TICK: Duration = Duration::from_millis(250);

struct XferOp {
    has_value: bool,
    version: u64,
    key: Bytes,
    value: Vec<Bytes>,
}

struct TransferInState {
    /// Reorder window, keyed by xfer_num.
    ops: BTreeMap<u64, XferOp>,
    /// The last xfer_num applied.
    xfer_num: u64,
    failed: bool,
    started: bool,
    go_live: bool,
    triggered: bool,
}

struct TransferIn {
    region: RegionId,
    /// The sender: the tail of the region's chain.
    replicate_from: EntityId,
    state: Mutex<TransferInState>,
    /// `(key, version)` pairs committed by the live pipeline. Written
    /// under the key's stripe lock.
    triggers: Mutex<BTreeMap<(Bytes, u64), ()>>,
}

struct TransferOutState {
    snap: RollingSnapshot,
    xfer_num: u64,
    failed: bool,
}

struct TransferOut {
    state: Mutex<TransferOutState>,
}

/// The state-transfer subsystem.
pub struct StateTransfers {
    data: Arc<DataLayer>,
    comm: Arc<Logical>,
    cl: Arc<CoordinatorLink>,
    repl: Mutex<Weak<ReplicationManager>>,
    config: RwLock<Arc<Configuration>>,
    transfers_in: Mutex<HashMap<u16, Arc<TransferIn>>>,
    transfers_out: Mutex<HashMap<u16, Arc<TransferOut>>>,
    shutdown: AtomicBool,
    periodic_mutex: Arc<Mutex<()>>,
    periodic_thread: Mutex<Option<JoinHandle<()>>>,
}

impl StateTransfers {
    pub fn new(
        data: Arc<DataLayer>,
        comm: Arc<Logical>,
        cl: Arc<CoordinatorLink>,
        periodic_mutex: Arc<Mutex<()>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            data,
            comm,
            cl,
            repl: Mutex::new(Weak::new()),
            config: RwLock::new(Arc::new(Configuration::default())),
            transfers_in: Mutex::new(HashMap::new()),
            transfers_out: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
            periodic_mutex,
            periodic_thread: Mutex::new(None),
        })
    }

    /// Wires up the replication manager (the two reference each other).
    pub fn set_replication_manager(&self, repl: &Arc<ReplicationManager>) {
        *self.repl.lock().expect("repl link lock") = Arc::downgrade(repl);
    }

    pub fn start(self: &Arc<Self>) {
        let ost = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("xfer-periodic".to_string())
            .spawn(move || ost.periodic())
            .expect("spawn transfer periodic thread");
        *self.periodic_thread.lock().expect("periodic thread lock") = Some(handle);
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.periodic_thread.lock().expect("periodic thread lock").take() {
            let _ = handle.join();
        }
    }

    fn repl(&self) -> Option<Arc<ReplicationManager>> {
        self.repl.lock().expect("repl link lock").upgrade()
    }

    // ------------------------------------------------------------------
    // Reconfiguration
    // ------------------------------------------------------------------

    /// Creates transfer state for every in-progress transfer that names
    /// this server, in either direction.
    pub fn prepare(&self, config: &Arc<Configuration>, us: Instance) {
        let _periodic = self.periodic_mutex.lock().expect("periodic mutex");

        for (xfer_id, region) in config.transfers_to(us) {
            let mut transfers = self.transfers_in.lock().expect("transfers-in lock");
            if transfers.contains_key(&xfer_id) {
                continue;
            }
            let Some(replicate_from) = config.tail_of(region) else {
                warn!(xfer_id, %region, "transfer names a region with no chain");
                continue;
            };
            info!(xfer_id, %region, "initiating inbound transfer");
            transfers.insert(
                xfer_id,
                Arc::new(TransferIn {
                    region,
                    replicate_from,
                    state: Mutex::new(TransferInState {
                        ops: BTreeMap::new(),
                        xfer_num: 0,
                        failed: false,
                        started: false,
                        go_live: false,
                        triggered: false,
                    }),
                    triggers: Mutex::new(BTreeMap::new()),
                }),
            );
        }

        for (xfer_id, region) in config.transfers_from(us) {
            let mut transfers = self.transfers_out.lock().expect("transfers-out lock");
            if transfers.contains_key(&xfer_id) {
                continue;
            }
            let Some(snap) = self.data.make_rolling_snapshot(region) else {
                warn!(xfer_id, %region, "no disk to snapshot for outbound transfer");
                continue;
            };
            info!(xfer_id, %region, "initiating outbound transfer");
            transfers.insert(
                xfer_id,
                Arc::new(TransferOut {
                    state: Mutex::new(TransferOutState { snap, xfer_num: 1, failed: false }),
                }),
            );
        }
    }

    pub fn reconfigure(&self, config: &Arc<Configuration>, _us: Instance) {
        let _periodic = self.periodic_mutex.lock().expect("periodic mutex");
        *self.config.write().expect("config lock") = Arc::clone(config);
    }

    /// Drops transfer state the new configuration no longer lists, and
    /// re-reports anything the coordinator has not yet acted on.
    pub fn cleanup(&self, config: &Arc<Configuration>, us: Instance) {
        let _periodic = self.periodic_mutex.lock().expect("periodic mutex");
        let in_transfers = config.transfers_to(us);
        let out_transfers = config.transfers_from(us);

        let mut transfers = self.transfers_in.lock().expect("transfers-in lock");
        transfers.retain(|&xfer_id, transfer| {
            let Some(&region) = in_transfers.get(&xfer_id) else {
                info!(xfer_id, "stopping incoming transfer");
                return false;
            };
            let state = transfer.state.lock().expect("transfer-in state lock");
            // A go-live not yet folded into the chain, or a triggered
            // completion, must be re-announced: the earlier report may
            // have been lost.
            if state.go_live && config.entity_for(us, region).is_none() {
                self.cl.transfer_golive(xfer_id);
            }
            if state.triggered {
                self.cl.transfer_complete(xfer_id);
            }
            true
        });
        drop(transfers);

        let mut transfers = self.transfers_out.lock().expect("transfers-out lock");
        transfers.retain(|&xfer_id, _| {
            if out_transfers.contains_key(&xfer_id) {
                true
            } else {
                info!(xfer_id, "stopping outgoing transfer");
                false
            }
        });
    }

    // ------------------------------------------------------------------
    // Outgoing
    // ------------------------------------------------------------------

    /// Handles `XFER_MORE`: sends the snapshot's next object, or
    /// `XFER_DONE` on exhaustion. `from` is the requesting transfer
    /// entity, `to` is us.
    pub fn region_transfer_send(&self, from: EntityId, to: EntityId) {
        let xfer_id = from.subspace;
        let transfer = {
            let transfers = self.transfers_out.lock().expect("transfers-out lock");
            match transfers.get(&xfer_id) {
                Some(t) => Arc::clone(t),
                None => {
                    debug!(xfer_id, "dropping request for unknown outbound transfer");
                    return;
                }
            }
        };

        let mut state = transfer.state.lock().expect("transfer-out state lock");
        if state.failed {
            self.cl.fail_transfer(xfer_id);
            return;
        }

        let payload = if state.snap.valid() {
            let payload = Payload::XferData {
                xfer_num: state.xfer_num,
                has_value: state.snap.has_value(),
                version: state.snap.version(),
                key: state.snap.key().clone(),
                value: state.snap.value().to_vec(),
            };
            state.xfer_num += 1;
            state.snap.next();
            payload
        } else {
            Payload::XferDone
        };

        if !self.comm.send(to, from, &payload) {
            state.failed = true;
            self.cl.fail_transfer(xfer_id);
        }
    }

    // ------------------------------------------------------------------
    // Incoming
    // ------------------------------------------------------------------

    /// Handles `XFER_DATA`: queues the object and applies everything
    /// that has become contiguous, then requests more.
    pub fn region_transfer_recv(
        &self,
        _from: EntityId,
        xfer_id: u16,
        xfer_num: u64,
        has_value: bool,
        version: u64,
        key: Bytes,
        value: Vec<Bytes>,
    ) {
        let transfer = {
            let transfers = self.transfers_in.lock().expect("transfers-in lock");
            match transfers.get(&xfer_id) {
                Some(t) => Arc::clone(t),
                None => {
                    debug!(xfer_id, "received XFER_DATA for unknown transfer");
                    return;
                }
            }
        };

        let mut state = transfer.state.lock().expect("transfer-in state lock");
        if state.failed {
            self.cl.fail_transfer(xfer_id);
            return;
        }
        if state.triggered {
            return;
        }

        // A window this deep means a message was dropped somewhere: the
        // sender hands them out in order, so the gap will never fill.
        if state.ops.len() > WINDOW_OVERFLOW {
            state.failed = true;
            self.cl.fail_transfer(xfer_id);
            return;
        }

        state.ops.insert(xfer_num, XferOp { has_value, version, key, value });

        while let Some((&next_num, _)) = state.ops.first_key_value() {
            if next_num != state.xfer_num + 1 {
                break;
            }
            let op = state.ops.remove(&next_num).expect("first key exists");

            let Some(repl) = self.repl() else {
                return;
            };
            // Serialize against live replication on this key.
            let _stripe = repl.key_lock(transfer.region, &op.key);
            let triggers = transfer.triggers.lock().expect("trigger lock");

            if triggers.contains_key(&(op.key.clone(), op.version)) {
                // The live pipeline already committed this exact
                // version: everything earlier is covered too.
                state.triggered = true;
                self.cl.transfer_complete(xfer_id);
                return;
            }

            let busy = triggers
                .range((
                    Bound::Included((op.key.clone(), 0)),
                    Bound::Included((op.key.clone(), u64::MAX)),
                ))
                .next()
                .is_some();
            drop(triggers);

            if !busy {
                let result = if op.has_value {
                    self.data.put(transfer.region, op.key.clone(), op.value.clone(), op.version)
                } else {
                    self.data.del(transfer.region, op.key.clone())
                };
                if let Err(e) = result {
                    warn!(xfer_id, error = %e, "transfer failed applying object");
                    state.failed = true;
                    self.cl.fail_transfer(xfer_id);
                    return;
                }
                repl.check_for_deferred_operations(
                    transfer.region,
                    op.version,
                    &op.key,
                    op.has_value,
                    &op.value,
                );
            }

            state.xfer_num += 1;
        }

        state.started = true;
        if !self.comm.send(EntityId::transfer(xfer_id), transfer.replicate_from, &Payload::XferMore)
        {
            state.failed = true;
            self.cl.fail_transfer(xfer_id);
        }
    }

    /// Handles `XFER_DONE`: the snapshot is exhausted; ask to go live.
    pub fn region_transfer_done(&self, from: EntityId, to: EntityId) {
        let xfer_id = to.subspace;
        let transfer = {
            let transfers = self.transfers_in.lock().expect("transfers-in lock");
            match transfers.get(&xfer_id) {
                Some(t) => Arc::clone(t),
                None => {
                    debug!(xfer_id, "received XFER_DONE for unknown transfer");
                    return;
                }
            }
        };

        let mut state = transfer.state.lock().expect("transfer-in state lock");
        if state.failed {
            self.cl.fail_transfer(xfer_id);
            return;
        }
        if from != transfer.replicate_from {
            warn!(xfer_id, %from, "another host is stepping on this transfer");
            return;
        }

        state.started = true;
        if !state.go_live {
            info!(xfer_id, "transfer asking to go live");
            state.go_live = true;
            self.cl.transfer_golive(xfer_id);
        }
    }

    /// Records that the live pipeline committed `(key, version)` in a
    /// region under transfer. Called by the replication ack path with
    /// the key's stripe lock held.
    pub fn add_trigger(&self, region: RegionId, key: Bytes, version: u64) {
        let config = Arc::clone(&self.config.read().expect("config lock"));
        let Some(xfer_id) = config.transfer_id(region) else {
            return;
        };
        let transfer = {
            let transfers = self.transfers_in.lock().expect("transfers-in lock");
            match transfers.get(&xfer_id) {
                Some(t) => Arc::clone(t),
                None => return,
            }
        };
        transfer
            .triggers
            .lock()
            .expect("trigger lock")
            .insert((key, version), ());
    }

    // ------------------------------------------------------------------
    // Periodic work
    // ------------------------------------------------------------------

    fn periodic(&self) {
        info!("state transfer periodic thread started");

        let mut tick: u64 = 0;
        while !self.shutdown.load(Ordering::SeqCst) {
            // Every half second: prime transfers that have not started.
            if tick % 2 == 0 {
                self.start_transfers();
            }
            // Every second: keep poking transfers waiting to go live.
            if tick % 4 == 0 {
                self.finish_transfers();
            }
            tick += 1;
            thread::sleep(PERIODIC_TICK);
        }
    }

    fn start_transfers(&self) {
        let _periodic = self.periodic_mutex.lock().expect("periodic mutex");
        let transfers: Vec<(u16, Arc<TransferIn>)> = {
            let map = self.transfers_in.lock().expect("transfers-in lock");
            map.iter().map(|(&id, t)| (id, Arc::clone(t))).collect()
        };

        for (xfer_id, transfer) in transfers {
            let started = transfer.state.lock().expect("transfer-in state lock").started;
            if !started {
                for _ in 0..TRANSFERS_IN_FLIGHT {
                    self.comm.send(
                        EntityId::transfer(xfer_id),
                        transfer.replicate_from,
                        &Payload::XferMore,
                    );
                }
            }
        }
    }

    fn finish_transfers(&self) {
        let _periodic = self.periodic_mutex.lock().expect("periodic mutex");
        let transfers: Vec<(u16, Arc<TransferIn>)> = {
            let map = self.transfers_in.lock().expect("transfers-in lock");
            map.iter().map(|(&id, t)| (id, Arc::clone(t))).collect()
        };

        for (xfer_id, transfer) in transfers {
            let mut state = transfer.state.lock().expect("transfer-in state lock");
            if state.go_live
                && !self.comm.send(
                    EntityId::transfer(xfer_id),
                    transfer.replicate_from,
                    &Payload::XferMore,
                )
            {
                state.failed = true;
                self.cl.fail_transfer(xfer_id);
            }
        }
    }
}
