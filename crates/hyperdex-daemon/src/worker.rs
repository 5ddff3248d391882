//! Network workers: decode and dispatch.
//!
//! Each worker thread blocks on the logical transport, decodes the
//! payload for the message type, and calls the owning subsystem. `GET`
//! is answered directly from the datalayer; everything else routes to
//! replication, searches, or state transfer. Malformed payloads are
//! logged and dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use hyperdex_disk::DiskError;
use hyperdex_hashing::Search;
use hyperdex_types::{EntityId, MessageType, ReturnCode};
use hyperdex_wire::Payload;
use tracing::{debug, info, warn};

use crate::datalayer::DataLayer;
use crate::logical::Logical;
use crate::replication::ReplicationManager;
use crate::searches::Searches;
use crate::transfers::StateTransfers;

/// After relaying an ack, how often a worker opportunistically flushes
/// the region.
const FLUSH_PROBABILITY: f64 = 0.01;
const FLUSH_BUDGET: usize = 200;

/// Dispatch loop shared by the worker threads.
pub struct NetworkWorker {
    data: Arc<DataLayer>,
    comm: Arc<Logical>,
    searches: Arc<Searches>,
    ost: Arc<StateTransfers>,
    repl: Arc<ReplicationManager>,
    keep_running: AtomicBool,
}

impl NetworkWorker {
    pub fn new(
        data: Arc<DataLayer>,
        comm: Arc<Logical>,
        searches: Arc<Searches>,
        ost: Arc<StateTransfers>,
        repl: Arc<ReplicationManager>,
    ) -> Self {
        Self {
            data,
            comm,
            searches,
            ost,
            repl,
            keep_running: AtomicBool::new(true),
        }
    }

    pub fn shutdown(&self) {
        self.keep_running.store(false, Ordering::SeqCst);
    }

    /// Runs until the transport shuts down.
    pub fn run(&self) {
        while self.keep_running.load(Ordering::SeqCst) {
            let Some((from, to, msg_type, payload)) = self.comm.recv() else {
                break;
            };
            self.dispatch(from, to, msg_type, payload);
        }
    }

    /// Decodes and routes one message.
    pub fn dispatch(&self, from: EntityId, to: EntityId, msg_type: MessageType, payload: Bytes) {
        let decoded = match Payload::decode(msg_type, &mut payload.clone()) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(%msg_type, error = %e, payload = ?payload, "unpack failed");
                return;
            }
        };

        match decoded {
            Payload::ReqGet { nonce, key } => self.handle_get(from, to, nonce, &key),
            Payload::ReqPut { nonce, key, attrs } => {
                self.repl.client_put(from, to, nonce, key, attrs);
            }
            Payload::ReqCondput { nonce, key, conds, attrs } => {
                self.repl.client_condput(from, to, nonce, key, conds, attrs);
            }
            Payload::ReqDel { nonce, key } => self.repl.client_del(from, to, nonce, key),
            Payload::ReqAtomic { nonce, key, ops } => {
                self.repl.client_atomic(from, to, nonce, key, ops);
            }

            Payload::ReqSearchStart { nonce, search_id, arity, terms } => {
                if arity > u32::from(u16::MAX) {
                    debug!(arity, "dropping search with absurd arity");
                    return;
                }
                let mut search = Search::new(arity as usize);
                let mut ok = true;
                for (attr, value) in terms {
                    if usize::from(attr) >= search.equality.len() {
                        ok = false;
                        break;
                    }
                    search.equality[usize::from(attr)] = Some(value);
                }
                if ok {
                    self.searches.start(to, from, search_id, nonce, search);
                } else {
                    debug!("dropping search with out-of-range terms");
                }
            }
            Payload::ReqSearchNext { nonce, search_id } => {
                self.searches.next(to, from, search_id, nonce);
            }
            Payload::ReqSearchStop { search_id, .. } => {
                self.searches.stop(to, from, search_id);
            }

            Payload::ChainPut { version, fresh, key, value } => {
                self.repl.chain_put(from, to, version, fresh, key, value);
            }
            Payload::ChainDel { version, key } => self.repl.chain_del(from, to, version, key),
            Payload::ChainSubspace { version, key, value, nextpoint } => {
                self.repl.chain_subspace(from, to, version, key, value, nextpoint);
            }
            Payload::ChainAck { version, key } => {
                self.repl.chain_ack(from, to, version, key);
                // Occasionally push some of the acked data toward disk.
                if rand::random::<f64>() < FLUSH_PROBABILITY {
                    let _ = self.data.flush(to.region(), FLUSH_BUDGET, true);
                }
            }
            Payload::ChainPending { version, .. } => {
                // Reserved tag with no live usage.
                debug!(version, "dropping CHAIN_PENDING");
            }

            Payload::XferMore => self.ost.region_transfer_send(from, to),
            Payload::XferData { xfer_num, has_value, version, key, value } => {
                self.ost
                    .region_transfer_recv(from, to.subspace, xfer_num, has_value, version, key, value);
            }
            Payload::XferDone => self.ost.region_transfer_done(from, to),

            Payload::ConfigMismatch => info!(%from, "peer reports a configuration mismatch"),
            Payload::PacketNop => {}

            // Responses belong to clients; a server receiving one is a
            // routing bug on the sender's side.
            Payload::RespGet { .. }
            | Payload::RespPut { .. }
            | Payload::RespCondput { .. }
            | Payload::RespDel { .. }
            | Payload::RespAtomic { .. }
            | Payload::RespSearchItem { .. }
            | Payload::RespSearchDone { .. } => {
                debug!(%msg_type, "dropping response message addressed to a server");
            }
        }
    }

    fn handle_get(&self, from: EntityId, to: EntityId, nonce: u64, key: &[u8]) {
        let (code, value) = match self.data.get(to.region(), key) {
            Ok((value, _version)) => (ReturnCode::Success, value),
            Err(DiskError::NotFound) => (ReturnCode::NotFound, Vec::new()),
            Err(DiskError::MissingDisk) => {
                warn!(%to, "GET hit a missing disk");
                (ReturnCode::ServerError, Vec::new())
            }
            Err(e) => {
                warn!(%to, error = %e, "GET returned an unacceptable error");
                (ReturnCode::ServerError, Vec::new())
            }
        };

        let payload = Payload::RespGet { nonce, code: code.as_u16(), value };
        self.comm.send(to, from, &payload);
    }
}
