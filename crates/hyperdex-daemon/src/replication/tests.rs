//! Replication scenario tests.
//!
//! These drive the full in-process stack (datalayer, logical transport
//! in loopback mode, replication, transfers, searches, worker dispatch)
//! against literal configurations. The harness pumps the loopback
//! delivery queue: self-addressed messages go through real worker
//! dispatch, client- and peer-addressed messages are captured for
//! assertions.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use hyperdex_config::Configuration;
use hyperdex_types::{
    EntityId, Instance, MessageType, Microop, MicroopAction, RegionId, ReturnCode, SpaceId,
    AttributeType,
};
use hyperdex_wire::{MessageHeader, Payload};

use crate::coordinator::CoordinatorLink;
use crate::datalayer::DataLayer;
use crate::logical::Logical;
use crate::net::NetEvent;
use crate::replication::ReplicationManager;
use crate::searches::Searches;
use crate::transfers::StateTransfers;
use crate::worker::NetworkWorker;

/// One space, one subspace, one region, one replica.
const SINGLE: &str = "\
version 1
host 1 127.0.0.1 2012 1 2013 1
space 9 users name string age int64 score int64
subspace 9 0 true true false false false false
region 9 0 0 0 1
";

/// Same space, two replicas in the chain.
const CHAIN: &str = "\
version 1
host 1 127.0.0.1 2012 1 2013 1
host 2 127.0.0.1 3012 1 3013 1
space 9 users name string age int64 score int64
subspace 9 0 true true false false false false
region 9 0 0 0 1 2
";

/// Single replica serving the region, with a transfer to host 2.
const TRANSFER: &str = "\
version 1
host 1 127.0.0.1 2012 1 2013 1
host 2 127.0.0.1 3012 1 3013 1
space 9 users name string age int64 score int64
subspace 9 0 true true false false false false
region 9 0 0 0 1
transfer 5 9 0 0 0 2
";

const XFER_ID: u16 = 5;

fn host(n: u16) -> Instance {
    Instance::new(IpAddr::V4(Ipv4Addr::LOCALHOST), n, 1, n + 1, 1)
}

fn region() -> RegionId {
    RegionId::new(SpaceId(9), 0, 0, 0)
}

fn entity(number: u8) -> EntityId {
    EntityId::in_region(region(), number)
}

fn client() -> EntityId {
    EntityId::client(1)
}

fn b(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

fn int(n: i64) -> Bytes {
    Bytes::copy_from_slice(&n.to_le_bytes())
}

/// Messages captured by one pump pass.
#[derive(Default)]
struct Pumped {
    /// Responses addressed to client endpoints.
    client: Vec<(EntityId, Payload)>,
    /// Messages addressed to other servers.
    peer: Vec<(EntityId, EntityId, Payload)>,
}

impl Pumped {
    fn client_codes(&self) -> Vec<u16> {
        self.client
            .iter()
            .filter_map(|(_, p)| match p {
                Payload::RespPut { code, .. }
                | Payload::RespCondput { code, .. }
                | Payload::RespDel { code, .. }
                | Payload::RespAtomic { code, .. }
                | Payload::RespGet { code, .. } => Some(*code),
                _ => None,
            })
            .collect()
    }

    fn expect_code(&self, expected: ReturnCode) {
        assert_eq!(self.client_codes(), vec![expected.as_u16()]);
    }
}

struct TestServer {
    data: Arc<DataLayer>,
    comm: Arc<Logical>,
    searches: Arc<Searches>,
    ost: Arc<StateTransfers>,
    repl: Arc<ReplicationManager>,
    worker: NetworkWorker,
    config: Mutex<Arc<Configuration>>,
    us: Instance,
    tmp: tempfile::TempDir,
}

impl TestServer {
    fn new(config_text: &str, us: Instance) -> Self {
        Self::new_seeded(config_text, us, &[])
    }

    /// Builds a server whose disk already holds `seed` objects before
    /// the configuration (and any outbound transfer snapshot) installs.
    fn new_seeded(config_text: &str, us: Instance, seed: &[(&str, u64, i64)]) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let cl = Arc::new(CoordinatorLink::new("127.0.0.1:1".parse().unwrap()));
        let data = DataLayer::new(tmp.path()).unwrap();
        let comm = Arc::new(Logical::loopback(Arc::clone(&cl), us));
        let periodic = Arc::new(Mutex::new(()));
        let searches = Searches::new(Arc::clone(&data), Arc::clone(&comm));
        let ost = StateTransfers::new(
            Arc::clone(&data),
            Arc::clone(&comm),
            Arc::clone(&cl),
            Arc::clone(&periodic),
        );
        let repl = ReplicationManager::new(
            Arc::clone(&cl),
            Arc::clone(&data),
            Arc::clone(&comm),
            Arc::clone(&ost),
            Arc::clone(&periodic),
        );
        ost.set_replication_manager(&repl);

        let worker = NetworkWorker::new(
            Arc::clone(&data),
            Arc::clone(&comm),
            Arc::clone(&searches),
            Arc::clone(&ost),
            Arc::clone(&repl),
        );

        let server = Self {
            data,
            comm,
            searches,
            ost,
            repl,
            worker,
            config: Mutex::new(Arc::new(Configuration::default())),
            us,
            tmp,
        };

        // The fake client the scenarios originate from.
        server.comm.register_client(1, "127.0.0.9:5555".parse().unwrap());

        if !seed.is_empty() {
            let config = Arc::new(hyperdex_config::parse(config_text).unwrap());
            server.data.prepare(&config, us);
            for &(key, version, val) in seed {
                server
                    .data
                    .put(region(), b(key), vec![int(val), int(0)], version)
                    .unwrap();
            }
        }

        server.install(config_text);
        server
    }

    /// Applies a configuration the way the daemon loop does.
    fn install(&self, config_text: &str) {
        let config = Arc::new(hyperdex_config::parse(config_text).unwrap());
        let us = self.us;

        self.comm.prepare(&config, us);
        self.data.prepare(&config, us);
        self.repl.prepare(&config, us);
        self.ost.prepare(&config, us);
        self.searches.prepare(&config, us);

        self.comm.reconfigure(&config, us);
        self.data.reconfigure(&config, us);
        self.repl.reconfigure(&config, us);
        self.ost.reconfigure(&config, us);
        self.searches.reconfigure(&config, us);

        self.ost.cleanup(&config, us);
        self.repl.cleanup(&config, us);
        self.data.cleanup(&config, us);
        self.searches.cleanup(&config, us);
        self.comm.cleanup(&config, us);

        // pump() routes on the installed configuration.
        *self.config.lock().unwrap() = config;
    }

    /// Drains the loopback queue: dispatches self-addressed messages,
    /// captures the rest.
    fn pump(&self) -> Pumped {
        let mut pumped = Pumped::default();
        let config = Arc::clone(&self.config.lock().unwrap());

        while let Some(event) = self.comm.transport.try_recv() {
            let NetEvent::Message { msg, .. } = event else { continue };
            let mut buf = msg;
            let header = MessageHeader::decode(&mut buf).unwrap();

            if header.to.is_client() {
                let payload = Payload::decode(header.msg_type, &mut buf.clone()).unwrap();
                pumped.client.push((header.to, payload));
            } else if config.instance_for(header.to) == self.us {
                self.worker.dispatch(header.from, header.to, header.msg_type, buf);
            } else {
                let payload = Payload::decode(header.msg_type, &mut buf.clone()).unwrap();
                pumped.peer.push((header.from, header.to, payload));
            }
        }

        pumped
    }

    fn put(&self, nonce: u64, key: &str, attrs: Vec<(u16, Bytes)>) -> Pumped {
        self.repl.client_put(client(), entity(0), nonce, b(key), attrs);
        self.pump()
    }

    fn get_via_worker(&self, nonce: u64, key: &str) -> Pumped {
        let mut buf = BytesMut::new();
        Payload::ReqGet { nonce, key: b(key) }.encode_into(&mut buf);
        self.worker
            .dispatch(client(), entity(0), MessageType::ReqGet, buf.freeze());
        self.pump()
    }
}

// ============================================================================
// Client operation scenarios
// ============================================================================

#[test]
fn put_get_roundtrip() {
    let server = TestServer::new(SINGLE, host(2012));

    let pumped = server.put(1, "alice", vec![(1, int(30))]);
    pumped.expect_code(ReturnCode::Success);

    let (value, version) = server.data.get(region(), b"alice").unwrap();
    assert_eq!(value[0], int(30));
    assert_eq!(version, 1);

    // The same through the worker's GET path.
    let pumped = server.get_via_worker(2, "alice");
    match &pumped.client[..] {
        [(_, Payload::RespGet { nonce, code, value })] => {
            assert_eq!(*nonce, 2);
            assert_eq!(*code, ReturnCode::Success.as_u16());
            assert_eq!(value[0], int(30));
        }
        other => panic!("unexpected responses: {other:?}"),
    }

    // All per-key state drained away.
    assert_eq!(server.repl.keyholder_count(), 0);
}

#[test]
fn delete_of_absent_key_reports_not_found() {
    let server = TestServer::new(SINGLE, host(2012));
    server.repl.client_del(client(), entity(0), 1, b("bob"));
    server.pump().expect_code(ReturnCode::NotFound);
}

#[test]
fn put_then_delete_then_delete() {
    let server = TestServer::new(SINGLE, host(2012));
    server.put(1, "alice", vec![(1, int(30))]).expect_code(ReturnCode::Success);

    server.repl.client_del(client(), entity(0), 2, b("alice"));
    server.pump().expect_code(ReturnCode::Success);
    assert!(server.data.get(region(), b"alice").is_err());

    // Idempotence after delete: the second delete finds nothing.
    server.repl.client_del(client(), entity(0), 3, b("alice"));
    server.pump().expect_code(ReturnCode::NotFound);
}

#[test]
fn condput_hit_and_miss() {
    let server = TestServer::new(SINGLE, host(2012));
    server.put(1, "alice", vec![(1, int(30))]).expect_code(ReturnCode::Success);

    // Condition holds: the put applies.
    server.repl.client_condput(
        client(),
        entity(0),
        2,
        b("alice"),
        vec![(1, int(30))],
        vec![(1, int(31))],
    );
    server.pump().expect_code(ReturnCode::Success);
    let (value, version) = server.data.get(region(), b"alice").unwrap();
    assert_eq!(value[0], int(31));
    assert_eq!(version, 2);

    // Condition no longer holds: CMPFAIL, nothing changes.
    server.repl.client_condput(
        client(),
        entity(0),
        3,
        b("alice"),
        vec![(1, int(30))],
        vec![(1, int(32))],
    );
    server.pump().expect_code(ReturnCode::CmpFail);
    let (value, version) = server.data.get(region(), b"alice").unwrap();
    assert_eq!(value[0], int(31));
    assert_eq!(version, 2);
}

#[test]
fn condput_on_absent_key_is_not_found() {
    let server = TestServer::new(SINGLE, host(2012));
    server.repl.client_condput(
        client(),
        entity(0),
        1,
        b("ghost"),
        vec![(1, int(1))],
        vec![(1, int(2))],
    );
    server.pump().expect_code(ReturnCode::NotFound);
}

#[test]
fn partial_put_preserves_unnamed_attributes() {
    let server = TestServer::new(SINGLE, host(2012));
    server
        .put(1, "alice", vec![(1, int(30)), (2, int(99))])
        .expect_code(ReturnCode::Success);

    // Touch only attr 1; attr 2 must carry over.
    server.put(2, "alice", vec![(1, int(31))]).expect_code(ReturnCode::Success);
    let (value, version) = server.data.get(region(), b"alice").unwrap();
    assert_eq!(value[0], int(31));
    assert_eq!(value[1], int(99));
    assert_eq!(version, 2);
}

#[test]
fn put_rejects_bad_attributes() {
    let server = TestServer::new(SINGLE, host(2012));

    // Attribute 0 is the key and may not be assigned.
    server.put(1, "alice", vec![(0, int(1))]).expect_code(ReturnCode::BadDimSpec);
    // Out-of-range attribute.
    server.put(2, "alice", vec![(9, int(1))]).expect_code(ReturnCode::BadDimSpec);
    // Type mismatch: attr 1 is int64, nine bytes do not decode.
    server
        .put(3, "alice", vec![(1, Bytes::from_static(&[0; 9]))])
        .expect_code(ReturnCode::BadDimSpec);
}

#[test]
fn non_point_leader_refuses_client_ops() {
    // We are the second replica in the chain; clients must not land here.
    let server = TestServer::new(CHAIN, host(3012));
    server.repl.client_put(client(), entity(1), 1, b("alice"), vec![(1, int(30))]);
    server.pump().expect_code(ReturnCode::NotUs);
}

// ============================================================================
// Atomic scenarios
// ============================================================================

#[test]
fn atomic_add_with_overflow_boundary() {
    let server = TestServer::new(SINGLE, host(2012));
    server
        .put(1, "k", vec![(1, int(i64::MAX - 1))])
        .expect_code(ReturnCode::Success);

    let add_one =
        vec![Microop::with_int(1, AttributeType::Int64, MicroopAction::Int64Add, 1)];
    server.repl.client_atomic(client(), entity(0), 2, b("k"), add_one.clone());
    server.pump().expect_code(ReturnCode::Success);
    let (value, _) = server.data.get(region(), b"k").unwrap();
    assert_eq!(value[0], int(i64::MAX));

    // Two's-complement wrap at the boundary.
    server.repl.client_atomic(client(), entity(0), 3, b("k"), add_one);
    server.pump().expect_code(ReturnCode::Success);
    let (value, _) = server.data.get(region(), b"k").unwrap();
    assert_eq!(value[0], int(i64::MIN));
}

#[test]
fn atomic_on_absent_key_is_not_found() {
    let server = TestServer::new(SINGLE, host(2012));
    let ops = vec![Microop::with_int(1, AttributeType::Int64, MicroopAction::Int64Add, 1)];
    server.repl.client_atomic(client(), entity(0), 1, b("ghost"), ops);
    server.pump().expect_code(ReturnCode::NotFound);
}

#[test]
fn atomic_unsorted_ops_fail_without_side_effects() {
    let server = TestServer::new(SINGLE, host(2012));
    server
        .put(1, "k", vec![(1, int(10)), (2, int(20))])
        .expect_code(ReturnCode::Success);

    let unsorted = vec![
        Microop::with_int(2, AttributeType::Int64, MicroopAction::Int64Add, 1),
        Microop::with_int(1, AttributeType::Int64, MicroopAction::Int64Add, 1),
    ];
    server.repl.client_atomic(client(), entity(0), 2, b("k"), unsorted);
    server.pump().expect_code(ReturnCode::BadMicros);

    let (value, version) = server.data.get(region(), b"k").unwrap();
    assert_eq!(value[0], int(10));
    assert_eq!(value[1], int(20));
    assert_eq!(version, 1);
}

#[test]
fn atomic_empty_ops_succeed_without_new_version() {
    let server = TestServer::new(SINGLE, host(2012));
    server.put(1, "k", vec![(1, int(10))]).expect_code(ReturnCode::Success);

    server.repl.client_atomic(client(), entity(0), 2, b("k"), Vec::new());
    server.pump().expect_code(ReturnCode::Success);
    let (_, version) = server.data.get(region(), b"k").unwrap();
    assert_eq!(version, 1);
}

#[test]
fn atomic_div_by_zero_overflows() {
    let server = TestServer::new(SINGLE, host(2012));
    server.put(1, "k", vec![(1, int(10))]).expect_code(ReturnCode::Success);

    let ops = vec![Microop::with_int(1, AttributeType::Int64, MicroopAction::Int64Div, 0)];
    server.repl.client_atomic(client(), entity(0), 2, b("k"), ops);
    server.pump().expect_code(ReturnCode::Overflow);
}

// ============================================================================
// Chain scenarios
// ============================================================================

#[test]
fn deferred_ops_promote_once_contiguous() {
    // We are the tail of a two-replica chain with versions 1..=2 on disk.
    let server = TestServer::new(CHAIN, host(3012));
    server.data.put(region(), b("k"), vec![int(30), int(0)], 2).unwrap();

    // v5 and v4 arrive early: both defer (their predecessors are gaps).
    server
        .repl
        .chain_put(entity(0), entity(1), 5, false, b("k"), vec![int(55), int(0)]);
    assert_eq!(server.repl.queue_depths(region(), b"k"), (0, 0, 1));
    server
        .repl
        .chain_put(entity(0), entity(1), 4, false, b("k"), vec![int(44), int(0)]);
    assert_eq!(server.repl.queue_depths(region(), b"k"), (0, 0, 2));

    // v3 fills the gap: everything promotes in order.
    server
        .repl
        .chain_put(entity(0), entity(1), 3, false, b("k"), vec![int(33), int(0)]);
    assert_eq!(server.repl.queue_depths(region(), b"k"), (3, 0, 0));

    // A duplicate of v3 is recognized and re-acked upstream.
    server
        .repl
        .chain_put(entity(0), entity(1), 3, false, b("k"), vec![int(33), int(0)]);
    let pumped = server.pump();
    let acks: Vec<u64> = pumped
        .peer
        .iter()
        .filter_map(|(_, to, p)| match p {
            Payload::ChainAck { version, .. } if *to == entity(0) => Some(*version),
            _ => None,
        })
        .collect();
    // The redelivery ack plus the tail acks for 3, 4, 5.
    assert_eq!(acks, vec![3, 3, 4, 5]);

    // The tail committed everything.
    let (value, version) = server.data.get(region(), b"k").unwrap();
    assert_eq!(version, 5);
    assert_eq!(value[0], int(55));
    assert_eq!(server.repl.keyholder_count(), 0);
}

#[test]
fn chain_put_from_non_adjacent_host_is_dropped() {
    let server = TestServer::new(CHAIN, host(3012));
    // entity(1) is us; a message claiming to come from us to us is not
    // chain-adjacent.
    server
        .repl
        .chain_put(entity(1), entity(1), 1, true, b("k"), vec![int(1), int(0)]);
    assert_eq!(server.repl.queue_depths(region(), b"k"), (0, 0, 0));
    assert!(server.data.get(region(), b"k").is_err());
}

#[test]
fn head_of_chain_forwards_downstream() {
    // We are the head of a two-replica chain: a client put must be
    // forwarded to the successor, not self-acked.
    let server = TestServer::new(CHAIN, host(2012));
    server.repl.client_put(client(), entity(0), 1, b("alice"), vec![(1, int(30))]);
    let pumped = server.pump();

    assert!(pumped.client.is_empty(), "no response before the ack returns");
    match &pumped.peer[..] {
        [(from, to, Payload::ChainPut { version, fresh, key, .. })] => {
            assert_eq!(*from, entity(0));
            assert_eq!(*to, entity(1));
            assert_eq!(*version, 1);
            assert!(*fresh);
            assert_eq!(key.as_ref(), b"alice");
        }
        other => panic!("unexpected peer messages: {other:?}"),
    }

    // The downstream ack completes the write and answers the client.
    server.repl.chain_ack(entity(1), entity(0), 1, b("alice"));
    server.pump().expect_code(ReturnCode::Success);
    let (_, version) = server.data.get(region(), b"alice").unwrap();
    assert_eq!(version, 1);
}

#[test]
fn blocked_delete_waits_for_committable_to_drain() {
    // Head of a two-replica chain: the put stays committable until its
    // ack returns, so a following delete must block.
    let server = TestServer::new(CHAIN, host(2012));
    server.repl.client_put(client(), entity(0), 1, b("k"), vec![(1, int(1))]);
    server.pump();
    assert_eq!(server.repl.queue_depths(region(), b"k"), (1, 0, 0));

    server.repl.client_del(client(), entity(0), 2, b("k"));
    server.pump();
    // The delete is a blocker: it waits in `blocked`.
    assert_eq!(server.repl.queue_depths(region(), b"k"), (1, 1, 0));

    // Ack of v1 releases the delete down the chain.
    server.repl.chain_ack(entity(1), entity(0), 1, b("k"));
    let pumped = server.pump();
    assert_eq!(pumped.client_codes(), vec![ReturnCode::Success.as_u16()]);
    assert_eq!(server.repl.queue_depths(region(), b"k"), (1, 0, 0));
    let dels: Vec<u64> = pumped
        .peer
        .iter()
        .filter_map(|(_, _, p)| match p {
            Payload::ChainDel { version, .. } => Some(*version),
            _ => None,
        })
        .collect();
    assert_eq!(dels, vec![2]);
}

// ============================================================================
// Quiesce
// ============================================================================

#[test]
fn quiesce_drains_and_fences() {
    let server = TestServer::new(SINGLE, host(2012));
    server.put(1, "k1", vec![(1, int(10))]).expect_code(ReturnCode::Success);

    // One op mid-flight when the quiesce configuration lands.
    server.repl.client_put(client(), entity(0), 2, b("k2"), vec![(1, int(20))]);
    server.install(&format!("{SINGLE}quiesce snap-1\n"));

    // The in-flight op still completes and drains. (Its disk write
    // races the fence; durability of k2 is not promised.)
    server.pump().expect_code(ReturnCode::Success);
    assert_eq!(server.repl.keyholder_count(), 0);

    // New mutations are refused.
    server.repl.client_put(client(), entity(0), 3, b("k3"), vec![(1, int(30))]);
    server.pump().expect_code(ReturnCode::ReadOnly);

    // An empty retransmission pass is the quiesced condition.
    assert_eq!(server.repl.retransmit(), 0);

    // The state file was written and the disks are fenced.
    assert!(server.tmp.path().join(crate::datalayer::STATE_FILE_NAME).exists());
    assert!(server.data.put(region(), b("x"), vec![int(1), int(0)], 9).is_err());

    // A restart reopens the same disks under snap-1 with k1 intact.
    let restored = DataLayer::new(server.tmp.path()).unwrap();
    let (value, version) = restored.get(region(), b"k1").unwrap();
    assert_eq!(value[0], int(10));
    assert_eq!(version, 1);
}

// ============================================================================
// State transfer scenarios
// ============================================================================

#[test]
fn incoming_transfer_applies_in_xfer_num_order() {
    let server = TestServer::new(TRANSFER, host(3012));

    // 3 and 2 arrive before 1: nothing applies until the gap fills.
    server.ost.region_transfer_recv(
        entity(0), XFER_ID, 3, true, 7, b("c"), vec![int(3), int(0)],
    );
    server.ost.region_transfer_recv(
        entity(0), XFER_ID, 2, true, 6, b("b"), vec![int(2), int(0)],
    );
    assert!(server.data.get(region(), b"a").is_err());

    server.ost.region_transfer_recv(
        entity(0), XFER_ID, 1, true, 5, b("a"), vec![int(1), int(0)],
    );

    for (key, version) in [(b"a" as &[u8], 5), (b"b", 6), (b"c", 7)] {
        let (_, v) = server.data.get(region(), key).unwrap();
        assert_eq!(v, version);
    }

    // Each applied batch requests more data from the sender.
    let pumped = server.pump();
    let more = pumped
        .peer
        .iter()
        .filter(|(from, to, p)| {
            matches!(p, Payload::XferMore)
                && *from == EntityId::transfer(XFER_ID)
                && *to == entity(0)
        })
        .count();
    assert_eq!(more, 3);
}

#[test]
fn transfer_backs_off_when_live_pipeline_wins() {
    let server = TestServer::new(TRANSFER, host(3012));

    // The live pipeline committed k@4 while the transfer was running.
    server.ost.add_trigger(region(), b("k"), 4);

    // The transferred copy of exactly k@4 means the stream has caught
    // up with the pipeline: the transfer is complete.
    server.ost.region_transfer_recv(
        entity(0), XFER_ID, 1, true, 4, b("k"), vec![int(9), int(0)],
    );
    assert!(server.data.get(region(), b"k").is_err(), "no redundant write");

    // Once triggered, further data is ignored.
    server.ost.region_transfer_recv(
        entity(0), XFER_ID, 2, true, 1, b("other"), vec![int(1), int(0)],
    );
    assert!(server.data.get(region(), b"other").is_err());
}

#[test]
fn transfer_skips_keys_owned_by_live_writes() {
    let server = TestServer::new(TRANSFER, host(3012));

    // A different version of k is mid-chain: the pipeline owns the key.
    server.ost.add_trigger(region(), b("k"), 9);

    server.ost.region_transfer_recv(
        entity(0), XFER_ID, 1, true, 4, b("k"), vec![int(9), int(0)],
    );
    // k is skipped, but the stream continues.
    assert!(server.data.get(region(), b"k").is_err());

    server.ost.region_transfer_recv(
        entity(0), XFER_ID, 2, true, 1, b("other"), vec![int(1), int(0)],
    );
    let (_, version) = server.data.get(region(), b"other").unwrap();
    assert_eq!(version, 1);
}

#[test]
fn transfer_window_overflow_fails_the_transfer() {
    let server = TestServer::new(TRANSFER, host(3012));

    // Never send xfer_num 1: the window can only grow.
    for n in 2..1100u64 {
        server.ost.region_transfer_recv(
            entity(0), XFER_ID, n, true, n, b("k"), vec![int(1), int(0)],
        );
    }

    // The transfer failed; even the missing message is refused now.
    server.ost.region_transfer_recv(
        entity(0), XFER_ID, 1, true, 1, b("k"), vec![int(1), int(0)],
    );
    assert!(server.data.get(region(), b"k").is_err());
}

#[test]
fn outgoing_transfer_streams_snapshot_then_done() {
    // The outbound snapshot is taken when the transfer installs, so the
    // disk is seeded first.
    let server = TestServer::new_seeded(TRANSFER, host(2012), &[("a", 3, 1), ("b", 8, 2)]);

    let mut seen = Vec::new();
    for _ in 0..2 {
        server.ost.region_transfer_send(EntityId::transfer(XFER_ID), entity(0));
        let pumped = server.pump();
        for (_, _, p) in pumped.peer {
            if let Payload::XferData { xfer_num, version, key, has_value, .. } = p {
                assert!(has_value);
                seen.push((xfer_num, version, key));
            }
        }
    }
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].0, 1);
    assert_eq!(seen[1].0, 2);
    // Every seeded key went out with its committed version.
    let mut sent: Vec<(&[u8], u64)> =
        seen.iter().map(|(_, v, k)| (k.as_ref(), *v)).collect();
    sent.sort();
    assert_eq!(sent, vec![(b"a" as &[u8], 3), (b"b", 8)]);

    // Exhausted: the next request answers XFER_DONE.
    server.ost.region_transfer_send(EntityId::transfer(XFER_ID), entity(0));
    let pumped = server.pump();
    assert!(
        pumped.peer.iter().any(|(_, _, p)| matches!(p, Payload::XferDone)),
        "expected XFER_DONE"
    );
}

// ============================================================================
// Search scenarios
// ============================================================================

#[test]
fn search_streams_matches_then_done() {
    let server = TestServer::new(SINGLE, host(2012));
    server.put(1, "alice", vec![(1, int(30))]).expect_code(ReturnCode::Success);
    server.put(2, "bob", vec![(1, int(44))]).expect_code(ReturnCode::Success);

    let search = hyperdex_hashing::Search::new(3).with_term(0, b("alice"));
    server.searches.start(entity(0), client(), 7, 10, search);
    let pumped = server.pump();
    match &pumped.client[..] {
        [(_, Payload::RespSearchItem { nonce, key, value })] => {
            assert_eq!(*nonce, 10);
            assert_eq!(key.as_ref(), b"alice");
            assert_eq!(value[0], int(30));
        }
        other => panic!("unexpected responses: {other:?}"),
    }

    // Exhaustion sends DONE and destroys the state.
    server.searches.next(entity(0), client(), 7, 11);
    let pumped = server.pump();
    assert!(
        pumped.client.iter().any(|(_, p)| matches!(p, Payload::RespSearchDone { nonce } if *nonce == 11))
    );
    assert_eq!(server.searches.live_searches(), 0);
}

#[test]
fn search_stop_drops_state() {
    let server = TestServer::new(SINGLE, host(2012));
    server.put(1, "alice", vec![(1, int(30))]).expect_code(ReturnCode::Success);

    let search = hyperdex_hashing::Search::new(3).with_term(1, int(30));
    server.searches.start(entity(0), client(), 9, 1, search);
    server.pump();
    server.searches.stop(entity(0), client(), 9);
    assert_eq!(server.searches.live_searches(), 0);
}
