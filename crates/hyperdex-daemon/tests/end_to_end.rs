//! End-to-end test: a real daemon over TCP, configured by a fake
//! coordinator, serving a wire-protocol client.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use hyperdex_daemon::{DaemonOptions, daemon};
use hyperdex_types::{EntityId, MessageType, RegionId, ReturnCode, SpaceId};
use hyperdex_wire::{Frame, MessageHeader, Payload};

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

fn leader() -> EntityId {
    EntityId::in_region(RegionId::new(SpaceId(9), 0, 0, 0), 0)
}

/// Accepts the daemon, reads its announce, serves one configuration,
/// and signals once the daemon ACKs it.
fn fake_coordinator(
    listener: TcpListener,
    config: String,
    acked: mpsc::Sender<()>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let Ok((sock, _)) = listener.accept() else { return };
        let mut reader = BufReader::new(sock.try_clone().unwrap());

        let mut announce = String::new();
        let _ = reader.read_line(&mut announce);
        assert!(announce.starts_with("instance\t"), "bad announce: {announce:?}");

        let mut sock = sock;
        sock.write_all(config.as_bytes()).unwrap();
        sock.write_all(b"end\tof\tline\n").unwrap();

        let mut line = String::new();
        while reader.read_line(&mut line).unwrap_or(0) > 0 {
            if line.trim_end() == "ACK" {
                let _ = acked.send(());
            }
            line.clear();
        }
    })
}

/// A minimal wire-protocol client over one TCP connection.
struct Client {
    sock: TcpStream,
    buf: BytesMut,
}

impl Client {
    fn connect(addr: SocketAddr) -> Self {
        let sock = TcpStream::connect(addr).unwrap();
        sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        sock.set_nodelay(true).unwrap();
        Self { sock, buf: BytesMut::new() }
    }

    fn send(&mut self, payload: &Payload) {
        let header = MessageHeader {
            msg_type: payload.message_type(),
            src_out_epoch: 1,
            dst_in_epoch: 1,
            from: EntityId::client(0),
            to: leader(),
        };
        let mut msg = BytesMut::new();
        header.encode_into(&mut msg);
        payload.encode_into(&mut msg);

        let mut framed = BytesMut::new();
        Frame::new(msg.freeze()).encode(&mut framed);
        self.sock.write_all(&framed).unwrap();
    }

    fn recv(&mut self) -> (MessageType, Payload) {
        loop {
            if let Some(frame) = Frame::decode(&mut self.buf).unwrap() {
                let mut buf: Bytes = frame.payload;
                let header = MessageHeader::decode(&mut buf).unwrap();
                let payload = Payload::decode(header.msg_type, &mut buf).unwrap();
                return (header.msg_type, payload);
            }
            let mut chunk = [0u8; 4096];
            let n = self.sock.read(&mut chunk).expect("server reply");
            assert!(n > 0, "server closed the connection");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

#[test]
fn put_then_get_over_the_wire() {
    let incoming = free_port();
    let outgoing = free_port();

    let coord_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let coord_addr = coord_listener.local_addr().unwrap();

    let config = format!(
        "version 1\n\
         host 1 127.0.0.1 {incoming} 1 {outgoing} 1\n\
         space 9 users name string age int64\n\
         subspace 9 0 true true false false\n\
         region 9 0 0 0 1\n"
    );
    let (acked_tx, acked_rx) = mpsc::channel();
    let coordinator = fake_coordinator(coord_listener, config, acked_tx);

    let tmp = tempfile::tempdir().unwrap();
    let opts = DaemonOptions {
        data_dir: tmp.path().to_path_buf(),
        coordinator: coord_addr,
        threads: 2,
        listen: "127.0.0.1".parse().unwrap(),
        incoming_port: incoming,
        outgoing_port: outgoing,
    };
    let exit = Arc::new(AtomicBool::new(false));
    let daemon_exit = Arc::clone(&exit);
    let server = thread::spawn(move || daemon::run(&opts, &daemon_exit));

    // Wait until the daemon has applied the configuration.
    acked_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("daemon never acknowledged the configuration");

    let mut client = Client::connect(SocketAddr::new("127.0.0.1".parse().unwrap(), incoming));

    client.send(&Payload::ReqPut {
        nonce: 7,
        key: Bytes::from_static(b"alice"),
        attrs: vec![(1, Bytes::copy_from_slice(&30i64.to_le_bytes()))],
    });
    match client.recv() {
        (MessageType::RespPut, Payload::RespPut { nonce, code }) => {
            assert_eq!(nonce, 7);
            assert_eq!(code, ReturnCode::Success.as_u16());
        }
        other => panic!("unexpected response: {other:?}"),
    }

    client.send(&Payload::ReqGet { nonce: 8, key: Bytes::from_static(b"alice") });
    match client.recv() {
        (MessageType::RespGet, Payload::RespGet { nonce, code, value }) => {
            assert_eq!(nonce, 8);
            assert_eq!(code, ReturnCode::Success.as_u16());
            assert_eq!(value[0].as_ref(), &30i64.to_le_bytes());
        }
        other => panic!("unexpected response: {other:?}"),
    }

    // Deleting and re-reading round-trips the NOTFOUND path.
    client.send(&Payload::ReqDel { nonce: 9, key: Bytes::from_static(b"alice") });
    match client.recv() {
        (MessageType::RespDel, Payload::RespDel { code, .. }) => {
            assert_eq!(code, ReturnCode::Success.as_u16());
        }
        other => panic!("unexpected response: {other:?}"),
    }
    client.send(&Payload::ReqGet { nonce: 10, key: Bytes::from_static(b"alice") });
    match client.recv() {
        (MessageType::RespGet, Payload::RespGet { code, .. }) => {
            assert_eq!(code, ReturnCode::NotFound.as_u16());
        }
        other => panic!("unexpected response: {other:?}"),
    }

    exit.store(true, Ordering::SeqCst);
    server.join().unwrap().unwrap();
    drop(coordinator);
}
