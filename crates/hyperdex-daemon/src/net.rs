//! Framed point-to-point transport.
//!
//! Carries opaque length-prefixed messages between socket addresses. A
//! single mio event-loop thread owns every socket: the inbound listener,
//! accepted connections, and on-demand outbound connections (one per
//! peer, keyed by the peer's inbound address). Decoded frames and
//! connection lifecycle events land in a blocking delivery queue that
//! the network workers drain.
//!
//! The loopback constructor skips the sockets entirely; self-addressed
//! messages always go through [`Transport::deliver`], which is also how
//! the scenario tests pump the stack.
//!
//! Delivery can be paused during reconfiguration: workers block inside
//! [`Transport::recv`] while the tables above are swapped, without any
//! lock being held across the swap.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use crossbeam_queue::ArrayQueue;
use hyperdex_wire::Frame;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, info, warn};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CONN: usize = 2;

const COMMAND_QUEUE_CAPACITY: usize = 4096;

/// Outcome of a send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Queued to the event loop; delivery is asynchronous.
    Queued,
    /// The command queue is full.
    Busy,
    /// The transport has shut down.
    Shutdown,
}

/// Events surfaced to `recv`.
#[derive(Debug)]
pub enum NetEvent {
    /// A complete message arrived from `from`.
    Message { from: SocketAddr, msg: Bytes },
    /// An established connection dropped.
    Disconnect(SocketAddr),
    /// An outbound connection attempt failed.
    ConnectFail(SocketAddr),
}

enum Command {
    Send(SocketAddr, Bytes),
    Shutdown,
}

/// The blocking, pausable delivery queue.
struct Delivery {
    state: Mutex<DeliveryState>,
    cond: Condvar,
}

struct DeliveryState {
    queue: VecDeque<NetEvent>,
    paused: bool,
    shutdown: bool,
}

impl Delivery {
    fn new() -> Self {
        Self {
            state: Mutex::new(DeliveryState {
                queue: VecDeque::new(),
                paused: false,
                shutdown: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn push(&self, event: NetEvent) {
        let mut state = self.state.lock().expect("delivery lock");
        if state.shutdown {
            return;
        }
        state.queue.push_back(event);
        self.cond.notify_one();
    }

    fn pop(&self) -> Option<NetEvent> {
        let mut state = self.state.lock().expect("delivery lock");
        loop {
            if state.shutdown {
                return None;
            }
            if !state.paused {
                if let Some(event) = state.queue.pop_front() {
                    return Some(event);
                }
            }
            state = self.cond.wait(state).expect("delivery lock");
        }
    }

    fn try_pop(&self) -> Option<NetEvent> {
        let mut state = self.state.lock().expect("delivery lock");
        if state.shutdown || state.paused {
            return None;
        }
        state.queue.pop_front()
    }

    fn set_paused(&self, paused: bool) {
        let mut state = self.state.lock().expect("delivery lock");
        state.paused = paused;
        self.cond.notify_all();
    }

    fn shutdown(&self) {
        let mut state = self.state.lock().expect("delivery lock");
        state.shutdown = true;
        self.cond.notify_all();
    }
}

/// The point-to-point message transport.
pub struct Transport {
    delivery: Arc<Delivery>,
    commands: Option<Arc<ArrayQueue<Command>>>,
    waker: Option<Waker>,
    local_addr: Option<SocketAddr>,
    loop_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    /// Binds the inbound listener and starts the event-loop thread.
    pub fn bind(listen: SocketAddr) -> io::Result<Self> {
        let delivery = Arc::new(Delivery::new());
        let commands = Arc::new(ArrayQueue::new(COMMAND_QUEUE_CAPACITY));

        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER)?;
        let mut listener = TcpListener::bind(listen)?;
        let local_addr = listener.local_addr()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        let mut event_loop = EventLoop {
            poll,
            listener,
            conns: HashMap::new(),
            peers: HashMap::new(),
            next_token: FIRST_CONN,
            delivery: Arc::clone(&delivery),
            commands: Arc::clone(&commands),
        };
        let handle = thread::Builder::new()
            .name("net-loop".to_string())
            .spawn(move || event_loop.run())?;
        info!(%local_addr, "transport listening");

        Ok(Self {
            delivery,
            commands: Some(commands),
            waker: Some(waker),
            local_addr: Some(local_addr),
            loop_thread: Mutex::new(Some(handle)),
        })
    }

    /// An in-process transport with no sockets. Every send loops back
    /// into the local delivery queue, which is how the in-process test
    /// harness observes outbound traffic.
    pub fn loopback() -> Self {
        Self {
            delivery: Arc::new(Delivery::new()),
            commands: None,
            waker: None,
            local_addr: None,
            loop_thread: Mutex::new(None),
        }
    }

    /// The bound inbound address, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Queues a message to a peer's inbound address.
    pub fn send(&self, to: SocketAddr, msg: Bytes) -> ChannelStatus {
        let Some(commands) = &self.commands else {
            // Loopback: surface the message locally instead.
            self.delivery.push(NetEvent::Message { from: to, msg });
            return ChannelStatus::Queued;
        };
        if commands.push(Command::Send(to, msg)).is_err() {
            return ChannelStatus::Busy;
        }
        if let Some(waker) = &self.waker {
            if waker.wake().is_err() {
                return ChannelStatus::Shutdown;
            }
        }
        ChannelStatus::Queued
    }

    /// Loops a message back into the delivery queue, as if it had
    /// arrived from `from`.
    pub fn deliver(&self, from: SocketAddr, msg: Bytes) {
        self.delivery.push(NetEvent::Message { from, msg });
    }

    /// Blocks until an event arrives. `None` means the transport has
    /// shut down.
    pub fn recv(&self) -> Option<NetEvent> {
        self.delivery.pop()
    }

    /// Non-blocking receive; `None` when the queue is empty, paused, or
    /// shut down.
    pub fn try_recv(&self) -> Option<NetEvent> {
        self.delivery.try_pop()
    }

    /// Holds back delivery so the tables above can be swapped.
    pub fn pause(&self) {
        self.delivery.set_paused(true);
    }

    pub fn unpause(&self) {
        self.delivery.set_paused(false);
    }

    /// Stops the event loop and unblocks every receiver.
    pub fn shutdown(&self) {
        if let Some(commands) = &self.commands {
            let _ = commands.push(Command::Shutdown);
            if let Some(waker) = &self.waker {
                let _ = waker.wake();
            }
        }
        self.delivery.shutdown();
        if let Some(handle) = self.loop_thread.lock().expect("loop thread lock").take() {
            let _ = handle.join();
        }
    }
}

// ============================================================================
// Event loop
// ============================================================================

struct Conn {
    stream: TcpStream,
    /// Peer key: the address this connection is identified by in events.
    peer: SocketAddr,
    read_buf: BytesMut,
    write_buf: BytesMut,
    /// Outbound connection still completing its nonblocking connect.
    connecting: bool,
}

impl Conn {
    fn interest(&self) -> Interest {
        if self.connecting || !self.write_buf.is_empty() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }
}

/// Why a connection is being torn down.
enum Teardown {
    ConnectFail,
    Disconnect,
    Silent,
}

struct EventLoop {
    poll: Poll,
    listener: TcpListener,
    conns: HashMap<Token, Conn>,
    /// Outbound peer address -> connection token.
    peers: HashMap<SocketAddr, Token>,
    next_token: usize,
    delivery: Arc<Delivery>,
    commands: Arc<ArrayQueue<Command>>,
}

impl EventLoop {
    fn run(&mut self) {
        let mut events = Events::with_capacity(256);

        loop {
            if let Err(e) = self.poll.poll(&mut events, Some(Duration::from_millis(500))) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!(error = %e, "transport poll failed");
                break;
            }

            let mut tokens = Vec::new();
            let mut accept = false;
            for event in &events {
                match event.token() {
                    LISTENER => accept = true,
                    WAKER => {}
                    token => tokens.push((token, event.is_readable(), event.is_writable())),
                }
            }

            if accept {
                self.accept_all();
            }
            for (token, readable, writable) in tokens {
                self.handle_conn_event(token, readable, writable);
            }

            // Waker fired or timeout: drain queued commands either way.
            while let Some(cmd) = self.commands.pop() {
                match cmd {
                    Command::Send(to, msg) => self.queue_send(to, msg),
                    Command::Shutdown => {
                        debug!("transport event loop stopping");
                        return;
                    }
                }
            }
        }
    }

    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(e) =
                        self.poll.registry().register(&mut stream, token, Interest::READABLE)
                    {
                        warn!(error = %e, "could not register accepted connection");
                        continue;
                    }
                    debug!(%peer, "accepted connection");
                    self.conns.insert(
                        token,
                        Conn {
                            stream,
                            peer,
                            read_buf: BytesMut::with_capacity(8192),
                            write_buf: BytesMut::new(),
                            connecting: false,
                        },
                    );
                    // Replies to this peer reuse the same connection.
                    self.peers.insert(peer, token);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn queue_send(&mut self, to: SocketAddr, msg: Bytes) {
        let token = match self.peers.get(&to) {
            Some(&token) => token,
            None => match self.connect(to) {
                Some(token) => token,
                None => {
                    self.delivery.push(NetEvent::ConnectFail(to));
                    return;
                }
            },
        };

        let connecting = {
            let conn = self.conns.get_mut(&token).expect("peer map is consistent");
            Frame::new(msg).encode(&mut conn.write_buf);
            conn.connecting
        };

        if connecting {
            self.update_interest(token);
        } else {
            self.flush_conn(token);
        }
    }

    fn connect(&mut self, to: SocketAddr) -> Option<Token> {
        let mut stream = match TcpStream::connect(to) {
            Ok(stream) => stream,
            Err(e) => {
                debug!(peer = %to, error = %e, "connect failed");
                return None;
            }
        };
        let token = Token(self.next_token);
        self.next_token += 1;
        if self
            .poll
            .registry()
            .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)
            .is_err()
        {
            return None;
        }
        self.conns.insert(
            token,
            Conn {
                stream,
                peer: to,
                read_buf: BytesMut::with_capacity(8192),
                write_buf: BytesMut::new(),
                connecting: true,
            },
        );
        self.peers.insert(to, token);
        Some(token)
    }

    fn handle_conn_event(&mut self, token: Token, readable: bool, writable: bool) {
        if !self.conns.contains_key(&token) {
            return;
        }

        if writable && !self.finish_connect(token) {
            return;
        }
        if readable && !self.read_conn(token) {
            return;
        }
        if writable {
            self.flush_conn(token);
        }
    }

    /// Completes a pending nonblocking connect. Returns false if the
    /// connection was torn down.
    fn finish_connect(&mut self, token: Token) -> bool {
        let ok = {
            let Some(conn) = self.conns.get_mut(&token) else {
                return false;
            };
            if !conn.connecting {
                return true;
            }
            match conn.stream.take_error() {
                Ok(None) if conn.stream.peer_addr().is_ok() => {
                    conn.connecting = false;
                    debug!(peer = %conn.peer, "outbound connection established");
                    true
                }
                _ => false,
            }
        };

        if !ok {
            self.teardown(token, Teardown::ConnectFail);
        }
        ok
    }

    /// Reads what's available and surfaces complete frames. Returns
    /// false if the connection was dropped.
    fn read_conn(&mut self, token: Token) -> bool {
        let mut temp = [0u8; 4096];
        let mut frames = Vec::new();
        let mut teardown = None;
        let peer;

        {
            let Some(conn) = self.conns.get_mut(&token) else {
                return false;
            };
            peer = conn.peer;

            loop {
                match conn.stream.read(&mut temp) {
                    Ok(0) => {
                        teardown = Some(if conn.connecting {
                            Teardown::Silent
                        } else {
                            Teardown::Disconnect
                        });
                        break;
                    }
                    Ok(n) => conn.read_buf.extend_from_slice(&temp[..n]),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!(%peer, error = %e, "read failed");
                        teardown = Some(Teardown::Disconnect);
                        break;
                    }
                }
            }

            loop {
                match Frame::decode(&mut conn.read_buf) {
                    Ok(Some(frame)) => frames.push(frame.payload),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(%peer, error = %e, "corrupt frame; dropping connection");
                        teardown = Some(Teardown::Disconnect);
                        break;
                    }
                }
            }
        }

        for msg in frames {
            self.delivery.push(NetEvent::Message { from: peer, msg });
        }

        match teardown {
            Some(reason) => {
                self.teardown(token, reason);
                false
            }
            None => true,
        }
    }

    fn flush_conn(&mut self, token: Token) {
        let mut teardown = false;
        {
            let Some(conn) = self.conns.get_mut(&token) else {
                return;
            };
            while !conn.write_buf.is_empty() {
                match conn.stream.write(&conn.write_buf) {
                    Ok(0) => {
                        teardown = true;
                        break;
                    }
                    Ok(n) => {
                        let _ = conn.write_buf.split_to(n);
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!(peer = %conn.peer, error = %e, "write failed");
                        teardown = true;
                        break;
                    }
                }
            }
        }

        if teardown {
            self.teardown(token, Teardown::Disconnect);
        } else {
            self.update_interest(token);
        }
    }

    fn update_interest(&mut self, token: Token) {
        if let Some(conn) = self.conns.get_mut(&token) {
            let interest = conn.interest();
            let _ = self.poll.registry().reregister(&mut conn.stream, token, interest);
        }
    }

    fn teardown(&mut self, token: Token, reason: Teardown) {
        if let Some(mut conn) = self.conns.remove(&token) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            self.peers.retain(|_, &mut t| t != token);
            match reason {
                Teardown::ConnectFail => self.delivery.push(NetEvent::ConnectFail(conn.peer)),
                Teardown::Disconnect => self.delivery.push(NetEvent::Disconnect(conn.peer)),
                Teardown::Silent => {}
            }
        }
    }
}
