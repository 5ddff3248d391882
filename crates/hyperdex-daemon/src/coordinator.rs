//! Line-oriented link to the coordinator.
//!
//! The server announces itself after connecting, then reads directives
//! line by line. Lines accumulate until the `end\tof\tline` sentinel,
//! at which point the whole batch is parsed as one configuration: a good
//! parse installs it (to be `ACK`ed once applied), a bad parse sends
//! `BAD` and keeps the previous configuration.
//!
//! Server → coordinator lines:
//!
//! ```text
//! instance\t<ip>\t<in_port>\t<out_port>\t<pid>\t<16-random-bytes-hex>
//! ACK
//! BAD
//! fail_location\t<ip>:<port>
//! fail_transfer\t<xfer_id>
//! transfer_golive\t<xfer_id>
//! transfer_complete\t<xfer_id>
//! quiesced\t<state_id>
//! ```

use std::collections::{HashMap, HashSet};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hyperdex_config::Configuration;
use tracing::{info, warn};

/// How many connect warnings a peer gets before it is reported failed.
const WARN_THRESHOLD: u64 = 5;

/// The sentinel terminating one configuration update.
const END_OF_LINE: &str = "end\tof\tline";

/// Outcome of link operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordStatus {
    Success,
    ConnectFail,
    Disconnect,
    Shutdown,
}

struct LinkState {
    announce: String,
    sock: Option<TcpStream>,
    /// Raw bytes read but not yet terminated by a newline.
    buffer: Vec<u8>,
    /// Directive lines accumulated since the last sentinel.
    pending: String,
    config: Arc<Configuration>,
    acknowledged: bool,
    shutdown: bool,
    reported_failures: HashSet<SocketAddr>,
    warnings_issued: HashMap<SocketAddr, u64>,
}

/// The coordinator connection.
pub struct CoordinatorLink {
    coordinator: SocketAddr,
    state: Mutex<LinkState>,
}

impl CoordinatorLink {
    pub fn new(coordinator: SocketAddr) -> Self {
        Self {
            coordinator,
            state: Mutex::new(LinkState {
                announce: String::new(),
                sock: None,
                buffer: Vec::new(),
                pending: String::new(),
                config: Arc::new(Configuration::default()),
                acknowledged: true,
                shutdown: false,
                reported_failures: HashSet::new(),
                warnings_issued: HashMap::new(),
            }),
        }
    }

    /// Sets the announce line sent on every (re)connect.
    pub fn set_announce(&self, announce: String) {
        let mut state = self.state.lock().expect("coordinator lock");
        state.announce = announce;
    }

    /// True while an installed-but-unapplied configuration is pending.
    pub fn unacknowledged(&self) -> bool {
        let state = self.state.lock().expect("coordinator lock");
        !state.acknowledged
    }

    /// The most recently received configuration.
    pub fn config(&self) -> Arc<Configuration> {
        let state = self.state.lock().expect("coordinator lock");
        Arc::clone(&state.config)
    }

    /// Connects and announces. A no-op when already connected.
    pub fn connect(&self) -> CoordStatus {
        let mut state = self.state.lock().expect("coordinator lock");
        if state.shutdown {
            return CoordStatus::Shutdown;
        }
        if state.sock.is_some() {
            return CoordStatus::Success;
        }

        let sock = match TcpStream::connect_timeout(&self.coordinator, Duration::from_secs(1)) {
            Ok(sock) => sock,
            Err(_) => return CoordStatus::ConnectFail,
        };
        if sock.set_nodelay(true).is_err() {
            return CoordStatus::ConnectFail;
        }
        state.sock = Some(sock);
        state.buffer.clear();
        state.pending.clear();

        let announce = format!("{}\n", state.announce);
        match send_locked(&mut state, announce.as_bytes()) {
            CoordStatus::Success => {
                info!(coordinator = %self.coordinator, "connected to coordinator");
                CoordStatus::Success
            }
            other => other,
        }
    }

    pub fn connected(&self) -> bool {
        self.state.lock().expect("coordinator lock").sock.is_some()
    }

    /// Reads from the coordinator for up to `timeout`, installing a new
    /// configuration when a complete update arrives.
    pub fn pump(&self, timeout: Duration) -> CoordStatus {
        let mut state = self.state.lock().expect("coordinator lock");
        if state.shutdown {
            return CoordStatus::Shutdown;
        }
        let Some(sock) = &state.sock else {
            return CoordStatus::ConnectFail;
        };

        if sock.set_read_timeout(Some(timeout)).is_err() {
            reset(&mut state);
            return CoordStatus::Disconnect;
        }

        let mut chunk = [0u8; 2048];
        let n = {
            let sock = state.sock.as_mut().expect("socket checked above");
            match sock.read(&mut chunk) {
                Ok(0) => {
                    reset(&mut state);
                    return CoordStatus::Disconnect;
                }
                Ok(n) => n,
                Err(ref e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    return CoordStatus::Success;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return CoordStatus::Success,
                Err(_) => {
                    reset(&mut state);
                    return CoordStatus::Disconnect;
                }
            }
        };
        state.buffer.extend_from_slice(&chunk[..n]);

        while let Some(idx) = state.buffer.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = state.buffer.drain(..=idx).collect();
            let line = String::from_utf8_lossy(&line_bytes[..line_bytes.len() - 1]).into_owned();

            if line == END_OF_LINE {
                let text = std::mem::take(&mut state.pending);
                match hyperdex_config::parse(&text) {
                    Ok(config) if config.version() >= state.config.version() => {
                        info!(version = config.version(), "received configuration");
                        state.config = Arc::new(config);
                        state.acknowledged = false;
                    }
                    Ok(stale) => {
                        warn!(
                            version = stale.version(),
                            current = state.config.version(),
                            "ignoring stale configuration"
                        );
                    }
                    Err(e) => {
                        warn!(error = %e, "configuration failed to parse; sending BAD");
                        let status = send_locked(&mut state, b"BAD\n");
                        if status != CoordStatus::Success {
                            return status;
                        }
                    }
                }
            } else {
                state.pending.push_str(&line);
                state.pending.push('\n');
            }
        }

        CoordStatus::Success
    }

    /// Acknowledges the pending configuration after it has been applied.
    pub fn acknowledge(&self) -> CoordStatus {
        let mut state = self.state.lock().expect("coordinator lock");
        if state.shutdown {
            return CoordStatus::Shutdown;
        }
        let status = send_locked(&mut state, b"ACK\n");
        if status == CoordStatus::Success {
            state.acknowledged = true;
            state.reported_failures.clear();
            state.warnings_issued.clear();
        }
        status
    }

    /// Notes a connect failure to `loc`; reports the location failed
    /// once the warning threshold is crossed.
    pub fn warn_location(&self, loc: SocketAddr) -> CoordStatus {
        let mut state = self.state.lock().expect("coordinator lock");
        let warnings = state.warnings_issued.entry(loc).or_insert(0);
        *warnings += 1;
        if *warnings > WARN_THRESHOLD {
            return send_failure(&mut state, loc);
        }
        CoordStatus::Success
    }

    /// Reports an established-then-dropped peer immediately.
    pub fn fail_location(&self, loc: SocketAddr) -> CoordStatus {
        let mut state = self.state.lock().expect("coordinator lock");
        send_failure(&mut state, loc)
    }

    /// Gives up on a transfer.
    pub fn fail_transfer(&self, xfer_id: u16) -> CoordStatus {
        self.send_line(&format!("fail_transfer\t{xfer_id}"))
    }

    /// Asks the coordinator to fold a caught-up transfer into the chain.
    pub fn transfer_golive(&self, xfer_id: u16) -> CoordStatus {
        self.send_line(&format!("transfer_golive\t{xfer_id}"))
    }

    /// Reports that the live pipeline overtook the transfer stream.
    pub fn transfer_complete(&self, xfer_id: u16) -> CoordStatus {
        self.send_line(&format!("transfer_complete\t{xfer_id}"))
    }

    /// Reports that all replication state has drained under a quiesce.
    pub fn quiesced(&self, state_id: &str) -> CoordStatus {
        self.send_line(&format!("quiesced\t{state_id}"))
    }

    pub fn shutdown(&self) {
        let mut state = self.state.lock().expect("coordinator lock");
        state.shutdown = true;
        state.sock = None;
    }

    fn send_line(&self, line: &str) -> CoordStatus {
        let mut state = self.state.lock().expect("coordinator lock");
        if state.shutdown {
            return CoordStatus::Shutdown;
        }
        send_locked(&mut state, format!("{line}\n").as_bytes())
    }
}

fn send_failure(state: &mut LinkState, loc: SocketAddr) -> CoordStatus {
    if state.shutdown {
        return CoordStatus::Shutdown;
    }
    if state.reported_failures.contains(&loc) {
        return CoordStatus::Success;
    }
    let line = format!("fail_location\t{}:{}\n", loc.ip(), loc.port());
    let status = send_locked(state, line.as_bytes());
    if status == CoordStatus::Success {
        state.reported_failures.insert(loc);
    }
    status
}

fn send_locked(state: &mut LinkState, bytes: &[u8]) -> CoordStatus {
    let Some(sock) = state.sock.as_mut() else {
        return CoordStatus::ConnectFail;
    };
    match sock.write_all(bytes) {
        Ok(()) => CoordStatus::Success,
        Err(_) => {
            reset(state);
            CoordStatus::Disconnect
        }
    }
}

fn reset(state: &mut LinkState) {
    state.sock = None;
    state.buffer.clear();
    state.pending.clear();
}
