//! Daemon assembly and main loop.
//!
//! Wires the components together, connects to the coordinator, spawns
//! the worker pool, and then alternates between pumping the coordinator
//! link and applying configurations. A configuration is applied in three
//! phases: `prepare` on every component (network still live), a paused
//! critical section running `reconfigure` under the shared periodic
//! mutex, and `cleanup` (network live again) followed by `ACK`.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use hyperdex_types::Instance;
use tracing::{error, info};

use crate::coordinator::{CoordStatus, CoordinatorLink};
use crate::datalayer::DataLayer;
use crate::error::{DaemonError, DaemonResult};
use crate::logical::Logical;
use crate::net::Transport;
use crate::replication::ReplicationManager;
use crate::searches::Searches;
use crate::transfers::StateTransfers;
use crate::worker::NetworkWorker;

const COORDINATOR_RETRY: Duration = Duration::from_secs(1);
const PUMP_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything the daemon needs to run.
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub data_dir: PathBuf,
    pub coordinator: SocketAddr,
    pub threads: usize,
    pub listen: IpAddr,
    pub incoming_port: u16,
    pub outgoing_port: u16,
}

/// Runs the daemon until a shutdown directive or signal.
pub fn run(opts: &DaemonOptions, exit: &Arc<AtomicBool>) -> DaemonResult<()> {
    let token: [u8; 16] = rand::random();
    let announce = format!(
        "instance\t{}\t{}\t{}\t{}\t{}",
        opts.listen,
        opts.incoming_port,
        opts.outgoing_port,
        std::process::id(),
        hex(&token),
    );

    let cl = Arc::new(CoordinatorLink::new(opts.coordinator));
    cl.set_announce(announce);

    let data = DataLayer::new(&opts.data_dir)?;

    let listen = SocketAddr::new(opts.listen, opts.incoming_port);
    let transport = Transport::bind(listen)
        .map_err(|source| DaemonError::BindFailed { addr: listen, source })?;
    let us = Instance::new(opts.listen, opts.incoming_port, 0, opts.outgoing_port, 0);
    let comm = Arc::new(Logical::new(Arc::clone(&cl), transport, us));

    let periodic_mutex = Arc::new(Mutex::new(()));
    let searches = Searches::new(Arc::clone(&data), Arc::clone(&comm));
    let ost = StateTransfers::new(
        Arc::clone(&data),
        Arc::clone(&comm),
        Arc::clone(&cl),
        Arc::clone(&periodic_mutex),
    );
    let repl = ReplicationManager::new(
        Arc::clone(&cl),
        Arc::clone(&data),
        Arc::clone(&comm),
        Arc::clone(&ost),
        Arc::clone(&periodic_mutex),
    );
    ost.set_replication_manager(&repl);

    data.start();
    ost.start();
    repl.start();

    info!("connecting to the coordinator");
    while !exit.load(Ordering::SeqCst) && cl.connect() != CoordStatus::Success {
        info!("coordinator connection failed; retrying");
        thread::sleep(COORDINATOR_RETRY);
    }

    info!(threads = opts.threads, "starting network workers");
    let worker = Arc::new(NetworkWorker::new(
        Arc::clone(&data),
        Arc::clone(&comm),
        Arc::clone(&searches),
        Arc::clone(&ost),
        Arc::clone(&repl),
    ));
    let mut worker_threads = Vec::with_capacity(opts.threads);
    for i in 0..opts.threads {
        let worker = Arc::clone(&worker);
        worker_threads.push(
            thread::Builder::new()
                .name(format!("net-worker-{i}"))
                .spawn(move || worker.run())?,
        );
    }

    while !exit.load(Ordering::SeqCst) {
        if cl.unacknowledged() {
            let config = cl.config();
            info!(version = config.version(), "installing new configuration");

            let mut newinst = comm.inst();
            config.instance_epochs(&mut newinst);
            if newinst.inbound_epoch == 0 || newinst.outbound_epoch == 0 {
                error!("we've been configured to a dummy node");
            }

            // Prepare while the network threads run at full force.
            comm.prepare(&config, newinst);
            data.prepare(&config, newinst);
            repl.prepare(&config, newinst);
            ost.prepare(&config, newinst);
            searches.prepare(&config, newinst);

            info!("pausing communication for reconfiguration");
            comm.pause();
            {
                // The critical section: mutually exclusive with the
                // periodic threads and with worker dispatch.
                let _periodic = periodic_mutex.lock().expect("periodic mutex");
                comm.reconfigure(&config, newinst);
                data.reconfigure(&config, comm.inst());
                repl.reconfigure(&config, comm.inst());
                ost.reconfigure(&config, comm.inst());
                searches.reconfigure(&config, comm.inst());
            }
            comm.unpause();
            info!("reconfiguration complete; unpausing communication");

            // Cleanup, again with the network live.
            ost.cleanup(&config, comm.inst());
            repl.cleanup(&config, comm.inst());
            data.cleanup(&config, comm.inst());
            searches.cleanup(&config, comm.inst());
            comm.cleanup(&config, comm.inst());
            cl.acknowledge();

            if config.shutdown() {
                info!("configuration orders a shutdown");
                break;
            }
        }

        match cl.pump(PUMP_TIMEOUT) {
            CoordStatus::Success => {}
            CoordStatus::Shutdown => break,
            CoordStatus::ConnectFail | CoordStatus::Disconnect => {
                thread::sleep(COORDINATOR_RETRY);
                if cl.connect() != CoordStatus::Success {
                    error!("coordinator connection failed");
                }
            }
        }
    }

    info!("exiting daemon");
    repl.shutdown();
    comm.shutdown();
    worker.shutdown();
    ost.shutdown();
    cl.shutdown();
    data.shutdown();

    for handle in worker_threads {
        let _ = handle.join();
    }

    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
