//! The `hyperdexd` binary.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::Context;
use clap::Parser;
use hyperdex_daemon::{DaemonOptions, daemon};
use tracing_subscriber::EnvFilter;

/// A HyperDex storage server.
#[derive(Parser)]
#[command(name = "hyperdexd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Run in the background.
    #[arg(long, conflicts_with = "foreground")]
    daemonize: bool,

    /// Run in the foreground (the default).
    #[arg(long)]
    foreground: bool,

    /// Data directory.
    #[arg(long, default_value = "data")]
    data: PathBuf,

    /// Coordinator address.
    #[arg(long, default_value = "127.0.0.1:1234")]
    coordinator: SocketAddr,

    /// Number of network worker threads.
    #[arg(long, default_value_t = 16)]
    threads: usize,

    /// Local address to bind.
    #[arg(long, default_value = "127.0.0.1")]
    listen: IpAddr,

    /// Inbound port.
    #[arg(long, default_value_t = 2012)]
    incoming: u16,

    /// Outbound port.
    #[arg(long, default_value_t = 2013)]
    outgoing: u16,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    std::fs::create_dir_all(&args.data)
        .with_context(|| format!("could not create data directory {}", args.data.display()))?;

    if args.daemonize {
        daemonize::Daemonize::new()
            .working_directory(&args.data)
            .start()
            .context("could not daemonize")?;
    }

    let exit = Arc::new(AtomicBool::new(false));
    install_signal_handlers(&exit).context("could not set signal handlers")?;

    let opts = DaemonOptions {
        data_dir: args.data,
        coordinator: args.coordinator,
        threads: args.threads.max(1),
        listen: args.listen,
        incoming_port: args.incoming,
        outgoing_port: args.outgoing,
    };

    daemon::run(&opts, &exit).context("daemon failed")?;
    Ok(())
}

#[cfg(unix)]
fn install_signal_handlers(exit: &Arc<AtomicBool>) -> std::io::Result<()> {
    use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
    for sig in [SIGHUP, SIGINT, SIGTERM] {
        signal_hook::flag::register(sig, Arc::clone(exit))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn install_signal_handlers(_exit: &Arc<AtomicBool>) -> std::io::Result<()> {
    Ok(())
}
