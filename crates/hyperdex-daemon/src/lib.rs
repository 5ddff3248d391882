//! # hyperdex-daemon: the HyperDex server
//!
//! One server hosts six collaborating components:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        hyperdexd                           │
//! │                                                            │
//! │  coordinator ──► daemon loop ──► reconfigure everything    │
//! │                                                            │
//! │  ┌──────────┐   ┌─────────┐   ┌─────────────────────────┐  │
//! │  │ Transport │ → │ Logical │ → │ NetworkWorker dispatch  │  │
//! │  └──────────┘   └─────────┘   └───────────┬─────────────┘  │
//! │                                           │                │
//! │        ┌──────────────┬───────────────────┼────────────┐   │
//! │        ▼              ▼                   ▼            ▼   │
//! │  ReplicationMgr  StateTransfers       Searches    DataLayer│
//! │        │              │                   │            │   │
//! │        └──────────────┴───────────────────┴────────────┘   │
//! │                              │                             │
//! │                        Disk per region                     │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! The replication manager is the core: per-key state machines order
//! every version of every key through the chain, with the transfer
//! subsystem feeding joining replicas and searches streaming snapshot
//! matches. All of it is plain threads — a worker pool blocking on the
//! transport, plus a handful of long-lived background threads.

pub mod coordinator;
pub mod daemon;
pub mod datalayer;
mod datatypes;
pub mod error;
pub mod logical;
pub mod net;
pub mod replication;
pub mod searches;
pub mod transfers;
pub mod worker;

pub use daemon::{DaemonOptions, run};
pub use error::{DaemonError, DaemonResult};
