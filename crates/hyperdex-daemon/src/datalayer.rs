//! The datalayer: one disk per assigned region, background I/O, and the
//! durable state file.
//!
//! Owns a [`Disk`] for every region this server serves or is receiving
//! by transfer. Routes reads and writes to the right disk, schedules
//! background flushing and preallocation, and persists
//! `(instance, configuration)` across a quiesce so a restart reopens the
//! same disks under the recorded state id.
//!
//! Background threads: a small flush pool drains each disk's write
//! queue; one optimistic-I/O thread rate-limits preallocation and
//! early segment rotation, and only runs when the flush pool recently
//! made progress (no point optimizing an idle server).

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use hyperdex_config::Configuration;
use hyperdex_disk::{Disk, DiskError, DiskResult, IoProgress, RollingSnapshot, Snapshot};
use hyperdex_hashing::SearchCoordinate;
use hyperdex_types::{Instance, RegionId};
use tracing::{error, info, warn};

/// The durable state file, rewritten atomically on quiesce.
pub const STATE_FILE_NAME: &str = "datalayer_state.hd";
const STATE_FILE_VERSION: i32 = 1;

const FLUSH_THREADS: usize = 2;
const FLUSH_BATCH: usize = 10_000;
const PREALLOCATIONS_PER_SECOND: u64 = 8;
const OPTIMISM_BURSTS_PER_SECOND: u64 = 4;

/// Region→disk routing and background I/O scheduling.
pub struct DataLayer {
    base: PathBuf,
    disks: RwLock<HashMap<RegionId, Arc<Disk>>>,
    shutdown: AtomicBool,
    flushed_recently: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl DataLayer {
    /// Creates the datalayer, restoring quiesced disks from the state
    /// file if one is present.
    pub fn new(base: &Path) -> std::io::Result<Arc<Self>> {
        fs::create_dir_all(base)?;
        let layer = Arc::new(Self {
            base: base.to_path_buf(),
            disks: RwLock::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
            flushed_recently: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
        });
        layer.load_state();
        Ok(layer)
    }

    /// Spawns the flush pool and the optimistic-I/O thread.
    pub fn start(self: &Arc<Self>) {
        let mut threads = self.threads.lock().expect("datalayer threads lock");
        for i in 0..FLUSH_THREADS {
            let layer = Arc::clone(self);
            threads.push(
                thread::Builder::new()
                    .name(format!("data-flush-{i}"))
                    .spawn(move || layer.flush_thread())
                    .expect("spawn flush thread"),
            );
        }
        let layer = Arc::clone(self);
        threads.push(
            thread::Builder::new()
                .name("data-optimistic".to_string())
                .spawn(move || layer.optimistic_io_thread())
                .expect("spawn optimistic thread"),
        );
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let mut threads = self.threads.lock().expect("datalayer threads lock");
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }

    // ------------------------------------------------------------------
    // Reconfiguration
    // ------------------------------------------------------------------

    /// Ensures a disk exists for every region assigned to `us`,
    /// including regions in transfer to us. Creation failures mark the
    /// region failed but never abort the process.
    pub fn prepare(&self, config: &Configuration, us: Instance) {
        let mut needed = config.regions_for(us);
        needed.extend(config.transfers_to(us).values());

        for region in needed {
            if self.disks.read().expect("disks lock").contains_key(&region) {
                continue;
            }
            let Some(hasher) = config.disk_hasher(region.subspace_id()) else {
                error!(%region, "no disk hasher for region's subspace");
                continue;
            };
            let arity = config.dimensions(region.space);
            match Disk::create(&self.region_dir(region), hasher, arity) {
                Ok(disk) => {
                    info!(%region, arity, "created disk");
                    self.disks
                        .write()
                        .expect("disks lock")
                        .insert(region, Arc::new(disk));
                }
                Err(e) => {
                    // The region is failed; the server carries on.
                    error!(%region, error = %e, "could not create disk");
                }
            }
        }
    }

    /// On a quiesce configuration, fences every owned disk under the
    /// state id and persists the state file.
    pub fn reconfigure(&self, config: &Configuration, us: Instance) {
        let Some(state_id) = config.quiesce_state_id() else {
            return;
        };

        let disks: Vec<(RegionId, Arc<Disk>)> = self
            .disks
            .read()
            .expect("disks lock")
            .iter()
            .map(|(&r, d)| (r, Arc::clone(d)))
            .collect();
        for (region, disk) in disks {
            if let Err(e) = disk.quiesce(state_id) {
                error!(%region, error = %e, "could not quiesce disk");
            }
        }

        if !self.dump_state(config, us) {
            error!("could not save datalayer state");
        }
    }

    /// Drops any disk whose region is neither assigned nor in-transfer
    /// under the new configuration.
    pub fn cleanup(&self, config: &Configuration, us: Instance) {
        let mut needed = config.regions_for(us);
        needed.extend(config.transfers_to(us).values());

        let doomed: Vec<(RegionId, Arc<Disk>)> = self
            .disks
            .read()
            .expect("disks lock")
            .iter()
            .filter(|(r, _)| !needed.contains(r))
            .map(|(&r, d)| (r, Arc::clone(d)))
            .collect();

        for (region, disk) in doomed {
            info!(%region, "dropping disk");
            if let Err(e) = disk.destroy() {
                error!(%region, error = %e, "could not drop disk");
            }
            self.disks.write().expect("disks lock").remove(&region);
        }
    }

    // ------------------------------------------------------------------
    // Data path
    // ------------------------------------------------------------------

    fn disk(&self, region: RegionId) -> DiskResult<Arc<Disk>> {
        self.disks
            .read()
            .expect("disks lock")
            .get(&region)
            .cloned()
            .ok_or(DiskError::MissingDisk)
    }

    pub fn get(&self, region: RegionId, key: &[u8]) -> DiskResult<(Vec<Bytes>, u64)> {
        self.disk(region)?.get(key)
    }

    pub fn put(
        &self,
        region: RegionId,
        key: Bytes,
        value: Vec<Bytes>,
        version: u64,
    ) -> DiskResult<()> {
        self.disk(region)?.put(key, value, version)
    }

    pub fn del(&self, region: RegionId, key: Bytes) -> DiskResult<()> {
        self.disk(region)?.del(key)
    }

    pub fn make_snapshot(&self, region: RegionId, coord: SearchCoordinate) -> Option<Snapshot> {
        self.disk(region).ok().map(|d| d.make_snapshot(coord))
    }

    pub fn make_rolling_snapshot(&self, region: RegionId) -> Option<RollingSnapshot> {
        self.disk(region).ok().map(|d| d.make_rolling_snapshot())
    }

    pub fn flush(&self, region: RegionId, budget: usize, nonblocking: bool) -> DiskResult<IoProgress> {
        self.disk(region)?.flush(budget, nonblocking)
    }

    // ------------------------------------------------------------------
    // Durable state file
    // ------------------------------------------------------------------

    fn dump_state(&self, config: &Configuration, us: Instance) -> bool {
        let text = format!(
            "version {}\nus {} {} {} {} {}\nconfig {}",
            STATE_FILE_VERSION,
            us.addr,
            us.inbound_port,
            us.inbound_epoch,
            us.outbound_port,
            us.outbound_epoch,
            config.config_text(),
        );

        let tmp = self.base.join(format!("{STATE_FILE_NAME}.tmp"));
        let dst = self.base.join(STATE_FILE_NAME);
        if let Err(e) = fs::write(&tmp, text).and_then(|()| fs::rename(&tmp, &dst)) {
            error!(error = %e, "state file rewrite failed");
            return false;
        }
        true
    }

    /// Restores disks from the state file. Any malformed or
    /// version-mismatched file starts the layer empty.
    fn load_state(&self) {
        let path = self.base.join(STATE_FILE_NAME);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(_) => {
                info!("no datalayer state file; starting with fresh state");
                return;
            }
        };

        let Some((us, config_text)) = parse_state_file(&text) else {
            error!(path = %path.display(), "malformed datalayer state file; starting with fresh state");
            return;
        };

        let config = match hyperdex_config::parse(&config_text) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "unparseable config in state file; starting with fresh state");
                return;
            }
        };
        let Some(state_id) = config.quiesce_state_id().map(str::to_owned) else {
            error!("state file config carries no quiesce id; starting with fresh state");
            return;
        };

        for region in config.regions_for(us) {
            let Some(hasher) = config.disk_hasher(region.subspace_id()) else {
                continue;
            };
            let arity = config.dimensions(region.space);
            match Disk::open(&self.region_dir(region), hasher, arity, &state_id) {
                Ok(disk) => {
                    self.disks
                        .write()
                        .expect("disks lock")
                        .insert(region, Arc::new(disk));
                }
                Err(e) => {
                    error!(%region, error = %e, "could not reopen quiesced disk");
                }
            }
        }
        info!(%state_id, "datalayer state restored from quiesced state");
    }

    fn region_dir(&self, region: RegionId) -> PathBuf {
        self.base.join(format!(
            "region-{}-{}-{}-{:016x}",
            region.space, region.subspace, region.prefix, region.mask
        ))
    }

    // ------------------------------------------------------------------
    // Background I/O
    // ------------------------------------------------------------------

    fn snapshot_disks(&self) -> Vec<(RegionId, Arc<Disk>)> {
        self.disks
            .read()
            .expect("disks lock")
            .iter()
            .map(|(&r, d)| (r, Arc::clone(d)))
            .collect()
    }

    fn flush_thread(&self) {
        info!("data-flush thread started");

        while !self.shutdown.load(Ordering::SeqCst) {
            let mut idle = true;

            for (region, disk) in self.snapshot_disks() {
                match disk.flush(FLUSH_BATCH, true) {
                    Ok(IoProgress::Did) => idle = false,
                    Ok(IoProgress::DidNothing) => {}
                    Err(DiskError::DataFull | DiskError::SearchFull) => {
                        if let Err(e) = disk.do_mandatory_io() {
                            error!(%region, error = %e, "mandatory disk i/o failed");
                        }
                    }
                    Err(e) => error!(%region, error = %e, "disk flush failed"),
                }
            }

            if idle {
                thread::sleep(Duration::from_millis(10));
            } else {
                self.flushed_recently.store(true, Ordering::SeqCst);
            }
        }
    }

    fn optimistic_io_thread(&self) {
        info!("optimistic-i/o thread started");

        let mut prealloc_rr: VecDeque<RegionId> = VecDeque::new();
        let mut optimistic_rr: VecDeque<RegionId> = VecDeque::new();
        let mut last_prealloc = Instant::now();
        let mut last_optimism = Instant::now();
        let prealloc_interval = Duration::from_nanos(1_000_000_000 / PREALLOCATIONS_PER_SECOND);
        let optimism_interval = Duration::from_nanos(1_000_000_000 / OPTIMISM_BURSTS_PER_SECOND);

        while !self.shutdown.load(Ordering::SeqCst) {
            let disks: HashMap<RegionId, Arc<Disk>> =
                self.snapshot_disks().into_iter().collect();

            for &region in disks.keys() {
                if !prealloc_rr.contains(&region) {
                    prealloc_rr.push_back(region);
                }
                if !optimistic_rr.contains(&region) {
                    optimistic_rr.push_back(region);
                }
            }

            if last_prealloc.elapsed() >= prealloc_interval {
                round_robin(&mut prealloc_rr, &disks, |disk| disk.preallocate());
                last_prealloc = Instant::now();
            }

            if last_optimism.elapsed() >= optimism_interval {
                round_robin(&mut optimistic_rr, &disks, |disk| disk.do_optimistic_io());
                last_optimism = Instant::now();
            }

            // Only optimize while flushing makes progress.
            self.flushed_recently.store(false, Ordering::SeqCst);
            while !self.shutdown.load(Ordering::SeqCst)
                && !self.flushed_recently.load(Ordering::SeqCst)
            {
                thread::sleep(Duration::from_millis(10));
            }
        }

    }
}

/// One rate-limited pass over the round-robin queue: stops at the first
/// disk that does work, retiring dropped regions as it goes.
fn round_robin(
    rr: &mut VecDeque<RegionId>,
    disks: &HashMap<RegionId, Arc<Disk>>,
    mut op: impl FnMut(&Disk) -> DiskResult<IoProgress>,
) {
    for _ in 0..rr.len() {
        let Some(region) = rr.pop_front() else { break };
        let Some(disk) = disks.get(&region) else {
            // Region dropped; retire it from the rotation.
            continue;
        };
        rr.push_back(region);
        match op(disk) {
            Ok(IoProgress::Did) => break,
            Ok(IoProgress::DidNothing) => {}
            Err(e) => warn!(%region, error = %e, "background disk i/o failed"),
        }
    }
}

fn parse_state_file(text: &str) -> Option<(Instance, String)> {
    let mut tokens = text.split_whitespace();
    if tokens.next()? != "version" {
        return None;
    }
    if tokens.next()?.parse::<i32>().ok()? != STATE_FILE_VERSION {
        return None;
    }
    if tokens.next()? != "us" {
        return None;
    }
    let us = Instance::new(
        tokens.next()?.parse().ok()?,
        tokens.next()?.parse().ok()?,
        tokens.next()?.parse().ok()?,
        tokens.next()?.parse().ok()?,
        tokens.next()?.parse().ok()?,
    );

    // Everything after the "config " token is the configuration text.
    let config_marker = "\nconfig ";
    let idx = text.find(config_marker)?;
    let config_text = text[idx + config_marker.len()..].to_string();
    Some((us, config_text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    const CONFIG: &str = "\
version 4
host 1 127.0.0.1 2012 1 2013 1
space 9 users name string age int64
subspace 9 0 true true false false
region 9 0 0 0 1
quiesce snap-7
";

    fn host1() -> Instance {
        Instance::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 2012, 1, 2013, 1)
    }

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn routes_to_region_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let config = hyperdex_config::parse(CONFIG).unwrap();
        let layer = DataLayer::new(tmp.path()).unwrap();
        layer.prepare(&config, host1());

        let region = RegionId::new(hyperdex_types::SpaceId(9), 0, 0, 0);
        layer.put(region, b("alice"), vec![b("30")], 1).unwrap();
        let (value, version) = layer.get(region, b"alice").unwrap();
        assert_eq!(value, vec![b("30")]);
        assert_eq!(version, 1);

        let other = RegionId::new(hyperdex_types::SpaceId(9), 0, 1, 1 << 63);
        assert!(matches!(
            layer.get(other, b"alice"),
            Err(DiskError::MissingDisk)
        ));
    }

    #[test]
    fn quiesce_state_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let config = hyperdex_config::parse(CONFIG).unwrap();
        let region = RegionId::new(hyperdex_types::SpaceId(9), 0, 0, 0);

        {
            let layer = DataLayer::new(tmp.path()).unwrap();
            layer.prepare(&config, host1());
            layer.put(region, b("alice"), vec![b("30")], 1).unwrap();
            layer.reconfigure(&config, host1());
            assert!(tmp.path().join(STATE_FILE_NAME).exists());
        }

        // A fresh datalayer restores the quiesced disk.
        let restored = DataLayer::new(tmp.path()).unwrap();
        let (value, version) = restored.get(region, b"alice").unwrap();
        assert_eq!(value, vec![b("30")]);
        assert_eq!(version, 1);
    }

    #[test]
    fn corrupt_state_file_starts_fresh() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(STATE_FILE_NAME), "version 99 garbage").unwrap();
        let layer = DataLayer::new(tmp.path()).unwrap();
        let region = RegionId::new(hyperdex_types::SpaceId(9), 0, 0, 0);
        assert!(matches!(
            layer.get(region, b"x"),
            Err(DiskError::MissingDisk)
        ));
    }

    #[test]
    fn cleanup_drops_unassigned_disks() {
        let tmp = tempfile::tempdir().unwrap();
        let config = hyperdex_config::parse(CONFIG).unwrap();
        let layer = DataLayer::new(tmp.path()).unwrap();
        layer.prepare(&config, host1());
        let region = RegionId::new(hyperdex_types::SpaceId(9), 0, 0, 0);
        layer.put(region, b("k"), vec![b("v")], 1).unwrap();

        // A configuration that assigns us nothing drops the disk.
        let empty = hyperdex_config::parse("version 5\n").unwrap();
        layer.cleanup(&empty, host1());
        assert!(matches!(layer.get(region, b"k"), Err(DiskError::MissingDisk)));
    }

    #[test]
    fn state_file_parser_rejects_bad_versions() {
        assert!(parse_state_file("version 2\nus 127.0.0.1 1 1 1 1\nconfig x").is_none());
        assert!(parse_state_file("vers 1").is_none());
        assert!(parse_state_file("").is_none());
        let good = format!(
            "version 1\nus 127.0.0.1 2012 1 2013 1\nconfig {CONFIG}"
        );
        let (us, text) = parse_state_file(&good).unwrap();
        assert_eq!(us, host1());
        assert_eq!(text, CONFIG);
    }
}
