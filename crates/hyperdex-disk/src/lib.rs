//! # hyperdex-disk: Durable per-region column store
//!
//! One [`Disk`] holds one region's objects, keyed by opaque byte keys
//! with a fixed number of value columns. Reads are served from an
//! in-memory table whose slices are refcounted (`bytes::Bytes`), so a
//! value returned from [`Disk::get`] stays alive for as long as the
//! caller holds it, even across a drop of the region. Writes are applied
//! to the table immediately and appended to a bounded write-ahead queue;
//! background threads drain the queue into append-only segment files via
//! [`Disk::flush`].
//!
//! # File layout
//!
//! ```text
//! {region_dir}/
//! ├── segment_000000.log   <- oldest segment (immutable after rotation)
//! ├── segment_000001.log   <- active segment
//! └── manifest.json        <- segment list, active segment, quiesce id
//! ```
//!
//! # Quiesce
//!
//! [`Disk::quiesce`] drains and syncs everything, stamps the manifest
//! with a state id, and makes the disk read-only. [`Disk::open`] replays
//! the segments of a disk quiesced under a matching state id.

mod error;
mod record;
mod snapshot;

use std::collections::{HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use bytes::Bytes;
use hyperdex_hashing::{MaskCoordinate, MaskHasher, SearchCoordinate};
use tracing::{debug, info};

pub use error::{DiskError, DiskResult, IoProgress};
pub use record::LogRecord;
pub use snapshot::{RollingSnapshot, Snapshot};

/// Queued writes before the disk reports `DataFull`.
const WRITE_QUEUE_CAPACITY: usize = 65_536;

/// Bytes preallocated ahead of the active segment's write head.
const PREALLOC_CHUNK: u64 = 4 * 1024 * 1024;

/// Active segment size beyond which optimistic I/O rotates it.
const SEGMENT_ROTATE_SIZE: u64 = 256 * 1024 * 1024;

const MANIFEST_FILENAME: &str = "manifest.json";

fn segment_filename(segment_num: u32) -> String {
    format!("segment_{segment_num:06}.log")
}

/// Segment list and quiesce marker, persisted as JSON.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct Manifest {
    /// Ordered segment numbers; the last one is active.
    segments: Vec<u32>,
    /// Set once the disk has been quiesced; the disk is read-only after.
    quiesce_state_id: Option<String>,
}

impl Manifest {
    fn new() -> Self {
        Self { segments: vec![0], quiesce_state_id: None }
    }

    fn save(&self, dir: &Path) -> DiskResult<()> {
        let tmp = dir.join(format!("{MANIFEST_FILENAME}.tmp"));
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, dir.join(MANIFEST_FILENAME))?;
        Ok(())
    }

    fn load(dir: &Path) -> DiskResult<Self> {
        let json = fs::read_to_string(dir.join(MANIFEST_FILENAME))?;
        serde_json::from_str(&json).map_err(|e| DiskError::Corrupt(e.to_string()))
    }
}

/// One live object in the table.
#[derive(Debug, Clone)]
struct Stored {
    value: Vec<Bytes>,
    version: u64,
    coord: MaskCoordinate,
}

/// The write-ahead side: queued records, the active segment file, and
/// the manifest. Held under its own lock so flushing never blocks reads.
struct LogState {
    dir: PathBuf,
    queue: VecDeque<LogRecord>,
    manifest: Manifest,
    active: File,
    active_len: u64,
    prealloc_len: u64,
    quiesced: bool,
}

impl LogState {
    fn active_segment(&self) -> u32 {
        *self.manifest.segments.last().expect("manifest always has a segment")
    }

    fn write_records(&mut self, budget: usize, sync: bool) -> DiskResult<IoProgress> {
        if self.queue.is_empty() {
            return Ok(IoProgress::DidNothing);
        }

        let mut buf = Vec::new();
        let n = budget.min(self.queue.len());
        for rec in self.queue.drain(..n) {
            rec.encode_into(&mut buf);
        }
        self.active.write_all(&buf)?;
        self.active_len += buf.len() as u64;

        if sync {
            self.active.sync_data().map_err(|_| DiskError::SyncFailed)?;
        }

        Ok(IoProgress::Did)
    }

    fn rotate(&mut self) -> DiskResult<()> {
        let next = self.active_segment() + 1;
        self.active.sync_data().map_err(|_| DiskError::SyncFailed)?;
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(self.dir.join(segment_filename(next)))?;
        self.manifest.segments.push(next);
        self.manifest.save(&self.dir)?;
        self.active = file;
        self.active_len = 0;
        self.prealloc_len = 0;
        Ok(())
    }
}

/// A single region's store.
pub struct Disk {
    hasher: MaskHasher,
    arity: usize,
    table: RwLock<HashMap<Bytes, Stored>>,
    log: Mutex<LogState>,
}

impl Disk {
    /// Creates a fresh disk in `dir` (the directory is created).
    pub fn create(dir: &Path, hasher: MaskHasher, arity: usize) -> DiskResult<Self> {
        fs::create_dir_all(dir)?;
        let manifest = Manifest::new();
        manifest.save(dir)?;
        let active = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(segment_filename(0)))?;
        info!(dir = %dir.display(), arity, "created disk");

        Ok(Self {
            hasher,
            arity,
            table: RwLock::new(HashMap::new()),
            log: Mutex::new(LogState {
                dir: dir.to_path_buf(),
                queue: VecDeque::new(),
                manifest,
                active,
                active_len: 0,
                prealloc_len: 0,
                quiesced: false,
            }),
        })
    }

    /// Reopens a disk previously quiesced under `state_id`, replaying its
    /// segments.
    pub fn open(dir: &Path, hasher: MaskHasher, arity: usize, state_id: &str) -> DiskResult<Self> {
        let manifest = Manifest::load(dir)?;
        if manifest.quiesce_state_id.as_deref() != Some(state_id) {
            return Err(DiskError::Corrupt(format!(
                "disk was not quiesced under state {state_id:?}"
            )));
        }

        let mut table = HashMap::new();
        for &seg in &manifest.segments {
            let data = fs::read(dir.join(segment_filename(seg)))?;
            let mut rest: &[u8] = &data;
            while let Some((rec, tail)) = LogRecord::decode(rest)? {
                rest = tail;
                if rec.has_value {
                    let coord = hasher.hash(&rec.key, &rec.value);
                    table.insert(
                        rec.key,
                        Stored { value: rec.value, version: rec.version, coord },
                    );
                } else {
                    table.remove(&rec.key);
                }
            }
        }

        let active_path = dir.join(segment_filename(*manifest.segments.last().unwrap()));
        let active_len = fs::metadata(&active_path)?.len();
        let active = OpenOptions::new().append(true).open(&active_path)?;
        info!(dir = %dir.display(), state_id, objects = table.len(), "reopened quiesced disk");

        Ok(Self {
            hasher,
            arity,
            table: RwLock::new(table),
            log: Mutex::new(LogState {
                dir: dir.to_path_buf(),
                queue: VecDeque::new(),
                manifest,
                active,
                active_len,
                prealloc_len: active_len,
                quiesced: false,
            }),
        })
    }

    /// Number of value columns plus the key.
    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Reads the current value of a key. The returned slices are
    /// refcounted and stay valid for as long as the caller holds them.
    pub fn get(&self, key: &[u8]) -> DiskResult<(Vec<Bytes>, u64)> {
        let table = self.table.read().expect("disk table lock");
        match table.get(key) {
            Some(stored) => Ok((stored.value.clone(), stored.version)),
            None => Err(DiskError::NotFound),
        }
    }

    /// Writes a new version of a key, atomically with respect to
    /// concurrent `get`/`del`.
    pub fn put(&self, key: Bytes, value: Vec<Bytes>, version: u64) -> DiskResult<()> {
        if value.len() + 1 != self.arity {
            return Err(DiskError::WrongArity);
        }

        let mut log = self.log.lock().expect("disk log lock");
        if log.quiesced {
            return Err(DiskError::ReadOnly);
        }
        if log.queue.len() >= WRITE_QUEUE_CAPACITY {
            return Err(DiskError::DataFull);
        }
        log.queue.push_back(LogRecord {
            has_value: true,
            version,
            key: key.clone(),
            value: value.clone(),
        });

        let coord = self.hasher.hash(&key, &value);
        let mut table = self.table.write().expect("disk table lock");
        table.insert(key, Stored { value, version, coord });
        Ok(())
    }

    /// Deletes a key. `NotFound` if it has no value.
    pub fn del(&self, key: Bytes) -> DiskResult<()> {
        let mut log = self.log.lock().expect("disk log lock");
        if log.quiesced {
            return Err(DiskError::ReadOnly);
        }
        if log.queue.len() >= WRITE_QUEUE_CAPACITY {
            return Err(DiskError::DataFull);
        }

        let mut table = self.table.write().expect("disk table lock");
        if table.remove(&key).is_none() {
            return Err(DiskError::NotFound);
        }
        log.queue.push_back(LogRecord {
            has_value: false,
            version: 0,
            key,
            value: Vec::new(),
        });
        Ok(())
    }

    /// A point-in-time iterator over objects whose disk coordinate
    /// matches `coord`.
    pub fn make_snapshot(&self, coord: SearchCoordinate) -> Snapshot {
        let table = self.table.read().expect("disk table lock");
        let entries = table
            .iter()
            .filter(|(_, s)| coord.matches_coord(s.coord))
            .map(|(k, s)| snapshot::Entry {
                key: k.clone(),
                value: s.value.clone(),
                version: s.version,
                coord: s.coord,
            })
            .collect();
        Snapshot::new(entries)
    }

    /// A full-region iterator for state transfer. Captures the region's
    /// contents at creation; advancing never blocks concurrent writes.
    pub fn make_rolling_snapshot(&self) -> RollingSnapshot {
        let table = self.table.read().expect("disk table lock");
        let entries = table
            .iter()
            .map(|(k, s)| snapshot::Entry {
                key: k.clone(),
                value: s.value.clone(),
                version: s.version,
                coord: s.coord,
            })
            .collect();
        RollingSnapshot::new(entries)
    }

    /// Drains up to `budget` queued writes to the active segment.
    /// Blocking mode also syncs the file.
    pub fn flush(&self, budget: usize, nonblocking: bool) -> DiskResult<IoProgress> {
        let mut log = self.log.lock().expect("disk log lock");
        log.write_records(budget, !nonblocking)
    }

    /// Drains the whole queue and syncs. Called when a flush reports the
    /// queue full.
    pub fn do_mandatory_io(&self) -> DiskResult<IoProgress> {
        let mut log = self.log.lock().expect("disk log lock");
        let n = log.queue.len();
        if n == 0 {
            return Ok(IoProgress::DidNothing);
        }
        log.write_records(n, true)
    }

    /// Extends the active segment ahead of the write head.
    pub fn preallocate(&self) -> DiskResult<IoProgress> {
        let mut log = self.log.lock().expect("disk log lock");
        if log.prealloc_len >= log.active_len + PREALLOC_CHUNK / 2 {
            return Ok(IoProgress::DidNothing);
        }
        let target = log.active_len + PREALLOC_CHUNK;
        log.active.set_len(target)?;
        log.prealloc_len = target;
        debug!(target, "preallocated segment space");
        Ok(IoProgress::Did)
    }

    /// Rotates the active segment early when it has grown past the
    /// rotation threshold.
    pub fn do_optimistic_io(&self) -> DiskResult<IoProgress> {
        let mut log = self.log.lock().expect("disk log lock");
        if log.active_len < SEGMENT_ROTATE_SIZE {
            return Ok(IoProgress::DidNothing);
        }
        log.rotate().map_err(|_| DiskError::SplitFailed)?;
        Ok(IoProgress::Did)
    }

    /// Drains and syncs everything, stamps the manifest with `state_id`,
    /// and makes the disk read-only. Subsequent writes fail until the
    /// disk is reopened.
    pub fn quiesce(&self, state_id: &str) -> DiskResult<()> {
        let mut log = self.log.lock().expect("disk log lock");
        let n = log.queue.len();
        if n > 0 {
            log.write_records(n, true)?;
        } else {
            log.active.sync_data().map_err(|_| DiskError::SyncFailed)?;
        }
        log.manifest.quiesce_state_id = Some(state_id.to_string());
        log.manifest.save(&log.dir)?;
        log.quiesced = true;
        info!(state_id, "disk quiesced");
        Ok(())
    }

    /// Removes the disk's directory. The disk must not be used after.
    pub fn destroy(&self) -> DiskResult<()> {
        let log = self.log.lock().expect("disk log lock");
        fs::remove_dir_all(&log.dir).map_err(|_| DiskError::DropFailed)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn new_disk(dir: &Path) -> Disk {
        Disk::create(dir, MaskHasher::new(vec![true, true]), 2).unwrap()
    }

    #[test]
    fn put_get_del_visibility() {
        let tmp = tempfile::tempdir().unwrap();
        let disk = new_disk(tmp.path());

        assert!(matches!(disk.get(b"alice"), Err(DiskError::NotFound)));
        disk.put(b("alice"), vec![b("30")], 1).unwrap();
        let (value, version) = disk.get(b"alice").unwrap();
        assert_eq!(value, vec![b("30")]);
        assert_eq!(version, 1);

        disk.put(b("alice"), vec![b("31")], 2).unwrap();
        let (value, version) = disk.get(b"alice").unwrap();
        assert_eq!(value, vec![b("31")]);
        assert_eq!(version, 2);

        disk.del(b("alice")).unwrap();
        assert!(matches!(disk.get(b"alice"), Err(DiskError::NotFound)));
        assert!(matches!(disk.del(b("alice")), Err(DiskError::NotFound)));
    }

    #[test]
    fn wrong_arity_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let disk = new_disk(tmp.path());
        assert!(matches!(
            disk.put(b("k"), vec![b("a"), b("b")], 1),
            Err(DiskError::WrongArity)
        ));
    }

    #[test]
    fn refs_outlive_the_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let disk = new_disk(tmp.path());
        disk.put(b("k"), vec![b("payload")], 1).unwrap();
        let (value, _) = disk.get(b"k").unwrap();
        disk.del(b("k")).unwrap();
        drop(disk);
        assert_eq!(value[0].as_ref(), b"payload");
    }

    #[test]
    fn flush_drains_queue() {
        let tmp = tempfile::tempdir().unwrap();
        let disk = new_disk(tmp.path());
        disk.put(b("k"), vec![b("v")], 1).unwrap();
        assert!(matches!(disk.flush(100, true), Ok(IoProgress::Did)));
        assert!(matches!(disk.flush(100, true), Ok(IoProgress::DidNothing)));
        let len = fs::metadata(tmp.path().join(segment_filename(0))).unwrap().len();
        assert!(len > 0);
    }

    #[test]
    fn quiesce_then_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let disk = new_disk(tmp.path());
            disk.put(b("alice"), vec![b("30")], 1).unwrap();
            disk.put(b("bob"), vec![b("44")], 3).unwrap();
            disk.del(b("bob")).unwrap();
            disk.quiesce("snap-1").unwrap();
            assert!(matches!(
                disk.put(b("x"), vec![b("y")], 1),
                Err(DiskError::ReadOnly)
            ));
        }

        let reopened =
            Disk::open(tmp.path(), MaskHasher::new(vec![true, true]), 2, "snap-1").unwrap();
        let (value, version) = reopened.get(b"alice").unwrap();
        assert_eq!(value, vec![b("30")]);
        assert_eq!(version, 1);
        assert!(matches!(reopened.get(b"bob"), Err(DiskError::NotFound)));

        // Wrong state id refuses to open.
        assert!(Disk::open(tmp.path(), MaskHasher::new(vec![true, true]), 2, "snap-2").is_err());
    }

    #[test]
    fn snapshot_filters_by_coordinate() {
        let tmp = tempfile::tempdir().unwrap();
        let hasher = MaskHasher::new(vec![true, true]);
        let disk = Disk::create(tmp.path(), hasher.clone(), 2).unwrap();
        disk.put(b("alice"), vec![b("30")], 1).unwrap();
        disk.put(b("bob"), vec![b("44")], 1).unwrap();

        let search = hyperdex_hashing::Search::new(2).with_term(0, b("alice"));
        let coord = hasher.hash_search(&search);
        let mut snap = disk.make_snapshot(coord);
        let mut found_alice = false;
        while snap.valid() {
            // The prefilter may pass extra entries, never miss the match.
            if snap.key().as_ref() == b"alice" {
                found_alice = true;
            }
            snap.next();
        }
        assert!(found_alice);

        let all = disk.make_snapshot(SearchCoordinate::unconstrained());
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn rolling_snapshot_is_stable_under_writes() {
        let tmp = tempfile::tempdir().unwrap();
        let disk = new_disk(tmp.path());
        disk.put(b("k1"), vec![b("v1")], 1).unwrap();
        disk.put(b("k2"), vec![b("v2")], 1).unwrap();

        let mut snap = disk.make_rolling_snapshot();
        disk.put(b("k3"), vec![b("v3")], 1).unwrap();
        disk.del(b("k1")).unwrap();

        let mut seen = 0;
        while snap.valid() {
            seen += 1;
            snap.next();
        }
        assert_eq!(seen, 2);
    }
}
