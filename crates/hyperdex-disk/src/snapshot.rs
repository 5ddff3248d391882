//! Snapshot iterators over a region's contents.
//!
//! Both snapshot kinds capture the table at creation, so they never
//! block and are never invalidated by concurrent writes. The cursor
//! style (`valid`/`next`/accessors) matches how the search and transfer
//! layers consume them.

use bytes::Bytes;
use hyperdex_hashing::MaskCoordinate;

/// One captured object.
#[derive(Debug, Clone)]
pub(crate) struct Entry {
    pub key: Bytes,
    pub value: Vec<Bytes>,
    pub version: u64,
    pub coord: MaskCoordinate,
}

/// A point-in-time, coordinate-filtered iterator used by searches.
pub struct Snapshot {
    entries: Vec<Entry>,
    pos: usize,
}

impl Snapshot {
    pub(crate) fn new(entries: Vec<Entry>) -> Self {
        Self { entries, pos: 0 }
    }

    pub fn valid(&self) -> bool {
        self.pos < self.entries.len()
    }

    pub fn next(&mut self) {
        self.pos += 1;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn key(&self) -> &Bytes {
        &self.entries[self.pos].key
    }

    pub fn value(&self) -> &[Bytes] {
        &self.entries[self.pos].value
    }

    pub fn version(&self) -> u64 {
        self.entries[self.pos].version
    }

    pub fn coordinate(&self) -> MaskCoordinate {
        self.entries[self.pos].coord
    }
}

/// A full-region iterator used by outgoing state transfers.
pub struct RollingSnapshot {
    entries: Vec<Entry>,
    pos: usize,
}

impl RollingSnapshot {
    pub(crate) fn new(entries: Vec<Entry>) -> Self {
        Self { entries, pos: 0 }
    }

    pub fn valid(&self) -> bool {
        self.pos < self.entries.len()
    }

    pub fn next(&mut self) {
        self.pos += 1;
    }

    pub fn has_value(&self) -> bool {
        // Captured entries are live objects; deletions racing the
        // transfer reach the receiver through the trigger path.
        true
    }

    pub fn key(&self) -> &Bytes {
        &self.entries[self.pos].key
    }

    pub fn value(&self) -> &[Bytes] {
        &self.entries[self.pos].value
    }

    pub fn version(&self) -> u64 {
        self.entries[self.pos].version
    }
}
