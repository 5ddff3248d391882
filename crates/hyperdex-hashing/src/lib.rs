//! # hyperdex-hashing: Hyperspace hashing
//!
//! Objects are placed by hashing subsets of their attributes onto a
//! 64-bit point space. Two hashers exist per subspace:
//!
//! - [`PrefixHasher`] produces the single 64-bit *point* used by the
//!   replication layer to route an object to the region whose prefix
//!   contains it. Participating attributes are hashed individually and
//!   their bits interleaved, so each attribute contributes prefix
//!   locality.
//! - [`MaskHasher`] produces a [`MaskCoordinate`] used by the disk layer
//!   and by searches: each participating attribute owns a lane of bits,
//!   letting a search with equality terms on a subset of attributes
//!   prefilter objects with one masked compare.
//!
//! Both are derived from the subspace's per-attribute participation
//! vectors in the coordinator configuration. Attribute 0 is the key.

use bytes::Bytes;

// ============================================================================
// Byte hashing
// ============================================================================

/// Hashes a byte string to a 64-bit value.
pub fn hash_bytes(data: &[u8]) -> u64 {
    rapidhash::rapidhash(data)
}

/// Hashes a byte string with a seed. Used for the replication stripe
/// locks, where the seed carries the region identity.
pub fn hash_bytes_seeded(data: &[u8], seed: u64) -> u64 {
    rapidhash::rapidhash_seeded(data, seed)
}

// ============================================================================
// Prefix hashing (replication routing)
// ============================================================================

/// Hashes participating attributes onto a single 64-bit point by bit
/// interleaving.
#[derive(Debug, Clone)]
pub struct PrefixHasher {
    /// One flag per attribute, including the key at index 0.
    participating: Vec<bool>,
}

impl PrefixHasher {
    pub fn new(participating: Vec<bool>) -> Self {
        Self { participating }
    }

    /// Number of attributes this hasher expects (key plus secondaries).
    pub fn arity(&self) -> usize {
        self.participating.len()
    }

    /// Hashes an object to its point. `value` holds the secondary
    /// attributes; `value.len() + 1` must equal the arity.
    pub fn hash(&self, key: &[u8], value: &[Bytes]) -> u64 {
        debug_assert_eq!(value.len() + 1, self.participating.len());
        let hashes: Vec<u64> = self
            .participating
            .iter()
            .enumerate()
            .filter(|&(_, p)| *p)
            .map(|(i, _)| {
                if i == 0 {
                    hash_bytes(key)
                } else {
                    hash_bytes(&value[i - 1])
                }
            })
            .collect();
        interleave(&hashes)
    }
}

/// Interleaves the most-significant bits of each hash round-robin into a
/// single 64-bit point. With one participant this is the identity.
fn interleave(hashes: &[u64]) -> u64 {
    if hashes.is_empty() {
        return 0;
    }
    if hashes.len() == 1 {
        return hashes[0];
    }

    let mut point = 0u64;
    for out_bit in 0..64u32 {
        let which = out_bit as usize % hashes.len();
        let in_bit = out_bit / hashes.len() as u32;
        let bit = (hashes[which] >> (63 - in_bit)) & 1;
        point |= bit << (63 - out_bit);
    }
    point
}

// ============================================================================
// Masked coordinates (disk layer, searches)
// ============================================================================

/// Number of coordinate bits granted to each participating attribute.
fn lane_width(lanes: usize) -> u32 {
    debug_assert!(lanes > 0);
    (64 / lanes as u32).min(16)
}

/// The disk-layer coordinate of one stored object: `mask` covers the
/// lanes of every participating attribute, `point` holds each
/// attribute's lane bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MaskCoordinate {
    pub mask: u64,
    pub point: u64,
}

/// A search prefilter: lane bits for the attributes the search fixes by
/// equality. An object can only match if the masked lanes agree;
/// the precise byte-level comparison still follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SearchCoordinate {
    pub mask: u64,
    pub point: u64,
}

impl SearchCoordinate {
    /// The prefilter: does an object with this disk coordinate possibly
    /// match the search?
    pub fn matches_coord(&self, coord: MaskCoordinate) -> bool {
        (coord.point & self.mask) == (self.point & self.mask)
    }

    /// A coordinate with no equality terms matches everything.
    pub fn unconstrained() -> Self {
        Self::default()
    }
}

/// Hashes attributes into per-attribute bit lanes.
#[derive(Debug, Clone)]
pub struct MaskHasher {
    participating: Vec<bool>,
}

impl MaskHasher {
    pub fn new(participating: Vec<bool>) -> Self {
        Self { participating }
    }

    pub fn arity(&self) -> usize {
        self.participating.len()
    }

    fn lanes(&self) -> usize {
        self.participating.iter().filter(|&&p| p).count().max(1)
    }

    /// The lane (shift, width) for participating attribute index `attr`,
    /// or `None` if the attribute does not participate.
    fn lane(&self, attr: usize) -> Option<(u32, u32)> {
        if !self.participating.get(attr).copied().unwrap_or(false) {
            return None;
        }
        let width = lane_width(self.lanes());
        let lane_idx = self.participating[..attr].iter().filter(|&&p| p).count() as u32;
        Some((lane_idx * width, width))
    }

    /// The disk coordinate of a stored object.
    pub fn hash(&self, key: &[u8], value: &[Bytes]) -> MaskCoordinate {
        let mut mask = 0u64;
        let mut point = 0u64;

        for attr in 0..self.participating.len() {
            let Some((shift, width)) = self.lane(attr) else {
                continue;
            };
            let data: &[u8] = if attr == 0 {
                key
            } else {
                &value[attr - 1]
            };
            let lane_mask = lane_bits(width);
            mask |= lane_mask << shift;
            point |= (hash_bytes(data) & lane_mask) << shift;
        }

        MaskCoordinate { mask, point }
    }

    /// The prefilter coordinate of a search: only lanes of attributes the
    /// search fixes by equality (and that participate in this hashing)
    /// are constrained.
    pub fn hash_search(&self, search: &Search) -> SearchCoordinate {
        let mut mask = 0u64;
        let mut point = 0u64;

        for (attr, term) in search.equality.iter().enumerate() {
            let Some(data) = term else { continue };
            let Some((shift, width)) = self.lane(attr) else {
                continue;
            };
            let lane_mask = lane_bits(width);
            mask |= lane_mask << shift;
            point |= (hash_bytes(data) & lane_mask) << shift;
        }

        SearchCoordinate { mask, point }
    }
}

fn lane_bits(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

// ============================================================================
// Searches
// ============================================================================

/// A search over one space: per-attribute equality terms, key included
/// at index 0. Absent terms are unconstrained.
#[derive(Debug, Clone, Default)]
pub struct Search {
    pub equality: Vec<Option<Bytes>>,
}

impl Search {
    pub fn new(arity: usize) -> Self {
        Self { equality: vec![None; arity] }
    }

    pub fn with_term(mut self, attr: usize, value: Bytes) -> Self {
        self.equality[attr] = Some(value);
        self
    }

    /// A search must match the space's arity and constrain something.
    pub fn sanity_check(&self, arity: usize) -> bool {
        self.equality.len() == arity && self.equality.iter().any(Option::is_some)
    }

    /// The precise check: byte equality on every fixed attribute.
    pub fn matches(&self, key: &[u8], value: &[Bytes]) -> bool {
        if value.len() + 1 != self.equality.len() {
            return false;
        }
        self.equality.iter().enumerate().all(|(attr, term)| {
            let Some(expected) = term else { return true };
            let actual: &[u8] = if attr == 0 { key } else { &value[attr - 1] };
            expected.as_ref() == actual
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn key_only_prefix_hash_is_plain_hash() {
        let hasher = PrefixHasher::new(vec![true, false]);
        let point = hasher.hash(b"alice".as_ref(), &[b("30")]);
        assert_eq!(point, hash_bytes(b"alice"));
    }

    #[test]
    fn prefix_hash_depends_on_participating_attrs_only() {
        let hasher = PrefixHasher::new(vec![false, true, false]);
        let p1 = hasher.hash(b"k1", &[b("x"), b("y")]);
        let p2 = hasher.hash(b"k2", &[b("x"), b("z")]);
        assert_eq!(p1, p2);

        let p3 = hasher.hash(b"k1", &[b("w"), b("y")]);
        assert_ne!(p1, p3);
    }

    #[test]
    fn interleave_spreads_first_bits() {
        // With two participants, the output's top two bits come from the
        // participants' top bits.
        let a = 1u64 << 63;
        let b = 0u64;
        let point = interleave(&[a, b]);
        assert_eq!(point >> 62, 0b10);
        let point = interleave(&[b, a]);
        assert_eq!(point >> 62, 0b01);
    }

    #[test]
    fn mask_coordinate_prefilter() {
        let hasher = MaskHasher::new(vec![true, true]);
        let coord = hasher.hash(b"alice", &[b("30")]);

        let hit = Search::new(2).with_term(1, b("30"));
        let sc = hasher.hash_search(&hit);
        assert!(sc.matches_coord(coord));

        // An unconstrained search matches any coordinate.
        assert!(SearchCoordinate::unconstrained().matches_coord(coord));
    }

    #[test]
    fn search_precise_match() {
        let s = Search::new(3).with_term(0, b("k")).with_term(2, b("v2"));
        assert!(s.matches(b"k", &[b("anything"), b("v2")]));
        assert!(!s.matches(b"k", &[b("anything"), b("v3")]));
        assert!(!s.matches(b"x", &[b("anything"), b("v2")]));
        // Wrong arity never matches.
        assert!(!s.matches(b"k", &[b("v2")]));
    }

    #[test]
    fn search_sanity() {
        assert!(!Search::new(2).sanity_check(2)); // no terms
        assert!(Search::new(2).with_term(0, b("k")).sanity_check(2));
        assert!(!Search::new(2).with_term(0, b("k")).sanity_check(3));
    }

    proptest! {
        #[test]
        fn prefilter_never_excludes_a_real_match(
            key in proptest::collection::vec(any::<u8>(), 0..32),
            val in proptest::collection::vec(any::<u8>(), 0..32),
        ) {
            // If the search fixes the exact stored bytes, the masked
            // prefilter must accept the stored coordinate.
            let hasher = MaskHasher::new(vec![true, true]);
            let value = [Bytes::from(val.clone())];
            let coord = hasher.hash(&key, &value);
            let search = Search::new(2)
                .with_term(0, Bytes::from(key.clone()))
                .with_term(1, Bytes::from(val.clone()));
            let sc = hasher.hash_search(&search);
            prop_assert!(sc.matches_coord(coord));
        }

        #[test]
        fn interleave_is_deterministic(h1 in any::<u64>(), h2 in any::<u64>()) {
            prop_assert_eq!(interleave(&[h1, h2]), interleave(&[h1, h2]));
            prop_assert_eq!(interleave(&[h1]), h1);
        }
    }
}
