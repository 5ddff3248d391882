//! Search execution: streaming matches from a filtered snapshot.
//!
//! A search opens a point-in-time snapshot filtered by the hashing
//! coordinate of its equality terms, then streams one matching object
//! per `REQ_SEARCH_NEXT`. Every candidate passes two checks: the cheap
//! masked-coordinate prefilter and the precise byte comparison.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use hyperdex_config::Configuration;
use hyperdex_disk::Snapshot;
use hyperdex_hashing::{Search, SearchCoordinate};
use hyperdex_types::{EntityId, Instance, RegionId};
use hyperdex_wire::Payload;
use tracing::debug;

use crate::datalayer::DataLayer;
use crate::logical::Logical;

type SearchId = (RegionId, EntityId, u64);

struct SearchState {
    region: RegionId,
    inner: Mutex<SearchInner>,
}

struct SearchInner {
    snap: Snapshot,
    coord: SearchCoordinate,
    search: Search,
}

/// The search subsystem.
pub struct Searches {
    data: Arc<DataLayer>,
    comm: Arc<Logical>,
    config: RwLock<Arc<Configuration>>,
    searches: Mutex<HashMap<SearchId, Arc<SearchState>>>,
}

impl Searches {
    pub fn new(data: Arc<DataLayer>, comm: Arc<Logical>) -> Arc<Self> {
        Arc::new(Self {
            data,
            comm,
            config: RwLock::new(Arc::new(Configuration::default())),
            searches: Mutex::new(HashMap::new()),
        })
    }

    pub fn prepare(&self, _config: &Arc<Configuration>, _us: Instance) {}

    pub fn reconfigure(&self, config: &Arc<Configuration>, _us: Instance) {
        *self.config.write().expect("config lock") = Arc::clone(config);
    }

    pub fn cleanup(&self, _config: &Arc<Configuration>, _us: Instance) {}

    /// Opens a search and immediately streams its first match. A start
    /// for an already-live search id is ignored.
    pub fn start(&self, us: EntityId, client: EntityId, search_id: u64, nonce: u64, search: Search) {
        let region = us.region();
        let key = (region, client, search_id);
        {
            let searches = self.searches.lock().expect("searches lock");
            if searches.contains_key(&key) {
                return;
            }
        }

        let config = Arc::clone(&self.config.read().expect("config lock"));
        if !search.sanity_check(config.dimensions(us.space)) {
            debug!(%us, "dropping search which fails its sanity check");
            return;
        }
        let Some(hasher) = config.disk_hasher(us.subspace_id()) else {
            return;
        };
        let coord = hasher.hash_search(&search);
        let Some(snap) = self.data.make_snapshot(region, coord) else {
            debug!(%region, "dropping search for a region with no disk");
            return;
        };

        let state = Arc::new(SearchState {
            region,
            inner: Mutex::new(SearchInner { snap, coord, search }),
        });
        self.searches.lock().expect("searches lock").insert(key, state);
        self.next(us, client, search_id, nonce);
    }

    /// Streams the next match, or `RESP_SEARCH_DONE` on exhaustion.
    pub fn next(&self, us: EntityId, client: EntityId, search_id: u64, nonce: u64) {
        let key = (us.region(), client, search_id);
        let state = {
            let searches = self.searches.lock().expect("searches lock");
            match searches.get(&key) {
                Some(state) => Arc::clone(state),
                None => return,
            }
        };

        // Concurrent `next` calls on one search are serialized here.
        let mut inner = state.inner.lock().expect("search state lock");
        debug_assert_eq!(state.region, us.region());

        while inner.snap.valid() {
            let hit = inner.coord.matches_coord(inner.snap.coordinate())
                && inner.search.matches(inner.snap.key(), inner.snap.value());
            if hit {
                let payload = Payload::RespSearchItem {
                    nonce,
                    key: inner.snap.key().clone(),
                    value: inner.snap.value().to_vec(),
                };
                self.comm.send(us, client, &payload);
                inner.snap.next();
                return;
            }
            inner.snap.next();
        }

        self.comm.send(us, client, &Payload::RespSearchDone { nonce });
        drop(inner);
        self.stop(us, client, search_id);
    }

    /// Drops a search's state.
    pub fn stop(&self, us: EntityId, client: EntityId, search_id: u64) {
        self.searches
            .lock()
            .expect("searches lock")
            .remove(&(us.region(), client, search_id));
    }

    #[cfg(test)]
    pub(crate) fn live_searches(&self) -> usize {
        self.searches.lock().expect("searches lock").len()
    }
}
