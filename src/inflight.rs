//! Inflight request deduplication
//!
//! An inflight entry represents one GET that has been routed to the backing
//! store but has not completed. Later GETs on the same key attach to it as
//! dependents instead of issuing their own fetch, and every attached client
//! receives the same value when the fetch lands.
//!
//! `end` and `invalidate` look similar but differ in meaning: `end` is
//! called by the GET that began the generation, while `invalidate` is called
//! by a SET that has just updated the cached value, marking the generation
//! stale so its completion must not overwrite the newer write. Dependents of
//! a stale generation still receive the stale value on unblock; the
//! write-through keeps the backing store eventually consistent.
//!
//! A key can run through many generations: one inflight may be invalidated,
//! the key evicted, and a fresh miss may begin a second generation while the
//! first is still in the air.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::config::ENABLE_INFLIGHT_DEDUP;
use crate::task::GetResult;

struct Generation {
    stale: bool,
    dependents: Vec<oneshot::Sender<GetResult>>,
}

/// Shared handle to one inflight generation; the owning task carries a
/// clone so dependents survive invalidation and eviction of the map entry.
#[derive(Clone)]
pub struct InflightRef(Arc<Mutex<Generation>>);

impl InflightRef {
    fn same_generation(&self, other: &InflightRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// What the owner does with a completed fetch
pub struct EndOutcome {
    /// False when a SET invalidated this generation: do not touch the cache
    pub update_cache: bool,
    /// Every client blocked on this generation
    pub dependents: Vec<oneshot::Sender<GetResult>>,
}

/// Per-key inflight table; at most one live generation per key
#[derive(Default)]
pub struct InflightTable {
    map: HashMap<Bytes, InflightRef>,
}

impl InflightTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a GET on `key` should attach instead of fetching
    pub fn check(&self, key: &[u8]) -> bool {
        if !ENABLE_INFLIGHT_DEDUP {
            return false;
        }
        self.map.contains_key(key)
    }

    /// Start a generation; only valid when `check` returned false
    pub fn begin(&mut self, key: Bytes) -> InflightRef {
        debug_assert!(!self.map.contains_key(&key));
        let r = InflightRef(Arc::new(Mutex::new(Generation {
            stale: false,
            dependents: Vec::new(),
        })));
        if ENABLE_INFLIGHT_DEDUP {
            self.map.insert(key, r.clone());
        }
        r
    }

    /// Attach a blocked client; only valid when `check` returned true
    pub fn add_dependent(&mut self, key: &[u8], waiter: oneshot::Sender<GetResult>) {
        let entry = self.map.get(key).expect("inflight entry present");
        entry.0.lock().dependents.push(waiter);
    }

    /// Finish a generation from its owner. The cache may only be updated
    /// when the mapped entry still is this generation.
    pub fn end(&mut self, key: &[u8], generation: &InflightRef) -> EndOutcome {
        if let Some(mapped) = self.map.get(key) {
            if mapped.same_generation(generation) {
                self.map.remove(key);
            }
        }
        let mut inner = generation.0.lock();
        EndOutcome {
            // with dedup disabled there is no invalidation to respect
            update_cache: !ENABLE_INFLIGHT_DEDUP || !inner.stale,
            dependents: std::mem::take(&mut inner.dependents),
        }
    }

    /// Mark any live generation stale; called by SET after the table write
    pub fn invalidate(&mut self, key: &[u8]) {
        if !ENABLE_INFLIGHT_DEDUP {
            return;
        }
        if let Some(entry) = self.map.remove(key) {
            entry.0.lock().stale = true;
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
