//! Sampled ghost cache
//!
//! A memory-bounded scaffold that simulates LRU caches of many sizes at
//! once, without storing values. For a tick schedule
//! `{min_tick, min_tick + tick, ..., max_tick}` (in keys), each access is
//! scored as a hit at every tick whose LRU prefix would have contained the
//! key and as a miss below, which yields one miss-ratio sample per tick.
//!
//! Only keys whose hash carries `sample_shift` trailing zero bits enter the
//! scaffold, so resident state is a `2^-sample_shift` sample of the working
//! set; reported counters and sizes are scaled back up by `2^sample_shift`.
//!
//! Per-tick boundary handles keep every access O(#ticks): the boundary of a
//! tick is the node sitting at the tick's prefix edge, and a promotion only
//! shifts the boundaries of ticks whose prefix did not contain the key.

pub mod checkpoint;
pub mod mem_estimate;

use std::collections::HashMap;

use xxhash_rust::xxh32::xxh32;

use crate::config::GhostRange;
use crate::error::{Error, Result};

/// Hash family shared by sampling decisions and checkpoint headers.
///
/// Checkpoints embed a hash of a canonical string, so files produced by a
/// build with a different hash family are rejected at load.
pub fn ghost_hash(data: &[u8]) -> u32 {
    xxh32(data, 0)
}

/// How an access affects the per-tick hit/miss counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Update LRU state and score hit/miss at every tick
    Default,
    /// Update LRU state only (warm-up and checkpoint replay)
    Noop,
}

/// Hit/miss counters of one tick, in sampled units
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickStat {
    pub hit_cnt: u64,
    pub miss_cnt: u64,
}

/// One point of the cache-size/miss-ratio curve, scaled to full-population
/// units
#[derive(Debug, Clone, Copy)]
pub struct CurvePoint {
    /// Simulated cache size in keys
    pub count: u64,
    /// Estimated resident bytes of the simulated cache content
    pub size: u64,
    pub hit_cnt: u64,
    pub miss_cnt: u64,
}

const NIL: usize = usize::MAX;

struct Node {
    hash: u32,
    kv_size: u32,
    prev: usize,
    next: usize,
    /// Index of the smallest tick whose LRU prefix contains this node;
    /// `ticks.len()` when the node sits beyond every tick
    seg: u32,
}

/// Key-sampled multi-size LRU simulator
pub struct SampledGhostCache {
    sample_shift: u32,
    map: HashMap<u32, usize>,
    nodes: Vec<Node>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    len: usize,
    /// Tick sizes in sampled units, strictly ascending
    ticks: Vec<u32>,
    /// Node at each tick's prefix edge; NIL until the prefix fills up
    boundaries: Vec<usize>,
    stats: Vec<TickStat>,
    /// Resident-byte sum of each tick's prefix, in sampled units
    sizes: Vec<u64>,
}

/// Quantize a tick to the sampling granularity
pub fn round_tick(tick: u32, sample_shift: u32) -> u32 {
    (tick >> sample_shift) << sample_shift
}

impl SampledGhostCache {
    /// Build a scaffold for the given tick schedule (in keys). Ticks are
    /// quantized to the sampling granularity and the range is trimmed to a
    /// whole number of ticks.
    pub fn new(range: GhostRange, sample_shift: u32) -> Result<Self> {
        let tick = round_tick(range.tick, sample_shift);
        let min_tick = round_tick(range.min_tick, sample_shift);
        let mut max_tick = round_tick(range.max_tick, sample_shift);
        if tick == 0 || min_tick == 0 || max_tick < min_tick {
            return Err(Error::InvalidConfigValue("ghost.range"));
        }
        max_tick = min_tick + (max_tick - min_tick) / tick * tick;

        let mut ticks = Vec::new();
        let mut t = min_tick;
        while t <= max_tick {
            ticks.push(t >> sample_shift);
            t += tick;
        }
        let n = ticks.len();
        Ok(Self {
            sample_shift,
            map: HashMap::new(),
            nodes: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            len: 0,
            ticks,
            boundaries: vec![NIL; n],
            stats: vec![TickStat::default(); n],
            sizes: vec![0; n],
        })
    }

    /// Record an access by key. Unsampled keys are ignored entirely.
    pub fn access(&mut self, key: &[u8], kv_size: u32, mode: AccessMode) {
        let hash = ghost_hash(key);
        let mask = (1u32 << self.sample_shift) - 1;
        if hash & mask != 0 {
            return;
        }
        self.access_hashed(hash, kv_size, mode);
    }

    /// Record an access by pre-sampled hash (checkpoint replay)
    pub fn access_hashed(&mut self, hash: u32, kv_size: u32, mode: AccessMode) {
        if let Some(&idx) = self.map.get(&hash) {
            if mode == AccessMode::Default {
                let seg = self.nodes[idx].seg;
                for (i, st) in self.stats.iter_mut().enumerate() {
                    if (i as u32) >= seg {
                        st.hit_cnt += 1;
                    } else {
                        st.miss_cnt += 1;
                    }
                }
            }
            self.move_to_head(idx);
            self.set_kv_size(idx, kv_size);
        } else {
            if mode == AccessMode::Default {
                for st in self.stats.iter_mut() {
                    st.miss_cnt += 1;
                }
            }
            self.insert_head(hash, kv_size);
            if self.len > *self.ticks.last().unwrap() as usize {
                self.evict_tail();
            }
        }
    }

    /// Amend the tracked size of a key after a miss-fill reveals the value
    /// size. No LRU movement, no counter updates.
    pub fn update_size(&mut self, key: &[u8], kv_size: u32) {
        let hash = ghost_hash(key);
        let mask = (1u32 << self.sample_shift) - 1;
        if hash & mask != 0 {
            return;
        }
        if let Some(&idx) = self.map.get(&hash) {
            self.set_kv_size(idx, kv_size);
        }
    }

    /// Per-tick `(count, size, hit, miss)` for every fully materialized
    /// tick, scaled to full-population units
    pub fn cache_stat_curve(&self) -> Vec<CurvePoint> {
        let shift = self.sample_shift;
        self.ticks
            .iter()
            .enumerate()
            .take_while(|&(i, _)| self.boundaries[i] != NIL)
            .map(|(i, &t)| CurvePoint {
                count: (t as u64) << shift,
                size: self.sizes[i] << shift,
                hit_cnt: self.stats[i].hit_cnt << shift,
                miss_cnt: self.stats[i].miss_cnt << shift,
            })
            .collect()
    }

    /// Number of sampled keys resident in the scaffold
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn sample_shift(&self) -> u32 {
        self.sample_shift
    }

    /// Visit `(key_hash, kv_size)` pairs from least to most recently used
    pub fn for_each_lru(&self, mut f: impl FnMut(u32, u32)) {
        let mut idx = self.tail;
        while idx != NIL {
            let node = &self.nodes[idx];
            f(node.hash, node.kv_size);
            idx = node.prev;
        }
    }

    fn move_to_head(&mut self, idx: usize) {
        if self.head == idx {
            return;
        }
        let seg = self.nodes[idx].seg as usize;
        let kv = self.nodes[idx].kv_size as u64;

        // the node may itself sit on its segment's boundary
        if seg < self.ticks.len() && self.boundaries[seg] == idx {
            self.boundaries[seg] = self.nodes[idx].prev;
        }

        self.detach(idx);
        self.attach_head(idx);
        self.nodes[idx].seg = 0;

        // ticks whose prefix did not contain the node gain it at the front
        // and shed their old boundary node
        for i in 0..seg {
            let b = self.boundaries[i];
            self.sizes[i] = self.sizes[i] - self.nodes[b].kv_size as u64 + kv;
            self.nodes[b].seg = i as u32 + 1;
            self.boundaries[i] = if self.nodes[b].prev == idx {
                idx
            } else {
                self.nodes[b].prev
            };
        }
    }

    fn insert_head(&mut self, hash: u32, kv_size: u32) {
        let idx = match self.free.pop() {
            Some(i) => {
                self.nodes[i] = Node {
                    hash,
                    kv_size,
                    prev: NIL,
                    next: NIL,
                    seg: 0,
                };
                i
            }
            None => {
                self.nodes.push(Node {
                    hash,
                    kv_size,
                    prev: NIL,
                    next: NIL,
                    seg: 0,
                });
                self.nodes.len() - 1
            }
        };
        self.map.insert(hash, idx);
        self.attach_head(idx);
        self.len += 1;

        let kv = kv_size as u64;
        for i in 0..self.ticks.len() {
            let b = self.boundaries[i];
            if b != NIL {
                // prefix was full: it gains the new node and sheds its edge
                self.sizes[i] = self.sizes[i] - self.nodes[b].kv_size as u64 + kv;
                self.nodes[b].seg = i as u32 + 1;
                self.boundaries[i] = if self.nodes[b].prev == idx {
                    idx
                } else {
                    self.nodes[b].prev
                };
            } else {
                self.sizes[i] += kv;
                if self.len == self.ticks[i] as usize {
                    self.boundaries[i] = self.tail;
                }
            }
        }
    }

    fn evict_tail(&mut self) {
        debug_assert!(self.len > *self.ticks.last().unwrap() as usize);
        let idx = self.tail;
        let hash = self.nodes[idx].hash;
        self.map.remove(&hash);
        self.detach(idx);
        self.free.push(idx);
        self.len -= 1;
    }

    fn set_kv_size(&mut self, idx: usize, kv_size: u32) {
        let old = self.nodes[idx].kv_size;
        if old == kv_size {
            return;
        }
        self.nodes[idx].kv_size = kv_size;
        let seg = self.nodes[idx].seg as usize;
        for i in seg..self.ticks.len() {
            self.sizes[i] = self.sizes[i] - old as u64 + kv_size as u64;
        }
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        if prev != NIL {
            self.nodes[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next].prev = prev;
        } else {
            self.tail = prev;
        }
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = NIL;
    }

    fn attach_head(&mut self, idx: usize) {
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = self.head;
        if self.head != NIL {
            self.nodes[self.head].prev = idx;
        } else {
            self.tail = idx;
        }
        self.head = idx;
    }

    #[cfg(test)]
    fn tick_stats(&self) -> &[TickStat] {
        &self.stats
    }
}
