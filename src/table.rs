//! The host key/value table
//!
//! A byte-bounded LRU map holding the actual cached values. Each entry is
//! charged its predicted resident size (slab-rounded key and value plus the
//! fixed per-entry cost), and inserts evict from the cold end until the
//! charge fits under the capacity. Capacity 0 means unbounded.
//!
//! The table also produces the [`MemStats`] snapshot the miss-ratio report
//! consumes, with the process baseline folded into `startup_allocated`.

use std::collections::HashMap;

use bytes::Bytes;

use crate::ghost::mem_estimate;
use crate::stats::MemStats;

/// Baseline process footprint reported as `startup_allocated`
const STARTUP_ALLOCATED: u64 = 512 * 1024;

const NIL: usize = usize::MAX;

struct Entry {
    key: Vec<u8>,
    value: Bytes,
    charge: u64,
    prev: usize,
    next: usize,
}

pub struct Table {
    map: HashMap<Vec<u8>, usize>,
    entries: Vec<Entry>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    mem_used: u64,
    capacity: u64,
}

impl Table {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
            entries: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            mem_used: 0,
            capacity: 0,
        }
    }

    /// Look up a value and promote the entry
    pub fn get(&mut self, key: &[u8]) -> Option<Bytes> {
        let &idx = self.map.get(key)?;
        self.detach(idx);
        self.attach_head(idx);
        Some(self.entries[idx].value.clone())
    }

    /// Look up without touching recency
    pub fn peek(&self, key: &[u8]) -> Option<Bytes> {
        let &idx = self.map.get(key)?;
        Some(self.entries[idx].value.clone())
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.map.contains_key(key)
    }

    /// Insert or overwrite. `touch` controls whether the entry is promoted;
    /// a write that is not admitted as a read predictor leaves recency
    /// untouched.
    pub fn insert(&mut self, key: &[u8], value: Bytes, touch: bool) {
        let charge = mem_estimate::estimate(key.len() as u32, value.len() as u32) as u64;
        if let Some(&idx) = self.map.get(key) {
            self.mem_used = self.mem_used - self.entries[idx].charge + charge;
            self.entries[idx].value = value;
            self.entries[idx].charge = charge;
            if touch {
                self.detach(idx);
                self.attach_head(idx);
            }
        } else {
            let entry = Entry {
                key: key.to_vec(),
                value,
                charge,
                prev: NIL,
                next: NIL,
            };
            let idx = match self.free.pop() {
                Some(i) => {
                    self.entries[i] = entry;
                    i
                }
                None => {
                    self.entries.push(entry);
                    self.entries.len() - 1
                }
            };
            self.map.insert(key.to_vec(), idx);
            self.attach_head(idx);
            self.mem_used += charge;
        }
        self.evict_to_fit();
    }

    pub fn remove(&mut self, key: &[u8]) -> bool {
        match self.map.remove(key) {
            Some(idx) => {
                self.mem_used -= self.entries[idx].charge;
                self.detach(idx);
                self.entries[idx].value = Bytes::new();
                self.entries[idx].key.clear();
                self.free.push(idx);
                true
            }
            None => false,
        }
    }

    /// Set the byte cap (0 = unbounded) and evict immediately
    pub fn set_capacity(&mut self, capacity: u64) {
        self.capacity = capacity;
        self.evict_to_fit();
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn mem_used(&self) -> u64 {
        self.mem_used
    }

    pub fn mem_stats(&self, avg_kv_size: f64) -> MemStats {
        MemStats {
            total_allocated: STARTUP_ALLOCATED + self.mem_used,
            keys_count: self.map.len() as u64,
            startup_allocated: STARTUP_ALLOCATED,
            clients_normal: 0,
            functions_caches: 0,
            avg_kv_size,
        }
    }

    fn evict_to_fit(&mut self) {
        if self.capacity == 0 {
            return;
        }
        while self.mem_used > self.capacity && self.tail != NIL {
            let idx = self.tail;
            let key = std::mem::take(&mut self.entries[idx].key);
            self.map.remove(&key);
            self.mem_used -= self.entries[idx].charge;
            self.detach(idx);
            self.entries[idx].value = Bytes::new();
            self.free.push(idx);
        }
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = (self.entries[idx].prev, self.entries[idx].next);
        if prev != NIL {
            self.entries[prev].next = next;
        } else if self.head == idx {
            self.head = next;
        }
        if next != NIL {
            self.entries[next].prev = prev;
        } else if self.tail == idx {
            self.tail = prev;
        }
        self.entries[idx].prev = NIL;
        self.entries[idx].next = NIL;
    }

    fn attach_head(&mut self, idx: usize) {
        self.entries[idx].prev = NIL;
        self.entries[idx].next = self.head;
        if self.head != NIL {
            self.entries[self.head].prev = idx;
        } else {
            self.tail = idx;
        }
        self.head = idx;
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn val(n: usize) -> Bytes {
        Bytes::from(vec![b'v'; n])
    }

    #[test]
    fn test_insert_get_remove() {
        let mut t = Table::new();
        t.insert(b"a", val(10), true);
        assert_eq!(t.get(b"a").unwrap().len(), 10);
        assert!(t.contains(b"a"));
        assert!(t.remove(b"a"));
        assert!(!t.contains(b"a"));
        assert_eq!(t.mem_used(), 0);
    }

    #[test]
    fn test_overwrite_recharges() {
        let mut t = Table::new();
        t.insert(b"a", val(10), true);
        let small = t.mem_used();
        t.insert(b"a", val(5000), true);
        assert!(t.mem_used() > small);
        t.insert(b"a", val(10), true);
        assert_eq!(t.mem_used(), small);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_eviction_is_lru() {
        let mut t = Table::new();
        for k in [&b"a"[..], b"b", b"c", b"d"] {
            t.insert(k, val(100), true);
        }
        // touch "a" so "b" is coldest
        t.get(b"a");
        let per_entry = mem_estimate::estimate(1, 100) as u64;
        t.set_capacity(3 * per_entry);
        assert_eq!(t.len(), 3);
        assert!(!t.contains(b"b"));
        assert!(t.contains(b"a"));
        assert!(t.contains(b"d"));
    }

    #[test]
    fn test_insert_without_touch_keeps_cold() {
        let mut t = Table::new();
        t.insert(b"a", val(100), true);
        t.insert(b"b", val(100), true);
        // overwrite "a" without touching: it stays coldest
        t.insert(b"a", val(100), false);
        let per_entry = mem_estimate::estimate(1, 100) as u64;
        t.set_capacity(per_entry);
        assert_eq!(t.len(), 1);
        assert!(t.contains(b"b"));
    }

    #[test]
    fn test_zero_capacity_is_unbounded() {
        let mut t = Table::new();
        for i in 0..1000u32 {
            t.insert(&i.to_le_bytes(), val(100), true);
        }
        assert_eq!(t.len(), 1000);
    }

    #[test]
    fn test_mem_stats() {
        let mut t = Table::new();
        t.insert(b"a", val(100), true);
        let ms = t.mem_stats(100.0);
        assert_eq!(ms.keys_count, 1);
        assert_eq!(ms.total_allocated - ms.startup_allocated, t.mem_used());
    }
}
