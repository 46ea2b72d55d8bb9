//! The per-tenant cache instance
//!
//! One `CacheInstance` bundles everything a tenant owns: the value table,
//! the sampled ghost cache, request statistics, the inflight table, the
//! client-network limiter, and the storage adapter with its worker. All of
//! the module-wide state the engine needs lives in this context object, so
//! several instances can share a process.
//!
//! Request flow:
//!
//! ```text
//! get ──► table hit ──► reply, ghost access, stats, client-net gate
//!     └─► miss ──► inflight? ──► attach as dependent, park
//!                └─► begin generation, queue fetch, park
//!                    completion: end generation, fill table + ghost,
//!                    fan value out to dependents, stats, net gate
//! set ──► table write + inflight invalidate ──► ghost (no counters),
//!         stats, net gate ──► queue write-through, park
//!         on backend error: roll the table write back
//! ```
//!
//! Threading: request threads block on oneshot completions; the storage
//! worker and backend callbacks never touch the instance lock. Ordering per
//! key holds because a SET writes the table before it invalidates the
//! inflight generation, both under the instance lock.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::barrier::Barrier;
use crate::config::{GhostRange, InstanceConfig, ALLOC_TOTAL_NET_BW, GHOST_SAMPLE_SHIFT};
use crate::error::{CheckpointError, Error, Result, StorageError};
use crate::ghost::{checkpoint, mem_estimate, AccessMode, SampledGhostCache};
use crate::rate::{RateLimiter, SingleThreadProgress};
use crate::stats::{self, build_mrc_report, MrcReport, RequestStats};
use crate::storage::{StorageAdapter, StorageBackend};
use crate::table::Table;
use crate::task::{GetTask, SetTask};
use crate::inflight::InflightTable;

/// Caps currently applied by the resource controller
#[derive(Debug, Clone, Copy, Default)]
pub struct ResrcCaps {
    pub cache_size: u64,
    pub db_rcu: f64,
    pub db_wcu: f64,
    pub net_bw: f64,
}

struct Inner {
    table: Table,
    ghost: SampledGhostCache,
    stats: RequestStats,
    inflight: InflightTable,
    net_limiter: RateLimiter<SingleThreadProgress>,
}

pub struct CacheInstance {
    inner: Mutex<Inner>,
    storage: StorageAdapter,
    config: RwLock<InstanceConfig>,
    caps: Mutex<ResrcCaps>,
    barrier: Barrier,
    dump_path: PathBuf,
}

impl CacheInstance {
    /// Build an instance and attempt a best-effort ghost checkpoint load.
    /// A missing checkpoint is fine; an incompatible one is an error.
    pub fn new(
        config: InstanceConfig,
        backend: Option<Arc<dyn StorageBackend>>,
    ) -> Result<Self> {
        let mut ghost = SampledGhostCache::new(config.ghost, GHOST_SAMPLE_SHIFT)?;
        match checkpoint::load(&mut ghost, &config.dump_path) {
            Ok(()) => debug!(len = ghost.len(), "ghost checkpoint restored"),
            Err(CheckpointError::Io(_)) => {}
            Err(e @ CheckpointError::Incompatible) => {
                warn!("incompatible ghost checkpoint; refusing to start with it");
                return Err(e.into());
            }
        }

        let storage = StorageAdapter::new(config.dynamo.clone(), backend);
        let dump_path = config.dump_path.clone();
        Ok(Self {
            inner: Mutex::new(Inner {
                table: Table::new(),
                ghost,
                stats: RequestStats::default(),
                inflight: InflightTable::new(),
                net_limiter: RateLimiter::new(1_000_000_000.0),
            }),
            storage,
            config: RwLock::new(config),
            caps: Mutex::new(ResrcCaps::default()),
            barrier: Barrier::new(),
            dump_path,
        })
    }

    /// Serve a read: from memory, or through the backing store on a miss
    /// with inflight deduplication. Blocks the calling client until the
    /// value (or a backend error) is available.
    pub fn get(&self, key: &[u8]) -> Result<Bytes> {
        let mut inner = self.inner.lock();

        if let Some(value) = inner.table.get(key) {
            let est = mem_estimate::estimate(key.len() as u32, value.len() as u32);
            inner.ghost.access(key, est, AccessMode::Default);
            inner
                .stats
                .record_get_done(key.len(), value.len(), false, ALLOC_TOTAL_NET_BW);
            Self::wait_until_can_send(&inner);
            inner
                .net_limiter
                .consume(stats::kv_to_net_get_client(key.len(), value.len()));
            return Ok(value);
        }

        // miss: the real kv size is only known at completion
        let est = mem_estimate::estimate(key.len() as u32, 0);
        inner.ghost.access(key, est, AccessMode::Default);

        if inner.inflight.check(key) {
            // ride the existing fetch instead of issuing another
            let (tx, rx) = oneshot::channel();
            inner.inflight.add_dependent(key, tx);
            drop(inner);

            let value = match rx.blocking_recv() {
                Ok(Ok(value)) => value,
                Ok(Err(msg)) => return Err(StorageError::Get(msg).into()),
                Err(_) => return Err(StorageError::WorkerGone.into()),
            };

            // the owning fetch populated the cache; this client only
            // settles its own accounting
            let mut inner = self.inner.lock();
            inner
                .stats
                .record_get_done(key.len(), value.len(), false, ALLOC_TOTAL_NET_BW);
            Self::wait_until_can_send(&inner);
            inner
                .net_limiter
                .consume(stats::kv_to_net_get_client(key.len(), value.len()));
            return Ok(value);
        }

        let key_bytes = Bytes::copy_from_slice(key);
        let generation = inner.inflight.begin(key_bytes.clone());
        let (tx, rx) = oneshot::channel();
        drop(inner);

        self.storage.get_async(GetTask {
            key: key_bytes,
            done: tx,
        });

        let result = match rx.blocking_recv() {
            Ok(result) => result,
            Err(_) => {
                let mut inner = self.inner.lock();
                let _ = inner.inflight.end(key, &generation);
                return Err(StorageError::WorkerGone.into());
            }
        };

        let mut inner = self.inner.lock();
        let outcome = inner.inflight.end(key, &generation);

        match result {
            Ok(value) => {
                if outcome.update_cache {
                    inner.table.insert(key, value.clone(), true);
                    let est = mem_estimate::estimate(key.len() as u32, value.len() as u32);
                    inner.ghost.update_size(key, est);
                }
                // else: a concurrent SET made this value stale; leave the
                // cache alone but still serve the fetched value

                for dep in outcome.dependents {
                    let _ = dep.send(Ok(value.clone()));
                }

                inner
                    .stats
                    .record_get_done(key.len(), value.len(), true, ALLOC_TOTAL_NET_BW);

                let mut consumption = stats::kv_to_net_get_client(key.len(), value.len());
                if ALLOC_TOTAL_NET_BW {
                    consumption += stats::kv_to_net_get_storage(key.len(), value.len());
                }
                Self::wait_until_can_send(&inner);
                inner.net_limiter.consume(consumption);
                Ok(value)
            }
            Err(msg) => {
                // the prepaid RCU stays consumed
                for dep in outcome.dependents {
                    let _ = dep.send(Err(msg.clone()));
                }
                Err(StorageError::Get(msg).into())
            }
        }
    }

    /// Write-through SET. The in-memory value is updated first (making any
    /// inflight fetch stale), then the write is pushed to the backing
    /// store. A backend failure rolls the in-memory write back: eventual
    /// consistency over cache availability.
    pub fn set(&self, key: &[u8], value: Bytes) -> Result<()> {
        let admit_write = self.config.read().cache.admit_write;
        let mut inner = self.inner.lock();

        if inner.table.contains(key) {
            // overwrite for cache coherence; recency moves only when
            // writes are admitted as read predictors
            inner.table.insert(key, value.clone(), admit_write);
            inner.inflight.invalidate(key);
        } else if admit_write {
            inner.table.insert(key, value.clone(), true);
            inner.inflight.invalidate(key);
        }

        let est = mem_estimate::estimate(key.len() as u32, value.len() as u32);
        inner.ghost.access(key, est, AccessMode::Noop);
        inner
            .stats
            .record_set_done(key.len(), value.len(), ALLOC_TOTAL_NET_BW, admit_write);

        let mut consumption = stats::kv_to_net_set_client(key.len(), value.len());
        if ALLOC_TOTAL_NET_BW {
            consumption += stats::kv_to_net_set_storage(key.len(), value.len());
        }
        Self::wait_until_can_send(&inner);
        inner.net_limiter.consume(consumption);

        let (tx, rx) = oneshot::channel();
        let key_bytes = Bytes::copy_from_slice(key);
        drop(inner);

        self.storage.set_async(SetTask {
            key: key_bytes,
            value,
            done: tx,
        });

        match rx.blocking_recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(msg)) => {
                // roll back so a reader cannot keep seeing a value the
                // backing store never accepted
                self.inner.lock().table.remove(key);
                Err(StorageError::Put(msg).into())
            }
            Err(_) => {
                self.inner.lock().table.remove(key);
                Err(StorageError::WorkerGone.into())
            }
        }
    }

    /// Cache-only SET used for warm-up: updates the table and the ghost
    /// LRU, but records no stats and consumes no rate budget.
    pub fn setc(&self, key: &[u8], value: Bytes) -> Result<()> {
        let mut inner = self.inner.lock();
        let est = mem_estimate::estimate(key.len() as u32, value.len() as u32);
        inner.table.insert(key, value, true);
        inner.ghost.access(key, est, AccessMode::Noop);
        Ok(())
    }

    /// Bulk warm-up from a CSV image: `key,val_size` header, one
    /// `<key>,<int>` row per entry; the value is synthesized filler.
    pub fn load(&self, path: &std::path::Path) -> Result<()> {
        use std::io::BufRead;
        let f = std::io::BufReader::new(std::fs::File::open(path)?);
        let mut lines = f.lines();

        let header = lines.next().transpose()?.unwrap_or_default();
        if header != "key,val_size" {
            return Err(Error::Parse("invalid image file format".into()));
        }

        for line in lines {
            let line = line?;
            let (key, val_size_str) = line
                .split_once(',')
                .ok_or_else(|| Error::Parse("invalid image file format".into()))?;
            let val_size: usize = val_size_str
                .trim()
                .parse()
                .map_err(|_| Error::Parse("invalid image file format".into()))?;
            self.setc(key.as_bytes(), Bytes::from(vec![b'v'; val_size]))?;
        }
        Ok(())
    }

    /// Snapshot the request counters and the miss-ratio report
    pub fn stats_report(&self) -> (RequestStats, Option<MrcReport>) {
        let inner = self.inner.lock();
        let snapshot = inner.stats.clone();
        let mem = inner.table.mem_stats(snapshot.avg_kv_size);
        let curve = inner.ghost.cache_stat_curve();
        let report = build_mrc_report(&mem, &curve);
        (snapshot, report)
    }

    /// Current caps as applied by the resource controller
    pub fn resrc_get(&self) -> ResrcCaps {
        *self.caps.lock()
    }

    /// Apply new caps; a negative field means "do not change". The cache
    /// cap evicts immediately; the rate caps take effect at the next
    /// limiter frame.
    pub fn resrc_set(&self, cache_size: i64, db_rcu: f64, db_wcu: f64, net_bw: f64) {
        let mut caps = self.caps.lock();
        if cache_size >= 0 {
            self.inner.lock().table.set_capacity(cache_size as u64);
            caps.cache_size = cache_size as u64;
        }
        if db_rcu >= 0.0 {
            self.storage.set_rcu_limit(db_rcu);
            caps.db_rcu = db_rcu;
        }
        if db_wcu >= 0.0 {
            self.storage.set_wcu_limit(db_wcu);
            caps.db_wcu = db_wcu;
        }
        if net_bw >= 0.0 {
            self.inner.lock().net_limiter.propose_new_rate(net_bw);
            caps.net_bw = net_bw;
        }
    }

    /// Persist the ghost scaffold to the configured dump path
    pub fn ghost_save(&self) -> Result<()> {
        let inner = self.inner.lock();
        checkpoint::save(&inner.ghost, &self.dump_path)?;
        Ok(())
    }

    /// Restore the ghost scaffold from the configured dump path
    pub fn ghost_load(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        checkpoint::load(&mut inner.ghost, &self.dump_path)?;
        Ok(())
    }

    /// Reconfigure the tick schedule. The old scaffold is dropped and a
    /// fresh one built, with a best-effort checkpoint restore on top.
    pub fn set_ghost_range(&self, range: GhostRange) -> Result<()> {
        let mut ghost = SampledGhostCache::new(range, GHOST_SAMPLE_SHIFT)?;
        match checkpoint::load(&mut ghost, &self.dump_path) {
            Ok(()) | Err(CheckpointError::Io(_)) => {}
            Err(e @ CheckpointError::Incompatible) => return Err(e.into()),
        }
        self.inner.lock().ghost = ghost;
        self.config.write().ghost = range;
        Ok(())
    }

    pub fn ghost_range(&self) -> GhostRange {
        self.config.read().ghost
    }

    pub fn admit_write(&self) -> bool {
        self.config.read().cache.admit_write
    }

    pub fn set_admit_write(&self, admit: bool) {
        self.config.write().cache.admit_write = admit;
    }

    pub fn storage(&self) -> &StorageAdapter {
        &self.storage
    }

    pub fn barrier(&self) -> &Barrier {
        &self.barrier
    }

    /// Number of resident keys, for tests and introspection
    pub fn keys_count(&self) -> usize {
        self.inner.lock().table.len()
    }

    fn wait_until_can_send(inner: &Inner) {
        // throttling the client leg means parking the serving thread; with
        // one tenant per instance that is exactly the intended backpressure
        let wait = inner.net_limiter.check_wait_time();
        if wait > 0.0 && wait.is_finite() {
            std::thread::sleep(std::time::Duration::from_secs_f64(wait));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DynamoConfig;

    fn mock_instance() -> (CacheInstance, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = InstanceConfig {
            dynamo: DynamoConfig {
                table: "t".into(),
                mock: true,
            },
            dump_path: dir.path().join("dump.ghc"),
            ..InstanceConfig::new()
        };
        (CacheInstance::new(config, None).unwrap(), dir)
    }

    #[test]
    fn test_miss_fills_then_hits() {
        let (inst, _dir) = mock_instance();
        let key = b"K0000000007s016L";
        let v1 = inst.get(key).unwrap();
        assert_eq!(v1.len(), 500);
        assert_eq!(inst.keys_count(), 1);

        let v2 = inst.get(key).unwrap();
        assert_eq!(v1, v2);

        let (stats, _) = inst.stats_report();
        assert_eq!(stats.miss_cnt, 1);
        assert_eq!(stats.hit_cnt, 1);
    }

    #[test]
    fn test_set_then_get_serves_written_value() {
        let (inst, _dir) = mock_instance();
        inst.set(b"K0000000001s016L", Bytes::from_static(b"hello")).unwrap();
        let v = inst.get(b"K0000000001s016L").unwrap();
        assert_eq!(&v[..], b"hello");
    }

    #[test]
    fn test_unadmitted_set_skips_cache() {
        let (inst, _dir) = mock_instance();
        inst.set_admit_write(false);
        inst.set(b"K0000000002s016L", Bytes::from_static(b"hello")).unwrap();
        assert_eq!(inst.keys_count(), 0);
        // the read-through still works and fills the cache
        let v = inst.get(b"K0000000002s016L").unwrap();
        assert_eq!(v.len(), 500);
        assert_eq!(inst.keys_count(), 1);
    }

    #[test]
    fn test_setc_is_cache_only() {
        let (inst, _dir) = mock_instance();
        inst.setc(b"warm", Bytes::from_static(b"value")).unwrap();
        assert_eq!(inst.keys_count(), 1);
        let (stats, _) = inst.stats_report();
        assert_eq!(stats.req_cnt, 0);
    }

    #[test]
    fn test_resrc_caps_roundtrip_and_skip() {
        let (inst, _dir) = mock_instance();
        inst.resrc_set(1 << 20, 100.0, 50.0, 8192.0);
        let caps = inst.resrc_get();
        assert_eq!(caps.cache_size, 1 << 20);
        assert_eq!(caps.db_rcu, 100.0);

        inst.resrc_set(-1, -1.0, 75.0, -1.0);
        let caps = inst.resrc_get();
        assert_eq!(caps.cache_size, 1 << 20);
        assert_eq!(caps.db_rcu, 100.0);
        assert_eq!(caps.db_wcu, 75.0);
    }
}
