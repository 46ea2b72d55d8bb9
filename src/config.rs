//! Per-instance runtime configuration
//!
//! Each cache instance owns one `InstanceConfig`. The knobs mirror the
//! runtime config surface (`HOPPER.CONFIG.GET` / `HOPPER.CONFIG.SET`):
//! backing-store settings, write-admission policy, and the ghost cache tick
//! schedule. Compile-level policy and calibration constants live alongside
//! as module constants.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Whether allocated network bandwidth covers both the client leg and the
/// backing-store leg. The host only meters the client leg, so this is purely
/// an allocator-side policy; it is read-only at runtime.
pub const ALLOC_TOTAL_NET_BW: bool = true;

/// Whether concurrent GET misses on one key are coalesced onto a single
/// backing-store fetch.
pub const ENABLE_INFLIGHT_DEDUP: bool = true;

/// Decay rate for the running average of key-value size
pub const KV_SIZE_DECAY_RATE: f64 = 0.99;

/// Mocked backing-store completion latency
pub const MOCK_STORE_LATENCY_SEC: f64 = 0.005;

/// Storage worker poll period when idle
pub const STORAGE_POLL_PERIOD_SEC: f64 = 0.001;

/// Ghost cache sampling shift: only keys whose hash carries this many
/// trailing zero bits enter the scaffold, so resident state is
/// `2^-GHOST_SAMPLE_SHIFT` of the working set.
pub const GHOST_SAMPLE_SHIFT: u32 = 5;

/// Calibration constants for the memory-cost heuristic used when turning
/// ghost tick counts into byte sizes.
///
/// The model is `total_memory = base_overhead + bytes_per_key * keys_count`
/// where `base_overhead = startup_allocated + clients_normal +
/// functions_caches + MEM_FIXED_OVERHEAD`. Very small caches carry extra
/// overhead that cannot be amortized per key, hence the small-cache knobs.
pub mod heuristic {
    pub const CALIB_FIXED: bool = true;
    pub const CALIB_ABNORMAL: bool = true;
    pub const CALIB_SMALL_CACHE: bool = false;

    /// Threshold below which `avg_kv_size` replaces memory stats for ticks
    pub const MIN_TOTAL_ALLOCATED: u64 = 20 * 1024 * 1024;
    pub const MAX_PER_KEY_OVERHEAD: u64 = 300;

    pub const MEM_FIXED_OVERHEAD: u64 = 1024 * 1024;
    pub const SMALL_CACHE_THRESHOLD: u64 = 4 * 1024 * 1024;
    pub const SMALL_CACHE_OVERHEAD: u64 = 2 * 1024 * 1024;
}

/// Backing-store settings (config names `dynamo.*`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamoConfig {
    /// `dynamo.table`: the table to read/write data
    pub table: String,

    /// `dynamo.mock`: if true, never touch the real backend and synthesize
    /// or image-serve completions instead
    pub mock: bool,
}

impl Default for DynamoConfig {
    fn default() -> Self {
        Self {
            table: "hare_table".to_string(),
            mock: false,
        }
    }
}

/// Cache-behavior settings (config names `cache.*`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// `cache.admit_write`: whether a SET on an absent key is admitted into
    /// the cache after the write-through. True means a freshly written value
    /// is expected to be read soon.
    pub admit_write: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { admit_write: true }
    }
}

/// Ghost cache tick schedule (config name `ghost.range`), in keys
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GhostRange {
    pub tick: u32,
    pub min_tick: u32,
    pub max_tick: u32,
}

impl Default for GhostRange {
    fn default() -> Self {
        Self {
            tick: 1 << 15,     // 32K keys
            min_tick: 1 << 15, // 32K keys
            max_tick: 1 << 20, // 1M keys
        }
    }
}

/// All per-instance runtime knobs
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub dynamo: DynamoConfig,
    pub cache: CacheConfig,
    pub ghost: GhostRange,
    /// Ghost checkpoint location
    pub dump_path: PathBuf,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            dynamo: DynamoConfig::default(),
            cache: CacheConfig::default(),
            ghost: GhostRange::default(),
            dump_path: PathBuf::from("dump.ghc"),
        }
    }
}

impl InstanceConfig {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = InstanceConfig::new();
        assert_eq!(config.dynamo.table, "hare_table");
        assert!(!config.dynamo.mock);
        assert!(config.cache.admit_write);
        assert_eq!(config.ghost.tick, 1 << 15);
        assert_eq!(config.ghost.max_tick, 1 << 20);
    }
}
