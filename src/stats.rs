//! Request statistics and miss-ratio reporting
//!
//! Counters feed two consumers: the `HOPPER.STATS` reply, and the allocator,
//! which reads the hypothetical `*_if_miss` / `*_if_hit` companions as the
//! tenant's demand vector. The miss-ratio report glues host memory stats to
//! the ghost cache curve via a bytes-per-key estimate.

use serde::Serialize;

use crate::config::{heuristic, KV_SIZE_DECAY_RATE};
use crate::ghost::CurvePoint;

/// Read cost in backing-store read capacity units. The divisor approximates
/// item-size accounting and intentionally diverges from the store's exact
/// pricing for items spanning multiple units.
pub fn kv_to_rcu(key_size: usize, val_size: usize) -> u64 {
    ((key_size + val_size) / 4096 + 1) as u64
}

/// Write cost in backing-store write capacity units
pub fn kv_to_wcu(key_size: usize, val_size: usize) -> u64 {
    ((key_size + val_size) / 1024 + 1) as u64
}

/// Client-leg network bytes for a GET
pub fn kv_to_net_get_client(key_size: usize, val_size: usize) -> u64 {
    (key_size + val_size) as u64
}

/// Client-leg network bytes for a SET
pub fn kv_to_net_set_client(key_size: usize, val_size: usize) -> u64 {
    (key_size + val_size) as u64
}

/// Store-leg network bytes for a GET; the store returns whole items, so
/// both key and value travel
pub fn kv_to_net_get_storage(key_size: usize, val_size: usize) -> u64 {
    (key_size + val_size) as u64
}

/// Store-leg network bytes for a SET
pub fn kv_to_net_set_storage(key_size: usize, val_size: usize) -> u64 {
    (key_size + val_size) as u64
}

/// Monotone per-instance request counters
#[derive(Debug, Default, Clone, Serialize)]
pub struct RequestStats {
    /// All GET and SET requests
    pub req_cnt: u64,
    /// GET only
    pub hit_cnt: u64,
    /// GET only
    pub miss_cnt: u64,

    // demand-vector companions
    pub db_rcu_consump_if_miss: u64,
    pub net_bw_consump_if_miss: u64,
    pub net_bw_consump_if_hit: u64,

    // realized consumption
    pub db_rcu_consump: u64,
    pub db_wcu_consump: u64,
    pub net_bw_consump: u64,

    /// Running average of key-value size, used to spot abnormal per-key
    /// memory overhead
    pub avg_kv_size: f64,
}

impl RequestStats {
    pub fn record_get_done(
        &mut self,
        key_size: usize,
        val_size: usize,
        is_miss: bool,
        alloc_total_net_bw: bool,
    ) {
        self.req_cnt += 1;
        if is_miss {
            self.miss_cnt += 1;
        } else {
            self.hit_cnt += 1;
        }

        let db_rcu = kv_to_rcu(key_size, val_size);
        self.db_rcu_consump_if_miss += db_rcu;
        if is_miss {
            self.db_rcu_consump += db_rcu;
        }

        let net_bw_client = kv_to_net_get_client(key_size, val_size);
        self.net_bw_consump_if_miss += net_bw_client;
        self.net_bw_consump_if_hit += net_bw_client;
        self.net_bw_consump += net_bw_client;

        if alloc_total_net_bw {
            let net_bw_storage = kv_to_net_get_storage(key_size, val_size);
            self.net_bw_consump_if_miss += net_bw_storage;
            // a hit never reaches the store: net_bw_consump_if_hit += 0
            if is_miss {
                self.net_bw_consump += net_bw_storage;
            }
        }

        self.update_avg_kv_size(key_size + val_size);
    }

    pub fn record_set_done(
        &mut self,
        key_size: usize,
        val_size: usize,
        alloc_total_net_bw: bool,
        admit_write: bool,
    ) {
        self.req_cnt += 1;
        self.db_wcu_consump += kv_to_wcu(key_size, val_size);

        let net_bw_client = kv_to_net_set_client(key_size, val_size);
        self.net_bw_consump_if_miss += net_bw_client;
        self.net_bw_consump_if_hit += net_bw_client;
        self.net_bw_consump += net_bw_client;

        if alloc_total_net_bw {
            let net_bw_storage = kv_to_net_set_storage(key_size, val_size);
            self.net_bw_consump_if_miss += net_bw_storage;
            self.net_bw_consump_if_hit += net_bw_storage;
            self.net_bw_consump += net_bw_storage;
        }

        // only admitted writes shape the resident-size average
        if admit_write {
            self.update_avg_kv_size(key_size + val_size);
        }
    }

    fn update_avg_kv_size(&mut self, curr_kv_size: usize) {
        let curr = curr_kv_size as f64;
        self.avg_kv_size = if self.avg_kv_size != 0.0 {
            self.avg_kv_size * KV_SIZE_DECAY_RATE + curr * (1.0 - KV_SIZE_DECAY_RATE)
        } else {
            curr
        };
    }
}

/// Host memory snapshot for the miss-ratio report
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct MemStats {
    pub total_allocated: u64,
    pub keys_count: u64,
    pub startup_allocated: u64,
    pub clients_normal: u64,
    pub functions_caches: u64,
    pub avg_kv_size: f64,
}

/// Per-tick miss-ratio data for the allocator, in bytes.
///
/// `ticks[0]` is the estimated startup footprint with `miss_cnt[0]` holding
/// the total access count, so the curve starts at miss ratio 1.
#[derive(Debug, Clone, Serialize)]
pub struct MrcReport {
    pub ticks: Vec<u64>,
    pub hit_cnt: Vec<u64>,
    pub miss_cnt: Vec<u64>,
}

/// Combine host memory stats with the ghost curve.
///
/// Returns `None` until there is at least one resident key and one fully
/// materialized ghost tick.
pub fn build_mrc_report(ms: &MemStats, curve: &[CurvePoint]) -> Option<MrcReport> {
    if ms.keys_count == 0 || curve.is_empty() {
        return None;
    }

    let mut bytes_startup = ms.startup_allocated + ms.clients_normal + ms.functions_caches;
    if heuristic::CALIB_SMALL_CACHE
        && ms.total_allocated - bytes_startup < heuristic::SMALL_CACHE_THRESHOLD
    {
        // guard against underflow
        if bytes_startup + heuristic::SMALL_CACHE_OVERHEAD < ms.total_allocated {
            bytes_startup += heuristic::SMALL_CACHE_OVERHEAD;
        }
    } else if heuristic::CALIB_FIXED {
        // guard against underflow
        if bytes_startup + heuristic::MEM_FIXED_OVERHEAD < ms.total_allocated {
            bytes_startup += heuristic::MEM_FIXED_OVERHEAD;
        }
    }

    let mut bytes_per_key = (ms.total_allocated - bytes_startup) as f64 / ms.keys_count as f64;

    if heuristic::CALIB_ABNORMAL
        && ms.total_allocated < heuristic::MIN_TOTAL_ALLOCATED
        && bytes_per_key > ms.avg_kv_size + heuristic::MAX_PER_KEY_OVERHEAD as f64
    {
        // fall back to the observed average for calibration
        bytes_per_key = ms.avg_kv_size + heuristic::MAX_PER_KEY_OVERHEAD as f64;
        bytes_startup = ms.total_allocated - (bytes_per_key * ms.keys_count as f64) as u64;
    }

    let acc_cnt = curve[0].hit_cnt + curve[0].miss_cnt;
    // memory amplification: resident bytes per key over the raw kv bytes the
    // ghost tracks per key, taken at the curve point nearest the population
    let mut mem_amplify = bytes_per_key / (curve[0].size as f64 / curve[0].count as f64);
    for p in curve {
        if ms.keys_count > p.count {
            break;
        }
        mem_amplify = bytes_per_key / (p.size as f64 / p.count as f64);
    }

    let mut ticks = Vec::with_capacity(curve.len() + 1);
    let mut hit_cnt = Vec::with_capacity(curve.len() + 1);
    let mut miss_cnt = Vec::with_capacity(curve.len() + 1);
    ticks.push(bytes_startup);
    hit_cnt.push(0);
    miss_cnt.push(acc_cnt);
    for p in curve {
        let data_mem = p.size as f64 * mem_amplify;
        let mut mem = data_mem as u64 + bytes_startup;
        if heuristic::CALIB_SMALL_CACHE && (data_mem as u64) < heuristic::SMALL_CACHE_THRESHOLD {
            // replace the fixed overhead (if any) with the small-cache one
            mem += heuristic::SMALL_CACHE_OVERHEAD;
            if heuristic::CALIB_FIXED {
                mem -= heuristic::MEM_FIXED_OVERHEAD;
            }
        }
        ticks.push(mem);
        hit_cnt.push(p.hit_cnt);
        miss_cnt.push(p.miss_cnt);
    }

    Some(MrcReport {
        ticks,
        hit_cnt,
        miss_cnt,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_costs() {
        assert_eq!(kv_to_rcu(16, 500), 1);
        assert_eq!(kv_to_rcu(16, 5000), 2);
        assert_eq!(kv_to_wcu(16, 500), 1);
        assert_eq!(kv_to_wcu(16, 1500), 2);
        assert_eq!(kv_to_net_get_client(16, 500), 516);
    }

    #[test]
    fn test_get_accounting() {
        let mut s = RequestStats::default();
        s.record_get_done(16, 100, false, true);
        assert_eq!(s.req_cnt, 1);
        assert_eq!(s.hit_cnt, 1);
        assert_eq!(s.miss_cnt, 0);
        assert_eq!(s.db_rcu_consump, 0);
        assert_eq!(s.db_rcu_consump_if_miss, 1);
        // hit consumes the client leg only
        assert_eq!(s.net_bw_consump, 116);
        assert_eq!(s.net_bw_consump_if_miss, 232);

        s.record_get_done(16, 100, true, true);
        assert_eq!(s.miss_cnt, 1);
        assert_eq!(s.db_rcu_consump, 1);
        assert_eq!(s.net_bw_consump, 116 + 232);
    }

    #[test]
    fn test_set_accounting() {
        let mut s = RequestStats::default();
        s.record_set_done(16, 1500, true, true);
        assert_eq!(s.req_cnt, 1);
        assert_eq!(s.hit_cnt + s.miss_cnt, 0);
        assert_eq!(s.db_wcu_consump, 2);
        assert_eq!(s.net_bw_consump, 2 * 1516);
        assert_eq!(s.net_bw_consump_if_hit, 2 * 1516);
    }

    #[test]
    fn test_avg_kv_size_seeds_then_decays() {
        let mut s = RequestStats::default();
        s.record_get_done(10, 90, false, false);
        assert_eq!(s.avg_kv_size, 100.0);
        s.record_get_done(10, 190, false, false);
        let expected = 100.0 * KV_SIZE_DECAY_RATE + 200.0 * (1.0 - KV_SIZE_DECAY_RATE);
        assert!((s.avg_kv_size - expected).abs() < 1e-9);
    }

    #[test]
    fn test_avg_kv_size_skips_unadmitted_sets() {
        let mut s = RequestStats::default();
        s.record_set_done(10, 90, false, false);
        assert_eq!(s.avg_kv_size, 0.0);
    }

    #[test]
    fn test_report_needs_data() {
        let ms = MemStats::default();
        assert!(build_mrc_report(&ms, &[]).is_none());
    }

    #[test]
    fn test_report_shape() {
        let ms = MemStats {
            total_allocated: 50 * 1024 * 1024,
            keys_count: 1000,
            startup_allocated: 1024 * 1024,
            clients_normal: 0,
            functions_caches: 0,
            avg_kv_size: 120.0,
        };
        let curve = vec![
            CurvePoint {
                count: 512,
                size: 512 * 128,
                hit_cnt: 600,
                miss_cnt: 400,
            },
            CurvePoint {
                count: 1024,
                size: 1024 * 128,
                hit_cnt: 700,
                miss_cnt: 300,
            },
        ];
        let report = build_mrc_report(&ms, &curve).unwrap();
        assert_eq!(report.ticks.len(), 3);
        assert_eq!(report.hit_cnt[0], 0);
        assert_eq!(report.miss_cnt[0], 1000);
        // monotone tick sizes
        assert!(report.ticks[0] < report.ticks[1]);
        assert!(report.ticks[1] < report.ticks[2]);
        // counters carried through
        assert_eq!(report.hit_cnt[2], 700);
        assert_eq!(report.miss_cnt[2], 300);
    }
}
