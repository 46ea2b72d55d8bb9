//! Allocation parameters and numeric policy

use tracing::info;

/// Values smaller than these are treated as zero when deciding whether a
/// resource pool is exhausted.
pub const DB_RCU_EPSILON: f64 = 0.0001;
pub const DB_WCU_EPSILON: f64 = 0.0001;
pub const NET_BW_EPSILON: f64 = 0.0001;

/// Miss ratios at or below this are treated as zero miss
pub const EPSILON: f64 = f64::EPSILON;

/// Sentinel offer meaning "abort this trade" on the relinquish side: a
/// tenant asking for cache but relinquishing nothing can never win a deal.
pub const RELINQ_ABORT_OFFER: f64 = 0.0;

/// Sentinel offer meaning "abort this trade" on the compensation side: a
/// demand no one could possibly afford. `f32::MAX` rather than `f64::MAX`
/// keeps later arithmetic clear of overflow.
pub const COMPEN_ABORT_OFFER: f64 = f32::MAX as f64;

/// Miss-ratio curve estimation policy
pub mod mrc {
    /// If true, interpolating between size 0 and the first tick returns 1
    /// whenever the first tick's miss ratio is itself near 1; a conservative
    /// estimate that rejects dangerous trades.
    pub const DISABLE_INTERPOLATION_NEAR_INF: bool = false;

    /// If true, an out-of-range query returns the last tick's miss ratio
    /// instead of failing.
    pub const CONSERVATIVE_ESTIMATION_IF_OUT_OF_RANGE: bool = true;
}

/// Tunable allocation parameters
#[derive(Debug, Clone)]
pub struct AllocParams {
    /// Whether allocated network bandwidth covers both the client leg and
    /// the backing-store leg; with `false`, harvest trades only RCU.
    pub alloc_total_net_bw: bool,

    /// Unit of cache trading, bytes
    pub cache_delta: u64,

    /// Per-tenant floors
    pub min_cache_size: u64,
    pub min_db_rcu: f64,
    pub min_db_wcu: f64,
    pub min_net_bw: f64,

    /// Trading terminates after this many rounds regardless of progress
    pub max_trade_round: u32,

    /// A trade must improve the estimated ratio by at least this much
    pub min_improve_ratio_delta: f64,

    /// Stop trading cache away once the miss ratio would exceed this;
    /// tenants may have tail-latency constraints
    pub max_miss_ratio: f64,

    /// Stop trading for more cache once the miss ratio falls below this;
    /// estimation noise dominates down there
    pub min_miss_ratio: f64,

    /// Memshare: fraction of the base cache a tenant always keeps
    pub reserved_ratio: f64,
}

impl Default for AllocParams {
    fn default() -> Self {
        Self {
            alloc_total_net_bw: true,
            cache_delta: 4 * 1024 * 1024,
            min_cache_size: 4 * 1024 * 1024,
            min_db_rcu: 10.0,
            min_db_wcu: 10.0,
            min_net_bw: 80.0 * 1024.0,
            max_trade_round: 10_000,
            min_improve_ratio_delta: 0.0001,
            max_miss_ratio: 1.0,
            min_miss_ratio: 0.0,
            reserved_ratio: 0.5,
        }
    }
}

impl AllocParams {
    pub fn log(&self) {
        info!(
            cache_delta = self.cache_delta,
            max_trade_round = self.max_trade_round,
            min_improve_ratio_delta = self.min_improve_ratio_delta,
            min_cache_size = self.min_cache_size,
            min_db_rcu = self.min_db_rcu,
            min_db_wcu = self.min_db_wcu,
            min_net_bw = self.min_net_bw,
            alloc_total_net_bw = self.alloc_total_net_bw,
            "alloc params"
        );
    }
}
