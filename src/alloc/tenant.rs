//! Per-tenant allocation state
//!
//! A tenant owns its demand vector (per-unit-throughput, assuming 100%
//! miss), its live allocation, its miss ratio curve, and the predicted
//! deltas the trading loops compare. The predictions answer: if this tenant
//! gained (or lost) one cache quantum, how much RCU / net bandwidth could it
//! relinquish (or would it demand as compensation) while sustaining its
//! current throughput?

use tracing::trace;

use super::mrc::MissRatioCurve;
use super::params::{
    AllocParams, COMPEN_ABORT_OFFER, EPSILON, RELINQ_ABORT_OFFER,
};
use super::resrc::{ResrcVec, StatelessResrcVec};

/// Outcome of a relinquish/compensate prediction
enum Offer {
    /// No acceptable deal exists
    Abort,
    /// The resources can move for free
    Immediate,
    /// A priced deal: (rcu delta, net delta)
    Deal(f64, f64),
}

pub struct Tenant {
    pub t_idx: usize,

    /// Demand vector without cache hits, per unit throughput
    demand_cacheless: StatelessResrcVec,
    /// Live allocation, mutated in place by the trading loops
    resrc: ResrcVec,
    mrc: MissRatioCurve,
    /// Degree to which net bandwidth demand depends on the miss ratio
    net_bw_alpha: f64,

    rcu_delta_relinq: f64,
    rcu_delta_compen: f64,
    net_delta_relinq: f64,
    net_delta_compen: f64,

    /// Miss ratio change if given / deprived of one cache quantum
    mr_inc_if_more_cache: f64,
    mr_dec_if_less_cache: f64,

    /// Memshare floor: cache this tenant never donates below
    reserved_cache_size: u64,
}

impl Tenant {
    pub fn new(
        t_idx: usize,
        demand_cacheless: StatelessResrcVec,
        base_resrc: ResrcVec,
        mrc: MissRatioCurve,
        net_bw_alpha: f64,
        params: &AllocParams,
    ) -> Self {
        Self {
            t_idx,
            demand_cacheless,
            resrc: base_resrc,
            mrc,
            net_bw_alpha,
            rcu_delta_relinq: 0.0,
            rcu_delta_compen: 0.0,
            net_delta_relinq: 0.0,
            net_delta_compen: 0.0,
            mr_inc_if_more_cache: 0.0,
            mr_dec_if_less_cache: 0.0,
            reserved_cache_size: (base_resrc.cache_size as f64 * params.reserved_ratio) as u64,
        }
    }

    pub fn resrc(&self) -> ResrcVec {
        self.resrc
    }

    pub fn rcu_delta_relinq(&self) -> f64 {
        self.rcu_delta_relinq
    }

    pub fn rcu_delta_compen(&self) -> f64 {
        self.rcu_delta_compen
    }

    pub fn net_delta_relinq(&self) -> f64 {
        self.net_delta_relinq
    }

    pub fn net_delta_compen(&self) -> f64 {
        self.net_delta_compen
    }

    pub fn mr_inc_if_more_cache(&self) -> f64 {
        self.mr_inc_if_more_cache
    }

    pub fn mr_dec_if_less_cache(&self) -> f64 {
        self.mr_dec_if_less_cache
    }

    /// Shrink the allocation to predicted consumption at the current cache
    /// size and return the slack.
    pub fn collect_idle(&mut self, params: &AllocParams) -> StatelessResrcVec {
        let mut demand = self.demand_cacheless;
        let mr = self.mrc.get_miss_ratio(self.resrc.cache_size);
        demand.db_rcu *= mr;
        if params.alloc_total_net_bw {
            demand.net_bw *= mr + (1.0 - self.net_bw_alpha) * (1.0 - mr);
        }

        // division takes the min across stateless resources
        let tp = self.resrc.stateless / demand;
        let used = demand * tp;
        let idle = self.resrc.stateless - used;
        self.resrc.stateless = used;
        idle
    }

    /// Refresh both trade predictions
    pub fn update_rcu_net_delta(&mut self, params: &AllocParams) {
        match self.pred_delta_if_more_cache(params) {
            Offer::Deal(rcu, net) => {
                self.rcu_delta_relinq = rcu;
                self.net_delta_relinq = net;
            }
            _ => {
                self.rcu_delta_relinq = RELINQ_ABORT_OFFER;
                if params.alloc_total_net_bw {
                    self.net_delta_relinq = RELINQ_ABORT_OFFER;
                }
            }
        }
        match self.pred_delta_if_less_cache(params) {
            Offer::Deal(rcu, net) => {
                self.rcu_delta_compen = rcu;
                self.net_delta_compen = net;
            }
            Offer::Immediate => {
                self.rcu_delta_compen = 0.0;
                if params.alloc_total_net_bw {
                    self.net_delta_compen = 0.0;
                }
            }
            Offer::Abort => {
                self.rcu_delta_compen = COMPEN_ABORT_OFFER;
                if params.alloc_total_net_bw {
                    self.net_delta_compen = COMPEN_ABORT_OFFER;
                }
            }
        }
        trace!(
            t_idx = self.t_idx,
            rcu_delta_relinq = self.rcu_delta_relinq,
            rcu_delta_compen = self.rcu_delta_compen,
            net_delta_relinq = self.net_delta_relinq,
            net_delta_compen = self.net_delta_compen,
            "tenant deltas"
        );
    }

    /// Refresh the memshare predictions
    pub fn update_mr_delta(&mut self, params: &AllocParams) {
        let curr_mr = self.mrc.get_miss_ratio(self.resrc.cache_size);
        let more_mr = self
            .mrc
            .get_miss_ratio(self.resrc.cache_size + params.cache_delta);
        let less_mr = self
            .mrc
            .get_miss_ratio(self.resrc.cache_size.saturating_sub(params.cache_delta));
        self.mr_inc_if_more_cache = curr_mr - more_mr;
        self.mr_dec_if_less_cache = less_mr - curr_mr;
    }

    pub fn can_donate(&self, params: &AllocParams) -> bool {
        self.resrc.cache_size >= self.reserved_cache_size + params.cache_delta
    }

    pub fn scale_stateless_resrc(&mut self, scale_factor: f64) {
        self.resrc.stateless *= scale_factor;
    }

    /// Scale each stateless component by the tenant's owned share of `sum`,
    /// falling back to an even split where a component of `sum` is zero.
    pub fn scale_stateless_resrc_by_owned(
        &mut self,
        avail: &StatelessResrcVec,
        sum: &StatelessResrcVec,
        even_denom: usize,
    ) {
        let even = 1.0 / even_denom as f64;
        let db_rcu_factor = if sum.db_rcu != 0.0 {
            self.resrc.stateless.db_rcu / sum.db_rcu
        } else {
            even
        };
        let db_wcu_factor = if sum.db_wcu != 0.0 {
            self.resrc.stateless.db_wcu / sum.db_wcu
        } else {
            even
        };
        let net_bw_factor = if sum.net_bw != 0.0 {
            self.resrc.stateless.net_bw / sum.net_bw
        } else {
            even
        };
        self.resrc.stateless.db_rcu += avail.db_rcu * db_rcu_factor;
        self.resrc.stateless.db_wcu += avail.db_wcu * db_wcu_factor;
        self.resrc.stateless.net_bw += avail.net_bw * net_bw_factor;
    }

    /// Move one cache quantum from donator to receiver
    pub fn relocate_cache(tenants: &mut [Tenant], receiver: usize, donator: usize, params: &AllocParams) {
        tenants[receiver].resrc.cache_size += params.cache_delta;
        tenants[donator].resrc.cache_size -= params.cache_delta;
    }

    /// Apply one harvest trade: the relinquisher gains a cache quantum and
    /// gives up stateless resources; the compensated tenant loses the
    /// quantum and is paid.
    #[allow(clippy::too_many_arguments)]
    pub fn relocate_resrc(
        tenants: &mut [Tenant],
        relinq: usize,
        compen: usize,
        rcu_relinq: f64,
        rcu_compen: f64,
        net_relinq: f64,
        net_compen: f64,
        params: &AllocParams,
    ) {
        debug_assert_ne!(relinq, compen);
        tenants[compen].resrc.cache_size -= params.cache_delta;
        tenants[relinq].resrc.cache_size += params.cache_delta;
        tenants[compen].resrc.stateless.db_rcu += rcu_compen;
        tenants[relinq].resrc.stateless.db_rcu -= rcu_relinq;
        if params.alloc_total_net_bw {
            tenants[compen].resrc.stateless.net_bw += net_compen;
            tenants[relinq].resrc.stateless.net_bw -= net_relinq;
        } else {
            debug_assert_eq!(net_compen, 0.0);
            debug_assert_eq!(net_relinq, 0.0);
        }
    }

    pub fn aggregate_resrc(tenants: &[Tenant]) -> StatelessResrcVec {
        let mut sum = StatelessResrcVec::default();
        for t in tenants {
            sum += t.resrc.stateless;
        }
        sum
    }

    pub fn report(&self, params: &AllocParams, detailed: bool) {
        if detailed {
            let mut demand = self.demand_cacheless;
            let mr = self.mrc.get_miss_ratio_const(self.resrc.cache_size);
            demand.db_rcu *= mr;
            if params.alloc_total_net_bw {
                demand.net_bw *= mr;
            }
            let tput = self.resrc.stateless / demand;
            trace!(t_idx = self.t_idx, resrc = %self.resrc, tput, "tenant");
        } else {
            trace!(t_idx = self.t_idx, resrc = %self.resrc, "tenant");
        }
    }

    /// RCU/net this tenant could give back if granted one more cache
    /// quantum while keeping its throughput.
    fn pred_delta_if_more_cache(&mut self, params: &AllocParams) -> Offer {
        let cache_delta = params.cache_delta;

        let curr_mr = self.mrc.get_miss_ratio(self.resrc.cache_size);
        if !curr_mr.is_finite() {
            return Offer::Abort;
        }
        // no deal to make if the miss ratio is already near zero; also
        // guards the division below
        if curr_mr <= EPSILON {
            return Offer::Abort;
        }

        let pred_mr = self.mrc.get_miss_ratio(self.resrc.cache_size + cache_delta);
        if !pred_mr.is_finite() {
            return Offer::Abort;
        }
        if pred_mr < params.min_miss_ratio {
            return Offer::Abort;
        }

        // close miss ratios mean more cache buys no rcu back
        let delta_mr = curr_mr - pred_mr;
        if delta_mr <= EPSILON {
            return Offer::Abort;
        }

        let rcu_delta = self.resrc.stateless.db_rcu * delta_mr / curr_mr;
        debug_assert!(rcu_delta >= 0.0);
        let net_delta = if params.alloc_total_net_bw {
            let alpha = self.net_bw_alpha;
            let d = self.resrc.stateless.net_bw * delta_mr * alpha
                / (curr_mr * alpha + 1.0 - alpha);
            debug_assert!(d >= 0.0);
            d
        } else {
            0.0
        };
        Offer::Deal(rcu_delta, net_delta)
    }

    /// RCU/net this tenant must be paid to give up one cache quantum while
    /// keeping its throughput.
    fn pred_delta_if_less_cache(&mut self, params: &AllocParams) -> Offer {
        let cache_delta = params.cache_delta;

        // written with '+' to avoid unsigned underflow of
        // `cache_size - cache_delta < min_cache_size`
        if self.resrc.cache_size < params.min_cache_size + cache_delta {
            return Offer::Abort;
        }

        let curr_mr = self.mrc.get_miss_ratio(self.resrc.cache_size);
        if !curr_mr.is_finite() {
            return Offer::Abort;
        }
        let pred_mr = self.mrc.get_miss_ratio(self.resrc.cache_size - cache_delta);
        if !pred_mr.is_finite() {
            return Offer::Abort;
        }
        if pred_mr > params.max_miss_ratio {
            return Offer::Abort;
        }

        // close miss ratios mean the cache can move without compensation
        let delta_mr = pred_mr - curr_mr;
        if delta_mr <= EPSILON {
            return Offer::Immediate;
        }

        // order matters between these two checks
        if pred_mr <= EPSILON {
            return Offer::Immediate; // still no miss
        }
        if curr_mr <= EPSILON {
            return Offer::Abort; // unbounded ratio
        }

        let rcu_delta = self.resrc.stateless.db_rcu * delta_mr / curr_mr;
        debug_assert!(rcu_delta >= 0.0);
        let net_delta = if params.alloc_total_net_bw {
            let alpha = self.net_bw_alpha;
            let d = self.resrc.stateless.net_bw * delta_mr * alpha
                / (curr_mr * alpha + 1.0 - alpha);
            debug_assert!(d >= 0.0);
            d
        } else {
            0.0
        };
        Offer::Deal(rcu_delta, net_delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> AllocParams {
        AllocParams {
            alloc_total_net_bw: false,
            cache_delta: 10,
            min_cache_size: 10,
            ..Default::default()
        }
    }

    fn tenant(cache: u64, rcu: f64, mrc: MissRatioCurve) -> Tenant {
        Tenant::new(
            0,
            StatelessResrcVec::new(0.8, 0.2, 4.0),
            ResrcVec::new(cache, rcu, 2.0, 16.0),
            mrc,
            0.0,
            &params(),
        )
    }

    #[test]
    fn test_collect_idle_reduces_to_used() {
        let p = params();
        let mrc = MissRatioCurve::new(vec![10, 100], vec![1.0, 1.0]);
        let mut t = tenant(20, 2.0, mrc);
        // demand at mr=1: (0.8, 0.2, 4); tput = min(2.5, 10, 4) = 2.5
        let idle = t.collect_idle(&p);
        assert!((idle.db_rcu - 0.0).abs() < 1e-9);
        assert!((idle.db_wcu - 1.5).abs() < 1e-9);
        assert!((idle.net_bw - 6.0).abs() < 1e-9);
        assert!((t.resrc().stateless.db_rcu - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_flat_curve_offers_nothing() {
        let p = params();
        let mrc = MissRatioCurve::new(vec![10, 100], vec![0.5, 0.5]);
        let mut t = tenant(20, 2.0, mrc);
        t.update_rcu_net_delta(&p);
        assert_eq!(t.rcu_delta_relinq(), RELINQ_ABORT_OFFER);
        // flat curve: the quantum moves for free
        assert_eq!(t.rcu_delta_compen(), 0.0);
    }

    #[test]
    fn test_steep_curve_prices_the_quantum() {
        let p = params();
        let mrc = MissRatioCurve::new(vec![10, 20, 30], vec![0.9, 0.6, 0.3]);
        let mut t = tenant(20, 2.0, mrc);
        t.update_rcu_net_delta(&p);
        // relinq: (0.6 - 0.3) / 0.6 * 2.0 = 1.0
        assert!((t.rcu_delta_relinq() - 1.0).abs() < 1e-9);
        // compen: (0.9 - 0.6) / 0.6 * 2.0 = 1.0
        assert!((t.rcu_delta_compen() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_floor_blocks_donation() {
        let p = params();
        let mrc = MissRatioCurve::new(vec![10, 20, 30], vec![0.9, 0.6, 0.3]);
        let mut t = tenant(10, 2.0, mrc);
        t.update_rcu_net_delta(&p);
        // 10 - 10 < min_cache_size: no compensation offer possible
        assert_eq!(t.rcu_delta_compen(), COMPEN_ABORT_OFFER);
    }

    #[test]
    fn test_scale_by_owned_even_split_fallback() {
        let p = params();
        let mrc = MissRatioCurve::new(vec![10, 100], vec![1.0, 1.0]);
        let mut t = tenant(20, 2.0, mrc);
        let avail = StatelessResrcVec::new(0.0, 0.0, 8.0);
        let sum = StatelessResrcVec::new(4.0, 4.0, 0.0);
        t.scale_stateless_resrc_by_owned(&avail, &sum, 4);
        // net_bw sum is zero: even split across 4 tenants
        assert!((t.resrc().stateless.net_bw - 18.0).abs() < 1e-9);
    }
}
