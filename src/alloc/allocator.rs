//! HARE: harvest-and-redistribute allocation across tenants
//!
//! One allocation pass walks four phases:
//!
//! 1. collect idle: shrink every tenant to its predicted consumption and
//!    pool the slack;
//! 2. memshare (variant): cache-only trading by miss-ratio deltas;
//! 3. harvest: trade cache quanta against the bottleneck stateless
//!    resource while the estimated improvement keeps rising;
//! 4. redistribute: hand the pool back, proportionally to ownership
//!    (conserving) or by uniform scaling.

use tracing::{info, trace};

use super::mrc::MissRatioCurve;
use super::params::AllocParams;
use super::resrc::{ResrcVec, StatelessResrcVec};
use super::tenant::Tenant;

/// Which phases run
#[derive(Debug, Clone, Copy)]
pub struct AllocPolicy {
    /// Run the harvest phase; false degrades to cache-unaware DRF
    pub harvest: bool,
    /// Conserving redistribution; false may leave stateless slack unallocated
    pub conserving: bool,
    /// Memshare's cache allocation; mutually exclusive with harvest
    pub memshare: bool,
}

impl Default for AllocPolicy {
    fn default() -> Self {
        Self {
            harvest: true,
            conserving: true,
            memshare: false,
        }
    }
}

pub struct Allocator {
    policy: AllocPolicy,
    params: AllocParams,
    tenants: Vec<Tenant>,
    total_resrc: ResrcVec,
}

impl Allocator {
    pub fn new(policy: AllocPolicy, params: AllocParams) -> Self {
        debug_assert!(!(policy.harvest && policy.memshare));
        Self {
            policy,
            params,
            tenants: Vec::new(),
            total_resrc: ResrcVec::default(),
        }
    }

    pub fn add_tenant(
        &mut self,
        demand_cacheless: StatelessResrcVec,
        base_resrc: ResrcVec,
        mrc: MissRatioCurve,
        net_bw_alpha: f64,
    ) -> usize {
        let t_idx = self.tenants.len();
        self.total_resrc += base_resrc;
        self.tenants.push(Tenant::new(
            t_idx,
            demand_cacheless,
            base_resrc,
            mrc,
            net_bw_alpha,
            &self.params,
        ));
        trace!(t_idx, demand = %demand_cacheless, net_bw_alpha, "tenant added");
        t_idx
    }

    pub fn tenant(&self, t_idx: usize) -> &Tenant {
        &self.tenants[t_idx]
    }

    pub fn alloc_result(&self) -> Vec<ResrcVec> {
        self.tenants.iter().map(|t| t.resrc()).collect()
    }

    /// Run one allocation pass and return the improvement ratio
    pub fn do_alloc(&mut self) -> f64 {
        let mut improve_ratio = 0.0;
        self.params.log();
        info!(
            harvest = self.policy.harvest,
            conserving = self.policy.conserving,
            memshare = self.policy.memshare,
            "allocator policy"
        );

        // nothing to schedule with a single tenant
        if self.tenants.len() <= 1 {
            return improve_ratio;
        }

        if self.policy.memshare {
            self.do_memshare();
        }

        // collect idle resources
        let mut resrc_avail = StatelessResrcVec::default();
        for t in self.tenants.iter_mut() {
            let resrc_idle = t.collect_idle(&self.params);
            trace!(t_idx = t.t_idx, idle = %resrc_idle, "collected idle");
            resrc_avail += resrc_idle;
        }
        trace!(avail = %resrc_avail, "total idle resources");

        if self.policy.harvest {
            self.do_harvest(&mut resrc_avail);
        }

        trace!(avail = %resrc_avail, "total resources to redistribute");

        if !resrc_avail.is_almost_empty() {
            improve_ratio = self.do_redistribute(&mut resrc_avail);
        }

        for t in &self.tenants {
            t.report(&self.params, false);
        }
        improve_ratio
    }

    /// Harvest db_rcu and net_bw by relocating cache quanta from tenants
    /// whose curve makes cache cheap toward tenants it relieves.
    fn do_harvest(&mut self, resrc_avail: &mut StatelessResrcVec) {
        let (mut prev_improve, mut is_rcu_bottleneck, mut is_net_bottleneck) =
            self.estimate_bottleneck(resrc_avail);

        for t in self.tenants.iter_mut() {
            t.update_rcu_net_delta(&self.params);
        }

        let mut trade_round: u32 = 0;

        loop {
            if trade_round >= self.params.max_trade_round {
                break;
            }

            let (relinq_idx, compen_idx) = if is_rcu_bottleneck {
                let relinq = argmax(&self.tenants, Tenant::rcu_delta_relinq, None);
                let compen = argmin(&self.tenants, Tenant::rcu_delta_compen, None);
                // in a rare case the best relinquisher and the cheapest
                // compensation are the same tenant: settle for the runner-up
                if relinq == compen {
                    (
                        relinq,
                        argmin(&self.tenants, Tenant::rcu_delta_compen, Some(relinq)),
                    )
                } else {
                    (relinq, compen)
                }
            } else if self.params.alloc_total_net_bw && is_net_bottleneck {
                // harvest involves net_bw only when total net is allocated
                let relinq = argmax(&self.tenants, Tenant::net_delta_relinq, None);
                let compen = argmin(&self.tenants, Tenant::net_delta_compen, None);
                if relinq == compen {
                    (
                        relinq,
                        argmin(&self.tenants, Tenant::net_delta_compen, Some(relinq)),
                    )
                } else {
                    (relinq, compen)
                }
            } else {
                // neither cache-correlated resource is the bottleneck:
                // no point continuing to trade
                break;
            };

            let rcu_delta_relinq = self.tenants[relinq_idx].rcu_delta_relinq();
            let net_delta_relinq = self.tenants[relinq_idx].net_delta_relinq();
            let rcu_delta_compen = self.tenants[compen_idx].rcu_delta_compen();
            let net_delta_compen = self.tenants[compen_idx].net_delta_compen();

            trace!(
                relinq = relinq_idx,
                compen = compen_idx,
                rcu_delta_relinq,
                net_delta_relinq,
                rcu_delta_compen,
                net_delta_compen,
                "deal candidates"
            );

            let rcu_profit = rcu_delta_relinq - rcu_delta_compen;
            let net_profit = net_delta_relinq - net_delta_compen;

            let mut resrc_if_deal = *resrc_avail;
            resrc_if_deal.db_rcu += rcu_profit;
            resrc_if_deal.net_bw += net_profit;
            // the improvement gate is what makes trading converge
            let (curr_improve, rcu_b, net_b) = self.estimate_bottleneck(&resrc_if_deal);
            is_rcu_bottleneck = rcu_b;
            is_net_bottleneck = net_b;
            if curr_improve - prev_improve < self.params.min_improve_ratio_delta {
                trace!(
                    prev = prev_improve,
                    curr = curr_improve,
                    "deal cancelled: improvement gain too low"
                );
                break;
            }

            prev_improve = curr_improve;
            *resrc_avail = resrc_if_deal;

            trace!(rcu_profit, net_profit, improve = curr_improve, "deal made");

            Tenant::relocate_resrc(
                &mut self.tenants,
                relinq_idx,
                compen_idx,
                rcu_delta_relinq,
                rcu_delta_compen,
                net_delta_relinq,
                net_delta_compen,
                &self.params,
            );

            // recompute the two changed tenants' predictions
            self.tenants[relinq_idx].update_rcu_net_delta(&self.params);
            self.tenants[compen_idx].update_rcu_net_delta(&self.params);

            trade_round += 1;
        }

        info!(trade_round, "harvest trading finished");
    }

    /// Distribute the available pool and return the improvement ratio
    fn do_redistribute(&mut self, resrc_avail: &mut StatelessResrcVec) -> f64 {
        let resrc_sum = self.total_resrc.stateless - *resrc_avail;
        debug_assert!(Tenant::aggregate_resrc(&self.tenants).is_almost_equal(&resrc_sum));
        let improve_ratio = *resrc_avail / resrc_sum;

        if self.policy.conserving {
            let n = self.tenants.len();
            for t in self.tenants.iter_mut() {
                t.scale_stateless_resrc_by_owned(resrc_avail, &resrc_sum, n);
            }
            trace!(improve = improve_ratio, "conserving redistribution");
            *resrc_avail = StatelessResrcVec::default();
        } else {
            let scale_factor = 1.0 + improve_ratio;
            for t in self.tenants.iter_mut() {
                t.scale_stateless_resrc(scale_factor);
            }
            let resrc_sum = Tenant::aggregate_resrc(&self.tenants);
            *resrc_avail = self.total_resrc.stateless - resrc_sum;
        }
        improve_ratio
    }

    /// Memshare's cache-only trading loop
    fn do_memshare(&mut self) {
        let mut trade_round: u32 = 0;

        loop {
            for t in self.tenants.iter_mut() {
                t.update_mr_delta(&self.params);
            }

            // the receiver is whoever gains the most from one more quantum;
            // the donator is the cheapest donor still above its reserve
            let receiver = argmax(&self.tenants, Tenant::mr_inc_if_more_cache, None);
            let mut order: Vec<usize> = (0..self.tenants.len()).collect();
            order.sort_by(|&a, &b| {
                self.tenants[a]
                    .mr_dec_if_less_cache()
                    .total_cmp(&self.tenants[b].mr_dec_if_less_cache())
            });
            let donator = order
                .into_iter()
                .find(|&i| i != receiver && self.tenants[i].can_donate(&self.params));

            let Some(donator) = donator else {
                info!("memshare fails to find a donator");
                break;
            };

            let mr_inc = self.tenants[receiver].mr_inc_if_more_cache();
            let mr_dec = self.tenants[donator].mr_dec_if_less_cache();

            if mr_inc > mr_dec {
                Tenant::relocate_cache(&mut self.tenants, receiver, donator, &self.params);
                trace!(donator, receiver, mr_dec, mr_inc, "memshare relocated cache");
                trade_round += 1;
            } else {
                trace!(donator, receiver, mr_dec, mr_inc, "memshare terminates: no profit");
                break;
            }
        }

        info!(trade_round, "memshare trading finished");
    }

    fn estimate_bottleneck(&self, resrc_avail: &StatelessResrcVec) -> (f64, bool, bool) {
        let resrc_sum = self.total_resrc.stateless - *resrc_avail;
        let improve = *resrc_avail / resrc_sum;
        let is_rcu = improve == resrc_avail.db_rcu / resrc_sum.db_rcu;
        let is_net = improve == resrc_avail.net_bw / resrc_sum.net_bw;
        trace!(
            avail = %resrc_avail,
            sum = %resrc_sum,
            improve,
            is_rcu,
            is_net,
            "bottleneck estimate"
        );
        (improve, is_rcu, is_net)
    }
}

fn argmax(tenants: &[Tenant], key: impl Fn(&Tenant) -> f64, skip: Option<usize>) -> usize {
    best_by(tenants, key, skip, |a, b| a > b)
}

fn argmin(tenants: &[Tenant], key: impl Fn(&Tenant) -> f64, skip: Option<usize>) -> usize {
    best_by(tenants, key, skip, |a, b| a < b)
}

fn best_by(
    tenants: &[Tenant],
    key: impl Fn(&Tenant) -> f64,
    skip: Option<usize>,
    better: impl Fn(f64, f64) -> bool,
) -> usize {
    let mut best = usize::MAX;
    let mut best_val = 0.0;
    for (i, t) in tenants.iter().enumerate() {
        if Some(i) == skip {
            continue;
        }
        let v = key(t);
        if best == usize::MAX || better(v, best_val) {
            best = i;
            best_val = v;
        }
    }
    debug_assert_ne!(best, usize::MAX);
    best
}
