//! Allocator end-to-end scenarios

use hopperkv::alloc::{
    AllocParams, AllocPolicy, Allocator, MissRatioCurve, ResrcVec, StatelessResrcVec,
};

// ticks must align with the trading quantum so expected results survive a
// cache_delta change
fn tick_unit(x: u64, params: &AllocParams) -> u64 {
    x * params.cache_delta
}

fn test_params() -> AllocParams {
    AllocParams {
        alloc_total_net_bw: false,
        cache_delta: 10,
        min_cache_size: 10,
        min_db_rcu: 10.0,
        min_db_wcu: 10.0,
        min_net_bw: 10.0,
        ..Default::default()
    }
}

fn is_resrc_similar(expected: &ResrcVec, actual: &ResrcVec, epsilon: f64) -> bool {
    expected.cache_size == actual.cache_size
        && (expected.stateless.db_rcu - actual.stateless.db_rcu).abs() < epsilon
        && (expected.stateless.db_wcu - actual.stateless.db_wcu).abs() < epsilon
        && (expected.stateless.net_bw - actual.stateless.net_bw).abs() < epsilon
}

fn check_tenant_resrc(expected: ResrcVec, allocator: &Allocator, t_idx: usize) {
    let actual = allocator.tenant(t_idx).resrc();
    assert!(
        is_resrc_similar(&expected, &actual, 0.01),
        "tenant {t_idx}: expected {expected}, actual {actual}"
    );
}

#[test]
fn test_trivial_single_tenant() {
    let params = test_params();
    let ticks: Vec<u64> = [1, 2, 4, 8, 10].iter().map(|&x| tick_unit(x, &params)).collect();
    let miss_ratios = vec![0.9, 0.8, 0.7, 0.6, 0.4];
    let demand = StatelessResrcVec::new(0.5, 0.5, 4.0);
    let base_resrc = ResrcVec::new(20, 2.0, 1.2, 6.0);

    let mut a = Allocator::new(AllocPolicy::default(), params);
    a.add_tenant(demand, base_resrc, MissRatioCurve::new(ticks, miss_ratios), 0.0);

    let improve = a.do_alloc();
    assert_eq!(improve, 0.0);
    check_tenant_resrc(base_resrc, &a, 0);
}

#[test]
fn test_symmetric_tenants_unchanged() {
    let params = test_params();
    let ticks: Vec<u64> = [1, 2, 4, 8, 10].iter().map(|&x| tick_unit(x, &params)).collect();
    let miss_ratios = vec![0.9, 0.8, 0.7, 0.6, 0.4];
    let demand = StatelessResrcVec::new(0.5, 0.5, 4.0);
    let base_resrc = ResrcVec::new(tick_unit(2, &params), 2.0, 2.0, 16.0);

    let mut a = Allocator::new(AllocPolicy::default(), params);
    for _ in 0..4 {
        a.add_tenant(
            demand,
            base_resrc,
            MissRatioCurve::new(ticks.clone(), miss_ratios.clone()),
            0.0,
        );
    }

    a.do_alloc();

    for i in 0..4 {
        check_tenant_resrc(base_resrc, &a, i);
    }
}

#[test]
fn test_rw_ratio_drf() {
    // cache-independent workloads degrade to pure DRF over the
    // read/write mix
    let params = test_params();
    let ticks: Vec<u64> = [1, 2, 4, 8, 10].iter().map(|&x| tick_unit(x, &params)).collect();
    let miss_ratios = vec![1.0, 1.0, 1.0, 1.0, 1.0];
    let demand_read_heavy = StatelessResrcVec::new(0.8, 0.2, 4.0);
    let demand_write_heavy = StatelessResrcVec::new(0.2, 0.8, 4.0);
    let base_resrc = ResrcVec::new(tick_unit(2, &params), 2.0, 2.0, 16.0);

    let mut a = Allocator::new(AllocPolicy::default(), params.clone());
    a.add_tenant(
        demand_read_heavy,
        base_resrc,
        MissRatioCurve::new(ticks.clone(), miss_ratios.clone()),
        0.0,
    );
    a.add_tenant(
        demand_write_heavy,
        base_resrc,
        MissRatioCurve::new(ticks, miss_ratios),
        0.0,
    );

    a.do_alloc();

    check_tenant_resrc(ResrcVec::new(tick_unit(2, &params), 3.2, 0.8, 16.0), &a, 0);
    check_tenant_resrc(ResrcVec::new(tick_unit(2, &params), 0.8, 3.2, 16.0), &a, 1);
}

#[test]
fn test_cache_for_rcu_trade() {
    // same demand, different curves: cache flows to the tenant whose curve
    // rewards it, RCU flows back
    let params = test_params();
    let ticks: Vec<u64> = [2, 4, 6, 8, 10].iter().map(|&x| tick_unit(x, &params)).collect();
    let miss_ratios_flat = vec![0.9, 0.85, 0.8, 0.7, 0.5];
    let miss_ratios_steep = vec![0.8, 0.6, 0.3, 0.2, 0.15];
    let demand = StatelessResrcVec::new(0.8, 0.2, 4.0);
    let base_resrc = ResrcVec::new(tick_unit(4, &params), 2.0, 2.0, 16.0);

    let mut a = Allocator::new(AllocPolicy::default(), params.clone());
    a.add_tenant(
        demand,
        base_resrc,
        MissRatioCurve::new(ticks.clone(), miss_ratios_flat),
        0.0,
    );
    a.add_tenant(
        demand,
        base_resrc,
        MissRatioCurve::new(ticks, miss_ratios_steep),
        0.0,
    );

    let improve = a.do_alloc();
    assert!(improve > 0.0);

    check_tenant_resrc(
        ResrcVec::new(tick_unit(2, &params), 2.75, 1.69, 13.56),
        &a,
        0,
    );
    check_tenant_resrc(
        ResrcVec::new(tick_unit(6, &params), 1.25, 2.31, 18.44),
        &a,
        1,
    );
}

#[test]
fn test_allocation_conserves_totals() {
    // conserving redistribution: component-wise totals never grow
    let params = test_params();
    let ticks: Vec<u64> = [2, 4, 6, 8, 10].iter().map(|&x| tick_unit(x, &params)).collect();
    let base_resrc = ResrcVec::new(tick_unit(4, &params), 2.0, 2.0, 16.0);

    let mut a = Allocator::new(AllocPolicy::default(), params);
    a.add_tenant(
        StatelessResrcVec::new(0.8, 0.2, 4.0),
        base_resrc,
        MissRatioCurve::new(ticks.clone(), vec![0.9, 0.85, 0.8, 0.7, 0.5]),
        0.0,
    );
    a.add_tenant(
        StatelessResrcVec::new(0.8, 0.2, 4.0),
        base_resrc,
        MissRatioCurve::new(ticks, vec![0.8, 0.6, 0.3, 0.2, 0.15]),
        0.0,
    );

    let improve = a.do_alloc();
    assert!(improve >= 0.0);

    let total_cache: u64 = a.alloc_result().iter().map(|r| r.cache_size).sum();
    let total_rcu: f64 = a.alloc_result().iter().map(|r| r.stateless.db_rcu).sum();
    let total_wcu: f64 = a.alloc_result().iter().map(|r| r.stateless.db_wcu).sum();
    let total_net: f64 = a.alloc_result().iter().map(|r| r.stateless.net_bw).sum();

    assert_eq!(total_cache, 2 * tick_unit(4, &test_params()));
    assert!(total_rcu <= 4.0 + 1e-6);
    assert!(total_wcu <= 4.0 + 1e-6);
    assert!(total_net <= 32.0 + 1e-6);
}

#[test]
fn test_memshare_moves_cache_toward_steeper_curve() {
    let params = test_params();
    let policy = AllocPolicy {
        harvest: false,
        conserving: true,
        memshare: true,
    };
    let ticks: Vec<u64> = [2, 4, 6, 8, 10].iter().map(|&x| tick_unit(x, &params)).collect();
    let base_resrc = ResrcVec::new(tick_unit(4, &params), 2.0, 2.0, 16.0);

    let mut a = Allocator::new(policy, params.clone());
    // flat curve: cheap donor
    a.add_tenant(
        StatelessResrcVec::new(0.5, 0.5, 4.0),
        base_resrc,
        MissRatioCurve::new(ticks.clone(), vec![0.8, 0.8, 0.8, 0.8, 0.8]),
        0.0,
    );
    // steep curve: eager receiver
    a.add_tenant(
        StatelessResrcVec::new(0.5, 0.5, 4.0),
        base_resrc,
        MissRatioCurve::new(ticks, vec![0.9, 0.7, 0.5, 0.3, 0.1]),
        0.0,
    );

    a.do_alloc();
    let result = a.alloc_result();
    assert!(result[1].cache_size > result[0].cache_size);
    // the donor never dips below its reserved half
    assert!(result[0].cache_size >= (base_resrc.cache_size as f64 * params.reserved_ratio) as u64);
}
