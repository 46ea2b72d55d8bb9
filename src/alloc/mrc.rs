//! Piecewise-linear miss ratio curve

use std::collections::HashMap;

use tracing::warn;

use super::params::{mrc, EPSILON};
use crate::error::{Error, Result};

/// Miss ratio as a function of cache size, sampled at strictly increasing
/// `ticks` (cache sizes in bytes) with non-increasing `miss_ratios`.
/// Queries between ticks interpolate linearly; repeated queries are
/// memoized and therefore bit-identical.
#[derive(Debug, Clone)]
pub struct MissRatioCurve {
    ticks: Vec<u64>,
    miss_ratios: Vec<f64>,
    memo: HashMap<u64, f64>,
}

impl MissRatioCurve {
    pub fn new(ticks: Vec<u64>, miss_ratios: Vec<f64>) -> Self {
        Self {
            ticks,
            miss_ratios,
            memo: HashMap::new(),
        }
    }

    /// Memoizing query; prefer this over [`Self::get_miss_ratio_const`]
    /// wherever a mutable handle exists.
    pub fn get_miss_ratio(&mut self, cache_size: u64) -> f64 {
        if let Some(&mr) = self.memo.get(&cache_size) {
            return mr;
        }
        let mr = self.get_miss_ratio_const(cache_size);
        self.memo.insert(cache_size, mr);
        mr
    }

    /// Non-memoizing query
    pub fn get_miss_ratio_const(&self, cache_size: u64) -> f64 {
        let last_tick = *self.ticks.last().expect("curve has at least one tick");
        if cache_size > last_tick {
            if mrc::CONSERVATIVE_ESTIMATION_IF_OUT_OF_RANGE {
                warn!(
                    max = last_tick,
                    received = cache_size,
                    "out-of-range cache_size; using conservative estimation"
                );
                return *self.miss_ratios.last().unwrap();
            }
            panic!("cache_size {cache_size} out of range (max {last_tick})");
        }

        if cache_size < self.ticks[0] {
            // interpolate against miss_ratio(cache_size=0) == 1
            return Self::interpolate(
                1.0,
                self.miss_ratios[0],
                cache_size,
                self.ticks[0] - cache_size,
            );
        }

        let idx = self.ticks.partition_point(|&t| t < cache_size);
        if cache_size == self.ticks[idx] {
            return self.miss_ratios[idx];
        }

        debug_assert!(idx > 0 && idx < self.ticks.len());
        Self::interpolate(
            self.miss_ratios[idx - 1],
            self.miss_ratios[idx],
            cache_size - self.ticks[idx - 1],
            self.ticks[idx] - cache_size,
        )
    }

    /// Validate tick ordering and miss-ratio monotonicity
    pub fn check_sanity(&self) -> Result<()> {
        if self.ticks.is_empty() {
            return Err(Error::InvalidCurve("ticks is empty".into()));
        }
        if self.ticks.len() != self.miss_ratios.len() {
            return Err(Error::InvalidCurve(
                "ticks and miss_ratios length mismatch".into(),
            ));
        }
        let mut min_tick = self.ticks[0];
        let max_tick = *self.ticks.last().unwrap();
        let mut max_mr = 1.0;
        for (&t, &mr) in self.ticks.iter().zip(self.miss_ratios.iter()) {
            if t < min_tick || t > max_tick {
                return Err(Error::InvalidCurve("tick is out of range".into()));
            }
            if !(0.0..=max_mr).contains(&mr) {
                return Err(Error::InvalidCurve("miss_ratio is out of range".into()));
            }
            min_tick = t;
            max_mr = mr;
        }
        Ok(())
    }

    fn interpolate(l_val: f64, r_val: f64, l_dist: u64, r_dist: u64) -> f64 {
        debug_assert!(l_val >= r_val);
        // optionally refuse to interpolate between the min tick and zero
        if mrc::DISABLE_INTERPOLATION_NEAR_INF && (1.0 - l_val) < EPSILON {
            return 1.0;
        }
        let total_dist = (l_dist + r_dist) as f64;
        let l_ratio = r_dist as f64 / total_dist;
        let r_ratio = l_dist as f64 / total_dist;
        l_val * l_ratio + r_val * r_ratio
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn curve() -> MissRatioCurve {
        MissRatioCurve::new(vec![10, 20, 40, 80], vec![0.9, 0.8, 0.7, 0.6])
    }

    fn check(mrc: &mut MissRatioCurve, cache_size: u64, expected: f64) {
        let mr = mrc.get_miss_ratio(cache_size);
        assert!(
            (mr - expected).abs() < 1e-12,
            "cache_size={cache_size}: expected {expected}, got {mr}"
        );
    }

    #[test]
    fn test_basic() {
        let mut mrc = curve();
        mrc.check_sanity().unwrap();
        check(&mut mrc, 0, 1.0);
        check(&mut mrc, 5, 0.95);
        check(&mut mrc, 7, 0.93);
        check(&mut mrc, 10, 0.9);
        check(&mut mrc, 20, 0.8);
        check(&mut mrc, 25, 0.775);
        check(&mut mrc, 30, 0.75);
        check(&mut mrc, 40, 0.7);
        check(&mut mrc, 50, 0.675);
        check(&mut mrc, 60, 0.65);
        check(&mut mrc, 80, 0.6);
    }

    #[test]
    fn test_out_of_range_is_conservative() {
        let mut mrc = curve();
        check(&mut mrc, 100_000, 0.6);
    }

    #[test]
    fn test_memoization_is_bit_identical() {
        let mut mrc = curve();
        let first = mrc.get_miss_ratio(33);
        for _ in 0..8 {
            assert_eq!(mrc.get_miss_ratio(33).to_bits(), first.to_bits());
        }
    }

    #[test]
    fn test_sanity_rejects_non_monotonic() {
        let mrc = MissRatioCurve::new(vec![10, 20], vec![0.5, 0.8]);
        assert!(mrc.check_sanity().is_err());

        let mrc = MissRatioCurve::new(vec![10, 20, 15], vec![0.9, 0.8, 0.7]);
        assert!(mrc.check_sanity().is_err());

        let mrc = MissRatioCurve::new(vec![10], vec![1.5]);
        assert!(mrc.check_sanity().is_err());
    }
}
