//! Resource vector algebra
//!
//! Problem model: for a resource type R, a request consumes `d` units upon a
//! cache miss and `(1 - alpha) * d` units upon a cache hit (0 <= alpha <= 1):
//!
//! - `alpha = 0`: cache-independent resource
//! - `alpha = 1`: fully dependent resource, e.g. backing-store I/O
//! - `0 < alpha < 1`: weakly dependent resource, e.g. network bandwidth
//!
//! If a tenant holds `r` units of R at miss ratio `m` and gaining cache
//! lowers the miss ratio by `delta_m`, the allocation that sustains the same
//! throughput shrinks by
//!
//! ```text
//! delta_r = r * (alpha * delta_m) / (1 - alpha + alpha * m)
//! ```
//!
//! Resource mapping: a read consumes client net_bw on a hit, plus db_rcu and
//! store-side net_bw on a miss; a write always consumes net_bw and db_wcu.
//! Demand vectors assume request size is independent of key hotness, so
//! per-request averages suffice.

use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, MulAssign, Sub, SubAssign};

use super::params::{DB_RCU_EPSILON, DB_WCU_EPSILON, NET_BW_EPSILON};

/// The three stateless resources, in units of their own rate
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatelessResrcVec {
    /// Backing-store read capacity units per second
    pub db_rcu: f64,
    /// Backing-store write capacity units per second
    pub db_wcu: f64,
    /// Network bandwidth, bytes per second
    pub net_bw: f64,
}

impl StatelessResrcVec {
    pub fn new(db_rcu: f64, db_wcu: f64, net_bw: f64) -> Self {
        Self {
            db_rcu,
            db_wcu,
            net_bw,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.db_rcu == 0.0 && self.db_wcu == 0.0 && self.net_bw == 0.0
    }

    pub fn is_almost_empty(&self) -> bool {
        self.db_rcu.abs() < DB_RCU_EPSILON
            && self.db_wcu.abs() < DB_WCU_EPSILON
            && self.net_bw.abs() < NET_BW_EPSILON
    }

    pub fn is_almost_equal(&self, other: &Self) -> bool {
        (*self - *other).is_almost_empty()
    }
}

impl Add for StatelessResrcVec {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self::new(
            self.db_rcu + other.db_rcu,
            self.db_wcu + other.db_wcu,
            self.net_bw + other.net_bw,
        )
    }
}

impl AddAssign for StatelessResrcVec {
    fn add_assign(&mut self, other: Self) {
        self.db_rcu += other.db_rcu;
        self.db_wcu += other.db_wcu;
        self.net_bw += other.net_bw;
    }
}

impl Sub for StatelessResrcVec {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        Self::new(
            self.db_rcu - other.db_rcu,
            self.db_wcu - other.db_wcu,
            self.net_bw - other.net_bw,
        )
    }
}

impl SubAssign for StatelessResrcVec {
    fn sub_assign(&mut self, other: Self) {
        self.db_rcu -= other.db_rcu;
        self.db_wcu -= other.db_wcu;
        self.net_bw -= other.net_bw;
    }
}

impl Mul<f64> for StatelessResrcVec {
    type Output = Self;

    fn mul(self, scale_factor: f64) -> Self {
        Self::new(
            self.db_rcu * scale_factor,
            self.db_wcu * scale_factor,
            self.net_bw * scale_factor,
        )
    }
}

impl MulAssign<f64> for StatelessResrcVec {
    fn mul_assign(&mut self, scale_factor: f64) {
        self.db_rcu *= scale_factor;
        self.db_wcu *= scale_factor;
        self.net_bw *= scale_factor;
    }
}

/// Equal division, useful for evenly sharing a pool
impl Div<u32> for StatelessResrcVec {
    type Output = Self;

    fn div(self, div: u32) -> Self {
        let div = div as f64;
        Self::new(self.db_rcu / div, self.db_wcu / div, self.net_bw / div)
    }
}

/// Element-wise min ratio: how many times `other` fits into `self`. This is
/// the improvement-ratio operator; components where `other` is zero drop out
/// of the min.
impl Div for StatelessResrcVec {
    type Output = f64;

    fn div(self, other: Self) -> f64 {
        (self.db_rcu / other.db_rcu)
            .min(self.db_wcu / other.db_wcu)
            .min(self.net_bw / other.net_bw)
    }
}

impl fmt::Display for StatelessResrcVec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{db_rcu={:.2}, db_wcu={:.2}, net_bw={:.2}}}",
            self.db_rcu, self.db_wcu, self.net_bw
        )
    }
}

/// Full resource vector: the stateful cache plus the stateless triple
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResrcVec {
    /// Cache size, bytes
    pub cache_size: u64,
    pub stateless: StatelessResrcVec,
}

impl ResrcVec {
    pub fn new(cache_size: u64, db_rcu: f64, db_wcu: f64, net_bw: f64) -> Self {
        Self {
            cache_size,
            stateless: StatelessResrcVec::new(db_rcu, db_wcu, net_bw),
        }
    }
}

impl Add for ResrcVec {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            cache_size: self.cache_size + other.cache_size,
            stateless: self.stateless + other.stateless,
        }
    }
}

impl AddAssign for ResrcVec {
    fn add_assign(&mut self, other: Self) {
        self.cache_size += other.cache_size;
        self.stateless += other.stateless;
    }
}

impl AddAssign<StatelessResrcVec> for ResrcVec {
    fn add_assign(&mut self, other: StatelessResrcVec) {
        self.stateless += other;
    }
}

impl fmt::Display for ResrcVec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{cache_size={}, db_rcu={:.2}, db_wcu={:.2}, net_bw={:.2}}}",
            self.cache_size, self.stateless.db_rcu, self.stateless.db_wcu, self.stateless.net_bw
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arithmetic() {
        let a = StatelessResrcVec::new(1.0, 2.0, 4.0);
        let b = StatelessResrcVec::new(0.5, 0.5, 1.0);
        assert_eq!(a + b, StatelessResrcVec::new(1.5, 2.5, 5.0));
        assert_eq!(a - b, StatelessResrcVec::new(0.5, 1.5, 3.0));
        assert_eq!(a * 2.0, StatelessResrcVec::new(2.0, 4.0, 8.0));
        assert_eq!(a / 2u32, StatelessResrcVec::new(0.5, 1.0, 2.0));
    }

    #[test]
    fn test_min_ratio_division() {
        let avail = StatelessResrcVec::new(1.0, 4.0, 8.0);
        let sum = StatelessResrcVec::new(2.0, 2.0, 2.0);
        assert_eq!(avail / sum, 0.5);
    }

    #[test]
    fn test_min_ratio_ignores_empty_components() {
        // 0/0 components must not poison the min
        let avail = StatelessResrcVec::new(1.0, 0.0, 8.0);
        let sum = StatelessResrcVec::new(2.0, 0.0, 2.0);
        assert_eq!(avail / sum, 0.5);
    }

    #[test]
    fn test_almost_empty() {
        assert!(StatelessResrcVec::new(0.00001, -0.00001, 0.0).is_almost_empty());
        assert!(!StatelessResrcVec::new(0.1, 0.0, 0.0).is_almost_empty());
    }

    #[test]
    fn test_full_vector_accumulate() {
        let mut total = ResrcVec::default();
        total += ResrcVec::new(100, 1.0, 1.0, 8.0);
        total += ResrcVec::new(200, 2.0, 1.0, 8.0);
        assert_eq!(total, ResrcVec::new(300, 3.0, 2.0, 16.0));
    }
}
