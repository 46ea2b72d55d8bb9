//! Periodic allocation controller
//!
//! Runs the allocator in-process on a timer: every interval it snapshots
//! each registered instance's statistics, derives the demand vector and
//! net-bandwidth alpha from the hypothetical consumption counters, builds a
//! miss ratio curve from the ghost report, and applies the computed
//! allocation through each instance's resource controller. It reads command
//! level snapshots only and never touches per-request state.
//!
//! Demand derivation follows the resource model: with
//! `net_if_hit = (1 - alpha) * net_if_miss` per request,
//! `alpha = 1 - net_if_hit / net_if_miss`. Per-request demand uses the
//! counter deltas since the previous pass, so the vector tracks the current
//! workload mix rather than all of history.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, info, trace, warn};

use crate::alloc::{AllocParams, AllocPolicy, Allocator, MissRatioCurve, ResrcVec, StatelessResrcVec};
use crate::instance::CacheInstance;
use crate::stats::RequestStats;

use super::framework::{RestartPolicy, Service, ServiceError, ServiceStatus};

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Interval between allocation passes
    pub alloc_interval: Duration,

    /// Phase selection for the allocator
    pub policy: AllocPolicy,

    /// Trading parameters
    pub params: AllocParams,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            alloc_interval: Duration::from_secs(10),
            policy: AllocPolicy::default(),
            params: AllocParams::default(),
        }
    }
}

/// Counters observed by the controller
#[derive(Debug, Default, Clone)]
pub struct ControllerStats {
    /// Allocation passes attempted
    pub passes: u64,
    /// Passes skipped because a tenant had no usable data yet
    pub skipped: u64,
    /// Improvement ratio of the last completed pass
    pub last_improve_ratio: f64,
}

struct TenantSlot {
    instance: Arc<CacheInstance>,
    last: Option<RequestStats>,
}

/// Background service driving periodic reallocation
pub struct AllocationController {
    config: ControllerConfig,
    tenants: RwLock<Vec<TenantSlot>>,
    status: RwLock<ServiceStatus>,
    stats: RwLock<ControllerStats>,
}

impl AllocationController {
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            config,
            tenants: RwLock::new(Vec::new()),
            status: RwLock::new(ServiceStatus::Stopped),
            stats: RwLock::new(ControllerStats::default()),
        }
    }

    pub fn add_instance(&self, instance: Arc<CacheInstance>) {
        self.tenants.write().push(TenantSlot {
            instance,
            last: None,
        });
    }

    pub fn stats(&self) -> ControllerStats {
        self.stats.read().clone()
    }

    /// One allocation pass. Public so tests and drivers can run it without
    /// the timer.
    pub fn run_alloc_pass(&self) {
        let mut tenants = self.tenants.write();
        if tenants.len() <= 1 {
            return;
        }

        let mut allocator = Allocator::new(self.config.policy, self.config.params.clone());
        let mut inputs_ok = true;

        for slot in tenants.iter_mut() {
            let (snapshot, report) = slot.instance.stats_report();
            let caps = slot.instance.resrc_get();

            let Some(report) = report else {
                debug!("allocation pass skipped: tenant has no miss-ratio report yet");
                inputs_ok = false;
                break;
            };
            if caps.cache_size == 0 {
                debug!("allocation pass skipped: tenant has no cache cap yet");
                inputs_ok = false;
                break;
            }

            let last = slot.last.clone().unwrap_or_default();
            let req_delta = snapshot.req_cnt.saturating_sub(last.req_cnt);
            if req_delta == 0 {
                debug!("allocation pass skipped: tenant saw no requests");
                inputs_ok = false;
                break;
            }

            // per-request demand at 100% miss, from the delta window
            let demand = StatelessResrcVec::new(
                (snapshot.db_rcu_consump_if_miss - last.db_rcu_consump_if_miss) as f64
                    / req_delta as f64,
                (snapshot.db_wcu_consump - last.db_wcu_consump) as f64 / req_delta as f64,
                (snapshot.net_bw_consump_if_miss - last.net_bw_consump_if_miss) as f64
                    / req_delta as f64,
            );
            let net_if_miss = snapshot.net_bw_consump_if_miss - last.net_bw_consump_if_miss;
            let net_if_hit = snapshot.net_bw_consump_if_hit - last.net_bw_consump_if_hit;
            let alpha = if net_if_miss > 0 {
                (1.0 - net_if_hit as f64 / net_if_miss as f64).clamp(0.0, 1.0)
            } else {
                0.0
            };

            let miss_ratios: Vec<f64> = report
                .hit_cnt
                .iter()
                .zip(report.miss_cnt.iter())
                .map(|(&h, &m)| if h + m == 0 { 1.0 } else { m as f64 / (h + m) as f64 })
                .collect();
            let mrc = MissRatioCurve::new(report.ticks.clone(), miss_ratios);
            if let Err(e) = mrc.check_sanity() {
                warn!(error = %e, "allocation pass skipped: unusable miss-ratio curve");
                inputs_ok = false;
                break;
            }

            let base = ResrcVec::new(caps.cache_size, caps.db_rcu, caps.db_wcu, caps.net_bw);
            allocator.add_tenant(demand, base, mrc, alpha);
            slot.last = Some(snapshot);
        }

        let mut stats = self.stats.write();
        stats.passes += 1;
        if !inputs_ok {
            stats.skipped += 1;
            return;
        }

        let improve_ratio = allocator.do_alloc();
        stats.last_improve_ratio = improve_ratio;
        drop(stats);

        for (slot, resrc) in tenants.iter().zip(allocator.alloc_result()) {
            slot.instance.resrc_set(
                resrc.cache_size as i64,
                resrc.stateless.db_rcu,
                resrc.stateless.db_wcu,
                resrc.stateless.net_bw,
            );
            trace!(cache_size = resrc.cache_size, "caps applied");
        }
        info!(improve_ratio, "allocation pass applied");
    }
}

#[async_trait::async_trait]
impl Service for AllocationController {
    async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError> {
        *self.status.write() = ServiceStatus::Running;
        debug!(
            interval_secs = self.config.alloc_interval.as_secs(),
            "allocation controller started"
        );

        let mut tick = interval(self.config.alloc_interval);

        loop {
            tokio::select! {
                result = shutdown.recv() => {
                    match result {
                        Ok(()) | Err(broadcast::error::RecvError::Closed) => {
                            debug!("allocation controller received shutdown signal");
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(missed = n, "controller broadcast receiver lagged");
                        }
                    }
                }

                _ = tick.tick() => {
                    // snapshot + trade loop is synchronous; keep it off the
                    // async reactor
                    tokio::task::block_in_place(|| self.run_alloc_pass());
                }
            }
        }

        *self.status.write() = ServiceStatus::Stopped;
        debug!("allocation controller stopped");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "allocation_controller"
    }

    fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }

    fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy::OnFailure {
            max_retries: 5,
            backoff: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DynamoConfig, InstanceConfig};

    fn mock_instance(dir: &tempfile::TempDir, idx: usize) -> Arc<CacheInstance> {
        let config = InstanceConfig {
            dynamo: DynamoConfig {
                table: "t".into(),
                mock: true,
            },
            ghost: crate::config::GhostRange {
                tick: 32,
                min_tick: 32,
                max_tick: 256,
            },
            dump_path: dir.path().join(format!("dump-{idx}.ghc")),
            ..InstanceConfig::new()
        };
        Arc::new(CacheInstance::new(config, None).unwrap())
    }

    #[test]
    fn test_pass_skips_without_data() {
        let dir = tempfile::tempdir().unwrap();
        let controller = AllocationController::new(ControllerConfig::default());
        controller.add_instance(mock_instance(&dir, 0));
        controller.add_instance(mock_instance(&dir, 1));

        controller.run_alloc_pass();
        let stats = controller.stats();
        assert_eq!(stats.passes, 1);
        assert_eq!(stats.skipped, 1);
    }

    #[test]
    fn test_single_tenant_never_runs() {
        let dir = tempfile::tempdir().unwrap();
        let controller = AllocationController::new(ControllerConfig::default());
        controller.add_instance(mock_instance(&dir, 0));
        controller.run_alloc_pass();
        assert_eq!(controller.stats().passes, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_service_lifecycle() {
        let controller = Arc::new(AllocationController::new(ControllerConfig {
            alloc_interval: Duration::from_millis(20),
            ..Default::default()
        }));
        assert_eq!(controller.status(), ServiceStatus::Stopped);

        let (tx, rx) = broadcast::channel(1);
        let handle = {
            let c = controller.clone();
            tokio::spawn(async move { c.start(rx).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(controller.status(), ServiceStatus::Running);

        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(controller.status(), ServiceStatus::Stopped);
    }
}
