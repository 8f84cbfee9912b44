//! Autoscaler / Maintainer: the periodic reconciliation loop that
//! refreshes the container registry, publishes fleet stats, recomputes
//! desired counts from each queue's EMA, and applies the resulting
//! create/terminate diffs -- grounded on the original's
//! `APIContainer.maintain` / `calc_desired_container_counts` /
//! `publish_container_stats` and `JBApi.do_housekeeping`.
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use sysinfo::{Disks, System};

use crate::cloud::CloudHost;
use crate::connector::ConnectorPool;
use crate::queue::QueueRegistry;
use crate::registry::{ContainerDriver, ContainerRegistry, DriverError};
use crate::spec_store::SpecStore;

/// Reporting threshold `ContainersUsed` is normalized against; it caps
/// the *percentage* published, not the number of containers a single
/// `create_new` call will allow -- the spec's `m > 1` growth is
/// otherwise unbounded, per the Open Question resolution recorded in
/// DESIGN.md.
pub struct MaintainerConfig {
    pub period: Duration,
    pub image_prefix: String,
    pub mem_limit: i64,
    pub cpu_shares: i64,
    pub max_containers: u32,
    pub scale_down_enabled: bool,
}

/// Rolling system-stat state carried across cycles: the previous CPU
/// reading (to average into `CpuUsed`) and the disk-usage baseline
/// captured on the first cycle (subtracted out of later readings).
struct StatsState {
    sys: System,
    last_cpu_pct: Option<f32>,
    initial_disk_used_pct: Option<f64>,
}

impl StatsState {
    fn new() -> Self {
        let mut sys = System::new_all();
        sys.refresh_cpu_usage();
        Self {
            sys,
            last_cpu_pct: None,
            initial_disk_used_pct: None,
        }
    }
}

pub struct Maintainer {
    config: MaintainerConfig,
    queues: Arc<QueueRegistry>,
    registry: Arc<ContainerRegistry>,
    connectors: Arc<ConnectorPool>,
    driver: Arc<dyn ContainerDriver>,
    cloud: Arc<dyn CloudHost>,
    spec_store: Arc<dyn SpecStore>,
    stats: StdMutex<StatsState>,
}

impl Maintainer {
    pub fn new(
        config: MaintainerConfig,
        queues: Arc<QueueRegistry>,
        registry: Arc<ContainerRegistry>,
        connectors: Arc<ConnectorPool>,
        driver: Arc<dyn ContainerDriver>,
        cloud: Arc<dyn CloudHost>,
        spec_store: Arc<dyn SpecStore>,
    ) -> Self {
        Self {
            config,
            queues,
            registry,
            connectors,
            driver,
            cloud,
            spec_store,
            stats: StdMutex::new(StatsState::new()),
        }
    }

    /// Spawn the periodic reconciliation task. Returns the join handle
    /// so callers (tests, graceful shutdown) can manage its lifetime.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.period);
            loop {
                interval.tick().await;
                if let Err(e) = self.run_cycle().await {
                    warn!("maintenance cycle failed: {}", e);
                }
            }
        })
    }

    /// One reconciliation cycle: refresh -> stats -> recompute -> apply
    /// -> optional self-terminate, in that order per the spec.
    pub async fn run_cycle(&self) -> Result<(), DriverError> {
        info!("Starting container maintenance...");
        self.registry.refresh_all(self.driver.as_ref()).await?;
        self.publish_stats().await;
        self.recompute_desired_counts().await;
        self.apply_diffs().await;
        self.maybe_self_terminate().await;
        info!("Finished container maintenance.");
        Ok(())
    }

    /// Publish `NumActiveContainers`, `MemUsed`, `DiskUsed`,
    /// `ContainersUsed`, and `Load` to the cloud host.
    async fn publish_stats(&self) {
        let active = self.registry.num_active().await as i64;
        self.cloud.publish_stat("NumActiveContainers", active, false);

        let (cpu_used_pct, mem_used_pct, disk_used_pct) = {
            let mut stats = self.stats.lock().unwrap();
            stats.sys.refresh_cpu_usage();
            stats.sys.refresh_memory();

            let curr_cpu: f32 =
                stats.sys.cpus().iter().map(|c| c.cpu_usage()).sum::<f32>()
                    / stats.sys.cpus().len().max(1) as f32;
            let last_cpu = stats.last_cpu_pct.unwrap_or(curr_cpu);
            stats.last_cpu_pct = Some(curr_cpu);
            let cpu_used_pct = ((curr_cpu + last_cpu) / 2.0) as i64;

            let total_mem = stats.sys.total_memory().max(1);
            let mem_used_pct = (stats.sys.used_memory() * 100 / total_mem) as i64;

            let disks = Disks::new_with_refreshed_list();
            let mut raw_disk_used_pct = 0.0_f64;
            for disk in disks.list() {
                let total = disk.total_space().max(1);
                let used = total.saturating_sub(disk.available_space());
                let pct = used as f64 * 100.0 / total as f64;
                raw_disk_used_pct = raw_disk_used_pct.max(pct);
            }
            let baseline = *stats
                .initial_disk_used_pct
                .get_or_insert(raw_disk_used_pct);
            let disk_used_pct = (raw_disk_used_pct - baseline).max(0.0) as i64;

            (cpu_used_pct, mem_used_pct, disk_used_pct)
        };

        self.cloud.publish_stat("MemUsed", mem_used_pct, true);
        self.cloud.publish_stat("DiskUsed", disk_used_pct, true);

        let containers_used_pct =
            (100 * active / self.config.max_containers.max(1) as i64).min(100);
        self.cloud
            .publish_stat("ContainersUsed", containers_used_pct, true);

        let load = [containers_used_pct, disk_used_pct, mem_used_pct, cpu_used_pct]
            .into_iter()
            .max()
            .unwrap_or(0);
        self.cloud.publish_stat("Load", load, true);
    }

    /// For every API the registry knows about, recompute its desired
    /// container count from `mean_outstanding`, per spec.md §4.5:
    /// `m > 1` grows by `floor(m)`, `m < 0.01` drains to zero, `0.01 <=
    /// m < 0.5` decays by one (never below one), otherwise unchanged.
    async fn recompute_desired_counts(&self) {
        for api_name in self.registry.known_apis().await {
            let queue = self.queues.get(&api_name).await;
            let Some(queue) = queue else {
                self.registry.set_desired(&api_name, 0).await;
                continue;
            };

            let mean = queue.mean_outstanding().await;
            let mut desired = self.registry.desired(&api_name).await;
            if mean > 1.0 {
                desired += mean.floor() as u32;
            } else if mean < 0.01 {
                desired = 0;
            } else if mean < 0.5 && desired > 1 {
                desired -= 1;
            }
            self.registry.set_desired(&api_name, desired).await;

            if queue.num_outstanding() == 0 {
                queue.incr_outstanding(0).await;
            }
        }
    }

    /// Diff `current` vs `desired` per API: send `:terminate` for each
    /// excess container (reaped on the next refresh), or create new
    /// ones to make up a shortfall.
    async fn apply_diffs(&self) {
        for api_name in self.registry.known_apis().await {
            let current = self.registry.containers_for(&api_name).await.len() as i64;
            let desired = self.registry.desired(&api_name).await as i64;
            let mut diff = current - desired;

            while diff > 0 {
                if let Err(e) = self
                    .connectors
                    .send_terminate(&api_name, self.spec_store.as_ref())
                    .await
                {
                    warn!("failed to send terminate to {}: {}", api_name, e);
                }
                diff -= 1;
            }

            while diff < 0 {
                let egress = match self.spec_store.get(&api_name).await {
                    Ok(spec) => format!("tcp://0.0.0.0:{}", spec.endpoint_out),
                    Err(_) => break,
                };
                if let Err(e) = self
                    .registry
                    .create_new(
                        &api_name,
                        self.driver.as_ref(),
                        self.spec_store.as_ref(),
                        &self.config.image_prefix,
                        self.config.mem_limit,
                        self.config.cpu_shares,
                        &egress,
                    )
                    .await
                {
                    warn!("failed to create container for {}: {}", api_name, e);
                    break;
                }
                diff += 1;
            }
        }
    }

    /// Self-terminate this instance when scale-down is enabled, there
    /// are no active or stopped containers left, and the cloud host
    /// agrees termination is allowed.
    async fn maybe_self_terminate(&self) {
        if !self.config.scale_down_enabled {
            return;
        }
        if self.registry.num_active().await != 0 {
            return;
        }
        if self.registry.num_stopped().await != 0 {
            return;
        }
        if !self.cloud.can_terminate(false).await {
            return;
        }
        info!("terminating to scale down");
        self.cloud.terminate_instance().await;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cloud::LocalCloudHost;
    use crate::registry::mock::MockDriver;
    use crate::registry::ContainerRecord;
    use crate::server::metrics::Metrics;
    use crate::spec_store::{ApiSpec, MockSpecStore};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Test double that always permits termination, so tests can
    /// distinguish "the cloud host refused" from "the registry guard
    /// refused" -- `LocalCloudHost::can_terminate` always returns false,
    /// which would mask the registry-side assertions below.
    #[derive(Default)]
    struct AlwaysTerminable {
        terminated: AtomicBool,
    }

    #[async_trait::async_trait]
    impl CloudHost for AlwaysTerminable {
        fn local_ip(&self) -> Option<String> {
            None
        }

        async fn can_terminate(&self, _force: bool) -> bool {
            true
        }

        async fn terminate_instance(&self) {
            self.terminated.store(true, Ordering::SeqCst);
        }

        fn publish_stat(&self, _name: &str, _value: i64, _is_gauge: bool) {}
    }

    fn config() -> MaintainerConfig {
        MaintainerConfig {
            period: Duration::from_secs(300),
            image_prefix: "gw".to_owned(),
            mem_limit: 1024,
            cpu_shares: 1024,
            max_containers: 10,
            scale_down_enabled: true,
        }
    }

    #[tokio::test]
    async fn test_desired_scales_up_on_backlog() {
        let store = Arc::new(MockSpecStore::default());
        store
            .upsert(ApiSpec::new("busy", "busy.sh", "gw_busy".to_owned()))
            .await
            .unwrap();
        let queues = Arc::new(QueueRegistry::new());
        let queue = queues.get_or_create("busy", store.as_ref()).await.unwrap();
        for _ in 0..4 {
            queue.incr_outstanding(5).await;
        }

        let registry = Arc::new(ContainerRegistry::new());
        registry.register("busy", "c1".to_owned()).await;

        let connectors = Arc::new(ConnectorPool::new(Arc::clone(&queues)));
        let driver: Arc<dyn ContainerDriver> = Arc::new(MockDriver::new());
        let cloud: Arc<dyn CloudHost> = Arc::new(LocalCloudHost::new(Metrics::noop().client.unwrap()));

        let maintainer = Maintainer::new(
            config(),
            queues,
            Arc::clone(&registry),
            connectors,
            driver,
            cloud,
            store,
        );
        maintainer.recompute_desired_counts().await;
        assert!(registry.desired("busy").await >= 1);
    }

    #[tokio::test]
    async fn test_desired_drains_to_zero_when_idle() {
        let store = Arc::new(MockSpecStore::default());
        store
            .upsert(ApiSpec::new("echo", "echo.sh", "gw_echo".to_owned()))
            .await
            .unwrap();
        let queues = Arc::new(QueueRegistry::new());
        let queue = queues.get_or_create("echo", store.as_ref()).await.unwrap();
        for _ in 0..20 {
            queue.incr_outstanding(0).await;
        }

        let registry = Arc::new(ContainerRegistry::new());
        registry.register("echo", "c1".to_owned()).await;

        let connectors = Arc::new(ConnectorPool::new(Arc::clone(&queues)));
        let driver: Arc<dyn ContainerDriver> = Arc::new(MockDriver::new());
        let cloud: Arc<dyn CloudHost> = Arc::new(LocalCloudHost::new(Metrics::noop().client.unwrap()));

        let maintainer = Maintainer::new(
            config(),
            queues,
            Arc::clone(&registry),
            connectors,
            driver,
            cloud,
            store,
        );
        maintainer.recompute_desired_counts().await;
        assert_eq!(registry.desired("echo").await, 0);
    }

    #[tokio::test]
    async fn test_desired_drops_to_zero_when_spec_released() {
        let store = Arc::new(MockSpecStore::default());
        let queues = Arc::new(QueueRegistry::new());
        let registry = Arc::new(ContainerRegistry::new());
        registry.register("gone", "c1".to_owned()).await;

        let connectors = Arc::new(ConnectorPool::new(Arc::clone(&queues)));
        let driver: Arc<dyn ContainerDriver> = Arc::new(MockDriver::new());
        let cloud: Arc<dyn CloudHost> = Arc::new(LocalCloudHost::new(Metrics::noop().client.unwrap()));

        let maintainer = Maintainer::new(
            config(),
            queues,
            Arc::clone(&registry),
            connectors,
            driver,
            cloud,
            store,
        );
        maintainer.recompute_desired_counts().await;
        assert_eq!(registry.desired("gone").await, 0);
    }

    #[tokio::test]
    async fn test_apply_diffs_creates_missing_containers() {
        let store = Arc::new(MockSpecStore::default());
        store
            .upsert(ApiSpec::new("echo", "echo.sh", "gw_echo".to_owned()))
            .await
            .unwrap();
        let queues = Arc::new(QueueRegistry::new());
        let registry = Arc::new(ContainerRegistry::new());
        registry.register("echo", "placeholder".to_owned()).await;
        registry.deregister("echo", "placeholder").await;
        registry.set_desired("echo", 2).await;

        let mut driver = MockDriver::new();
        driver.expect_create().times(2).returning(|_| Ok("id".to_owned()));
        driver.expect_start().times(2).returning(|_, _| Ok(()));

        let connectors = Arc::new(ConnectorPool::new(Arc::clone(&queues)));
        let cloud: Arc<dyn CloudHost> = Arc::new(LocalCloudHost::new(Metrics::noop().client.unwrap()));

        let maintainer = Maintainer::new(
            config(),
            queues,
            Arc::clone(&registry),
            connectors,
            Arc::new(driver),
            cloud,
            store,
        );
        maintainer.apply_diffs().await;
        assert_eq!(registry.containers_for("echo").await.len(), 2);
    }

    #[tokio::test]
    async fn test_self_terminates_when_active_and_stopped_are_both_zero() {
        let store = Arc::new(MockSpecStore::default());
        let queues = Arc::new(QueueRegistry::new());
        let registry = Arc::new(ContainerRegistry::new());

        let mut driver = MockDriver::new();
        driver.expect_list().returning(|| Ok(vec![]));
        registry.refresh_all(&driver).await.unwrap();

        let connectors = Arc::new(ConnectorPool::new(Arc::clone(&queues)));
        let cloud = Arc::new(AlwaysTerminable::default());

        let maintainer = Maintainer::new(
            config(),
            queues,
            Arc::clone(&registry),
            connectors,
            Arc::new(driver),
            Arc::clone(&cloud) as Arc<dyn CloudHost>,
            store,
        );
        maintainer.maybe_self_terminate().await;
        assert!(cloud.terminated.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_lingering_stopped_container_blocks_self_termination() {
        // A container the driver fails to remove during refresh is
        // neither running nor counted active, but it still exists on
        // the host -- self-termination must not proceed while it does.
        let store = Arc::new(MockSpecStore::default());
        let queues = Arc::new(QueueRegistry::new());
        let registry = Arc::new(ContainerRegistry::new());

        let mut driver = MockDriver::new();
        driver.expect_list().returning(|| {
            Ok(vec![ContainerRecord {
                container_id: "stuck".to_owned(),
                name: "api_echo_0000000000000000000000000000000000000000".to_owned(),
                image: "gw_echo".to_owned(),
                state: crate::registry::ContainerState::Stopped,
            }])
        });
        driver
            .expect_remove()
            .withf(|id| id == "stuck")
            .returning(|_| Err(DriverError::Bollard("remove failed".to_owned())));
        registry.refresh_all(&driver).await.unwrap();
        assert_eq!(registry.num_active().await, 0);
        assert_eq!(registry.num_stopped().await, 1);

        let connectors = Arc::new(ConnectorPool::new(Arc::clone(&queues)));
        let cloud = Arc::new(AlwaysTerminable::default());

        let maintainer = Maintainer::new(
            config(),
            queues,
            Arc::clone(&registry),
            connectors,
            Arc::new(driver),
            Arc::clone(&cloud) as Arc<dyn CloudHost>,
            store,
        );
        maintainer.maybe_self_terminate().await;
        assert!(!cloud.terminated.load(Ordering::SeqCst));
    }
}
