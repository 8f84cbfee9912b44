//! Container Registry: an in-memory, per-`api_name` view of worker
//! containers, refreshed from the `ContainerDriver` collaborator and
//! consulted only by the Autoscaler -- never for routing, which goes
//! through the Queue instead. Grounded on the original's `APIContainer`.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::ListImagesOptions;
use bollard::models::{ContainerSummary, ImageSummary, PortBinding};
use bollard::Docker;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::container_name;
use crate::spec_store::{SpecStore, SpecStoreError};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("container driver error: {0}")]
    Bollard(String),

    #[error("{}", _0)]
    SpecStore(#[from] SpecStoreError),
}

impl From<bollard::errors::Error> for DriverError {
    fn from(e: bollard::errors::Error) -> Self {
        DriverError::Bollard(e.to_string())
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Lifecycle state the registry cares about: anything else (paused,
/// dead, removing) is treated as non-running and reaped on refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Restarting,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub container_id: String,
    pub name: String,
    pub image: String,
    pub state: ContainerState,
}

/// Parameters for creating a new worker container, resolved from an
/// `ApiSpec` by the registry before calling the driver.
pub struct NewContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    pub mem_limit: i64,
    pub cpu_shares: i64,
    /// Container-internal ports to publish to the host, e.g. 4200.
    pub ports: Vec<u16>,
}

/// Abstraction over the container orchestration side-effect surface:
/// `create / start / stop / kill / remove / inspect / list /
/// list_images`, mirroring the original's direct `docker-py` calls in
/// `APIContainer`.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    async fn create(&self, spec: &NewContainerSpec) -> DriverResult<String>;
    async fn start(&self, container_id: &str, ports: &[u16]) -> DriverResult<()>;
    async fn stop(&self, container_id: &str) -> DriverResult<()>;
    async fn kill(&self, container_id: &str) -> DriverResult<()>;
    async fn remove(&self, container_id: &str) -> DriverResult<()>;
    async fn inspect(&self, container_id: &str) -> DriverResult<Option<ContainerRecord>>;
    async fn list(&self) -> DriverResult<Vec<ContainerRecord>>;
    async fn list_images(&self) -> DriverResult<Vec<String>>;
}

/// Production driver talking to the local Docker daemon via `bollard`.
pub struct BollardDriver {
    docker: Docker,
}

impl BollardDriver {
    pub fn connect_with_local_defaults() -> DriverResult<Self> {
        Ok(Self {
            docker: Docker::connect_with_local_defaults()?,
        })
    }
}

fn state_from_summary(summary: &ContainerSummary) -> ContainerState {
    match summary.state.as_deref() {
        Some("running") => ContainerState::Running,
        Some("restarting") => ContainerState::Restarting,
        _ => ContainerState::Stopped,
    }
}

fn record_from_summary(summary: ContainerSummary) -> Option<ContainerRecord> {
    let container_id = summary.id.clone()?;
    let name = summary
        .names
        .as_ref()
        .and_then(|names| names.first())
        .map(|n| n.trim_start_matches('/').to_owned())
        .unwrap_or_default();
    let image = summary.image.clone().unwrap_or_default();
    let state = state_from_summary(&summary);
    Some(ContainerRecord {
        container_id,
        name,
        image,
        state,
    })
}

#[async_trait]
impl ContainerDriver for BollardDriver {
    async fn create(&self, spec: &NewContainerSpec) -> DriverResult<String> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        let mut port_bindings = HashMap::new();
        let mut exposed_ports = HashMap::new();
        for port in &spec.ports {
            let key = format!("{}/tcp", port);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: Some("127.0.0.1".to_owned()),
                    host_port: None,
                }]),
            );
        }
        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(env),
            hostname: Some("gateway-worker".to_owned()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(bollard::models::HostConfig {
                memory: Some(spec.mem_limit),
                cpu_shares: Some(spec.cpu_shares),
                port_bindings: Some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        };
        let response = self.docker.create_container(Some(options), config).await?;
        Ok(response.id)
    }

    async fn start(&self, container_id: &str, _ports: &[u16]) -> DriverResult<()> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn stop(&self, container_id: &str) -> DriverResult<()> {
        self.docker
            .stop_container(container_id, Some(StopContainerOptions { t: 5 }))
            .await?;
        Ok(())
    }

    async fn kill(&self, container_id: &str) -> DriverResult<()> {
        self.docker
            .kill_container(container_id, None::<KillContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> DriverResult<()> {
        self.docker
            .remove_container(container_id, None::<RemoveContainerOptions>)
            .await?;
        Ok(())
    }

    async fn inspect(&self, container_id: &str) -> DriverResult<Option<ContainerRecord>> {
        let props = self.docker.inspect_container(container_id, None).await?;
        let container_id = match props.id {
            Some(id) => id,
            None => return Ok(None),
        };
        let name = props
            .name
            .map(|n| n.trim_start_matches('/').to_owned())
            .unwrap_or_default();
        let image = props.config.and_then(|c| c.image).unwrap_or_default();
        let state = match props.state.and_then(|s| s.status) {
            Some(bollard::models::ContainerStateStatusEnum::RUNNING) => ContainerState::Running,
            Some(bollard::models::ContainerStateStatusEnum::RESTARTING) => {
                ContainerState::Restarting
            }
            _ => ContainerState::Stopped,
        };
        Ok(Some(ContainerRecord {
            container_id,
            name,
            image,
            state,
        }))
    }

    async fn list(&self) -> DriverResult<Vec<ContainerRecord>> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let summaries = self.docker.list_containers(Some(options)).await?;
        Ok(summaries.into_iter().filter_map(record_from_summary).collect())
    }

    async fn list_images(&self) -> DriverResult<Vec<String>> {
        let images: Vec<ImageSummary> = self
            .docker
            .list_images(None::<ListImagesOptions<String>>)
            .await?;
        Ok(images.into_iter().map(|i| i.id).collect())
    }
}

/// In-memory view of live containers per API, authoritative only within
/// one reconciliation cycle.
#[derive(Default)]
pub struct ContainerRegistry {
    containers: Mutex<HashMap<String, Vec<String>>>,
    desired_count: Mutex<HashMap<String, u32>>,
    /// Containers seen as neither running nor restarting during the most
    /// recent `refresh_all` whose removal the driver failed to complete,
    /// and which therefore still linger outside the `containers` map.
    stopped_count: Mutex<usize>,
}

impl ContainerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `refresh_all`: enumerate every container the driver reports,
    /// decode its name, drop unparseable ones, delete any that are
    /// neither running nor restarting, and rebuild the `api_name ->
    /// [container_id]` map from what survives. A non-running container
    /// whose removal the driver fails to carry out still exists on the
    /// host after this call returns; it is counted in `num_stopped()`
    /// rather than silently dropped, so the Autoscaler's self-terminate
    /// guard can see it.
    pub async fn refresh_all(&self, driver: &dyn ContainerDriver) -> DriverResult<()> {
        let all = driver.list().await?;
        let mut fresh: HashMap<String, Vec<String>> = HashMap::new();
        let mut stopped = 0usize;

        for record in all {
            if record.state != ContainerState::Running && record.state != ContainerState::Restarting
            {
                if driver.remove(&record.container_id).await.is_err() {
                    stopped += 1;
                }
                continue;
            }
            let Some(api_name) = container_name::api_name_from_container_name(&record.name) else {
                continue;
            };
            fresh.entry(api_name).or_default().push(record.container_id);
        }

        *self.containers.lock().await = fresh;
        *self.stopped_count.lock().await = stopped;
        Ok(())
    }

    /// `ensure_available(api_name)`: create a container if none are
    /// registered for it yet.
    pub async fn ensure_available(
        &self,
        api_name: &str,
        driver: &dyn ContainerDriver,
        spec_store: &dyn SpecStore,
        image_prefix: &str,
        mem_limit: i64,
        cpu_shares: i64,
        queue_endpoint_out: &str,
    ) -> DriverResult<()> {
        let has_any = self
            .containers
            .lock()
            .await
            .get(api_name)
            .map(|c| !c.is_empty())
            .unwrap_or(false);
        if has_any {
            return Ok(());
        }
        self.create_new(
            api_name,
            driver,
            spec_store,
            image_prefix,
            mem_limit,
            cpu_shares,
            queue_endpoint_out,
        )
        .await?;
        Ok(())
    }

    /// `create_new(api_name)`: resolve the spec, synthesize a unique
    /// container name, call `driver.create` then `driver.start`, and
    /// register the result.
    pub async fn create_new(
        &self,
        api_name: &str,
        driver: &dyn ContainerDriver,
        spec_store: &dyn SpecStore,
        image_prefix: &str,
        mem_limit: i64,
        cpu_shares: i64,
        queue_endpoint_out: &str,
    ) -> DriverResult<String> {
        let spec = spec_store.get(api_name).await?;
        let image_name = if spec.image_name.is_empty() {
            format!("{}_{}", image_prefix, api_name)
        } else {
            spec.image_name.clone()
        };
        let now_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let name = container_name::unique_name(api_name, now_nanos);

        let new_spec = NewContainerSpec {
            name: name.clone(),
            image: image_name,
            env: vec![
                ("JBAPI_NAME".to_owned(), api_name.to_owned()),
                ("JBAPI_QUEUE".to_owned(), queue_endpoint_out.to_owned()),
                ("JBAPI_CMD".to_owned(), spec.cmd.clone()),
            ],
            mem_limit,
            cpu_shares,
            ports: vec![4200],
        };

        let container_id = driver.create(&new_spec).await?;
        driver.start(&container_id, &new_spec.ports).await?;
        self.register(api_name, container_id.clone()).await;
        Ok(container_id)
    }

    /// Register a container under `api_name`, seeding `desired_count`
    /// to 1 the first time that API is seen.
    pub async fn register(&self, api_name: &str, container_id: String) {
        self.containers
            .lock()
            .await
            .entry(api_name.to_owned())
            .or_default()
            .push(container_id);
        self.desired_count
            .lock()
            .await
            .entry(api_name.to_owned())
            .or_insert(1);
    }

    pub async fn deregister(&self, api_name: &str, container_id: &str) {
        if let Some(list) = self.containers.lock().await.get_mut(api_name) {
            list.retain(|id| id != container_id);
        }
    }

    pub async fn containers_for(&self, api_name: &str) -> Vec<String> {
        self.containers
            .lock()
            .await
            .get(api_name)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn known_apis(&self) -> Vec<String> {
        self.containers.lock().await.keys().cloned().collect()
    }

    pub async fn num_active(&self) -> usize {
        self.containers.lock().await.values().map(Vec::len).sum()
    }

    /// Containers the last `refresh_all` found neither running nor
    /// restarting and could not remove; still present on the host.
    pub async fn num_stopped(&self) -> usize {
        *self.stopped_count.lock().await
    }

    pub async fn desired(&self, api_name: &str) -> u32 {
        self.desired_count
            .lock()
            .await
            .get(api_name)
            .copied()
            .unwrap_or(0)
    }

    pub async fn set_desired(&self, api_name: &str, value: u32) {
        self.desired_count
            .lock()
            .await
            .insert(api_name.to_owned(), value);
    }
}

pub type SharedContainerRegistry = Arc<ContainerRegistry>;


#[cfg(test)]
mod test {
    use super::mock::MockDriver;
    use super::*;
    use crate::spec_store::{ApiSpec, MockSpecStore};

    #[tokio::test]
    async fn test_register_seeds_desired_count() {
        let registry = ContainerRegistry::new();
        registry.register("echo", "c1".to_owned()).await;
        assert_eq!(registry.desired("echo").await, 1);
        assert_eq!(registry.containers_for("echo").await, vec!["c1".to_owned()]);
    }

    #[tokio::test]
    async fn test_refresh_drops_unparseable_names_and_reaps_dead() {
        let mut driver = MockDriver::new();
        driver.expect_list().returning(|| {
            Ok(vec![
                ContainerRecord {
                    container_id: "c1".to_owned(),
                    name: "api_echo_0000000000000000000000000000000000000000".to_owned(),
                    image: "gw_echo".to_owned(),
                    state: ContainerState::Running,
                },
                ContainerRecord {
                    container_id: "c2".to_owned(),
                    name: "some_other_container".to_owned(),
                    image: "unrelated".to_owned(),
                    state: ContainerState::Running,
                },
                ContainerRecord {
                    container_id: "c3".to_owned(),
                    name: "api_echo_1111111111111111111111111111111111111111".to_owned(),
                    image: "gw_echo".to_owned(),
                    state: ContainerState::Stopped,
                },
            ])
        });
        driver
            .expect_remove()
            .withf(|id| id == "c3")
            .returning(|_| Ok(()));

        let registry = ContainerRegistry::new();
        registry.refresh_all(&driver).await.unwrap();

        assert_eq!(registry.containers_for("echo").await, vec!["c1".to_owned()]);
        assert!(registry.known_apis().await.iter().all(|a| a == "echo"));
    }

    #[tokio::test]
    async fn test_ensure_available_creates_only_when_empty() {
        let mut driver = MockDriver::new();
        driver
            .expect_create()
            .times(1)
            .returning(|_| Ok("new-id".to_owned()));
        driver.expect_start().times(1).returning(|_, _| Ok(()));

        let store = MockSpecStore::default();
        store
            .upsert(ApiSpec::new("echo", "echo.sh", "gw_echo".to_owned()))
            .await
            .unwrap();

        let registry = ContainerRegistry::new();
        registry
            .ensure_available("echo", &driver, &store, "gw", 1024, 1024, "tcp://127.0.0.1:9000")
            .await
            .unwrap();
        registry
            .ensure_available("echo", &driver, &store, "gw", 1024, 1024, "tcp://127.0.0.1:9000")
            .await
            .unwrap();
    }
}
