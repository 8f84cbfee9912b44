//! HTTP-to-container API gateway control plane.
#[macro_use]
extern crate slog_scope;

use std::error::Error;
use std::sync::Arc;

use docopt::Docopt;
use serde::Deserialize;
use serde_json::json;

use apigateway::autoscaler::{Maintainer, MaintainerConfig};
use apigateway::cloud::{CloudHost, LocalCloudHost};
use apigateway::connector::ConnectorPool;
use apigateway::jobbus::{JobBus, Opcode};
use apigateway::logging::{self, init_logging};
use apigateway::queue::QueueRegistry;
use apigateway::registry::{BollardDriver, ContainerDriver, ContainerRegistry};
use apigateway::server::metrics::metrics_from_opts;
use apigateway::server::Server;
use apigateway::settings::Settings;
use apigateway::spec_store::{CachedSpecStore, SpecStore, SqliteSpecStore};

const USAGE: &str = "
Usage: apigateway [options]

Options:
    -h, --help               Show this message.
    --config=CONFIGFILE      Gateway configuration file path.
";

#[derive(Debug, Deserialize)]
struct Args {
    flag_config: Option<String>,
}

#[actix_web::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args: Args = Docopt::new(USAGE)
        .and_then(|d| d.deserialize())
        .unwrap_or_else(|e| e.exit());
    let settings = Settings::with_env_and_config_file(args.flag_config.as_deref())?;
    init_logging(!settings.human_logs).expect("Logging failed to initialize");
    debug!("Starting up...");

    let _sentry = settings.sentry_dsn.as_ref().map(|dsn| {
        sentry::init((
            dsn.clone(),
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..sentry::ClientOptions::default()
            },
        ))
    });

    let spec_store: Arc<dyn SpecStore> = Arc::new(CachedSpecStore::new(SqliteSpecStore::new(
        &settings.database_url,
        settings.database_pool_max_size,
    )?));

    let driver: Arc<dyn ContainerDriver> = match BollardDriver::connect_with_local_defaults() {
        Ok(driver) => Arc::new(driver),
        Err(e) => {
            warn!("no container driver available ({}); worker containers cannot be created", e);
            Arc::new(NullDriver)
        }
    };

    let metrics = metrics_from_opts(
        env!("CARGO_PKG_NAME"),
        settings.statsd_host.as_deref(),
        settings.statsd_port,
    )?;
    let cloud: Arc<dyn CloudHost> = Arc::new(LocalCloudHost::new(metrics.clone()));

    let queues = Arc::new(QueueRegistry::new());
    let connectors = Arc::new(ConnectorPool::new(Arc::clone(&queues)));
    let registry = Arc::new(ContainerRegistry::new());

    let mut job_bus = JobBus::new(
        settings.job_bus_secret.clone(),
        settings.job_bus_broadcast_port,
        settings.job_bus_query_port,
    );
    register_job_bus_handlers(&mut job_bus, Arc::clone(&registry), Arc::clone(&cloud));
    let job_bus = Arc::new(job_bus);
    {
        let broadcast_bus = Arc::clone(&job_bus);
        tokio::spawn(async move {
            if let Err(e) = broadcast_bus.serve_broadcast().await {
                error!("job bus broadcast listener stopped: {}", e);
            }
        });
        let query_bus = Arc::clone(&job_bus);
        tokio::spawn(async move {
            if let Err(e) = query_bus.serve_query().await {
                error!("job bus query listener stopped: {}", e);
            }
        });
    }

    let maintainer = Arc::new(Maintainer::new(
        MaintainerConfig {
            period: std::time::Duration::from_secs(settings.maintenance_period_secs),
            image_prefix: settings.image_prefix.clone(),
            mem_limit: settings.mem_limit,
            cpu_shares: settings.cpu_shares,
            max_containers: settings.max_containers,
            scale_down_enabled: settings.scale_down_enabled,
        },
        Arc::clone(&queues),
        Arc::clone(&registry),
        Arc::clone(&connectors),
        Arc::clone(&driver),
        Arc::clone(&cloud),
        Arc::clone(&spec_store),
    ));
    let _maintainer_task = maintainer.spawn();

    let banner = settings.banner();
    let server = Server::with_settings(
        settings,
        spec_store,
        queues,
        connectors,
        registry,
        driver,
        cloud,
        job_bus,
        metrics,
    )
    .await?;
    info!("Server running on {}", banner);
    server.await?;
    info!("Server closing");
    logging::reset_logging();

    Ok(())
}

/// Wires the subset of job-bus opcodes that are fully handled inside
/// this control plane. `LaunchSession`/`AutoActivate`/`UpdateImage`/
/// `BackupCleanup` have no handler registered: their real work lives in
/// the out-of-scope session-manager collaborator the original
/// conflated into one process, so an unhandled message there is
/// expected and simply logged by the receiver as "no handler".
fn register_job_bus_handlers(
    job_bus: &mut JobBus,
    registry: Arc<ContainerRegistry>,
    cloud: Arc<dyn CloudHost>,
) {
    job_bus.on_broadcast(
        Opcode::CollectStats,
        Arc::new(|_data| {
            info!("job bus: collect-stats requested by peer");
        }),
    );
    job_bus.on_broadcast(
        Opcode::RefreshDisks,
        Arc::new(|_data| {
            info!("job bus: refresh-disks requested by peer");
        }),
    );
    job_bus.on_broadcast(Opcode::RecordPerfCounters, Arc::new(|_data| {}));
    job_bus.on_broadcast(Opcode::PluginMaintenance, Arc::new(|_data| {}));
    job_bus.on_broadcast(Opcode::PluginTask, Arc::new(|_data| {}));

    job_bus.on_query(
        Opcode::ApiStatus,
        Arc::new({
            let registry = Arc::clone(&registry);
            move |_data| {
                let registry = Arc::clone(&registry);
                futures::executor::block_on(async move {
                    json!({ "apis": registry.known_apis().await })
                })
            }
        }),
    );
    job_bus.on_query(
        Opcode::IsTerminating,
        Arc::new(move |_data| {
            let cloud = Arc::clone(&cloud);
            futures::executor::block_on(async move { json!({ "terminating": cloud.can_terminate(false).await }) })
        }),
    );
}

/// No-op `ContainerDriver` used when no container runtime is reachable
/// at startup (e.g. local development without Docker); the HTTP surface
/// and job bus still come up, but container maintenance logs a driver
/// error every cycle instead of crashing the process.
struct NullDriver;

#[async_trait::async_trait]
impl ContainerDriver for NullDriver {
    async fn create(
        &self,
        _spec: &apigateway::registry::NewContainerSpec,
    ) -> apigateway::registry::DriverResult<String> {
        Err(apigateway::registry::DriverError::Bollard(
            "no container driver configured".to_owned(),
        ))
    }

    async fn start(&self, _container_id: &str, _ports: &[u16]) -> apigateway::registry::DriverResult<()> {
        Ok(())
    }

    async fn stop(&self, _container_id: &str) -> apigateway::registry::DriverResult<()> {
        Ok(())
    }

    async fn kill(&self, _container_id: &str) -> apigateway::registry::DriverResult<()> {
        Ok(())
    }

    async fn remove(&self, _container_id: &str) -> apigateway::registry::DriverResult<()> {
        Ok(())
    }

    async fn inspect(
        &self,
        _container_id: &str,
    ) -> apigateway::registry::DriverResult<Option<apigateway::registry::ContainerRecord>> {
        Ok(None)
    }

    async fn list(&self) -> apigateway::registry::DriverResult<Vec<apigateway::registry::ContainerRecord>> {
        Ok(Vec::new())
    }

    async fn list_images(&self) -> apigateway::registry::DriverResult<Vec<String>> {
        Ok(Vec::new())
    }
}
