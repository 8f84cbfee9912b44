//! Main application server: wires the process-global state (queues,
//! connector pool, container registry, job bus) into an actix-web app
//! and exposes the HTTP + management surface, grounded on the
//! teacher's `server/mod.rs` / `ServerState` / `build_app!` shape.
use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{dev, http::Method, web, App, HttpServer};
use cadence::StatsdClient;

use crate::cloud::CloudHost;
use crate::connector::ConnectorPool;
use crate::error::ApiError;
use crate::jobbus::JobBus;
use crate::queue::QueueRegistry;
use crate::registry::{ContainerDriver, ContainerRegistry};
use crate::settings::Settings;
use crate::spec_store::SpecStore;

pub mod handlers;
pub mod metrics;
pub mod sentry_middleware;

/// Global HTTP state handed to every request handler via `web::Data`.
pub struct ServerState {
    pub spec_store: Arc<dyn SpecStore>,
    pub queues: Arc<QueueRegistry>,
    pub connectors: Arc<ConnectorPool>,
    pub registry: Arc<ContainerRegistry>,
    pub driver: Arc<dyn ContainerDriver>,
    pub cloud: Arc<dyn CloudHost>,
    pub job_bus: Arc<JobBus>,
    pub metrics: StatsdClient,
    pub image_prefix: String,
    pub mem_limit: i64,
    pub cpu_shares: i64,
}

pub struct Server;

impl Server {
    /// Build the actix-web app bound to `settings.host`/`settings.port`.
    /// `queues`/`connectors`/`registry` are passed in rather than built
    /// here so the caller (`main.rs`) can hand the identical instances
    /// to the `Maintainer` -- the HTTP surface and the reconciliation
    /// loop must observe the same process-global state.
    #[allow(clippy::too_many_arguments)]
    pub async fn with_settings(
        settings: Settings,
        spec_store: Arc<dyn SpecStore>,
        queues: Arc<QueueRegistry>,
        connectors: Arc<ConnectorPool>,
        registry: Arc<ContainerRegistry>,
        driver: Arc<dyn ContainerDriver>,
        cloud: Arc<dyn CloudHost>,
        job_bus: Arc<JobBus>,
        metrics: StatsdClient,
    ) -> Result<dev::Server, ApiError> {
        let host = settings.host.clone();
        let port = settings.port;
        let image_prefix = settings.image_prefix.clone();
        let mem_limit = settings.mem_limit;
        let cpu_shares = settings.cpu_shares;
        let cors_settings = settings.clone();

        let server = HttpServer::new(move || {
            let state = ServerState {
                spec_store: Arc::clone(&spec_store),
                queues: Arc::clone(&queues),
                connectors: Arc::clone(&connectors),
                registry: Arc::clone(&registry),
                driver: Arc::clone(&driver),
                cloud: Arc::clone(&cloud),
                job_bus: Arc::clone(&job_bus),
                metrics: metrics.clone(),
                image_prefix: image_prefix.clone(),
                mem_limit,
                cpu_shares,
            };

            App::new()
                .app_data(web::Data::new(state))
                .wrap(sentry_middleware::SentryWrapper)
                .wrap(build_cors(&cors_settings))
                .service(
                    web::resource("/api/{tail:.*}")
                        .route(web::get().to(handlers::api_dispatch))
                        .route(web::post().to(handlers::api_dispatch)),
                )
                .service(
                    web::resource("/api_management")
                        .route(web::get().to(handlers::api_management))
                        .route(web::post().to(handlers::api_management)),
                )
                .service(web::resource("/__heartbeat__").route(web::get().to(handlers::heartbeat)))
                .service(
                    web::resource("/__lbheartbeat__").route(web::get().to(handlers::lbheartbeat)),
                )
                .service(web::resource("/__version__").route(web::get().to(handlers::version)))
        })
        .bind(format!("{}:{}", host, port))
        .map_err(|e| crate::error::ApiErrorKind::Internal(e.to_string()))?
        .run();

        Ok(server)
    }
}

fn build_cors(settings: &Settings) -> Cors {
    let mut cors = Cors::default();

    if let Some(allowed_methods) = &settings.cors_allowed_methods {
        let mut methods = vec![];
        for method_string in allowed_methods {
            if let Ok(method) = Method::from_bytes(method_string.as_bytes()) {
                methods.push(method);
            }
        }
        cors = cors.allowed_methods(methods);
    }
    if let Some(allowed_headers) = &settings.cors_allowed_headers {
        cors = cors.allowed_headers(allowed_headers);
    }
    if let Some(max_age) = &settings.cors_max_age {
        cors = cors.max_age(*max_age);
    }
    if let Some(ref origin) = settings.cors_allowed_origin {
        if origin == "*" {
            cors = cors.allow_any_origin();
        } else {
            cors = cors.allowed_origin(origin);
        }
    }

    cors
}
