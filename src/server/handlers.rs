//! HTTP + management surface handlers, grounded on the teacher's
//! `web/handlers.rs` shape (one function per route, `ServerState` pulled
//! in via `web::Data`, JSON in/out).
use std::collections::HashMap;

use actix_web::{web::Data, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::connector::ConnectorError;
use crate::error::{ApiError, ApiErrorKind};
use crate::server::ServerState;
use crate::spec_store::ApiSpec;

/// `{code, data}` envelope used by the management surface: `0` ok, `1`
/// not-found-but-valid, `-1` error.
#[derive(Serialize)]
struct ManagementResponse {
    code: i32,
    data: Value,
}

impl ManagementResponse {
    fn ok(data: Value) -> HttpResponse {
        HttpResponse::Ok().json(Self { code: 0, data })
    }

    fn not_found() -> HttpResponse {
        HttpResponse::Ok().json(Self {
            code: 1,
            data: Value::String(String::new()),
        })
    }

    fn error(message: impl Into<String>) -> HttpResponse {
        HttpResponse::Ok().json(Self {
            code: -1,
            data: Value::String(message.into()),
        })
    }
}

/// `GET /api/<api_name>/<cmd>[/<arg>...]?<vkey>=<vval>&...`
///
/// Fewer than two path components after `/api/`, or a root other than
/// `api`, is a 404 -- no connector is leased and the queue is never
/// consulted, matching S6.
pub async fn api_dispatch(req: HttpRequest, state: Data<ServerState>) -> Result<HttpResponse, ApiError> {
    let mut segments = req.path().trim_start_matches('/').split('/');
    if segments.next() != Some("api") {
        return Ok(HttpResponse::NotFound().finish());
    }

    let api_name = segments.next().filter(|s| !s.is_empty());
    let cmd = segments.next().filter(|s| !s.is_empty());
    let (api_name, cmd) = match (api_name, cmd) {
        (Some(api_name), Some(cmd)) => (api_name, cmd),
        _ => return Ok(HttpResponse::NotFound().finish()),
    };

    let args: Vec<String> = segments
        .filter(|segment| !segment.is_empty())
        .map(str::to_owned)
        .collect();
    let vargs = parse_vargs(req.query_string());

    match state
        .connectors
        .send_recv(
            api_name,
            cmd,
            args,
            vargs,
            state.spec_store.as_ref(),
            None,
        )
        .await
    {
        Ok(body) => Ok(HttpResponse::Ok().body(body)),
        Err(ConnectorError::Timeout(_)) => Ok(HttpResponse::RequestTimeout().finish()),
        Err(e) => Err(e.into()),
    }
}

/// Groups repeated query keys into `vargs`, e.g. `?x=1&x=2` becomes
/// `{"x": ["1", "2"]}`, matching the original's `cgi.parse_qs` behavior.
fn parse_vargs(query_string: &str) -> HashMap<String, Vec<String>> {
    let mut vargs: HashMap<String, Vec<String>> = HashMap::new();
    for (key, value) in url::form_urlencoded::parse(query_string.as_bytes()) {
        vargs.entry(key.into_owned()).or_default().push(value.into_owned());
    }
    vargs
}

#[derive(Deserialize)]
pub struct ManagementQuery {
    mode: String,
    params: Option<String>,
}

#[derive(Deserialize, Default)]
struct InfoParams {
    api_name: Option<String>,
    publisher: Option<String>,
}

#[derive(Deserialize)]
struct CreateParams {
    api_name: String,
    cmd: String,
    endpt_in: i32,
    endpt_out: i32,
    methods: Vec<String>,
    publisher: String,
    image_name: Option<String>,
    timeout_secs: Option<i32>,
}

/// `GET/POST /api_management?mode=info|create&params=<json>`.
///
/// Caller authentication for `mode=create` is performed upstream by the
/// HTTP front-end this crate treats as an out-of-scope collaborator
/// (spec.md Non-goals); this handler only validates the mandatory
/// fields and the spec-store write.
pub async fn api_management(
    req: HttpRequest,
    state: Data<ServerState>,
) -> Result<HttpResponse, ApiError> {
    let query: actix_web::web::Query<ManagementQuery> =
        actix_web::web::Query::from_query(req.query_string())
            .map_err(|e| ApiErrorKind::Validation(e.to_string()))?;

    match query.mode.as_str() {
        "info" => management_info(&query, state).await,
        "create" => management_create(&query, state).await,
        other => Ok(ManagementResponse::error(format!(
            "unknown mode {:?}",
            other
        ))),
    }
}

async fn management_info(
    query: &ManagementQuery,
    state: Data<ServerState>,
) -> Result<HttpResponse, ApiError> {
    let params: InfoParams = match &query.params {
        Some(raw) => {
            serde_json::from_str(raw).map_err(|e| ApiErrorKind::Validation(e.to_string()))?
        }
        None => InfoParams::default(),
    };

    if let Some(api_name) = params.api_name {
        return match state.spec_store.get(&api_name).await {
            Ok(spec) => Ok(ManagementResponse::ok(serde_json::json!([spec]))),
            Err(crate::spec_store::SpecStoreError::NotFound(_)) => Ok(ManagementResponse::not_found()),
            Err(e) => Err(e.into()),
        };
    }

    let specs = if let Some(publisher) = params.publisher {
        state.spec_store.list_by_publisher(&publisher).await?
    } else {
        state.spec_store.list_all().await?
    };
    Ok(ManagementResponse::ok(serde_json::to_value(specs).unwrap_or(Value::Null)))
}

async fn management_create(
    query: &ManagementQuery,
    state: Data<ServerState>,
) -> Result<HttpResponse, ApiError> {
    let raw = match &query.params {
        Some(raw) => raw,
        None => return Ok(ManagementResponse::error("missing params")),
    };
    let params: CreateParams = match serde_json::from_str(raw) {
        Ok(p) => p,
        Err(e) => return Ok(ManagementResponse::error(e.to_string())),
    };
    if params.api_name.is_empty() || params.cmd.is_empty() || params.methods.is_empty() {
        return Ok(ManagementResponse::error(
            "api_name, cmd and methods are mandatory",
        ));
    }

    let image_name = params
        .image_name
        .unwrap_or_else(|| format!("{}_{}", state.image_prefix, params.api_name));
    let spec = ApiSpec {
        api_name: params.api_name,
        cmd: params.cmd,
        image_name,
        endpoint_in: params.endpt_in,
        endpoint_out: params.endpt_out,
        timeout_secs: params.timeout_secs.unwrap_or(ApiSpec::DEFAULT_TIMEOUT_SECS),
        methods: params.methods,
        publisher: Some(params.publisher),
        create_time: chrono::Utc::now().timestamp(),
    };

    match state.spec_store.upsert(spec).await {
        Ok(()) => Ok(ManagementResponse::ok(Value::String(String::new()))),
        Err(e) => Ok(ManagementResponse::error(e.to_string())),
    }
}

/// `GET /__heartbeat__`: reports spec-store connectivity and job-bus
/// liveness. Unlike `/__lbheartbeat__`, this one actually touches its
/// backends.
pub async fn heartbeat(state: Data<ServerState>) -> HttpResponse {
    let mut checklist: HashMap<&str, Value> = HashMap::new();
    checklist.insert("version", Value::String(env!("CARGO_PKG_VERSION").to_owned()));

    let spec_store_ok = state.spec_store.list_all().await.is_ok();
    checklist.insert(
        "spec_store",
        Value::String(if spec_store_ok { "Ok".to_owned() } else { "Err".to_owned() }),
    );

    let job_bus_ok = state
        .job_bus
        .sendrecv(
            "127.0.0.1",
            crate::jobbus::Opcode::IsTerminating,
            Value::Null,
        )
        .await
        .is_ok();
    checklist.insert(
        "job_bus",
        Value::String(if job_bus_ok { "Ok".to_owned() } else { "Err".to_owned() }),
    );

    let status = if spec_store_ok { "Ok" } else { "Err" };
    checklist.insert("status", Value::String(status.to_owned()));

    if spec_store_ok {
        HttpResponse::Ok().json(checklist)
    } else {
        HttpResponse::ServiceUnavailable().json(checklist)
    }
}

/// `GET /__lbheartbeat__`: process-alive only, no backend checks -- for
/// load-balancer health probes that should not cascade-fail on a
/// backend hiccup.
pub async fn lbheartbeat() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({}))
}

/// `GET /__version__`: embeds build metadata.
pub async fn version() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cloud::LocalCloudHost;
    use crate::connector::ConnectorPool;
    use crate::jobbus::JobBus;
    use crate::queue::QueueRegistry;
    use crate::registry::{mock::MockDriver, ContainerRegistry};
    use crate::server::metrics::Metrics;
    use crate::spec_store::MockSpecStore;
    use actix_web::{test, web, App};
    use std::sync::Arc;

    fn state() -> ServerState {
        let queues = Arc::new(QueueRegistry::new());
        ServerState {
            spec_store: Arc::new(MockSpecStore::default()),
            connectors: Arc::new(ConnectorPool::new(Arc::clone(&queues))),
            queues,
            registry: Arc::new(ContainerRegistry::new()),
            driver: Arc::new(MockDriver::new()),
            cloud: Arc::new(LocalCloudHost::new(Metrics::noop().client.unwrap())),
            job_bus: Arc::new(JobBus::new("s".to_owned(), 0, 0)),
            metrics: Metrics::noop().client.unwrap(),
            image_prefix: "gw".to_owned(),
            mem_limit: 1024,
            cpu_shares: 1024,
        }
    }

    #[actix_web::test]
    async fn test_malformed_uri_is_404() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state()))
                .service(web::resource("/api/{tail:.*}").route(web::get().to(api_dispatch))),
        )
        .await;
        let req = test::TestRequest::get().uri("/api/").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 404);
    }

    #[actix_web::test]
    async fn test_management_info_unknown_api_returns_not_found_code() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state()))
                .service(
                    web::resource("/api_management").route(web::get().to(api_management)),
                ),
        )
        .await;
        let req = test::TestRequest::get()
            .uri("/api_management?mode=info&params=%7B%22api_name%22%3A%22missing%22%7D")
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["code"], 1);
    }

    #[actix_web::test]
    async fn test_management_create_missing_fields_is_validation_error() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state()))
                .service(
                    web::resource("/api_management").route(web::post().to(api_management)),
                ),
        )
        .await;
        let req = test::TestRequest::post()
            .uri("/api_management?mode=create&params=%7B%7D")
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["code"], -1);
    }
}
