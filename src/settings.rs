//! Process-wide configuration, loaded once at startup.
use std::env::{self, VarError};

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

static PREFIX: &str = "gateway";

/// A single configuration record supplying everything the control plane
/// needs: broker port range, the job-bus shared secret, the container
/// image prefix, per-container resource limits, maintenance cadence and
/// scale-down policy, plus the usual web-server/log/cloud-host knobs.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub port: u16,
    pub host: String,

    pub human_logs: bool,

    pub statsd_host: Option<String>,
    pub statsd_port: u16,

    /// CORS settings
    pub cors_allowed_origin: Option<String>,
    pub cors_max_age: Option<usize>,
    pub cors_allowed_methods: Option<Vec<String>>,
    pub cors_allowed_headers: Option<Vec<String>>,

    /// Sqlite database URL backing the spec store.
    pub database_url: String,
    pub database_pool_max_size: u32,

    /// Shared secret used to MAC inter-instance job-bus messages.
    pub job_bus_secret: String,
    /// Local broadcast (push/pull) port for the job bus.
    pub job_bus_broadcast_port: u16,
    /// Local query (request/reply) port for the job bus.
    pub job_bus_query_port: u16,

    /// Prefix used to derive a spec's image name when unset:
    /// `"<image_prefix>_<api_name>"`.
    pub image_prefix: String,
    /// Memory limit (bytes) applied to worker containers.
    pub mem_limit: i64,
    /// CPU shares (out of 1024) applied to worker containers.
    pub cpu_shares: i64,
    /// Reporting threshold for `ContainersUsed`/`Load` stats.
    pub max_containers: u32,

    /// How often the autoscaler reconciliation loop runs, in seconds.
    pub maintenance_period_secs: u64,
    /// Whether the maintainer may self-terminate the instance when idle.
    pub scale_down_enabled: bool,

    pub sentry_dsn: Option<String>,
}

impl Settings {
    /// Load the settings from the config file if supplied, then the environment.
    pub fn with_env_and_config_file(filename: Option<&str>) -> Result<Self, ConfigError> {
        let mut s = Config::default();

        if let Some(config_filename) = filename {
            s.merge(File::with_name(config_filename))?;
        }

        // This accepts environment variables specified as
        // `GATEWAY_FOO__BAR_VALUE="gorp"` as `foo.bar_value = "gorp"`.
        s.merge(Environment::with_prefix(&PREFIX.to_uppercase()).separator("__"))?;

        match s.try_into::<Self>() {
            Ok(settings) => {
                if matches!(env::var("ACTIX_THREADPOOL"), Err(VarError::NotPresent)) {
                    // Spec-store and job-bus calls block via web::block; grow
                    // the blocking threadpool to accommodate the db pool.
                    env::set_var(
                        "ACTIX_THREADPOOL",
                        (settings.database_pool_max_size as usize)
                            .max(num_cpus::get() * 5)
                            .to_string(),
                    );
                }
                Ok(settings)
            }
            Err(ConfigError::Message(v)) => {
                println!("Bad configuration: {:?}", &v);
                println!("Please set in config file or use environment variable.");
                println!(
                    "For example to set `database_url` use env var `{}_DATABASE_URL`\n",
                    PREFIX.to_uppercase()
                );
                error!("Configuration error: Value undefined {:?}", &v);
                Err(ConfigError::NotFound(v))
            }
            Err(e) => {
                error!("Configuration error: Other: {:?}", &e);
                Err(e)
            }
        }
    }

    #[cfg(debug_assertions)]
    pub fn test_settings() -> Self {
        let mut settings = Self::default();
        settings.port = 8000;
        settings.database_url = "file::memory:".to_string();
        settings.database_pool_max_size = 1;
        settings
    }

    pub fn banner(&self) -> String {
        format!(
            "http://{}:{} (max_containers={}, maintenance every {}s)",
            self.host, self.port, self.max_containers, self.maintenance_period_secs
        )
    }

    /// Default image name for an API spec that doesn't specify one.
    pub fn default_image_name(&self, api_name: &str) -> String {
        format!("{}_{}", self.image_prefix, api_name)
    }
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            port: 8000,
            host: "127.0.0.1".to_string(),
            human_logs: false,
            statsd_host: Some("localhost".to_owned()),
            statsd_port: 8125,
            cors_allowed_origin: None,
            cors_allowed_methods: Some(
                ["DELETE", "GET", "POST", "PUT"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
            ),
            cors_allowed_headers: None,
            cors_max_age: None,
            database_url: "apigateway.db".to_string(),
            database_pool_max_size: 10,
            job_bus_secret: "insecure-default-change-me".to_string(),
            job_bus_broadcast_port: 7100,
            job_bus_query_port: 7101,
            image_prefix: "gateway".to_string(),
            mem_limit: 512 * 1024 * 1024,
            cpu_shares: 1024,
            max_containers: 100,
            maintenance_period_secs: 5 * 60,
            scale_down_enabled: true,
            sentry_dsn: None,
        }
    }
}
